// ── Engine facade ────────────────────────────────────────────────────────────
//
// Owns the session pool, operation queue, transfer registry, history and
// the notification sink; everything the embedding shell calls goes
// through here. `start_*` operations validate, register a transfer and
// return its key immediately; outcomes arrive through the sink.

use crate::sftp::error::{SftpError, SftpResult};
use crate::sftp::history::{History, OperationRecord};
use crate::sftp::progress::ProgressTracker;
use crate::sftp::queue::{OperationQueue, Priority, QueueOp};
use crate::sftp::registry::{TransferHandle, TransferRegistry};
use crate::sftp::session::{Connector, RemoteStat, SessionPool};
use crate::sftp::transfer::{
    display_name, units_from_scan, BatchOutcome, Direction, FileSpec,
};
use crate::sftp::types::{
    EventSink, SftpDirEntry, SyncStatusEvent, TransferKind, TransferSettings, TransferState,
};
use log::{debug, info};
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

pub struct SftpEngine {
    pub(crate) pool: Arc<SessionPool>,
    pub(crate) queue: Arc<OperationQueue>,
    pub(crate) registry: Arc<TransferRegistry>,
    pub(crate) history: Arc<History>,
    pub(crate) sink: Arc<dyn EventSink>,
    pub(crate) settings: TransferSettings,
    key_seq: AtomicU64,
}

impl SftpEngine {
    pub fn new(sink: Arc<dyn EventSink>, settings: TransferSettings) -> Arc<Self> {
        let pool = Arc::new(SessionPool::new(settings.idle_sessions_per_connection));
        let history = Arc::new(History::default());
        let queue = Arc::new(OperationQueue::new(
            pool.clone(),
            history.clone(),
            settings.preview_max_bytes,
        ));
        Arc::new(Self {
            pool,
            queue,
            registry: Arc::new(TransferRegistry::new()),
            history,
            sink,
            settings,
            key_seq: AtomicU64::new(0),
        })
    }

    pub fn with_defaults(sink: Arc<dyn EventSink>) -> Arc<Self> {
        Self::new(sink, TransferSettings::default())
    }

    // ── Connection lifecycle ─────────────────────────────────────────────────

    pub async fn add_connection(&self, connection_id: &str, connector: Arc<dyn Connector>) {
        self.pool.add_connection(connection_id, connector).await;
    }

    /// Disconnect-time teardown: cancel the connection's transfers, drop
    /// its queued operations and destroy its sessions.
    pub async fn remove_connection(self: &Arc<Self>, connection_id: &str) {
        self.cleanup_transfers_for_connection(connection_id).await;
        self.pool.remove_connection(connection_id).await;
    }

    // ── Browsing / metadata (serialized through the queue) ───────────────────

    pub async fn list_directory(
        &self,
        connection_id: &str,
        path: &str,
        include_hidden: bool,
    ) -> SftpResult<Vec<SftpDirEntry>> {
        let op = QueueOp::List {
            path: path.to_string(),
            include_hidden,
        };
        self.queue
            .enqueue(connection_id, op, Priority::Normal, true)
            .await
            .map(|o| o.into_listing())
    }

    pub async fn stat(&self, connection_id: &str, path: &str) -> SftpResult<RemoteStat> {
        let op = QueueOp::Stat {
            path: path.to_string(),
        };
        self.queue
            .enqueue(connection_id, op, Priority::Normal, true)
            .await?
            .into_stat()
            .ok_or_else(|| SftpError::protocol("stat produced no result"))
    }

    pub async fn mkdir(&self, connection_id: &str, path: &str) -> SftpResult<()> {
        let op = QueueOp::Mkdir {
            path: path.to_string(),
        };
        self.queue
            .enqueue(connection_id, op, Priority::Normal, false)
            .await
            .map(|_| ())
    }

    pub async fn rename(&self, connection_id: &str, from: &str, to: &str) -> SftpResult<()> {
        let op = QueueOp::Rename {
            from: from.to_string(),
            to: to.to_string(),
        };
        self.queue
            .enqueue(connection_id, op, Priority::Normal, false)
            .await
            .map(|_| ())
    }

    /// Delete a file, or a directory tree recursively.
    pub async fn delete(&self, connection_id: &str, path: &str) -> SftpResult<()> {
        let op = QueueOp::Remove {
            path: path.to_string(),
        };
        self.queue
            .enqueue(connection_id, op, Priority::Normal, false)
            .await
            .map(|_| ())
    }

    /// Read a small remote file for preview, capped by the settings.
    pub async fn read_file(&self, connection_id: &str, path: &str) -> SftpResult<Vec<u8>> {
        let op = QueueOp::ReadFile {
            path: path.to_string(),
            max_bytes: self.settings.preview_max_bytes,
        };
        match self
            .queue
            .enqueue(connection_id, op, Priority::Normal, true)
            .await?
        {
            crate::sftp::queue::OpOutput::FileContent(content) => Ok(content),
            _ => Err(SftpError::protocol("read produced no content")),
        }
    }

    pub fn history(&self) -> Vec<OperationRecord> {
        self.history.list()
    }

    pub fn clear_history(&self) {
        self.history.clear();
    }

    /// Whether a transfer key is still registered (i.e. in flight).
    pub fn has_transfer(&self, key: &str) -> bool {
        self.registry.get(key).is_some()
    }

    // ── Transfers ────────────────────────────────────────────────────────────

    pub async fn start_download(
        self: &Arc<Self>,
        connection_id: &str,
        remote_path: &str,
        local_path: impl Into<PathBuf>,
    ) -> SftpResult<String> {
        self.ensure_connection(connection_id).await?;
        let key = self.make_key(connection_id, TransferKind::Download);
        let handle = TransferHandle::new(
            &key,
            connection_id,
            TransferKind::Download,
            &parent_of(remote_path),
        );
        self.registry.register(handle.clone());

        let engine = self.clone();
        let remote = remote_path.to_string();
        let local = local_path.into();
        tokio::spawn(async move {
            engine.run_download(handle, remote, local).await;
        });
        Ok(key)
    }

    pub async fn start_upload(
        self: &Arc<Self>,
        connection_id: &str,
        target_dir: &str,
        local_paths: Vec<PathBuf>,
    ) -> SftpResult<String> {
        self.ensure_connection(connection_id).await?;
        if local_paths.is_empty() {
            return Err(SftpError::invalid_target("no files to upload"));
        }
        let kind = if local_paths.len() == 1 {
            TransferKind::Upload
        } else {
            TransferKind::UploadMulti
        };
        let key = self.make_key(connection_id, kind);
        let handle = TransferHandle::new(&key, connection_id, kind, target_dir);
        self.registry.register(handle.clone());

        let engine = self.clone();
        let target = target_dir.to_string();
        tokio::spawn(async move {
            engine.run_upload(handle, target, local_paths).await;
        });
        Ok(key)
    }

    pub async fn start_folder_upload(
        self: &Arc<Self>,
        connection_id: &str,
        local_dir: impl Into<PathBuf>,
        remote_target_dir: &str,
    ) -> SftpResult<String> {
        self.ensure_connection(connection_id).await?;
        let key = self.make_key(connection_id, TransferKind::UploadFolder);
        let handle = TransferHandle::new(
            &key,
            connection_id,
            TransferKind::UploadFolder,
            remote_target_dir,
        );
        self.registry.register(handle.clone());

        let engine = self.clone();
        let local = local_dir.into();
        let target = remote_target_dir.to_string();
        tokio::spawn(async move {
            engine.run_folder_upload(handle, local, target).await;
        });
        Ok(key)
    }

    pub async fn start_folder_download(
        self: &Arc<Self>,
        connection_id: &str,
        remote_dir: &str,
        local_target_dir: impl Into<PathBuf>,
    ) -> SftpResult<String> {
        self.ensure_connection(connection_id).await?;
        let key = self.make_key(connection_id, TransferKind::DownloadFolder);
        let handle = TransferHandle::new(
            &key,
            connection_id,
            TransferKind::DownloadFolder,
            &parent_of(remote_dir),
        );
        self.registry.register(handle.clone());

        let engine = self.clone();
        let remote = remote_dir.to_string();
        let local = local_target_dir.into();
        tokio::spawn(async move {
            engine.run_folder_download(handle, remote, local).await;
        });
        Ok(key)
    }

    /// Cancel a transfer by key, falling back to the connection prefix.
    /// Clears the connection's pending queue entries and, once teardown
    /// has settled, enqueues a high-priority listing refresh of the
    /// transfer's working path so the UI's view converges.
    pub async fn cancel_transfer(self: &Arc<Self>, connection_id: &str, key: &str) -> bool {
        let Some(handle) = self.registry.cancel(connection_id, key) else {
            return false;
        };
        self.queue.clear_pending(connection_id, "transfer cancelled");

        let engine = self.clone();
        let refresh_path = handle.working_path.clone();
        let connection = connection_id.to_string();
        tokio::spawn(async move {
            tokio::time::sleep(engine.settings.refresh_settle_delay).await;
            let op = QueueOp::List {
                path: refresh_path.clone(),
                include_hidden: true,
            };
            match engine
                .queue
                .enqueue(&connection, op, Priority::High, true)
                .await
            {
                Ok(_) => debug!("post-cancel refresh of '{}' done", refresh_path),
                Err(e) => debug!("post-cancel refresh of '{}' failed: {}", refresh_path, e),
            }
        });
        true
    }

    pub async fn cleanup_transfers_for_connection(self: &Arc<Self>, connection_id: &str) {
        self.registry.cleanup_connection(connection_id);
        self.queue
            .clear_pending(connection_id, "connection cleanup");
    }

    // ── Transfer runners ─────────────────────────────────────────────────────

    async fn run_download(self: Arc<Self>, handle: Arc<TransferHandle>, remote: String, local: PathBuf) {
        let tracker = self.tracker_for(&handle);
        let outcome: SftpResult<()> = async {
            handle.set_state(TransferState::Transferring);
            let stat = self.stat(&handle.connection_id, &remote).await?;
            if stat.is_dir() {
                return Err(
                    SftpError::invalid_target(format!("'{}' is a directory", remote))
                        .with_path(remote.clone()),
                );
            }
            let spec = FileSpec {
                id: 0,
                name: display_name(&remote),
                local_path: local.clone(),
                remote_path: remote.clone(),
                size: stat.size,
            };
            tracker.register_file(spec.id, &spec.name, spec.size);
            self.transfer_one(&handle, &tracker, Direction::Download, &spec)
                .await
        }
        .await;

        let summary = match outcome {
            Ok(()) => {
                self.history.record("download", &remote);
                BatchOutcome {
                    successful: 1,
                    failed: Vec::new(),
                }
            }
            Err(e) if e.is_cancelled() => BatchOutcome::default(),
            Err(e) => BatchOutcome {
                successful: 0,
                failed: vec![(remote.clone(), e)],
            },
        };
        self.finish(&handle, &tracker, summary).await;
    }

    async fn run_upload(
        self: Arc<Self>,
        handle: Arc<TransferHandle>,
        target_dir: String,
        local_paths: Vec<PathBuf>,
    ) {
        let tracker = self.tracker_for(&handle);
        handle.set_state(TransferState::Transferring);

        let mut units = Vec::new();
        let mut pre_failed: Vec<(String, SftpError)> = Vec::new();
        for (idx, path) in local_paths.iter().enumerate() {
            let name = path
                .file_name()
                .map(|n| n.to_string_lossy().to_string())
                .unwrap_or_else(|| path.display().to_string());
            match std::fs::metadata(path) {
                Ok(meta) if meta.is_file() => {
                    let spec = FileSpec {
                        id: idx as u64,
                        remote_path: crate::sftp::dir_ops::join_remote(&target_dir, &name),
                        name,
                        local_path: path.clone(),
                        size: meta.len(),
                    };
                    tracker.register_file(spec.id, &spec.name, spec.size);
                    units.push(spec);
                }
                Ok(_) => pre_failed.push((
                    path.display().to_string(),
                    SftpError::invalid_target("not a regular file"),
                )),
                Err(e) => pre_failed.push((
                    path.display().to_string(),
                    SftpError::from(e).with_path(path.display().to_string()),
                )),
            }
        }

        let mut outcome = self
            .run_batch(&handle, &tracker, Direction::Upload, units)
            .await;
        outcome.failed.extend(pre_failed);
        if outcome.successful > 0 {
            self.history.record(handle.kind.as_str(), &target_dir);
        }
        self.finish(&handle, &tracker, outcome).await;
    }

    async fn run_folder_upload(
        self: Arc<Self>,
        handle: Arc<TransferHandle>,
        local_dir: PathBuf,
        remote_target_dir: String,
    ) {
        let tracker = self.tracker_for(&handle);
        handle.set_state(TransferState::Scanning);

        let (dirs, files) = match Self::scan_local_tree(&local_dir) {
            Ok(scan) => scan,
            Err(e) => {
                self.finish(
                    &handle,
                    &tracker,
                    BatchOutcome {
                        successful: 0,
                        failed: vec![(local_dir.display().to_string(), e)],
                    },
                )
                .await;
                return;
            }
        };

        let folder_name = local_dir
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "upload".to_string());
        let base = crate::sftp::dir_ops::join_remote(&remote_target_dir, &folder_name);

        let units = units_from_scan(&files, &local_dir, &base);
        for unit in &units {
            tracker.register_file(unit.id, &unit.name, unit.size);
        }
        info!(
            "transfer {}: folder upload of {} files / {} dirs to '{}'",
            handle.key,
            units.len(),
            dirs.len(),
            base
        );

        let dir_failures = self.create_remote_dirs(&handle, &base, &dirs).await;

        handle.set_state(TransferState::Transferring);
        let mut outcome = self
            .run_batch(&handle, &tracker, Direction::Upload, units)
            .await;
        outcome.failed.extend(dir_failures);
        if outcome.successful > 0 {
            self.history.record("upload-folder", &base);
        }
        self.finish(&handle, &tracker, outcome).await;
    }

    async fn run_folder_download(
        self: Arc<Self>,
        handle: Arc<TransferHandle>,
        remote_dir: String,
        local_target_dir: PathBuf,
    ) {
        let tracker = self.tracker_for(&handle);
        handle.set_state(TransferState::Scanning);

        let scan = self.scan_remote_tree(&handle, &remote_dir).await;
        let (dirs, files) = match scan {
            Ok(scan) => scan,
            Err(e) => {
                let summary = if e.is_cancelled() {
                    BatchOutcome::default()
                } else {
                    BatchOutcome {
                        successful: 0,
                        failed: vec![(remote_dir.clone(), e)],
                    }
                };
                self.finish(&handle, &tracker, summary).await;
                return;
            }
        };

        let folder_name = display_name(remote_dir.trim_end_matches('/'));
        let local_base = local_target_dir.join(&folder_name);

        // Local structure first, shallowest dirs first.
        if let Err(e) = std::fs::create_dir_all(&local_base) {
            self.finish(
                &handle,
                &tracker,
                BatchOutcome {
                    successful: 0,
                    failed: vec![(
                        local_base.display().to_string(),
                        SftpError::from(e).with_path(local_base.display().to_string()),
                    )],
                },
            )
            .await;
            return;
        }
        for dir in &dirs {
            let _ = std::fs::create_dir_all(local_base.join(dir));
        }

        let units: Vec<FileSpec> = files
            .iter()
            .enumerate()
            .map(|(idx, (relative, size))| FileSpec {
                id: idx as u64,
                name: display_name(relative),
                local_path: local_base.join(relative),
                remote_path: format!("{}/{}", remote_dir.trim_end_matches('/'), relative),
                size: *size,
            })
            .collect();
        for unit in &units {
            tracker.register_file(unit.id, &unit.name, unit.size);
        }
        info!(
            "transfer {}: folder download of {} files from '{}'",
            handle.key,
            units.len(),
            remote_dir
        );

        handle.set_state(TransferState::Transferring);
        let outcome = self
            .run_batch(&handle, &tracker, Direction::Download, units)
            .await;
        if outcome.successful > 0 {
            self.history.record("download-folder", &remote_dir);
        }
        self.finish(&handle, &tracker, outcome).await;
    }

    // ── Terminal bookkeeping ─────────────────────────────────────────────────

    async fn finish(
        &self,
        handle: &Arc<TransferHandle>,
        tracker: &Arc<ProgressTracker>,
        outcome: BatchOutcome,
    ) {
        let cancelled = handle.is_cancelled();
        let failed = outcome.failed.len() as u32;
        let successful = outcome.successful;

        let (state, progress, error) = if cancelled {
            let (transferred, total) = tracker.snapshot();
            let pct = if total > 0 {
                (transferred as f64 / total as f64) * 100.0
            } else {
                0.0
            };
            (TransferState::Cancelled, pct, None)
        } else if failed > 0 && successful == 0 {
            let (transferred, total) = tracker.snapshot();
            let pct = if total > 0 {
                (transferred as f64 / total as f64) * 100.0
            } else {
                0.0
            };
            let message = outcome
                .failed
                .first()
                .map(|(path, e)| format!("{}: {}", path, e.message))
                .unwrap_or_default();
            (TransferState::Failed, pct, Some(message))
        } else {
            tracker.finalize();
            let error = outcome
                .failed
                .first()
                .map(|(path, e)| format!("{} file(s) failed; first: {}: {}", failed, path, e.message));
            (TransferState::Completed, 100.0, error)
        };

        handle.set_state(state);
        self.registry.remove(&handle.key);

        self.sink.emit_sync_status(SyncStatusEvent {
            transfer_key: handle.key.clone(),
            progress: (progress * 100.0).round() / 100.0,
            operation_complete: true,
            successful_files: successful,
            failed_files: failed,
            cancelled,
            error,
        });
        info!(
            "transfer {} finished: {:?} ({} ok / {} failed{})",
            handle.key,
            state,
            successful,
            failed,
            if cancelled { ", cancelled" } else { "" }
        );
    }

    // ── Helpers ──────────────────────────────────────────────────────────────

    fn tracker_for(&self, handle: &Arc<TransferHandle>) -> Arc<ProgressTracker> {
        Arc::new(ProgressTracker::new(
            self.sink.clone(),
            &handle.key,
            self.settings.progress.clone(),
        ))
    }

    async fn ensure_connection(&self, connection_id: &str) -> SftpResult<()> {
        if self.pool.has_connection(connection_id).await {
            Ok(())
        } else {
            Err(SftpError::session_not_found(connection_id))
        }
    }

    fn make_key(&self, connection_id: &str, kind: TransferKind) -> String {
        let seq = self.key_seq.fetch_add(1, Ordering::SeqCst);
        format!(
            "{}:{}:{}-{}",
            connection_id,
            kind.as_str(),
            chrono::Utc::now().timestamp_millis(),
            seq
        )
    }
}

fn parent_of(path: &str) -> String {
    let trimmed = path.trim_end_matches('/');
    match trimmed.rfind('/') {
        Some(0) => "/".to_string(),
        Some(idx) => trimmed[..idx].to_string(),
        None => "/".to_string(),
    }
}
