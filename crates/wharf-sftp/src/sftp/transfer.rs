// ── Transfer orchestrator ────────────────────────────────────────────────────
//
// Drives the four transfer kinds end-to-end: borrowed-session streaming
// with a per-file watchdog, resume-from-landed-offset retries with
// exponential backoff, adaptive batch concurrency, and partial-batch
// bookkeeping. Downloads land in `<name>.part` and are renamed into
// place only on full success; uploads write the final remote path
// directly so listings show the file while it arrives.

use crate::sftp::engine::SftpEngine;
use crate::sftp::error::{SftpError, SftpResult};
use crate::sftp::progress::ProgressTracker;
use crate::sftp::queue::{OpOutput, Priority, QueueOp};
use crate::sftp::registry::TransferHandle;
use crate::sftp::types::PART_SUFFIX;
use log::{debug, warn};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tokio::sync::Semaphore;
use tokio_util::sync::CancellationToken;

// ── File units ───────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Direction {
    Upload,
    Download,
}

/// One concrete file inside a transfer.
#[derive(Debug, Clone)]
pub(crate) struct FileSpec {
    pub id: u64,
    pub name: String,
    pub local_path: PathBuf,
    pub remote_path: String,
    pub size: u64,
}

/// Result of a batch run. Cancelled files count as neither success nor
/// failure; the batch-level `cancelled` flag covers them.
#[derive(Debug, Default)]
pub(crate) struct BatchOutcome {
    pub successful: u32,
    pub failed: Vec<(String, SftpError)>,
}

pub(crate) fn part_path(path: &Path) -> PathBuf {
    PathBuf::from(format!("{}{}", path.display(), PART_SUFFIX))
}

fn file_name_of(path: &str) -> String {
    path.rsplit('/').next().unwrap_or(path).to_string()
}

// ── Orchestration ────────────────────────────────────────────────────────────

impl SftpEngine {
    /// Stream one file, with `.part` handling for downloads. On success
    /// the unit's progress is completed; on terminal failure a download's
    /// partial file is removed.
    pub(crate) async fn transfer_one(
        self: &Arc<Self>,
        handle: &Arc<TransferHandle>,
        tracker: &Arc<ProgressTracker>,
        direction: Direction,
        spec: &FileSpec,
    ) -> SftpResult<()> {
        let result = match direction {
            Direction::Upload => {
                self.transfer_with_retry(handle, tracker, direction, spec).await
            }
            Direction::Download => {
                let staged = FileSpec {
                    local_path: part_path(&spec.local_path),
                    ..spec.clone()
                };
                let result = self
                    .transfer_with_retry(handle, tracker, direction, &staged)
                    .await;
                match result {
                    Ok(()) => std::fs::rename(&staged.local_path, &spec.local_path)
                        .map_err(|e| SftpError::from(e).with_path(spec.local_path.display().to_string())),
                    Err(e) => {
                        let _ = std::fs::remove_file(&staged.local_path);
                        Err(e)
                    }
                }
            }
        };
        if result.is_ok() {
            tracker.complete_file(spec.id);
        }
        result
    }

    /// Retry loop: up to `max_attempts` tries per file. Retries resume
    /// from the landed byte count and back off exponentially; anything
    /// that is not a classified transport fault fails immediately.
    async fn transfer_with_retry(
        self: &Arc<Self>,
        handle: &Arc<TransferHandle>,
        tracker: &Arc<ProgressTracker>,
        direction: Direction,
        spec: &FileSpec,
    ) -> SftpResult<()> {
        let mut attempt = 1u32;
        loop {
            if handle.is_cancelled() {
                return Err(SftpError::cancelled("transfer cancelled"));
            }

            let offset = if attempt == 1 {
                0
            } else {
                self.landed_offset(handle, direction, spec).await
            };

            match self
                .stream_file(handle, tracker, direction, spec, offset)
                .await
            {
                Ok(()) => return Ok(()),
                Err(e) if e.is_cancelled() => return Err(e),
                Err(e) if e.is_fault() && attempt < self.settings.max_attempts => {
                    warn!(
                        "transfer {}: '{}' attempt {}/{} failed ({}), retrying",
                        handle.key, spec.name, attempt, self.settings.max_attempts, e
                    );
                    let delay = self.settings.backoff_delay(attempt);
                    tokio::select! {
                        _ = handle.cancel.cancelled() => {
                            return Err(SftpError::cancelled("transfer cancelled"));
                        }
                        _ = tokio::time::sleep(delay) => {}
                    }
                    attempt += 1;
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// How many bytes already landed at the destination, clamped to the
    /// declared size. Any inconsistency falls back to a full restart.
    async fn landed_offset(
        self: &Arc<Self>,
        handle: &Arc<TransferHandle>,
        direction: Direction,
        spec: &FileSpec,
    ) -> u64 {
        let landed = match direction {
            Direction::Download => std::fs::metadata(&spec.local_path)
                .map(|m| m.len())
                .unwrap_or(0),
            Direction::Upload => {
                let op = QueueOp::Stat {
                    path: spec.remote_path.clone(),
                };
                match self
                    .queue
                    .enqueue(&handle.connection_id, op, Priority::Normal, false)
                    .await
                {
                    Ok(OpOutput::Stat(stat)) => stat.size,
                    _ => 0,
                }
            }
        };
        if landed > spec.size {
            0
        } else {
            landed
        }
    }

    /// One streaming attempt on a borrowed session, guarded by the
    /// no-progress watchdog.
    async fn stream_file(
        self: &Arc<Self>,
        handle: &Arc<TransferHandle>,
        tracker: &Arc<ProgressTracker>,
        direction: Direction,
        spec: &FileSpec,
        offset: u64,
    ) -> SftpResult<()> {
        let (session, lease) = self.pool.borrow(&handle.connection_id).await?;
        handle.track_session(lease.id, session.clone());

        let started = Instant::now();
        let activity = Arc::new(AtomicU64::new(0));
        let stalled = Arc::new(AtomicBool::new(false));
        let token = handle.cancel.clone();

        let watchdog = tokio::spawn(run_watchdog(
            token.clone(),
            session.clone(),
            activity.clone(),
            stalled.clone(),
            self.settings.no_progress_timeout,
            started,
        ));

        let chunk_size = self.settings.chunk_size_for(spec.size);
        let blocking_spec = spec.clone();
        let blocking_session = session.clone();
        let blocking_tracker = tracker.clone();
        let blocking_token = token.clone();
        let blocking_activity = activity.clone();

        let result = tokio::task::spawn_blocking(move || {
            stream_blocking(
                blocking_session.session(),
                direction,
                &blocking_spec,
                offset,
                chunk_size,
                &blocking_token,
                &blocking_activity,
                started,
                &blocking_tracker,
            )
        })
        .await
        .map_err(|e| SftpError::protocol(format!("stream task failed: {}", e)))
        .and_then(|r| r);

        watchdog.abort();
        handle.untrack_session(lease.id);

        let result = match result {
            Err(_) if token.is_cancelled() => Err(SftpError::cancelled("transfer cancelled")),
            Err(e) if stalled.load(Ordering::SeqCst) => Err(SftpError::no_progress(format!(
                "no byte event within {:?} ({})",
                self.settings.no_progress_timeout, e.message
            ))
            .with_path(spec.remote_path.clone())),
            other => other,
        };

        if let Err(e) = &result {
            if e.is_fault() || e.is_cancelled() {
                session.poison();
            }
        }
        self.pool.release(&lease).await;
        result
    }

    // ── Batch scheduling ─────────────────────────────────────────────────────

    /// Run a set of file units through the bounded worker pool. No new
    /// file starts once cancellation is observed.
    pub(crate) async fn run_batch(
        self: &Arc<Self>,
        handle: &Arc<TransferHandle>,
        tracker: &Arc<ProgressTracker>,
        direction: Direction,
        units: Vec<FileSpec>,
    ) -> BatchOutcome {
        let total_bytes: u64 = units.iter().map(|u| u.size).sum();
        let workers = self.settings.worker_pool_size(units.len(), total_bytes);
        debug!(
            "transfer {}: batch of {} files ({} bytes) with {} workers",
            handle.key,
            units.len(),
            total_bytes,
            workers
        );

        let semaphore = Arc::new(Semaphore::new(workers));
        let mut tasks = Vec::with_capacity(units.len());

        for unit in units {
            if handle.is_cancelled() {
                break;
            }
            let permit = match semaphore.clone().acquire_owned().await {
                Ok(p) => p,
                Err(_) => break,
            };
            if handle.is_cancelled() {
                break;
            }

            let engine = self.clone();
            let handle = handle.clone();
            let tracker = tracker.clone();
            tasks.push(tokio::spawn(async move {
                let _permit = permit;
                let result = engine.transfer_one(&handle, &tracker, direction, &unit).await;
                (unit, result)
            }));
        }

        let mut outcome = BatchOutcome::default();
        for task in tasks {
            match task.await {
                Ok((_, Ok(()))) => outcome.successful += 1,
                Ok((unit, Err(e))) => {
                    if !e.is_cancelled() {
                        warn!(
                            "transfer {}: file '{}' failed terminally: {}",
                            handle.key, unit.name, e
                        );
                        outcome.failed.push((unit.remote_path.clone(), e));
                    }
                }
                Err(e) => {
                    outcome
                        .failed
                        .push((String::new(), SftpError::protocol(format!("file task died: {}", e))));
                }
            }
        }
        outcome
    }

    // ── Tree scanning & directory pre-creation ───────────────────────────────

    /// Walk a local tree into relative directories (sorted shallowest
    /// first) and file units. Unreadable entries are skipped.
    pub(crate) fn scan_local_tree(root: &Path) -> SftpResult<(Vec<String>, Vec<(String, u64)>)> {
        if !root.is_dir() {
            return Err(SftpError::not_a_directory(format!(
                "'{}' is not a directory",
                root.display()
            )));
        }

        let mut dirs: Vec<String> = Vec::new();
        let mut files: Vec<(String, u64)> = Vec::new();

        for entry in walkdir::WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
            let relative = match entry.path().strip_prefix(root) {
                Ok(r) if !r.as_os_str().is_empty() => r,
                _ => continue,
            };
            let relative = relative.to_string_lossy().replace('\\', "/");
            if entry.file_type().is_dir() {
                dirs.push(relative);
            } else if entry.file_type().is_file() {
                let size = entry.metadata().map(|m| m.len()).unwrap_or(0);
                files.push((relative, size));
            }
        }

        dirs.sort_by_key(|d| d.matches('/').count());
        Ok((dirs, files))
    }

    /// Walk a remote tree through the queue at `Low` priority so bulk
    /// scans never delay interactive browsing. Returns relative
    /// directories (shallowest first) and `(relative_path, size)` units.
    pub(crate) async fn scan_remote_tree(
        self: &Arc<Self>,
        handle: &Arc<TransferHandle>,
        root: &str,
    ) -> SftpResult<(Vec<String>, Vec<(String, u64)>)> {
        let mut dirs: Vec<String> = Vec::new();
        let mut files: Vec<(String, u64)> = Vec::new();
        let mut pending: Vec<String> = vec![String::new()];

        while let Some(relative) = pending.pop() {
            if handle.is_cancelled() {
                return Err(SftpError::cancelled("transfer cancelled"));
            }
            let remote = if relative.is_empty() {
                root.to_string()
            } else {
                format!("{}/{}", root.trim_end_matches('/'), relative)
            };
            let op = QueueOp::ReadDir { path: remote };
            let entries = self
                .queue
                .enqueue(&handle.connection_id, op, Priority::Low, true)
                .await?
                .into_entries();

            for entry in entries {
                let child = if relative.is_empty() {
                    entry.name.clone()
                } else {
                    format!("{}/{}", relative, entry.name)
                };
                if entry.stat.is_dir() {
                    dirs.push(child.clone());
                    pending.push(child);
                } else {
                    files.push((child, entry.stat.size));
                }
            }
        }

        dirs.sort_by_key(|d| d.matches('/').count());
        Ok((dirs, files))
    }

    /// Create the remote directory structure level by level, shallowest
    /// first, so each level's entries cannot race on a missing parent.
    /// Existing directories are success; other failures are collected.
    pub(crate) async fn create_remote_dirs(
        self: &Arc<Self>,
        handle: &Arc<TransferHandle>,
        base: &str,
        relative_dirs: &[String],
    ) -> Vec<(String, SftpError)> {
        let mut failures = Vec::new();

        let base_op = QueueOp::Mkdir {
            path: base.to_string(),
        };
        if let Err(e) = self
            .queue
            .enqueue(&handle.connection_id, base_op, Priority::Normal, true)
            .await
        {
            failures.push((base.to_string(), e));
            return failures;
        }

        let mut level_start = 0;
        while level_start < relative_dirs.len() {
            if handle.is_cancelled() {
                break;
            }
            let depth = relative_dirs[level_start].matches('/').count();
            let level_end = relative_dirs[level_start..]
                .iter()
                .position(|d| d.matches('/').count() != depth)
                .map(|p| level_start + p)
                .unwrap_or(relative_dirs.len());

            let mut level_tasks = Vec::new();
            for relative in &relative_dirs[level_start..level_end] {
                let path = format!("{}/{}", base.trim_end_matches('/'), relative);
                let queue = self.queue.clone();
                let connection_id = handle.connection_id.clone();
                level_tasks.push((
                    path.clone(),
                    tokio::spawn(async move {
                        queue
                            .enqueue(
                                &connection_id,
                                QueueOp::Mkdir { path },
                                Priority::Normal,
                                true,
                            )
                            .await
                    }),
                ));
            }
            for (path, task) in level_tasks {
                match task.await {
                    Ok(Ok(_)) => {}
                    Ok(Err(e)) => {
                        warn!("transfer {}: mkdir '{}' failed: {}", handle.key, path, e);
                        failures.push((path, e));
                    }
                    Err(e) => {
                        failures.push((path, SftpError::protocol(format!("mkdir task died: {}", e))));
                    }
                }
            }
            level_start = level_end;
        }
        failures
    }
}

// ── Watchdog ─────────────────────────────────────────────────────────────────

/// Armed per file: if no byte event lands within the timeout, both ends
/// of the pipe are destroyed by tearing the session's transport down,
/// which surfaces as a retryable no-progress fault. Cancellation uses
/// the same teardown path for immediacy.
async fn run_watchdog(
    token: CancellationToken,
    session: Arc<crate::sftp::session::SessionHandle>,
    activity: Arc<AtomicU64>,
    stalled: Arc<AtomicBool>,
    timeout: Duration,
    started: Instant,
) {
    let poll = (timeout / 4).max(Duration::from_millis(10));
    loop {
        tokio::select! {
            _ = token.cancelled() => {
                session.teardown();
                return;
            }
            _ = tokio::time::sleep(poll) => {
                let last_ms = activity.load(Ordering::SeqCst);
                let now_ms = started.elapsed().as_millis() as u64;
                if now_ms.saturating_sub(last_ms) > timeout.as_millis() as u64 {
                    stalled.store(true, Ordering::SeqCst);
                    session.teardown();
                    return;
                }
            }
        }
    }
}

// ── Blocking pipe ────────────────────────────────────────────────────────────

#[allow(clippy::too_many_arguments)]
fn stream_blocking(
    session: &dyn crate::sftp::session::RemoteSession,
    direction: Direction,
    spec: &FileSpec,
    offset: u64,
    chunk_size: usize,
    token: &CancellationToken,
    activity: &AtomicU64,
    started: Instant,
    tracker: &ProgressTracker,
) -> SftpResult<()> {
    let (mut src, mut dst): (Box<dyn Read + Send>, Box<dyn Write + Send>) = match direction {
        Direction::Download => {
            let src = session.open_read(&spec.remote_path, offset)?;
            let dst = open_local_write(&spec.local_path, offset)?;
            (src, Box::new(dst))
        }
        Direction::Upload => {
            let src = open_local_read(&spec.local_path, offset)?;
            let dst = session.open_write(&spec.remote_path, offset)?;
            (Box::new(src), dst)
        }
    };

    let transferred = copy_stream(
        src.as_mut(),
        dst.as_mut(),
        chunk_size,
        offset,
        token,
        &mut |total| {
            activity.store(started.elapsed().as_millis() as u64, Ordering::SeqCst);
            tracker.update_file(spec.id, total);
        },
    )?;
    dst.flush().map_err(SftpError::from)?;

    if transferred < spec.size {
        return Err(SftpError::new(
            crate::sftp::error::SftpErrorKind::UnexpectedEof,
            format!(
                "stream ended at {} of {} bytes",
                transferred, spec.size
            ),
        )
        .with_path(spec.remote_path.clone()));
    }
    Ok(())
}

/// Backpressure-respecting pipe: one chunk buffer, sequential
/// read-then-write, cancellation consulted on every chunk. Returns the
/// cumulative byte count including the resume offset.
pub(crate) fn copy_stream(
    src: &mut dyn Read,
    dst: &mut dyn Write,
    chunk_size: usize,
    start_offset: u64,
    token: &CancellationToken,
    on_chunk: &mut dyn FnMut(u64),
) -> SftpResult<u64> {
    let mut buf = vec![0u8; chunk_size.max(1)];
    let mut transferred = start_offset;
    loop {
        if token.is_cancelled() {
            return Err(SftpError::cancelled("transfer cancelled"));
        }
        let n = src.read(&mut buf).map_err(SftpError::from)?;
        if n == 0 {
            return Ok(transferred);
        }
        dst.write_all(&buf[..n]).map_err(SftpError::from)?;
        transferred += n as u64;
        on_chunk(transferred);
    }
}

fn open_local_write(path: &Path, offset: u64) -> SftpResult<std::fs::File> {
    if offset > 0 {
        std::fs::OpenOptions::new()
            .append(true)
            .open(path)
            .map_err(|e| SftpError::from(e).with_path(path.display().to_string()))
    } else {
        if let Some(parent) = path.parent() {
            let _ = std::fs::create_dir_all(parent);
        }
        std::fs::File::create(path)
            .map_err(|e| SftpError::from(e).with_path(path.display().to_string()))
    }
}

fn open_local_read(path: &Path, offset: u64) -> SftpResult<std::fs::File> {
    let mut file = std::fs::File::open(path)
        .map_err(|e| SftpError::from(e).with_path(path.display().to_string()))?;
    if offset > 0 {
        file.seek(SeekFrom::Start(offset))
            .map_err(|e| SftpError::from(e).with_path(path.display().to_string()))?;
    }
    Ok(file)
}

pub(crate) fn units_from_scan(
    files: &[(String, u64)],
    local_base: &Path,
    remote_base: &str,
) -> Vec<FileSpec> {
    files
        .iter()
        .enumerate()
        .map(|(idx, (relative, size))| FileSpec {
            id: idx as u64,
            name: file_name_of(relative),
            local_path: local_base.join(relative),
            remote_path: format!("{}/{}", remote_base.trim_end_matches('/'), relative),
            size: *size,
        })
        .collect()
}

pub(crate) fn display_name(path: &str) -> String {
    file_name_of(path)
}
