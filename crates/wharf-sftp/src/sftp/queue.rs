// ── Operation queue ──────────────────────────────────────────────────────────
//
// Metadata operations (list, stat, mkdir, rename, delete) are funneled
// through one worker per connection running exclusively against the
// primary session: two concurrent reads on one SFTP channel are
// undefined. The data plane deliberately bypasses this queue via
// borrowed sessions so browsing never waits behind a bulk transfer.

use crate::sftp::dir_ops;
use crate::sftp::error::{SftpError, SftpResult};
use crate::sftp::history::History;
use crate::sftp::session::{RemoteDirEntry, RemoteStat, SessionPool};
use crate::sftp::types::SftpDirEntry;
use log::{debug, warn};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokio::sync::oneshot;

// ── Queue entry model ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    Low,
    Normal,
    High,
}

/// Closed set of operations the queue can execute. Each variant carries
/// exactly the fields it needs; there is no free-form work closure.
#[derive(Debug, Clone)]
pub enum QueueOp {
    List { path: String, include_hidden: bool },
    ReadDir { path: String },
    Stat { path: String },
    Mkdir { path: String },
    Rename { from: String, to: String },
    Remove { path: String },
    ReadFile { path: String, max_bytes: u64 },
}

impl QueueOp {
    pub fn kind(&self) -> &'static str {
        match self {
            QueueOp::List { .. } => "list",
            QueueOp::ReadDir { .. } => "readdir",
            QueueOp::Stat { .. } => "stat",
            QueueOp::Mkdir { .. } => "mkdir",
            QueueOp::Rename { .. } => "rename",
            QueueOp::Remove { .. } => "delete",
            QueueOp::ReadFile { .. } => "read-file",
        }
    }

    pub fn path(&self) -> &str {
        match self {
            QueueOp::List { path, .. }
            | QueueOp::ReadDir { path }
            | QueueOp::Stat { path }
            | QueueOp::Mkdir { path }
            | QueueOp::Remove { path }
            | QueueOp::ReadFile { path, .. } => path,
            QueueOp::Rename { from, .. } => from,
        }
    }

    fn merge_key(&self) -> (&'static str, &str) {
        (self.kind(), self.path())
    }

    /// Operations that change remote state and belong in the history.
    fn mutates(&self) -> bool {
        matches!(
            self,
            QueueOp::Mkdir { .. } | QueueOp::Rename { .. } | QueueOp::Remove { .. }
        )
    }
}

/// Closed result set, cloned to every merged waiter.
#[derive(Debug, Clone)]
pub enum OpOutput {
    Listing(Vec<SftpDirEntry>),
    Entries(Vec<RemoteDirEntry>),
    Stat(RemoteStat),
    FileContent(Vec<u8>),
    Done,
}

impl OpOutput {
    pub fn into_listing(self) -> Vec<SftpDirEntry> {
        match self {
            OpOutput::Listing(entries) => entries,
            _ => Vec::new(),
        }
    }

    pub fn into_stat(self) -> Option<RemoteStat> {
        match self {
            OpOutput::Stat(stat) => Some(stat),
            _ => None,
        }
    }

    pub fn into_entries(self) -> Vec<RemoteDirEntry> {
        match self {
            OpOutput::Entries(entries) => entries,
            _ => Vec::new(),
        }
    }
}

struct PendingEntry {
    seq: u64,
    priority: Priority,
    mergeable: bool,
    op: QueueOp,
    waiters: Vec<oneshot::Sender<SftpResult<OpOutput>>>,
}

#[derive(Default)]
struct ConnState {
    pending: Vec<PendingEntry>,
    next_seq: u64,
    worker_running: bool,
}

/// Pick the index of the next entry: highest priority band first,
/// arrival order within a band.
fn next_entry_index(pending: &[PendingEntry]) -> Option<usize> {
    pending
        .iter()
        .enumerate()
        .min_by_key(|(_, e)| (std::cmp::Reverse(e.priority), e.seq))
        .map(|(idx, _)| idx)
}

// ── Queue ────────────────────────────────────────────────────────────────────

struct QueueShared {
    pool: Arc<SessionPool>,
    history: Arc<History>,
    preview_max_bytes: u64,
    state: StdMutex<HashMap<String, ConnState>>,
}

pub struct OperationQueue {
    shared: Arc<QueueShared>,
}

impl OperationQueue {
    pub fn new(pool: Arc<SessionPool>, history: Arc<History>, preview_max_bytes: u64) -> Self {
        Self {
            shared: Arc::new(QueueShared {
                pool,
                history,
                preview_max_bytes,
                state: StdMutex::new(HashMap::new()),
            }),
        }
    }

    /// Schedule `op` against the connection's primary session and await
    /// its result. A mergeable entry joins an identical `(kind, path)`
    /// entry that is still pending; only one executes.
    pub async fn enqueue(
        &self,
        connection_id: &str,
        op: QueueOp,
        priority: Priority,
        mergeable: bool,
    ) -> SftpResult<OpOutput> {
        let (tx, rx) = oneshot::channel();

        let spawn_worker = {
            let mut state = self.shared.state.lock().expect("queue state lock");
            let conn = state.entry(connection_id.to_string()).or_default();

            let mut waiter = Some(tx);
            if mergeable {
                if let Some(existing) = conn
                    .pending
                    .iter_mut()
                    .find(|e| e.mergeable && e.op.merge_key() == op.merge_key())
                {
                    debug!(
                        "op queue: merged {} '{}' for '{}'",
                        op.kind(),
                        op.path(),
                        connection_id
                    );
                    existing.waiters.push(waiter.take().expect("fresh waiter"));
                }
            }
            if let Some(tx) = waiter {
                let seq = conn.next_seq;
                conn.next_seq += 1;
                conn.pending.push(PendingEntry {
                    seq,
                    priority,
                    mergeable,
                    op,
                    waiters: vec![tx],
                });
            }

            let start = !conn.worker_running;
            if start {
                conn.worker_running = true;
            }
            start
        };

        if spawn_worker {
            self.spawn_worker(connection_id);
        }

        rx.await
            .map_err(|_| SftpError::cancelled("operation queue shut down"))?
    }

    fn spawn_worker(&self, connection_id: &str) {
        let shared = self.shared.clone();
        let connection_id = connection_id.to_string();
        tokio::spawn(async move {
            run_worker(shared, connection_id).await;
        });
    }

    /// Reject every not-yet-started entry for the connection. Entries
    /// already executing finish naturally.
    pub fn clear_pending(&self, connection_id: &str, reason: &str) {
        let drained = {
            let mut state = self.shared.state.lock().expect("queue state lock");
            state
                .get_mut(connection_id)
                .map(|conn| std::mem::take(&mut conn.pending))
                .unwrap_or_default()
        };
        if drained.is_empty() {
            return;
        }
        debug!(
            "op queue: cleared {} pending entries for '{}' ({})",
            drained.len(),
            connection_id,
            reason
        );
        for entry in drained {
            for waiter in entry.waiters {
                let _ = waiter.send(Err(SftpError::cancelled(reason.to_string())
                    .with_connection(connection_id)
                    .with_path(entry.op.path())));
            }
        }
    }

    pub fn pending_count(&self, connection_id: &str) -> usize {
        self.shared
            .state
            .lock()
            .expect("queue state lock")
            .get(connection_id)
            .map(|c| c.pending.len())
            .unwrap_or(0)
    }
}

async fn run_worker(shared: Arc<QueueShared>, connection_id: String) {
    loop {
        let entry = {
            let mut state = shared.state.lock().expect("queue state lock");
            let Some(conn) = state.get_mut(&connection_id) else {
                return;
            };
            match next_entry_index(&conn.pending) {
                Some(idx) => conn.pending.remove(idx),
                None => {
                    conn.worker_running = false;
                    return;
                }
            }
        };

        let result = run_entry(&shared, &connection_id, &entry.op).await;

        if entry.op.mutates() && result.is_ok() {
            shared.history.record(entry.op.kind(), entry.op.path());
        }
        if let Err(e) = &result {
            if !e.is_cancelled() {
                warn!(
                    "op queue: {} '{}' failed for '{}': {}",
                    entry.op.kind(),
                    entry.op.path(),
                    connection_id,
                    e
                );
            }
        }

        for waiter in entry.waiters {
            let _ = waiter.send(result.clone());
        }
    }
}

/// Execute one entry against the primary session. A classified transport
/// fault triggers one transparent primary re-establishment and a single
/// re-issue before the error is surfaced to the caller.
async fn run_entry(
    shared: &Arc<QueueShared>,
    connection_id: &str,
    op: &QueueOp,
) -> SftpResult<OpOutput> {
    let primary = shared.pool.acquire_primary(connection_id).await?;
    match execute_on(primary, op.clone(), shared.preview_max_bytes).await {
        Err(e) if e.is_fault() => {
            let recovered = shared.pool.recover_primary(connection_id).await?;
            execute_on(recovered, op.clone(), shared.preview_max_bytes).await
        }
        other => other,
    }
}

async fn execute_on(
    handle: Arc<crate::sftp::session::SessionHandle>,
    op: QueueOp,
    preview_max_bytes: u64,
) -> SftpResult<OpOutput> {
    let result = tokio::task::spawn_blocking(move || {
        dir_ops::execute_op(handle.session(), &op, preview_max_bytes)
    })
    .await
    .map_err(|e| SftpError::protocol(format!("queue task failed: {}", e)))?;
    result
}
