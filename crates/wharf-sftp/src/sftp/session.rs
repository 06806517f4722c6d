// ── Session traits & pool ────────────────────────────────────────────────────
//
// One *primary* session per connection serves the serialized metadata
// queue; *borrowed* sessions carry the data plane so a multi-gigabyte
// stream never blocks directory browsing. Borrowed sessions come from a
// small idle-reuse list; torn-down sessions are poisoned and discarded.

use crate::sftp::error::{SftpError, SftpResult};
use crate::sftp::types::SftpEntryType;
use log::{debug, info, warn};
use std::collections::HashMap;
use std::io::{Read, Write};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::Mutex;
use uuid::Uuid;

// ── Protocol seam ────────────────────────────────────────────────────────────

/// Stat result from the remote side.
#[derive(Debug, Clone)]
pub struct RemoteStat {
    pub size: u64,
    pub entry_type: SftpEntryType,
    pub permissions: u32,
    pub modified: Option<u64>,
}

impl RemoteStat {
    pub fn is_dir(&self) -> bool {
        self.entry_type == SftpEntryType::Directory
    }
}

/// Raw directory entry as returned by the protocol.
#[derive(Debug, Clone)]
pub struct RemoteDirEntry {
    pub name: String,
    pub stat: RemoteStat,
}

/// Synchronous protocol primitives. The production implementation wraps
/// libssh2; tests substitute an in-memory fake. Streaming runs on the
/// blocking thread pool, so every method blocks.
pub trait RemoteSession: Send + Sync {
    fn stat(&self, path: &str) -> SftpResult<RemoteStat>;
    fn readdir(&self, path: &str) -> SftpResult<Vec<RemoteDirEntry>>;
    fn mkdir(&self, path: &str) -> SftpResult<()>;
    fn rename(&self, from: &str, to: &str) -> SftpResult<()>;
    fn remove_file(&self, path: &str) -> SftpResult<()>;
    fn remove_dir(&self, path: &str) -> SftpResult<()>;
    /// Open a remote file for reading, positioned at `offset`.
    fn open_read(&self, path: &str, offset: u64) -> SftpResult<Box<dyn Read + Send>>;
    /// Open a remote file for writing, positioned at `offset`.
    /// `offset == 0` truncates, anything else appends to the landed bytes.
    fn open_write(&self, path: &str, offset: u64) -> SftpResult<Box<dyn Write + Send>>;
    /// Forcibly close the underlying transport. Streams opened from this
    /// session fail on their next operation.
    fn teardown(&self);
}

/// Session factory for one connection ("tab"). Supplied by the embedding
/// shell; the pool calls it for the primary session and for each borrow
/// that cannot be served from the idle list.
pub trait Connector: Send + Sync {
    fn connect(&self) -> SftpResult<Box<dyn RemoteSession>>;
}

// ── Session handle ───────────────────────────────────────────────────────────

/// A live session plus its poison flag. Poisoned handles are never
/// returned to the idle list.
pub struct SessionHandle {
    session: Box<dyn RemoteSession>,
    poisoned: AtomicBool,
}

impl std::fmt::Debug for SessionHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SessionHandle")
            .field("poisoned", &self.is_poisoned())
            .finish_non_exhaustive()
    }
}

impl SessionHandle {
    pub fn new(session: Box<dyn RemoteSession>) -> Arc<Self> {
        Arc::new(Self {
            session,
            poisoned: AtomicBool::new(false),
        })
    }

    pub fn session(&self) -> &dyn RemoteSession {
        self.session.as_ref()
    }

    pub fn is_poisoned(&self) -> bool {
        self.poisoned.load(Ordering::SeqCst)
    }

    /// Mark the session unusable without touching the transport, e.g.
    /// after a classified fault.
    pub fn poison(&self) {
        self.poisoned.store(true, Ordering::SeqCst);
    }

    /// Forced teardown: poison and close the transport.
    pub fn teardown(&self) {
        self.poisoned.store(true, Ordering::SeqCst);
        self.session.teardown();
    }
}

/// Receipt for one borrowed session. Release is keyed on the id and is
/// idempotent.
#[derive(Debug, Clone)]
pub struct SessionLease {
    pub connection_id: String,
    pub id: Uuid,
}

// ── Pool ─────────────────────────────────────────────────────────────────────

struct ConnectionSlot {
    connector: Arc<dyn Connector>,
    primary: Option<Arc<SessionHandle>>,
    idle: Vec<Arc<SessionHandle>>,
    borrowed: HashMap<Uuid, Arc<SessionHandle>>,
}

pub struct SessionPool {
    slots: Mutex<HashMap<String, ConnectionSlot>>,
    idle_cap: usize,
}

impl SessionPool {
    pub fn new(idle_cap: usize) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            idle_cap,
        }
    }

    pub async fn add_connection(&self, connection_id: &str, connector: Arc<dyn Connector>) {
        let mut slots = self.slots.lock().await;
        slots.insert(
            connection_id.to_string(),
            ConnectionSlot {
                connector,
                primary: None,
                idle: Vec::new(),
                borrowed: HashMap::new(),
            },
        );
        info!("session pool: connection '{}' registered", connection_id);
    }

    pub async fn has_connection(&self, connection_id: &str) -> bool {
        self.slots.lock().await.contains_key(connection_id)
    }

    /// Tear down and forget everything owned by a connection.
    pub async fn remove_connection(&self, connection_id: &str) {
        let mut slots = self.slots.lock().await;
        if let Some(slot) = slots.remove(connection_id) {
            if let Some(primary) = slot.primary {
                primary.teardown();
            }
            for handle in slot.idle {
                handle.teardown();
            }
            for handle in slot.borrowed.into_values() {
                handle.teardown();
            }
            info!("session pool: connection '{}' removed", connection_id);
        }
    }

    /// The long-lived session used by the operation queue, (re)established
    /// when absent or poisoned. Establishment failure is fatal to the
    /// caller's operation.
    pub async fn acquire_primary(&self, connection_id: &str) -> SftpResult<Arc<SessionHandle>> {
        let mut slots = self.slots.lock().await;
        let slot = slots
            .get_mut(connection_id)
            .ok_or_else(|| SftpError::session_not_found(connection_id))?;

        if let Some(primary) = &slot.primary {
            if !primary.is_poisoned() {
                return Ok(primary.clone());
            }
            debug!("session pool: primary for '{}' is poisoned", connection_id);
        }

        let connector = slot.connector.clone();
        let session = tokio::task::spawn_blocking(move || connector.connect())
            .await
            .map_err(|e| SftpError::connection_failed(format!("connect task failed: {}", e)))??;
        let handle = SessionHandle::new(session);
        slot.primary = Some(handle.clone());
        info!("session pool: primary established for '{}'", connection_id);
        Ok(handle)
    }

    /// Discard the current primary and establish a fresh one. Called once
    /// after a classified transport fault; callers re-issue the failed
    /// operation themselves.
    pub async fn recover_primary(&self, connection_id: &str) -> SftpResult<Arc<SessionHandle>> {
        {
            let mut slots = self.slots.lock().await;
            if let Some(slot) = slots.get_mut(connection_id) {
                if let Some(primary) = slot.primary.take() {
                    primary.teardown();
                }
            }
        }
        warn!("session pool: recovering primary for '{}'", connection_id);
        self.acquire_primary(connection_id).await
    }

    /// Check out a session for one file's exclusive use. Reuses an idle
    /// session when one is available, otherwise opens a fresh channel.
    pub async fn borrow(
        &self,
        connection_id: &str,
    ) -> SftpResult<(Arc<SessionHandle>, SessionLease)> {
        let reusable = {
            let mut slots = self.slots.lock().await;
            let slot = slots
                .get_mut(connection_id)
                .ok_or_else(|| SftpError::session_not_found(connection_id))?;
            loop {
                match slot.idle.pop() {
                    Some(handle) if handle.is_poisoned() => continue,
                    other => break other,
                }
            }
        };

        let handle = match reusable {
            Some(handle) => handle,
            None => {
                let connector = {
                    let slots = self.slots.lock().await;
                    slots
                        .get(connection_id)
                        .ok_or_else(|| SftpError::session_not_found(connection_id))?
                        .connector
                        .clone()
                };
                let session = tokio::task::spawn_blocking(move || connector.connect())
                    .await
                    .map_err(|e| {
                        SftpError::connection_failed(format!("connect task failed: {}", e))
                    })??;
                SessionHandle::new(session)
            }
        };

        let lease = SessionLease {
            connection_id: connection_id.to_string(),
            id: Uuid::new_v4(),
        };

        let mut slots = self.slots.lock().await;
        let slot = slots
            .get_mut(connection_id)
            .ok_or_else(|| SftpError::session_not_found(connection_id))?;
        slot.borrowed.insert(lease.id, handle.clone());
        debug!(
            "session pool: borrow {} for '{}' ({} outstanding)",
            lease.id,
            connection_id,
            slot.borrowed.len()
        );
        Ok((handle, lease))
    }

    /// Return a borrowed session. Idempotent: an unknown lease id is a
    /// no-op. Healthy sessions go back to the idle list up to the cap,
    /// poisoned or surplus ones are torn down.
    pub async fn release(&self, lease: &SessionLease) {
        let mut slots = self.slots.lock().await;
        let Some(slot) = slots.get_mut(&lease.connection_id) else {
            return;
        };
        let Some(handle) = slot.borrowed.remove(&lease.id) else {
            return;
        };
        if !handle.is_poisoned() && slot.idle.len() < self.idle_cap {
            slot.idle.push(handle);
        } else {
            handle.teardown();
        }
    }

    /// Number of currently checked-out sessions, for diagnostics.
    pub async fn outstanding(&self, connection_id: &str) -> usize {
        self.slots
            .lock()
            .await
            .get(connection_id)
            .map(|s| s.borrowed.len())
            .unwrap_or(0)
    }
}
