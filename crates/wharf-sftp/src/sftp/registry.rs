// ── Transfer registry & cancellation ─────────────────────────────────────────

use crate::sftp::session::SessionHandle;
use crate::sftp::types::{TransferKind, TransferState};
use chrono::{DateTime, Utc};
use log::{debug, info};
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex as StdMutex;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// One in-flight transfer: its cancellation token plus every session
/// currently streaming on its behalf, recorded so cancellation can tear
/// the streams down instead of waiting for them to notice the token.
pub struct TransferHandle {
    pub key: String,
    pub connection_id: String,
    pub kind: TransferKind,
    /// Remote directory the transfer operates in; refreshed after cancel.
    pub working_path: String,
    pub created_at: DateTime<Utc>,
    pub cancel: CancellationToken,
    state: StdMutex<TransferState>,
    active_sessions: StdMutex<HashMap<Uuid, Arc<SessionHandle>>>,
}

impl TransferHandle {
    pub fn new(key: &str, connection_id: &str, kind: TransferKind, working_path: &str) -> Arc<Self> {
        Arc::new(Self {
            key: key.to_string(),
            connection_id: connection_id.to_string(),
            kind,
            working_path: working_path.to_string(),
            created_at: Utc::now(),
            cancel: CancellationToken::new(),
            state: StdMutex::new(TransferState::Queued),
            active_sessions: StdMutex::new(HashMap::new()),
        })
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn state(&self) -> TransferState {
        *self.state.lock().expect("transfer state lock")
    }

    pub fn set_state(&self, state: TransferState) {
        *self.state.lock().expect("transfer state lock") = state;
    }

    pub fn track_session(&self, lease_id: Uuid, handle: Arc<SessionHandle>) {
        self.active_sessions
            .lock()
            .expect("active sessions lock")
            .insert(lease_id, handle);
    }

    pub fn untrack_session(&self, lease_id: Uuid) {
        self.active_sessions
            .lock()
            .expect("active sessions lock")
            .remove(&lease_id);
    }

    /// Cancel cooperatively and destroy every recorded stream. In-flight
    /// protocol calls that never consult the token fail on their next
    /// read/write instead.
    pub fn cancel_now(&self) {
        self.cancel.cancel();
        let sessions: Vec<Arc<SessionHandle>> = {
            let mut active = self.active_sessions.lock().expect("active sessions lock");
            active.drain().map(|(_, h)| h).collect()
        };
        for session in sessions {
            session.teardown();
        }
        self.set_state(TransferState::Cancelled);
    }
}

/// Every in-flight transfer, keyed by transfer key.
#[derive(Default)]
pub struct TransferRegistry {
    transfers: StdMutex<HashMap<String, Arc<TransferHandle>>>,
}

impl TransferRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, handle: Arc<TransferHandle>) {
        self.transfers
            .lock()
            .expect("registry lock")
            .insert(handle.key.clone(), handle);
    }

    pub fn get(&self, key: &str) -> Option<Arc<TransferHandle>> {
        self.transfers.lock().expect("registry lock").get(key).cloned()
    }

    pub fn remove(&self, key: &str) -> Option<Arc<TransferHandle>> {
        self.transfers.lock().expect("registry lock").remove(key)
    }

    pub fn len(&self) -> usize {
        self.transfers.lock().expect("registry lock").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Cancel by exact key, falling back to any key prefixed by the
    /// connection id when the client lost the exact key it was issued.
    /// Returns the cancelled handle.
    pub fn cancel(&self, connection_id: &str, key: &str) -> Option<Arc<TransferHandle>> {
        let handle = {
            let mut transfers = self.transfers.lock().expect("registry lock");
            let resolved_key = if transfers.contains_key(key) {
                Some(key.to_string())
            } else {
                let prefix = format!("{}:", connection_id);
                transfers.keys().find(|k| k.starts_with(&prefix)).cloned()
            };
            resolved_key.and_then(|k| transfers.remove(&k))
        };

        if let Some(handle) = &handle {
            info!("transfer {} cancelled", handle.key);
            handle.cancel_now();
        } else {
            debug!("cancel: no transfer matches '{}' / '{}'", connection_id, key);
        }
        handle
    }

    /// Cancel and drop every transfer owned by a connection. Returns the
    /// cancelled handles.
    pub fn cleanup_connection(&self, connection_id: &str) -> Vec<Arc<TransferHandle>> {
        let drained: Vec<Arc<TransferHandle>> = {
            let mut transfers = self.transfers.lock().expect("registry lock");
            let keys: Vec<String> = transfers
                .values()
                .filter(|h| h.connection_id == connection_id)
                .map(|h| h.key.clone())
                .collect();
            keys.iter().filter_map(|k| transfers.remove(k)).collect()
        };
        for handle in &drained {
            handle.cancel_now();
        }
        if !drained.is_empty() {
            info!(
                "cleaned up {} transfers for connection '{}'",
                drained.len(),
                connection_id
            );
        }
        drained
    }
}
