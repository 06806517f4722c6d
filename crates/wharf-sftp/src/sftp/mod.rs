// ── wharf-sftp / sftp module ──────────────────────────────────────────────────
//
// Remote-file-transfer engine over one multiplexed SFTP connection per
// tab:
//   • Session pool — one primary session for metadata, borrowed sessions
//     for the data plane, transparent fault recovery
//   • Operation queue — serialized, priority-ordered metadata operations
//     with mergeable dedup and bulk cancellation
//   • Transfer orchestrator — single-file, multi-file and whole-folder
//     transfers with resumable streaming, watchdog and adaptive
//     concurrency
//   • Progress coordinator — throttled, EMA-smoothed aggregate progress
//   • Transfer registry — cooperative cancellation with forced stream
//     teardown and post-cancel listing refresh

pub mod types;
pub mod error;
pub mod session;
pub mod ssh2_backend;
pub mod queue;
pub mod dir_ops;
pub mod progress;
pub mod registry;
pub mod transfer;
pub mod history;
pub mod engine;

pub use engine::SftpEngine;
pub use error::{SftpError, SftpErrorKind, SftpResult};
pub use history::{History, OperationRecord};
pub use queue::{OpOutput, OperationQueue, Priority, QueueOp};
pub use registry::{TransferHandle, TransferRegistry};
pub use session::{Connector, RemoteDirEntry, RemoteSession, RemoteStat, SessionLease, SessionPool};
pub use ssh2_backend::Ssh2Connector;
pub use types::*;
