//! # wharf-sftp
//!
//! SFTP session pooling and concurrent file-transfer engine:
//!   • One primary session per connection for serialized metadata
//!     operations, borrowed sessions for parallel data transfer
//!   • Priority operation queue with mergeable dedup and bulk clear
//!   • Resumable chunked streaming with per-file watchdog and
//!     exponential-backoff retry
//!   • Adaptive batch concurrency sized from average file size
//!   • Throttled, EMA-smoothed aggregate progress events
//!   • Cooperative cancellation with forced stream teardown and a
//!     post-cancel directory refresh

pub mod sftp;

pub use sftp::*;
