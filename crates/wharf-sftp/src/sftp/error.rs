//! Categorised SFTP engine error type.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Categorised engine error.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SftpError {
    pub kind: SftpErrorKind,
    pub message: String,
    /// Remote or local path involved, if any.
    pub path: Option<String>,
    pub connection_id: Option<String>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
pub enum SftpErrorKind {
    // ── Transport faults (retryable, trigger session recovery) ───────
    /// Peer reset the underlying connection.
    ConnectionReset,
    /// Write on a closed transport.
    BrokenPipe,
    /// Stream ended before the expected byte count.
    UnexpectedEof,
    /// The SSH channel was closed underneath an operation.
    ChannelClosed,
    /// Protocol I/O timed out.
    Timeout,
    /// Watchdog aborted a stalled stream.
    NoProgress,

    // ── Session / establishment errors ───────────────────────────────
    /// TCP / handshake failure while establishing a session.
    ConnectionFailed,
    /// No authentication method succeeded.
    AuthFailed,
    /// Connection id is not registered with the engine.
    SessionNotFound,

    // ── Application errors (never retried) ───────────────────────────
    PermissionDenied,
    NotFound,
    NotADirectory,
    AlreadyExists,
    /// Target is unusable for the requested operation (wrong type,
    /// over a size cap, malformed path).
    InvalidTarget,

    /// Operation cancelled by the user. Not a failure.
    Cancelled,

    /// Local filesystem I/O error.
    Io,
    /// Un-mappable protocol-level error.
    Protocol,
    Unknown,
}

impl SftpErrorKind {
    /// Transport-fault classification: `true` means the session is
    /// presumed broken and the operation may be retried after recovery.
    /// Application errors and establishment failures are final.
    pub fn is_fault(self) -> bool {
        matches!(
            self,
            SftpErrorKind::ConnectionReset
                | SftpErrorKind::BrokenPipe
                | SftpErrorKind::UnexpectedEof
                | SftpErrorKind::ChannelClosed
                | SftpErrorKind::Timeout
                | SftpErrorKind::NoProgress
        )
    }
}

pub type SftpResult<T> = Result<T, SftpError>;

// ── Construction helpers ─────────────────────────────────────────────

impl SftpError {
    pub fn new(kind: SftpErrorKind, msg: impl Into<String>) -> Self {
        Self {
            kind,
            message: msg.into(),
            path: None,
            connection_id: None,
        }
    }

    pub fn with_path(mut self, path: impl Into<String>) -> Self {
        self.path = Some(path.into());
        self
    }

    pub fn with_connection(mut self, id: impl Into<String>) -> Self {
        self.connection_id = Some(id.into());
        self
    }

    // ── Convenience constructors ─────────────────────────────────

    pub fn connection_failed(msg: impl Into<String>) -> Self {
        Self::new(SftpErrorKind::ConnectionFailed, msg)
    }

    pub fn auth_failed(msg: impl Into<String>) -> Self {
        Self::new(SftpErrorKind::AuthFailed, msg)
    }

    pub fn session_not_found(id: &str) -> Self {
        Self::new(
            SftpErrorKind::SessionNotFound,
            format!("Connection '{}' not registered", id),
        )
        .with_connection(id)
    }

    pub fn channel_closed(msg: impl Into<String>) -> Self {
        Self::new(SftpErrorKind::ChannelClosed, msg)
    }

    pub fn no_progress(msg: impl Into<String>) -> Self {
        Self::new(SftpErrorKind::NoProgress, msg)
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::new(SftpErrorKind::NotFound, msg)
    }

    pub fn not_a_directory(msg: impl Into<String>) -> Self {
        Self::new(SftpErrorKind::NotADirectory, msg)
    }

    pub fn invalid_target(msg: impl Into<String>) -> Self {
        Self::new(SftpErrorKind::InvalidTarget, msg)
    }

    pub fn cancelled(msg: impl Into<String>) -> Self {
        Self::new(SftpErrorKind::Cancelled, msg)
    }

    pub fn io(msg: impl Into<String>) -> Self {
        Self::new(SftpErrorKind::Io, msg)
    }

    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::new(SftpErrorKind::Protocol, msg)
    }

    pub fn is_fault(&self) -> bool {
        self.kind.is_fault()
    }

    pub fn is_cancelled(&self) -> bool {
        self.kind == SftpErrorKind::Cancelled
    }
}

impl fmt::Display for SftpError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match &self.path {
            Some(p) => write!(f, "[SFTP {:?}] {} ({})", self.kind, self.message, p),
            None => write!(f, "[SFTP {:?}] {}", self.kind, self.message),
        }
    }
}

impl std::error::Error for SftpError {}

impl From<std::io::Error> for SftpError {
    fn from(e: std::io::Error) -> Self {
        Self::new(classify_io(&e), e.to_string())
    }
}

/// Map a local/stream `io::Error` onto the closed fault taxonomy.
pub fn classify_io(e: &std::io::Error) -> SftpErrorKind {
    use std::io::ErrorKind as K;
    match e.kind() {
        K::ConnectionReset | K::ConnectionAborted => SftpErrorKind::ConnectionReset,
        K::BrokenPipe => SftpErrorKind::BrokenPipe,
        K::UnexpectedEof => SftpErrorKind::UnexpectedEof,
        K::TimedOut | K::WouldBlock => SftpErrorKind::Timeout,
        K::NotConnected => SftpErrorKind::ChannelClosed,
        K::PermissionDenied => SftpErrorKind::PermissionDenied,
        K::NotFound => SftpErrorKind::NotFound,
        K::AlreadyExists => SftpErrorKind::AlreadyExists,
        _ => SftpErrorKind::Io,
    }
}
