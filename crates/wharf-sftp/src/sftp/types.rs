// ── Types ─────────────────────────────────────────────────────────────────────

use serde::{Deserialize, Serialize};
use std::time::Duration;

// ── Serde default helpers ────────────────────────────────────────────────────

fn default_port() -> u16 {
    22
}
fn default_timeout_secs() -> u64 {
    30
}
fn default_keepalive_secs() -> u64 {
    60
}

// ── Connection configuration ─────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SftpConnectionConfig {
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
    pub username: String,
    #[serde(default)]
    pub password: Option<String>,
    #[serde(default)]
    pub private_key_path: Option<String>,
    #[serde(default)]
    pub private_key_passphrase: Option<String>,
    #[serde(default)]
    pub use_agent: bool,
    #[serde(default)]
    pub compress: bool,
    #[serde(default = "default_timeout_secs")]
    pub timeout_secs: u64,
    #[serde(default = "default_keepalive_secs")]
    pub keepalive_interval_secs: u64,
}

// ── Directory listing ────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum SftpEntryType {
    File,
    Directory,
    Symlink,
    Unknown,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SftpDirEntry {
    pub name: String,
    pub path: String,
    pub entry_type: SftpEntryType,
    pub is_directory: bool,
    pub size: u64,
    pub permissions: u32,
    pub permissions_string: String,
    pub modified: Option<u64>,
    pub is_hidden: bool,
}

// ── Transfers ────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub enum TransferKind {
    Download,
    Upload,
    UploadMulti,
    UploadFolder,
    DownloadFolder,
}

impl TransferKind {
    pub fn as_str(self) -> &'static str {
        match self {
            TransferKind::Download => "download",
            TransferKind::Upload => "upload",
            TransferKind::UploadMulti => "upload-multifile",
            TransferKind::UploadFolder => "upload-folder",
            TransferKind::DownloadFolder => "download-folder",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferState {
    Queued,
    Scanning,
    Transferring,
    Completed,
    Cancelled,
    Failed,
}

/// Suffix appended to a download target until the stream completes.
pub const PART_SUFFIX: &str = ".part";

// ── Engine settings ──────────────────────────────────────────────────────────

/// Tuning knobs for the transfer orchestrator. The defaults are the
/// production values; tests shrink the timeouts.
#[derive(Debug, Clone)]
pub struct TransferSettings {
    /// Files up to this size stream with `small_chunk`.
    pub small_file_limit: u64,
    /// Files up to this size stream with `medium_chunk`.
    pub medium_file_limit: u64,
    pub small_chunk: usize,
    pub medium_chunk: usize,
    pub large_chunk: usize,

    /// Total attempts per file (first try included).
    pub max_attempts: u32,
    pub retry_base_delay: Duration,
    /// Stream teardown fires after this long without a byte event.
    pub no_progress_timeout: Duration,

    /// Worker-pool bounds, chosen from the batch's average file size.
    pub small_batch_workers: usize,
    pub default_workers: usize,
    pub large_file_workers: usize,
    /// Minimum batch size before the small-file bound applies.
    pub small_batch_min_files: usize,
    pub small_avg_limit: u64,
    pub large_avg_limit: u64,

    /// Idle borrowed sessions kept per connection for reuse.
    pub idle_sessions_per_connection: usize,
    /// Delay before the post-cancel directory refresh is enqueued.
    pub refresh_settle_delay: Duration,
    /// Upper bound for `read_file` previews.
    pub preview_max_bytes: u64,

    pub progress: ProgressSettings,
}

#[derive(Debug, Clone)]
pub struct ProgressSettings {
    /// Minimum interval between emitted progress events.
    pub report_interval: Duration,
    /// EMA smoothing factor for throughput.
    pub smoothing: f64,
    /// How long the displayed file name stays locked once chosen.
    pub display_lock: Duration,
}

impl Default for ProgressSettings {
    fn default() -> Self {
        Self {
            report_interval: Duration::from_millis(200),
            smoothing: 0.3,
            display_lock: Duration::from_secs(1),
        }
    }
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            small_file_limit: 10 * 1024 * 1024,
            medium_file_limit: 100 * 1024 * 1024,
            small_chunk: 256 * 1024,
            medium_chunk: 1024 * 1024,
            large_chunk: 2 * 1024 * 1024,
            max_attempts: 3,
            retry_base_delay: Duration::from_secs(1),
            no_progress_timeout: Duration::from_secs(30),
            small_batch_workers: 12,
            default_workers: 4,
            large_file_workers: 2,
            small_batch_min_files: 8,
            small_avg_limit: 10 * 1024 * 1024,
            large_avg_limit: 100 * 1024 * 1024,
            idle_sessions_per_connection: 4,
            refresh_settle_delay: Duration::from_millis(500),
            preview_max_bytes: 3 * 1024 * 1024,
            progress: ProgressSettings::default(),
        }
    }
}

impl TransferSettings {
    /// Chunk size for one file, traded off against round trips.
    pub fn chunk_size_for(&self, total_bytes: u64) -> usize {
        if total_bytes <= self.small_file_limit {
            self.small_chunk
        } else if total_bytes <= self.medium_file_limit {
            self.medium_chunk
        } else {
            self.large_chunk
        }
    }

    /// Worker-pool size for a batch, from the average file size. Many
    /// small files scale up, huge files scale down to keep each stream
    /// ahead of its watchdog.
    pub fn worker_pool_size(&self, file_count: usize, total_bytes: u64) -> usize {
        if file_count == 0 {
            return 1;
        }
        let avg = total_bytes / file_count as u64;
        if file_count >= self.small_batch_min_files && avg <= self.small_avg_limit {
            self.small_batch_workers
        } else if avg > self.large_avg_limit {
            self.large_file_workers
        } else {
            self.default_workers
        }
    }

    /// Exponential backoff before retry `attempt` (1-based).
    pub fn backoff_delay(&self, attempt: u32) -> Duration {
        self.retry_base_delay * 2u32.saturating_pow(attempt.saturating_sub(1))
    }
}

// ── Events ───────────────────────────────────────────────────────────────────

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ProgressEvent {
    pub transfer_key: String,
    /// 0–100, two decimals.
    pub progress: f64,
    pub file_name: String,
    pub transferred_bytes: u64,
    pub total_bytes: u64,
    /// Smoothed throughput in bytes per second.
    pub transfer_speed: f64,
    pub transfer_speed_text: String,
    /// Estimated seconds remaining; 0 when the speed is unknown.
    pub remaining_time: f64,
    pub remaining_time_text: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SyncStatusEvent {
    pub transfer_key: String,
    pub progress: f64,
    pub operation_complete: bool,
    pub successful_files: u32,
    pub failed_files: u32,
    pub cancelled: bool,
    pub error: Option<String>,
}

/// Notification sink supplied by the embedding shell. One progress event
/// and one status event channel; the engine never blocks on the sink.
pub trait EventSink: Send + Sync {
    fn emit_progress(&self, event: ProgressEvent);
    fn emit_sync_status(&self, event: SyncStatusEvent);
}

/// Sink that drops everything. Useful for headless callers and tests.
pub struct NullSink;

impl EventSink for NullSink {
    fn emit_progress(&self, _event: ProgressEvent) {}
    fn emit_sync_status(&self, _event: SyncStatusEvent) {}
}

// ── Formatting helpers ───────────────────────────────────────────────────────

pub fn format_size(bytes: u64) -> String {
    const UNITS: [&str; 5] = ["B", "KB", "MB", "GB", "TB"];
    let mut value = bytes as f64;
    for unit in UNITS {
        if value < 1024.0 {
            return format!("{:.2} {}", value, unit);
        }
        value /= 1024.0;
    }
    format!("{:.2} PB", value)
}

pub fn format_speed(bytes_per_sec: f64) -> String {
    format!("{}/s", format_size(bytes_per_sec.max(0.0) as u64))
}

pub fn format_eta(seconds: f64) -> String {
    let secs = seconds.max(0.0);
    if secs < 60.0 {
        format!("{:.0}s", secs)
    } else if secs < 3600.0 {
        format!("{:.0}m {:.0}s", (secs / 60.0).floor(), secs % 60.0)
    } else {
        format!(
            "{:.0}h {:.0}m",
            (secs / 3600.0).floor(),
            ((secs % 3600.0) / 60.0).floor()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_size_tiers() {
        let s = TransferSettings::default();
        assert_eq!(s.chunk_size_for(1024), 256 * 1024);
        assert_eq!(s.chunk_size_for(10 * 1024 * 1024), 256 * 1024);
        assert_eq!(s.chunk_size_for(50 * 1024 * 1024), 1024 * 1024);
        assert_eq!(s.chunk_size_for(500 * 1024 * 1024), 2 * 1024 * 1024);
    }

    #[test]
    fn worker_pool_scales_up_for_many_small_files() {
        let s = TransferSettings::default();
        // 500 files averaging 50 KB.
        assert_eq!(s.worker_pool_size(500, 500 * 50 * 1024), 12);
    }

    #[test]
    fn worker_pool_scales_down_for_huge_files() {
        let s = TransferSettings::default();
        assert_eq!(s.worker_pool_size(3, 3 * 200 * 1024 * 1024), 2);
    }

    #[test]
    fn worker_pool_default_band() {
        let s = TransferSettings::default();
        // 4 files averaging 50 MB: neither small-batch nor huge.
        assert_eq!(s.worker_pool_size(4, 4 * 50 * 1024 * 1024), 4);
        // Few small files do not trigger the small-batch bound.
        assert_eq!(s.worker_pool_size(2, 2 * 1024), 4);
    }

    #[test]
    fn backoff_doubles() {
        let s = TransferSettings::default();
        assert_eq!(s.backoff_delay(1), Duration::from_secs(1));
        assert_eq!(s.backoff_delay(2), Duration::from_secs(2));
        assert_eq!(s.backoff_delay(3), Duration::from_secs(4));
    }

    #[test]
    fn size_formatting() {
        assert_eq!(format_size(512), "512.00 B");
        assert_eq!(format_size(2048), "2.00 KB");
        assert_eq!(format_size(5 * 1024 * 1024), "5.00 MB");
    }

    #[test]
    fn eta_formatting() {
        assert_eq!(format_eta(42.0), "42s");
        assert_eq!(format_eta(90.0), "1m 30s");
        assert_eq!(format_eta(3720.0), "1h 2m");
    }

    #[test]
    fn config_defaults_from_json() {
        let cfg: SftpConnectionConfig =
            serde_json::from_str(r#"{"host":"example.com","username":"deploy"}"#).unwrap();
        assert_eq!(cfg.port, 22);
        assert_eq!(cfg.timeout_secs, 30);
        assert!(!cfg.use_agent);
    }
}
