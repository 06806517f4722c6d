// Shared test backend: an in-memory remote filesystem with scripted
// faults (read/write failures at byte offsets, stalls, gated streams)
// and an operation recorder.

#![allow(dead_code)]

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::io::{Error, ErrorKind, Read, Write};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use wharf_sftp::{
    Connector, EventSink, ProgressEvent, RemoteDirEntry, RemoteSession, RemoteStat, SftpEntryType,
    SftpError, SftpErrorKind, SftpResult, SyncStatusEvent,
};

// ── Gate ─────────────────────────────────────────────────────────────────────

/// A latch a stream or operation blocks on until the test opens it.
pub struct Gate {
    opened: AtomicBool,
}

impl Gate {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            opened: AtomicBool::new(false),
        })
    }

    pub fn open(&self) {
        self.opened.store(true, Ordering::SeqCst);
    }

    /// Wait until opened or the session is torn down.
    fn wait(&self, torn: &AtomicBool) -> std::io::Result<()> {
        loop {
            if torn.load(Ordering::SeqCst) {
                return Err(Error::new(ErrorKind::ConnectionReset, "session torn down"));
            }
            if self.opened.load(Ordering::SeqCst) {
                return Ok(());
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

// ── Fake remote filesystem ───────────────────────────────────────────────────

#[derive(Default)]
pub struct FakeState {
    files: Mutex<BTreeMap<String, Vec<u8>>>,
    dirs: Mutex<BTreeSet<String>>,
    ops: Mutex<Vec<String>>,
    /// One-shot read failure once the cumulative offset reaches the value.
    read_faults: Mutex<HashMap<String, u64>>,
    /// One-shot write failure once the cumulative offset reaches the value.
    write_faults: Mutex<HashMap<String, u64>>,
    /// One-shot stat failure (classified as a transport fault).
    stat_faults: Mutex<HashMap<String, SftpErrorKind>>,
    /// Streams that never produce bytes. `true` keeps the stall armed
    /// across retries.
    stall_reads: Mutex<HashMap<String, bool>>,
    read_gates: Mutex<HashMap<String, Arc<Gate>>>,
    readdir_gates: Mutex<HashMap<String, Arc<Gate>>>,
    pub connects: AtomicUsize,
}

impl FakeState {
    pub fn new() -> Arc<Self> {
        let state = Arc::new(Self::default());
        state.dirs.lock().unwrap().insert("/".to_string());
        state
    }

    pub fn add_dir(&self, path: &str) {
        self.dirs.lock().unwrap().insert(path.to_string());
    }

    pub fn add_file(&self, path: &str, data: Vec<u8>) {
        self.files.lock().unwrap().insert(path.to_string(), data);
    }

    pub fn file(&self, path: &str) -> Option<Vec<u8>> {
        self.files.lock().unwrap().get(path).cloned()
    }

    pub fn has_dir(&self, path: &str) -> bool {
        self.dirs.lock().unwrap().contains(path)
    }

    pub fn set_read_fault(&self, path: &str, at: u64) {
        self.read_faults.lock().unwrap().insert(path.to_string(), at);
    }

    pub fn set_write_fault(&self, path: &str, at: u64) {
        self.write_faults.lock().unwrap().insert(path.to_string(), at);
    }

    pub fn set_stat_fault(&self, path: &str, kind: SftpErrorKind) {
        self.stat_faults.lock().unwrap().insert(path.to_string(), kind);
    }

    pub fn set_stall_read(&self, path: &str, persistent: bool) {
        self.stall_reads
            .lock()
            .unwrap()
            .insert(path.to_string(), persistent);
    }

    pub fn gate_read(&self, path: &str) -> Arc<Gate> {
        let gate = Gate::new();
        self.read_gates
            .lock()
            .unwrap()
            .insert(path.to_string(), gate.clone());
        gate
    }

    pub fn gate_readdir(&self, path: &str) -> Arc<Gate> {
        let gate = Gate::new();
        self.readdir_gates
            .lock()
            .unwrap()
            .insert(path.to_string(), gate.clone());
        gate
    }

    pub fn ops(&self) -> Vec<String> {
        self.ops.lock().unwrap().clone()
    }

    pub fn ops_matching(&self, prefix: &str) -> Vec<String> {
        self.ops()
            .into_iter()
            .filter(|op| op.starts_with(prefix))
            .collect()
    }

    fn record(&self, op: String) {
        self.ops.lock().unwrap().push(op);
    }

    fn stat_of(&self, path: &str) -> SftpResult<RemoteStat> {
        if let Some(kind) = self.stat_faults.lock().unwrap().remove(path) {
            return Err(SftpError::new(kind, "scripted stat fault").with_path(path));
        }
        if self.dirs.lock().unwrap().contains(path) {
            return Ok(RemoteStat {
                size: 0,
                entry_type: SftpEntryType::Directory,
                permissions: 0o040755,
                modified: None,
            });
        }
        if let Some(data) = self.files.lock().unwrap().get(path) {
            return Ok(RemoteStat {
                size: data.len() as u64,
                entry_type: SftpEntryType::File,
                permissions: 0o100644,
                modified: None,
            });
        }
        Err(SftpError::not_found(format!("no such path: {}", path)).with_path(path))
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

fn name_of(path: &str) -> String {
    path.trim_end_matches('/')
        .rsplit('/')
        .next()
        .unwrap_or(path)
        .to_string()
}

// ── Connector & session ──────────────────────────────────────────────────────

pub struct FakeConnector {
    state: Arc<FakeState>,
    pub fail_connect: AtomicBool,
}

impl FakeConnector {
    pub fn new(state: Arc<FakeState>) -> Arc<Self> {
        Arc::new(Self {
            state,
            fail_connect: AtomicBool::new(false),
        })
    }
}

impl Connector for FakeConnector {
    fn connect(&self) -> SftpResult<Box<dyn RemoteSession>> {
        if self.fail_connect.load(Ordering::SeqCst) {
            return Err(SftpError::connection_failed("scripted connect failure"));
        }
        self.state.connects.fetch_add(1, Ordering::SeqCst);
        Ok(Box::new(FakeSession {
            state: self.state.clone(),
            torn: Arc::new(AtomicBool::new(false)),
        }))
    }
}

pub struct FakeSession {
    state: Arc<FakeState>,
    torn: Arc<AtomicBool>,
}

impl FakeSession {
    fn check_alive(&self) -> SftpResult<()> {
        if self.torn.load(Ordering::SeqCst) {
            Err(SftpError::channel_closed("session torn down"))
        } else {
            Ok(())
        }
    }
}

impl RemoteSession for FakeSession {
    fn stat(&self, path: &str) -> SftpResult<RemoteStat> {
        self.check_alive()?;
        self.state.record(format!("stat {}", path));
        self.state.stat_of(path)
    }

    fn readdir(&self, path: &str) -> SftpResult<Vec<RemoteDirEntry>> {
        self.check_alive()?;
        self.state.record(format!("readdir {}", path));
        let gate = self.state.readdir_gates.lock().unwrap().get(path).cloned();
        if let Some(gate) = gate {
            gate.wait(&self.torn).map_err(SftpError::from)?;
        }
        if !self.state.dirs.lock().unwrap().contains(path) {
            return Err(SftpError::not_found(format!("no such dir: {}", path)));
        }

        let mut entries = Vec::new();
        for dir in self.state.dirs.lock().unwrap().iter() {
            if dir != path && parent_of(dir) == path {
                entries.push(RemoteDirEntry {
                    name: name_of(dir),
                    stat: RemoteStat {
                        size: 0,
                        entry_type: SftpEntryType::Directory,
                        permissions: 0o040755,
                        modified: None,
                    },
                });
            }
        }
        for (file, data) in self.state.files.lock().unwrap().iter() {
            if parent_of(file) == path {
                entries.push(RemoteDirEntry {
                    name: name_of(file),
                    stat: RemoteStat {
                        size: data.len() as u64,
                        entry_type: SftpEntryType::File,
                        permissions: 0o100644,
                        modified: None,
                    },
                });
            }
        }
        Ok(entries)
    }

    fn mkdir(&self, path: &str) -> SftpResult<()> {
        self.check_alive()?;
        self.state.record(format!("mkdir {}", path));
        let mut dirs = self.state.dirs.lock().unwrap();
        if dirs.contains(path) {
            return Err(SftpError::new(SftpErrorKind::AlreadyExists, "exists").with_path(path));
        }
        let parent = parent_of(path);
        if !dirs.contains(&parent) {
            return Err(SftpError::not_found(format!("parent missing: {}", parent)));
        }
        dirs.insert(path.to_string());
        Ok(())
    }

    fn rename(&self, from: &str, to: &str) -> SftpResult<()> {
        self.check_alive()?;
        self.state.record(format!("rename {} {}", from, to));
        let mut files = self.state.files.lock().unwrap();
        if let Some(data) = files.remove(from) {
            files.insert(to.to_string(), data);
            return Ok(());
        }
        drop(files);
        let mut dirs = self.state.dirs.lock().unwrap();
        if dirs.remove(from) {
            dirs.insert(to.to_string());
            return Ok(());
        }
        Err(SftpError::not_found(format!("no such path: {}", from)))
    }

    fn remove_file(&self, path: &str) -> SftpResult<()> {
        self.check_alive()?;
        self.state.record(format!("unlink {}", path));
        self.state
            .files
            .lock()
            .unwrap()
            .remove(path)
            .map(|_| ())
            .ok_or_else(|| SftpError::not_found(format!("no such file: {}", path)))
    }

    fn remove_dir(&self, path: &str) -> SftpResult<()> {
        self.check_alive()?;
        self.state.record(format!("rmdir {}", path));
        self.state
            .dirs
            .lock()
            .unwrap()
            .remove(path)
            .then_some(())
            .ok_or_else(|| SftpError::not_found(format!("no such dir: {}", path)))
    }

    fn open_read(&self, path: &str, offset: u64) -> SftpResult<Box<dyn Read + Send>> {
        self.check_alive()?;
        self.state.record(format!("open_read {}@{}", path, offset));

        let gate = self.state.read_gates.lock().unwrap().get(path).cloned();

        {
            let mut stalls = self.state.stall_reads.lock().unwrap();
            if let Some(&persistent) = stalls.get(path) {
                if !persistent {
                    stalls.remove(path);
                }
                return Ok(Box::new(StallingStream {
                    torn: self.torn.clone(),
                }));
            }
        }

        let data = self
            .state
            .files
            .lock()
            .unwrap()
            .get(path)
            .cloned()
            .ok_or_else(|| SftpError::not_found(format!("no such file: {}", path)))?;
        Ok(Box::new(FakeReadStream {
            state: self.state.clone(),
            path: path.to_string(),
            data,
            pos: offset,
            torn: self.torn.clone(),
            gate,
        }))
    }

    fn open_write(&self, path: &str, offset: u64) -> SftpResult<Box<dyn Write + Send>> {
        self.check_alive()?;
        self.state.record(format!("open_write {}@{}", path, offset));
        {
            let mut files = self.state.files.lock().unwrap();
            let entry = files.entry(path.to_string()).or_default();
            entry.truncate(offset as usize);
        }
        Ok(Box::new(FakeWriteStream {
            state: self.state.clone(),
            path: path.to_string(),
            pos: offset,
            torn: self.torn.clone(),
        }))
    }

    fn teardown(&self) {
        self.torn.store(true, Ordering::SeqCst);
    }
}

// ── Streams ──────────────────────────────────────────────────────────────────

struct FakeReadStream {
    state: Arc<FakeState>,
    path: String,
    data: Vec<u8>,
    pos: u64,
    torn: Arc<AtomicBool>,
    gate: Option<Arc<Gate>>,
}

impl Read for FakeReadStream {
    fn read(&mut self, buf: &mut [u8]) -> std::io::Result<usize> {
        if let Some(gate) = self.gate.take() {
            gate.wait(&self.torn)?;
        }
        if self.torn.load(Ordering::SeqCst) {
            return Err(Error::new(ErrorKind::ConnectionReset, "session torn down"));
        }

        let fail_at = self.state.read_faults.lock().unwrap().get(&self.path).copied();
        if let Some(at) = fail_at {
            if self.pos >= at {
                self.state.read_faults.lock().unwrap().remove(&self.path);
                return Err(Error::new(ErrorKind::ConnectionReset, "scripted reset"));
            }
        }

        let remaining = self.data.len() as u64 - self.pos.min(self.data.len() as u64);
        let mut n = buf.len().min(remaining as usize);
        if let Some(at) = fail_at {
            n = n.min((at - self.pos) as usize);
        }
        if n == 0 && remaining == 0 {
            return Ok(0);
        }
        let start = self.pos as usize;
        buf[..n].copy_from_slice(&self.data[start..start + n]);
        self.pos += n as u64;
        Ok(n)
    }
}

struct FakeWriteStream {
    state: Arc<FakeState>,
    path: String,
    pos: u64,
    torn: Arc<AtomicBool>,
}

impl Write for FakeWriteStream {
    fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
        if self.torn.load(Ordering::SeqCst) {
            return Err(Error::new(ErrorKind::BrokenPipe, "session torn down"));
        }
        let fail_at = self
            .state
            .write_faults
            .lock()
            .unwrap()
            .get(&self.path)
            .copied();
        if let Some(at) = fail_at {
            if self.pos >= at {
                self.state.write_faults.lock().unwrap().remove(&self.path);
                return Err(Error::new(ErrorKind::BrokenPipe, "scripted broken pipe"));
            }
        }

        let mut n = buf.len();
        if let Some(at) = fail_at {
            n = n.min((at - self.pos) as usize);
        }
        let mut files = self.state.files.lock().unwrap();
        let entry = files.entry(self.path.clone()).or_default();
        entry.extend_from_slice(&buf[..n]);
        self.pos += n as u64;
        Ok(n)
    }

    fn flush(&mut self) -> std::io::Result<()> {
        Ok(())
    }
}

/// A stream that never produces a byte; only teardown frees it.
struct StallingStream {
    torn: Arc<AtomicBool>,
}

impl Read for StallingStream {
    fn read(&mut self, _buf: &mut [u8]) -> std::io::Result<usize> {
        loop {
            if self.torn.load(Ordering::SeqCst) {
                return Err(Error::new(ErrorKind::ConnectionReset, "session torn down"));
            }
            std::thread::sleep(Duration::from_millis(5));
        }
    }
}

// ── Event sink ───────────────────────────────────────────────────────────────

#[derive(Default)]
pub struct CollectingSink {
    pub progress: Mutex<Vec<ProgressEvent>>,
    pub status: Mutex<Vec<SyncStatusEvent>>,
}

impl CollectingSink {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn status_for(&self, key: &str) -> Option<SyncStatusEvent> {
        self.status
            .lock()
            .unwrap()
            .iter()
            .find(|e| e.transfer_key == key)
            .cloned()
    }
}

impl EventSink for CollectingSink {
    fn emit_progress(&self, event: ProgressEvent) {
        self.progress.lock().unwrap().push(event);
    }

    fn emit_sync_status(&self, event: SyncStatusEvent) {
        self.status.lock().unwrap().push(event);
    }
}

/// Poll until a terminal status event for `key` arrives.
pub async fn wait_status(
    sink: &Arc<CollectingSink>,
    key: &str,
    timeout: Duration,
) -> SyncStatusEvent {
    let deadline = Instant::now() + timeout;
    loop {
        if let Some(event) = sink.status_for(key) {
            return event;
        }
        assert!(
            Instant::now() < deadline,
            "no sync status for '{}' within {:?}",
            key,
            timeout
        );
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Poll until `predicate` holds.
pub async fn wait_until(timeout: Duration, mut predicate: impl FnMut() -> bool) {
    let deadline = Instant::now() + timeout;
    while !predicate() {
        assert!(Instant::now() < deadline, "condition not met within {:?}", timeout);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

/// Deterministic pseudo-random payload.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| ((i * 31 + 7) % 251) as u8).collect()
}
