// ── Directory & metadata operations ──────────────────────────────────────────
//
// Executors for the closed queue-op set. Everything here runs on the
// blocking pool against the connection's primary session.

use crate::sftp::error::{SftpError, SftpErrorKind, SftpResult};
use crate::sftp::queue::{OpOutput, QueueOp};
use crate::sftp::session::{RemoteDirEntry, RemoteSession};
use crate::sftp::types::{SftpDirEntry, SftpEntryType};
use log::info;
use std::io::Read;

pub(crate) fn execute_op(
    session: &dyn RemoteSession,
    op: &QueueOp,
    preview_max_bytes: u64,
) -> SftpResult<OpOutput> {
    match op {
        QueueOp::List {
            path,
            include_hidden,
        } => list_directory(session, path, *include_hidden).map(OpOutput::Listing),
        QueueOp::ReadDir { path } => session.readdir(path).map(OpOutput::Entries),
        QueueOp::Stat { path } => session.stat(path).map(OpOutput::Stat),
        QueueOp::Mkdir { path } => mkdir(session, path).map(|_| OpOutput::Done),
        QueueOp::Rename { from, to } => {
            session.rename(from, to)?;
            info!("sftp rename: {} -> {}", from, to);
            Ok(OpOutput::Done)
        }
        QueueOp::Remove { path } => {
            let removed = remove_recursive(session, path)?;
            info!("sftp delete: {} ({} entries)", path, removed);
            Ok(OpOutput::Done)
        }
        QueueOp::ReadFile { path, max_bytes } => {
            read_file(session, path, (*max_bytes).min(preview_max_bytes)).map(OpOutput::FileContent)
        }
    }
}

// ── Listing ──────────────────────────────────────────────────────────────────

pub(crate) fn list_directory(
    session: &dyn RemoteSession,
    path: &str,
    include_hidden: bool,
) -> SftpResult<Vec<SftpDirEntry>> {
    let raw = session.readdir(path)?;
    let mut entries: Vec<SftpDirEntry> = raw
        .into_iter()
        .filter_map(|entry| {
            let is_hidden = entry.name.starts_with('.');
            if !include_hidden && is_hidden {
                return None;
            }
            Some(to_dir_entry(path, entry, is_hidden))
        })
        .collect();
    sort_entries(&mut entries);
    Ok(entries)
}

fn to_dir_entry(parent: &str, entry: RemoteDirEntry, is_hidden: bool) -> SftpDirEntry {
    let path = join_remote(parent, &entry.name);
    SftpDirEntry {
        is_directory: entry.stat.entry_type == SftpEntryType::Directory,
        entry_type: entry.stat.entry_type,
        size: entry.stat.size,
        permissions: entry.stat.permissions,
        permissions_string: format_permissions(entry.stat.permissions),
        modified: entry.stat.modified,
        is_hidden,
        name: entry.name,
        path,
    }
}

/// Directories first, then case-insensitive name order.
fn sort_entries(entries: &mut [SftpDirEntry]) {
    entries.sort_by(|a, b| {
        b.is_directory
            .cmp(&a.is_directory)
            .then_with(|| a.name.to_lowercase().cmp(&b.name.to_lowercase()))
    });
}

pub(crate) fn join_remote(parent: &str, name: &str) -> String {
    if parent.ends_with('/') {
        format!("{}{}", parent, name)
    } else {
        format!("{}/{}", parent, name)
    }
}

// ── mkdir ────────────────────────────────────────────────────────────────────

/// Create one directory. A directory that already exists is success, so
/// folder pre-creation can re-run safely.
pub(crate) fn mkdir(session: &dyn RemoteSession, path: &str) -> SftpResult<()> {
    match session.mkdir(path) {
        Ok(()) => {
            info!("sftp mkdir: {}", path);
            Ok(())
        }
        Err(e) if e.kind == SftpErrorKind::AlreadyExists => confirm_directory(session, path),
        Err(e) => match session.stat(path) {
            Ok(stat) if stat.is_dir() => Ok(()),
            _ => Err(e),
        },
    }
}

fn confirm_directory(session: &dyn RemoteSession, path: &str) -> SftpResult<()> {
    let stat = session.stat(path)?;
    if stat.is_dir() {
        Ok(())
    } else {
        Err(SftpError::not_a_directory(format!(
            "'{}' exists and is not a directory",
            path
        ))
        .with_path(path))
    }
}

// ── Recursive delete ─────────────────────────────────────────────────────────

/// Remove a file, or a directory tree depth-first. Returns the number of
/// entries removed.
pub(crate) fn remove_recursive(session: &dyn RemoteSession, path: &str) -> SftpResult<u64> {
    let stat = session.stat(path)?;
    if !stat.is_dir() {
        session.remove_file(path)?;
        return Ok(1);
    }

    let mut removed = 0u64;
    for entry in session.readdir(path)? {
        let child = join_remote(path, &entry.name);
        if entry.stat.is_dir() {
            removed += remove_recursive(session, &child)?;
        } else {
            session.remove_file(&child)?;
            removed += 1;
        }
    }
    session.remove_dir(path)?;
    Ok(removed + 1)
}

// ── File preview ─────────────────────────────────────────────────────────────

/// Read a whole remote file, refusing anything over the cap.
pub(crate) fn read_file(
    session: &dyn RemoteSession,
    path: &str,
    max_bytes: u64,
) -> SftpResult<Vec<u8>> {
    let stat = session.stat(path)?;
    if stat.is_dir() {
        return Err(SftpError::invalid_target(format!("'{}' is a directory", path)).with_path(path));
    }
    if stat.size > max_bytes {
        return Err(SftpError::invalid_target(format!(
            "file too large to preview ({} > {} bytes)",
            stat.size, max_bytes
        ))
        .with_path(path));
    }

    let mut stream = session.open_read(path, 0)?;
    let mut content = Vec::with_capacity(stat.size as usize);
    stream
        .read_to_end(&mut content)
        .map_err(|e| SftpError::from(e).with_path(path))?;
    Ok(content)
}

// ── Permissions rendering ────────────────────────────────────────────────────

/// Human-readable permissions string like "drwxr-xr-x".
pub fn format_permissions(mode: u32) -> String {
    let mut s = String::with_capacity(10);

    s.push(match mode & 0o170000 {
        0o040000 => 'd',
        0o120000 => 'l',
        0o010000 => 'p',
        0o140000 => 's',
        0o060000 => 'b',
        0o020000 => 'c',
        _ => '-',
    });

    for shift in [6u32, 3, 0] {
        let bits = (mode >> shift) & 0o7;
        s.push(if bits & 0o4 != 0 { 'r' } else { '-' });
        s.push(if bits & 0o2 != 0 { 'w' } else { '-' });
        s.push(if bits & 0o1 != 0 { 'x' } else { '-' });
    }

    s
}
