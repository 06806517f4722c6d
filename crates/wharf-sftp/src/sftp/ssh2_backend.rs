// ── libssh2-backed session implementation ────────────────────────────────────

use crate::sftp::error::{SftpError, SftpErrorKind, SftpResult};
use crate::sftp::session::{Connector, RemoteDirEntry, RemoteSession, RemoteStat};
use crate::sftp::types::{SftpConnectionConfig, SftpEntryType};
use log::info;
use ssh2::{OpenFlags, OpenType, Session};
use std::io::{Read, Seek, SeekFrom, Write};
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::path::Path;
use std::time::Duration;

/// Opens one SSH connection + SFTP channel per `connect` call. The pool
/// decides how many live at a time.
pub struct Ssh2Connector {
    config: SftpConnectionConfig,
}

impl Ssh2Connector {
    pub fn new(config: SftpConnectionConfig) -> Self {
        Self { config }
    }
}

impl Connector for Ssh2Connector {
    fn connect(&self) -> SftpResult<Box<dyn RemoteSession>> {
        let config = &self.config;
        let addr = format!("{}:{}", config.host, config.port);

        let socket_addr = addr
            .to_socket_addrs()
            .map_err(|e| SftpError::connection_failed(format!("resolve '{}': {}", addr, e)))?
            .next()
            .ok_or_else(|| {
                SftpError::connection_failed(format!("'{}' resolved to no address", addr))
            })?;

        let tcp = TcpStream::connect_timeout(
            &socket_addr,
            Duration::from_secs(config.timeout_secs),
        )
        .map_err(|e| SftpError::connection_failed(format!("TCP connect to {}: {}", addr, e)))?;
        tcp.set_nonblocking(false)
            .map_err(|e| SftpError::connection_failed(format!("set blocking mode: {}", e)))?;

        let mut session = Session::new()
            .map_err(|e| SftpError::connection_failed(format!("create SSH session: {}", e)))?;
        if config.compress {
            session.set_compress(true);
        }
        session.set_tcp_stream(
            tcp.try_clone()
                .map_err(|e| SftpError::connection_failed(e.to_string()))?,
        );
        session
            .handshake()
            .map_err(|e| SftpError::connection_failed(format!("SSH handshake: {}", e)))?;

        let auth_method = authenticate(&mut session, config)?;
        if !session.authenticated() {
            return Err(SftpError::auth_failed(
                "not authenticated after auth attempt",
            ));
        }
        info!("sftp session to {} authenticated via {}", addr, auth_method);

        session.set_keepalive(
            config.keepalive_interval_secs > 0,
            config.keepalive_interval_secs as u32,
        );

        let sftp = session
            .sftp()
            .map_err(|e| SftpError::connection_failed(format!("open SFTP channel: {}", e)))?;

        Ok(Box::new(Ssh2RemoteSession {
            _session: session,
            sftp,
            tcp,
        }))
    }
}

// ── Authentication ladder ────────────────────────────────────────────────────

fn authenticate(session: &mut Session, config: &SftpConnectionConfig) -> SftpResult<String> {
    // 1. Agent-based auth
    if config.use_agent {
        if let Ok(mut agent) = session.agent() {
            if agent.connect().is_ok() {
                let _ = agent.list_identities();
                for identity in agent.identities().unwrap_or_default() {
                    if agent.userauth(&config.username, &identity).is_ok()
                        && session.authenticated()
                    {
                        return Ok("agent".to_string());
                    }
                }
            }
        }
    }

    // 2. Explicit private-key file
    if let Some(ref key_path) = config.private_key_path {
        let passphrase = config.private_key_passphrase.as_deref();
        session
            .userauth_pubkey_file(&config.username, None, Path::new(key_path), passphrase)
            .map_err(|e| SftpError::auth_failed(format!("public-key auth: {}", e)))?;
        if session.authenticated() {
            return Ok("publickey".to_string());
        }
    }

    // 3. Default key paths (~/.ssh/id_ed25519, id_rsa, id_ecdsa)
    if config.password.is_none() {
        if let Some(ssh_dir) = dirs::home_dir().map(|h| h.join(".ssh")) {
            for name in &["id_ed25519", "id_rsa", "id_ecdsa"] {
                let path = ssh_dir.join(name);
                if path.exists() {
                    let passphrase = config.private_key_passphrase.as_deref();
                    if session
                        .userauth_pubkey_file(&config.username, None, &path, passphrase)
                        .is_ok()
                        && session.authenticated()
                    {
                        return Ok(format!("publickey-default({})", name));
                    }
                }
            }
        }
    }

    // 4. Password, then keyboard-interactive fallback
    if let Some(ref password) = config.password {
        if session
            .userauth_password(&config.username, password)
            .is_ok()
            && session.authenticated()
        {
            return Ok("password".to_string());
        }

        struct KbdHandler {
            password: String,
        }

        impl ssh2::KeyboardInteractivePrompt for KbdHandler {
            fn prompt(
                &mut self,
                _username: &str,
                _instructions: &str,
                prompts: &[ssh2::Prompt],
            ) -> Vec<String> {
                prompts.iter().map(|_| self.password.clone()).collect()
            }
        }

        let mut handler = KbdHandler {
            password: password.clone(),
        };
        if session
            .userauth_keyboard_interactive(&config.username, &mut handler)
            .is_ok()
            && session.authenticated()
        {
            return Ok("keyboard-interactive".to_string());
        }
    }

    Err(SftpError::auth_failed("no authentication method succeeded"))
}

// ── Session implementation ───────────────────────────────────────────────────

struct Ssh2RemoteSession {
    // Held for the lifetime of the SFTP channel.
    _session: Session,
    sftp: ssh2::Sftp,
    tcp: TcpStream,
}

impl RemoteSession for Ssh2RemoteSession {
    fn stat(&self, path: &str) -> SftpResult<RemoteStat> {
        let stat = self
            .sftp
            .stat(Path::new(path))
            .map_err(|e| map_ssh2(e).with_path(path))?;
        Ok(to_remote_stat(&stat))
    }

    fn readdir(&self, path: &str) -> SftpResult<Vec<RemoteDirEntry>> {
        let raw = self
            .sftp
            .readdir(Path::new(path))
            .map_err(|e| map_ssh2(e).with_path(path))?;
        Ok(raw
            .into_iter()
            .filter_map(|(entry_path, stat)| {
                let name = entry_path.file_name()?.to_string_lossy().to_string();
                if name == "." || name == ".." {
                    return None;
                }
                Some(RemoteDirEntry {
                    name,
                    stat: to_remote_stat(&stat),
                })
            })
            .collect())
    }

    fn mkdir(&self, path: &str) -> SftpResult<()> {
        self.sftp
            .mkdir(Path::new(path), 0o755)
            .map_err(|e| map_ssh2(e).with_path(path))
    }

    fn rename(&self, from: &str, to: &str) -> SftpResult<()> {
        self.sftp
            .rename(
                Path::new(from),
                Path::new(to),
                Some(ssh2::RenameFlags::OVERWRITE | ssh2::RenameFlags::ATOMIC | ssh2::RenameFlags::NATIVE),
            )
            .map_err(|e| map_ssh2(e).with_path(from))
    }

    fn remove_file(&self, path: &str) -> SftpResult<()> {
        self.sftp
            .unlink(Path::new(path))
            .map_err(|e| map_ssh2(e).with_path(path))
    }

    fn remove_dir(&self, path: &str) -> SftpResult<()> {
        self.sftp
            .rmdir(Path::new(path))
            .map_err(|e| map_ssh2(e).with_path(path))
    }

    fn open_read(&self, path: &str, offset: u64) -> SftpResult<Box<dyn Read + Send>> {
        let mut file = self
            .sftp
            .open(Path::new(path))
            .map_err(|e| map_ssh2(e).with_path(path))?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset))
                .map_err(|e| SftpError::from(e).with_path(path))?;
        }
        Ok(Box::new(file))
    }

    fn open_write(&self, path: &str, offset: u64) -> SftpResult<Box<dyn Write + Send>> {
        let flags = if offset > 0 {
            OpenFlags::WRITE | OpenFlags::CREATE
        } else {
            OpenFlags::WRITE | OpenFlags::CREATE | OpenFlags::TRUNCATE
        };
        let mut file = self
            .sftp
            .open_mode(Path::new(path), flags, 0o644, OpenType::File)
            .map_err(|e| map_ssh2(e).with_path(path))?;
        if offset > 0 {
            file.seek(SeekFrom::Start(offset))
                .map_err(|e| SftpError::from(e).with_path(path))?;
        }
        Ok(Box::new(file))
    }

    /// Forced teardown: shut the TCP socket down so blocked reads and
    /// writes on this session error out instead of hanging.
    fn teardown(&self) {
        let _ = self.tcp.shutdown(Shutdown::Both);
    }
}

fn to_remote_stat(stat: &ssh2::FileStat) -> RemoteStat {
    let perm = stat.perm.unwrap_or(0);
    let entry_type = match perm & 0o170000 {
        0o040000 => SftpEntryType::Directory,
        0o120000 => SftpEntryType::Symlink,
        0o100000 => SftpEntryType::File,
        _ => {
            if stat.is_dir() {
                SftpEntryType::Directory
            } else if stat.is_file() {
                SftpEntryType::File
            } else {
                SftpEntryType::Unknown
            }
        }
    };
    RemoteStat {
        size: stat.size.unwrap_or(0),
        entry_type,
        permissions: perm,
        modified: stat.mtime,
    }
}

// ── Error mapping ────────────────────────────────────────────────────────────

/// Map libssh2 error codes onto the closed taxonomy. Retry logic keys on
/// the category, never on message wording.
fn map_ssh2(e: ssh2::Error) -> SftpError {
    let kind = match e.code() {
        ssh2::ErrorCode::SFTP(code) => match code {
            2 => SftpErrorKind::NotFound,          // SSH_FX_NO_SUCH_FILE
            3 => SftpErrorKind::PermissionDenied,  // SSH_FX_PERMISSION_DENIED
            6 => SftpErrorKind::ChannelClosed,     // SSH_FX_NO_CONNECTION
            7 => SftpErrorKind::ChannelClosed,     // SSH_FX_CONNECTION_LOST
            11 => SftpErrorKind::AlreadyExists,    // SSH_FX_FILE_ALREADY_EXISTS
            _ => SftpErrorKind::Protocol,
        },
        ssh2::ErrorCode::Session(code) => match code {
            -7 => SftpErrorKind::BrokenPipe,       // LIBSSH2_ERROR_SOCKET_SEND
            -43 => SftpErrorKind::ConnectionReset, // LIBSSH2_ERROR_SOCKET_RECV
            -13 => SftpErrorKind::ConnectionReset, // LIBSSH2_ERROR_SOCKET_DISCONNECT
            -45 => SftpErrorKind::ConnectionReset, // LIBSSH2_ERROR_BAD_SOCKET
            -9 | -30 => SftpErrorKind::Timeout,    // LIBSSH2_ERROR_TIMEOUT / SOCKET_TIMEOUT
            -26 | -27 => SftpErrorKind::ChannelClosed, // CHANNEL_CLOSED / CHANNEL_EOF_SENT
            -18 => SftpErrorKind::AuthFailed,      // LIBSSH2_ERROR_AUTHENTICATION_FAILED
            _ => SftpErrorKind::Protocol,
        },
    };
    SftpError::new(kind, e.message().to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sftp_codes_map_to_categories() {
        let cases = [
            (2, SftpErrorKind::NotFound),
            (3, SftpErrorKind::PermissionDenied),
            (7, SftpErrorKind::ChannelClosed),
            (11, SftpErrorKind::AlreadyExists),
        ];
        for (code, expected) in cases {
            let err = map_ssh2(ssh2::Error::new(ssh2::ErrorCode::SFTP(code), "x"));
            assert_eq!(err.kind, expected);
        }
    }

    #[test]
    fn session_codes_map_to_fault_categories() {
        for (code, expected) in [
            (-7, SftpErrorKind::BrokenPipe),
            (-43, SftpErrorKind::ConnectionReset),
            (-13, SftpErrorKind::ConnectionReset),
            (-30, SftpErrorKind::Timeout),
            (-26, SftpErrorKind::ChannelClosed),
        ] {
            let err = map_ssh2(ssh2::Error::new(ssh2::ErrorCode::Session(code), "x"));
            assert_eq!(err.kind, expected);
            assert!(err.is_fault());
        }
    }

    #[test]
    fn entry_type_decoding() {
        let stat = ssh2::FileStat {
            size: Some(42),
            uid: None,
            gid: None,
            perm: Some(0o100644),
            atime: None,
            mtime: Some(1_700_000_000),
        };
        let remote = to_remote_stat(&stat);
        assert_eq!(remote.entry_type, SftpEntryType::File);
        assert_eq!(remote.size, 42);
        assert_eq!(remote.modified, Some(1_700_000_000));

        let dir = ssh2::FileStat {
            size: None,
            uid: None,
            gid: None,
            perm: Some(0o040755),
            atime: None,
            mtime: None,
        };
        assert!(to_remote_stat(&dir).is_dir());
    }
}
