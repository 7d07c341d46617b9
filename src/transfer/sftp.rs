//! Upload over SSH/SFTP
//!
//! The archive lands at `<remote_base>/<local hostname>/Users/<YYYY-MM-DD>/<file name>`.
//! Missing directories along that path are created with mode `0755`.
//!
//! Credentials are picked in this order:
//!
//! 1. the configured private key file (it must exist)
//! 2. the configured password
//! 3. otherwise every one of `~/.ssh/id_rsa`, `~/.ssh/id_ed25519`,
//!    `~/.ssh/id_ecdsa` that exists, followed by a running SSH agent
//!
//! Discovered candidates are offered one after another until the server
//! accepts one; a key that cannot be parsed or is refused does not hide the
//! ones after it.
//!
//! The connect timeout covers the TCP dial, handshake and authentication.
//! The SFTP transfer itself runs without a session timeout.
//!
//! Server identity is checked against a known_hosts file when one is
//! configured; otherwise any key is accepted and a warning is emitted for
//! every session.

use super::RemoteCopy;
use crate::error::{BackupError, Result};
use crate::progress::{ProgressReader, DEFAULT_PROGRESS_INTERVAL};
use crate::telemetry::{Telemetry, TelemetryEvent};
use crate::types::{FinishedArchive, UploadReport};
use crate::utils;
use serde::{Deserialize, Serialize};
use ssh2::{CheckResult, KnownHostFileKind, Session, Sftp};
use std::fmt;
use std::fs::File;
use std::io::{self, BufReader, BufWriter, Write};
use std::net::{TcpStream, ToSocketAddrs};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};

/// Default SSH port
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Default connect and handshake timeout
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(30);

/// Key files probed in `~/.ssh` when nothing else is configured
pub const DEFAULT_KEY_NAMES: [&str; 3] = ["id_rsa", "id_ed25519", "id_ecdsa"];

const STREAM_BUFFER: usize = 256 * 1024;

/// How the server's host key is checked
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub enum HostKeyPolicy {
    /// Accept any key, warning on every session
    #[default]
    AcceptAny,
    /// Require a matching entry in an OpenSSH known_hosts file
    KnownHosts(PathBuf),
}

/// Connection settings for the SFTP adapter
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SshConfig {
    /// Server host name or address
    pub host: String,
    /// Server port
    pub port: u16,
    /// Login user
    pub user: String,
    /// Password, tried when no key file is configured
    #[serde(skip_serializing, default)]
    pub password: Option<String>,
    /// Private key file
    pub key_file: Option<PathBuf>,
    /// Remote base directory
    pub remote_base: String,
    /// Host key verification
    pub host_key_policy: HostKeyPolicy,
    /// TCP connect, handshake and login timeout
    pub connect_timeout: Duration,
}

impl SshConfig {
    /// Settings for `host` with defaults for everything else
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            port: DEFAULT_SSH_PORT,
            user: crate::platform::current_username(),
            password: None,
            key_file: None,
            remote_base: "backups".to_string(),
            host_key_policy: HostKeyPolicy::AcceptAny,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }

    /// `user@host:port:base`
    pub fn location(&self) -> String {
        format!("{}@{}:{}:{}", self.user, self.host, self.port, self.remote_base)
    }
}

impl fmt::Debug for SshConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SshConfig")
            .field("host", &self.host)
            .field("port", &self.port)
            .field("user", &self.user)
            .field("password", &self.password.as_ref().map(|_| "<redacted>"))
            .field("key_file", &self.key_file)
            .field("remote_base", &self.remote_base)
            .field("host_key_policy", &self.host_key_policy)
            .field("connect_timeout", &self.connect_timeout)
            .finish()
    }
}

/// Credential chosen for a session
#[derive(Clone, PartialEq, Eq)]
pub enum Credential {
    /// Explicitly configured private key
    KeyFile(PathBuf),
    /// Explicitly configured password
    Password(String),
    /// Key discovered in `~/.ssh`
    DefaultKey(PathBuf),
    /// Keys offered by a running SSH agent
    Agent,
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Credential::KeyFile(path) => f.debug_tuple("KeyFile").field(path).finish(),
            Credential::Password(_) => f.write_str("Password(<redacted>)"),
            Credential::DefaultKey(path) => f.debug_tuple("DefaultKey").field(path).finish(),
            Credential::Agent => f.write_str("Agent"),
        }
    }
}

/// Credentials to offer, in the order they are tried
///
/// `ssh_dir` is where default keys are probed; `agent` says whether an SSH
/// agent is reachable.
pub fn resolve_credentials(config: &SshConfig, ssh_dir: Option<&Path>, agent: bool) -> Result<Vec<Credential>> {
    if let Some(key) = &config.key_file {
        if !key.is_file() {
            return Err(BackupError::Authentication(format!(
                "private key file {:?} does not exist",
                key
            )));
        }
        return Ok(vec![Credential::KeyFile(key.clone())]);
    }

    if let Some(password) = config.password.as_ref().filter(|p| !p.is_empty()) {
        return Ok(vec![Credential::Password(password.clone())]);
    }

    let mut candidates: Vec<Credential> = ssh_dir
        .map(|dir| {
            DEFAULT_KEY_NAMES
                .iter()
                .map(|name| dir.join(name))
                .filter(|p| p.is_file())
                .map(Credential::DefaultKey)
                .collect()
        })
        .unwrap_or_default();
    if agent {
        candidates.push(Credential::Agent);
    }

    if candidates.is_empty() {
        return Err(BackupError::Authentication(
            "no SSH authentication method available".to_string(),
        ));
    }
    Ok(candidates)
}

/// Offer `candidates` in order until `attempt` reports success
///
/// `attempt` returns `Ok(true)` once the server has accepted the credential.
/// Rejections are collected and reported together when nothing is accepted.
pub fn authenticate_with<'a, F>(user: &str, candidates: &'a [Credential], mut attempt: F) -> Result<&'a Credential>
where
    F: FnMut(&Credential) -> std::result::Result<bool, String>,
{
    let mut rejected = Vec::with_capacity(candidates.len());
    for candidate in candidates {
        match attempt(candidate) {
            Ok(true) => return Ok(candidate),
            Ok(false) => rejected.push(format!("{:?} not accepted", candidate)),
            Err(err) => {
                debug!("{:?} rejected for {}: {}", candidate, user, err);
                rejected.push(format!("{:?}: {}", candidate, err));
            }
        }
    }
    Err(BackupError::Authentication(format!(
        "no credential accepted for {} ({})",
        user,
        rejected.join("; ")
    )))
}

/// Drop the session timeout once login is done; transfers have none
fn clear_session_timeout(session: &Session) {
    session.set_timeout(0);
}

/// Remote directory for an upload made on `hostname` on `date`
pub fn remote_directory(base: &str, hostname: &str, date: &str) -> String {
    let base = base.trim_end_matches('/');
    if base.is_empty() {
        format!("/{}/Users/{}", hostname, date)
    } else {
        format!("{}/{}/Users/{}", base, hostname, date)
    }
}

fn local_hostname() -> String {
    hostname::get()
        .ok()
        .and_then(|h| h.into_string().ok())
        .filter(|h| !h.is_empty())
        .unwrap_or_else(|| "localhost".to_string())
}

/// Copies archives over SFTP
pub struct SftpCopy {
    config: SshConfig,
    telemetry: Arc<dyn Telemetry>,
    interval: Duration,
}

impl SftpCopy {
    /// Create an adapter for `config`
    pub fn new(config: SshConfig, telemetry: Arc<dyn Telemetry>) -> Self {
        Self {
            config,
            telemetry,
            interval: DEFAULT_PROGRESS_INTERVAL,
        }
    }

    /// Progress reporting interval
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    fn connect(&self) -> Result<TcpStream> {
        let addr = format!("{}:{}", self.config.host, self.config.port);
        let resolved = (self.config.host.as_str(), self.config.port)
            .to_socket_addrs()
            .map_err(|source| BackupError::Connect {
                addr: addr.clone(),
                source,
            })?;

        let mut last_err = io::Error::new(io::ErrorKind::NotFound, "host resolved to no addresses");
        for candidate in resolved {
            match TcpStream::connect_timeout(&candidate, self.config.connect_timeout) {
                Ok(stream) => return Ok(stream),
                Err(err) => {
                    debug!("Connect to {} failed: {}", candidate, err);
                    last_err = err;
                }
            }
        }
        Err(BackupError::Connect { addr, source: last_err })
    }

    fn verify_host_key(&self, session: &Session) -> Result<()> {
        match &self.config.host_key_policy {
            HostKeyPolicy::AcceptAny => {
                self.telemetry.record(TelemetryEvent::Warning(format!(
                    "host key of {} accepted without verification",
                    self.config.host
                )));
                Ok(())
            }
            HostKeyPolicy::KnownHosts(file) => {
                let (key, _) = session
                    .host_key()
                    .ok_or_else(|| BackupError::HostKey("server sent no host key".to_string()))?;
                let mut known = session.known_hosts()?;
                known
                    .read_file(file, KnownHostFileKind::OpenSSH)
                    .map_err(|e| BackupError::HostKey(format!("cannot read {:?}: {}", file, e)))?;
                match known.check_port(&self.config.host, self.config.port, key) {
                    CheckResult::Match => Ok(()),
                    CheckResult::Mismatch => Err(BackupError::HostKey(format!(
                        "host key for {} does not match {:?}",
                        self.config.host, file
                    ))),
                    CheckResult::NotFound => Err(BackupError::HostKey(format!(
                        "{} is not listed in {:?}",
                        self.config.host, file
                    ))),
                    CheckResult::Failure => Err(BackupError::HostKey(format!(
                        "could not check host key for {}",
                        self.config.host
                    ))),
                }
            }
        }
    }

    fn authenticate(&self, session: &Session) -> Result<()> {
        let ssh_dir = dirs::home_dir().map(|h| h.join(".ssh"));
        let agent = std::env::var_os("SSH_AUTH_SOCK").is_some();
        let candidates = resolve_credentials(&self.config, ssh_dir.as_deref(), agent)?;

        let user = self.config.user.as_str();
        let accepted = authenticate_with(user, &candidates, |credential| {
            debug!("Authenticating as {} with {:?}", user, credential);
            match credential {
                Credential::KeyFile(path) | Credential::DefaultKey(path) => {
                    session.userauth_pubkey_file(user, None, path, None)
                }
                Credential::Password(password) => session.userauth_password(user, password),
                Credential::Agent => session.userauth_agent(user),
            }
            .map_err(|e| e.to_string())?;
            Ok(session.authenticated())
        })?;
        debug!("Authenticated as {} with {:?}", user, accepted);
        Ok(())
    }

    fn open_session(&self) -> Result<Session> {
        let stream = self.connect()?;
        let mut session = Session::new()?;
        session.set_tcp_stream(stream);
        session.set_timeout(u32::try_from(self.config.connect_timeout.as_millis()).unwrap_or(u32::MAX));
        session.handshake()?;
        self.verify_host_key(&session)?;
        self.authenticate(&session)?;
        clear_session_timeout(&session);
        Ok(session)
    }
}

/// Create `dir` and any missing parents
fn ensure_remote_dir(sftp: &Sftp, dir: &str) -> Result<()> {
    let absolute = dir.starts_with('/');
    let mut current = String::new();
    for part in dir.split('/').filter(|p| !p.is_empty()) {
        if absolute || !current.is_empty() {
            current.push('/');
        }
        current.push_str(part);

        let path = Path::new(&current);
        if sftp.stat(path).is_ok() {
            continue;
        }
        if let Err(source) = sftp.mkdir(path, 0o755) {
            // Another uploader may have created it in the meantime.
            if sftp.stat(path).is_err() {
                return Err(BackupError::RemoteDirectory {
                    path: current.clone(),
                    source,
                });
            }
        }
    }
    Ok(())
}

impl RemoteCopy for SftpCopy {
    fn upload(&self, archive: &FinishedArchive) -> Result<UploadReport> {
        let dir = remote_directory(
            &self.config.remote_base,
            &local_hostname(),
            &chrono::Local::now().format("%Y-%m-%d").to_string(),
        );
        let remote_path = format!("{}/{}", dir, archive.file_name());
        self.telemetry.record(TelemetryEvent::Phase(format!(
            "Uploading {} to {}@{}:{}",
            archive.path.display(),
            self.config.user,
            self.config.host,
            remote_path
        )));

        let session = self.open_session()?;
        let sftp = session.sftp()?;
        ensure_remote_dir(&sftp, &dir)?;

        let remote = sftp
            .create(Path::new(&remote_path))
            .map_err(|source| BackupError::RemoteFile {
                path: remote_path.clone(),
                source,
            })?;
        let file = File::open(&archive.path).map_err(BackupError::Transfer)?;

        let started = Instant::now();
        let mut reader = ProgressReader::new(
            BufReader::with_capacity(STREAM_BUFFER, file),
            archive.size,
            "Upload",
            Arc::clone(&self.telemetry),
        )
        .with_interval(self.interval);
        let mut writer = BufWriter::with_capacity(STREAM_BUFFER, remote);
        let bytes = io::copy(&mut reader, &mut writer).map_err(BackupError::Transfer)?;
        writer.flush().map_err(BackupError::Transfer)?;
        drop(writer);
        let duration = started.elapsed();

        info!(
            "Uploaded {} to {}:{} ({:.2} MB/s)",
            utils::format_bytes(bytes),
            self.config.host,
            remote_path,
            utils::mb_per_sec(bytes, duration)
        );
        Ok(UploadReport {
            location: format!("{}@{}:{}", self.config.user, self.config.host, remote_path),
            bytes,
            duration,
        })
    }

    fn destination(&self) -> String {
        self.config.location()
    }
}
