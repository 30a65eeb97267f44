// ABOUTME: Handle for a spawned worker process and its listening address.
// ABOUTME: Opens request sessions and releases the socket node and owner descriptor on drop.

mod session;

pub use session::{WorkerSession, WorkerStream};

use std::fmt;
use std::io;
use std::os::fd::OwnedFd;
use std::path::{Path, PathBuf};
use std::str::FromStr;

use tokio::net::{TcpStream, UnixStream};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::cancel;
use crate::error::SessionError;

/// Kind of socket a worker listens on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ListenKind {
    Unix,
    Tcp,
}

impl FromStr for ListenKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "unix" => Ok(ListenKind::Unix),
            "tcp" => Ok(ListenKind::Tcp),
            other => Err(format!("unsupported listen socket type '{other}'")),
        }
    }
}

impl fmt::Display for ListenKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenKind::Unix => f.write_str("unix"),
            ListenKind::Tcp => f.write_str("tcp"),
        }
    }
}

/// Where a worker accepts session connections.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ListenAddress {
    /// Filesystem path of a Unix socket node.
    Unix(PathBuf),
    /// `host:port`, validated when connecting.
    Tcp(String),
}

impl ListenAddress {
    pub fn new(kind: ListenKind, address: &str) -> Self {
        match kind {
            ListenKind::Unix => ListenAddress::Unix(PathBuf::from(address)),
            ListenKind::Tcp => ListenAddress::Tcp(address.to_string()),
        }
    }

    pub fn kind(&self) -> ListenKind {
        match self {
            ListenAddress::Unix(_) => ListenKind::Unix,
            ListenAddress::Tcp(_) => ListenKind::Tcp,
        }
    }
}

impl fmt::Display for ListenAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ListenAddress::Unix(path) => write!(f, "unix:{}", path.display()),
            ListenAddress::Tcp(addr) => write!(f, "tcp:{addr}"),
        }
    }
}

/// Split `host:port`. Exactly one colon, a non-empty host, and a non-zero port.
pub fn parse_tcp_address(address: &str) -> Result<(String, u16), SessionError> {
    let invalid = || SessionError::Configuration(format!("invalid TCP/IP address '{address}'"));
    let parts: Vec<&str> = address.split(':').collect();
    let [host, port] = parts.as_slice() else {
        return Err(invalid());
    };
    if host.is_empty() {
        return Err(invalid());
    }
    match port.parse::<u16>() {
        Ok(port) if port != 0 => Ok((host.to_string(), port)),
        _ => Err(invalid()),
    }
}

/// A worker process created by the spawn server.
///
/// Dropping the handle closes the owner descriptor and removes the worker's
/// Unix socket node. The worker process itself is not signalled.
#[derive(Debug)]
pub struct SpawnedWorker {
    app_root: String,
    pid: u32,
    address: ListenAddress,
    // Held until drop; the worker exits when its owner descriptor closes.
    _owner: OwnedFd,
}

impl SpawnedWorker {
    pub fn new(app_root: impl Into<String>, pid: u32, address: ListenAddress, owner: OwnedFd) -> Self {
        Self {
            app_root: app_root.into(),
            pid,
            address,
            _owner: owner,
        }
    }

    pub fn app_root(&self) -> &str {
        &self.app_root
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn address(&self) -> &ListenAddress {
        &self.address
    }

    pub fn kind(&self) -> ListenKind {
        self.address.kind()
    }

    /// Open a new session with the worker. `on_close` runs exactly once when
    /// the session is dropped.
    pub async fn connect<F>(
        &self,
        on_close: F,
        cancel: &CancellationToken,
    ) -> Result<WorkerSession, SessionError>
    where
        F: FnOnce() + Send + 'static,
    {
        let stream = match &self.address {
            ListenAddress::Unix(path) => WorkerStream::Unix(connect_unix(path, cancel).await?),
            ListenAddress::Tcp(address) => {
                let (host, port) = parse_tcp_address(address)?;
                WorkerStream::Tcp(connect_tcp(&host, port, cancel).await?)
            }
        };
        debug!(pid = self.pid, address = %self.address, "Connected session");
        Ok(WorkerSession::new(self.pid, stream, on_close, cancel.clone()))
    }
}

impl Drop for SpawnedWorker {
    fn drop(&mut self) {
        if let ListenAddress::Unix(path) = &self.address {
            loop {
                match std::fs::remove_file(path) {
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) if e.kind() == io::ErrorKind::NotFound => break,
                    Err(e) => {
                        warn!(pid = self.pid, path = %path.display(), error = %e, "Cannot remove worker socket");
                        break;
                    }
                    Ok(()) => break,
                }
            }
        }
    }
}

async fn connect_unix(path: &Path, cancel: &CancellationToken) -> Result<UnixStream, SessionError> {
    loop {
        match cancel::cancellable(cancel, UnixStream::connect(path)).await {
            None => return Err(SessionError::Cancelled),
            Some(Ok(stream)) => return Ok(stream),
            Some(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
            Some(Err(e)) => {
                return Err(SessionError::io(
                    format!("cannot connect to Unix socket '{}'", path.display()),
                    e,
                ))
            }
        }
    }
}

async fn connect_tcp(
    host: &str,
    port: u16,
    cancel: &CancellationToken,
) -> Result<TcpStream, SessionError> {
    let resolve = tokio::net::lookup_host((host, port));
    let addrs = cancel::cancellable(cancel, resolve)
        .await
        .ok_or(SessionError::Cancelled)?
        .map_err(|e| SessionError::io(format!("cannot resolve '{host}'"), e))?;
    let Some(addr) = addrs.into_iter().find(|a| a.is_ipv4()) else {
        return Err(SessionError::Configuration(format!(
            "'{host}' has no IPv4 address"
        )));
    };

    loop {
        match cancel::cancellable(cancel, TcpStream::connect(addr)).await {
            None => return Err(SessionError::Cancelled),
            Some(Ok(stream)) => return Ok(stream),
            Some(Err(e)) if e.kind() == io::ErrorKind::Interrupted => continue,
            Some(Err(e)) => {
                return Err(SessionError::io(
                    format!("cannot connect to TCP socket '{host}:{port}'"),
                    e,
                ))
            }
        }
    }
}
