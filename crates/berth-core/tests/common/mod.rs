// ABOUTME: In-process fake spawn server for integration tests.
// ABOUTME: Each launch runs a scripted helper task on the real control socket pair.

#![allow(dead_code)]

use std::collections::VecDeque;
use std::io;
use std::os::fd::{AsFd, OwnedFd};
use std::os::unix::fs::PermissionsExt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use berth_core::channel;
use berth_core::{
    parse_header_block, HelperLauncher, HelperProcess, MessageChannel, SpawnError,
    SpawnServerConfig, SpawnSupervisor,
};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::{UnixListener, UnixStream};
use tokio::task::JoinHandle;

/// Pid the fake helper reports for the first spawned worker.
pub const FIRST_WORKER_PID: u32 = 4321;

/// How one helper generation behaves.
#[derive(Debug, Clone)]
pub enum Behavior {
    /// Serves every request; workers echo their session input.
    Healthy,
    /// Answers spawn requests with an application error page.
    ErrorPage(String),
    /// Reads one request, then closes the channel without replying.
    HangUp,
    /// Closes the channel before reading anything.
    Crash,
    /// Replies with a status the protocol does not know.
    Garbage,
    /// Replies "ok" with an unknown listen kind.
    BadKind,
    /// Reads requests but never replies; exits when the channel closes.
    Silent,
    /// Healthy, but keeps running after the channel closes until terminated.
    Stubborn,
    /// Healthy, but survives termination too.
    Immortal,
    /// The launch itself fails.
    FailLaunch,
}

#[derive(Default)]
pub struct Record {
    pub launches: AtomicUsize,
    pub terminations: AtomicUsize,
    pub requests: Mutex<Vec<Vec<String>>>,
    /// Supervisor-side peers of every owner descriptor handed out.
    pub owner_peers: Mutex<Vec<std::os::unix::net::UnixStream>>,
    next_worker: AtomicUsize,
}

impl Record {
    pub fn launches(&self) -> usize {
        self.launches.load(Ordering::SeqCst)
    }

    pub fn terminations(&self) -> usize {
        self.terminations.load(Ordering::SeqCst)
    }

    pub fn requests(&self) -> Vec<Vec<String>> {
        self.requests.lock().unwrap().clone()
    }

    /// Requests whose command word is `command`.
    pub fn count(&self, command: &str) -> usize {
        self.requests()
            .iter()
            .filter(|r| r.first().map(String::as_str) == Some(command))
            .count()
    }
}

pub struct FakeLauncher {
    script: Mutex<VecDeque<Behavior>>,
    fallback: Behavior,
    record: Arc<Record>,
    socket_dir: PathBuf,
}

impl FakeLauncher {
    /// Helper generations follow `script`; once exhausted, every further
    /// generation is healthy.
    pub fn new(script: Vec<Behavior>, socket_dir: PathBuf) -> (Self, Arc<Record>) {
        let record = Arc::new(Record::default());
        let launcher = Self {
            script: Mutex::new(script.into()),
            fallback: Behavior::Healthy,
            record: record.clone(),
            socket_dir,
        };
        (launcher, record)
    }
}

impl HelperLauncher for FakeLauncher {
    fn launch(&self, control: OwnedFd) -> Result<Box<dyn HelperProcess>, SpawnError> {
        let behavior = self
            .script
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| self.fallback.clone());
        let generation = self.record.launches.fetch_add(1, Ordering::SeqCst) + 1;

        if matches!(behavior, Behavior::FailLaunch) {
            return Err(SpawnError::Setup {
                context: "Unable to fork a process".to_string(),
                source: io::Error::from(nix::errno::Errno::EAGAIN),
            });
        }

        let std_stream = std::os::unix::net::UnixStream::from(control);
        if matches!(behavior, Behavior::Crash) {
            drop(std_stream);
            let handle = tokio::spawn(async {});
            return Ok(Box::new(FakeProcess::new(generation, handle, false, &self.record)));
        }

        std_stream.set_nonblocking(true).map_err(|e| SpawnError::Setup {
            context: "nonblocking".to_string(),
            source: e,
        })?;
        let stream = UnixStream::from_std(std_stream).map_err(|e| SpawnError::Setup {
            context: "register".to_string(),
            source: e,
        })?;

        let immortal = matches!(behavior, Behavior::Immortal);
        let handle = tokio::spawn(run_helper(
            MessageChannel::new(stream),
            behavior,
            self.record.clone(),
            self.socket_dir.clone(),
        ));
        Ok(Box::new(FakeProcess::new(generation, handle, immortal, &self.record)))
    }
}

pub struct FakeProcess {
    pid: u32,
    handle: JoinHandle<()>,
    immortal: bool,
    record: Arc<Record>,
}

impl FakeProcess {
    fn new(generation: usize, handle: JoinHandle<()>, immortal: bool, record: &Arc<Record>) -> Self {
        Self {
            pid: 10_000 + generation as u32,
            handle,
            immortal,
            record: record.clone(),
        }
    }
}

impl HelperProcess for FakeProcess {
    fn pid(&self) -> u32 {
        self.pid
    }

    fn try_reap(&mut self) -> io::Result<bool> {
        Ok(self.handle.is_finished())
    }

    fn terminate(&mut self) -> io::Result<()> {
        self.record.terminations.fetch_add(1, Ordering::SeqCst);
        if !self.immortal {
            self.handle.abort();
        }
        Ok(())
    }
}

async fn run_helper(
    mut channel: MessageChannel,
    behavior: Behavior,
    record: Arc<Record>,
    socket_dir: PathBuf,
) {
    loop {
        let request = match channel.read_array().await {
            Ok(Some(request)) => request,
            _ => break,
        };
        record.requests.lock().unwrap().push(request.clone());

        if matches!(behavior, Behavior::HangUp) {
            return;
        }
        if request.first().map(String::as_str) != Some("spawn_application") {
            continue;
        }

        let result = match &behavior {
            Behavior::Silent => continue,
            Behavior::ErrorPage(page) => reply_error_page(&mut channel, page).await,
            Behavior::Garbage => channel.write_array(&["bogus", "reply"]).await,
            Behavior::BadKind => reply_ok(&mut channel, &record, &socket_dir, "fifo").await,
            _ => reply_ok(&mut channel, &record, &socket_dir, "unix").await,
        };
        if result.is_err() {
            break;
        }
    }

    if matches!(behavior, Behavior::Stubborn | Behavior::Immortal) {
        std::future::pending::<()>().await;
    }
}

async fn reply_error_page(
    channel: &mut MessageChannel,
    page: &str,
) -> Result<(), berth_core::ChannelError> {
    channel.write_array(&["error_page"]).await?;
    channel.write_scalar(page.as_bytes()).await
}

async fn reply_ok(
    channel: &mut MessageChannel,
    record: &Record,
    socket_dir: &std::path::Path,
    kind: &str,
) -> Result<(), berth_core::ChannelError> {
    let n = record.next_worker.fetch_add(1, Ordering::SeqCst);
    let pid = FIRST_WORKER_PID + n as u32;
    let path = socket_dir.join(format!("worker-{n}.sock"));

    let listener = UnixListener::bind(&path)?;
    std::fs::set_permissions(&path, std::fs::Permissions::from_mode(0o777))?;
    tokio::spawn(serve_worker(listener));

    let (owner, peer) = std::os::unix::net::UnixStream::pair()?;
    record.owner_peers.lock().unwrap().push(peer);

    channel.write_array(&["ok"]).await?;
    channel
        .write_array(&[pid.to_string(), path.display().to_string(), kind.to_string()])
        .await?;
    channel.send_fd(owner.as_fd()).await
}

/// Echo worker: reads the header frame and the body up to end-of-request, then
/// answers with the decoded headers and the body it saw.
async fn serve_worker(listener: UnixListener) {
    while let Ok((stream, _)) = listener.accept().await {
        tokio::spawn(echo_session(stream));
    }
}

async fn echo_session(mut stream: UnixStream) {
    let Ok(Some(headers)) = channel::read_scalar(&mut stream).await else {
        return;
    };
    let mut body = Vec::new();
    if stream.read_to_end(&mut body).await.is_err() {
        return;
    }
    let pairs = parse_header_block(&headers).unwrap_or_default();

    let mut response = format!("headers={}\n", pairs.len()).into_bytes();
    for (name, value) in pairs {
        response.extend_from_slice(&name);
        response.push(b'=');
        response.extend_from_slice(&value);
        response.push(b'\n');
    }
    response.extend_from_slice(b"body=");
    response.extend_from_slice(&body);
    let _ = stream.write_all(&response).await;
}

/// Short grace windows so stop sequences finish quickly.
pub fn test_config() -> SpawnServerConfig {
    SpawnServerConfig::new("fake", "fake-spawn-server")
        .with_grace(Duration::from_millis(300), Duration::from_millis(300))
}

pub struct Harness {
    pub supervisor: SpawnSupervisor,
    pub record: Arc<Record>,
    pub dir: tempfile::TempDir,
}

pub async fn harness(script: Vec<Behavior>) -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let (launcher, record) = FakeLauncher::new(script, dir.path().to_path_buf());
    let supervisor = SpawnSupervisor::with_launcher(test_config(), Box::new(launcher))
        .await
        .expect("supervisor should start");
    Harness {
        supervisor,
        record,
        dir,
    }
}
