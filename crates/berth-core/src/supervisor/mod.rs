// ABOUTME: Supervises the spawn-server helper and serves spawn/reload requests through it.
// ABOUTME: One lock serializes all helper traffic; helper death triggers one restart and one retry.

mod launcher;
mod state;

pub use launcher::{ExecLauncher, ForkedHelper, HelperLauncher, HelperProcess, CONTROL_FD};
pub use state::HelperPhase;

use std::fs::Permissions;
use std::io;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::time::Duration;

use nix::errno::Errno;
use nix::unistd::{chown, getegid, geteuid};
use tokio::sync::{Mutex, MutexGuard};
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::cancel;
use crate::channel::MessageChannel;
use crate::config::SpawnServerConfig;
use crate::error::{ChannelError, SpawnError};
use crate::options::SpawnOptions;
use crate::worker::{ListenAddress, ListenKind, SpawnedWorker};

/// How often a stopping helper is polled for exit.
const POLL_INTERVAL: Duration = Duration::from_millis(100);

const APPLICATION_FAILURE_MESSAGE: &str = "An error occurred while spawning the application.";

#[derive(Default)]
struct Inner {
    phase: HelperPhase,
    process: Option<Box<dyn HelperProcess>>,
    channel: Option<MessageChannel>,
    needs_restart: bool,
    shut_down: bool,
}

impl Inner {
    fn set_phase(&mut self, phase: HelperPhase) {
        if self.phase != phase {
            debug!(from = %self.phase, to = %phase, "Spawn server phase change");
            self.phase = phase;
        }
    }

    /// Remember that the channel can no longer be trusted.
    fn note_failure(&mut self, err: &SpawnError) {
        if err.is_helper_death() || matches!(err, SpawnError::Cancelled) {
            self.needs_restart = true;
        }
    }
}

enum WaitOutcome {
    Exited,
    TimedOut,
    Cancelled,
}

/// Owns the spawn-server helper process and the control channel to it.
///
/// Shared by all callers; `spawn` and `reload` are mutually exclusive. When the
/// helper turns out to be dead mid-request, the supervisor restarts it and
/// retries that request exactly once.
pub struct SpawnSupervisor {
    config: SpawnServerConfig,
    launcher: Box<dyn HelperLauncher>,
    inner: Mutex<Inner>,
}

impl SpawnSupervisor {
    /// Start a supervisor backed by a real helper process.
    pub async fn start(config: SpawnServerConfig) -> Result<Self, SpawnError> {
        let launcher = ExecLauncher::new(config.clone());
        Self::with_launcher(config, Box::new(launcher)).await
    }

    /// Start a supervisor with a custom launcher. The helper is started eagerly.
    pub async fn with_launcher(
        config: SpawnServerConfig,
        launcher: Box<dyn HelperLauncher>,
    ) -> Result<Self, SpawnError> {
        let supervisor = Self {
            config,
            launcher,
            inner: Mutex::new(Inner::default()),
        };
        {
            let never = CancellationToken::new();
            let mut inner = supervisor.inner.lock().await;
            supervisor
                .restart_locked(&mut inner, &never)
                .await
                .map_err(|e| e.prepend("Could not start the spawn server"))?;
        }
        Ok(supervisor)
    }

    /// Ask the helper to spawn a worker for `options`.
    pub async fn spawn(
        &self,
        options: &SpawnOptions,
        cancel: &CancellationToken,
    ) -> Result<SpawnedWorker, SpawnError> {
        let mut inner = self.lock(cancel).await?;
        let restarted = self.ensure_started(&mut inner, cancel).await?;

        match self.send_spawn_command(&mut inner, options, cancel).await {
            Err(e) if e.is_helper_death() && !restarted => {
                self.recover(&mut inner, e, cancel).await?;
                self.send_spawn_command(&mut inner, options, cancel).await
            }
            other => other,
        }
    }

    /// Tell the helper to drop any cached code for `app_root`.
    pub async fn reload(&self, app_root: &str, cancel: &CancellationToken) -> Result<(), SpawnError> {
        let mut inner = self.lock(cancel).await?;
        let restarted = self.ensure_started(&mut inner, cancel).await?;

        match self.send_reload_command(&mut inner, app_root, cancel).await {
            Err(e) if e.is_helper_death() && !restarted => {
                self.recover(&mut inner, e, cancel).await?;
                self.send_reload_command(&mut inner, app_root, cancel).await
            }
            other => other,
        }
    }

    /// Close the control channel and wait (bounded) for the helper to exit.
    /// Later `spawn`/`reload` calls fail with [`SpawnError::Shutdown`].
    pub async fn shutdown(&self, cancel: &CancellationToken) -> Result<(), SpawnError> {
        let mut inner = self.lock(cancel).await?;
        inner.shut_down = true;
        self.stop_locked(&mut inner, cancel).await
    }

    /// Pid of the current helper, if one is recorded.
    pub async fn helper_pid(&self) -> Option<u32> {
        self.inner.lock().await.process.as_ref().map(|p| p.pid())
    }

    pub async fn phase(&self) -> HelperPhase {
        self.inner.lock().await.phase
    }

    async fn lock(&self, cancel: &CancellationToken) -> Result<MutexGuard<'_, Inner>, SpawnError> {
        cancel::cancellable(cancel, self.inner.lock())
            .await
            .ok_or(SpawnError::Cancelled)
    }

    /// Restart a helper left unusable by an earlier call. Returns whether it
    /// restarted; that restart is the call's one restart, so a failure after
    /// it is returned as is.
    async fn ensure_started(
        &self,
        inner: &mut Inner,
        cancel: &CancellationToken,
    ) -> Result<bool, SpawnError> {
        if inner.shut_down {
            return Err(SpawnError::Shutdown);
        }
        if !inner.needs_restart && inner.channel.is_some() {
            return Ok(false);
        }
        info!("Spawn server is not usable, restarting it");
        self.restart_locked(inner, cancel)
            .await
            .map_err(|e| e.prepend("Could not restart the spawn server"))?;
        Ok(true)
    }

    async fn recover(
        &self,
        inner: &mut Inner,
        cause: SpawnError,
        cancel: &CancellationToken,
    ) -> Result<(), SpawnError> {
        warn!(error = %cause, "The spawn server died unexpectedly, restarting it");
        match self.restart_locked(inner, cancel).await {
            Ok(()) => Ok(()),
            Err(SpawnError::Cancelled) => Err(SpawnError::Cancelled),
            Err(restart) => Err(SpawnError::RestartFailed {
                cause: Box::new(cause),
                restart: Box::new(restart),
            }),
        }
    }

    async fn restart_locked(
        &self,
        inner: &mut Inner,
        cancel: &CancellationToken,
    ) -> Result<(), SpawnError> {
        self.stop_locked(inner, cancel).await?;

        inner.needs_restart = true;
        inner.set_phase(HelperPhase::Starting);

        match self.launch_helper() {
            Ok((process, channel)) => {
                info!(pid = process.pid(), "Spawn server started");
                inner.process = Some(process);
                inner.channel = Some(channel);
                inner.needs_restart = false;
                inner.set_phase(HelperPhase::Running);
                Ok(())
            }
            Err(e) => {
                inner.set_phase(HelperPhase::NoHelper);
                Err(e)
            }
        }
    }

    fn launch_helper(&self) -> Result<(Box<dyn HelperProcess>, MessageChannel), SpawnError> {
        let (parent, child) = std::os::unix::net::UnixStream::pair()
            .map_err(|e| SpawnError::setup("Cannot create a Unix socket", e))?;
        let channel = MessageChannel::from_std(parent)
            .map_err(|e| SpawnError::setup("Cannot register the control channel", e))?;
        let process = self.launcher.launch(child.into())?;
        Ok((process, channel))
    }

    /// Close the channel, give the helper `shutdown_grace` to exit on its own,
    /// then SIGTERM it and wait `kill_grace` more before giving up on it.
    async fn stop_locked(
        &self,
        inner: &mut Inner,
        cancel: &CancellationToken,
    ) -> Result<(), SpawnError> {
        inner.channel = None;
        let Some(mut process) = inner.process.take() else {
            inner.set_phase(HelperPhase::NoHelper);
            return Ok(());
        };
        inner.set_phase(HelperPhase::Stopping);
        let pid = process.pid();

        let mut outcome =
            wait_for_exit(process.as_mut(), self.config.shutdown_grace(), cancel).await;
        if matches!(outcome, WaitOutcome::TimedOut) {
            info!(pid, "Spawn server did not exit in time, sending SIGTERM");
            if let Err(e) = process.terminate() {
                warn!(pid, error = %e, "Cannot send SIGTERM to the spawn server");
            }
            outcome = wait_for_exit(process.as_mut(), self.config.kill_grace(), cancel).await;
        }

        match outcome {
            WaitOutcome::Exited => debug!(pid, "Spawn server stopped"),
            WaitOutcome::TimedOut => {
                warn!(pid, "Spawn server ignored SIGTERM, abandoning it")
            }
            WaitOutcome::Cancelled => {
                inner.process = Some(process);
                inner.needs_restart = true;
                return Err(SpawnError::Cancelled);
            }
        }
        inner.set_phase(HelperPhase::NoHelper);
        Ok(())
    }

    async fn send_spawn_command(
        &self,
        inner: &mut Inner,
        options: &SpawnOptions,
        cancel: &CancellationToken,
    ) -> Result<SpawnedWorker, SpawnError> {
        let Some(channel) = inner.channel.as_mut() else {
            inner.needs_restart = true;
            return Err(SpawnError::HelperExited);
        };
        let result = cancel::cancellable(cancel, spawn_exchange(channel, options))
            .await
            .unwrap_or(Err(SpawnError::Cancelled));
        if let Err(e) = &result {
            inner.note_failure(e);
        }
        result
    }

    async fn send_reload_command(
        &self,
        inner: &mut Inner,
        app_root: &str,
        cancel: &CancellationToken,
    ) -> Result<(), SpawnError> {
        let Some(channel) = inner.channel.as_mut() else {
            inner.needs_restart = true;
            return Err(SpawnError::HelperExited);
        };
        let result = match cancel::cancellable(cancel, channel.write_array(&["reload", app_root])).await {
            Some(written) => written.map_err(|e| write_error("reload", e)),
            None => Err(SpawnError::Cancelled),
        };
        match &result {
            Ok(()) => debug!(app_root, "Sent reload command"),
            Err(e) => inner.note_failure(e),
        }
        result
    }
}

impl Drop for SpawnSupervisor {
    fn drop(&mut self) {
        let inner = self.inner.get_mut();
        inner.channel = None;
        if let Some(mut process) = inner.process.take() {
            if matches!(process.try_reap(), Ok(true)) {
                return;
            }
            let pid = process.pid();
            warn!(pid, "Spawn supervisor dropped without shutdown, sending SIGTERM to the spawn server");
            if let Err(e) = process.terminate() {
                warn!(pid, error = %e, "Cannot send SIGTERM to the spawn server");
            }
        }
    }
}

async fn wait_for_exit(
    process: &mut dyn HelperProcess,
    grace: Duration,
    cancel: &CancellationToken,
) -> WaitOutcome {
    let deadline = Instant::now() + grace;
    loop {
        match process.try_reap() {
            Ok(true) => return WaitOutcome::Exited,
            Ok(false) => {}
            Err(e) => {
                warn!(pid = process.pid(), error = %e, "Cannot wait for the spawn server, assuming it is gone");
                return WaitOutcome::Exited;
            }
        }
        let now = Instant::now();
        if now >= deadline {
            return WaitOutcome::TimedOut;
        }
        if !cancel::sleep(cancel, POLL_INTERVAL.min(deadline - now)).await {
            return WaitOutcome::Cancelled;
        }
    }
}

/// One `spawn_application` request/reply round trip.
async fn spawn_exchange(
    channel: &mut MessageChannel,
    options: &SpawnOptions,
) -> Result<SpawnedWorker, SpawnError> {
    let mut command = Vec::with_capacity(9);
    command.push("spawn_application".to_string());
    command.extend(options.to_vec());
    channel
        .write_array(&command)
        .await
        .map_err(|e| write_error("spawn_application", e))?;

    let status = channel
        .read_array()
        .await
        .map_err(read_error)?
        .ok_or(SpawnError::HelperExited)?;
    match status.as_slice() {
        [s] if s == "ok" => {}
        [s] if s == "error_page" => {
            let page = channel
                .read_scalar()
                .await
                .map_err(read_error)?
                .ok_or(SpawnError::HelperExited)?;
            return Err(SpawnError::Application {
                message: APPLICATION_FAILURE_MESSAGE.to_string(),
                error_page: String::from_utf8_lossy(&page).into_owned(),
            });
        }
        _ => {
            return Err(SpawnError::Protocol(format!(
                "unexpected reply to spawn_application: {status:?}"
            )))
        }
    }

    let info = channel
        .read_array()
        .await
        .map_err(read_error)?
        .ok_or(SpawnError::HelperExited)?;
    let [pid, address, kind] = info.as_slice() else {
        return Err(SpawnError::Protocol(format!(
            "invalid spawn_application reply: expected 3 fields, got {}",
            info.len()
        )));
    };
    let owner = channel.recv_fd().await.map_err(read_error)?;

    let pid: u32 = pid
        .parse()
        .map_err(|_| SpawnError::Protocol(format!("invalid worker pid '{pid}'")))?;
    let kind: ListenKind = kind.parse().map_err(SpawnError::Configuration)?;
    let address = ListenAddress::new(kind, address);

    if let ListenAddress::Unix(path) = &address {
        restrict_socket_permissions(path);
    }

    info!(app_root = %options.app_root, pid, address = %address, "Spawned worker");
    Ok(SpawnedWorker::new(options.app_root.clone(), pid, address, owner))
}

fn write_error(command: &str, err: ChannelError) -> SpawnError {
    match err {
        ChannelError::InvalidElement(_) | ChannelError::FrameTooLarge(_) => {
            SpawnError::Configuration(format!("cannot encode the '{command}' command: {err}"))
        }
        ChannelError::Io(source) => SpawnError::ControlChannel {
            context: format!("Could not write '{command}' command to the spawn server"),
            source,
        },
        ChannelError::UnexpectedEof => SpawnError::HelperExited,
        other => SpawnError::Protocol(other.to_string()),
    }
}

fn read_error(err: ChannelError) -> SpawnError {
    match err {
        ChannelError::UnexpectedEof => SpawnError::HelperExited,
        ChannelError::Io(source) => SpawnError::ControlChannel {
            context: "Could not read from the spawn server".to_string(),
            source,
        },
        other => SpawnError::Protocol(other.to_string()),
    }
}

/// Make a worker's socket node accessible only to the current effective user.
fn restrict_socket_permissions(path: &Path) {
    let chmod = retry_on_eintr(|| std::fs::set_permissions(path, Permissions::from_mode(0o600)));
    if let Err(e) = chmod {
        warn!(path = %path.display(), error = %e, "Cannot restrict permissions on worker socket");
    }
    let owner = retry_on_eintr(|| {
        chown(path, Some(geteuid()), Some(getegid())).map_err(io::Error::from)
    });
    if let Err(e) = owner {
        warn!(path = %path.display(), error = %e, "Cannot change owner of worker socket");
    }
}

fn retry_on_eintr<T>(mut op: impl FnMut() -> io::Result<T>) -> io::Result<T> {
    loop {
        match op() {
            Err(e) if e.raw_os_error() == Some(Errno::EINTR as i32) => continue,
            other => return other,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::MetadataExt;

    #[test]
    fn test_write_error_mapping() {
        let err = write_error("reload", ChannelError::InvalidElement("a\0b".to_string()));
        assert!(matches!(err, SpawnError::Configuration(_)));
        assert!(!err.is_helper_death());

        let err = write_error(
            "spawn_application",
            ChannelError::Io(io::ErrorKind::BrokenPipe.into()),
        );
        assert!(err.is_helper_death());
        assert!(err
            .to_string()
            .contains("Could not write 'spawn_application' command"));
    }

    #[test]
    fn test_read_error_mapping() {
        assert!(matches!(
            read_error(ChannelError::UnexpectedEof),
            SpawnError::HelperExited
        ));
        assert!(matches!(
            read_error(ChannelError::MissingDescriptor),
            SpawnError::Protocol(_)
        ));
        assert!(read_error(ChannelError::Malformed("x".to_string())).is_helper_death());
    }

    #[test]
    fn test_restrict_socket_permissions() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("worker.sock");
        let _listener = std::os::unix::net::UnixListener::bind(&path).unwrap();
        std::fs::set_permissions(&path, Permissions::from_mode(0o777)).unwrap();

        restrict_socket_permissions(&path);

        let meta = std::fs::metadata(&path).unwrap();
        assert_eq!(meta.mode() & 0o777, 0o600);
        assert_eq!(meta.uid(), geteuid().as_raw());
    }

    #[test]
    fn test_restrict_missing_socket_does_not_panic() {
        restrict_socket_permissions(Path::new("/nonexistent/berth/worker.sock"));
    }

    #[test]
    fn test_retry_on_eintr() {
        let mut calls = 0;
        let result = retry_on_eintr(|| {
            calls += 1;
            if calls < 3 {
                Err(io::Error::from(nix::errno::Errno::EINTR))
            } else {
                Ok(calls)
            }
        });
        assert_eq!(result.unwrap(), 3);
    }
}
