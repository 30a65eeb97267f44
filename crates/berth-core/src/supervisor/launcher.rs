// ABOUTME: Starts the spawn-server helper process and tracks its pid.
// ABOUTME: Fork/exec with fd 3 as the control channel, log redirection, and privilege drop.

use std::ffi::c_long;
use std::fs::OpenOptions;
use std::io;
use std::os::fd::{AsFd, AsRawFd, OwnedFd, RawFd};
use std::os::unix::process::CommandExt;
use std::process::{Command, Stdio};

use nix::errno::Errno;
use nix::fcntl::{fcntl, FcntlArg, FdFlag};
use nix::sys::signal::{self, Signal};
use nix::sys::wait::{waitpid, WaitPidFlag, WaitStatus};
use nix::unistd::{self, Gid, Pid, SysconfVar, Uid, User};
use tracing::{debug, info, warn};

use crate::config::SpawnServerConfig;
use crate::error::SpawnError;

/// Descriptor number the helper reads its control channel from.
pub const CONTROL_FD: RawFd = 3;

/// Highest descriptor number scanned when marking inherited descriptors close-on-exec.
const MAX_FD_SCAN: RawFd = 65536;

/// Trailing argument that widens the helper's argv area so it can rename its
/// worker processes with longer titles. The helper ignores it.
const PROCESS_TITLE_PADDING: &str =
    "                                                             ";

/// A running helper process, as seen by the supervisor.
pub trait HelperProcess: Send {
    fn pid(&self) -> u32;

    /// Non-blocking exit check. Returns true once the process is gone.
    fn try_reap(&mut self) -> io::Result<bool>;

    /// Ask the process to exit (SIGTERM).
    fn terminate(&mut self) -> io::Result<()>;
}

/// Starts helper processes. `control` is the helper's end of a fresh socket pair;
/// the launcher owns it and must close its copy before returning.
pub trait HelperLauncher: Send + Sync {
    fn launch(&self, control: OwnedFd) -> Result<Box<dyn HelperProcess>, SpawnError>;
}

/// A helper started with fork/exec.
#[derive(Debug)]
pub struct ForkedHelper {
    pid: Pid,
    reaped: bool,
}

impl ForkedHelper {
    pub fn from_pid(pid: u32) -> Self {
        Self {
            pid: Pid::from_raw(pid as i32),
            reaped: false,
        }
    }
}

impl HelperProcess for ForkedHelper {
    fn pid(&self) -> u32 {
        self.pid.as_raw() as u32
    }

    fn try_reap(&mut self) -> io::Result<bool> {
        if self.reaped {
            return Ok(true);
        }
        match waitpid(self.pid, Some(WaitPidFlag::WNOHANG)) {
            Ok(WaitStatus::StillAlive) | Err(Errno::EINTR) => Ok(false),
            Ok(status) => {
                debug!(pid = %self.pid, ?status, "Spawn server exited");
                self.reaped = true;
                Ok(true)
            }
            Err(Errno::ECHILD) => {
                self.reaped = true;
                Ok(true)
            }
            Err(e) => Err(e.into()),
        }
    }

    fn terminate(&mut self) -> io::Result<()> {
        if self.reaped {
            return Ok(());
        }
        signal::kill(self.pid, Signal::SIGTERM).map_err(io::Error::from)
    }
}

/// Identity the child switches to before exec, resolved in the parent.
#[derive(Debug, Clone)]
struct ChildIdentity {
    uid: Uid,
    gid: Gid,
    groups: Vec<Gid>,
}

/// Production launcher: `interpreter server_script <padding>` with the control
/// socket on fd 3.
#[derive(Debug, Clone)]
pub struct ExecLauncher {
    config: SpawnServerConfig,
}

impl ExecLauncher {
    pub fn new(config: SpawnServerConfig) -> Self {
        Self { config }
    }

    fn resolve_identity(&self) -> Option<ChildIdentity> {
        let name = self.config.user.as_deref().filter(|u| !u.is_empty())?;

        if !unistd::geteuid().is_root() {
            debug!(user = name, "Not running as root, spawn server keeps the current user");
            return None;
        }

        let user = match User::from_name(name) {
            Ok(Some(user)) => user,
            Ok(None) => {
                warn!(user = name, "Cannot run the spawn server as nonexistent user, using the current user");
                return None;
            }
            Err(e) => {
                warn!(user = name, error = %e, "Cannot look up spawn server user, using the current user");
                return None;
            }
        };

        Some(ChildIdentity {
            uid: user.uid,
            gid: user.gid,
            groups: supplementary_groups(&user),
        })
    }
}

#[cfg(target_os = "linux")]
fn supplementary_groups(user: &User) -> Vec<Gid> {
    let groups = std::ffi::CString::new(user.name.as_str())
        .ok()
        .and_then(|name| unistd::getgrouplist(&name, user.gid).ok());
    groups.unwrap_or_else(|| {
        warn!(user = %user.name, "Cannot determine supplementary groups for the spawn server user");
        vec![user.gid]
    })
}

#[cfg(not(target_os = "linux"))]
fn supplementary_groups(user: &User) -> Vec<Gid> {
    vec![user.gid]
}

impl HelperLauncher for ExecLauncher {
    fn launch(&self, control: OwnedFd) -> Result<Box<dyn HelperProcess>, SpawnError> {
        let log_file = match &self.config.log_file {
            Some(path) => Some(
                OpenOptions::new()
                    .create(true)
                    .append(true)
                    .open(path)
                    .map_err(|e| {
                        SpawnError::setup(
                            format!("Cannot open log file '{}' for writing", path.display()),
                            e,
                        )
                    })?,
            ),
            None => None,
        };

        let identity = self.resolve_identity();
        let control_fd = control.as_raw_fd();
        let scan_limit = fd_scan_limit();

        let mut cmd = Command::new(&self.config.interpreter);
        cmd.arg(&self.config.server_script).arg(PROCESS_TITLE_PADDING);
        if let Some(file) = log_file {
            cmd.stderr(Stdio::from(file));
        }

        // Runs in the forked child: only async-signal-safe calls from here on.
        unsafe {
            cmd.pre_exec(move || prepare_child(control_fd, scan_limit, identity.as_ref()));
        }

        let child = cmd.spawn().map_err(|e| {
            SpawnError::setup(
                format!(
                    "Unable to start the spawn server '{} {}'",
                    self.config.interpreter,
                    self.config.server_script.display()
                ),
                e,
            )
        })?;
        drop(control);

        info!(
            pid = child.id(),
            interpreter = %self.config.interpreter,
            script = %self.config.server_script.display(),
            "Spawned spawn server"
        );
        Ok(Box::new(ForkedHelper::from_pid(child.id())))
    }
}

fn fd_scan_limit() -> RawFd {
    match unistd::sysconf(SysconfVar::OPEN_MAX) {
        Ok(Some(open_max)) if open_max > 0 => open_max.min(MAX_FD_SCAN as c_long) as RawFd,
        _ => 1024,
    }
}

/// Child-side setup between fork and exec: stdout follows stderr, the control
/// socket lands on fd 3 without close-on-exec, every higher descriptor is
/// marked close-on-exec, and privileges are dropped best-effort.
fn prepare_child(
    control_fd: RawFd,
    scan_limit: RawFd,
    identity: Option<&ChildIdentity>,
) -> io::Result<()> {
    unistd::dup2(STDERR_FD, STDOUT_FD)?;
    if control_fd != CONTROL_FD {
        unistd::dup2(control_fd, CONTROL_FD)?;
    }
    let flags = FdFlag::from_bits_truncate(fcntl(CONTROL_FD, FcntlArg::F_GETFD)?);
    fcntl(CONTROL_FD, FcntlArg::F_SETFD(flags - FdFlag::FD_CLOEXEC))?;

    for fd in (CONTROL_FD + 1)..scan_limit {
        if let Ok(bits) = fcntl(fd, FcntlArg::F_GETFD) {
            let flags = FdFlag::from_bits_truncate(bits);
            if !flags.contains(FdFlag::FD_CLOEXEC) {
                let _ = fcntl(fd, FcntlArg::F_SETFD(flags | FdFlag::FD_CLOEXEC));
            }
        }
    }

    if let Some(identity) = identity {
        drop_privileges(identity);
    }
    Ok(())
}

const STDOUT_FD: RawFd = 1;
const STDERR_FD: RawFd = 2;

/// Failures are reported on the helper's stderr and otherwise ignored.
fn drop_privileges(identity: &ChildIdentity) {
    #[cfg(not(target_vendor = "apple"))]
    if unistd::setgroups(&identity.groups).is_err() {
        write_stderr(b"*** berth: cannot set supplementary groups for the spawn server user\n");
    }
    if unistd::setgid(identity.gid).is_err() {
        write_stderr(b"*** berth: cannot run the spawn server as the requested group\n");
    }
    if unistd::setuid(identity.uid).is_err() {
        write_stderr(b"*** berth: cannot run the spawn server as the requested user\n");
    }
}

fn write_stderr(message: &[u8]) {
    let _ = unistd::write(io::stderr().as_fd(), message);
}
