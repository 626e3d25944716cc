//! Privilege-dropping child process launcher.

use std::collections::BTreeMap;
use std::ffi::CString;
use std::fs::File;
use std::os::fd::{AsRawFd, OwnedFd};
use std::os::unix::process::ExitStatusExt;
use std::path::{Path, PathBuf};
use std::process::Stdio;

use nix::sys::signal::{self, SigHandler, Signal};
use nix::unistd::{self, Gid, Pid, Uid};
use tokio::process::Command;
use tracing::{debug, warn};

use ldm_core::{userfile, User};
use ldm_protocol::{FROM_SERVER_FD_ENV, TO_SERVER_FD_ENV};

use super::{ExitKind, ProcessError, ProcessExit, ProcessKey, ProcessRegistry};

/// Signals whose disposition is reset to default in every child.
const RESET_SIGNALS: [Signal; 5] = [
    Signal::SIGTERM,
    Signal::SIGINT,
    Signal::SIGHUP,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
];

/// Log files are private to the process owner.
const LOG_MODE: u32 = 0o600;

/// Exit status of a child that failed to set itself up before exec.
const EXIT_SETUP_FAILED: libc::c_int = 1;

/// Daemon-side ends of the pipe pair handed to a child.
#[derive(Debug)]
pub struct ChildPipes {
    /// The daemon writes here; the child reads `LDM_FROM_SERVER_FD`.
    pub to_child: OwnedFd,
    /// The daemon reads here; the child writes `LDM_TO_SERVER_FD`.
    pub from_child: OwnedFd,
}

/// One supervised OS process.
///
/// Not started until [`ChildProcess::start`] succeeds; afterwards it stands
/// for exactly one live process until [`ChildProcess::mark_exited`] is called
/// for its exit event. Dropping a running instance sends it SIGTERM.
#[derive(Debug, Default)]
pub struct ChildProcess {
    pid: Option<u32>,
    env: BTreeMap<String, String>,
    log_file: Option<PathBuf>,
    ignored_signals: Vec<Signal>,
}

impl ChildProcess {
    pub fn new() -> Self {
        Self::default()
    }

    /// Process id, or 0 when not running.
    pub fn pid(&self) -> u32 {
        self.pid.unwrap_or(0)
    }

    pub fn is_running(&self) -> bool {
        self.pid.is_some()
    }

    pub fn set_env(&mut self, name: &str, value: &str) {
        self.env.insert(name.to_string(), value.to_string());
    }

    pub fn env(&self, name: &str) -> Option<&str> {
        self.env.get(name).map(String::as_str)
    }

    pub fn set_log_file(&mut self, path: impl Into<PathBuf>) {
        self.log_file = Some(path.into());
    }

    /// Leaves `signal` ignored in the child instead of resetting it.
    pub fn ignore_signal(&mut self, signal: Signal) {
        if !self.ignored_signals.contains(&signal) {
            self.ignored_signals.push(signal);
        }
    }

    /// Launches `command` as `identity`.
    ///
    /// When the daemon is privileged the child drops to `identity` before
    /// exec (supplementary groups, gid, uid, then the home directory);
    /// failing any of those steps kills the child, which then shows up as an
    /// ordinary exit event. With `wants_pipe` the returned [`ChildPipes`]
    /// connect to descriptors named in the child's environment.
    pub fn start(
        &mut self,
        registry: &mut ProcessRegistry,
        key: ProcessKey,
        identity: Option<&User>,
        working_dir: Option<&Path>,
        command: &str,
        wants_pipe: bool,
    ) -> Result<Option<ChildPipes>, ProcessError> {
        if let Some(pid) = self.pid {
            return Err(ProcessError::AlreadyRunning { pid });
        }
        if registry.is_stopping() {
            return Err(ProcessError::ShuttingDown);
        }

        let argv = shlex::split(command)
            .filter(|argv| !argv.is_empty())
            .ok_or_else(|| ProcessError::InvalidCommand(command.to_string()))?;
        let (program, args) = argv
            .split_first()
            .ok_or_else(|| ProcessError::InvalidCommand(command.to_string()))?;

        let privileged = unistd::getuid().is_root();
        let drop_to = match identity {
            Some(user) if privileged => Some(Privileges::for_user(user)?),
            _ => None,
        };
        let chdir_to = working_dir
            .map(Path::to_path_buf)
            .or_else(|| identity.map(|user| user.home.clone()));

        let mut cmd = Command::new(program);
        cmd.args(args).stdin(Stdio::null()).envs(&self.env);

        if let Some(path) = &self.log_file {
            let log = open_log_file(path, identity.filter(|_| privileged))?;
            let stderr = log.try_clone().map_err(|e| ProcessError::LogFile {
                path: path.clone(),
                reason: e.to_string(),
            })?;
            cmd.stdout(log).stderr(stderr);
        }

        let pipes = if wants_pipe {
            let pair = PipePair::new()?;
            cmd.env(TO_SERVER_FD_ENV, pair.child_write.as_raw_fd().to_string())
                .env(FROM_SERVER_FD_ENV, pair.child_read.as_raw_fd().to_string());
            Some(pair)
        } else {
            None
        };

        let ignored = self.ignored_signals.clone();
        // SAFETY: the closure runs between fork and exec and only performs
        // raw system calls on data prepared before the fork.
        unsafe {
            cmd.pre_exec(move || {
                prepare_child(drop_to.as_ref(), chdir_to.as_deref(), &ignored);
                Ok(())
            });
        }

        debug!(
            command,
            env = ?self.env,
            user = identity.map(|u| u.name.as_str()),
            "Launching process"
        );

        let mut child = cmd.spawn().map_err(|e| ProcessError::Spawn {
            command: command.to_string(),
            reason: e.to_string(),
        })?;
        let pid = child.id().ok_or_else(|| ProcessError::Spawn {
            command: command.to_string(),
            reason: "process exited before it was registered".to_string(),
        })?;

        self.pid = Some(pid);
        registry.insert(pid, key);

        let exits = registry.exit_sender();
        tokio::spawn(async move {
            let kind = match child.wait().await {
                Ok(status) => match (status.code(), status.signal()) {
                    (Some(code), _) => ExitKind::Exited(code),
                    (None, Some(signal)) => ExitKind::Terminated(signal),
                    (None, None) => ExitKind::Exited(-1),
                },
                Err(e) => {
                    warn!(pid, error = %e, "Failed to wait for process");
                    ExitKind::Exited(-1)
                }
            };
            let _ = exits.send(ProcessExit { pid, kind });
        });

        Ok(pipes.map(PipePair::into_daemon_ends))
    }

    /// Sends `signal` to the running process.
    pub fn signal(&self, signal: Signal) -> Result<(), ProcessError> {
        let Some(pid) = self.pid else {
            return Err(ProcessError::NotRunning);
        };
        let raw = i32::try_from(pid).map_err(|_| ProcessError::NotRunning)?;
        signal::kill(Pid::from_raw(raw), signal).map_err(|e| ProcessError::Signal {
            pid,
            reason: e.to_string(),
        })
    }

    /// Asks the process to terminate. A no-op when not running.
    pub fn stop(&self) {
        if self.pid.is_some() {
            if let Err(e) = self.signal(Signal::SIGTERM) {
                debug!(error = %e, "Failed to stop process");
            }
        }
    }

    /// Records that the process exited; clears the pid.
    pub fn mark_exited(&mut self) {
        self.pid = None;
    }
}

impl Drop for ChildProcess {
    fn drop(&mut self) {
        self.stop();
    }
}

// ============================================================================
// Child-side setup
// ============================================================================

/// Identity to assume in the child, resolved before forking.
#[derive(Debug)]
struct Privileges {
    name: CString,
    uid: Uid,
    gid: Gid,
}

impl Privileges {
    fn for_user(user: &User) -> Result<Self, ProcessError> {
        Ok(Self {
            name: CString::new(user.name.as_str())
                .map_err(|_| ProcessError::InvalidIdentity(user.name.clone()))?,
            uid: Uid::from_raw(user.uid),
            gid: Gid::from_raw(user.gid),
        })
    }
}

/// Runs in the forked child. Any failure ends the child immediately.
fn prepare_child(privileges: Option<&Privileges>, working_dir: Option<&Path>, ignored: &[Signal]) {
    for sig in RESET_SIGNALS {
        // SAFETY: resetting dispositions is async-signal-safe.
        let _ = unsafe { signal::signal(sig, SigHandler::SigDfl) };
    }
    for sig in ignored {
        // SAFETY: as above.
        let _ = unsafe { signal::signal(*sig, SigHandler::SigIgn) };
    }

    if unistd::setsid().is_err() {
        abort_child();
    }

    if let Some(p) = privileges {
        if unistd::initgroups(&p.name, p.gid).is_err()
            || unistd::setgid(p.gid).is_err()
            || unistd::setuid(p.uid).is_err()
        {
            abort_child();
        }
    }

    if let Some(dir) = working_dir {
        if unistd::chdir(dir).is_err() {
            abort_child();
        }
    }
}

fn abort_child() -> ! {
    // SAFETY: _exit is async-signal-safe and never returns.
    unsafe { libc::_exit(EXIT_SETUP_FAILED) }
}

fn open_log_file(path: &Path, owner: Option<&User>) -> Result<File, ProcessError> {
    userfile::create(path, LOG_MODE, owner).map_err(|e| ProcessError::LogFile {
        path: path.to_path_buf(),
        reason: e.to_string(),
    })
}

// ============================================================================
// Pipes
// ============================================================================

struct PipePair {
    child_read: OwnedFd,
    child_write: OwnedFd,
    daemon_read: OwnedFd,
    daemon_write: OwnedFd,
}

impl PipePair {
    fn new() -> Result<Self, ProcessError> {
        let pipe_error = |e: nix::Error| ProcessError::Pipe(e.to_string());
        let (child_read, daemon_write) = unistd::pipe().map_err(pipe_error)?;
        let (daemon_read, child_write) = unistd::pipe().map_err(pipe_error)?;
        set_cloexec(&daemon_read)?;
        set_cloexec(&daemon_write)?;
        Ok(Self {
            child_read,
            child_write,
            daemon_read,
            daemon_write,
        })
    }

    /// Closes the child's ends in the daemon.
    fn into_daemon_ends(self) -> ChildPipes {
        ChildPipes {
            to_child: self.daemon_write,
            from_child: self.daemon_read,
        }
    }
}

pub(crate) fn set_cloexec(fd: &OwnedFd) -> Result<(), ProcessError> {
    // SAFETY: fcntl on a descriptor we own.
    let rc = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFD, libc::FD_CLOEXEC) };
    if rc < 0 {
        return Err(ProcessError::Pipe(std::io::Error::last_os_error().to_string()));
    }
    Ok(())
}
