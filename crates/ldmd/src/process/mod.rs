//! Child process supervision.
//!
//! Every external program the daemon runs (X servers, greeters, user
//! sessions) is a [`ChildProcess`]. The [`ProcessRegistry`] maps live pids
//! to the component that owns them so exit events and signals can be routed
//! back through the control loop.
//!
//! ```text
//! ChildProcess::start ──fork/exec──▶ child
//!        │                             │ exit
//!        ▼                             ▼
//!  ProcessRegistry ◀── reap ── ProcessExit (mpsc) ── watch task
//! ```
//!
//! # Panic-Free Guarantees
//!
//! Nothing in this module panics. Failures inside a forked child end that
//! child with status 1 before exec.

use std::collections::HashMap;
use std::fmt;
use std::path::PathBuf;

use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use ldm_core::DisplayId;

mod child;
mod signals;

pub use child::{ChildPipes, ChildProcess};
pub use signals::{SignalEvent, SignalPipe};

/// What a supervised process is to its display.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProcessRole {
    XServer,
    Greeter,
    Session,
}

impl fmt::Display for ProcessRole {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::XServer => "xserver",
            Self::Greeter => "greeter",
            Self::Session => "session",
        })
    }
}

/// Non-owning reference from a pid to the component that launched it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ProcessKey {
    pub display: DisplayId,
    pub role: ProcessRole,
}

impl ProcessKey {
    pub fn new(display: DisplayId, role: ProcessRole) -> Self {
        Self { display, role }
    }
}

/// How a process ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ExitKind {
    /// Exited with a status code.
    Exited(i32),
    /// Killed by a signal.
    Terminated(i32),
}

impl fmt::Display for ExitKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Exited(code) => write!(f, "exited with status {code}"),
            Self::Terminated(signal) => write!(f, "terminated by signal {signal}"),
        }
    }
}

/// Exit notification produced by a process watch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ProcessExit {
    pub pid: u32,
    pub kind: ExitKind,
}

/// Result of [`ProcessRegistry::stop_all`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// Nothing was running; the daemon can exit now.
    Drained,
    /// This many processes were sent SIGTERM.
    Signalled(usize),
}

/// Errors from launching or signalling processes.
#[derive(Debug, thiserror::Error)]
pub enum ProcessError {
    #[error("process already running (pid {pid})")]
    AlreadyRunning { pid: u32 },

    #[error("process not running")]
    NotRunning,

    #[error("shutting down, not starting new processes")]
    ShuttingDown,

    #[error("invalid command line: {0:?}")]
    InvalidCommand(String),

    #[error("invalid identity: {0:?}")]
    InvalidIdentity(String),

    #[error("cannot open log file {}: {reason}", path.display())]
    LogFile { path: PathBuf, reason: String },

    #[error("pipe setup failed: {0}")]
    Pipe(String),

    #[error("failed to run {command:?}: {reason}")]
    Spawn { command: String, reason: String },

    #[error("failed to signal pid {pid}: {reason}")]
    Signal { pid: u32, reason: String },
}

/// Process-wide table of live children.
///
/// Owned by the control loop. Entries are added by [`ChildProcess::start`]
/// and removed exactly once by [`ProcessRegistry::reap`].
#[derive(Debug)]
pub struct ProcessRegistry {
    processes: HashMap<u32, ProcessKey>,
    stopping: bool,
    exits: mpsc::UnboundedSender<ProcessExit>,
}

impl ProcessRegistry {
    /// Creates an empty registry and the receiver for its exit events.
    pub fn new() -> (Self, mpsc::UnboundedReceiver<ProcessExit>) {
        let (exits, rx) = mpsc::unbounded_channel();
        (
            Self {
                processes: HashMap::new(),
                stopping: false,
                exits,
            },
            rx,
        )
    }

    pub(crate) fn insert(&mut self, pid: u32, key: ProcessKey) {
        debug!(pid, display = %key.display, role = %key.role, "Process registered");
        self.processes.insert(pid, key);
    }

    pub(crate) fn exit_sender(&self) -> mpsc::UnboundedSender<ProcessExit> {
        self.exits.clone()
    }

    /// Removes a pid after its exit event; `None` if it was not registered.
    pub fn reap(&mut self, pid: u32) -> Option<ProcessKey> {
        let key = self.processes.remove(&pid)?;
        debug!(pid, display = %key.display, role = %key.role, "Process reaped");
        Some(key)
    }

    pub fn lookup(&self, pid: u32) -> Option<ProcessKey> {
        self.processes.get(&pid).copied()
    }

    pub fn len(&self) -> usize {
        self.processes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.processes.is_empty()
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    /// True once shutdown started and every child is gone.
    pub fn is_drained(&self) -> bool {
        self.stopping && self.processes.is_empty()
    }

    /// Starts shutdown: SIGTERM to every registered process.
    ///
    /// Calling it again re-sends the signals; the registry stays in the
    /// stopping state either way.
    pub fn stop_all(&mut self) -> StopOutcome {
        self.stopping = true;

        if self.processes.is_empty() {
            info!("No processes running, stopping immediately");
            return StopOutcome::Drained;
        }

        info!(count = self.processes.len(), "Terminating all processes");
        for pid in self.processes.keys() {
            let Ok(raw) = i32::try_from(*pid) else {
                continue;
            };
            if let Err(e) = signal::kill(Pid::from_raw(raw), Signal::SIGTERM) {
                warn!(pid, error = %e, "Failed to send SIGTERM");
            }
        }
        StopOutcome::Signalled(self.processes.len())
    }
}
