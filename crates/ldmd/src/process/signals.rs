//! Self-pipe for OS signals.
//!
//! The handler only writes `(signal, sender pid)` into a pipe. The control
//! loop reads it and decides whether the signal came from a supervised
//! child (e.g. an X server announcing readiness with SIGUSR1) or from the
//! outside world.

use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicI32, Ordering};

use nix::errno::Errno;
use nix::sys::signal::{sigaction, SaFlags, SigAction, SigHandler, SigSet, Signal};
use tokio::io::AsyncReadExt;
use tokio::net::unix::pipe;

use super::child::set_cloexec;
use super::ProcessError;

/// Signals routed through the pipe.
const HANDLED_SIGNALS: [Signal; 5] = [
    Signal::SIGTERM,
    Signal::SIGINT,
    Signal::SIGHUP,
    Signal::SIGUSR1,
    Signal::SIGUSR2,
];

const RECORD_LEN: usize = 8;

/// Write end used by the handler; -1 when no pipe is installed.
static WRITE_FD: AtomicI32 = AtomicI32::new(-1);

/// A signal and the pid that sent it (0 if unknown).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SignalEvent {
    pub signal: Signal,
    pub sender: u32,
}

/// Read side of the signal pipe.
#[derive(Debug)]
pub struct SignalPipe {
    reader: pipe::Receiver,
    _writer: OwnedFd,
}

impl SignalPipe {
    /// Creates the pipe and installs the handlers. Must be called from
    /// within a tokio runtime.
    pub fn install() -> Result<Self, ProcessError> {
        let (read, write) = nix::unistd::pipe().map_err(|e| ProcessError::Pipe(e.to_string()))?;
        set_cloexec(&read)?;
        set_cloexec(&write)?;
        set_nonblocking(&write)?;

        WRITE_FD.store(write.as_raw_fd(), Ordering::SeqCst);

        let action = SigAction::new(
            SigHandler::SigAction(on_signal),
            SaFlags::SA_SIGINFO | SaFlags::SA_RESTART,
            SigSet::empty(),
        );
        for signal in HANDLED_SIGNALS {
            // SAFETY: the handler only touches an atomic and calls write(2).
            unsafe { sigaction(signal, &action) }
                .map_err(|e| ProcessError::Pipe(format!("sigaction {signal}: {e}")))?;
        }

        let reader =
            pipe::Receiver::from_owned_fd(read).map_err(|e| ProcessError::Pipe(e.to_string()))?;

        Ok(Self {
            reader,
            _writer: write,
        })
    }

    /// Next signal; `None` if the pipe broke.
    pub async fn recv(&mut self) -> Option<SignalEvent> {
        loop {
            let mut record = [0u8; RECORD_LEN];
            self.reader.read_exact(&mut record).await.ok()?;

            let (signo, pid) = record.split_at(RECORD_LEN / 2);
            let signo = i32::from_ne_bytes(signo.try_into().ok()?);
            let pid = i32::from_ne_bytes(pid.try_into().ok()?);

            if let Ok(signal) = Signal::try_from(signo) {
                return Some(SignalEvent {
                    signal,
                    sender: u32::try_from(pid).unwrap_or(0),
                });
            }
        }
    }
}

impl Drop for SignalPipe {
    fn drop(&mut self) {
        WRITE_FD.store(-1, Ordering::SeqCst);
    }
}

extern "C" fn on_signal(signo: libc::c_int, info: *mut libc::siginfo_t, _context: *mut libc::c_void) {
    let fd = WRITE_FD.load(Ordering::SeqCst);
    if fd < 0 {
        return;
    }

    let saved = Errno::last_raw();
    let pid = if info.is_null() {
        0
    } else {
        // SAFETY: the kernel passes a valid siginfo_t with SA_SIGINFO.
        unsafe { (*info).si_pid() }
    };

    let mut record = [0u8; RECORD_LEN];
    let (a, b) = record.split_at_mut(RECORD_LEN / 2);
    a.copy_from_slice(&signo.to_ne_bytes());
    b.copy_from_slice(&pid.to_ne_bytes());

    // SAFETY: write(2) is async-signal-safe; a short or failed write drops
    // the signal, which is all a full non-blocking pipe allows.
    unsafe {
        libc::write(fd, record.as_ptr().cast(), record.len());
    }
    Errno::set_raw(saved);
}

fn set_nonblocking(fd: &OwnedFd) -> Result<(), ProcessError> {
    // SAFETY: fcntl on a descriptor we own.
    let flags = unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_GETFL) };
    // SAFETY: as above.
    if flags < 0 || unsafe { libc::fcntl(fd.as_raw_fd(), libc::F_SETFL, flags | libc::O_NONBLOCK) } < 0
    {
        return Err(ProcessError::Pipe(std::io::Error::last_os_error().to_string()));
    }
    Ok(())
}
