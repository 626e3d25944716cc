//! Daemon actor commands, errors, and events.
//!
//! - `DaemonCommand`: requests sent to the actor (mostly on behalf of a
//!   greeter connection)
//! - `DaemonError`: what those requests can fail with
//! - `DaemonEvent`: display lifecycle changes published to subscribers

use ldm_core::{DisplayId, DisplayState};
use ldm_protocol::DaemonMessage;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::oneshot;

use crate::display::DisplayError;

// ============================================================================
// Daemon Commands
// ============================================================================

/// Commands sent to the daemon actor.
///
/// Each command carries a oneshot channel for the response.
#[derive(Debug)]
pub enum DaemonCommand {
    /// A greeter finished its handshake; answers with the greeting.
    GreeterConnected {
        display: DisplayId,
        respond_to: oneshot::Sender<Result<DaemonMessage, DaemonError>>,
    },

    /// Begin a login conversation on a display.
    ///
    /// # Errors
    /// - `DaemonError::Display(AuthenticationInProgress)` while another
    ///   conversation on the display has not finished
    StartAuthentication {
        display: DisplayId,
        username: String,
        respond_to: oneshot::Sender<Result<(), DaemonError>>,
    },

    /// Answer the outstanding prompt of a display's login conversation.
    ProvideSecret {
        display: DisplayId,
        secret: String,
        respond_to: oneshot::Sender<Result<(), DaemonError>>,
    },

    CancelAuthentication {
        display: DisplayId,
        respond_to: oneshot::Sender<Result<(), DaemonError>>,
    },

    /// Start the session of the user authenticated on a display.
    ///
    /// # Errors
    /// - `DaemonError::Display(NotAuthenticated)` unless the display's login
    ///   conversation succeeded for that user
    Login {
        display: DisplayId,
        username: String,
        session: String,
        language: String,
        respond_to: oneshot::Sender<Result<(), DaemonError>>,
    },

    /// Users with a session on any display.
    LoggedInUsers {
        respond_to: oneshot::Sender<Vec<String>>,
    },

    /// Snapshot of seats and displays.
    Status {
        respond_to: oneshot::Sender<DaemonStatus>,
    },

    /// Stop every seat and terminate all children. The actor exits once
    /// they are gone.
    Shutdown {
        respond_to: oneshot::Sender<()>,
    },
}

// ============================================================================
// Daemon Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("display not found: {0}")]
    DisplayNotFound(DisplayId),

    #[error(transparent)]
    Display(#[from] DisplayError),

    #[error("daemon channel closed")]
    ChannelClosed,
}

// ============================================================================
// Daemon Events
// ============================================================================

/// Display lifecycle changes, published after every handled event.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DaemonEvent {
    DisplayAdded {
        seat: String,
        display: DisplayId,
    },
    StateChanged {
        display: DisplayId,
        state: DisplayState,
    },
    DisplayRemoved {
        seat: String,
        display: DisplayId,
    },
    /// All children are gone after a shutdown.
    Stopped,
}

// ============================================================================
// Status
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DisplayStatus {
    pub id: DisplayId,
    pub address: String,
    pub state: DisplayState,
    pub vt: Option<u32>,
    pub greeter_pid: Option<u32>,
    pub session_pid: Option<u32>,
    pub session_user: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct SeatStatus {
    pub name: String,
    pub active: Option<DisplayId>,
    pub stopping: bool,
    pub displays: Vec<DisplayStatus>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct DaemonStatus {
    pub seats: Vec<SeatStatus>,
    /// Live supervised processes.
    pub processes: usize,
}

impl DaemonStatus {
    pub fn display(&self, id: DisplayId) -> Option<&DisplayStatus> {
        self.seats
            .iter()
            .flat_map(|seat| seat.displays.iter())
            .find(|d| d.id == id)
    }

    pub fn display_count(&self) -> usize {
        self.seats.iter().map(|seat| seat.displays.len()).sum()
    }
}
