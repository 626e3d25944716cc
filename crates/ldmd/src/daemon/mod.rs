//! Daemon control loop using the Actor pattern.
//!
//! The [`DaemonActor`] owns every seat, display and supervised process.
//! Greeter connections talk to it through a [`DaemonHandle`]; children,
//! signals, PAM conversations and timers feed it through their own
//! channels.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────┐  DaemonCommand  ┌─────────────────┐  DaemonEvent  ┌─────────────┐
//! │ConnectionHandler │────(mpsc)──────▶│   DaemonActor   │──(broadcast)─▶│ subscribers │
//! └──────────────────┘                 │                 │               └─────────────┘
//!  process exits ─────────────────────▶│  Seat ─▶ Display│
//!  signals (self-pipe) ───────────────▶│  ProcessRegistry│
//!  PAM events, timers ────────────────▶│                 │
//!                                      └─────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()` or `.expect()` in production code
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

use std::sync::Arc;

use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::info;

use ldm_core::{IdentitySource, Keyring, LdmConfig};

mod actor;
mod commands;
mod handle;

pub use actor::DaemonActor;
pub use commands::{
    DaemonCommand, DaemonError, DaemonEvent, DaemonStatus, DisplayStatus, SeatStatus,
};
pub use handle::DaemonHandle;

use crate::display::DisplaySettings;
use crate::pam::AuthBackend;
use crate::process::{ProcessError, ProcessRegistry, SignalPipe};
use crate::seat::Seat;
use crate::server::{GreeterServer, QueryContext};
use crate::tracking::Tracker;
use actor::{Inbox, Services};

/// Channel buffer sizes
const COMMAND_BUFFER: usize = 100;
const EVENT_BUFFER: usize = 100;

/// Everything the daemon is started with.
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub config: LdmConfig,
    pub identities: IdentitySource,
    pub auth: AuthBackend,
    pub keyring: Keyring,
    /// Route SIGTERM, SIGINT, SIGHUP, SIGUSR1 and SIGUSR2 to the actor.
    /// Needed for X server readiness; tests may run without it.
    pub install_signals: bool,
}

impl DaemonOptions {
    pub fn new(config: LdmConfig) -> Self {
        Self {
            config,
            identities: IdentitySource::System,
            auth: AuthBackend::Pam,
            keyring: Keyring::default(),
            install_signals: true,
        }
    }
}

/// Spawn the daemon actor and return a handle for interaction.
///
/// Seats are started from within the actor, so their displays come up
/// shortly after this returns. Must be called from within a tokio runtime.
///
/// # Errors
///
/// Fails only if the signal handlers cannot be installed.
pub fn spawn_daemon(options: DaemonOptions) -> Result<DaemonHandle, ProcessError> {
    let DaemonOptions {
        config,
        identities,
        auth,
        keyring,
        install_signals,
    } = options;

    let signals = if install_signals {
        Some(SignalPipe::install()?)
    } else {
        None
    };

    let (cmd_tx, cmd_rx) = mpsc::channel(COMMAND_BUFFER);
    let (event_tx, _) = broadcast::channel(EVENT_BUFFER);
    let stopped = CancellationToken::new();

    let (registry, exits) = ProcessRegistry::new();
    let (pam_tx, pam_rx) = mpsc::unbounded_channel();
    let (timer_tx, timer_rx) = mpsc::unbounded_channel();

    let daemon_config = Arc::new(config.daemon.clone());
    let seats: Vec<Seat> = config
        .daemon
        .seats
        .iter()
        .map(|name| {
            let seat_config = config.seat_config(name);
            let settings = DisplaySettings::from_config(
                &config.daemon,
                &seat_config,
                identities.clone(),
                auth.clone(),
            );
            Seat::new(
                name,
                Arc::clone(&daemon_config),
                seat_config,
                keyring.clone(),
                settings,
            )
        })
        .collect();

    let greeters = GreeterServer::new(
        cmd_tx.downgrade(),
        event_tx.clone(),
        stopped.clone(),
        QueryContext::from_config(&config.daemon, identities),
    );
    let tracker = Tracker::new(config.daemon.session_tracking);
    info!(
        seats = seats.len(),
        session_tracking = tracker.is_enabled(),
        signals = signals.is_some(),
        "Spawning daemon"
    );

    let actor = DaemonActor::new(
        Inbox {
            commands: cmd_rx,
            exits,
            pam_events: pam_rx,
            timers: timer_rx,
            signals,
        },
        Services {
            registry,
            pam_events: pam_tx,
            timers: timer_tx,
            tracker,
            greeters: Box::new(greeters),
        },
        seats,
        event_tx.clone(),
        stopped.clone(),
    );
    tokio::spawn(actor.run());

    Ok(DaemonHandle::new(cmd_tx, event_tx, stopped))
}
