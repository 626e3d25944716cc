//! Greeter protocol server.
//!
//! Each greeter is launched with a pipe pair instead of connecting to a
//! socket. When a display starts its greeter it hands the daemon-side ends
//! to [`GreeterServer::attach`], which spawns a [`ConnectionHandler`] for
//! them and returns the outbox the display pushes messages through.
//!
//! ```text
//!   Display ──start greeter──▶ ChildPipes
//!      │                           │ attach()
//!      │ outbox (mpsc)             ▼
//!      └──────────────▶ ┌─────────────────────┐     ┌──────────────┐
//!                       │  ConnectionHandler  │────▶│ DaemonHandle │
//!   greeter ◀── JSON ───│    (per greeter)    │     └──────────────┘
//!                       └─────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - A greeter whose pipes cannot be wrapped simply gets no connection;
//!   it will exit and the display reacts to that

mod connection;

pub use connection::{ConnectionError, ConnectionHandler};

use std::path::PathBuf;
use std::sync::Arc;

use tokio::net::unix::pipe;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use ldm_core::{DaemonConfig, DisplayId, IdentitySource, UserFilter, XKB_RULES_LIST};
use ldm_protocol::DaemonMessage;

use crate::daemon::{DaemonCommand, DaemonEvent, DaemonHandle};
use crate::display::GreeterLink;
use crate::process::ChildPipes;

/// Read-only data greeters can query without involving the actor.
#[derive(Debug, Clone)]
pub struct QueryContext {
    pub identities: IdentitySource,
    pub user_filter: UserFilter,
    pub xsessions_directory: PathBuf,
    pub cache_directory: PathBuf,
    pub default_language: String,
    pub default_layout: String,
    pub default_session: String,
    /// XKB rules list the layouts are read from.
    pub layouts_file: PathBuf,
}

impl QueryContext {
    pub fn from_config(daemon: &DaemonConfig, identities: IdentitySource) -> Self {
        Self {
            identities,
            user_filter: UserFilter {
                minimum_uid: daemon.minimum_uid,
                hidden_users: daemon.hidden_users.clone(),
                hidden_shells: daemon.hidden_shells.clone(),
            },
            xsessions_directory: daemon.xsessions_directory.clone(),
            cache_directory: daemon.cache_directory.clone(),
            default_language: daemon.default_language.clone(),
            default_layout: daemon.default_layout.clone(),
            default_session: daemon.default_xsession.clone(),
            layouts_file: PathBuf::from(XKB_RULES_LIST),
        }
    }
}

/// Wires greeter pipes to protocol handlers.
///
/// Holds only a weak reference to the actor's command channel so the
/// actor, which owns this server, does not keep itself alive.
pub struct GreeterServer {
    commands: mpsc::WeakSender<DaemonCommand>,
    events: broadcast::Sender<DaemonEvent>,
    stopped: CancellationToken,
    queries: Arc<QueryContext>,
}

impl GreeterServer {
    pub fn new(
        commands: mpsc::WeakSender<DaemonCommand>,
        events: broadcast::Sender<DaemonEvent>,
        stopped: CancellationToken,
        queries: QueryContext,
    ) -> Self {
        Self {
            commands,
            events,
            stopped,
            queries: Arc::new(queries),
        }
    }

    fn handle(&self) -> Option<DaemonHandle> {
        let sender = self.commands.upgrade()?;
        Some(DaemonHandle::new(
            sender,
            self.events.clone(),
            self.stopped.clone(),
        ))
    }
}

impl GreeterLink for GreeterServer {
    fn attach(
        &self,
        id: DisplayId,
        pipes: ChildPipes,
    ) -> Option<mpsc::UnboundedSender<DaemonMessage>> {
        let reader = match pipe::Receiver::from_owned_fd(pipes.from_child) {
            Ok(reader) => reader,
            Err(e) => {
                warn!(display = %id, error = %e, "Cannot read from greeter");
                return None;
            }
        };
        let writer = match pipe::Sender::from_owned_fd(pipes.to_child) {
            Ok(writer) => writer,
            Err(e) => {
                warn!(display = %id, error = %e, "Cannot write to greeter");
                return None;
            }
        };
        let Some(daemon) = self.handle() else {
            debug!(display = %id, "Daemon gone, not serving greeter");
            return None;
        };

        let (outbox, outbox_rx) = mpsc::unbounded_channel();
        let handler = ConnectionHandler::new(
            id,
            reader,
            writer,
            daemon,
            Arc::clone(&self.queries),
            outbox_rx,
        );
        tokio::spawn(handler.run());
        Some(outbox)
    }
}
