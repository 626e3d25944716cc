//! Client interface for interacting with the DaemonActor.
//!
//! The `DaemonHandle` is a cheap-to-clone interface for sending commands to
//! the actor and subscribing to display events.
//!
//! # Panic-Free Guarantees
//!
//! Channel errors are mapped to `DaemonError::ChannelClosed`; nothing here
//! panics.

use tokio::sync::{broadcast, mpsc, oneshot};
use tokio_util::sync::CancellationToken;

use ldm_core::DisplayId;
use ldm_protocol::DaemonMessage;

use super::commands::{DaemonCommand, DaemonError, DaemonEvent, DaemonStatus};

/// Handle for interacting with the daemon actor.
#[derive(Clone)]
pub struct DaemonHandle {
    sender: mpsc::Sender<DaemonCommand>,
    event_sender: broadcast::Sender<DaemonEvent>,
    stopped: CancellationToken,
}

impl DaemonHandle {
    pub fn new(
        sender: mpsc::Sender<DaemonCommand>,
        event_sender: broadcast::Sender<DaemonEvent>,
        stopped: CancellationToken,
    ) -> Self {
        Self {
            sender,
            event_sender,
            stopped,
        }
    }

    /// Reports a completed greeter handshake; returns the greeting.
    pub async fn greeter_connected(&self, display: DisplayId) -> Result<DaemonMessage, DaemonError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(DaemonCommand::GreeterConnected {
                display,
                respond_to: tx,
            })
            .await
            .map_err(|_| DaemonError::ChannelClosed)?;

        rx.await.map_err(|_| DaemonError::ChannelClosed)?
    }

    /// Begins a login conversation.
    ///
    /// # Errors
    ///
    /// - `DaemonError::DisplayNotFound` if the display is gone
    /// - `DaemonError::Display` if the display refuses (e.g. a conversation
    ///   is already running)
    /// - `DaemonError::ChannelClosed` if the actor has shut down
    pub async fn start_authentication(
        &self,
        display: DisplayId,
        username: &str,
    ) -> Result<(), DaemonError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(DaemonCommand::StartAuthentication {
                display,
                username: username.to_string(),
                respond_to: tx,
            })
            .await
            .map_err(|_| DaemonError::ChannelClosed)?;

        rx.await.map_err(|_| DaemonError::ChannelClosed)?
    }

    pub async fn provide_secret(&self, display: DisplayId, secret: &str) -> Result<(), DaemonError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(DaemonCommand::ProvideSecret {
                display,
                secret: secret.to_string(),
                respond_to: tx,
            })
            .await
            .map_err(|_| DaemonError::ChannelClosed)?;

        rx.await.map_err(|_| DaemonError::ChannelClosed)?
    }

    pub async fn cancel_authentication(&self, display: DisplayId) -> Result<(), DaemonError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(DaemonCommand::CancelAuthentication {
                display,
                respond_to: tx,
            })
            .await
            .map_err(|_| DaemonError::ChannelClosed)?;

        rx.await.map_err(|_| DaemonError::ChannelClosed)?
    }

    /// Starts the authenticated user's session.
    pub async fn login(
        &self,
        display: DisplayId,
        username: &str,
        session: &str,
        language: &str,
    ) -> Result<(), DaemonError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(DaemonCommand::Login {
                display,
                username: username.to_string(),
                session: session.to_string(),
                language: language.to_string(),
                respond_to: tx,
            })
            .await
            .map_err(|_| DaemonError::ChannelClosed)?;

        rx.await.map_err(|_| DaemonError::ChannelClosed)?
    }

    /// Users with a session on any display. Empty if the actor is gone.
    pub async fn logged_in_users(&self) -> Vec<String> {
        let (tx, rx) = oneshot::channel();

        if self
            .sender
            .send(DaemonCommand::LoggedInUsers { respond_to: tx })
            .await
            .is_err()
        {
            return Vec::new();
        }

        rx.await.unwrap_or_default()
    }

    pub async fn status(&self) -> Result<DaemonStatus, DaemonError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(DaemonCommand::Status { respond_to: tx })
            .await
            .map_err(|_| DaemonError::ChannelClosed)?;

        rx.await.map_err(|_| DaemonError::ChannelClosed)
    }

    /// Starts shutdown. Use [`stopped`](DaemonHandle::stopped) to wait for
    /// it to finish.
    pub async fn shutdown(&self) -> Result<(), DaemonError> {
        let (tx, rx) = oneshot::channel();

        self.sender
            .send(DaemonCommand::Shutdown { respond_to: tx })
            .await
            .map_err(|_| DaemonError::ChannelClosed)?;

        rx.await.map_err(|_| DaemonError::ChannelClosed)
    }

    /// Subscribe to display lifecycle events.
    pub fn subscribe(&self) -> broadcast::Receiver<DaemonEvent> {
        self.event_sender.subscribe()
    }

    /// Cancelled when the actor has exited.
    pub fn stopped(&self) -> CancellationToken {
        self.stopped.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.is_cancelled()
    }
}
