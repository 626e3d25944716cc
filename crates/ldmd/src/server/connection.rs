//! Connection handler for one greeter.
//!
//! Each greeter gets its own `ConnectionHandler` that:
//! - Performs protocol version negotiation
//! - Answers stateless queries (users, sessions, languages, layouts, power)
//! - Routes login requests to the daemon actor
//! - Forwards messages the display pushes (prompts, results, quit)
//!
//! # Panic-Free Guarantees
//!
//! No `.unwrap()`, `.expect()`, `panic!()` or indexing. Connection errors
//! are logged and end the connection; the greeter's process exit is what
//! the display reacts to.

use std::sync::Arc;
use std::time::Duration;

use tokio::io::{
    AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, BufWriter,
};
use tokio::sync::{mpsc, Mutex};
use tokio::time::timeout;
use tracing::{debug, info, warn};

use ldm_core::{parse_locale_list, parse_xkb_layouts, DisplayId, SessionDescriptor, UserSettings};
use ldm_protocol::{
    ClientMessage, DaemonMessage, GreeterRequest, LayoutEntry, PowerAction, ProtocolVersion,
    SessionEntry, UserEntry,
};

use super::QueryContext;
use crate::daemon::DaemonHandle;
use crate::power;

/// Maximum message size (1 MB)
const MAX_MESSAGE_SIZE: usize = 1_048_576;

/// Write timeout (10 seconds)
const WRITE_TIMEOUT: Duration = Duration::from_secs(10);

type SharedWriter<W> = Arc<Mutex<BufWriter<W>>>;

/// Connection handler for a single greeter.
pub struct ConnectionHandler<R, W> {
    display: DisplayId,
    reader: BufReader<R>,
    writer: SharedWriter<W>,
    daemon: DaemonHandle,
    queries: Arc<QueryContext>,
    outbox: Option<mpsc::UnboundedReceiver<DaemonMessage>>,
}

impl<R, W> ConnectionHandler<R, W>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
{
    /// Creates a handler for the greeter of `display`.
    ///
    /// `outbox` carries messages the display sends on its own initiative.
    pub fn new(
        display: DisplayId,
        reader: R,
        writer: W,
        daemon: DaemonHandle,
        queries: Arc<QueryContext>,
        outbox: mpsc::UnboundedReceiver<DaemonMessage>,
    ) -> Self {
        Self {
            display,
            reader: BufReader::new(reader),
            writer: Arc::new(Mutex::new(BufWriter::new(writer))),
            daemon,
            queries,
            outbox: Some(outbox),
        }
    }

    /// Runs the connection until the greeter hangs up.
    pub async fn run(mut self) {
        debug!(display = %self.display, "Greeter connection opened");

        if let Some(outbox) = self.outbox.take() {
            tokio::spawn(forward_outbox(self.display, outbox, Arc::clone(&self.writer)));
        }

        if let Err(e) = self.handle_handshake().await {
            warn!(display = %self.display, error = %e, "Greeter handshake failed");
            return;
        }

        let stopped = self.daemon.stopped();
        tokio::select! {
            result = self.process_messages() => {
                if let Err(e) = result {
                    debug!(display = %self.display, error = %e, "Greeter connection closed");
                }
            }
            _ = stopped.cancelled() => {
                debug!(display = %self.display, "Daemon stopped, closing greeter connection");
            }
        }
        info!(display = %self.display, "Greeter disconnected");
    }

    /// Expects `connect`, checks the version and answers with the display's
    /// greeting.
    async fn handle_handshake(&mut self) -> Result<(), ConnectionError> {
        let msg = self.read_message().await?;

        if let Err(e) = msg.protocol_version.check() {
            warn!(
                display = %self.display,
                client_version = %msg.protocol_version,
                server_version = %ProtocolVersion::CURRENT,
                "Protocol version mismatch"
            );
            self.send_message(DaemonMessage::rejected(&e.to_string())).await?;
            return Err(ConnectionError::VersionMismatch {
                client: msg.protocol_version,
                server: ProtocolVersion::CURRENT,
            });
        }

        match msg.message {
            GreeterRequest::Connect => {
                let greeting = self
                    .daemon
                    .greeter_connected(self.display)
                    .await
                    .map_err(|e| ConnectionError::Daemon(e.to_string()))?;
                self.send_message(greeting).await
            }
            other => {
                self.send_message(DaemonMessage::error("Expected Connect message for handshake"))
                    .await?;
                Err(ConnectionError::UnexpectedMessage(format!("{other:?}")))
            }
        }
    }

    async fn process_messages(&mut self) -> Result<(), ConnectionError> {
        loop {
            let msg = match self.read_message().await {
                Ok(msg) => msg,
                Err(ConnectionError::Eof) => return Ok(()),
                Err(ConnectionError::ParseError(e)) => {
                    warn!(display = %self.display, error = %e, "Malformed greeter message");
                    self.send_message(DaemonMessage::error(&format!("Parse error: {e}")))
                        .await?;
                    continue;
                }
                Err(e) => return Err(e),
            };

            if let Err(e) = self.handle_message(msg.message).await {
                warn!(display = %self.display, error = %e, "Greeter request failed");
                self.send_message(DaemonMessage::error(&e.to_string())).await?;
            }
        }
    }

    async fn handle_message(&mut self, request: GreeterRequest) -> Result<(), ConnectionError> {
        match request {
            GreeterRequest::Connect => {
                self.send_message(DaemonMessage::error("Already connected")).await?;
            }

            GreeterRequest::GetUsers => {
                let logged_in = self.daemon.logged_in_users().await;
                let users = self.queries.users(&logged_in);
                self.send_message(DaemonMessage::UserList { users }).await?;
            }

            GreeterRequest::GetSessions => {
                let sessions = self.queries.sessions();
                self.send_message(DaemonMessage::SessionList { sessions }).await?;
            }

            GreeterRequest::GetLanguages => {
                let languages = self.queries.languages().await;
                self.send_message(DaemonMessage::LanguageList { languages }).await?;
            }

            GreeterRequest::GetLayouts => {
                let layouts = self.queries.layouts().await;
                self.send_message(DaemonMessage::LayoutList { layouts }).await?;
            }

            GreeterRequest::GetUserDefaults { username } => {
                let defaults = self.queries.user_defaults(&username);
                self.send_message(defaults).await?;
            }

            GreeterRequest::StartAuthentication { username } => {
                self.daemon
                    .start_authentication(self.display, &username)
                    .await
                    .map_err(|e| ConnectionError::Daemon(e.to_string()))?;
            }

            GreeterRequest::ProvideSecret { secret } => {
                self.daemon
                    .provide_secret(self.display, &secret)
                    .await
                    .map_err(|e| ConnectionError::Daemon(e.to_string()))?;
            }

            GreeterRequest::CancelAuthentication => {
                self.daemon
                    .cancel_authentication(self.display)
                    .await
                    .map_err(|e| ConnectionError::Daemon(e.to_string()))?;
            }

            GreeterRequest::Login {
                username,
                session,
                language,
            } => {
                self.daemon
                    .login(self.display, &username, &session, &language)
                    .await
                    .map_err(|e| ConnectionError::Daemon(e.to_string()))?;
            }

            GreeterRequest::CanPower { action } => {
                let allowed = power::can_perform(action).await;
                self.send_message(DaemonMessage::PowerCapability { action, allowed })
                    .await?;
            }

            GreeterRequest::Power { action } => {
                let performed = self.power(action).await;
                self.send_message(DaemonMessage::PowerResult { action, performed })
                    .await?;
            }

            GreeterRequest::Ping { seq } => {
                self.send_message(DaemonMessage::pong(seq)).await?;
            }
        }

        Ok(())
    }

    /// Runs `action` only if logind allows it.
    async fn power(&self, action: PowerAction) -> bool {
        if !power::can_perform(action).await {
            info!(display = %self.display, action = %action, "Power action not permitted");
            return false;
        }
        power::perform(action).await
    }

    async fn read_message(&mut self) -> Result<ClientMessage, ConnectionError> {
        let mut line = String::new();

        // One byte past the limit is enough to reject an oversized line.
        let limit = MAX_MESSAGE_SIZE as u64 + 1;
        let bytes_read = (&mut self.reader)
            .take(limit)
            .read_line(&mut line)
            .await
            .map_err(|e| ConnectionError::Io(e.to_string()))?;

        if bytes_read == 0 {
            return Err(ConnectionError::Eof);
        }

        if line.len() > MAX_MESSAGE_SIZE {
            return Err(ConnectionError::MessageTooLarge {
                size: line.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }

        let msg: ClientMessage = serde_json::from_str(&line)
            .map_err(|e| ConnectionError::ParseError(e.to_string()))?;

        debug!(
            display = %self.display,
            message_type = ?std::mem::discriminant(&msg.message),
            "Received message"
        );
        Ok(msg)
    }

    async fn send_message(&self, msg: DaemonMessage) -> Result<(), ConnectionError> {
        write_message(&self.writer, &msg).await
    }
}

/// Drains the display's outbox into the connection.
async fn forward_outbox<W>(
    id: DisplayId,
    mut outbox: mpsc::UnboundedReceiver<DaemonMessage>,
    writer: SharedWriter<W>,
) where
    W: AsyncWrite + Unpin + Send + 'static,
{
    while let Some(msg) = outbox.recv().await {
        if let Err(e) = write_message(&writer, &msg).await {
            debug!(display = %id, error = %e, "Stopped forwarding to greeter");
            return;
        }
    }
}

async fn write_message<W>(writer: &SharedWriter<W>, msg: &DaemonMessage) -> Result<(), ConnectionError>
where
    W: AsyncWrite + Unpin,
{
    let json = serde_json::to_string(msg).map_err(|e| ConnectionError::ParseError(e.to_string()))?;

    let mut writer = writer.lock().await;

    match timeout(WRITE_TIMEOUT, async {
        writer.write_all(json.as_bytes()).await?;
        writer.write_all(b"\n").await?;
        writer.flush().await?;
        Ok::<(), std::io::Error>(())
    })
    .await
    {
        Ok(Ok(())) => Ok(()),
        Ok(Err(e)) => Err(ConnectionError::Io(e.to_string())),
        Err(_) => Err(ConnectionError::WriteTimeout),
    }
}

// ============================================================================
// Queries
// ============================================================================

impl QueryContext {
    /// Login candidates, flagged when they have a running session.
    pub fn users(&self, logged_in: &[String]) -> Vec<UserEntry> {
        match self.identities.login_candidates(&self.user_filter) {
            Ok(users) => users
                .into_iter()
                .map(|user| UserEntry {
                    logged_in: logged_in.contains(&user.name),
                    real_name: user.real_name().to_string(),
                    image: user.image().map(|p| p.display().to_string()),
                    name: user.name,
                })
                .collect(),
            Err(e) => {
                warn!(error = %e, "Failed to list users");
                Vec::new()
            }
        }
    }

    pub fn sessions(&self) -> Vec<SessionEntry> {
        SessionDescriptor::list(&self.xsessions_directory)
            .into_iter()
            .map(|session| SessionEntry {
                key: session.key,
                name: session.name,
                comment: session.comment,
            })
            .collect()
    }

    /// Installed locales, from `locale -a`.
    pub async fn languages(&self) -> Vec<String> {
        match tokio::process::Command::new("locale").arg("-a").output().await {
            Ok(output) if output.status.success() => {
                parse_locale_list(&String::from_utf8_lossy(&output.stdout))
            }
            Ok(output) => {
                warn!(status = %output.status, "locale -a failed");
                Vec::new()
            }
            Err(e) => {
                warn!(error = %e, "Failed to run locale");
                Vec::new()
            }
        }
    }

    pub async fn layouts(&self) -> Vec<LayoutEntry> {
        match tokio::fs::read_to_string(&self.layouts_file).await {
            Ok(text) => parse_xkb_layouts(&text)
                .into_iter()
                .map(|layout| LayoutEntry {
                    name: layout.name,
                    description: layout.description,
                })
                .collect(),
            Err(e) => {
                warn!(path = %self.layouts_file.display(), error = %e, "Failed to read keyboard layouts");
                Vec::new()
            }
        }
    }

    /// Saved language, layout and session of `username`, with the
    /// configured defaults filling the gaps.
    pub fn user_defaults(&self, username: &str) -> DaemonMessage {
        let settings = self
            .identities
            .by_name(username)
            .ok()
            .map(|user| UserSettings::load(&user, Some(self.cache_directory.as_path())));
        let pick = |saved: Option<&str>, default: &str| {
            saved
                .filter(|v| !v.is_empty())
                .unwrap_or(default)
                .to_string()
        };

        DaemonMessage::UserDefaults {
            language: pick(
                settings.as_ref().and_then(|s| s.language()),
                &self.default_language,
            ),
            layout: pick(settings.as_ref().and_then(|s| s.layout()), &self.default_layout),
            session: pick(
                settings.as_ref().and_then(|s| s.session()),
                &self.default_session,
            ),
        }
    }
}

/// Errors that can occur during connection handling.
#[derive(Debug, thiserror::Error)]
pub enum ConnectionError {
    #[error("Protocol version mismatch: client {client}, server {server}")]
    VersionMismatch {
        client: ProtocolVersion,
        server: ProtocolVersion,
    },

    #[error("Unexpected message: {0}")]
    UnexpectedMessage(String),

    #[error("Parse error: {0}")]
    ParseError(String),

    #[error("I/O error: {0}")]
    Io(String),

    #[error("Connection closed")]
    Eof,

    #[error("Write timeout")]
    WriteTimeout,

    #[error("Message too large: {size} bytes (max: {max})")]
    MessageTooLarge { size: usize, max: usize },

    #[error("{0}")]
    Daemon(String),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_connection_error_display() {
        let err = ConnectionError::VersionMismatch {
            client: ProtocolVersion::new(2, 0),
            server: ProtocolVersion::new(1, 0),
        };
        assert!(err.to_string().contains("2.0"));
        assert!(err.to_string().contains("1.0"));
    }

    #[test]
    fn test_message_size_error() {
        let err = ConnectionError::MessageTooLarge {
            size: 2_000_000,
            max: MAX_MESSAGE_SIZE,
        };
        assert!(err.to_string().contains("2000000"));
    }
}
