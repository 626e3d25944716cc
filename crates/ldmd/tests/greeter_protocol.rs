//! Integration tests for the greeter protocol handler.
//!
//! The handler runs over an in-memory stream against a stand-in actor that
//! answers `DaemonCommand`s the way a display in the greeter state would.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

mod common;

use std::fs;
use std::sync::Arc;

use tokio::io::{
    duplex, split, AsyncBufReadExt, AsyncWriteExt, BufReader, DuplexStream, ReadHalf, WriteHalf,
};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tokio_util::sync::CancellationToken;

use ldm_core::{DisplayId, UserFilter};
use ldm_protocol::{ClientMessage, DaemonMessage, GreeterRequest, ProtocolVersion};
use ldmd::daemon::{DaemonCommand, DaemonError, DaemonHandle};
use ldmd::display::DisplayError;
use ldmd::server::{ConnectionHandler, QueryContext};

use common::{Fixture, EVENT_TIMEOUT};

const DISPLAY: u32 = 7;

// ============================================================================
// Test Helpers
// ============================================================================

/// Answers commands like a display showing its greeter, with alice logged
/// in elsewhere.
fn spawn_actor(mut commands: mpsc::Receiver<DaemonCommand>) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut authenticating: Option<String> = None;
        while let Some(command) = commands.recv().await {
            match command {
                DaemonCommand::GreeterConnected { respond_to, .. } => {
                    let _ = respond_to.send(Ok(DaemonMessage::Connected {
                        protocol_version: ProtocolVersion::CURRENT,
                        theme: "test".to_string(),
                        default_language: "en_US.UTF-8".to_string(),
                        default_layout: "us".to_string(),
                        default_session: "gnome".to_string(),
                        timed_login_user: None,
                        timed_login_delay: 0,
                    }));
                }
                DaemonCommand::StartAuthentication {
                    username,
                    respond_to,
                    ..
                } => {
                    let result = if authenticating.is_some() {
                        Err(DaemonError::Display(DisplayError::AuthenticationInProgress))
                    } else {
                        authenticating = Some(username);
                        Ok(())
                    };
                    let _ = respond_to.send(result);
                }
                DaemonCommand::CancelAuthentication { respond_to, .. } => {
                    authenticating = None;
                    let _ = respond_to.send(Ok(()));
                }
                DaemonCommand::ProvideSecret { respond_to, .. }
                | DaemonCommand::Login { respond_to, .. } => {
                    let _ = respond_to.send(Ok(()));
                }
                DaemonCommand::LoggedInUsers { respond_to } => {
                    let _ = respond_to.send(vec!["alice".to_string()]);
                }
                DaemonCommand::Status { .. } | DaemonCommand::Shutdown { .. } => {}
            }
        }
    })
}

fn queries(fixture: &Fixture) -> QueryContext {
    QueryContext {
        identities: fixture.identities(),
        user_filter: UserFilter {
            minimum_uid: 0,
            hidden_users: vec!["ldm-greeter".to_string()],
            hidden_shells: vec!["nologin".to_string()],
        },
        xsessions_directory: fixture.path("xsessions"),
        cache_directory: fixture.path("cache"),
        default_language: "en_US.UTF-8".to_string(),
        default_layout: "us".to_string(),
        default_session: "gnome".to_string(),
        layouts_file: fixture.path("base.lst"),
    }
}

/// The greeter's end of the connection.
struct Greeter {
    reader: BufReader<ReadHalf<DuplexStream>>,
    writer: WriteHalf<DuplexStream>,
    outbox: Option<mpsc::UnboundedSender<DaemonMessage>>,
    stopped: CancellationToken,
    handler: JoinHandle<()>,
}

impl Greeter {
    fn start(fixture: &Fixture) -> Self {
        let (commands, rx) = mpsc::channel(16);
        spawn_actor(rx);
        let (events, _) = broadcast::channel(16);
        let stopped = CancellationToken::new();
        let daemon = DaemonHandle::new(commands, events, stopped.clone());

        let (client, server) = duplex(64 * 1024);
        let (server_read, server_write) = split(server);
        let (client_read, client_write) = split(client);
        let (outbox, outbox_rx) = mpsc::unbounded_channel();

        let handler = ConnectionHandler::new(
            DisplayId::new(DISPLAY),
            server_read,
            server_write,
            daemon,
            Arc::new(queries(fixture)),
            outbox_rx,
        );

        Self {
            reader: BufReader::new(client_read),
            writer: client_write,
            outbox: Some(outbox),
            stopped,
            handler: tokio::spawn(handler.run()),
        }
    }

    /// Starts and completes the handshake.
    async fn connect(fixture: &Fixture) -> Self {
        let mut greeter = Self::start(fixture);
        greeter.send(ClientMessage::connect()).await;
        match greeter.recv().await {
            Some(DaemonMessage::Connected { theme, .. }) => assert_eq!(theme, "test"),
            other => panic!("expected connected, got {other:?}"),
        }
        greeter
    }

    async fn send(&mut self, msg: ClientMessage) {
        let json = serde_json::to_string(&msg).unwrap();
        self.send_raw(&json).await;
    }

    async fn send_raw(&mut self, line: &str) {
        self.writer.write_all(line.as_bytes()).await.unwrap();
        self.writer.write_all(b"\n").await.unwrap();
        self.writer.flush().await.unwrap();
    }

    async fn request(&mut self, request: GreeterRequest) -> DaemonMessage {
        self.send(ClientMessage::new(request)).await;
        self.recv().await.expect("reply")
    }

    /// Next message, or `None` once the daemon closed the connection.
    async fn recv(&mut self) -> Option<DaemonMessage> {
        let mut line = String::new();
        let n = timeout(EVENT_TIMEOUT, self.reader.read_line(&mut line))
            .await
            .expect("message in time")
            .unwrap();
        if n == 0 {
            return None;
        }
        Some(serde_json::from_str(&line).unwrap())
    }

    /// Waits for the handler to finish and for the stream to close.
    async fn expect_closed(mut self) {
        timeout(EVENT_TIMEOUT, &mut self.handler)
            .await
            .expect("handler finished")
            .unwrap();
        drop(self.outbox.take());
        assert_eq!(self.recv().await, None);
    }
}

fn error_message(msg: DaemonMessage) -> String {
    match msg {
        DaemonMessage::Error { message, .. } => message,
        other => panic!("expected error, got {other:?}"),
    }
}

// ============================================================================
// Handshake
// ============================================================================

#[tokio::test]
async fn test_handshake_and_ping() {
    let fixture = Fixture::new();
    let mut greeter = Greeter::connect(&fixture).await;

    assert_eq!(
        greeter.request(GreeterRequest::Ping { seq: 42 }).await,
        DaemonMessage::pong(42)
    );
}

#[tokio::test]
async fn test_version_mismatch_rejected() {
    let fixture = Fixture::new();
    let mut greeter = Greeter::start(&fixture);

    greeter
        .send_raw(r#"{"protocol_version":{"major":2,"minor":0},"type":"connect"}"#)
        .await;

    match greeter.recv().await {
        Some(DaemonMessage::Rejected {
            protocol_version, ..
        }) => assert_eq!(protocol_version, ProtocolVersion::CURRENT),
        other => panic!("expected rejection, got {other:?}"),
    }
    greeter.expect_closed().await;
}

#[tokio::test]
async fn test_first_message_must_be_connect() {
    let fixture = Fixture::new();
    let mut greeter = Greeter::start(&fixture);

    greeter.send(ClientMessage::ping(1)).await;

    let message = error_message(greeter.recv().await.unwrap());
    assert!(message.contains("Connect"));
    greeter.expect_closed().await;
}

#[tokio::test]
async fn test_second_connect_is_error() {
    let fixture = Fixture::new();
    let mut greeter = Greeter::connect(&fixture).await;

    let reply = greeter.request(GreeterRequest::Connect).await;
    assert_eq!(error_message(reply), "Already connected");
}

#[tokio::test]
async fn test_malformed_line_keeps_connection() {
    let fixture = Fixture::new();
    let mut greeter = Greeter::connect(&fixture).await;

    greeter.send_raw("this is not json").await;
    let message = error_message(greeter.recv().await.unwrap());
    assert!(message.starts_with("Parse error"));

    assert_eq!(
        greeter.request(GreeterRequest::Ping { seq: 2 }).await,
        DaemonMessage::pong(2)
    );
}

#[tokio::test]
async fn test_oversized_line_closes_connection() {
    let fixture = Fixture::new();
    let mut greeter = Greeter::connect(&fixture).await;
    drop(greeter.outbox.take());

    // Larger than any message, and never terminated: the handler must give
    // up instead of buffering it all.
    let payload = vec![b'a'; 2 * 1024 * 1024];
    let written = timeout(EVENT_TIMEOUT, greeter.writer.write_all(&payload)).await;
    assert!(matches!(written, Ok(Err(_))), "write was not refused: {written:?}");

    greeter.expect_closed().await;
}

#[tokio::test]
async fn test_daemon_stop_closes_connection() {
    let fixture = Fixture::new();
    let greeter = Greeter::connect(&fixture).await;

    greeter.stopped.cancel();
    greeter.expect_closed().await;
}

// ============================================================================
// Queries
// ============================================================================

#[tokio::test]
async fn test_sessions_hide_nodisplay_entries() {
    let fixture = Fixture::new();
    let mut greeter = Greeter::connect(&fixture).await;

    let DaemonMessage::SessionList { sessions } =
        greeter.request(GreeterRequest::GetSessions).await
    else {
        panic!("expected session list");
    };
    let keys: Vec<&str> = sessions.iter().map(|s| s.key.as_str()).collect();
    assert_eq!(keys, vec!["gnome", "smooth"]);
    assert_eq!(sessions[0].name, "GNOME");
    assert_eq!(sessions[0].comment, "The GNOME desktop");
}

#[tokio::test]
async fn test_users_marked_logged_in() {
    let fixture = Fixture::new();
    let mut greeter = Greeter::connect(&fixture).await;

    let DaemonMessage::UserList { users } = greeter.request(GreeterRequest::GetUsers).await else {
        panic!("expected user list");
    };
    let names: Vec<&str> = users.iter().map(|u| u.name.as_str()).collect();
    assert_eq!(names, vec!["alice", "bob"]);

    let alice = &users[0];
    assert_eq!(alice.real_name, "Alice Liddell");
    assert!(alice.logged_in);
    assert!(!users[1].logged_in);
}

#[tokio::test]
async fn test_user_defaults_from_dmrc() {
    let fixture = Fixture::new();
    fs::write(
        fixture.home("alice").join(".dmrc"),
        "[Desktop]\nSession=smooth\nLanguage=de_DE.UTF-8\n",
    )
    .unwrap();
    let mut greeter = Greeter::connect(&fixture).await;

    let reply = greeter
        .request(GreeterRequest::GetUserDefaults {
            username: "alice".to_string(),
        })
        .await;
    assert_eq!(
        reply,
        DaemonMessage::UserDefaults {
            language: "de_DE.UTF-8".to_string(),
            layout: "us".to_string(),
            session: "smooth".to_string(),
        }
    );

    // Unknown users get the configured defaults.
    let reply = greeter
        .request(GreeterRequest::GetUserDefaults {
            username: "mallory".to_string(),
        })
        .await;
    assert_eq!(
        reply,
        DaemonMessage::UserDefaults {
            language: "en_US.UTF-8".to_string(),
            layout: "us".to_string(),
            session: "gnome".to_string(),
        }
    );
}

#[tokio::test]
async fn test_layouts_from_rules_list() {
    let fixture = Fixture::new();
    fs::write(
        fixture.path("base.lst"),
        "! model\n  pc105  Generic 105-key PC\n\n! layout\n  us  English (US)\n  de  German\n\n! variant\n  dvorak  us: English (Dvorak)\n",
    )
    .unwrap();
    let mut greeter = Greeter::connect(&fixture).await;

    let DaemonMessage::LayoutList { layouts } = greeter.request(GreeterRequest::GetLayouts).await
    else {
        panic!("expected layout list");
    };
    let names: Vec<(&str, &str)> = layouts
        .iter()
        .map(|l| (l.name.as_str(), l.description.as_str()))
        .collect();
    assert_eq!(names, vec![("us", "English (US)"), ("de", "German")]);
}

#[tokio::test]
async fn test_missing_layouts_file_is_empty_list() {
    let fixture = Fixture::new();
    let mut greeter = Greeter::connect(&fixture).await;

    assert_eq!(
        greeter.request(GreeterRequest::GetLayouts).await,
        DaemonMessage::LayoutList { layouts: vec![] }
    );
}

#[tokio::test]
async fn test_languages_always_answered() {
    let fixture = Fixture::new();
    let mut greeter = Greeter::connect(&fixture).await;

    let reply = greeter.request(GreeterRequest::GetLanguages).await;
    let DaemonMessage::LanguageList { languages } = reply else {
        panic!("expected language list, got {reply:?}");
    };
    assert!(!languages.iter().any(|l| l == "C" || l == "POSIX"));
}

// ============================================================================
// Authentication routing
// ============================================================================

#[tokio::test]
async fn test_concurrent_authentication_reported() {
    let fixture = Fixture::new();
    let mut greeter = Greeter::connect(&fixture).await;

    greeter.send(ClientMessage::start_authentication("alice")).await;
    let reply = greeter
        .request(GreeterRequest::StartAuthentication {
            username: "bob".to_string(),
        })
        .await;
    assert_eq!(
        error_message(reply),
        "an authentication is already in progress"
    );

    greeter.send(ClientMessage::cancel_authentication()).await;
    greeter.send(ClientMessage::start_authentication("bob")).await;
    // Successful requests have no reply of their own.
    assert_eq!(
        greeter.request(GreeterRequest::Ping { seq: 3 }).await,
        DaemonMessage::pong(3)
    );
}

#[tokio::test]
async fn test_display_messages_forwarded() {
    let fixture = Fixture::new();
    let mut greeter = Greeter::connect(&fixture).await;
    let outbox = greeter.outbox.clone().unwrap();

    outbox
        .send(DaemonMessage::show_prompt("Password:", true))
        .unwrap();
    outbox
        .send(DaemonMessage::authentication_complete(Some("alice".to_string()), true))
        .unwrap();

    assert_eq!(
        greeter.recv().await,
        Some(DaemonMessage::show_prompt("Password:", true))
    );
    assert_eq!(
        greeter.recv().await,
        Some(DaemonMessage::authentication_complete(
            Some("alice".to_string()),
            true
        ))
    );
}
