//! Protocol message types for greeter ↔ daemon communication.
//!
//! Messages are JSON objects, one per line, tagged by a `type` field.

use crate::version::ProtocolVersion;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Requests a greeter can send to the daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum GreeterRequest {
    /// Handshake; must be the first message.
    Connect,

    /// List of users to offer.
    GetUsers,

    /// List of selectable sessions.
    GetSessions,

    /// Installed languages.
    GetLanguages,

    /// Keyboard layouts.
    GetLayouts,

    /// Saved preferences of one user.
    GetUserDefaults { username: String },

    /// Begin a login conversation; an empty username lets PAM ask for it.
    StartAuthentication {
        #[serde(default)]
        username: String,
    },

    /// Answer the outstanding prompt.
    ProvideSecret { secret: String },

    /// Abort the login conversation.
    CancelAuthentication,

    /// Start the user session for an authenticated user. Empty session or
    /// language select the defaults.
    Login {
        username: String,
        #[serde(default)]
        session: String,
        #[serde(default)]
        language: String,
    },

    /// Ask whether a power action is permitted.
    CanPower { action: PowerAction },

    /// Trigger a power action.
    Power { action: PowerAction },

    /// Liveness check
    Ping {
        /// Sequence number for matching pong response
        seq: u64,
    },
}

/// Messages sent from greeter to daemon.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientMessage {
    /// Protocol version
    pub protocol_version: ProtocolVersion,

    /// Message payload
    #[serde(flatten)]
    pub message: GreeterRequest,
}

impl ClientMessage {
    /// Creates a new client message with current protocol version.
    pub fn new(message: GreeterRequest) -> Self {
        Self {
            protocol_version: ProtocolVersion::CURRENT,
            message,
        }
    }

    pub fn connect() -> Self {
        Self::new(GreeterRequest::Connect)
    }

    pub fn start_authentication(username: &str) -> Self {
        Self::new(GreeterRequest::StartAuthentication {
            username: username.to_string(),
        })
    }

    pub fn provide_secret(secret: &str) -> Self {
        Self::new(GreeterRequest::ProvideSecret {
            secret: secret.to_string(),
        })
    }

    pub fn cancel_authentication() -> Self {
        Self::new(GreeterRequest::CancelAuthentication)
    }

    pub fn login(username: &str, session: &str, language: &str) -> Self {
        Self::new(GreeterRequest::Login {
            username: username.to_string(),
            session: session.to_string(),
            language: language.to_string(),
        })
    }

    pub fn ping(seq: u64) -> Self {
        Self::new(GreeterRequest::Ping { seq })
    }
}

/// Power management actions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PowerAction {
    Suspend,
    Hibernate,
    Restart,
    Shutdown,
}

impl fmt::Display for PowerAction {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Self::Suspend => "suspend",
            Self::Hibernate => "hibernate",
            Self::Restart => "restart",
            Self::Shutdown => "shutdown",
        })
    }
}

/// A user offered by the greeter.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UserEntry {
    pub name: String,
    pub real_name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub image: Option<String>,
    pub logged_in: bool,
}

/// A selectable session.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionEntry {
    pub key: String,
    pub name: String,
    pub comment: String,
}

/// A keyboard layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LayoutEntry {
    pub name: String,
    pub description: String,
}

/// Messages sent from daemon to greeters.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum DaemonMessage {
    /// Handshake accepted; carries the display's greeter configuration.
    Connected {
        protocol_version: ProtocolVersion,
        theme: String,
        default_language: String,
        default_layout: String,
        default_session: String,
        /// User that will be logged in automatically, if any
        #[serde(skip_serializing_if = "Option::is_none")]
        timed_login_user: Option<String>,
        /// Seconds before the timed login fires
        timed_login_delay: u32,
    },

    /// Connection rejected (version mismatch, etc.)
    Rejected {
        /// Reason for rejection
        reason: String,
        /// Daemon's protocol version (for client to upgrade)
        protocol_version: ProtocolVersion,
    },

    UserList { users: Vec<UserEntry> },

    SessionList { sessions: Vec<SessionEntry> },

    LanguageList { languages: Vec<String> },

    LayoutList { layouts: Vec<LayoutEntry> },

    UserDefaults {
        language: String,
        layout: String,
        session: String,
    },

    /// The conversation asks for input.
    ShowPrompt {
        text: String,
        /// Whether the answer must not be echoed
        secret: bool,
    },

    /// Informational text from the conversation.
    ShowMessage { text: String },

    /// Error text from the conversation.
    ShowError { text: String },

    /// The login conversation finished.
    AuthenticationComplete {
        #[serde(skip_serializing_if = "Option::is_none")]
        username: Option<String>,
        is_authenticated: bool,
    },

    /// The default user's login delay elapsed.
    TimedLogin { username: String },

    /// The greeter should exit.
    Quit,

    PowerCapability { action: PowerAction, allowed: bool },

    PowerResult { action: PowerAction, performed: bool },

    /// Pong response to ping
    Pong {
        /// Sequence number from ping
        seq: u64,
    },

    /// Error response
    Error {
        /// Error message
        message: String,
        /// Error code (optional)
        #[serde(skip_serializing_if = "Option::is_none")]
        code: Option<String>,
    },
}

impl DaemonMessage {
    /// Creates a rejected response.
    pub fn rejected(reason: &str) -> Self {
        Self::Rejected {
            reason: reason.to_string(),
            protocol_version: ProtocolVersion::CURRENT,
        }
    }

    pub fn show_prompt(text: &str, secret: bool) -> Self {
        Self::ShowPrompt {
            text: text.to_string(),
            secret,
        }
    }

    pub fn authentication_complete(username: Option<String>, is_authenticated: bool) -> Self {
        Self::AuthenticationComplete {
            username,
            is_authenticated,
        }
    }

    /// Creates a pong response.
    pub fn pong(seq: u64) -> Self {
        Self::Pong { seq }
    }

    /// Creates an error response.
    pub fn error(message: &str) -> Self {
        Self::Error {
            message: message.to_string(),
            code: None,
        }
    }

    /// Creates an error response with code.
    pub fn error_with_code(message: &str, code: &str) -> Self {
        Self::Error {
            message: message.to_string(),
            code: Some(code.to_string()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_client_message_wire_format() {
        let msg = ClientMessage::login("alice", "gnome", "");
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"type\":\"login\""));
        assert!(json.contains("\"protocol_version\":{\"major\":1,\"minor\":0}"));
        assert!(json.contains("\"username\":\"alice\""));
    }

    #[test]
    fn test_optional_fields_default() {
        let parsed: ClientMessage = serde_json::from_str(
            r#"{"protocol_version":{"major":1,"minor":0},"type":"login","username":"bob"}"#,
        )
        .unwrap();
        assert_eq!(
            parsed.message,
            GreeterRequest::Login {
                username: "bob".to_string(),
                session: String::new(),
                language: String::new(),
            }
        );

        let parsed: ClientMessage = serde_json::from_str(
            r#"{"protocol_version":{"major":1,"minor":0},"type":"start_authentication"}"#,
        )
        .unwrap();
        assert_eq!(
            parsed.message,
            GreeterRequest::StartAuthentication {
                username: String::new()
            }
        );
    }

    #[test]
    fn test_power_action_names() {
        let msg = ClientMessage::new(GreeterRequest::CanPower {
            action: PowerAction::Hibernate,
        });
        let json = serde_json::to_string(&msg).unwrap();
        assert!(json.contains("\"action\":\"hibernate\""));
    }

    #[test]
    fn test_daemon_message_tags() {
        let json = serde_json::to_string(&DaemonMessage::show_prompt("Password:", true)).unwrap();
        assert_eq!(json, r#"{"type":"show_prompt","text":"Password:","secret":true}"#);

        let json = serde_json::to_string(&DaemonMessage::Quit).unwrap();
        assert_eq!(json, r#"{"type":"quit"}"#);

        let json =
            serde_json::to_string(&DaemonMessage::authentication_complete(None, false)).unwrap();
        assert_eq!(json, r#"{"type":"authentication_complete","is_authenticated":false}"#);
    }
}
