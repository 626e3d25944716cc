//! PAM sessions.
//!
//! A [`PamSession`] is bound to one (service, username) pair. The blocking
//! conversation runs on a worker thread; the owner only sees [`PamEvent`]s,
//! which are delivered over a channel into the control loop and applied with
//! [`PamSession::accept`].
//!
//! ```text
//! NotStarted ─start─▶ Authenticating ⇄ AwaitingResponse
//!     │                     │
//!     │                     ▼
//!     │               Completed{success}
//!     │ authorize           │ authorize (success only)
//!     └──────────▶ InSession ◀┘
//!                      │ end
//!                      ▼
//!                    Ended
//! ```

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};

use tokio::sync::mpsc;
use tracing::{debug, info};

use ldm_core::DisplayId;

mod handoff;
mod passwd;
mod worker;

pub use passwd::PasswdFileAuth;

use passwd::PasswdConversation;
use worker::{WorkerLink, WorkerMode, WorkerReply, WorkerRequest};

// ============================================================================
// Events
// ============================================================================

/// Identifier distinguishing conversations, so late events from an ended
/// session can be recognised and dropped.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PamSessionId(u64);

impl PamSessionId {
    fn next() -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        Self(NEXT.fetch_add(1, Ordering::Relaxed))
    }
}

impl fmt::Display for PamSessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pam-{}", self.0)
    }
}

/// Kind of conversation message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MessageStyle {
    PromptEchoOff,
    PromptEchoOn,
    ErrorMsg,
    TextInfo,
}

impl MessageStyle {
    pub fn is_prompt(self) -> bool {
        matches!(self, Self::PromptEchoOff | Self::PromptEchoOn)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PamMessage {
    pub style: MessageStyle,
    pub text: String,
}

/// Outcome of a challenge conversation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum AuthResult {
    Success,
    Failure(String),
}

impl AuthResult {
    pub fn is_success(&self) -> bool {
        matches!(self, Self::Success)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PamEventKind {
    /// A batch of prompts/info/errors; prompts need [`PamSession::respond`].
    Messages(Vec<PamMessage>),
    /// The conversation finished.
    Result {
        result: AuthResult,
        username: Option<String>,
    },
}

/// Conversation event, addressed to a display and session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PamEvent {
    pub display: DisplayId,
    pub session: PamSessionId,
    pub kind: PamEventKind,
}

/// Sending side of the event channel, bound to one session.
#[derive(Debug, Clone)]
pub(crate) struct Emitter {
    display: DisplayId,
    session: PamSessionId,
    tx: mpsc::UnboundedSender<PamEvent>,
}

impl Emitter {
    pub(crate) fn emit(&self, kind: PamEventKind) {
        let _ = self.tx.send(PamEvent {
            display: self.display,
            session: self.session,
            kind,
        });
    }
}

// ============================================================================
// Session
// ============================================================================

/// How identities are authenticated.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum AuthBackend {
    /// The system PAM stack.
    #[default]
    Pam,
    /// A flat passwd-format file (test mode).
    PasswdFile(PasswdFileAuth),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PamState {
    NotStarted,
    Authenticating,
    AwaitingResponse,
    Completed { success: bool },
    InSession,
    Ended,
}

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum PamError {
    #[error("conversation already started")]
    AlreadyStarted,

    #[error("no prompt is awaiting a response")]
    NotAwaitingResponse,

    #[error("conversation already produced a result")]
    ResultDelivered,

    #[error("session is not authorized")]
    NotAuthenticated,

    #[error("session already authorized")]
    AlreadyAuthorized,

    #[error("PAM worker failed: {0}")]
    Worker(String),

    #[error("failed to open session: {0}")]
    OpenSession(String),
}

#[derive(Debug)]
enum Engine {
    Idle,
    Worker(WorkerLink),
    PasswdFile(PasswdConversation),
}

/// Authentication and session handle for one (service, username) pair.
#[derive(Debug)]
pub struct PamSession {
    id: PamSessionId,
    service: String,
    username: Option<String>,
    backend: AuthBackend,
    state: PamState,
    engine: Engine,
    emitter: Emitter,
    env: Vec<(String, String)>,
}

impl PamSession {
    pub fn new(
        display: DisplayId,
        service: &str,
        username: Option<&str>,
        backend: &AuthBackend,
        events: mpsc::UnboundedSender<PamEvent>,
    ) -> Self {
        let id = PamSessionId::next();
        Self {
            id,
            service: service.to_string(),
            username: username.filter(|u| !u.is_empty()).map(str::to_string),
            backend: backend.clone(),
            state: PamState::NotStarted,
            engine: Engine::Idle,
            emitter: Emitter {
                display,
                session: id,
                tx: events,
            },
            env: Vec::new(),
        }
    }

    pub fn id(&self) -> PamSessionId {
        self.id
    }

    pub fn service(&self) -> &str {
        &self.service
    }

    /// The user being authenticated; filled in from the result when the
    /// conversation asked for it.
    pub fn username(&self) -> Option<&str> {
        self.username.as_deref()
    }

    pub fn state(&self) -> PamState {
        self.state
    }

    /// Environment attached by PAM while authorizing.
    pub fn env(&self) -> &[(String, String)] {
        &self.env
    }

    pub fn in_session(&self) -> bool {
        self.state == PamState::InSession
    }

    /// True while a challenge is running and has not produced a result.
    pub fn is_authenticating(&self) -> bool {
        matches!(
            self.state,
            PamState::Authenticating | PamState::AwaitingResponse
        )
    }

    /// Begins a challenge conversation.
    pub fn start(&mut self) -> Result<(), PamError> {
        if self.state != PamState::NotStarted {
            return Err(PamError::AlreadyStarted);
        }

        debug!(session = %self.id, service = %self.service, user = ?self.username, "Starting authentication");
        match &self.backend {
            AuthBackend::Pam => {
                let link = WorkerLink::spawn(
                    WorkerMode::Authenticate,
                    &self.service,
                    self.username.as_deref(),
                    self.emitter.clone(),
                )?;
                self.engine = Engine::Worker(link);
            }
            AuthBackend::PasswdFile(auth) => {
                let mut conversation =
                    PasswdConversation::new(auth.clone(), &self.service, self.username.as_deref());
                conversation.start(&self.emitter);
                self.engine = Engine::PasswdFile(conversation);
            }
        }
        self.state = PamState::Authenticating;
        Ok(())
    }

    /// Applies an event from the conversation.
    ///
    /// Returns `false` for events that belong to another session or arrive
    /// after this one ended; callers must ignore those.
    pub fn accept(&mut self, event: &PamEvent) -> bool {
        if event.session != self.id || !self.is_authenticating() {
            return false;
        }

        match &event.kind {
            PamEventKind::Messages(messages) => {
                if messages.iter().any(|m| m.style.is_prompt()) {
                    self.state = PamState::AwaitingResponse;
                }
            }
            PamEventKind::Result { result, username } => {
                if let Some(name) = username.as_deref().filter(|n| !n.is_empty()) {
                    self.username = Some(name.to_string());
                }
                self.state = PamState::Completed {
                    success: result.is_success(),
                };
                info!(
                    session = %self.id,
                    service = %self.service,
                    user = ?self.username,
                    success = result.is_success(),
                    "Authentication finished"
                );
            }
        }
        true
    }

    /// Answers the outstanding prompt.
    pub fn respond(&mut self, answers: Vec<String>) -> Result<(), PamError> {
        match self.state {
            PamState::AwaitingResponse => {}
            PamState::Completed { .. } | PamState::InSession | PamState::Ended => {
                return Err(PamError::ResultDelivered)
            }
            PamState::NotStarted | PamState::Authenticating => {
                return Err(PamError::NotAwaitingResponse)
            }
        }

        self.state = PamState::Authenticating;
        match &mut self.engine {
            Engine::Worker(link) => link
                .requests
                .put(WorkerRequest::Answers(answers))
                .map_err(|_| PamError::Worker("answer slot occupied".to_string())),
            Engine::PasswdFile(conversation) => {
                conversation.respond(answers, &self.emitter);
                Ok(())
            }
            Engine::Idle => Err(PamError::NotAwaitingResponse),
        }
    }

    /// Aborts a running challenge. The conversation still finishes with a
    /// (failed) result event.
    pub fn cancel(&mut self) {
        if !self.is_authenticating() {
            return;
        }
        debug!(session = %self.id, "Cancelling authentication");
        match &mut self.engine {
            Engine::Worker(link) => link.requests.replace(WorkerRequest::Aborted),
            Engine::PasswdFile(conversation) => conversation.cancel(&self.emitter),
            Engine::Idle => {}
        }
    }

    /// Establishes credentials and opens the session.
    ///
    /// Valid on a fresh session (pre-authorized, no challenge) or after a
    /// successful challenge. A session is never authorized twice.
    pub fn authorize(&mut self) -> Result<(), PamError> {
        match self.state {
            PamState::NotStarted | PamState::Completed { success: true } => {}
            PamState::InSession => return Err(PamError::AlreadyAuthorized),
            _ => return Err(PamError::NotAuthenticated),
        }

        let env = match &self.backend {
            AuthBackend::PasswdFile(_) => Vec::new(),
            AuthBackend::Pam => {
                match &mut self.engine {
                    Engine::Worker(link) => link
                        .requests
                        .put(WorkerRequest::OpenSession)
                        .map_err(|_| PamError::Worker("request slot occupied".to_string()))?,
                    _ => {
                        self.engine = Engine::Worker(WorkerLink::spawn(
                            WorkerMode::AuthorizeOnly,
                            &self.service,
                            self.username.as_deref(),
                            self.emitter.clone(),
                        )?);
                    }
                }
                match &mut self.engine {
                    Engine::Worker(link) => wait_opened(link)?,
                    _ => Vec::new(),
                }
            }
        };

        self.env = env;
        self.state = PamState::InSession;
        info!(session = %self.id, service = %self.service, user = ?self.username, "Session authorized");
        Ok(())
    }

    /// Ends the session. Credentials established by [`authorize`] are
    /// withdrawn exactly once; ending an idle session does nothing.
    ///
    /// [`authorize`]: PamSession::authorize
    pub fn end(&mut self) {
        match self.state {
            PamState::Ended | PamState::NotStarted => return,
            PamState::InSession => {
                // The worker closes the session once its hand-off is closed.
                info!(session = %self.id, user = ?self.username, "Session ended");
            }
            _ => {
                debug!(session = %self.id, "Conversation abandoned");
            }
        }

        if let Engine::Worker(link) = &mut self.engine {
            link.shutdown();
        }
        self.engine = Engine::Idle;
        self.state = PamState::Ended;
    }
}

impl Drop for PamSession {
    fn drop(&mut self) {
        self.end();
    }
}

fn wait_opened(link: &mut WorkerLink) -> Result<Vec<(String, String)>, PamError> {
    match link.replies.take() {
        Some(WorkerReply::Opened(Ok(env))) => Ok(env),
        Some(WorkerReply::Opened(Err(reason))) => {
            link.shutdown();
            Err(PamError::OpenSession(reason))
        }
        _ => {
            link.shutdown();
            Err(PamError::Worker("worker exited before opening the session".to_string()))
        }
    }
}
