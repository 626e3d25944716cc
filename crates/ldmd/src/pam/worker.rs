//! Blocking PAM conversation on a dedicated thread.
//!
//! The worker owns the `pam_client::Context`. It reports prompts and the
//! final result as [`PamEvent`]s and blocks on a [`Handoff`] for answers and
//! for the owner's next instruction. Credentials it establishes live until
//! the owner closes the hand-off.
//!
//! Only the challenge is interactive. While the session is opened the owner
//! is blocked waiting for the reply, so prompts from session modules are
//! refused instead of forwarded.

use std::ffi::{CStr, CString};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::{self, JoinHandle};

use pam_client::{Context, ConversationHandler, ErrorCode, Flag};
use tracing::{debug, warn};

use super::handoff::Handoff;
use super::{AuthResult, Emitter, MessageStyle, PamError, PamEventKind, PamMessage};

/// Instructions from the owner.
#[derive(Debug)]
pub(crate) enum WorkerRequest {
    Answers(Vec<String>),
    Aborted,
    OpenSession,
}

/// Replies to session requests.
#[derive(Debug)]
pub(crate) enum WorkerReply {
    Opened(Result<Vec<(String, String)>, String>),
}

/// Whether the worker challenges the user first.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum WorkerMode {
    Authenticate,
    AuthorizeOnly,
}

/// Owner-side view of a running worker.
#[derive(Debug)]
pub(crate) struct WorkerLink {
    pub(crate) requests: Arc<Handoff<WorkerRequest>>,
    pub(crate) replies: Arc<Handoff<WorkerReply>>,
    thread: Option<JoinHandle<()>>,
}

impl WorkerLink {
    pub(crate) fn spawn(
        mode: WorkerMode,
        service: &str,
        username: Option<&str>,
        emitter: Emitter,
    ) -> Result<Self, PamError> {
        let requests = Arc::new(Handoff::new());
        let replies = Arc::new(Handoff::new());

        let worker = Worker {
            mode,
            service: service.to_string(),
            username: username.map(str::to_string),
            requests: Arc::clone(&requests),
            replies: Arc::clone(&replies),
            emitter,
        };

        let thread = thread::Builder::new()
            .name(format!("pam-{service}"))
            .spawn(move || worker.run())
            .map_err(|e| PamError::Worker(e.to_string()))?;

        Ok(Self {
            requests,
            replies,
            thread: Some(thread),
        })
    }

    /// Tells the worker to stop and detaches from it. Never blocks.
    pub(crate) fn shutdown(&mut self) {
        self.requests.close();
        self.replies.close();
        // The thread finishes on its own; PAM modules may be mid-delay.
        self.thread.take();
    }
}

struct Worker {
    mode: WorkerMode,
    service: String,
    username: Option<String>,
    requests: Arc<Handoff<WorkerRequest>>,
    replies: Arc<Handoff<WorkerReply>>,
    emitter: Emitter,
}

impl Worker {
    fn run(self) {
        let interactive = Arc::new(AtomicBool::new(self.mode == WorkerMode::Authenticate));
        let conversation = Conversation {
            emitter: self.emitter.clone(),
            requests: Arc::clone(&self.requests),
            interactive: Arc::clone(&interactive),
        };

        let mut context = match Context::new(&self.service, self.username.as_deref(), conversation)
        {
            Ok(context) => context,
            Err(e) => {
                warn!(service = %self.service, error = %e, "Failed to start PAM");
                self.fail(e.to_string());
                return;
            }
        };

        if self.mode == WorkerMode::Authenticate {
            let result = authenticate(&mut context);
            let username = context.user().ok().or_else(|| self.username.clone());
            let success = result.is_success();
            self.emitter.emit(PamEventKind::Result { result, username });
            if !success {
                self.replies.close();
                return;
            }

            match self.requests.take() {
                Some(WorkerRequest::OpenSession) => {}
                _ => {
                    debug!(service = %self.service, "Authenticated session discarded");
                    self.replies.close();
                    return;
                }
            }
        }

        interactive.store(false, Ordering::SeqCst);
        let mut session = match context.open_session(Flag::NONE) {
            Ok(session) => session,
            Err(e) => {
                let _ = self.replies.put(WorkerReply::Opened(Err(e.to_string())));
                return;
            }
        };

        let env: Vec<(String, String)> = session
            .envlist()
            .iter()
            .map(|item| {
                let (key, value) = item.key_value();
                (
                    key.to_string_lossy().into_owned(),
                    value.to_string_lossy().into_owned(),
                )
            })
            .collect();
        let _ = self.replies.put(WorkerReply::Opened(Ok(env)));

        // Hold the session until the owner lets go.
        while let Some(request) = self.requests.take() {
            if matches!(request, WorkerRequest::Aborted) {
                break;
            }
        }

        // Dropping the session closes it and deletes the credentials.
        drop(session);
        debug!(service = %self.service, "PAM session closed");
    }

    fn fail(&self, reason: String) {
        match self.mode {
            WorkerMode::Authenticate => self.emitter.emit(PamEventKind::Result {
                result: AuthResult::Failure(reason),
                username: self.username.clone(),
            }),
            WorkerMode::AuthorizeOnly => {
                let _ = self.replies.put(WorkerReply::Opened(Err(reason)));
            }
        }
    }
}

/// authenticate → acct_mgmt → (expired token) chauthtok.
fn authenticate(context: &mut Context<Conversation>) -> AuthResult {
    if let Err(e) = context.authenticate(Flag::NONE) {
        return AuthResult::Failure(e.to_string());
    }

    match context.acct_mgmt(Flag::NONE) {
        Ok(()) => AuthResult::Success,
        Err(e) if e.code() == ErrorCode::NEW_AUTHTOK_REQD => {
            match context.chauthtok(Flag::CHANGE_EXPIRED_AUTHTOK) {
                Ok(()) => AuthResult::Success,
                Err(e) => AuthResult::Failure(e.to_string()),
            }
        }
        Err(e) => AuthResult::Failure(e.to_string()),
    }
}

/// Conversation handler running on the worker thread.
struct Conversation {
    emitter: Emitter,
    requests: Arc<Handoff<WorkerRequest>>,
    interactive: Arc<AtomicBool>,
}

impl Conversation {
    fn ask(&mut self, style: MessageStyle, text: &CStr) -> Result<CString, ErrorCode> {
        if !self.interactive.load(Ordering::SeqCst) {
            warn!(prompt = %text.to_string_lossy(), "Refusing PAM prompt outside authentication");
            return Err(ErrorCode::CONV_ERR);
        }
        self.emitter.emit(PamEventKind::Messages(vec![PamMessage {
            style,
            text: text.to_string_lossy().into_owned(),
        }]));

        match self.requests.take() {
            Some(WorkerRequest::Answers(answers)) => answers
                .into_iter()
                .next()
                .and_then(|answer| CString::new(answer).ok())
                .ok_or(ErrorCode::CONV_ERR),
            _ => Err(ErrorCode::CONV_ERR),
        }
    }

    fn tell(&mut self, style: MessageStyle, text: &CStr) {
        self.emitter.emit(PamEventKind::Messages(vec![PamMessage {
            style,
            text: text.to_string_lossy().into_owned(),
        }]));
    }
}

impl ConversationHandler for Conversation {
    fn prompt_echo_on(&mut self, msg: &CStr) -> Result<CString, ErrorCode> {
        self.ask(MessageStyle::PromptEchoOn, msg)
    }

    fn prompt_echo_off(&mut self, msg: &CStr) -> Result<CString, ErrorCode> {
        self.ask(MessageStyle::PromptEchoOff, msg)
    }

    fn text_info(&mut self, msg: &CStr) {
        self.tell(MessageStyle::TextInfo, msg);
    }

    fn error_msg(&mut self, msg: &CStr) {
        self.tell(MessageStyle::ErrorMsg, msg);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use ldm_core::DisplayId;
    use tokio::sync::mpsc;

    use crate::pam::{PamEvent, PamSessionId};

    fn conversation(
        interactive: bool,
    ) -> (
        Conversation,
        Arc<Handoff<WorkerRequest>>,
        mpsc::UnboundedReceiver<PamEvent>,
    ) {
        let (tx, rx) = mpsc::unbounded_channel();
        let requests = Arc::new(Handoff::new());
        let conversation = Conversation {
            emitter: Emitter {
                display: DisplayId::new(1),
                session: PamSessionId::next(),
                tx,
            },
            requests: Arc::clone(&requests),
            interactive: Arc::new(AtomicBool::new(interactive)),
        };
        (conversation, requests, rx)
    }

    #[test]
    fn test_session_phase_prompt_refused_without_blocking() {
        let (mut conversation, requests, mut rx) = conversation(false);
        let prompt = CString::new("Token PIN:").unwrap();

        let result = conversation.prompt_echo_off(&prompt);
        assert!(matches!(result, Err(ErrorCode::CONV_ERR)));
        assert!(rx.try_recv().is_err());

        // Informational messages still reach the owner.
        conversation.text_info(&CString::new("Mounting home").unwrap());
        assert!(matches!(
            rx.try_recv().unwrap().kind,
            PamEventKind::Messages(_)
        ));
        assert!(requests.put(WorkerRequest::OpenSession).is_ok());
    }

    #[test]
    fn test_interactive_prompt_returns_answer() {
        let (mut conversation, requests, mut rx) = conversation(true);
        requests
            .put(WorkerRequest::Answers(vec!["secret".to_string()]))
            .unwrap();

        let Ok(answer) = conversation.prompt_echo_off(&CString::new("Password:").unwrap()) else {
            panic!("prompt was not answered");
        };
        assert_eq!(answer.to_str().unwrap(), "secret");
        match rx.try_recv().unwrap().kind {
            PamEventKind::Messages(messages) => {
                assert_eq!(messages[0].style, MessageStyle::PromptEchoOff);
                assert_eq!(messages[0].text, "Password:");
            }
            other => panic!("expected prompt, got {other:?}"),
        }
    }
}
