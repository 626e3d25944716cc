//! Deterministic authentication against a passwd-format file.
//!
//! Replaces PAM when the daemon runs in test mode. The password field of
//! the file is compared verbatim; accounts with an empty password field and
//! configured passwordless services (autologin) succeed without a prompt.

use std::path::PathBuf;

use tracing::debug;

use ldm_core::read_passwd_file;

use super::{AuthResult, Emitter, MessageStyle, PamEventKind, PamMessage};

/// Configuration of the passwd-file backend.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PasswdFileAuth {
    pub path: PathBuf,
    /// Services that never challenge (e.g. the autologin service).
    pub passwordless_services: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Pending {
    Login,
    Password,
}

/// Conversation state; runs on the control loop, no thread needed.
#[derive(Debug)]
pub(crate) struct PasswdConversation {
    auth: PasswdFileAuth,
    service: String,
    username: Option<String>,
    pending: Option<Pending>,
}

impl PasswdConversation {
    pub(crate) fn new(auth: PasswdFileAuth, service: &str, username: Option<&str>) -> Self {
        Self {
            auth,
            service: service.to_string(),
            username: username.map(str::to_string),
            pending: None,
        }
    }

    pub(crate) fn start(&mut self, emitter: &Emitter) {
        if self.username.is_none() {
            self.prompt(emitter, Pending::Login, MessageStyle::PromptEchoOn, "login:");
        } else {
            self.after_username(emitter);
        }
    }

    pub(crate) fn respond(&mut self, answers: Vec<String>, emitter: &Emitter) {
        let answer = answers.into_iter().next().unwrap_or_default();
        match self.pending.take() {
            Some(Pending::Login) => {
                self.username = Some(answer);
                self.after_username(emitter);
            }
            Some(Pending::Password) => {
                let result = if self.password_matches(&answer) {
                    AuthResult::Success
                } else {
                    AuthResult::Failure("Authentication failure".to_string())
                };
                self.finish(emitter, result);
            }
            None => {}
        }
    }

    pub(crate) fn cancel(&mut self, emitter: &Emitter) {
        if self.pending.take().is_some() {
            self.finish(emitter, AuthResult::Failure("Conversation cancelled".to_string()));
        }
    }

    fn after_username(&mut self, emitter: &Emitter) {
        if self.auth.passwordless_services.contains(&self.service) {
            self.finish(emitter, AuthResult::Success);
            return;
        }
        if self.stored_password().as_deref() == Some("") {
            self.finish(emitter, AuthResult::Success);
            return;
        }
        self.prompt(emitter, Pending::Password, MessageStyle::PromptEchoOff, "Password:");
    }

    fn prompt(&mut self, emitter: &Emitter, pending: Pending, style: MessageStyle, text: &str) {
        self.pending = Some(pending);
        emitter.emit(PamEventKind::Messages(vec![PamMessage {
            style,
            text: text.to_string(),
        }]));
    }

    fn finish(&mut self, emitter: &Emitter, result: AuthResult) {
        debug!(
            service = %self.service,
            user = ?self.username,
            success = result.is_success(),
            "Passwd-file conversation finished"
        );
        emitter.emit(PamEventKind::Result {
            result,
            username: self.username.clone(),
        });
    }

    fn stored_password(&self) -> Option<String> {
        let name = self.username.as_deref()?;
        read_passwd_file(&self.auth.path)
            .ok()?
            .into_iter()
            .find(|entry| entry.user.name == name)
            .map(|entry| entry.password)
    }

    fn password_matches(&self, answer: &str) -> bool {
        self.stored_password().is_some_and(|stored| stored == answer)
    }
}
