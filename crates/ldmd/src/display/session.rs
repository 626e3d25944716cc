//! User sessions: launch after a successful login, teardown on exit.

use tracing::{debug, info, warn};

use ldm_core::{DisplayState, SessionDescriptor, UserSettings};
use ldm_protocol::DaemonMessage;

use super::{Display, DisplayContext, DisplayError, Timer, TimerKind, UserSession, USER_SESSION_TIMEOUT};
use crate::pam::PamSession;
use crate::process::{ChildProcess, ExitKind, ProcessKey, ProcessRole};
use crate::tracking::COOKIE_ENV;
use crate::xserver::XServerKind;

/// Where session output goes, relative to the user's home.
const SESSION_LOG: &str = ".xsession-errors";

impl Display {
    /// Handles the greeter's login request for an authenticated user.
    ///
    /// An empty `session` means the configured default, an empty `language`
    /// keeps the user's saved one. On failure the greeter stays up and is
    /// told why.
    pub async fn login(
        &mut self,
        username: &str,
        session: &str,
        language: &str,
        ctx: &mut DisplayContext<'_>,
    ) -> Result<(), DisplayError> {
        let session = if session.is_empty() {
            self.settings.default_session.clone()
        } else {
            session.to_string()
        };
        let language = Some(language).filter(|l| !l.is_empty());

        let authorized = self.state == DisplayState::GreeterAuthenticated
            && self.login.as_ref().is_some_and(|pam| {
                pam.in_session() && (username.is_empty() || pam.username() == Some(username))
            });
        if !authorized {
            warn!(display = %self.id, user = %username, "Ignoring request for login with unauthenticated user");
            return Err(DisplayError::NotAuthenticated {
                username: username.to_string(),
            });
        }
        let Some(pam) = self.login.take() else {
            return Err(DisplayError::NoAuthentication);
        };

        if let Err(e) = self.start_user_session(pam, &session, language, ctx).await {
            warn!(display = %self.id, user = %username, error = %e, "Failed to start user session");
            self.set_state(DisplayState::Greeter);
            self.send_to_greeter(DaemonMessage::ShowError {
                text: format!("Failed to start session: {e}"),
            });
            return Err(e);
        }

        if self.supports_transitions {
            self.session_timer = Some(Timer::arm(
                self.id,
                TimerKind::SessionGuard,
                USER_SESSION_TIMEOUT,
                ctx.timers,
            ));
        } else {
            self.request_greeter_quit();
        }
        Ok(())
    }

    /// Prepares the session for an authorized PAM session and launches it,
    /// or leaves it pending until the greeter has gone.
    pub(super) async fn start_user_session(
        &mut self,
        mut pam: PamSession,
        session: &str,
        language: Option<&str>,
        ctx: &mut DisplayContext<'_>,
    ) -> Result<(), DisplayError> {
        let settings = self.settings.clone();
        let username = pam.username().unwrap_or_default().to_string();
        info!(display = %self.id, session = %session, user = %username, "Launching session");
        self.login_count += 1;

        let user = match settings.identities.by_name(&username) {
            Ok(user) => user,
            Err(e) => {
                pam.end();
                return Err(e.into());
            }
        };

        let mut dmrc = UserSettings::load(&user, Some(settings.cache_directory.as_path()));
        dmrc.set_session(session);
        if let Some(language) = language {
            dmrc.set_language(language);
        }

        let descriptor = match SessionDescriptor::load(&settings.xsessions_directory, session) {
            Ok(descriptor) if !descriptor.exec.trim().is_empty() => descriptor,
            Ok(_) => {
                pam.end();
                return Err(DisplayError::EmptySession(session.to_string()));
            }
            Err(e) => {
                pam.end();
                return Err(e.into());
            }
        };
        let command = descriptor.command_line(settings.session_wrapper.as_deref());

        let tracking = ctx.tracker.open(&self.tracking_request(&user, "")).await;

        let mut process = ChildProcess::new();
        process.set_env("DISPLAY", &self.xserver.address());
        if let Some(cookie) = &tracking {
            process.set_env(COOKIE_ENV, cookie.as_str());
        }
        process.set_env("DESKTOP_SESSION", session);
        process.set_env("GDMSESSION", session);
        for (name, value) in [
            ("LANG", dmrc.language()),
            ("LANGUAGE", dmrc.language_list()),
            ("LC_MESSAGES", dmrc.lc_messages()),
            ("GDM_KEYBOARD_LAYOUT", dmrc.layout()),
        ] {
            if let Some(value) = value {
                process.set_env(name, value);
            }
        }
        if let Some(path) = self.client_authority(&user) {
            process.set_env("XAUTHORITY", &path.display().to_string());
        }
        for (name, value) in pam.env() {
            process.set_env(name, value);
        }
        process.set_log_file(user.home.join(SESSION_LOG));

        self.supports_transitions = descriptor.supports_transitions;
        self.session = Some(UserSession {
            user: user.clone(),
            session: session.to_string(),
            command,
            process,
            pam,
            tracking,
        });

        if self.greeter.is_none() || self.supports_transitions {
            if let Err(e) = self.launch_user_session(ctx) {
                self.abandon_user_session(ctx).await;
                return Err(e);
            }
        } else {
            debug!(display = %self.id, "Waiting for greeter to quit before starting user session process");
        }
        self.set_state(DisplayState::UserSession);

        if let Err(e) = dmrc.save(&user, Some(settings.cache_directory.as_path())) {
            warn!(display = %self.id, user = %user.name, error = %e, "Failed to save user settings");
        }
        Ok(())
    }

    /// Forks the prepared session process.
    pub(super) fn launch_user_session(
        &mut self,
        ctx: &mut DisplayContext<'_>,
    ) -> Result<(), DisplayError> {
        let Some(session) = self.session.as_mut() else {
            return Ok(());
        };
        let key = ProcessKey::new(self.id, ProcessRole::Session);
        session
            .process
            .start(ctx.registry, key, Some(&session.user), None, &session.command, false)?;
        info!(
            display = %self.id,
            user = %session.user.name,
            session = %session.session,
            pid = session.process.pid(),
            "User session started"
        );
        Ok(())
    }

    /// Drops a session that never ran.
    pub(super) async fn abandon_user_session(&mut self, ctx: &mut DisplayContext<'_>) {
        self.session_timer = None;
        if let Some(mut session) = self.session.take() {
            session.pam.end();
            if let Some(cookie) = session.tracking.take() {
                ctx.tracker.close(cookie).await;
            }
        }
    }

    pub(super) async fn session_exited(&mut self, kind: ExitKind, ctx: &mut DisplayContext<'_>) {
        let Some(mut session) = self.session.take() else {
            return;
        };
        match kind {
            ExitKind::Exited(0) => info!(display = %self.id, user = %session.user.name, "Session exited"),
            _ => warn!(display = %self.id, user = %session.user.name, exit = %kind, "Session exited unexpectedly"),
        }

        self.session_timer = None;
        session.process.mark_exited();
        session.pam.end();
        if let Some(cookie) = session.tracking.take() {
            ctx.tracker.close(cookie).await;
        }

        // A greeter still up from a transition would lose its X connection.
        if let Some(mut greeter) = self.greeter.take() {
            greeter.process.stop();
            greeter.pam.end();
            if let Some(cookie) = greeter.tracking.take() {
                ctx.tracker.close(cookie).await;
            }
        }

        self.set_state(DisplayState::GreeterPreConnect);
        self.xserver.disconnect_clients();
        if self.xserver.kind() == XServerKind::Remote {
            self.on_xserver_ready(ctx).await;
        }
    }
}
