//! Greeter lifecycle and the login conversations it drives.

use std::time::Duration;

use tracing::{debug, info, warn};

use ldm_core::{DisplayState, GreeterTheme};
use ldm_protocol::{DaemonMessage, ProtocolVersion};

use super::{Display, DisplayContext, DisplayError, Greeter, Timer, TimerKind};
use crate::pam::{MessageStyle, PamEvent, PamEventKind, PamSession};
use crate::process::{ChildProcess, ExitKind, ProcessKey, ProcessRole};
use crate::tracking::COOKIE_ENV;

/// Session type greeters are tracked as.
const GREETER_SESSION_TYPE: &str = "LoginWindow";

impl Display {
    /// Launches the greeter under its own pre-authorized identity.
    pub(super) async fn start_greeter(
        &mut self,
        ctx: &mut DisplayContext<'_>,
    ) -> Result<(), DisplayError> {
        let settings = self.settings.clone();
        let theme = GreeterTheme::load(&settings.themes_directory, &settings.greeter_theme)?;
        let user = match &settings.greeter_user {
            Some(name) => settings.identities.by_name(name)?,
            None => settings.identities.current()?,
        };

        info!(
            display = %self.id,
            theme = %theme.name,
            user = %user.name,
            "Starting greeter"
        );
        self.greeter_count += 1;

        let mut pam = PamSession::new(
            self.id,
            &settings.pam_service,
            Some(&user.name),
            &settings.auth,
            ctx.pam_events.clone(),
        );
        pam.authorize()?;

        let tracking = ctx
            .tracker
            .open(&self.tracking_request(&user, GREETER_SESSION_TYPE))
            .await;

        let mut process = ChildProcess::new();
        process.set_env("DISPLAY", &self.xserver.address());
        if let Some(cookie) = &tracking {
            process.set_env(COOKIE_ENV, cookie.as_str());
        }
        if let Some(path) = self.client_authority(&user) {
            process.set_env("XAUTHORITY", &path.display().to_string());
        }
        for (name, value) in pam.env() {
            process.set_env(name, value);
        }
        process.set_log_file(
            settings
                .log_directory
                .join(format!("{}-greeter.log", self.xserver.address())),
        );

        let key = ProcessKey::new(self.id, ProcessRole::Greeter);
        let pipes = match process.start(ctx.registry, key, Some(&user), None, &theme.command, true) {
            Ok(pipes) => pipes,
            Err(e) => {
                pam.end();
                if let Some(cookie) = tracking {
                    ctx.tracker.close(cookie).await;
                }
                return Err(e.into());
            }
        };
        let outbox = pipes.and_then(|pipes| ctx.greeters.attach(self.id, pipes));
        if outbox.is_none() {
            warn!(display = %self.id, "Greeter started without a connection");
        }

        self.greeter = Some(Greeter {
            user,
            process,
            pam,
            tracking,
            outbox,
            quit_requested: false,
        });
        self.set_state(DisplayState::Greeter);
        Ok(())
    }

    /// The greeter completed its handshake. Returns the greeting and arms
    /// the timed login when a default user has a delay.
    pub fn greeter_connected(&mut self, ctx: &mut DisplayContext<'_>) -> DaemonMessage {
        let settings = self.settings.clone();
        let timed_login_user = settings
            .default_user
            .clone()
            .filter(|_| settings.default_user_timeout > 0);

        if timed_login_user.is_some() && self.login_count == 0 {
            let delay = Duration::from_secs(u64::from(settings.default_user_timeout));
            debug!(display = %self.id, delay_secs = delay.as_secs(), "Arming timed login");
            self.timed_login_timer = Some(Timer::arm(self.id, TimerKind::TimedLogin, delay, ctx.timers));
        }

        info!(
            display = %self.id,
            user = ?self.greeter.as_ref().map(|g| g.user.name.as_str()),
            "Greeter connected"
        );
        DaemonMessage::Connected {
            protocol_version: ProtocolVersion::CURRENT,
            theme: settings.greeter_theme.clone(),
            default_language: settings.default_language.clone(),
            default_layout: settings.default_layout.clone(),
            default_session: settings.default_session.clone(),
            timed_login_delay: if timed_login_user.is_some() {
                settings.default_user_timeout
            } else {
                0
            },
            timed_login_user,
        }
    }

    // ------------------------------------------------------------------------
    // Autologin
    // ------------------------------------------------------------------------

    pub(super) fn start_autologin(
        &mut self,
        username: &str,
        ctx: &mut DisplayContext<'_>,
    ) -> Result<(), DisplayError> {
        info!(display = %self.id, user = %username, "Automatically logging in");
        let mut pam = PamSession::new(
            self.id,
            &self.settings.pam_autologin_service,
            Some(username),
            &self.settings.auth,
            ctx.pam_events.clone(),
        );
        pam.start()?;
        self.autologin = Some(pam);
        Ok(())
    }

    /// Autologin must finish without questions; any prompt aborts it and the
    /// failed result brings up a greeter.
    pub(super) async fn handle_autologin_event(
        &mut self,
        event: PamEvent,
        ctx: &mut DisplayContext<'_>,
    ) {
        let Some(pam) = self.autologin.as_mut() else {
            return;
        };
        if !pam.accept(&event) {
            return;
        }

        match event.kind {
            PamEventKind::Messages(messages) => {
                if messages.iter().any(|m| m.style.is_prompt()) {
                    info!(display = %self.id, "Aborting automatic login, PAM requests input");
                    pam.cancel();
                }
            }
            PamEventKind::Result { result, .. } => {
                let Some(mut pam) = self.autologin.take() else {
                    return;
                };
                if !result.is_success() {
                    info!(display = %self.id, "Failed to authorize default user, starting greeter");
                    pam.end();
                    self.show_greeter(ctx).await;
                    return;
                }

                if let Err(e) = pam.authorize() {
                    warn!(display = %self.id, error = %e, "Failed to open autologin session, starting greeter");
                    pam.end();
                    self.show_greeter(ctx).await;
                    return;
                }
                let session = self.settings.default_session.clone();
                if let Err(e) = self.start_user_session(pam, &session, None, ctx).await {
                    warn!(display = %self.id, error = %e, "Failed to start autologin session, starting greeter");
                    self.show_greeter(ctx).await;
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Login conversation
    // ------------------------------------------------------------------------

    /// Begins authenticating `username` (empty to let PAM ask for it).
    pub fn start_authentication(
        &mut self,
        username: &str,
        ctx: &mut DisplayContext<'_>,
    ) -> Result<(), DisplayError> {
        if !matches!(
            self.state,
            DisplayState::Greeter | DisplayState::GreeterAuthenticated
        ) {
            return Err(DisplayError::NotAcceptingLogins(self.state));
        }
        if self.login.as_ref().is_some_and(PamSession::is_authenticating) {
            warn!(display = %self.id, user = %username, "Rejecting concurrent authentication");
            return Err(DisplayError::AuthenticationInProgress);
        }

        self.timed_login_timer = None;
        if let Some(mut previous) = self.login.take() {
            previous.end();
        }
        self.set_state(DisplayState::Greeter);

        info!(display = %self.id, user = %username, "Starting authentication");
        let mut pam = PamSession::new(
            self.id,
            &self.settings.pam_service,
            Some(username),
            &self.settings.auth,
            ctx.pam_events.clone(),
        );
        pam.start()?;
        self.login = Some(pam);
        Ok(())
    }

    /// Answers the login conversation's outstanding prompt.
    pub fn provide_secret(&mut self, secret: &str) -> Result<(), DisplayError> {
        let pam = self.login.as_mut().ok_or(DisplayError::NoAuthentication)?;
        pam.respond(vec![secret.to_string()])?;
        Ok(())
    }

    pub fn cancel_authentication(&mut self) -> Result<(), DisplayError> {
        let pam = self.login.as_mut().ok_or(DisplayError::NoAuthentication)?;
        pam.cancel();
        Ok(())
    }

    pub(super) fn handle_login_event(&mut self, event: PamEvent) {
        let Some(pam) = self.login.as_mut() else {
            return;
        };
        if !pam.accept(&event) {
            return;
        }

        match event.kind {
            PamEventKind::Messages(messages) => {
                for message in messages {
                    let forwarded = match message.style {
                        MessageStyle::PromptEchoOff => DaemonMessage::show_prompt(&message.text, true),
                        MessageStyle::PromptEchoOn => DaemonMessage::show_prompt(&message.text, false),
                        MessageStyle::ErrorMsg => DaemonMessage::ShowError { text: message.text },
                        MessageStyle::TextInfo => DaemonMessage::ShowMessage { text: message.text },
                    };
                    self.send_to_greeter(forwarded);
                }
            }
            PamEventKind::Result { result, .. } => {
                let username = pam.username().map(str::to_string);
                if !result.is_success() {
                    info!(display = %self.id, user = ?username, "Authentication failed");
                    self.login = None;
                    self.send_to_greeter(DaemonMessage::authentication_complete(username, false));
                    return;
                }

                match pam.authorize() {
                    Ok(()) => {
                        self.set_state(DisplayState::GreeterAuthenticated);
                        self.send_to_greeter(DaemonMessage::authentication_complete(username, true));
                    }
                    Err(e) => {
                        warn!(display = %self.id, user = ?username, error = %e, "Failed to authorize user");
                        self.login = None;
                        self.send_to_greeter(DaemonMessage::authentication_complete(username, false));
                    }
                }
            }
        }
    }

    // ------------------------------------------------------------------------
    // Shutdown
    // ------------------------------------------------------------------------

    /// Tells the greeter to exit; kills it if it can no longer be told.
    pub(super) fn request_greeter_quit(&mut self) {
        let Some(greeter) = self.greeter.as_mut() else {
            return;
        };
        if greeter.quit_requested {
            return;
        }
        greeter.quit_requested = true;

        let delivered = greeter
            .outbox
            .as_ref()
            .is_some_and(|outbox| outbox.send(DaemonMessage::Quit).is_ok());
        if delivered {
            debug!(display = %self.id, "Asked greeter to quit");
        } else {
            debug!(display = %self.id, "Greeter unreachable, terminating it");
            greeter.process.stop();
        }
    }

    pub(super) async fn greeter_exited(&mut self, kind: ExitKind, ctx: &mut DisplayContext<'_>) {
        let Some(mut greeter) = self.greeter.take() else {
            return;
        };
        info!(display = %self.id, exit = %kind, "Greeter quit");
        greeter.process.mark_exited();
        greeter.pam.end();
        if let Some(cookie) = greeter.tracking.take() {
            ctx.tracker.close(cookie).await;
        }
        self.timed_login_timer = None;

        if self.state == DisplayState::UserSession {
            if self.session.as_ref().is_some_and(|s| s.process.pid() == 0) {
                info!(display = %self.id, "Starting user session");
                if let Err(e) = self.launch_user_session(ctx) {
                    warn!(display = %self.id, error = %e, "Failed to launch user session, starting greeter");
                    self.abandon_user_session(ctx).await;
                    self.set_state(DisplayState::GreeterPreConnect);
                    self.show_greeter(ctx).await;
                }
            }
            return;
        }

        // A greeter gone with no session to hand over to.
        self.login = None;
        warn!(display = %self.id, state = %self.state, "Greeter exited without a session, stopping display");
        self.stop();
    }
}
