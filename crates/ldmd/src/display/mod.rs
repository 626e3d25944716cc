//! Per-display state machine.
//!
//! A [`Display`] owns one X server, at most one greeter and at most one user
//! session, together with the PAM sessions that authorize them. It never
//! waits on anything itself: the control loop feeds it X readiness, PAM
//! events, process exits, timers and greeter requests, and every entry point
//! leaves it in a consistent state before returning.
//!
//! ```text
//!   None ──start──▶ GreeterPreConnect ──X ready──▶ Greeter ◀──────┐
//!                        ▲      │ autologin           │ auth ok    │ auth failed
//!                        │      ▼                     ▼            │
//!     session exit ──────┤   UserSession ◀─login── GreeterAuthenticated
//!                        │
//!   X server exit (any state) ──▶ Exited  (reported exactly once)
//! ```
//!
//! # Panic-Free Guarantees
//!
//! No method panics. Failures are logged, reported to the greeter where one
//! is listening, and leave the display in a state the next event can
//! continue from.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use nix::unistd::{self, Gid, Uid};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use ldm_core::{DaemonConfig, DisplayId, DisplayState, DomainError, IdentitySource, SeatConfig, User};
use ldm_protocol::DaemonMessage;

use crate::pam::{AuthBackend, PamError, PamEvent, PamSession};
use crate::process::{
    ChildPipes, ChildProcess, ExitKind, ProcessError, ProcessKey, ProcessRegistry, ProcessRole,
};
use crate::tracking::{Tracker, TrackingCookie, TrackingRequest};
use crate::vt;
use crate::xserver::{XServer, XServerError, XServerKind, XServerStart};

mod greeter;
mod session;

/// How long a session that supports transitions has before the greeter is
/// told to quit anyway.
pub const USER_SESSION_TIMEOUT: Duration = Duration::from_millis(5000);

// ============================================================================
// Settings and collaborators
// ============================================================================

/// Configuration a display needs, resolved from the daemon and seat config.
#[derive(Debug, Clone)]
pub struct DisplaySettings {
    pub identities: IdentitySource,
    pub auth: AuthBackend,
    pub pam_service: String,
    pub pam_autologin_service: String,
    pub greeter_user: Option<String>,
    pub greeter_theme: String,
    pub themes_directory: PathBuf,
    pub xsessions_directory: PathBuf,
    pub default_session: String,
    pub default_language: String,
    pub default_layout: String,
    pub session_wrapper: Option<String>,
    pub run_directory: PathBuf,
    pub log_directory: PathBuf,
    pub cache_directory: PathBuf,
    pub default_user: Option<String>,
    /// Seconds; 0 logs the default user in without a greeter.
    pub default_user_timeout: u32,
}

impl DisplaySettings {
    pub fn from_config(
        daemon: &DaemonConfig,
        seat: &SeatConfig,
        identities: IdentitySource,
        auth: AuthBackend,
    ) -> Self {
        Self {
            identities,
            auth,
            pam_service: daemon.pam_service.clone(),
            pam_autologin_service: daemon.pam_autologin_service.clone(),
            greeter_user: daemon.greeter_user.clone(),
            greeter_theme: daemon.default_greeter_theme.clone(),
            themes_directory: daemon.themes_directory.clone(),
            xsessions_directory: daemon.xsessions_directory.clone(),
            default_session: daemon.default_xsession.clone(),
            default_language: daemon.default_language.clone(),
            default_layout: daemon.default_layout.clone(),
            session_wrapper: daemon.session_wrapper.clone(),
            run_directory: daemon.run_directory.clone(),
            log_directory: daemon.log_directory.clone(),
            cache_directory: daemon.cache_directory.clone(),
            default_user: seat.default_user.clone().filter(|u| !u.is_empty()),
            default_user_timeout: seat.default_user_timeout.unwrap_or(0),
        }
    }
}

/// Connects a freshly launched greeter's pipes to a protocol handler.
///
/// Returns the outbox for messages to that greeter, or `None` when no
/// connection could be set up.
pub trait GreeterLink: Send + Sync {
    fn attach(
        &self,
        display: DisplayId,
        pipes: ChildPipes,
    ) -> Option<mpsc::UnboundedSender<DaemonMessage>>;
}

/// Everything a display borrows from the control loop for one call.
pub struct DisplayContext<'a> {
    pub registry: &'a mut ProcessRegistry,
    pub pam_events: &'a mpsc::UnboundedSender<PamEvent>,
    pub timers: &'a mpsc::UnboundedSender<TimerEvent>,
    pub tracker: Tracker,
    pub greeters: &'a dyn GreeterLink,
}

/// Whether the display is still alive after an event.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transition {
    Continue,
    /// Torn down; reported once per display.
    Exited,
}

#[derive(Debug, thiserror::Error)]
pub enum DisplayError {
    #[error("display already started")]
    AlreadyStarted,

    #[error("display is not accepting logins (state {0})")]
    NotAcceptingLogins(DisplayState),

    #[error("an authentication is already in progress")]
    AuthenticationInProgress,

    #[error("no authentication in progress")]
    NoAuthentication,

    #[error("user {username} is not authenticated")]
    NotAuthenticated { username: String },

    #[error("no command in session {0}")]
    EmptySession(String),

    #[error(transparent)]
    Pam(#[from] PamError),

    #[error(transparent)]
    XServer(#[from] XServerError),

    #[error(transparent)]
    Process(#[from] ProcessError),

    #[error(transparent)]
    Domain(#[from] DomainError),
}

// ============================================================================
// Timers
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimerKind {
    /// A session with transitions did not take over in time.
    SessionGuard,
    /// The default user's login delay ran out.
    TimedLogin,
    /// A seat's backoff before replacing a failed display ran out. Carries
    /// the id of the display being replaced.
    ReplaceDisplay,
}

/// Delivered to the control loop when a display timer fires.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimerEvent {
    pub display: DisplayId,
    pub kind: TimerKind,
    token: u64,
}

/// Armed timer; dropping it disarms it.
#[derive(Debug)]
pub(crate) struct Timer {
    token: u64,
    task: JoinHandle<()>,
}

impl Timer {
    pub(crate) fn arm(
        display: DisplayId,
        kind: TimerKind,
        delay: Duration,
        events: &mpsc::UnboundedSender<TimerEvent>,
    ) -> Self {
        static NEXT: AtomicU64 = AtomicU64::new(1);
        let token = NEXT.fetch_add(1, Ordering::Relaxed);
        let events = events.clone();
        let task = tokio::spawn(async move {
            tokio::time::sleep(delay).await;
            let _ = events.send(TimerEvent {
                display,
                kind,
                token,
            });
        });
        Self { token, task }
    }

    pub(crate) fn matches(slot: &Option<Timer>, event: &TimerEvent) -> bool {
        slot.as_ref().is_some_and(|t| t.token == event.token)
    }
}

impl Drop for Timer {
    fn drop(&mut self) {
        self.task.abort();
    }
}

// ============================================================================
// Display
// ============================================================================

#[derive(Debug)]
struct Greeter {
    user: User,
    process: ChildProcess,
    pam: PamSession,
    tracking: Option<TrackingCookie>,
    outbox: Option<mpsc::UnboundedSender<DaemonMessage>>,
    quit_requested: bool,
}

#[derive(Debug)]
struct UserSession {
    user: User,
    session: String,
    command: String,
    process: ChildProcess,
    pam: PamSession,
    tracking: Option<TrackingCookie>,
}

/// One managed X display.
#[derive(Debug)]
pub struct Display {
    id: DisplayId,
    settings: Arc<DisplaySettings>,
    state: DisplayState,
    xserver: XServer,
    greeter: Option<Greeter>,
    /// Login conversation driven by the greeter.
    login: Option<PamSession>,
    autologin: Option<PamSession>,
    session: Option<UserSession>,
    greeter_count: u32,
    login_count: u32,
    supports_transitions: bool,
    session_timer: Option<Timer>,
    timed_login_timer: Option<Timer>,
    exited: bool,
}

impl Display {
    pub fn new(id: DisplayId, settings: Arc<DisplaySettings>, xserver: XServer) -> Self {
        Self {
            id,
            settings,
            state: DisplayState::None,
            xserver,
            greeter: None,
            login: None,
            autologin: None,
            session: None,
            greeter_count: 0,
            login_count: 0,
            supports_transitions: false,
            session_timer: None,
            timed_login_timer: None,
            exited: false,
        }
    }

    pub fn id(&self) -> DisplayId {
        self.id
    }

    pub fn state(&self) -> DisplayState {
        self.state
    }

    pub fn settings(&self) -> &DisplaySettings {
        &self.settings
    }

    pub fn xserver(&self) -> &XServer {
        &self.xserver
    }

    /// X display address, e.g. `:0`.
    pub fn address(&self) -> String {
        self.xserver.address()
    }

    pub fn vt(&self) -> Option<u32> {
        self.xserver.vt()
    }

    pub fn greeter_count(&self) -> u32 {
        self.greeter_count
    }

    pub fn login_count(&self) -> u32 {
        self.login_count
    }

    pub fn greeter_pid(&self) -> Option<u32> {
        self.greeter
            .as_ref()
            .map(|g| g.process.pid())
            .filter(|pid| *pid != 0)
    }

    pub fn session_pid(&self) -> Option<u32> {
        self.session
            .as_ref()
            .map(|s| s.process.pid())
            .filter(|pid| *pid != 0)
    }

    /// Name of the user whose session runs (or is about to) on this display.
    pub fn session_user(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.user.name.as_str())
    }

    /// Environment the user session was (or will be) launched with.
    pub fn session_env(&self, name: &str) -> Option<&str> {
        self.session.as_ref().and_then(|s| s.process.env(name))
    }

    pub fn session_command(&self) -> Option<&str> {
        self.session.as_ref().map(|s| s.command.as_str())
    }

    pub fn has_exited(&self) -> bool {
        self.exited
    }

    /// True once a greeter or a session ever ran here.
    pub fn was_used(&self) -> bool {
        self.greeter_count > 0 || self.login_count > 0
    }

    /// Starts the X server; the rest happens once it is ready.
    pub async fn start(&mut self, ctx: &mut DisplayContext<'_>) -> Result<(), DisplayError> {
        if self.state != DisplayState::None {
            return Err(DisplayError::AlreadyStarted);
        }

        let key = ProcessKey::new(self.id, ProcessRole::XServer);
        let started = self.xserver.start(ctx.registry, key).await?;
        self.set_state(DisplayState::GreeterPreConnect);
        if started == XServerStart::Ready {
            self.on_xserver_ready(ctx).await;
        }
        Ok(())
    }

    /// SIGUSR1 from this display's X server.
    pub async fn handle_xserver_ready(&mut self, ctx: &mut DisplayContext<'_>) {
        if self.xserver.mark_ready() {
            self.on_xserver_ready(ctx).await;
        }
    }

    async fn on_xserver_ready(&mut self, ctx: &mut DisplayContext<'_>) {
        if self.xserver.kind() == XServerKind::LocalTerminal {
            debug!(display = %self.id, "Local terminal, no greeter");
            return;
        }
        if self.state != DisplayState::GreeterPreConnect {
            debug!(display = %self.id, state = %self.state, "X server ready, nothing to do");
            return;
        }

        if let Some(user) = self.settings.default_user.clone() {
            if self.settings.default_user_timeout == 0 && self.login_count == 0 {
                match self.start_autologin(&user, ctx) {
                    Ok(()) => return,
                    Err(e) => warn!(
                        display = %self.id,
                        user = %user,
                        error = %e,
                        "Failed to autologin, starting greeter instead"
                    ),
                }
            }
        }

        self.show_greeter(ctx).await;
    }

    /// Starts a greeter; failing that, gives up on the display.
    async fn show_greeter(&mut self, ctx: &mut DisplayContext<'_>) {
        if let Err(e) = self.start_greeter(ctx).await {
            error!(display = %self.id, error = %e, "Failed to start greeter, stopping display");
            self.stop();
        }
    }

    /// Routes a PAM event to the conversation it belongs to.
    pub async fn handle_pam_event(&mut self, event: PamEvent, ctx: &mut DisplayContext<'_>) {
        if self.autologin.as_ref().is_some_and(|p| p.id() == event.session) {
            self.handle_autologin_event(event, ctx).await;
        } else if self.login.as_ref().is_some_and(|p| p.id() == event.session) {
            self.handle_login_event(event);
        } else {
            debug!(display = %self.id, session = %event.session, "Dropping stale PAM event");
        }
    }

    pub fn handle_timer(&mut self, event: TimerEvent) {
        match event.kind {
            TimerKind::SessionGuard if Timer::matches(&self.session_timer, &event) => {
                self.session_timer = None;
                warn!(display = %self.id, "Session has not indicated it is ready, stopping greeter anyway");
                self.request_greeter_quit();
            }
            TimerKind::TimedLogin if Timer::matches(&self.timed_login_timer, &event) => {
                self.timed_login_timer = None;
                if let Some(username) = self.settings.default_user.clone() {
                    info!(display = %self.id, user = %username, "Timed login");
                    self.send_to_greeter(DaemonMessage::TimedLogin { username });
                }
            }
            _ => debug!(display = %self.id, kind = ?event.kind, "Ignoring cancelled timer"),
        }
    }

    /// An owned process ended.
    pub async fn handle_process_exit(
        &mut self,
        role: ProcessRole,
        pid: u32,
        kind: ExitKind,
        ctx: &mut DisplayContext<'_>,
    ) -> Transition {
        match role {
            ProcessRole::XServer => {
                if self.xserver.pid() != pid {
                    debug!(display = %self.id, pid, "Exit of a previous X server");
                    return Transition::Continue;
                }
                match kind {
                    ExitKind::Exited(0) => info!(display = %self.id, "X server exited"),
                    _ => warn!(display = %self.id, exit = %kind, "X server stopped"),
                }
                self.xserver.mark_exited();
                self.end_display(ctx).await
            }
            ProcessRole::Greeter => {
                if self.greeter_pid() != Some(pid) {
                    debug!(display = %self.id, pid, "Exit of a previous greeter");
                    return Transition::Continue;
                }
                self.greeter_exited(kind, ctx).await;
                Transition::Continue
            }
            ProcessRole::Session => {
                if self.session_pid() != Some(pid) {
                    debug!(display = %self.id, pid, "Exit of a previous session");
                    return Transition::Continue;
                }
                self.session_exited(kind, ctx).await;
                Transition::Continue
            }
        }
    }

    /// Asks every process of the display to terminate. The X server's exit
    /// then completes the teardown.
    pub fn stop(&mut self) {
        info!(display = %self.id, "Stopping display");
        if let Some(session) = &self.session {
            session.process.stop();
        }
        if let Some(greeter) = &self.greeter {
            greeter.process.stop();
        }
        self.xserver.stop();
    }

    /// Brings the display's VT to the foreground, if it has one.
    pub fn activate_vt(&self) {
        if let Some(number) = self.xserver.vt() {
            if let Err(e) = vt::activate(number) {
                warn!(display = %self.id, vt = number, error = %e, "Failed to switch VT");
            }
        }
    }

    /// Full teardown after the X server is gone.
    async fn end_display(&mut self, ctx: &mut DisplayContext<'_>) -> Transition {
        if self.exited {
            return Transition::Continue;
        }
        self.exited = true;

        self.session_timer = None;
        self.timed_login_timer = None;
        self.autologin = None;
        self.login = None;

        if let Some(mut greeter) = self.greeter.take() {
            greeter.process.stop();
            greeter.pam.end();
            if let Some(cookie) = greeter.tracking.take() {
                ctx.tracker.close(cookie).await;
            }
        }
        if let Some(mut session) = self.session.take() {
            session.process.stop();
            session.pam.end();
            if let Some(cookie) = session.tracking.take() {
                ctx.tracker.close(cookie).await;
            }
        }

        self.set_state(DisplayState::Exited);
        Transition::Exited
    }

    fn set_state(&mut self, state: DisplayState) {
        if self.state != state {
            info!(display = %self.id, from = %self.state, to = %state, "Display state changed");
            self.state = state;
        }
    }

    fn send_to_greeter(&self, message: DaemonMessage) {
        let Some(outbox) = self.greeter.as_ref().and_then(|g| g.outbox.as_ref()) else {
            debug!(display = %self.id, "No greeter connection for message");
            return;
        };
        if outbox.send(message).is_err() {
            debug!(display = %self.id, "Greeter connection closed");
        }
    }

    fn tracking_request(&self, user: &User, session_type: &str) -> TrackingRequest {
        TrackingRequest {
            uid: user.uid,
            session_type: session_type.to_string(),
            display: self.xserver.address(),
            display_device: self
                .xserver
                .vt()
                .map(|n| vt::device_path(n).display().to_string()),
            remote_host: self.xserver.remote_host().to_string(),
            is_local: self.xserver.kind() != XServerKind::Remote,
        }
    }

    /// Writes a copy of the server's cookie that `user` can read.
    fn client_authority(&self, user: &User) -> Option<PathBuf> {
        let authority = self.xserver.authority()?;
        let dir = self.settings.run_directory.join(&user.name);
        let path = dir.join(format!("{}.xauthority", self.xserver.address()));
        let owner = Some(user).filter(|_| unistd::getuid().is_root());

        if let Err(e) = authority.write(&path, owner) {
            warn!(display = %self.id, path = %path.display(), error = %e, "Failed to write client authority");
            return None;
        }
        if owner.is_some() {
            if let Err(e) = unistd::chown(dir.as_path(), Some(Uid::from_raw(user.uid)), Some(Gid::from_raw(user.gid))) {
                warn!(path = %dir.display(), error = %e, "Failed to hand authority directory to user");
            }
        }
        Some(path)
    }
}
