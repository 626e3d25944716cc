//! Session tracking through ConsoleKit.
//!
//! Greeter and user sessions are registered with the system's session
//! tracker so that console ownership follows the logged-in user. The
//! tracker hands back a cookie, exported to the child as
//! `XDG_SESSION_COOKIE` and used again to close the session.
//!
//! Tracking only happens when the daemon is privileged and tracking is
//! enabled in the configuration. Bus failures are logged and never stop a
//! login.

use std::fmt;

use nix::unistd;
use tracing::{debug, info, warn};
use zbus::zvariant::Value;
use zbus::{proxy, Connection};

/// Name of the cookie variable exported to tracked children.
pub const COOKIE_ENV: &str = "XDG_SESSION_COOKIE";

#[proxy(
    interface = "org.freedesktop.ConsoleKit.Manager",
    default_service = "org.freedesktop.ConsoleKit",
    default_path = "/org/freedesktop/ConsoleKit/Manager"
)]
trait ConsoleKitManager {
    #[zbus(name = "OpenSessionWithParameters")]
    fn open_session_with_parameters(
        &self,
        parameters: &[(&str, &Value<'_>)],
    ) -> zbus::Result<String>;

    #[zbus(name = "CloseSession")]
    fn close_session(&self, cookie: &str) -> zbus::Result<bool>;
}

/// Opaque identifier of a tracked session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackingCookie(String);

impl TrackingCookie {
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TrackingCookie {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the tracker is told about a new session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackingRequest {
    pub uid: u32,
    /// `"LoginWindow"` for greeters, empty for user sessions.
    pub session_type: String,
    /// X display address, e.g. `:0`.
    pub display: String,
    /// Console device of the display's VT, if it has one.
    pub display_device: Option<String>,
    pub remote_host: String,
    pub is_local: bool,
}

/// Client of the session tracker.
#[derive(Debug, Clone, Copy)]
pub struct Tracker {
    enabled: bool,
}

impl Tracker {
    /// Tracks sessions when `enabled` and the daemon runs as root.
    pub fn new(enabled: bool) -> Self {
        Self {
            enabled: enabled && unistd::getuid().is_root(),
        }
    }

    /// A tracker that never talks to the bus.
    pub fn disabled() -> Self {
        Self { enabled: false }
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Registers a session. `None` when tracking is off or failed.
    pub async fn open(&self, request: &TrackingRequest) -> Option<TrackingCookie> {
        if !self.enabled {
            return None;
        }

        match open_session(request).await {
            Ok(cookie) => {
                info!(
                    uid = request.uid,
                    display = %request.display,
                    session_type = %request.session_type,
                    "Opened tracked session"
                );
                Some(TrackingCookie(cookie))
            }
            Err(e) => {
                warn!(uid = request.uid, display = %request.display, error = %e, "Failed to open tracked session");
                None
            }
        }
    }

    /// Closes a session previously returned by [`open`](Tracker::open).
    pub async fn close(&self, cookie: TrackingCookie) {
        if !self.enabled {
            return;
        }

        match close_session(&cookie).await {
            Ok(true) => debug!(cookie = %cookie, "Closed tracked session"),
            Ok(false) => warn!(cookie = %cookie, "Tracker refused to close session"),
            Err(e) => warn!(cookie = %cookie, error = %e, "Failed to close tracked session"),
        }
    }
}

async fn open_session(request: &TrackingRequest) -> zbus::Result<String> {
    let connection = Connection::system().await?;
    let manager = ConsoleKitManagerProxy::new(&connection).await?;

    let uid = Value::from(request.uid);
    let session_type = Value::from(request.session_type.as_str());
    let display = Value::from(request.display.as_str());
    let device = Value::from(request.display_device.as_deref().unwrap_or(""));
    let remote_host = Value::from(request.remote_host.as_str());
    let is_local = Value::from(request.is_local);

    let mut parameters = vec![
        ("unix-user", &uid),
        ("session-type", &session_type),
        ("x11-display", &display),
    ];
    if request.display_device.is_some() {
        parameters.push(("x11-display-device", &device));
    }
    if !request.remote_host.is_empty() {
        parameters.push(("remote-host-name", &remote_host));
    }
    parameters.push(("is-local", &is_local));

    manager.open_session_with_parameters(&parameters).await
}

async fn close_session(cookie: &TrackingCookie) -> zbus::Result<bool> {
    let connection = Connection::system().await?;
    let manager = ConsoleKitManagerProxy::new(&connection).await?;
    manager.close_session(cookie.as_str()).await
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request() -> TrackingRequest {
        TrackingRequest {
            uid: 1000,
            session_type: "LoginWindow".to_string(),
            display: ":0".to_string(),
            display_device: Some("/dev/tty7".to_string()),
            remote_host: String::new(),
            is_local: true,
        }
    }

    #[tokio::test]
    async fn test_disabled_tracker_opens_nothing() {
        let tracker = Tracker::disabled();
        assert!(!tracker.is_enabled());
        assert_eq!(tracker.open(&request()).await, None);
        tracker.close(TrackingCookie("cookie".to_string())).await;
    }

    #[test]
    fn test_unprivileged_tracker_is_disabled() {
        if unistd::getuid().is_root() {
            return;
        }
        assert!(!Tracker::new(true).is_enabled());
    }
}
