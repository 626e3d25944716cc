//! Display identifiers and lifecycle states.

use serde::{Deserialize, Serialize};
use std::fmt;

// ============================================================================
// Type-Safe Identifiers
// ============================================================================

/// Daemon-wide identifier of a managed display.
///
/// Allocated sequentially by the daemon; never reused within one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct DisplayId(u32);

impl DisplayId {
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    pub const fn get(self) -> u32 {
        self.0
    }

    /// The identifier after this one.
    #[must_use]
    pub const fn next(self) -> Self {
        Self(self.0.wrapping_add(1))
    }
}

impl fmt::Display for DisplayId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "display-{}", self.0)
    }
}

// ============================================================================
// Lifecycle
// ============================================================================

/// Where a display is in its greeter/session lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DisplayState {
    /// Created, X server not yet started.
    #[default]
    None,
    /// X server started; waiting for it to become ready.
    GreeterPreConnect,
    /// Greeter running, no authenticated user.
    Greeter,
    /// Greeter running, login conversation succeeded.
    GreeterAuthenticated,
    /// User session running (or pending the greeter's exit).
    UserSession,
    /// X server gone; display torn down.
    Exited,
}

impl DisplayState {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::None => "none",
            Self::GreeterPreConnect => "greeter_pre_connect",
            Self::Greeter => "greeter",
            Self::GreeterAuthenticated => "greeter_authenticated",
            Self::UserSession => "user_session",
            Self::Exited => "exited",
        }
    }
}

impl fmt::Display for DisplayState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
