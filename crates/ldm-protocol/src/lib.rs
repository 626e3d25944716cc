//! ldm Protocol - Wire protocol between greeters and the daemon
//!
//! Greeters are launched with a pipe pair whose descriptor numbers are
//! published in `LDM_TO_SERVER_FD` (greeter writes) and
//! `LDM_FROM_SERVER_FD` (greeter reads). Each direction carries
//! newline-delimited JSON: [`ClientMessage`] upstream, [`DaemonMessage`]
//! downstream.

pub mod message;
pub mod version;

pub use message::{
    ClientMessage, DaemonMessage, GreeterRequest, LayoutEntry, PowerAction, SessionEntry,
    UserEntry,
};
pub use version::{ProtocolVersion, VersionError};

/// Environment variable naming the descriptor the greeter writes requests to.
pub const TO_SERVER_FD_ENV: &str = "LDM_TO_SERVER_FD";

/// Environment variable naming the descriptor the greeter reads replies from.
pub const FROM_SERVER_FD_ENV: &str = "LDM_FROM_SERVER_FD";
