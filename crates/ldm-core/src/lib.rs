//! ldm Core - Shared types for the display manager
//!
//! This crate provides the domain types used by the daemon (ldmd) that do
//! not depend on an async runtime: identities, per-user settings, session
//! descriptors, greeter themes and the configuration file.
//!
//! All code follows the panic-free policy: no `.unwrap()`, `.expect()`,
//! `panic!()`, `unreachable!()`, `todo!()`, or direct indexing `[i]`.

pub mod config;
pub mod display;
pub mod dmrc;
pub mod error;
pub mod keyfile;
pub mod locale;
pub mod session;
pub mod user;
pub mod userfile;

// Re-exports for convenience
pub use config::{DaemonConfig, Keyring, LdmConfig, SeatConfig, DEFAULT_CONFIG_PATH};
pub use display::{DisplayId, DisplayState};
pub use dmrc::UserSettings;
pub use error::{DomainError, DomainResult};
pub use keyfile::KeyFile;
pub use locale::{parse_locale_list, parse_xkb_layouts, KeyboardLayout, XKB_RULES_LIST};
pub use session::{GreeterTheme, SessionDescriptor};
pub use user::{parse_passwd_line, read_passwd_file, IdentitySource, PasswdEntry, User, UserFilter};
