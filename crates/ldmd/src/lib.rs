//! ldm Daemon - seats, X servers, greeters and user sessions
//!
//! This crate provides the daemon side of the display manager:
//! - `daemon` - Control-loop actor that owns all seats and processes
//! - `seat` / `display` - Per-console display lifecycle
//! - `xserver` - Local, terminal and remote X servers
//! - `pam` - Authentication conversations and session authorization
//! - `process` - Supervised children and signal delivery
//! - `server` - Greeter protocol over inherited pipes
//! - `tracking` / `power` - ConsoleKit and logind over D-Bus
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                          ldmd                               │
//! ├─────────────────────────────────────────────────────────────┤
//! │                                                             │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │ GreeterServer   │────▶│        DaemonActor          │   │
//! │  │ (greeter pipes) │     │  Seat ─▶ Display ─▶ XServer │   │
//! │  └────────┬────────┘     └──────────────┬──────────────┘   │
//! │           │                             │                   │
//! │           │ per greeter                 │ spawns            │
//! │           ▼                             ▼                   │
//! │  ┌─────────────────┐     ┌─────────────────────────────┐   │
//! │  │ConnectionHandler│     │ X server, greeter, session  │   │
//! │  │                 │     │ (ProcessRegistry, PAM)      │   │
//! │  └─────────────────┘     └─────────────────────────────┘   │
//! │                                                             │
//! └─────────────────────────────────────────────────────────────┘
//! ```
//!
//! # Panic-Free Guarantees
//!
//! All production code in this crate follows the panic-free policy:
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - All fallible operations return `Result` or `Option`
//! - Channel operations handle closure gracefully

pub mod daemon;
pub mod display;
pub mod pam;
pub mod power;
pub mod process;
pub mod seat;
pub mod server;
pub mod tracking;
pub mod vt;
pub mod xserver;
