//! Daemon configuration (`/etc/ldm/ldm.toml`).
//!
//! Every key has a default, so a missing or empty file yields a working
//! configuration. Seat sections override `[seat_defaults]` key by key.

use std::collections::BTreeMap;
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::error::{DomainError, DomainResult};

/// Default configuration file location.
pub const DEFAULT_CONFIG_PATH: &str = "/etc/ldm/ldm.toml";

/// Top-level configuration document.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LdmConfig {
    pub daemon: DaemonConfig,
    pub seat_defaults: SeatConfig,
    /// Per-seat overrides, keyed by seat name.
    pub seat: BTreeMap<String, SeatConfig>,
}

/// `[daemon]` section.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DaemonConfig {
    pub run_directory: PathBuf,
    pub log_directory: PathBuf,
    pub cache_directory: PathBuf,
    pub xsessions_directory: PathBuf,
    pub themes_directory: PathBuf,
    pub keys_file: PathBuf,
    pub default_greeter_theme: String,
    pub default_xsession: String,
    pub default_language: String,
    pub default_layout: String,
    /// Identity the greeter runs as; the daemon's own identity when unset.
    pub greeter_user: Option<String>,
    pub pam_service: String,
    pub pam_autologin_service: String,
    pub session_wrapper: Option<String>,
    pub minimum_display_number: u32,
    pub minimum_vt: u32,
    pub minimum_uid: u32,
    pub hidden_users: Vec<String>,
    pub hidden_shells: Vec<String>,
    /// Flat passwd-format file for identities and authentication (test mode).
    pub passwd_file: Option<PathBuf>,
    pub session_tracking: bool,
    pub seats: Vec<String>,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            run_directory: PathBuf::from("/run/ldm"),
            log_directory: PathBuf::from("/var/log/ldm"),
            cache_directory: PathBuf::from("/var/cache/ldm"),
            xsessions_directory: PathBuf::from("/usr/share/xsessions"),
            themes_directory: PathBuf::from("/usr/share/ldm/themes"),
            keys_file: PathBuf::from("/etc/ldm/keys.toml"),
            default_greeter_theme: "default".to_string(),
            default_xsession: "default".to_string(),
            default_language: String::new(),
            default_layout: String::new(),
            greeter_user: None,
            pam_service: "ldm".to_string(),
            pam_autologin_service: "ldm-autologin".to_string(),
            session_wrapper: None,
            minimum_display_number: 0,
            minimum_vt: 7,
            minimum_uid: 500,
            hidden_users: vec!["nobody".to_string()],
            hidden_shells: vec!["false".to_string(), "nologin".to_string()],
            passwd_file: None,
            session_tracking: true,
            seats: vec!["seat0".to_string()],
        }
    }
}

/// `[seat_defaults]` and `[seat.<name>]` sections.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SeatConfig {
    pub xserver_command: Option<String>,
    pub xserver_layout: Option<String>,
    pub xserver_config: Option<String>,
    /// XDMCP manager host; makes local servers terminals of that manager.
    pub xdmcp_manager: Option<String>,
    pub xdmcp_port: Option<u16>,
    /// Name of an entry in the keys file.
    pub xdmcp_key: Option<String>,
    /// User to log in automatically.
    pub default_user: Option<String>,
    /// Seconds before the default user is logged in; 0 means immediately.
    pub default_user_timeout: Option<u32>,
}

impl SeatConfig {
    /// Values from `self`, falling back to `defaults` key by key.
    pub fn or(&self, defaults: &SeatConfig) -> SeatConfig {
        SeatConfig {
            xserver_command: self
                .xserver_command
                .clone()
                .or_else(|| defaults.xserver_command.clone()),
            xserver_layout: self
                .xserver_layout
                .clone()
                .or_else(|| defaults.xserver_layout.clone()),
            xserver_config: self
                .xserver_config
                .clone()
                .or_else(|| defaults.xserver_config.clone()),
            xdmcp_manager: self
                .xdmcp_manager
                .clone()
                .or_else(|| defaults.xdmcp_manager.clone()),
            xdmcp_port: self.xdmcp_port.or(defaults.xdmcp_port),
            xdmcp_key: self.xdmcp_key.clone().or_else(|| defaults.xdmcp_key.clone()),
            default_user: self
                .default_user
                .clone()
                .or_else(|| defaults.default_user.clone()),
            default_user_timeout: self.default_user_timeout.or(defaults.default_user_timeout),
        }
    }
}

impl LdmConfig {
    /// Parses configuration text.
    pub fn parse(text: &str) -> DomainResult<Self> {
        toml::from_str(text).map_err(|e| DomainError::ParseError {
            field: "configuration".to_string(),
            reason: e.to_string(),
        })
    }

    /// Loads a configuration file; a missing file yields the defaults.
    pub fn load(path: &Path) -> DomainResult<Self> {
        match fs::read_to_string(path) {
            Ok(text) => Self::parse(&text),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(DomainError::io(path, e)),
        }
    }

    /// Effective settings for one seat.
    pub fn seat_config(&self, name: &str) -> SeatConfig {
        match self.seat.get(name) {
            Some(seat) => seat.or(&self.seat_defaults),
            None => self.seat_defaults.clone(),
        }
    }
}

/// XDMCP keys file: a `[keyring]` table of `name = "secret"`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Keyring {
    pub keyring: BTreeMap<String, String>,
}

impl Keyring {
    /// Loads the keys file; a missing file is an empty keyring.
    pub fn load(path: &Path) -> DomainResult<Self> {
        match fs::read_to_string(path) {
            Ok(text) => toml::from_str(&text).map_err(|e| DomainError::ParseError {
                field: "keyring".to_string(),
                reason: e.to_string(),
            }),
            Err(e) if e.kind() == ErrorKind::NotFound => Ok(Self::default()),
            Err(e) => Err(DomainError::io(path, e)),
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.keyring.get(name).map(String::as_str)
    }
}
