//! X server wrapper.
//!
//! Local servers are spawned as children with SIGUSR1 ignored, which makes
//! the X server send SIGUSR1 to its parent once it accepts connections. That
//! signal, routed through the signal pipe, is the only thing that marks a
//! server ready. Remote servers are checked with an X11 connection setup and
//! are ready as soon as the server accepts it.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use nix::sys::signal::Signal;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use crate::process::{ChildProcess, ProcessError, ProcessKey, ProcessRegistry};

mod authority;

pub use authority::{XAuthority, FAMILY_LOCAL, MIT_MAGIC_COOKIE};

/// Name of the XDMCP scheme whose key is passed with `-cookie`.
pub const XDM_AUTHENTICATION: &str = "XDM-AUTHENTICATION-1";

/// X11 TCP port of display 0.
const X_TCP_PORT_BASE: u32 = 6000;

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Highest display number tried when allocating.
const MAX_DISPLAY_NUMBER: u32 = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XServerKind {
    /// Spawned on this machine.
    Local,
    /// Spawned here, managed by a remote XDMCP manager.
    LocalTerminal,
    /// An already running server elsewhere.
    Remote,
}

/// XDMCP authentication offered to the manager.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XdmcpAuthentication {
    pub name: String,
    pub data: Vec<u8>,
}

impl XdmcpAuthentication {
    /// XDM-AUTHENTICATION-1 from a shared key: a zero byte followed by up to
    /// seven key bytes.
    pub fn from_key(key: &str) -> Self {
        let mut data = vec![0u8; 8];
        for (slot, byte) in data.iter_mut().skip(1).zip(key.bytes()) {
            *slot = byte;
        }
        Self {
            name: XDM_AUTHENTICATION.to_string(),
            data,
        }
    }
}

/// Everything needed to launch or reach a server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XServerConfig {
    pub kind: XServerKind,
    pub command: String,
    pub display_number: u32,
    pub vt: Option<u32>,
    /// XDMCP manager (terminal) or server host (remote).
    pub hostname: Option<String>,
    /// XDMCP port; 0 for the default.
    pub port: u16,
    pub layout: Option<String>,
    pub config_file: Option<String>,
    pub authentication: Option<XdmcpAuthentication>,
}

impl XServerConfig {
    pub fn local(command: &str, display_number: u32, vt: Option<u32>) -> Self {
        Self {
            kind: XServerKind::Local,
            command: command.to_string(),
            display_number,
            vt,
            hostname: None,
            port: 0,
            layout: None,
            config_file: None,
            authentication: None,
        }
    }
}

/// What `start` achieved.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum XServerStart {
    /// Process running; readiness comes later via SIGUSR1.
    Launched,
    /// Remote server reachable; ready now.
    Ready,
}

#[derive(Debug, thiserror::Error)]
pub enum XServerError {
    #[error("failed to write authority file {}: {reason}", path.display())]
    Authority { path: PathBuf, reason: String },

    #[error("cannot connect to {address}: {reason}")]
    Connect { address: String, reason: String },

    #[error(transparent)]
    Process(#[from] ProcessError),
}

/// One X display server.
#[derive(Debug)]
pub struct XServer {
    config: XServerConfig,
    authority: Option<XAuthority>,
    authority_path: Option<PathBuf>,
    log_file: Option<PathBuf>,
    process: ChildProcess,
    ready: bool,
}

impl XServer {
    pub fn new(config: XServerConfig) -> Self {
        Self {
            config,
            authority: None,
            authority_path: None,
            log_file: None,
            process: ChildProcess::new(),
            ready: false,
        }
    }

    pub fn kind(&self) -> XServerKind {
        self.config.kind
    }

    pub fn display_number(&self) -> u32 {
        self.config.display_number
    }

    pub fn vt(&self) -> Option<u32> {
        self.config.vt
    }

    pub fn is_ready(&self) -> bool {
        self.ready
    }

    pub fn pid(&self) -> u32 {
        self.process.pid()
    }

    pub fn is_running(&self) -> bool {
        self.ready || self.process.is_running()
    }

    /// Value for `DISPLAY`.
    pub fn address(&self) -> String {
        match (&self.config.kind, &self.config.hostname) {
            (XServerKind::Remote, Some(host)) => format!("{host}:{}", self.config.display_number),
            _ => format!(":{}", self.config.display_number),
        }
    }

    /// Hostname reported to session tracking; empty for local displays.
    pub fn remote_host(&self) -> &str {
        match self.config.kind {
            XServerKind::Remote => self.config.hostname.as_deref().unwrap_or_default(),
            _ => "",
        }
    }

    pub fn authority(&self) -> Option<&XAuthority> {
        self.authority.as_ref()
    }

    /// Cookie handed to the server; written to `path` on start and removed
    /// when the server is dropped.
    pub fn set_authority(&mut self, authority: XAuthority, path: PathBuf) {
        self.authority = Some(authority);
        self.authority_path = Some(path);
    }

    pub fn set_log_file(&mut self, path: PathBuf) {
        self.log_file = Some(path);
    }

    /// Launch command line.
    pub fn command_line(&self) -> String {
        let config = &self.config;
        let mut command = format!("{} :{}", config.command, config.display_number);

        if let (Some(_), Some(path)) = (&self.authority, &self.authority_path) {
            command.push_str(&format!(" -auth {}", path.display()));
        }

        match config.kind {
            XServerKind::LocalTerminal => {
                if config.port != 0 {
                    command.push_str(&format!(" -port {}", config.port));
                }
                if let Some(host) = &config.hostname {
                    command.push_str(&format!(" -query {host}"));
                }
                if let Some(auth) = config
                    .authentication
                    .as_ref()
                    .filter(|a| a.name == XDM_AUTHENTICATION && !a.data.is_empty())
                {
                    command.push_str(&format!(" -cookie 0x{}", authority::hex(&auth.data)));
                }
            }
            _ => command.push_str(" -nolisten tcp"),
        }

        if let Some(file) = &config.config_file {
            command.push_str(&format!(" -config {file}"));
        }
        if let Some(layout) = &config.layout {
            command.push_str(&format!(" -layout {layout}"));
        }
        if let Some(vt) = config.vt {
            command.push_str(&format!(" vt{vt}"));
        }

        command
    }

    /// Starts (or, for remote servers, contacts) the server.
    pub async fn start(
        &mut self,
        registry: &mut ProcessRegistry,
        key: ProcessKey,
    ) -> Result<XServerStart, XServerError> {
        if self.config.kind == XServerKind::Remote {
            let host = self.config.hostname.clone().unwrap_or_else(|| "localhost".to_string());
            check_remote(&host, self.config.display_number, self.authority.as_ref()).await?;
            info!(address = %self.address(), "Remote X server reachable");
            self.ready = true;
            return Ok(XServerStart::Ready);
        }

        if let (Some(authority), Some(path)) = (&self.authority, &self.authority_path) {
            authority
                .write(path, None)
                .map_err(|e| XServerError::Authority {
                    path: path.clone(),
                    reason: e.to_string(),
                })?;
        }

        if let Some(log) = &self.log_file {
            self.process.set_log_file(log);
        }
        self.process.ignore_signal(Signal::SIGUSR1);

        let command = self.command_line();
        self.process
            .start(registry, key, None, None, &command, false)?;
        info!(
            display = %self.address(),
            pid = self.process.pid(),
            command = %command,
            "X server launched"
        );
        Ok(XServerStart::Launched)
    }

    /// Handles SIGUSR1 from the server. Returns true the first time only.
    pub fn mark_ready(&mut self) -> bool {
        if self.ready || !self.process.is_running() {
            return false;
        }
        self.ready = true;
        info!(display = %self.address(), "X server ready");
        true
    }

    /// Asks the server to drop every client; it resets and announces
    /// readiness again with SIGUSR1.
    pub fn disconnect_clients(&mut self) {
        self.ready = false;
        if self.config.kind == XServerKind::Remote {
            return;
        }
        if let Err(e) = self.process.signal(Signal::SIGHUP) {
            debug!(display = %self.address(), error = %e, "Cannot reset X server");
        }
    }

    /// Records the server's exit.
    pub fn mark_exited(&mut self) {
        self.ready = false;
        self.process.mark_exited();
    }

    /// Asks the server to terminate.
    pub fn stop(&self) {
        self.process.stop();
    }
}

impl Drop for XServer {
    fn drop(&mut self) {
        if let Some(path) = &self.authority_path {
            if let Err(e) = fs::remove_file(path) {
                if e.kind() != std::io::ErrorKind::NotFound {
                    warn!(path = %path.display(), error = %e, "Failed to remove authority file");
                }
            }
        }
    }
}

/// Lowest display number ≥ `minimum` that is neither in `in_use` nor
/// locked by another server on this machine.
pub fn allocate_display_number(minimum: u32, in_use: &[u32]) -> u32 {
    (minimum..MAX_DISPLAY_NUMBER.max(minimum.saturating_add(1)))
        .find(|n| !in_use.contains(n) && !lock_file(*n).exists())
        .unwrap_or(minimum)
}

fn lock_file(display_number: u32) -> PathBuf {
    Path::new("/tmp").join(format!(".X{display_number}-lock"))
}

/// X11 connection setup against `host:display`.
async fn check_remote(
    host: &str,
    display_number: u32,
    authority: Option<&XAuthority>,
) -> Result<(), XServerError> {
    let address = format!("{host}:{display_number}");
    let connect_error = |reason: String| XServerError::Connect {
        address: address.clone(),
        reason,
    };

    let port = u16::try_from(X_TCP_PORT_BASE + display_number)
        .map_err(|_| connect_error("display number out of range".to_string()))?;

    let mut stream = timeout(CONNECT_TIMEOUT, TcpStream::connect((host, port)))
        .await
        .map_err(|_| connect_error("timed out".to_string()))?
        .map_err(|e| connect_error(e.to_string()))?;

    let request = setup_request(authority);
    let mut status = [0u8; 1];
    let exchange = async {
        stream.write_all(&request).await?;
        stream.read_exact(&mut status).await?;
        Ok::<(), std::io::Error>(())
    };
    timeout(CONNECT_TIMEOUT, exchange)
        .await
        .map_err(|_| connect_error("timed out".to_string()))?
        .map_err(|e| connect_error(e.to_string()))?;

    match status {
        [1] => Ok(()),
        [0] => Err(connect_error("connection refused by server".to_string())),
        _ => Err(connect_error("further authentication required".to_string())),
    }
}

/// Little-endian X11 connection setup request.
fn setup_request(authority: Option<&XAuthority>) -> Vec<u8> {
    let (name, data) = authority
        .map(|a| (a.name.as_bytes(), a.data.as_slice()))
        .unwrap_or_default();
    let name_len = u16::try_from(name.len()).unwrap_or(0);
    let data_len = u16::try_from(data.len()).unwrap_or(0);

    let mut request = vec![b'l', 0];
    request.extend_from_slice(&11u16.to_le_bytes());
    request.extend_from_slice(&0u16.to_le_bytes());
    request.extend_from_slice(&name_len.to_le_bytes());
    request.extend_from_slice(&data_len.to_le_bytes());
    request.extend_from_slice(&[0, 0]);
    for field in [name, data] {
        if field.len() > usize::from(u16::MAX) {
            continue;
        }
        request.extend_from_slice(field);
        request.resize(request.len() + (4 - field.len() % 4) % 4, 0);
    }
    request
}
