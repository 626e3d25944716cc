//! ldm Daemon - display manager
//!
//! This binary runs the display manager: it starts an X server per seat,
//! runs a greeter on it and launches the user's session once the greeter
//! has authenticated them.
//!
//! # Usage
//!
//! ```bash
//! # Start the daemon (foreground)
//! ldmd start
//!
//! # Start the daemon (background/daemonized)
//! ldmd start -d
//!
//! # Use another configuration, authenticate against a flat file
//! ldmd start --config ./ldm.toml --passwd-file ./passwd
//!
//! # Stop the daemon
//! ldmd stop
//!
//! # Check daemon status
//! ldmd status
//! ```

use std::env;
use std::fs::{self, File};
use std::io::{Read, Write};
use std::path::PathBuf;
use std::process;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use nix::sys::signal::{self, Signal};
use nix::unistd::Pid;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use ldm_core::{IdentitySource, Keyring, LdmConfig, DEFAULT_CONFIG_PATH};
use ldmd::daemon::{spawn_daemon, DaemonEvent, DaemonOptions};
use ldmd::pam::{AuthBackend, PasswdFileAuth};

/// ldm daemon - light display manager
#[derive(Parser, Debug)]
#[command(name = "ldmd", version, about)]
struct Args {
    #[command(subcommand)]
    command: Option<Command>,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Start the daemon
    Start {
        /// Run as a background daemon (fork to background)
        #[arg(short = 'd', long)]
        daemon: bool,

        /// Configuration file
        #[arg(short, long, default_value = DEFAULT_CONFIG_PATH)]
        config: PathBuf,

        /// Authenticate against a passwd-format file instead of PAM
        #[arg(long)]
        passwd_file: Option<PathBuf>,
    },
    /// Stop the running daemon
    Stop,
    /// Show daemon status
    Status,
}

fn state_dir() -> PathBuf {
    dirs::state_dir()
        .unwrap_or_else(|| PathBuf::from("/tmp"))
        .join("ldm")
}

fn pid_file_path() -> PathBuf {
    state_dir().join("ldmd.pid")
}

fn log_file_path() -> PathBuf {
    state_dir().join("ldmd.log")
}

fn read_pid() -> Option<u32> {
    let path = pid_file_path();
    let mut file = File::open(&path).ok()?;
    let mut contents = String::new();
    file.read_to_string(&mut contents).ok()?;
    contents.trim().parse().ok()
}

fn write_pid() -> Result<()> {
    let path = pid_file_path();
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).context("Failed to create state directory")?;
    }
    let mut file = File::create(&path).context("Failed to create PID file")?;
    write!(file, "{}", process::id()).context("Failed to write PID")?;
    Ok(())
}

fn remove_pid_file() {
    let path = pid_file_path();
    let _ = fs::remove_file(path);
}

fn is_process_running(pid: u32) -> bool {
    PathBuf::from(format!("/proc/{pid}")).exists()
}

fn is_daemon_running() -> Option<u32> {
    if let Some(pid) = read_pid() {
        if is_process_running(pid) {
            return Some(pid);
        }
        remove_pid_file();
    }
    None
}

fn stop_daemon(pid: u32) -> Result<()> {
    let raw = i32::try_from(pid).context("PID out of range")?;
    if let Err(e) = signal::kill(Pid::from_raw(raw), Signal::SIGTERM) {
        bail!("Failed to send SIGTERM to process {pid}: {e}");
    }
    Ok(())
}

fn main() -> Result<()> {
    let args = Args::parse();

    let command = args.command.unwrap_or(Command::Start {
        daemon: false,
        config: PathBuf::from(DEFAULT_CONFIG_PATH),
        passwd_file: None,
    });

    match command {
        Command::Start {
            daemon,
            config,
            passwd_file,
        } => {
            if let Some(pid) = is_daemon_running() {
                eprintln!("Daemon is already running (PID {pid})");
                eprintln!("Use 'ldmd stop' to stop it first.");
                process::exit(1);
            }

            // Read before forking so configuration errors reach the terminal.
            let config = LdmConfig::load(&config)
                .with_context(|| format!("Failed to load {}", config.display()))?;

            if daemon {
                daemonize()?;
            }

            write_pid()?;

            let result = run_daemon(config, passwd_file);

            remove_pid_file();

            result
        }
        Command::Stop => {
            if let Some(pid) = is_daemon_running() {
                println!("Stopping daemon (PID {pid})...");
                stop_daemon(pid)?;

                // Children get SIGTERM first; X servers can take a moment.
                for _ in 0..50 {
                    if !is_process_running(pid) {
                        println!("Daemon stopped.");
                        return Ok(());
                    }
                    std::thread::sleep(std::time::Duration::from_millis(100));
                }

                eprintln!("Daemon did not stop within 5 seconds.");
                process::exit(1);
            } else {
                println!("Daemon is not running.");
                Ok(())
            }
        }
        Command::Status => {
            if let Some(pid) = is_daemon_running() {
                println!("Daemon is running (PID {pid})");
                println!("Send SIGUSR2 to log display status.");
                Ok(())
            } else {
                println!("Daemon is not running.");
                process::exit(1);
            }
        }
    }
}

fn daemonize() -> Result<()> {
    use daemonize::Daemonize;

    let log_path = log_file_path();

    if let Some(parent) = log_path.parent() {
        fs::create_dir_all(parent).context("Failed to create log directory")?;
    }

    let stdout = File::create(&log_path).context("Failed to create log file for stdout")?;
    let stderr = File::create(&log_path).context("Failed to create log file for stderr")?;

    let daemonize = Daemonize::new()
        .working_directory("/")
        .stdout(stdout)
        .stderr(stderr);

    daemonize.start().context("Failed to daemonize")?;

    Ok(())
}

/// Picks the identity and authentication backends.
///
/// A passwd file from the command line, `LDM_PASSWD_FILE` or the config
/// (in that order) switches both to the flat-file test mode.
fn backends(config: &LdmConfig, passwd_file: Option<PathBuf>) -> (IdentitySource, AuthBackend) {
    let passwd_file = passwd_file
        .or_else(|| env::var_os(IdentitySource::PASSWD_FILE_ENV).map(PathBuf::from))
        .or_else(|| config.daemon.passwd_file.clone());

    match passwd_file {
        Some(path) => (
            IdentitySource::PasswdFile(path.clone()),
            AuthBackend::PasswdFile(PasswdFileAuth {
                path,
                passwordless_services: vec![config.daemon.pam_autologin_service.clone()],
            }),
        ),
        None => (IdentitySource::System, AuthBackend::Pam),
    }
}

#[tokio::main]
async fn run_daemon(config: LdmConfig, passwd_file: Option<PathBuf>) -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("ldmd=info".parse()?)
                .add_directive("ldm_core=info".parse()?)
                .add_directive("ldm_protocol=info".parse()?),
        )
        .init();

    info!(
        version = env!("CARGO_PKG_VERSION"),
        pid = process::id(),
        "ldm daemon starting"
    );

    let keyring = match Keyring::load(&config.daemon.keys_file) {
        Ok(keyring) => keyring,
        Err(e) => {
            warn!(error = %e, "Failed to load XDMCP keys, continuing without");
            Keyring::default()
        }
    };

    let (identities, auth) = backends(&config, passwd_file);
    if let IdentitySource::PasswdFile(path) = &identities {
        warn!(path = %path.display(), "Using passwd file instead of the system account database");
    }

    let mut options = DaemonOptions::new(config);
    options.identities = identities;
    options.auth = auth;
    options.keyring = keyring;

    let handle = spawn_daemon(options).context("Failed to start daemon")?;
    let mut events = handle.subscribe();
    let stopped = handle.stopped();

    loop {
        tokio::select! {
            _ = stopped.cancelled() => break,
            event = events.recv() => match event {
                Ok(DaemonEvent::Stopped) => break,
                Ok(event) => tracing::debug!(?event, "Daemon event"),
                Err(tokio::sync::broadcast::error::RecvError::Lagged(n)) => {
                    warn!(skipped = n, "Daemon event subscriber lagged");
                }
                Err(tokio::sync::broadcast::error::RecvError::Closed) => {
                    stopped.cancelled().await;
                    break;
                }
            },
        }
    }

    info!("ldm daemon stopped");
    Ok(())
}
