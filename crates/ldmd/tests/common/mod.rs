//! Shared fixtures for the ldmd integration tests.
//!
//! Every identity in the fixture passwd file maps to the uid/gid running
//! the tests, so launching "as" a user works with or without root.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use nix::sys::signal::{self, Signal};
use nix::unistd::{self, Pid};
use tempfile::TempDir;
use tokio::sync::mpsc;
use tokio::time::timeout;

use ldm_core::{DisplayId, IdentitySource};
use ldm_protocol::DaemonMessage;
use ldmd::display::{Display, DisplayContext, DisplaySettings, GreeterLink, TimerEvent, Transition};
use ldmd::pam::{AuthBackend, PamEvent, PasswdFileAuth};
use ldmd::process::{ChildPipes, ProcessExit, ProcessKey, ProcessRegistry};
use ldmd::tracking::Tracker;

/// X server stand-in: survives the SIGHUP sent on session exit.
pub const FAKE_X: &str = "sh -c 'trap \"\" HUP; exec sleep 30' fakex";

/// Same, but announces readiness to its parent like a real X server.
pub const FAKE_X_READY: &str = "sh -c 'trap \"\" HUP; kill -USR1 $PPID; exec sleep 30' fakex";

pub const GREETER_COMMAND: &str = "sh -c 'exec sleep 30'";

pub const EVENT_TIMEOUT: Duration = Duration::from_secs(5);

pub const PAM_SERVICE: &str = "ldm";
pub const AUTOLOGIN_SERVICE: &str = "ldm-autologin";

// ============================================================================
// Fixture
// ============================================================================

/// A throwaway system: accounts, homes, themes, sessions and daemon dirs.
pub struct Fixture {
    pub dir: TempDir,
    pub passwd: PathBuf,
}

impl Fixture {
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("create temp dir");
        let root = dir.path();
        let uid = unistd::getuid().as_raw();
        let gid = unistd::getgid().as_raw();

        for sub in [
            "home/greeter",
            "home/alice",
            "home/bob",
            "run",
            "log",
            "cache",
            "themes/test",
            "xsessions",
        ] {
            fs::create_dir_all(root.join(sub)).expect("create fixture dir");
        }

        let home = root.join("home");
        let passwd = root.join("passwd");
        fs::write(
            &passwd,
            format!(
                "ldm-greeter:x:{uid}:{gid}:Login Greeter:{greeter}:/usr/sbin/nologin\n\
                 alice:secret:{uid}:{gid}:Alice Liddell,,,:{alice}:/bin/sh\n\
                 bob::{uid}:{gid}:Bob:{bob}:/bin/sh\n",
                greeter = home.join("greeter").display(),
                alice = home.join("alice").display(),
                bob = home.join("bob").display(),
            ),
        )
        .expect("write passwd");

        fs::write(
            root.join("themes/test/index.theme"),
            format!("[theme]\ncommand={GREETER_COMMAND}\n"),
        )
        .expect("write theme");

        fs::write(
            root.join("xsessions/gnome.desktop"),
            "[Desktop Entry]\nName=GNOME\nComment=The GNOME desktop\nExec=sh -c 'exec sleep 30'\n",
        )
        .expect("write gnome session");
        fs::write(
            root.join("xsessions/smooth.desktop"),
            "[Desktop Entry]\nName=Smooth\nExec=sh -c 'exec sleep 30'\nX-LightDM-Supports-Transitions=true\n",
        )
        .expect("write smooth session");
        fs::write(
            root.join("xsessions/failsafe.desktop"),
            "[Desktop Entry]\nName=Failsafe\nExec=xterm\nNoDisplay=true\n",
        )
        .expect("write hidden session");

        Self { dir, passwd }
    }

    pub fn path(&self, sub: &str) -> PathBuf {
        self.dir.path().join(sub)
    }

    pub fn home(&self, user: &str) -> PathBuf {
        self.path("home").join(user)
    }

    pub fn identities(&self) -> IdentitySource {
        IdentitySource::PasswdFile(self.passwd.clone())
    }

    /// Passwd-file authentication; `passwordless` services never prompt.
    pub fn auth(&self, passwordless: &[&str]) -> AuthBackend {
        AuthBackend::PasswdFile(PasswdFileAuth {
            path: self.passwd.clone(),
            passwordless_services: passwordless.iter().map(|s| s.to_string()).collect(),
        })
    }

    pub fn settings(&self) -> DisplaySettings {
        DisplaySettings {
            identities: self.identities(),
            auth: self.auth(&[AUTOLOGIN_SERVICE]),
            pam_service: PAM_SERVICE.to_string(),
            pam_autologin_service: AUTOLOGIN_SERVICE.to_string(),
            greeter_user: None,
            greeter_theme: "test".to_string(),
            themes_directory: self.path("themes"),
            xsessions_directory: self.path("xsessions"),
            default_session: "gnome".to_string(),
            default_language: "en_US.UTF-8".to_string(),
            default_layout: "us".to_string(),
            session_wrapper: None,
            run_directory: self.path("run"),
            log_directory: self.path("log"),
            cache_directory: self.path("cache"),
            default_user: None,
            default_user_timeout: 0,
        }
    }
}

// ============================================================================
// Greeter link
// ============================================================================

/// Accepts greeter pipes and hands the outboxes to the test.
#[derive(Default)]
pub struct RecordingLink {
    pipes: Mutex<Vec<ChildPipes>>,
    outboxes: Mutex<Vec<(DisplayId, mpsc::UnboundedReceiver<DaemonMessage>)>>,
}

impl RecordingLink {
    /// Outbox of the most recently attached greeter of `display`.
    pub fn take_outbox(&self, display: DisplayId) -> mpsc::UnboundedReceiver<DaemonMessage> {
        let mut outboxes = self.outboxes.lock().expect("outboxes lock");
        let index = outboxes
            .iter()
            .rposition(|(id, _)| *id == display)
            .expect("greeter attached");
        outboxes.remove(index).1
    }

    pub fn attached(&self) -> usize {
        self.pipes.lock().expect("pipes lock").len()
    }
}

impl GreeterLink for RecordingLink {
    fn attach(
        &self,
        display: DisplayId,
        pipes: ChildPipes,
    ) -> Option<mpsc::UnboundedSender<DaemonMessage>> {
        let (tx, rx) = mpsc::unbounded_channel();
        self.pipes.lock().expect("pipes lock").push(pipes);
        self.outboxes
            .lock()
            .expect("outboxes lock")
            .push((display, rx));
        Some(tx)
    }
}

// ============================================================================
// Control-loop stand-in
// ============================================================================

/// Owns what the daemon actor would own so tests can drive displays and
/// seats through the same entry points.
pub struct Harness {
    pub registry: ProcessRegistry,
    pub exits: mpsc::UnboundedReceiver<ProcessExit>,
    pub pam_events: mpsc::UnboundedReceiver<PamEvent>,
    pub timers: mpsc::UnboundedReceiver<TimerEvent>,
    pam_tx: mpsc::UnboundedSender<PamEvent>,
    timer_tx: mpsc::UnboundedSender<TimerEvent>,
    pub link: RecordingLink,
}

impl Harness {
    pub fn new() -> Self {
        let (registry, exits) = ProcessRegistry::new();
        let (pam_tx, pam_events) = mpsc::unbounded_channel();
        let (timer_tx, timers) = mpsc::unbounded_channel();
        Self {
            registry,
            exits,
            pam_events,
            timers,
            pam_tx,
            timer_tx,
            link: RecordingLink::default(),
        }
    }

    pub fn ctx(&mut self) -> DisplayContext<'_> {
        DisplayContext {
            registry: &mut self.registry,
            pam_events: &self.pam_tx,
            timers: &self.timer_tx,
            tracker: Tracker::disabled(),
            greeters: &self.link,
        }
    }

    /// Next PAM event that is already queued.
    pub fn queued_pam_event(&mut self) -> Option<PamEvent> {
        self.pam_events.try_recv().ok()
    }

    /// Next process exit, reaped from the registry.
    pub async fn next_exit(&mut self) -> (ProcessExit, ProcessKey) {
        let exit = timeout(EVENT_TIMEOUT, self.exits.recv())
            .await
            .expect("process exit in time")
            .expect("exit channel open");
        let key = self.registry.reap(exit.pid).expect("exit of a registered process");
        (exit, key)
    }

    /// Feeds every queued PAM event to `display`, including events produced
    /// while handling earlier ones.
    pub async fn pump_pam(&mut self, display: &mut Display) -> usize {
        let mut handled = 0;
        while let Some(event) = self.queued_pam_event() {
            display.handle_pam_event(event, &mut self.ctx()).await;
            handled += 1;
        }
        handled
    }

    /// Waits for the next exit and routes it to `display`.
    pub async fn route_exit(&mut self, display: &mut Display) -> (ProcessKey, Transition) {
        let (exit, key) = self.next_exit().await;
        assert_eq!(key.display, display.id(), "exit belongs to the display");
        let transition = display
            .handle_process_exit(key.role, exit.pid, exit.kind, &mut self.ctx())
            .await;
        (key, transition)
    }
}

// ============================================================================
// Helpers
// ============================================================================

pub fn terminate(pid: u32) {
    signal::kill(Pid::from_raw(pid as i32), Signal::SIGTERM).expect("send SIGTERM");
}

pub fn read(path: &Path) -> String {
    fs::read_to_string(path).unwrap_or_default()
}

/// Next message the display pushed to its greeter.
pub fn next_message(outbox: &mut mpsc::UnboundedReceiver<DaemonMessage>) -> DaemonMessage {
    outbox.try_recv().expect("message for the greeter")
}
