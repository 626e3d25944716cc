//! Seats: the displays of one console and which of them is visible.

use std::collections::BTreeSet;
use std::sync::Arc;
use std::time::Duration;

use nix::unistd;
use tracing::{error, info, warn};

use ldm_core::{DaemonConfig, DisplayId, Keyring, SeatConfig};

use crate::display::{
    Display, DisplayContext, DisplayError, DisplaySettings, Timer, TimerEvent, TimerKind, Transition,
};
use crate::vt;
use crate::xserver::{
    allocate_display_number, XAuthority, XServer, XServerConfig, XServerKind, XdmcpAuthentication,
};

/// X server used when the seat does not name one.
const DEFAULT_XSERVER: &str = "X";

/// Nested server used when the daemon itself runs inside an X session.
const NESTED_XSERVER: &str = "Xephyr";

/// Replacement delay after the second consecutive display that died unused;
/// doubles with every further one.
const REPLACE_BACKOFF_BASE: Duration = Duration::from_secs(1);
const REPLACE_BACKOFF_MAX: Duration = Duration::from_secs(30);

/// How long to wait before replacing a display, given how many displays in
/// a row exited without ever being used.
fn replacement_delay(failed_displays: u32) -> Duration {
    match failed_displays {
        0 | 1 => Duration::ZERO,
        n => {
            let factor = 1u32.checked_shl(n - 2).unwrap_or(u32::MAX);
            REPLACE_BACKOFF_BASE
                .saturating_mul(factor)
                .min(REPLACE_BACKOFF_MAX)
        }
    }
}

/// Hands out display ids, display numbers and VTs across all seats.
#[derive(Debug, Default)]
pub struct DisplayAllocator {
    next_id: DisplayId,
    display_numbers: BTreeSet<u32>,
    vts: BTreeSet<u32>,
}

impl DisplayAllocator {
    pub fn new() -> Self {
        Self::default()
    }

    fn next_id(&mut self) -> DisplayId {
        let id = self.next_id;
        self.next_id = id.next();
        id
    }

    fn display_number(&mut self, minimum: u32) -> u32 {
        let in_use: Vec<u32> = self.display_numbers.iter().copied().collect();
        let number = allocate_display_number(minimum, &in_use);
        self.display_numbers.insert(number);
        number
    }

    fn vt(&mut self, minimum: u32) -> Option<u32> {
        let in_use: Vec<u32> = self.vts.iter().copied().collect();
        let vt = vt::allocate(minimum, &in_use)?;
        self.vts.insert(vt);
        Some(vt)
    }

    fn release(&mut self, display_number: u32, vt: Option<u32>) {
        self.display_numbers.remove(&display_number);
        if let Some(vt) = vt {
            self.vts.remove(&vt);
        }
    }
}

/// One console and its displays.
#[derive(Debug)]
pub struct Seat {
    name: String,
    daemon: Arc<DaemonConfig>,
    config: SeatConfig,
    keyring: Keyring,
    settings: Arc<DisplaySettings>,
    displays: Vec<Display>,
    active: Option<DisplayId>,
    can_switch: bool,
    stopping: bool,
    /// Displays in a row that exited before showing a greeter or session.
    failed_displays: u32,
    replacement: Option<Timer>,
}

impl Seat {
    /// `config` is the seat's section already merged over the seat defaults.
    pub fn new(
        name: &str,
        daemon: Arc<DaemonConfig>,
        config: SeatConfig,
        keyring: Keyring,
        settings: DisplaySettings,
    ) -> Self {
        Self {
            name: name.to_string(),
            daemon,
            config,
            keyring,
            settings: Arc::new(settings),
            displays: Vec::new(),
            active: None,
            can_switch: unistd::getuid().is_root(),
            stopping: false,
            failed_displays: 0,
            replacement: None,
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn can_switch(&self) -> bool {
        self.can_switch
    }

    pub fn is_stopping(&self) -> bool {
        self.stopping
    }

    /// True once a stopping seat has lost its last display.
    pub fn is_stopped(&self) -> bool {
        self.stopping && self.displays.is_empty()
    }

    /// True while a replacement display waits for its backoff timer.
    pub fn replacement_pending(&self) -> bool {
        self.replacement.is_some()
    }

    pub fn active_display(&self) -> Option<DisplayId> {
        self.active
    }

    pub fn displays(&self) -> impl Iterator<Item = &Display> {
        self.displays.iter()
    }

    pub fn display(&self, id: DisplayId) -> Option<&Display> {
        self.displays.iter().find(|d| d.id() == id)
    }

    pub fn display_mut(&mut self, id: DisplayId) -> Option<&mut Display> {
        self.displays.iter_mut().find(|d| d.id() == id)
    }

    pub fn owns(&self, id: DisplayId) -> bool {
        self.display(id).is_some()
    }

    /// Brings up the seat's first display and makes it visible.
    pub async fn start(
        &mut self,
        allocator: &mut DisplayAllocator,
        ctx: &mut DisplayContext<'_>,
    ) -> Result<DisplayId, DisplayError> {
        info!(seat = %self.name, "Starting seat");
        let id = self.add_display(allocator, ctx).await?;
        self.set_active_display(id);
        Ok(id)
    }

    /// Configures and starts a new display on this seat.
    pub async fn add_display(
        &mut self,
        allocator: &mut DisplayAllocator,
        ctx: &mut DisplayContext<'_>,
    ) -> Result<DisplayId, DisplayError> {
        let id = allocator.next_id();
        let number = allocator.display_number(self.daemon.minimum_display_number);
        let vt = allocator.vt(self.daemon.minimum_vt);

        let xserver = self.configure_xserver(number, vt);
        let mut display = Display::new(id, self.settings.clone(), xserver);
        let address = display.address();
        info!(seat = %self.name, display = %id, address = %address, vt = ?vt, "Adding display");

        if let Err(e) = display.start(ctx).await {
            error!(seat = %self.name, display = %id, error = %e, "Failed to start display");
            allocator.release(number, vt);
            return Err(e);
        }
        self.displays.push(display);
        Ok(id)
    }

    fn configure_xserver(&self, number: u32, vt: Option<u32>) -> XServer {
        let command = self.config.xserver_command.clone().unwrap_or_else(|| {
            if std::env::var_os("DISPLAY").is_some() {
                NESTED_XSERVER.to_string()
            } else {
                DEFAULT_XSERVER.to_string()
            }
        });

        let mut config = XServerConfig::local(&command, number, vt);
        config.layout = self.config.xserver_layout.clone();
        config.config_file = self.config.xserver_config.clone();

        if let Some(manager) = &self.config.xdmcp_manager {
            config.kind = XServerKind::LocalTerminal;
            config.hostname = Some(manager.clone());
            config.port = self.config.xdmcp_port.unwrap_or(0);
            if let Some(key_name) = &self.config.xdmcp_key {
                match self.keyring.get(key_name) {
                    Some(key) => config.authentication = Some(XdmcpAuthentication::from_key(key)),
                    None => warn!(seat = %self.name, key = %key_name, "XDMCP key not in keyring"),
                }
            }
        }

        let kind = config.kind;
        let mut xserver = XServer::new(config);
        if kind == XServerKind::Local {
            let hostname = unistd::gethostname()
                .ok()
                .and_then(|h| h.into_string().ok())
                .unwrap_or_default();
            let path = self
                .daemon
                .run_directory
                .join("root")
                .join(format!(":{number}"));
            xserver.set_authority(XAuthority::new_cookie(&hostname, number), path);
        }
        xserver.set_log_file(self.daemon.log_directory.join(format!("x-{number}.log")));
        xserver
    }

    /// Makes `id` the visible display, switching VT when it has one.
    pub fn set_active_display(&mut self, id: DisplayId) {
        let Some(display) = self.display(id) else {
            warn!(seat = %self.name, display = %id, "Cannot activate unknown display");
            return;
        };
        if self.can_switch {
            display.activate_vt();
        }
        info!(seat = %self.name, display = %id, "Display activated");
        self.active = Some(id);
    }

    /// Forwards a display's transition; on exit removes it and, unless the
    /// seat is stopping, replaces the active display with a new greeter.
    pub async fn handle_transition(
        &mut self,
        id: DisplayId,
        transition: Transition,
        allocator: &mut DisplayAllocator,
        ctx: &mut DisplayContext<'_>,
    ) {
        if transition == Transition::Exited {
            self.handle_display_exit(id, allocator, ctx).await;
        }
    }

    async fn handle_display_exit(
        &mut self,
        id: DisplayId,
        allocator: &mut DisplayAllocator,
        ctx: &mut DisplayContext<'_>,
    ) {
        let Some(index) = self.displays.iter().position(|d| d.id() == id) else {
            return;
        };
        let removed = self.displays.remove(index);
        allocator.release(removed.xserver().display_number(), removed.vt());
        info!(seat = %self.name, display = %id, "Display removed");

        if self.active != Some(id) {
            return;
        }
        self.active = None;

        if self.stopping {
            return;
        }
        if removed.was_used() {
            self.failed_displays = 0;
        } else {
            self.failed_displays = self.failed_displays.saturating_add(1);
            warn!(
                seat = %self.name,
                display = %id,
                failures = self.failed_displays,
                "Display exited before it was used"
            );
        }
        drop(removed);

        let delay = replacement_delay(self.failed_displays);
        if delay.is_zero() {
            self.add_replacement(id, allocator, ctx).await;
        } else {
            self.schedule_replacement(id, delay, ctx);
        }
    }

    /// A seat timer fired. Returns `false` when it was not this seat's
    /// pending replacement.
    pub async fn handle_timer(
        &mut self,
        event: TimerEvent,
        allocator: &mut DisplayAllocator,
        ctx: &mut DisplayContext<'_>,
    ) -> bool {
        if event.kind != TimerKind::ReplaceDisplay || !Timer::matches(&self.replacement, &event) {
            return false;
        }
        self.replacement = None;
        if !self.stopping {
            self.add_replacement(event.display, allocator, ctx).await;
        }
        true
    }

    async fn add_replacement(
        &mut self,
        removed: DisplayId,
        allocator: &mut DisplayAllocator,
        ctx: &mut DisplayContext<'_>,
    ) {
        match self.add_display(allocator, ctx).await {
            Ok(new_id) => self.set_active_display(new_id),
            Err(e) => {
                error!(seat = %self.name, error = %e, "Failed to replace display");
                self.failed_displays = self.failed_displays.saturating_add(1);
                let delay = replacement_delay(self.failed_displays).max(REPLACE_BACKOFF_BASE);
                self.schedule_replacement(removed, delay, ctx);
            }
        }
    }

    fn schedule_replacement(&mut self, removed: DisplayId, delay: Duration, ctx: &DisplayContext<'_>) {
        info!(seat = %self.name, delay_ms = delay.as_millis() as u64, "Delaying replacement display");
        self.replacement = Some(Timer::arm(removed, TimerKind::ReplaceDisplay, delay, ctx.timers));
    }

    /// Stops every display; replacements are suppressed from now on.
    pub fn stop(&mut self) {
        if self.stopping {
            return;
        }
        info!(seat = %self.name, displays = self.displays.len(), "Stopping seat");
        self.stopping = true;
        self.replacement = None;
        for display in &mut self.displays {
            display.stop();
        }
    }
}
