//! Daemon actor - owns every seat and runs the control loop.
//!
//! The actor is the single owner of seats, displays and the process
//! registry. Greeter requests arrive as commands; process exits, signals,
//! PAM events and timers arrive on their own channels. Everything is
//! handled sequentially in one task.
//!
//! # Panic-Free Guarantees
//!
//! - No `.unwrap()`, `.expect()`, `panic!()`, `unreachable!()`, `todo!()`
//! - Responses to dropped requesters are ignored
//! - Broadcast send failures (no subscribers) are ignored

use std::collections::BTreeMap;

use nix::sys::signal::Signal;
use tokio::sync::{broadcast, mpsc};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use ldm_core::{DisplayId, DisplayState};

use super::commands::{
    DaemonCommand, DaemonError, DaemonEvent, DaemonStatus, DisplayStatus, SeatStatus,
};
use crate::display::{Display, DisplayContext, GreeterLink, TimerEvent, TimerKind};
use crate::pam::PamEvent;
use crate::process::{
    ProcessExit, ProcessRegistry, ProcessRole, SignalEvent, SignalPipe, StopOutcome,
};
use crate::seat::{DisplayAllocator, Seat};
use crate::tracking::Tracker;

// ============================================================================
// Services
// ============================================================================

/// What displays borrow from the actor while handling an event.
pub(super) struct Services {
    pub registry: ProcessRegistry,
    pub pam_events: mpsc::UnboundedSender<PamEvent>,
    pub timers: mpsc::UnboundedSender<TimerEvent>,
    pub tracker: Tracker,
    pub greeters: Box<dyn GreeterLink>,
}

impl Services {
    fn context(&mut self) -> DisplayContext<'_> {
        DisplayContext {
            registry: &mut self.registry,
            pam_events: &self.pam_events,
            timers: &self.timers,
            tracker: self.tracker,
            greeters: self.greeters.as_ref(),
        }
    }
}

/// Receiving ends of the actor's event sources.
pub(super) struct Inbox {
    pub commands: mpsc::Receiver<DaemonCommand>,
    pub exits: mpsc::UnboundedReceiver<ProcessExit>,
    pub pam_events: mpsc::UnboundedReceiver<PamEvent>,
    pub timers: mpsc::UnboundedReceiver<TimerEvent>,
    pub signals: Option<SignalPipe>,
}

// ============================================================================
// Daemon Actor
// ============================================================================

/// The daemon actor.
///
/// Runs until a shutdown (command or SIGTERM/SIGINT) has stopped every
/// seat and the last supervised process has been reaped.
pub struct DaemonActor {
    inbox: Inbox,
    commands_closed: bool,
    event_publisher: broadcast::Sender<DaemonEvent>,
    stopped: CancellationToken,
    seats: Vec<Seat>,
    allocator: DisplayAllocator,
    services: Services,
    stopping: bool,
    /// Seat and state of each display as last published.
    published: BTreeMap<DisplayId, (String, DisplayState)>,
}

impl DaemonActor {
    pub(super) fn new(
        inbox: Inbox,
        services: Services,
        seats: Vec<Seat>,
        event_publisher: broadcast::Sender<DaemonEvent>,
        stopped: CancellationToken,
    ) -> Self {
        Self {
            inbox,
            commands_closed: false,
            event_publisher,
            stopped,
            seats,
            allocator: DisplayAllocator::new(),
            services,
            stopping: false,
            published: BTreeMap::new(),
        }
    }

    /// Runs the control loop. Call this in a spawned task.
    pub async fn run(mut self) {
        info!(seats = self.seats.len(), "Daemon actor starting");
        self.start_seats().await;
        self.publish_changes();

        while !self.services.registry.is_drained() {
            tokio::select! {
                cmd = self.inbox.commands.recv(), if !self.commands_closed => match cmd {
                    Some(cmd) => self.handle_command(cmd).await,
                    None => {
                        debug!("All daemon handles dropped");
                        self.commands_closed = true;
                    }
                },
                Some(exit) = self.inbox.exits.recv() => self.handle_process_exit(exit).await,
                signal = next_signal(&mut self.inbox.signals) => match signal {
                    Some(event) => self.handle_signal(event).await,
                    None => {
                        warn!("Signal pipe closed");
                        self.inbox.signals = None;
                    }
                },
                Some(event) = self.inbox.pam_events.recv() => self.handle_pam_event(event).await,
                Some(event) = self.inbox.timers.recv() => self.handle_timer(event).await,
                else => break,
            }
            self.publish_changes();
        }

        info!("Daemon actor stopped");
        let _ = self.event_publisher.send(DaemonEvent::Stopped);
        self.stopped.cancel();
    }

    async fn start_seats(&mut self) {
        let mut started = 0;
        for seat in &mut self.seats {
            let mut ctx = self.services.context();
            match seat.start(&mut self.allocator, &mut ctx).await {
                Ok(id) => {
                    info!(seat = %seat.name(), display = %id, "Seat started");
                    started += 1;
                }
                Err(e) => error!(seat = %seat.name(), error = %e, "Failed to start seat"),
            }
        }
        if started == 0 {
            error!("No seat could be started");
            self.stop();
        }
    }

    // ========================================================================
    // Commands
    // ========================================================================

    async fn handle_command(&mut self, cmd: DaemonCommand) {
        match cmd {
            DaemonCommand::GreeterConnected {
                display,
                respond_to,
            } => {
                let result = self
                    .locate(display)
                    .map(|(display, mut ctx)| display.greeter_connected(&mut ctx));
                let _ = respond_to.send(result);
            }
            DaemonCommand::StartAuthentication {
                display,
                username,
                respond_to,
            } => {
                let result = self.locate(display).and_then(|(display, mut ctx)| {
                    display
                        .start_authentication(&username, &mut ctx)
                        .map_err(DaemonError::from)
                });
                let _ = respond_to.send(result);
            }
            DaemonCommand::ProvideSecret {
                display,
                secret,
                respond_to,
            } => {
                let result = self.locate(display).and_then(|(display, _)| {
                    display.provide_secret(&secret).map_err(DaemonError::from)
                });
                let _ = respond_to.send(result);
            }
            DaemonCommand::CancelAuthentication {
                display,
                respond_to,
            } => {
                let result = self.locate(display).and_then(|(display, _)| {
                    display.cancel_authentication().map_err(DaemonError::from)
                });
                let _ = respond_to.send(result);
            }
            DaemonCommand::Login {
                display,
                username,
                session,
                language,
                respond_to,
            } => {
                let result = match self.locate(display) {
                    Ok((display, mut ctx)) => display
                        .login(&username, &session, &language, &mut ctx)
                        .await
                        .map_err(DaemonError::from),
                    Err(e) => Err(e),
                };
                let _ = respond_to.send(result);
            }
            DaemonCommand::LoggedInUsers { respond_to } => {
                let _ = respond_to.send(self.logged_in_users());
            }
            DaemonCommand::Status { respond_to } => {
                let _ = respond_to.send(self.status());
            }
            DaemonCommand::Shutdown { respond_to } => {
                info!("Shutdown requested");
                self.stop();
                let _ = respond_to.send(());
            }
        }
    }

    /// A display and the context to drive it with.
    fn locate(
        &mut self,
        id: DisplayId,
    ) -> Result<(&mut Display, DisplayContext<'_>), DaemonError> {
        let display = self
            .seats
            .iter_mut()
            .find_map(|seat| seat.display_mut(id))
            .ok_or(DaemonError::DisplayNotFound(id))?;
        Ok((display, self.services.context()))
    }

    fn logged_in_users(&self) -> Vec<String> {
        let mut users: Vec<String> = self
            .seats
            .iter()
            .flat_map(|seat| seat.displays())
            .filter_map(|display| display.session_user())
            .map(str::to_string)
            .collect();
        users.sort();
        users.dedup();
        users
    }

    fn status(&self) -> DaemonStatus {
        DaemonStatus {
            seats: self
                .seats
                .iter()
                .map(|seat| SeatStatus {
                    name: seat.name().to_string(),
                    active: seat.active_display(),
                    stopping: seat.is_stopping(),
                    displays: seat
                        .displays()
                        .map(|display| DisplayStatus {
                            id: display.id(),
                            address: display.address(),
                            state: display.state(),
                            vt: display.vt(),
                            greeter_pid: display.greeter_pid(),
                            session_pid: display.session_pid(),
                            session_user: display.session_user().map(str::to_string),
                        })
                        .collect(),
                })
                .collect(),
            processes: self.services.registry.len(),
        }
    }

    // ========================================================================
    // Events
    // ========================================================================

    async fn handle_process_exit(&mut self, exit: ProcessExit) {
        let Some(key) = self.services.registry.reap(exit.pid) else {
            debug!(pid = exit.pid, "Exit of an unregistered process");
            return;
        };

        let Some(seat) = self.seats.iter_mut().find(|seat| seat.owns(key.display)) else {
            debug!(pid = exit.pid, display = %key.display, "Exit of a process from a removed display");
            return;
        };
        let mut ctx = self.services.context();
        let Some(display) = seat.display_mut(key.display) else {
            return;
        };
        let transition = display
            .handle_process_exit(key.role, exit.pid, exit.kind, &mut ctx)
            .await;
        seat.handle_transition(key.display, transition, &mut self.allocator, &mut ctx)
            .await;

        let seats_empty = self
            .seats
            .iter()
            .all(|seat| seat.displays().next().is_none() && !seat.replacement_pending());
        if !self.stopping && seats_empty {
            error!("No displays left");
            self.stop();
        }
    }

    async fn handle_signal(&mut self, event: SignalEvent) {
        if let Some(key) = self.services.registry.lookup(event.sender) {
            if event.signal == Signal::SIGUSR1 && key.role == ProcessRole::XServer {
                if let Ok((display, mut ctx)) = self.locate(key.display) {
                    display.handle_xserver_ready(&mut ctx).await;
                }
            } else {
                debug!(signal = %event.signal, pid = event.sender, role = %key.role, "Signal from child");
            }
            return;
        }

        match event.signal {
            Signal::SIGTERM | Signal::SIGINT => {
                info!(signal = %event.signal, sender = event.sender, "Caught signal, shutting down");
                self.stop();
            }
            Signal::SIGHUP => info!("Caught SIGHUP, configuration is only read at startup"),
            Signal::SIGUSR2 => self.log_status(),
            other => debug!(signal = %other, sender = event.sender, "Ignoring signal"),
        }
    }

    async fn handle_pam_event(&mut self, event: PamEvent) {
        match self.locate(event.display) {
            Ok((display, mut ctx)) => display.handle_pam_event(event, &mut ctx).await,
            Err(_) => debug!(display = %event.display, "PAM event for a removed display"),
        }
    }

    async fn handle_timer(&mut self, event: TimerEvent) {
        if event.kind == TimerKind::ReplaceDisplay {
            let mut ctx = self.services.context();
            for seat in &mut self.seats {
                if seat.handle_timer(event, &mut self.allocator, &mut ctx).await {
                    return;
                }
            }
            debug!(display = %event.display, "Replacement timer for no seat");
            return;
        }
        match self.locate(event.display) {
            Ok((display, _)) => display.handle_timer(event),
            Err(_) => debug!(display = %event.display, "Timer for a removed display"),
        }
    }

    /// Stops every seat and terminates whatever is still running.
    fn stop(&mut self) {
        self.stopping = true;
        for seat in &mut self.seats {
            seat.stop();
        }
        match self.services.registry.stop_all() {
            StopOutcome::Drained => info!("Nothing left running"),
            StopOutcome::Signalled(count) => info!(count, "Waiting for processes to exit"),
        }
    }

    fn log_status(&self) {
        let status = self.status();
        info!(
            seats = status.seats.len(),
            displays = status.display_count(),
            processes = status.processes,
            "Daemon status"
        );
        for seat in &status.seats {
            for d in &seat.displays {
                info!(
                    seat = %seat.name,
                    display = %d.id,
                    address = %d.address,
                    state = %d.state,
                    user = ?d.session_user,
                    "Display status"
                );
            }
        }
    }

    /// Broadcasts displays added, removed or changed since the last call.
    fn publish_changes(&mut self) {
        let current: BTreeMap<DisplayId, (String, DisplayState)> = self
            .seats
            .iter()
            .flat_map(|seat| {
                seat.displays()
                    .map(move |display| (display.id(), (seat.name().to_string(), display.state())))
            })
            .collect();

        for (id, (seat, state)) in &current {
            match self.published.get(id) {
                None => {
                    self.publish(DaemonEvent::DisplayAdded {
                        seat: seat.clone(),
                        display: *id,
                    });
                    self.publish(DaemonEvent::StateChanged {
                        display: *id,
                        state: *state,
                    });
                }
                Some((_, previous)) if previous != state => {
                    self.publish(DaemonEvent::StateChanged {
                        display: *id,
                        state: *state,
                    });
                }
                Some(_) => {}
            }
        }
        for (id, (seat, _)) in &self.published {
            if !current.contains_key(id) {
                self.publish(DaemonEvent::DisplayRemoved {
                    seat: seat.clone(),
                    display: *id,
                });
            }
        }
        self.published = current;
    }

    fn publish(&self, event: DaemonEvent) {
        if self.event_publisher.send(event).is_err() {
            debug!("No event subscribers");
        }
    }
}

/// Next signal, or never when no pipe is installed.
async fn next_signal(signals: &mut Option<SignalPipe>) -> Option<SignalEvent> {
    match signals {
        Some(pipe) => pipe.recv().await,
        None => std::future::pending().await,
    }
}
