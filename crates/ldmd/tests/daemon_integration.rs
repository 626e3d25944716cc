//! End-to-end test of the daemon actor with signal routing.
//!
//! Installs the process-wide signal pipe, so this binary holds a single test.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

mod common;

use std::time::Duration;

use tokio::time::{sleep, timeout};

use ldm_core::{DisplayState, LdmConfig};
use ldmd::daemon::{spawn_daemon, DaemonEvent, DaemonHandle, DaemonOptions, DaemonStatus};

use common::{Fixture, AUTOLOGIN_SERVICE, EVENT_TIMEOUT, FAKE_X_READY};

fn config(fixture: &Fixture) -> LdmConfig {
    let mut config = LdmConfig::default();
    let daemon = &mut config.daemon;
    daemon.run_directory = fixture.path("run");
    daemon.log_directory = fixture.path("log");
    daemon.cache_directory = fixture.path("cache");
    daemon.xsessions_directory = fixture.path("xsessions");
    daemon.themes_directory = fixture.path("themes");
    daemon.keys_file = fixture.path("keys.toml");
    daemon.default_greeter_theme = "test".to_string();
    daemon.default_xsession = "gnome".to_string();
    daemon.minimum_display_number = 160;
    daemon.session_tracking = false;
    daemon.seats = vec!["seat0".to_string()];
    config.seat_defaults.xserver_command = Some(FAKE_X_READY.to_string());
    config
}

/// Polls the daemon until `check` accepts its status.
async fn wait_for_status(handle: &DaemonHandle, check: impl Fn(&DaemonStatus) -> bool) -> DaemonStatus {
    timeout(EVENT_TIMEOUT, async {
        loop {
            let status = handle.status().await.unwrap();
            if check(&status) {
                return status;
            }
            sleep(Duration::from_millis(20)).await;
        }
    })
    .await
    .expect("daemon reached the expected status")
}

#[tokio::test]
async fn test_daemon_shows_greeter_and_shuts_down() {
    let fixture = Fixture::new();
    let mut options = DaemonOptions::new(config(&fixture));
    options.identities = fixture.identities();
    options.auth = fixture.auth(&[AUTOLOGIN_SERVICE]);

    let handle = spawn_daemon(options).unwrap();
    let mut events = handle.subscribe();

    // The fake X server signals readiness, which brings up the greeter.
    let status = wait_for_status(&handle, |status| {
        status
            .seats
            .iter()
            .flat_map(|seat| seat.displays.iter())
            .any(|d| d.state == DisplayState::Greeter && d.greeter_pid.is_some())
    })
    .await;

    assert_eq!(status.seats.len(), 1);
    let seat = &status.seats[0];
    assert_eq!(seat.name, "seat0");
    assert!(!seat.stopping);
    let active = seat.active.expect("active display");
    let display = status.display(active).expect("active display in status");
    assert_eq!(display.address, ":160");
    assert_eq!(display.session_user, None);
    assert_eq!(status.processes, 2);

    assert!(handle.logged_in_users().await.is_empty());

    handle.shutdown().await.unwrap();

    let stopped = handle.stopped();
    timeout(EVENT_TIMEOUT, async {
        loop {
            match events.recv().await {
                Ok(DaemonEvent::Stopped) => break,
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Closed) => break,
            }
        }
        stopped.cancelled().await;
    })
    .await
    .expect("daemon stopped in time");

    assert!(handle.is_stopped());
    assert!(!fixture.path("run/root/:160").exists());
}
