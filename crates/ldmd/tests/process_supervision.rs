//! Integration tests for child process supervision.
//!
//! Tests CAN use `.unwrap()` and `.expect()`.

mod common;

use std::path::PathBuf;

use nix::sys::signal::Signal;
use nix::unistd;
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::net::unix::pipe;
use tokio::time::timeout;

use ldm_core::{DisplayId, User};
use ldmd::process::{
    ChildProcess, ExitKind, ProcessError, ProcessExit, ProcessKey, ProcessRegistry, ProcessRole,
    StopOutcome,
};

use common::{read, EVENT_TIMEOUT};

fn key() -> ProcessKey {
    ProcessKey::new(DisplayId::new(1), ProcessRole::Session)
}

async fn next_exit(exits: &mut tokio::sync::mpsc::UnboundedReceiver<ProcessExit>) -> ProcessExit {
    timeout(EVENT_TIMEOUT, exits.recv())
        .await
        .expect("exit in time")
        .expect("exit channel open")
}

fn current_user(home: PathBuf) -> User {
    User {
        name: "tester".to_string(),
        uid: unistd::getuid().as_raw(),
        gid: unistd::getgid().as_raw(),
        gecos: String::new(),
        home,
        shell: "/bin/sh".to_string(),
    }
}

#[tokio::test]
async fn test_exit_status_reported_once() {
    let (mut registry, mut exits) = ProcessRegistry::new();
    let mut process = ChildProcess::new();

    process
        .start(&mut registry, key(), None, None, "sh -c 'exit 3'", false)
        .unwrap();
    let pid = process.pid();
    assert!(pid != 0);
    assert_eq!(registry.lookup(pid), Some(key()));

    let exit = next_exit(&mut exits).await;
    assert_eq!(exit.pid, pid);
    assert_eq!(exit.kind, ExitKind::Exited(3));

    assert_eq!(registry.reap(pid), Some(key()));
    assert_eq!(registry.reap(pid), None);
    process.mark_exited();
    assert!(!process.is_running());
}

#[tokio::test]
async fn test_environment_reaches_child() {
    let (mut registry, mut exits) = ProcessRegistry::new();
    let mut process = ChildProcess::new();
    process.set_env("FOO", "bar");
    assert_eq!(process.env("FOO"), Some("bar"));

    process
        .start(&mut registry, key(), None, None, "sh -c 'test \"$FOO\" = bar'", false)
        .unwrap();

    assert_eq!(next_exit(&mut exits).await.kind, ExitKind::Exited(0));
}

#[tokio::test]
async fn test_output_goes_to_log_file() {
    let dir = tempfile::tempdir().unwrap();
    let log = dir.path().join("child.log");
    let (mut registry, mut exits) = ProcessRegistry::new();
    let mut process = ChildProcess::new();
    process.set_log_file(&log);

    process
        .start(&mut registry, key(), None, None, "sh -c 'echo out; echo err >&2'", false)
        .unwrap();
    next_exit(&mut exits).await;

    let contents = read(&log);
    assert!(contents.contains("out"));
    assert!(contents.contains("err"));
}

#[tokio::test]
async fn test_linked_log_file_refused() {
    let dir = tempfile::tempdir().unwrap();
    let victim = dir.path().join("victim");
    std::fs::write(&victim, "root:SECRET\n").unwrap();
    let log = dir.path().join(".xsession-errors");
    std::os::unix::fs::symlink(&victim, &log).unwrap();
    let user = current_user(dir.path().to_path_buf());

    let (mut registry, _exits) = ProcessRegistry::new();
    let mut process = ChildProcess::new();
    process.set_log_file(&log);
    let err = process
        .start(&mut registry, key(), Some(&user), None, "true", false)
        .unwrap_err();

    assert!(matches!(err, ProcessError::LogFile { .. }));
    assert!(!process.is_running());
    assert!(registry.is_empty());
    assert_eq!(read(&victim), "root:SECRET\n");
}

#[tokio::test]
async fn test_home_is_working_directory() {
    let dir = tempfile::tempdir().unwrap();
    let home = dir.path().join("home");
    std::fs::create_dir(&home).unwrap();
    let log = dir.path().join("pwd.log");
    let user = current_user(home.clone());

    let (mut registry, mut exits) = ProcessRegistry::new();
    let mut process = ChildProcess::new();
    process.set_log_file(&log);
    process
        .start(&mut registry, key(), Some(&user), None, "pwd", false)
        .unwrap();

    assert_eq!(next_exit(&mut exits).await.kind, ExitKind::Exited(0));
    let expected = home.canonicalize().unwrap();
    assert_eq!(PathBuf::from(read(&log).trim()), expected);
}

#[tokio::test]
async fn test_stop_terminates() {
    let (mut registry, mut exits) = ProcessRegistry::new();
    let mut process = ChildProcess::new();
    process
        .start(&mut registry, key(), None, None, "sh -c 'exec sleep 30'", false)
        .unwrap();

    process.stop();
    let exit = next_exit(&mut exits).await;
    assert_eq!(exit.kind, ExitKind::Terminated(Signal::SIGTERM as i32));
}

#[tokio::test]
async fn test_second_start_rejected() {
    let (mut registry, _exits) = ProcessRegistry::new();
    let mut process = ChildProcess::new();
    process
        .start(&mut registry, key(), None, None, "sleep 30", false)
        .unwrap();
    let pid = process.pid();

    let err = process
        .start(&mut registry, key(), None, None, "sleep 30", false)
        .unwrap_err();
    assert!(matches!(err, ProcessError::AlreadyRunning { pid: p } if p == pid));
    assert_eq!(registry.len(), 1);
}

#[tokio::test]
async fn test_invalid_command_lines() {
    let (mut registry, _exits) = ProcessRegistry::new();
    for command in ["", "   ", "sh -c 'unbalanced"] {
        let mut process = ChildProcess::new();
        let err = process
            .start(&mut registry, key(), None, None, command, false)
            .unwrap_err();
        assert!(matches!(err, ProcessError::InvalidCommand(_)), "{command:?}");
        assert!(!process.is_running());
    }
    assert!(registry.is_empty());
}

#[tokio::test]
async fn test_pipe_connects_child() {
    let (mut registry, mut exits) = ProcessRegistry::new();
    let mut process = ChildProcess::new();
    let pipes = process
        .start(
            &mut registry,
            key(),
            None,
            None,
            "sh -c 'echo ping >&\"$LDM_TO_SERVER_FD\"'",
            true,
        )
        .unwrap()
        .expect("pipes requested");

    let from_child = pipe::Receiver::from_owned_fd(pipes.from_child).unwrap();
    let mut received = String::new();
    timeout(EVENT_TIMEOUT, BufReader::new(from_child).read_line(&mut received))
        .await
        .expect("child output in time")
        .unwrap();

    assert_eq!(received, "ping\n");
    assert_eq!(next_exit(&mut exits).await.kind, ExitKind::Exited(0));
}

#[tokio::test]
async fn test_stop_all_drains_registry() {
    let (mut registry, mut exits) = ProcessRegistry::new();
    let mut first = ChildProcess::new();
    let mut second = ChildProcess::new();
    first
        .start(&mut registry, key(), None, None, "sleep 30", false)
        .unwrap();
    second
        .start(&mut registry, key(), None, None, "sleep 30", false)
        .unwrap();

    assert_eq!(registry.stop_all(), StopOutcome::Signalled(2));
    assert!(!registry.is_drained());

    for _ in 0..2 {
        let exit = next_exit(&mut exits).await;
        registry.reap(exit.pid).unwrap();
    }
    assert!(registry.is_drained());

    let mut late = ChildProcess::new();
    let err = late
        .start(&mut registry, key(), None, None, "sleep 30", false)
        .unwrap_err();
    assert!(matches!(err, ProcessError::ShuttingDown));
}
