//! Virtual terminal allocation and switching.
//!
//! VTs are only handed out when the daemon runs as root; an unprivileged
//! daemon (test mode, nested servers) never touches the console.

use std::fs::OpenOptions;
use std::os::fd::AsRawFd;
use std::path::PathBuf;

use nix::unistd;
use tracing::{debug, info, warn};

/// Highest VT considered when allocating.
const MAX_VT: u32 = 63;

const CONSOLE: &str = "/dev/tty0";

nix::ioctl_write_int_bad!(vt_activate, 0x5606);
nix::ioctl_write_int_bad!(vt_wait_active, 0x5607);

/// Device path of a VT, as handed to session trackers.
pub fn device_path(vt: u32) -> PathBuf {
    PathBuf::from(format!("/dev/tty{vt}"))
}

/// Lowest VT ≥ `minimum` that exists and is not already used by a display.
///
/// Returns `None` when the daemon is unprivileged or nothing is free.
pub fn allocate(minimum: u32, in_use: &[u32]) -> Option<u32> {
    if !unistd::getuid().is_root() {
        debug!("Not running as root, no VT allocated");
        return None;
    }

    let vt = (minimum.max(1)..=MAX_VT)
        .find(|vt| !in_use.contains(vt) && device_path(*vt).exists());
    match vt {
        Some(vt) => debug!(vt, "Allocated VT"),
        None => warn!(minimum, "No free VT"),
    }
    vt
}

/// Brings `vt` to the foreground and waits until the switch completes.
pub fn activate(vt: u32) -> std::io::Result<()> {
    let console = OpenOptions::new().write(true).open(CONSOLE)?;
    let fd = console.as_raw_fd();
    let number = libc::c_int::try_from(vt)
        .map_err(|_| std::io::Error::from(std::io::ErrorKind::InvalidInput))?;

    // SAFETY: `fd` is an open console descriptor for the duration of both
    // calls and the requests take the VT number by value.
    unsafe {
        vt_activate(fd, number).map_err(std::io::Error::from)?;
        vt_wait_active(fd, number).map_err(std::io::Error::from)?;
    }
    info!(vt, "Switched VT");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_device_path() {
        assert_eq!(device_path(7), PathBuf::from("/dev/tty7"));
    }

    #[test]
    fn test_unprivileged_allocates_nothing() {
        if unistd::getuid().is_root() {
            return;
        }
        assert_eq!(allocate(7, &[]), None);
    }

    #[test]
    fn test_skips_used_vts() {
        if !unistd::getuid().is_root() {
            return;
        }
        if let Some(first) = allocate(7, &[]) {
            assert_ne!(allocate(7, &[first]), Some(first));
        }
    }
}
