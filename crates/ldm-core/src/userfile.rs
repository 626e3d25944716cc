//! Files the daemon opens inside directories a user controls.
//!
//! The final path component is never followed: it is opened with
//! `O_NOFOLLOW` (and `O_NONBLOCK`, so a planted FIFO cannot stall the open)
//! and must turn out to be a regular file with a single link. Ownership is
//! handed over on the open descriptor, never by path.

use std::fs::{File, OpenOptions};
use std::io::Read;
use std::os::unix::fs::{fchown, MetadataExt, OpenOptionsExt};
use std::path::Path;

use nix::libc;

use crate::error::{DomainError, DomainResult};
use crate::user::User;

fn open(path: &Path, options: &mut OpenOptions) -> DomainResult<File> {
    let file = options
        .custom_flags(libc::O_NOFOLLOW | libc::O_NONBLOCK)
        .open(path)
        .map_err(|e| DomainError::io(path, e))?;

    let meta = file.metadata().map_err(|e| DomainError::io(path, e))?;
    if !meta.is_file() {
        return Err(DomainError::io(path, "not a regular file"));
    }
    if meta.nlink() > 1 {
        return Err(DomainError::io(path, "file has other hard links"));
    }
    Ok(file)
}

/// Reads a user-controlled file.
pub fn read_to_string(path: &Path) -> DomainResult<String> {
    let mut file = open(path, OpenOptions::new().read(true))?;
    let mut text = String::new();
    file.read_to_string(&mut text)
        .map_err(|e| DomainError::io(path, e))?;
    Ok(text)
}

/// Opens `path` empty for writing, creating it with `mode` when missing.
/// With `owner` the file is handed to that user.
pub fn create(path: &Path, mode: u32, owner: Option<&User>) -> DomainResult<File> {
    let file = open(path, OpenOptions::new().write(true).create(true).mode(mode))?;
    file.set_len(0).map_err(|e| DomainError::io(path, e))?;
    if let Some(user) = owner {
        fchown(&file, Some(user.uid), Some(user.gid)).map_err(|e| DomainError::io(path, e))?;
    }
    Ok(file)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;
    use std::io::Write;
    use std::os::unix::fs::symlink;

    #[test]
    fn test_create_truncates_regular_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("log");
        fs::write(&path, "old contents").unwrap();

        let mut file = create(&path, 0o600, None).unwrap();
        file.write_all(b"new").unwrap();
        assert_eq!(fs::read_to_string(&path).unwrap(), "new");
        assert_eq!(read_to_string(&path).unwrap(), "new");
    }

    #[test]
    fn test_symlink_not_followed() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        let link = dir.path().join("link");
        fs::write(&target, "keep me").unwrap();
        symlink(&target, &link).unwrap();

        assert!(read_to_string(&link).is_err());
        assert!(create(&link, 0o600, None).is_err());
        assert_eq!(fs::read_to_string(&target).unwrap(), "keep me");
    }

    #[test]
    fn test_hard_link_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let target = dir.path().join("target");
        let link = dir.path().join("link");
        fs::write(&target, "keep me").unwrap();
        fs::hard_link(&target, &link).unwrap();

        assert!(read_to_string(&link).is_err());
        assert!(create(&link, 0o600, None).is_err());
        assert_eq!(fs::read_to_string(&target).unwrap(), "keep me");
    }

    #[test]
    fn test_directory_rejected() {
        let dir = tempfile::tempdir().unwrap();
        assert!(read_to_string(dir.path()).is_err());
    }
}
