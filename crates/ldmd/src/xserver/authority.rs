//! X authority records (the `Xauthority` file format).
//!
//! Each record is: family (u16 BE), then address, display number, auth name
//! and auth data, each as a u16 BE length followed by the bytes.

use std::fs;
use std::io::Write;
use std::os::unix::fs::DirBuilderExt;
use std::path::Path;

use ldm_core::{userfile, DomainError, DomainResult, User};
use uuid::Uuid;

/// `FamilyLocal`: connections over the local socket.
pub const FAMILY_LOCAL: u16 = 256;

/// Name of the cookie scheme the daemon issues.
pub const MIT_MAGIC_COOKIE: &str = "MIT-MAGIC-COOKIE-1";

/// One authority record.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct XAuthority {
    pub family: u16,
    pub address: String,
    pub number: String,
    pub name: String,
    pub data: Vec<u8>,
}

impl XAuthority {
    /// A fresh random MIT-MAGIC-COOKIE-1 for a local display.
    pub fn new_cookie(hostname: &str, display_number: u32) -> Self {
        Self {
            family: FAMILY_LOCAL,
            address: hostname.to_string(),
            number: display_number.to_string(),
            name: MIT_MAGIC_COOKIE.to_string(),
            data: Uuid::new_v4().into_bytes().to_vec(),
        }
    }

    /// Serializes the record.
    pub fn encode(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(
            10 + self.address.len() + self.number.len() + self.name.len() + self.data.len(),
        );
        out.extend_from_slice(&self.family.to_be_bytes());
        for field in [
            self.address.as_bytes(),
            self.number.as_bytes(),
            self.name.as_bytes(),
            self.data.as_slice(),
        ] {
            let len = u16::try_from(field.len()).unwrap_or(u16::MAX);
            out.extend_from_slice(&len.to_be_bytes());
            out.extend_from_slice(field.get(..usize::from(len)).unwrap_or(field));
        }
        out
    }

    /// Writes the record to a file readable only by its owner: `owner`
    /// when given, the daemon otherwise. The file is never reached through
    /// a link.
    pub fn write(&self, path: &Path, owner: Option<&User>) -> DomainResult<()> {
        if let Some(dir) = path.parent() {
            fs::DirBuilder::new()
                .recursive(true)
                .mode(0o700)
                .create(dir)
                .map_err(|e| DomainError::Io {
                    path: dir.to_path_buf(),
                    reason: e.to_string(),
                })?;
        }
        let mut file = userfile::create(path, 0o600, owner)?;
        file.write_all(&self.encode())
            .and_then(|()| file.flush())
            .map_err(|e| DomainError::Io {
                path: path.to_path_buf(),
                reason: e.to_string(),
            })
    }

    /// Lower-case hex of the auth data.
    pub fn hex_data(&self) -> String {
        hex(&self.data)
    }
}

pub(crate) fn hex(data: &[u8]) -> String {
    data.iter().map(|b| format!("{b:02x}")).collect()
}
