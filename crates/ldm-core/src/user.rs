//! Identity resolution.
//!
//! A [`User`] is an immutable snapshot taken at lookup time. Lookups go to the
//! system account database through `pwd`, or to a flat passwd-format file
//! when the daemon runs in test mode.

use std::fs;
use std::path::{Path, PathBuf};

use crate::error::{DomainError, DomainResult};

/// Snapshot of one account.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct User {
    pub name: String,
    pub uid: u32,
    pub gid: u32,
    pub gecos: String,
    pub home: PathBuf,
    pub shell: String,
}

impl User {
    /// The display name: the first comma-separated GECOS field.
    pub fn real_name(&self) -> &str {
        self.gecos.split(',').next().unwrap_or_default()
    }

    /// Path of the user's face image, if present.
    pub fn image(&self) -> Option<PathBuf> {
        let face = self.home.join(".face");
        face.is_file().then_some(face)
    }
}

impl From<pwd::Passwd> for User {
    fn from(entry: pwd::Passwd) -> Self {
        Self {
            name: entry.name,
            uid: entry.uid,
            gid: entry.gid,
            gecos: entry.gecos.unwrap_or_default(),
            home: PathBuf::from(entry.dir),
            shell: entry.shell,
        }
    }
}

/// One line of a passwd-format file, including the password field.
#[derive(Debug, Clone)]
pub struct PasswdEntry {
    pub user: User,
    pub password: String,
}

/// Parses `name:password:uid:gid:gecos:home:shell`.
///
/// Returns `None` for comments, blank lines and malformed lines.
pub fn parse_passwd_line(line: &str) -> Option<PasswdEntry> {
    let line = line.trim_end();
    if line.is_empty() || line.starts_with('#') {
        return None;
    }

    let mut fields = line.split(':');
    let name = fields.next()?.to_string();
    let password = fields.next()?.to_string();
    let uid = fields.next()?.parse().ok()?;
    let gid = fields.next()?.parse().ok()?;
    let gecos = fields.next()?.to_string();
    let home = PathBuf::from(fields.next()?);
    let shell = fields.next().unwrap_or_default().to_string();

    if name.is_empty() {
        return None;
    }

    Some(PasswdEntry {
        user: User {
            name,
            uid,
            gid,
            gecos,
            home,
            shell,
        },
        password,
    })
}

/// Reads every entry of a passwd-format file.
pub fn read_passwd_file(path: &Path) -> DomainResult<Vec<PasswdEntry>> {
    let contents = fs::read_to_string(path).map_err(|e| DomainError::io(path, e))?;
    Ok(contents.lines().filter_map(parse_passwd_line).collect())
}

/// Where identities come from.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum IdentitySource {
    /// The system account database.
    #[default]
    System,
    /// A flat passwd-format file, for deterministic tests.
    PasswdFile(PathBuf),
}

impl IdentitySource {
    /// Environment variable that selects [`IdentitySource::PasswdFile`].
    pub const PASSWD_FILE_ENV: &'static str = "LDM_PASSWD_FILE";

    /// Looks up an identity by name.
    pub fn by_name(&self, name: &str) -> DomainResult<User> {
        let unknown = || DomainError::UnknownUser {
            name: name.to_string(),
        };

        match self {
            Self::System => pwd::Passwd::from_name(name)
                .map_err(|e| DomainError::ParseError {
                    field: "passwd".to_string(),
                    reason: format!("{e:?}"),
                })?
                .map(User::from)
                .ok_or_else(unknown),
            Self::PasswdFile(path) => read_passwd_file(path)?
                .into_iter()
                .map(|entry| entry.user)
                .find(|user| user.name == name)
                .ok_or_else(unknown),
        }
    }

    /// Looks up an identity by uid.
    pub fn by_uid(&self, uid: u32) -> DomainResult<User> {
        match self {
            Self::System => pwd::Passwd::from_uid(uid)
                .map(User::from)
                .ok_or(DomainError::UnknownUid { uid }),
            Self::PasswdFile(path) => read_passwd_file(path)?
                .into_iter()
                .map(|entry| entry.user)
                .find(|user| user.uid == uid)
                .ok_or(DomainError::UnknownUid { uid }),
        }
    }

    /// The identity the daemon itself runs as.
    pub fn current(&self) -> DomainResult<User> {
        self.by_uid(nix::unistd::getuid().as_raw())
    }

    /// Every identity in the source, in file order.
    pub fn all(&self) -> DomainResult<Vec<User>> {
        match self {
            Self::System => Ok(pwd::Passwd::iter().map(User::from).collect()),
            Self::PasswdFile(path) => Ok(read_passwd_file(path)?
                .into_iter()
                .map(|entry| entry.user)
                .collect()),
        }
    }

    /// Identities a greeter should offer: regular uids, a login shell,
    /// not explicitly hidden. Sorted by name.
    pub fn login_candidates(&self, filter: &UserFilter) -> DomainResult<Vec<User>> {
        let mut users: Vec<User> = self
            .all()?
            .into_iter()
            .filter(|user| filter.accepts(user))
            .collect();
        users.sort_by(|a, b| a.name.cmp(&b.name));
        users.dedup_by(|a, b| a.name == b.name);
        Ok(users)
    }
}

/// Rules for which accounts appear in the greeter's user list.
#[derive(Debug, Clone)]
pub struct UserFilter {
    pub minimum_uid: u32,
    pub hidden_users: Vec<String>,
    pub hidden_shells: Vec<String>,
}

impl UserFilter {
    pub fn accepts(&self, user: &User) -> bool {
        if user.uid < self.minimum_uid {
            return false;
        }
        if self.hidden_users.iter().any(|name| name == &user.name) {
            return false;
        }
        !self
            .hidden_shells
            .iter()
            .any(|shell| user.shell == *shell || user.shell.ends_with(&format!("/{shell}")))
    }
}
