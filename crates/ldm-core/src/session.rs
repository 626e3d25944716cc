//! X session descriptors (`<xsessions>/<key>.desktop`).

use std::fs;
use std::path::{Path, PathBuf};

use freedesktop_entry_parser::parse_entry;
use tracing::debug;

use crate::error::{DomainError, DomainResult};

const SECTION: &str = "Desktop Entry";
const THEME_SECTION: &str = "theme";

/// One installable session type.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionDescriptor {
    /// File stem, e.g. `gnome` for `gnome.desktop`.
    pub key: String,
    pub name: String,
    pub comment: String,
    /// Launch command line.
    pub exec: String,
    /// Whether the session may start while the greeter is still shown.
    pub supports_transitions: bool,
    /// `NoDisplay` or `Hidden`: loadable but not offered to greeters.
    pub hidden: bool,
}

impl SessionDescriptor {
    /// Loads `<dir>/<key>.desktop`.
    pub fn load(dir: &Path, key: &str) -> DomainResult<Self> {
        Self::from_file(&dir.join(format!("{key}.desktop")))
    }

    pub fn from_file(path: &Path) -> DomainResult<Self> {
        let entry = parse_entry(path).map_err(|e| DomainError::io(path, e))?;
        let section = entry.section(SECTION);

        let key = path
            .file_stem()
            .and_then(|s| s.to_str())
            .unwrap_or_default()
            .to_string();
        let exec = section
            .attr("Exec")
            .filter(|exec| !exec.trim().is_empty())
            .ok_or_else(|| DomainError::MissingKey {
                path: path.to_path_buf(),
                key: "Exec".to_string(),
            })?
            .to_string();

        Ok(Self {
            name: section.attr("Name").unwrap_or(&key).to_string(),
            comment: section.attr("Comment").unwrap_or_default().to_string(),
            supports_transitions: is_true(section.attr("X-LightDM-Supports-Transitions")),
            hidden: is_true(section.attr("NoDisplay")) || is_true(section.attr("Hidden")),
            exec,
            key,
        })
    }

    /// Every selectable session in `dir`, sorted by key.
    ///
    /// Unreadable directories and malformed descriptors are skipped.
    pub fn list(dir: &Path) -> Vec<Self> {
        let Ok(entries) = fs::read_dir(dir) else {
            debug!(dir = %dir.display(), "Sessions directory not readable");
            return Vec::new();
        };

        let mut sessions: Vec<Self> = entries
            .filter_map(Result::ok)
            .map(|entry| entry.path())
            .filter(|path| path.extension().is_some_and(|ext| ext == "desktop"))
            .filter_map(|path| match Self::from_file(&path) {
                Ok(session) => Some(session),
                Err(e) => {
                    debug!(error = %e, "Skipping session descriptor");
                    None
                }
            })
            .filter(|session| !session.hidden)
            .collect();

        sessions.sort_by(|a, b| a.key.cmp(&b.key));
        sessions
    }

    /// The command actually launched: `exec` run through the wrapper if one
    /// is configured.
    pub fn command_line(&self, wrapper: Option<&str>) -> String {
        match wrapper {
            Some(wrapper) if !wrapper.trim().is_empty() => {
                format!("{wrapper} '{}'", self.exec)
            }
            _ => self.exec.clone(),
        }
    }
}

fn is_true(value: Option<&str>) -> bool {
    value.is_some_and(|v| v.trim().eq_ignore_ascii_case("true"))
}

/// A greeter theme: `<themes>/<name>/index.theme` with a `[theme]` group.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GreeterTheme {
    pub name: String,
    pub command: String,
    pub path: PathBuf,
}

impl GreeterTheme {
    pub fn load(themes_dir: &Path, name: &str) -> DomainResult<Self> {
        let path = themes_dir.join(name).join("index.theme");
        let entry = parse_entry(&path).map_err(|e| DomainError::io(&path, e))?;
        let command = entry
            .section(THEME_SECTION)
            .attr("command")
            .map(str::trim)
            .filter(|c| !c.is_empty())
            .ok_or_else(|| DomainError::MissingKey {
                path: path.clone(),
                key: "command".to_string(),
            })?
            .to_string();

        Ok(Self {
            name: name.to_string(),
            command,
            path,
        })
    }
}
