//! Minimal INI-style key file, read and written in place.
//!
//! Used for `.dmrc` files. Group and key order is preserved across a
//! load/save cycle; comments are dropped.

use std::fmt;
use std::fs;
use std::path::Path;

use crate::error::{DomainError, DomainResult};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
struct Group {
    name: String,
    entries: Vec<(String, String)>,
}

/// Ordered `[group]` / `key=value` document.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyFile {
    groups: Vec<Group>,
}

impl KeyFile {
    pub fn new() -> Self {
        Self::default()
    }

    /// Parses key-file text. Lines outside any group and lines without `=`
    /// are ignored.
    pub fn parse(text: &str) -> Self {
        let mut file = Self::new();
        let mut current: Option<usize> = None;

        for raw in text.lines() {
            let line = raw.trim();
            if line.is_empty() || line.starts_with('#') || line.starts_with(';') {
                continue;
            }

            if let Some(name) = line.strip_prefix('[').and_then(|l| l.strip_suffix(']')) {
                current = Some(file.group_index_or_insert(name.trim()));
                continue;
            }

            let (Some(index), Some((key, value))) = (current, line.split_once('=')) else {
                continue;
            };
            if let Some(group) = file.groups.get_mut(index) {
                upsert(&mut group.entries, key.trim(), value.trim());
            }
        }

        file
    }

    pub fn load(path: &Path) -> DomainResult<Self> {
        let text = fs::read_to_string(path).map_err(|e| DomainError::io(path, e))?;
        Ok(Self::parse(&text))
    }

    pub fn save(&self, path: &Path) -> DomainResult<()> {
        fs::write(path, self.to_string()).map_err(|e| DomainError::io(path, e))
    }

    pub fn get(&self, group: &str, key: &str) -> Option<&str> {
        self.groups
            .iter()
            .find(|g| g.name == group)?
            .entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn set(&mut self, group: &str, key: &str, value: &str) {
        let index = self.group_index_or_insert(group);
        if let Some(group) = self.groups.get_mut(index) {
            upsert(&mut group.entries, key, value);
        }
    }

    /// Removes a key; returns whether it was present.
    pub fn remove(&mut self, group: &str, key: &str) -> bool {
        let Some(group) = self.groups.iter_mut().find(|g| g.name == group) else {
            return false;
        };
        let before = group.entries.len();
        group.entries.retain(|(k, _)| k != key);
        group.entries.len() != before
    }

    fn group_index_or_insert(&mut self, name: &str) -> usize {
        if let Some(index) = self.groups.iter().position(|g| g.name == name) {
            return index;
        }
        self.groups.push(Group {
            name: name.to_string(),
            entries: Vec::new(),
        });
        self.groups.len() - 1
    }
}

fn upsert(entries: &mut Vec<(String, String)>, key: &str, value: &str) {
    match entries.iter_mut().find(|(k, _)| k == key) {
        Some(entry) => entry.1 = value.to_string(),
        None => entries.push((key.to_string(), value.to_string())),
    }
}

impl fmt::Display for KeyFile {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        for (i, group) in self.groups.iter().enumerate() {
            if i > 0 {
                writeln!(f)?;
            }
            writeln!(f, "[{}]", group.name)?;
            for (key, value) in &group.entries {
                writeln!(f, "{key}={value}")?;
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_get() {
        let file = KeyFile::parse("# header\n[Desktop]\nSession=gnome\nLanguage = en_US.UTF-8\n");
        assert_eq!(file.get("Desktop", "Session"), Some("gnome"));
        assert_eq!(file.get("Desktop", "Language"), Some("en_US.UTF-8"));
        assert_eq!(file.get("Desktop", "Layout"), None);
        assert_eq!(file.get("Other", "Session"), None);
    }

    #[test]
    fn test_set_preserves_order_and_replaces() {
        let mut file = KeyFile::parse("[Desktop]\nSession=xfce\nLayout=us\n");
        file.set("Desktop", "Session", "gnome");
        file.set("Desktop", "Language", "de_DE");
        assert_eq!(
            file.to_string(),
            "[Desktop]\nSession=gnome\nLayout=us\nLanguage=de_DE\n"
        );
    }

    #[test]
    fn test_remove() {
        let mut file = KeyFile::parse("[Desktop]\nLangList=de\n");
        assert!(file.remove("Desktop", "LangList"));
        assert!(!file.remove("Desktop", "LangList"));
        assert!(!file.remove("Missing", "LangList"));
    }

    #[test]
    fn test_lines_outside_group_are_ignored() {
        let file = KeyFile::parse("stray=1\n[theme]\ncommand=greeter --x\n");
        assert_eq!(file.get("theme", "command"), Some("greeter --x"));
        assert_eq!(file.to_string(), "[theme]\ncommand=greeter --x\n");
    }
}
