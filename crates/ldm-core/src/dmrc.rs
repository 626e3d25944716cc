//! Per-user settings (`~/.dmrc`).
//!
//! Stores the last-used session, language, language list and keyboard layout
//! under the `[Desktop]` group. A copy is kept in the daemon's cache directory
//! so settings survive unreadable (e.g. encrypted or remote) home directories.
//!
//! The home copy is read and written through [`crate::userfile`], so a
//! `.dmrc` that is a link to some other file is treated as unusable.

use std::fs;
use std::io::Write;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::{DomainError, DomainResult};
use crate::keyfile::KeyFile;
use crate::user::User;
use crate::userfile;

const GROUP: &str = "Desktop";
const SESSION: &str = "Session";
const LANGUAGE: &str = "Language";
const LANGUAGE_LIST: &str = "Langlist";
const LC_MESSAGES: &str = "LCMess";
const LAYOUT: &str = "Layout";

const HOME_MODE: u32 = 0o644;

/// A user's saved login preferences.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct UserSettings {
    file: KeyFile,
}

impl UserSettings {
    /// Path of the settings file in the user's home directory.
    pub fn home_path(user: &User) -> PathBuf {
        user.home.join(".dmrc")
    }

    /// Path of the cached copy.
    pub fn cache_path(cache_dir: &Path, user: &User) -> PathBuf {
        cache_dir.join("dmrc").join(format!("{}.dmrc", user.name))
    }

    /// Loads settings from the home directory, falling back to the cache.
    /// Missing or unreadable files yield empty settings.
    pub fn load(user: &User, cache_dir: Option<&Path>) -> Self {
        let home = Self::home_path(user);
        match userfile::read_to_string(&home) {
            Ok(text) => return Self { file: KeyFile::parse(&text) },
            Err(e) => debug!(user = %user.name, error = %e, "Home dmrc not usable"),
        }

        if let Some(cache_dir) = cache_dir {
            let cached = Self::cache_path(cache_dir, user);
            if let Ok(file) = KeyFile::load(&cached) {
                debug!(user = %user.name, path = %cached.display(), "Using cached dmrc");
                return Self { file };
            }
        }

        Self::default()
    }

    pub fn session(&self) -> Option<&str> {
        self.get(SESSION)
    }

    pub fn language(&self) -> Option<&str> {
        self.get(LANGUAGE)
    }

    pub fn language_list(&self) -> Option<&str> {
        self.get(LANGUAGE_LIST)
    }

    pub fn lc_messages(&self) -> Option<&str> {
        self.get(LC_MESSAGES)
    }

    pub fn layout(&self) -> Option<&str> {
        self.get(LAYOUT)
    }

    pub fn set_session(&mut self, session: &str) {
        self.file.set(GROUP, SESSION, session);
    }

    pub fn set_layout(&mut self, layout: &str) {
        self.file.set(GROUP, LAYOUT, layout);
    }

    /// Sets the language. A changed language invalidates the derived
    /// language list and message locale, which are removed.
    ///
    /// Returns whether the language changed.
    pub fn set_language(&mut self, language: &str) -> bool {
        if self.language() == Some(language) {
            return false;
        }
        self.file.set(GROUP, LANGUAGE, language);
        self.file.remove(GROUP, LANGUAGE_LIST);
        self.file.remove(GROUP, LC_MESSAGES);
        true
    }

    /// Writes the settings to the home directory (handed to the user when
    /// running privileged) and refreshes the cached copy.
    ///
    /// The home copy is authoritative; a failure to update the cache is only
    /// logged.
    pub fn save(&self, user: &User, cache_dir: Option<&Path>) -> DomainResult<()> {
        let home = Self::home_path(user);
        let owner = Some(user).filter(|_| nix::unistd::getuid().is_root());
        let home_result = userfile::create(&home, HOME_MODE, owner).and_then(|mut file| {
            file.write_all(self.file.to_string().as_bytes())
                .map_err(|e| DomainError::io(&home, e))
        });

        if let Some(cache_dir) = cache_dir {
            let cached = Self::cache_path(cache_dir, user);
            let cache_result = cached
                .parent()
                .map(|dir| fs::create_dir_all(dir).map_err(|e| DomainError::io(dir, e)))
                .unwrap_or(Ok(()))
                .and_then(|()| self.file.save(&cached));
            if let Err(e) = cache_result {
                warn!(user = %user.name, error = %e, "Failed to cache dmrc");
            }

            // An unwritable home is fine as long as the cache holds the values.
            if home_result.is_err() && cached.is_file() {
                debug!(user = %user.name, "Home dmrc not writable, kept cached copy");
                return Ok(());
            }
        }

        home_result
    }

    fn get(&self, key: &str) -> Option<&str> {
        self.file.get(GROUP, key).filter(|v| !v.is_empty())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn user_with_home(home: &Path) -> User {
        User {
            name: "alice".to_string(),
            uid: nix::unistd::getuid().as_raw(),
            gid: nix::unistd::getgid().as_raw(),
            gecos: "Alice".to_string(),
            home: home.to_path_buf(),
            shell: "/bin/sh".to_string(),
        }
    }

    #[test]
    fn test_missing_file_yields_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let settings = UserSettings::load(&user_with_home(dir.path()), None);
        assert_eq!(settings.session(), None);
        assert_eq!(settings.language(), None);
    }

    #[test]
    fn test_language_change_clears_derived_keys() {
        let dir = tempfile::tempdir().unwrap();
        fs::write(
            dir.path().join(".dmrc"),
            "[Desktop]\nLanguage=de_DE.UTF-8\nLanglist=de_DE:de\nLCMess=de_DE\nLayout=de\n",
        )
        .unwrap();

        let user = user_with_home(dir.path());
        let mut settings = UserSettings::load(&user, None);
        assert_eq!(settings.language_list(), Some("de_DE:de"));

        assert!(!settings.set_language("de_DE.UTF-8"));
        assert_eq!(settings.lc_messages(), Some("de_DE"));

        assert!(settings.set_language("en_US.UTF-8"));
        assert_eq!(settings.language(), Some("en_US.UTF-8"));
        assert_eq!(settings.language_list(), None);
        assert_eq!(settings.lc_messages(), None);
        assert_eq!(settings.layout(), Some("de"));
    }

    #[test]
    fn test_save_writes_home_and_cache() {
        let home = tempfile::tempdir().unwrap();
        let cache = tempfile::tempdir().unwrap();
        let user = user_with_home(home.path());

        let mut settings = UserSettings::load(&user, Some(cache.path()));
        settings.set_session("gnome");
        settings.save(&user, Some(cache.path())).unwrap();

        let written = fs::read_to_string(home.path().join(".dmrc")).unwrap();
        assert!(written.contains("Session=gnome"));

        let cached = UserSettings::cache_path(cache.path(), &user);
        assert!(fs::read_to_string(cached).unwrap().contains("Session=gnome"));
    }

    #[test]
    fn test_load_falls_back_to_cache() {
        let cache = tempfile::tempdir().unwrap();
        let user = user_with_home(Path::new("/nonexistent/home/alice"));
        let cached = UserSettings::cache_path(cache.path(), &user);
        fs::create_dir_all(cached.parent().unwrap()).unwrap();
        fs::write(&cached, "[Desktop]\nSession=xfce\n").unwrap();

        let settings = UserSettings::load(&user, Some(cache.path()));
        assert_eq!(settings.session(), Some("xfce"));
    }

    #[test]
    fn test_linked_dmrc_neither_read_nor_written() {
        let dir = tempfile::tempdir().unwrap();
        let home = dir.path().join("home");
        let cache = dir.path().join("cache");
        fs::create_dir(&home).unwrap();
        let victim = dir.path().join("shadow");
        fs::write(&victim, "[Desktop]\nSession=root:SECRET\n").unwrap();
        std::os::unix::fs::symlink(&victim, home.join(".dmrc")).unwrap();

        let user = user_with_home(&home);
        let mut settings = UserSettings::load(&user, None);
        assert_eq!(settings, UserSettings::default());

        settings.set_session("gnome");
        assert!(settings.save(&user, None).is_err());
        // With a cache the values survive, but the link target stays intact.
        settings.save(&user, Some(&cache)).unwrap();
        assert_eq!(
            UserSettings::load(&user, Some(&cache)).session(),
            Some("gnome")
        );
        assert_eq!(
            fs::read_to_string(&victim).unwrap(),
            "[Desktop]\nSession=root:SECRET\n"
        );
    }

    #[test]
    fn test_hard_linked_dmrc_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let victim = dir.path().join("victim");
        fs::write(&victim, "[Desktop]\nLanguage=xx_XX\n").unwrap();
        let home = dir.path().join("home");
        fs::create_dir(&home).unwrap();
        fs::hard_link(&victim, home.join(".dmrc")).unwrap();

        let user = user_with_home(&home);
        let settings = UserSettings::load(&user, None);
        assert_eq!(settings.language(), None);
        assert!(settings.save(&user, None).is_err());
        assert_eq!(fs::read_to_string(&victim).unwrap(), "[Desktop]\nLanguage=xx_XX\n");
    }
}
