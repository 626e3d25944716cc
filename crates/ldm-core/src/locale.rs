//! Language and keyboard layout lists offered to greeters.

/// XKB rules file listing layouts.
pub const XKB_RULES_LIST: &str = "/usr/share/X11/xkb/rules/evdev.lst";

/// Parses `locale -a` output, dropping the `C` and `POSIX` pseudo-locales.
pub fn parse_locale_list(output: &str) -> Vec<String> {
    output
        .lines()
        .map(str::trim)
        .filter(|line| !line.is_empty() && *line != "C" && *line != "POSIX")
        .map(str::to_string)
        .collect()
}

/// One keyboard layout.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct KeyboardLayout {
    pub name: String,
    pub description: String,
}

/// Parses the `! layout` section of an XKB `.lst` rules file.
pub fn parse_xkb_layouts(text: &str) -> Vec<KeyboardLayout> {
    let mut in_layouts = false;
    let mut layouts = Vec::new();

    for line in text.lines() {
        let line = line.trim();
        if let Some(section) = line.strip_prefix('!') {
            in_layouts = section.trim() == "layout";
            continue;
        }
        if !in_layouts || line.is_empty() {
            continue;
        }

        let mut parts = line.splitn(2, char::is_whitespace);
        if let Some(name) = parts.next() {
            layouts.push(KeyboardLayout {
                name: name.to_string(),
                description: parts.next().unwrap_or_default().trim().to_string(),
            });
        }
    }

    layouts
}
