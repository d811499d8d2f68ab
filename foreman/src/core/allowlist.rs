//! Per-unit file and command allowlists.
//!
//! An empty allowlist allows everything. Paths are compared after lexical
//! normalization and only match on whole segments.

/// Normalize a repository-relative path lexically.
///
/// Backslashes become `/`, `.` segments are dropped and `..` pops the previous
/// segment (it never climbs above the start). The result has no leading or
/// trailing slash and is empty only for an empty or root-equivalent input.
pub fn normalize_relative_path(path: &str) -> String {
    let unified = path.trim().replace('\\', "/");
    let mut parts: Vec<&str> = Vec::new();
    for segment in unified.split('/') {
        match segment {
            "" | "." => {}
            ".." => {
                parts.pop();
            }
            other => parts.push(other),
        }
    }
    parts.join("/")
}

/// Normalized, deduplicated file allowlist.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct PathAllowlist {
    entries: Vec<String>,
}

impl PathAllowlist {
    pub fn new<S: AsRef<str>>(entries: &[S]) -> Self {
        let mut normalized: Vec<String> = Vec::with_capacity(entries.len());
        for entry in entries {
            let entry = normalize_relative_path(entry.as_ref());
            if entry.is_empty() || normalized.contains(&entry) {
                continue;
            }
            normalized.push(entry);
        }
        Self {
            entries: normalized,
        }
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn allows(&self, path: &str) -> bool {
        if self.entries.is_empty() {
            return true;
        }
        let path = normalize_relative_path(path);
        if path.is_empty() {
            return false;
        }
        self.entries.iter().any(|entry| {
            path == *entry
                || path
                    .strip_prefix(entry.as_str())
                    .is_some_and(|rest| rest.starts_with('/'))
        })
    }
}

/// Exact-match allowlist over the first token of a command.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CommandAllowlist {
    entries: Vec<String>,
}

impl CommandAllowlist {
    pub fn new<S: AsRef<str>>(entries: &[S]) -> Self {
        let mut normalized: Vec<String> = Vec::with_capacity(entries.len());
        for entry in entries {
            let entry = entry.as_ref().trim();
            if entry.is_empty() || normalized.iter().any(|seen| seen == entry) {
                continue;
            }
            normalized.push(entry.to_string());
        }
        Self {
            entries: normalized,
        }
    }

    pub fn entries(&self) -> &[String] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn allows(&self, command: &str) -> bool {
        if self.entries.is_empty() {
            return true;
        }
        match first_token(command) {
            Some(token) => self.entries.iter().any(|entry| entry == token),
            None => false,
        }
    }
}

/// First space- or tab-delimited token of a trimmed command.
pub fn first_token(command: &str) -> Option<&str> {
    command
        .trim()
        .split([' ', '\t'])
        .find(|token| !token.is_empty())
}

pub fn is_path_allowed<S: AsRef<str>>(path: &str, allowlist: &[S]) -> bool {
    PathAllowlist::new(allowlist).allows(path)
}

pub fn is_command_allowed<S: AsRef<str>>(command: &str, allowlist: &[S]) -> bool {
    CommandAllowlist::new(allowlist).allows(command)
}
