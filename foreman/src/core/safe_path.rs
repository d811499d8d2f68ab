//! Lexical confinement of repository-relative paths to a root directory.

use std::path::{Component, Path, PathBuf};

use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PathError {
    #[error("absolute paths are not allowed: {0}")]
    Absolute(String),
    #[error("path escapes repository root: {0}")]
    Escape(String),
}

/// Resolve `relative` against `root` without touching the filesystem.
///
/// Absolute inputs (`/x`, `\x`, `C:\x`, `C:/x`) are rejected. `..` segments are
/// resolved lexically and may never climb above `root`, so the result always
/// equals `root` or lives under it.
pub fn safe_path(root: &Path, relative: &str) -> Result<PathBuf, PathError> {
    let mut resolved = lexical_normalize(root);
    let relative = relative.trim();
    if relative.is_empty() {
        return Ok(resolved);
    }
    if looks_absolute(relative) {
        return Err(PathError::Absolute(relative.to_string()));
    }
    let unified = relative.replace('\\', "/");
    let mut depth = 0usize;
    for component in Path::new(&unified).components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if depth == 0 {
                    return Err(PathError::Escape(relative.to_string()));
                }
                resolved.pop();
                depth -= 1;
            }
            Component::Normal(segment) => {
                resolved.push(segment);
                depth += 1;
            }
            Component::RootDir | Component::Prefix(_) => {
                return Err(PathError::Absolute(relative.to_string()));
            }
        }
    }
    Ok(resolved)
}

/// Path of `absolute` relative to `root`, using `/` separators.
pub fn display_relative(root: &Path, absolute: &Path) -> String {
    let relative = absolute.strip_prefix(root).unwrap_or(absolute);
    relative
        .components()
        .map(|component| component.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

fn looks_absolute(path: &str) -> bool {
    if path.starts_with('/') || path.starts_with('\\') {
        return true;
    }
    let bytes = path.as_bytes();
    bytes.len() >= 3
        && bytes[0].is_ascii_alphabetic()
        && bytes[1] == b':'
        && (bytes[2] == b'/' || bytes[2] == b'\\')
}

fn lexical_normalize(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                out.pop();
            }
            other => out.push(other.as_os_str()),
        }
    }
    out
}
