//! Repository selection under the workspaces directory.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::debug;

use crate::core::safe_path::{PathError, safe_path};

#[derive(Debug, Error)]
pub enum WorkspaceError {
    #[error("workspaces directory not found: {0}")]
    MissingWorkspaces(String),
    #[error("repository not found: {0}")]
    RepoNotFound(String),
    #[error("repository outside workspaces directory: {0}")]
    OutsideWorkspaces(String),
    #[error("no repository selected ({0} candidates)")]
    NoRepoSelected(usize),
    #[error(transparent)]
    Path(#[from] PathError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

/// Repository directories directly under `workspaces`, sorted by name.
///
/// Hidden entries are skipped.
pub fn list_repos(workspaces: &Path) -> Result<Vec<PathBuf>, WorkspaceError> {
    if !workspaces.is_dir() {
        return Ok(Vec::new());
    }
    let mut repos = Vec::new();
    for entry in fs::read_dir(workspaces)? {
        let entry = entry?;
        if entry.file_name().to_string_lossy().starts_with('.') {
            continue;
        }
        if entry.path().is_dir() {
            repos.push(entry.path());
        }
    }
    repos.sort();
    Ok(repos)
}

/// Resolve the repository a job works in.
///
/// A hint names a directory under `workspaces` (relative, or absolute but
/// inside it). Without a hint the single repository present is used.
pub fn resolve_repo_root(workspaces: &Path, hint: Option<&str>) -> Result<PathBuf, WorkspaceError> {
    let workspaces = workspaces
        .canonicalize()
        .map_err(|_| WorkspaceError::MissingWorkspaces(workspaces.display().to_string()))?;

    let hint = hint.map(str::trim).filter(|hint| !hint.is_empty());
    let Some(hint) = hint else {
        let mut repos = list_repos(&workspaces)?;
        return match repos.len() {
            1 => Ok(repos.remove(0)),
            count => Err(WorkspaceError::NoRepoSelected(count)),
        };
    };

    let candidate = if Path::new(hint).is_absolute() {
        PathBuf::from(hint)
    } else {
        safe_path(&workspaces, hint)?
    };
    let resolved = candidate
        .canonicalize()
        .map_err(|_| WorkspaceError::RepoNotFound(hint.to_string()))?;
    if !resolved.is_dir() {
        return Err(WorkspaceError::RepoNotFound(hint.to_string()));
    }
    // Symlinks may point anywhere; the check runs on the canonical path.
    if !resolved.starts_with(&workspaces) {
        return Err(WorkspaceError::OutsideWorkspaces(hint.to_string()));
    }
    debug!(repo = %resolved.display(), "resolved repository");
    Ok(resolved)
}

/// Test command for a repository, from its manifest files.
///
/// `configured` wins when set. Returns `None` when nothing is recognized.
pub fn detect_test_command(repo_root: &Path, configured: Option<&str>) -> Option<String> {
    if let Some(command) = configured.map(str::trim).filter(|c| !c.is_empty()) {
        return Some(command.to_string());
    }
    let has = |name: &str| repo_root.join(name).exists();
    let command = if has("Cargo.toml") {
        "cargo test"
    } else if has("package.json") {
        "npm test"
    } else if has("pyproject.toml") || has("requirements.txt") {
        "python -m pytest"
    } else if has("composer.json") {
        if has("vendor/bin/phpunit") || has("phpunit.xml") || has("phpunit.xml.dist") {
            "php vendor/bin/phpunit"
        } else {
            "composer test"
        }
    } else {
        return None;
    };
    Some(command.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn workspaces() -> tempfile::TempDir {
        let temp = tempfile::tempdir().expect("tempdir");
        fs::create_dir_all(temp.path().join("alpha")).expect("alpha");
        temp
    }

    #[test]
    fn single_repo_is_picked_without_hint() {
        let temp = workspaces();
        fs::create_dir_all(temp.path().join(".hidden")).expect("hidden");
        let root = resolve_repo_root(temp.path(), None).expect("resolve");
        assert!(root.ends_with("alpha"));
    }

    #[test]
    fn several_repos_need_a_hint() {
        let temp = workspaces();
        fs::create_dir_all(temp.path().join("beta")).expect("beta");
        assert!(matches!(
            resolve_repo_root(temp.path(), Some("  ")),
            Err(WorkspaceError::NoRepoSelected(2))
        ));
        let root = resolve_repo_root(temp.path(), Some("beta")).expect("resolve");
        assert!(root.ends_with("beta"));
    }

    #[test]
    fn hints_must_stay_inside_workspaces() {
        let temp = workspaces();
        assert!(matches!(
            resolve_repo_root(temp.path(), Some("../elsewhere")),
            Err(WorkspaceError::Path(PathError::Escape(_)))
        ));
        let outside = tempfile::tempdir().expect("outside");
        let hint = outside.path().to_string_lossy().into_owned();
        assert!(matches!(
            resolve_repo_root(temp.path(), Some(&hint)),
            Err(WorkspaceError::OutsideWorkspaces(_))
        ));
        assert!(matches!(
            resolve_repo_root(temp.path(), Some("missing")),
            Err(WorkspaceError::RepoNotFound(_))
        ));
    }

    #[test]
    fn detects_test_command_from_manifests() {
        let temp = tempfile::tempdir().expect("tempdir");
        assert_eq!(detect_test_command(temp.path(), None), None);
        fs::write(temp.path().join("composer.json"), "{}").expect("composer");
        assert_eq!(
            detect_test_command(temp.path(), None).as_deref(),
            Some("composer test")
        );
        fs::write(temp.path().join("package.json"), "{}").expect("package");
        assert_eq!(
            detect_test_command(temp.path(), None).as_deref(),
            Some("npm test")
        );
        assert_eq!(
            detect_test_command(temp.path(), Some("make check")).as_deref(),
            Some("make check")
        );
    }
}
