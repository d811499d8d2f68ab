use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::core::patch::{FsError, RepoFs};
use crate::core::safe_path::safe_path;

/// [`RepoFs`] over a real directory. Every path goes through [`safe_path`].
#[derive(Debug, Clone)]
pub struct DiskRepo {
    root: PathBuf,
}

impl DiskRepo {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn resolve(&self, relative: &str) -> Result<PathBuf, FsError> {
        Ok(safe_path(&self.root, relative)?)
    }
}

fn io_error(action: &'static str, path: &str, source: io::Error) -> FsError {
    FsError::Io {
        action,
        path: path.to_string(),
        source,
    }
}

impl RepoFs for DiskRepo {
    fn read(&self, path: &str) -> Result<Option<String>, FsError> {
        let target = self.resolve(path)?;
        match fs::read(&target) {
            Ok(bytes) => Ok(Some(String::from_utf8_lossy(&bytes).into_owned())),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(io_error("read", path, err)),
        }
    }

    fn write(&self, path: &str, contents: &str) -> Result<(), FsError> {
        let target = self.resolve(path)?;
        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent).map_err(|err| io_error("create parent of", path, err))?;
        }
        fs::write(&target, contents).map_err(|err| io_error("write", path, err))
    }

    fn remove(&self, path: &str) -> Result<(), FsError> {
        let target = self.resolve(path)?;
        match fs::remove_file(&target) {
            Ok(()) => Ok(()),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(()),
            Err(err) => Err(io_error("remove", path, err)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_creates_parents_and_read_round_trips() {
        let temp = tempfile::tempdir().expect("tempdir");
        let repo = DiskRepo::new(temp.path());
        repo.write("src/deep/lib.rs", "fn a() {}\n").expect("write");
        assert_eq!(
            repo.read("src/deep/lib.rs").expect("read").as_deref(),
            Some("fn a() {}\n")
        );
        assert_eq!(repo.read("missing.rs").expect("read"), None);
    }

    #[test]
    fn remove_ignores_missing_files() {
        let temp = tempfile::tempdir().expect("tempdir");
        let repo = DiskRepo::new(temp.path());
        repo.remove("nope.txt").expect("remove missing");
        repo.write("a.txt", "a").expect("write");
        repo.remove("a.txt").expect("remove");
        assert!(!temp.path().join("a.txt").exists());
    }

    #[test]
    fn escaping_paths_are_rejected() {
        let temp = tempfile::tempdir().expect("tempdir");
        let repo = DiskRepo::new(temp.path().join("repo"));
        assert!(matches!(
            repo.write("../outside.txt", "x"),
            Err(FsError::Path(_))
        ));
        assert!(!temp.path().join("outside.txt").exists());
    }
}
