use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::vec;

use crate::core::safe_path::display_relative;

/// Directory names never listed or descended into.
pub const IGNORED_DIRS: [&str; 5] = [".git", "node_modules", "vendor", ".venv", "__pycache__"];

struct Frame {
    entries: vec::IntoIter<PathBuf>,
    level: usize,
}

/// List entries under `start`, relative to `root`, with directories suffixed `/`.
///
/// Entries directly under `start` are level 1; directories are descended into
/// while their level is below `depth`. Listing stops once `max_entries` are
/// collected. Symlinked directories are listed but not followed. The result is
/// sorted.
pub fn list_tree(root: &Path, start: &Path, depth: usize, max_entries: usize) -> io::Result<Vec<String>> {
    let mut results: Vec<String> = Vec::new();
    if depth == 0 || max_entries == 0 || !start.is_dir() {
        return Ok(results);
    }

    let mut stack = vec![Frame {
        entries: sorted_children(start)?.into_iter(),
        level: 1,
    }];
    while let Some(frame) = stack.last_mut() {
        let Some(path) = frame.entries.next() else {
            stack.pop();
            continue;
        };
        let level = frame.level;
        let relative = display_relative(root, &path);
        let is_dir = fs::symlink_metadata(&path)
            .map(|meta| meta.is_dir())
            .unwrap_or(false);
        if is_dir {
            results.push(format!("{relative}/"));
            if results.len() >= max_entries {
                break;
            }
            if level < depth {
                // Unreadable directories are listed but not expanded.
                if let Ok(children) = sorted_children(&path) {
                    stack.push(Frame {
                        entries: children.into_iter(),
                        level: level + 1,
                    });
                }
            }
        } else {
            results.push(relative);
            if results.len() >= max_entries {
                break;
            }
        }
    }

    results.sort();
    Ok(results)
}

fn sorted_children(dir: &Path) -> io::Result<Vec<PathBuf>> {
    let mut children = Vec::new();
    for entry in fs::read_dir(dir)? {
        let entry = entry?;
        let name = entry.file_name();
        if IGNORED_DIRS.iter().any(|ignored| name == *ignored) {
            continue;
        }
        children.push(entry.path());
    }
    children.sort();
    Ok(children)
}
