//! Append-only product logs with bounded size and offset-based tailing.
//!
//! Each append takes an exclusive OS lock on the file for the duration of one
//! line, so writers in different processes never interleave partial lines.
//! Files are trimmed to their newest `max_bytes` afterwards.

use std::fs::{self, File, OpenOptions};
use std::io::{self, Read, Seek, SeekFrom, Write};
use std::path::Path;

use anyhow::{Context, Result};
use serde::Serialize;
use tracing::debug;

use super::artifacts::{ArtifactLayout, Scope};
use super::clock::now_hms;

pub const DEFAULT_MAX_LOG_BYTES: u64 = 1024 * 1024;

/// Bytes read from a log starting at a caller-held offset.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct LogChunk {
    pub content: String,
    /// Offset to pass to the next `read_chunk` call.
    pub offset: u64,
    pub size: u64,
}

#[derive(Debug, Clone)]
pub struct LogBook {
    layout: ArtifactLayout,
    max_bytes: u64,
}

impl LogBook {
    pub fn new(layout: ArtifactLayout, max_bytes: u64) -> Self {
        Self { layout, max_bytes }
    }

    pub fn layout(&self) -> &ArtifactLayout {
        &self.layout
    }

    /// Append one `[HH:MM:SS] message` line to the log for `scope`.
    pub fn append(&self, scope: Scope, message: &str) -> Result<()> {
        let path = self.layout.log_path(scope);
        let line = format!("[{}] {}\n", now_hms(), message.trim_end());
        append_locked(&path, line.as_bytes())
            .with_context(|| format!("append {}", path.display()))?;
        let trimmed = trim_to_tail(&path, self.max_bytes)
            .with_context(|| format!("trim {}", path.display()))?;
        if trimmed {
            debug!(path = %path.display(), max_bytes = self.max_bytes, "trimmed log");
        }
        Ok(())
    }

    /// Append the same message to `scope` and every enclosing scope.
    pub fn append_all(&self, scope: Scope, message: &str) -> Result<()> {
        for target in scope.lineage() {
            self.append(target, message)?;
        }
        Ok(())
    }

    /// Read from `offset` to the current end of the log.
    ///
    /// A missing log reads as empty. An offset past the end is clamped.
    pub fn read_chunk(&self, scope: Scope, offset: u64) -> Result<LogChunk> {
        let path = self.layout.log_path(scope);
        read_chunk_at(&path, offset).with_context(|| format!("read {}", path.display()))
    }
}

fn append_locked(path: &Path, line: &[u8]) -> io::Result<()> {
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent)?;
    }
    let mut file = OpenOptions::new().create(true).append(true).open(path)?;
    file.lock()?;
    let written = file.write_all(line).and_then(|()| file.flush());
    let unlocked = file.unlock();
    written.and(unlocked)
}

/// Keep only the newest `max_bytes` of the file, starting at a line boundary.
fn trim_to_tail(path: &Path, max_bytes: u64) -> io::Result<bool> {
    let mut file = OpenOptions::new().read(true).write(true).open(path)?;
    file.lock()?;
    let trimmed = rewrite_tail(&mut file, max_bytes);
    let unlocked = file.unlock();
    let trimmed = trimmed?;
    unlocked?;
    Ok(trimmed)
}

fn rewrite_tail(file: &mut File, max_bytes: u64) -> io::Result<bool> {
    let size = file.metadata()?.len();
    if size <= max_bytes {
        return Ok(false);
    }
    let cut = size - max_bytes;
    // Read one byte before the cut to know whether it falls on a line start.
    file.seek(SeekFrom::Start(cut - 1))?;
    let mut tail = Vec::with_capacity(max_bytes as usize + 1);
    file.read_to_end(&mut tail)?;
    let keep_from = if tail.first() == Some(&b'\n') {
        1
    } else {
        tail[1..]
            .iter()
            .position(|byte| *byte == b'\n')
            .map_or(tail.len(), |pos| pos + 2)
    };
    file.set_len(0)?;
    file.seek(SeekFrom::Start(0))?;
    file.write_all(&tail[keep_from..])?;
    file.flush()?;
    Ok(true)
}

fn read_chunk_at(path: &Path, offset: u64) -> io::Result<LogChunk> {
    let mut file = match File::open(path) {
        Ok(file) => file,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(LogChunk::default()),
        Err(err) => return Err(err),
    };
    let size = file.metadata()?.len();
    let offset = offset.min(size);
    file.seek(SeekFrom::Start(offset))?;
    let mut buf = Vec::new();
    file.take(size - offset).read_to_end(&mut buf)?;

    // Leave an incomplete trailing UTF-8 sequence for the next read.
    if let Err(err) = std::str::from_utf8(&buf)
        && err.error_len().is_none()
    {
        buf.truncate(err.valid_up_to());
    }
    let next = offset + buf.len() as u64;
    Ok(LogChunk {
        content: String::from_utf8_lossy(&buf).into_owned(),
        offset: next,
        size,
    })
}
