//! Child processes with a deadline and bounded output capture.
//!
//! Pipes are drained on their own threads while the child runs so a chatty
//! command cannot block on a full pipe.

use std::io::Read;
use std::path::Path;
use std::process::{Command, ExitStatus, Stdio};
use std::thread::{self, JoinHandle};
use std::time::Duration;

use anyhow::{Context, Result, anyhow, bail};
use tracing::{debug, instrument, warn};
use wait_timeout::ChildExt;

const READ_CHUNK: usize = 8192;

/// Bytes kept from one output stream and the count dropped past the limit.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Capture {
    pub bytes: Vec<u8>,
    pub dropped: usize,
}

impl Capture {
    /// Lossy UTF-8 text with a truncation marker when bytes were dropped.
    pub fn text(&self, stream: &str) -> String {
        let mut text = String::from_utf8_lossy(&self.bytes).into_owned();
        if self.dropped > 0 {
            text.push_str(&format!("\n[{stream} truncated {} bytes]\n", self.dropped));
        }
        text
    }
}

#[derive(Debug)]
pub struct CommandOutput {
    pub status: ExitStatus,
    pub stdout: Capture,
    pub stderr: Capture,
    pub timed_out: bool,
}

impl CommandOutput {
    /// Exit code, or `-1` when the process was killed by a signal.
    pub fn exit_code(&self) -> i32 {
        self.status.code().unwrap_or(-1)
    }

    pub fn stdout_text(&self) -> String {
        self.stdout.text("stdout")
    }

    pub fn stderr_text(&self) -> String {
        let mut text = self.stderr.text("stderr");
        if self.timed_out {
            text.push_str("\n[command timed out]\n");
        }
        text
    }
}

/// Run `argv` directly (no shell) in `cwd`, killing it after `timeout`.
///
/// Each stream keeps at most `limit` bytes; the rest is drained and counted.
#[instrument(skip_all, fields(program = argv.first().map(String::as_str), timeout_secs = timeout.as_secs()))]
pub fn run_captured(argv: &[String], cwd: &Path, timeout: Duration, limit: usize) -> Result<CommandOutput> {
    let Some((program, args)) = argv.split_first() else {
        bail!("empty command");
    };
    let mut child = Command::new(program)
        .args(args)
        .current_dir(cwd)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .spawn()
        .with_context(|| format!("spawn {program}"))?;
    debug!(cwd = %cwd.display(), "spawned command");

    let stdout = capture_in_background(
        child.stdout.take().ok_or_else(|| anyhow!("stdout was not piped"))?,
        limit,
    );
    let stderr = capture_in_background(
        child.stderr.take().ok_or_else(|| anyhow!("stderr was not piped"))?,
        limit,
    );

    let (status, timed_out) = match child.wait_timeout(timeout).context("wait for command")? {
        Some(status) => (status, false),
        None => {
            warn!(timeout_secs = timeout.as_secs(), "command timed out, killing");
            child.kill().context("kill command")?;
            (child.wait().context("reap killed command")?, true)
        }
    };
    let output = CommandOutput {
        status,
        stdout: collect(stdout).context("capture stdout")?,
        stderr: collect(stderr).context("capture stderr")?,
        timed_out,
    };
    if output.stdout.dropped > 0 || output.stderr.dropped > 0 {
        debug!(
            stdout_dropped = output.stdout.dropped,
            stderr_dropped = output.stderr.dropped,
            "output truncated"
        );
    }
    debug!(exit_code = output.exit_code(), timed_out, "command finished");
    Ok(output)
}

/// Drain `reader` on a new thread, keeping at most `limit` bytes.
pub(crate) fn capture_in_background<R>(reader: R, limit: usize) -> JoinHandle<Result<Capture>>
where
    R: Read + Send + 'static,
{
    thread::spawn(move || capture(reader, limit))
}

pub(crate) fn collect(handle: JoinHandle<Result<Capture>>) -> Result<Capture> {
    handle
        .join()
        .map_err(|_| anyhow!("output reader thread panicked"))?
}

fn capture<R: Read>(mut reader: R, limit: usize) -> Result<Capture> {
    let mut captured = Capture::default();
    let mut chunk = [0u8; READ_CHUNK];
    loop {
        let read = reader.read(&mut chunk).context("read output")?;
        if read == 0 {
            return Ok(captured);
        }
        let keep = read.min(limit.saturating_sub(captured.bytes.len()));
        captured.bytes.extend_from_slice(&chunk[..keep]);
        captured.dropped += read - keep;
    }
}
