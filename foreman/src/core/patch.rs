//! Strict unified-diff applier.
//!
//! Hunks are applied at their declared position with no fuzz or offset search:
//! any context or removal line that differs from the file is an error. All file
//! sections of a patch are validated before anything is written.

use std::io;
use std::sync::LazyLock;

use regex::Regex;
use thiserror::Error;

use super::safe_path::PathError;

static HUNK_HEADER: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^@@ -(\d+)(?:,(\d+))? \+(\d+)(?:,(\d+))? @@").expect("valid hunk header regex")
});

const DEV_NULL: &str = "/dev/null";

#[derive(Debug, Error)]
pub enum FsError {
    #[error(transparent)]
    Path(#[from] PathError),
    #[error("{action} {path}: {source}")]
    Io {
        action: &'static str,
        path: String,
        #[source]
        source: io::Error,
    },
}

#[derive(Debug, Error)]
pub enum PatchError {
    #[error("invalid patch header at line {line}")]
    InvalidHeader { line: usize },
    #[error("invalid hunk header at line {line}")]
    InvalidHunkHeader { line: usize },
    #[error("hunk at line {line} does not match its header line counts")]
    HunkLength { line: usize },
    #[error("hunk at line {line} starts before the end of the previous hunk")]
    HunkOrder { line: usize },
    #[error("hunk context mismatch in {path} at line {line}")]
    ContextMismatch { path: String, line: usize },
    #[error("hunk removal mismatch in {path} at line {line}")]
    RemovalMismatch { path: String, line: usize },
    #[error("patch contains no files")]
    NoFiles,
    #[error(transparent)]
    Fs(#[from] FsError),
}

/// Minimal file access needed to apply a patch. Paths are repository-relative.
pub trait RepoFs {
    /// Current contents, or `None` when the file does not exist.
    fn read(&self, path: &str) -> Result<Option<String>, FsError>;
    /// Replace contents, creating parent directories.
    fn write(&self, path: &str, contents: &str) -> Result<(), FsError>;
    /// Remove the file if present.
    fn remove(&self, path: &str) -> Result<(), FsError>;
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HunkLine {
    Context(String),
    Remove(String),
    Add(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Hunk {
    /// 1-based line of the `@@` header within the patch.
    pub header_line: usize,
    pub old_start: usize,
    pub old_len: usize,
    pub lines: Vec<HunkLine>,
    /// A `\ No newline at end of file` marker follows the last new-side line.
    pub new_missing_newline: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FilePatch {
    /// `None` for `/dev/null` (creation).
    pub old_path: Option<String>,
    /// `None` for `/dev/null` (deletion).
    pub new_path: Option<String>,
    pub hunks: Vec<Hunk>,
}

impl FilePatch {
    pub fn target(&self) -> &str {
        self.new_path
            .as_deref()
            .or(self.old_path.as_deref())
            .unwrap_or_default()
    }

    pub fn is_creation(&self) -> bool {
        self.old_path.is_none()
    }

    pub fn is_deletion(&self) -> bool {
        self.new_path.is_none()
    }

    /// Apply the hunks to `original`. Returns `None` when the file is deleted.
    pub fn apply(&self, original: Option<&str>) -> Result<Option<String>, PatchError> {
        if self.is_deletion() && original.is_none() {
            return Ok(None);
        }
        let source = match original {
            Some(content) if !self.is_creation() => SourceText::parse(content),
            _ => SourceText::default(),
        };

        let mut output: Vec<(&str, &str)> = Vec::with_capacity(source.lines.len());
        let mut ptr = 0usize;
        for hunk in &self.hunks {
            // A zero-length old range names the line after which to insert.
            let start = if hunk.old_len == 0 {
                hunk.old_start
            } else {
                hunk.old_start.saturating_sub(1)
            };
            if start < ptr {
                return Err(PatchError::HunkOrder {
                    line: hunk.header_line,
                });
            }
            while ptr < start && ptr < source.lines.len() {
                output.push(source.line(ptr));
                ptr += 1;
            }
            // Replacement lines reuse the ending of the line they replace.
            let mut replaced_ending = None;
            for line in &hunk.lines {
                match line {
                    HunkLine::Context(text) => {
                        if source.lines.get(ptr) != Some(&text.as_str()) {
                            return Err(PatchError::ContextMismatch {
                                path: self.target().to_string(),
                                line: ptr + 1,
                            });
                        }
                        output.push(source.line(ptr));
                        ptr += 1;
                        replaced_ending = None;
                    }
                    HunkLine::Remove(text) => {
                        if source.lines.get(ptr) != Some(&text.as_str()) {
                            return Err(PatchError::RemovalMismatch {
                                path: self.target().to_string(),
                                line: ptr + 1,
                            });
                        }
                        replaced_ending.get_or_insert(source.endings[ptr]);
                        ptr += 1;
                    }
                    HunkLine::Add(text) => {
                        let ending = replaced_ending.unwrap_or_else(|| source.ending_near(ptr));
                        output.push((text, ending));
                    }
                }
            }
        }
        if self.is_deletion() {
            return Ok(None);
        }

        let last_hunk_at_eof = ptr == source.lines.len();
        output.extend((ptr.min(source.lines.len())..source.lines.len()).map(|at| source.line(at)));

        let trailing_newline = match self.hunks.last() {
            Some(hunk) if last_hunk_at_eof => !hunk.new_missing_newline,
            _ if source.lines.is_empty() => true,
            _ => source.trailing_newline,
        };
        Ok(Some(render(&output, trailing_newline)))
    }
}

/// File content split into lines, each remembering its own terminator.
#[derive(Debug)]
struct SourceText<'a> {
    lines: Vec<&'a str>,
    endings: Vec<&'static str>,
    trailing_newline: bool,
}

impl Default for SourceText<'_> {
    fn default() -> Self {
        Self {
            lines: Vec::new(),
            endings: Vec::new(),
            trailing_newline: true,
        }
    }
}

impl<'a> SourceText<'a> {
    fn parse(content: &'a str) -> Self {
        let mut lines = Vec::new();
        let mut endings = Vec::new();
        for piece in content.split_inclusive('\n') {
            let (line, ending) = if let Some(line) = piece.strip_suffix("\r\n") {
                (line, "\r\n")
            } else if let Some(line) = piece.strip_suffix('\n') {
                (line, "\n")
            } else {
                (piece, "")
            };
            lines.push(line);
            endings.push(ending);
        }
        // The unterminated last line takes the ending of the line before it.
        if endings.last().is_some_and(|ending: &&str| ending.is_empty()) {
            let fallback = endings_before(&endings);
            if let Some(last) = endings.last_mut() {
                *last = fallback;
            }
        }
        Self {
            lines,
            endings,
            trailing_newline: content.ends_with('\n'),
        }
    }

    fn line(&self, at: usize) -> (&'a str, &'static str) {
        (self.lines[at], self.endings[at])
    }

    /// Ending for a line inserted before `at`.
    fn ending_near(&self, at: usize) -> &'static str {
        self.endings
            .get(at)
            .or_else(|| at.checked_sub(1).and_then(|prev| self.endings.get(prev)))
            .copied()
            .unwrap_or("\n")
    }
}

fn endings_before(endings: &[&'static str]) -> &'static str {
    endings
        .iter()
        .rev()
        .copied()
        .find(|ending| !ending.is_empty())
        .unwrap_or("\n")
}

fn render(lines: &[(&str, &str)], trailing_newline: bool) -> String {
    let mut out = String::new();
    for (at, (text, ending)) in lines.iter().enumerate() {
        out.push_str(text);
        if at + 1 < lines.len() || trailing_newline {
            out.push_str(ending);
        }
    }
    out
}

/// Parse every `---`/`+++` file section of a unified diff.
pub fn parse_unified_diff(patch: &str) -> Result<Vec<FilePatch>, PatchError> {
    let lines: Vec<&str> = patch.lines().collect();
    let mut files = Vec::new();
    let mut i = 0usize;
    while i < lines.len() {
        let Some(old_raw) = lines[i].strip_prefix("--- ") else {
            i += 1;
            continue;
        };
        let Some(new_raw) = lines.get(i + 1).and_then(|line| line.strip_prefix("+++ ")) else {
            return Err(PatchError::InvalidHeader { line: i + 1 });
        };
        let old_path = header_path(old_raw);
        let new_path = header_path(new_raw);
        if (old_path.is_none() && new_path.is_none())
            || [&old_path, &new_path]
                .into_iter()
                .flatten()
                .any(|path| path.is_empty())
        {
            return Err(PatchError::InvalidHeader { line: i + 1 });
        }
        i += 2;

        let mut hunks = Vec::new();
        while i < lines.len() && lines[i].starts_with("@@") {
            let (hunk, next) = parse_hunk(&lines, i)?;
            hunks.push(hunk);
            i = next;
        }
        files.push(FilePatch {
            old_path,
            new_path,
            hunks,
        });
    }
    Ok(files)
}

fn parse_hunk(lines: &[&str], header_at: usize) -> Result<(Hunk, usize), PatchError> {
    let header_line = header_at + 1;
    let invalid = || PatchError::InvalidHunkHeader { line: header_line };
    let captures = HUNK_HEADER.captures(lines[header_at]).ok_or_else(invalid)?;
    let number = |group: usize| -> Result<usize, PatchError> {
        captures
            .get(group)
            .map_or(Ok(1), |m| m.as_str().parse::<usize>().map_err(|_| invalid()))
    };
    let old_start = number(1)?;
    let mut old_left = number(2)?;
    let mut new_left = number(4)?;

    let mut hunk = Hunk {
        header_line,
        old_start,
        old_len: old_left,
        lines: Vec::new(),
        new_missing_newline: false,
    };
    let short = || PatchError::HunkLength { line: header_line };
    let mut i = header_at + 1;
    while old_left > 0 || new_left > 0 {
        let Some(&line) = lines.get(i) else {
            return Err(short());
        };
        match line.chars().next() {
            // Some generators strip the single space from blank context lines.
            Some(' ') | None => {
                if old_left == 0 || new_left == 0 {
                    return Err(short());
                }
                hunk.lines.push(HunkLine::Context(line.get(1..).unwrap_or_default().to_string()));
                old_left -= 1;
                new_left -= 1;
            }
            Some('-') if old_left > 0 => {
                hunk.lines.push(HunkLine::Remove(line[1..].to_string()));
                old_left -= 1;
            }
            Some('+') if new_left > 0 => {
                hunk.lines.push(HunkLine::Add(line[1..].to_string()));
                new_left -= 1;
            }
            Some('\\') => {
                let marks = marks_new_side(&hunk);
                hunk.new_missing_newline |= marks;
            }
            _ => return Err(short()),
        }
        i += 1;
    }
    // A marker may trail the last counted line.
    if lines.get(i).is_some_and(|line| line.starts_with('\\')) {
        let marks = marks_new_side(&hunk);
        hunk.new_missing_newline |= marks;
        i += 1;
    }
    if lines
        .get(i)
        .is_some_and(|line| starts_body_line(line) && !is_file_header(lines, i))
    {
        return Err(PatchError::HunkLength { line: header_line });
    }
    Ok((hunk, i))
}

fn marks_new_side(hunk: &Hunk) -> bool {
    matches!(
        hunk.lines.last(),
        Some(HunkLine::Context(_) | HunkLine::Add(_))
    )
}

fn starts_body_line(line: &str) -> bool {
    line.starts_with([' ', '+', '-'])
}

fn is_file_header(lines: &[&str], at: usize) -> bool {
    lines[at].starts_with("--- ")
        && lines
            .get(at + 1)
            .is_some_and(|next| next.starts_with("+++ "))
}

fn header_path(raw: &str) -> Option<String> {
    let raw = raw.split_once('\t').map_or(raw, |(path, _)| path).trim();
    if raw == DEV_NULL {
        return None;
    }
    let stripped = raw
        .strip_prefix("a/")
        .or_else(|| raw.strip_prefix("b/"))
        .unwrap_or(raw);
    Some(stripped.to_string())
}

/// Target paths of every file section, deduplicated in first-seen order.
///
/// Uses the same count-bounded walk as [`apply_unified_diff`], so hunk body
/// lines are never mistaken for file headers.
pub fn extract_patch_files(patch: &str) -> Result<Vec<String>, PatchError> {
    let mut files: Vec<String> = Vec::new();
    for file in parse_unified_diff(patch)? {
        let target = file.target().to_string();
        if !files.contains(&target) {
            files.push(target);
        }
    }
    Ok(files)
}

/// Apply `patch` through `fs`. Returns the changed paths in patch order.
///
/// Every section is computed in memory first; nothing is written unless all
/// hunks of all files apply cleanly.
pub fn apply_unified_diff<F: RepoFs + ?Sized>(
    fs: &F,
    patch: &str,
) -> Result<Vec<String>, PatchError> {
    let files = parse_unified_diff(patch)?;
    if files.is_empty() {
        return Err(PatchError::NoFiles);
    }

    let mut staged: Vec<(String, Option<String>)> = Vec::with_capacity(files.len());
    for file in &files {
        let target = file.target().to_string();
        let existing = staged.iter().position(|(path, _)| *path == target);
        let current = match existing {
            Some(pos) => staged[pos].1.clone(),
            None if file.is_creation() => None,
            None => fs.read(&target)?,
        };
        let next = file.apply(current.as_deref())?;
        match existing {
            Some(pos) => staged[pos].1 = next,
            None => staged.push((target, next)),
        }
    }

    for (path, contents) in &staged {
        match contents {
            Some(contents) => fs.write(path, contents)?,
            None => fs.remove(path)?,
        }
    }
    Ok(staged.into_iter().map(|(path, _)| path).collect())
}

#[cfg(test)]
mod tests {
    use std::cell::RefCell;
    use std::collections::BTreeMap;

    use super::*;

    #[derive(Default)]
    struct MemFs {
        files: RefCell<BTreeMap<String, String>>,
    }

    impl MemFs {
        fn with(files: &[(&str, &str)]) -> Self {
            let fs = MemFs::default();
            for (path, contents) in files {
                fs.files
                    .borrow_mut()
                    .insert(path.to_string(), contents.to_string());
            }
            fs
        }

        fn get(&self, path: &str) -> Option<String> {
            self.files.borrow().get(path).cloned()
        }
    }

    impl RepoFs for MemFs {
        fn read(&self, path: &str) -> Result<Option<String>, FsError> {
            Ok(self.get(path))
        }

        fn write(&self, path: &str, contents: &str) -> Result<(), FsError> {
            self.files
                .borrow_mut()
                .insert(path.to_string(), contents.to_string());
            Ok(())
        }

        fn remove(&self, path: &str) -> Result<(), FsError> {
            self.files.borrow_mut().remove(path);
            Ok(())
        }
    }

    #[test]
    fn modifies_file_in_place() {
        let fs = MemFs::with(&[("src/lib.rs", "one\ntwo\nthree\n")]);
        let patch = "--- a/src/lib.rs\n+++ b/src/lib.rs\n@@ -1,3 +1,3 @@\n one\n-two\n+TWO\n three\n";
        let changed = apply_unified_diff(&fs, patch).expect("apply");
        assert_eq!(changed, vec!["src/lib.rs"]);
        assert_eq!(fs.get("src/lib.rs").as_deref(), Some("one\nTWO\nthree\n"));
    }

    #[test]
    fn context_mismatch_leaves_file_untouched() {
        let fs = MemFs::with(&[("a.txt", "alpha\nbeta\n")]);
        let patch = "--- a/a.txt\n+++ b/a.txt\n@@ -1,2 +1,2 @@\n gamma\n-beta\n+BETA\n";
        let err = apply_unified_diff(&fs, patch).unwrap_err();
        assert!(matches!(err, PatchError::ContextMismatch { line: 1, .. }));
        assert_eq!(fs.get("a.txt").as_deref(), Some("alpha\nbeta\n"));
    }

    #[test]
    fn removal_mismatch_is_reported() {
        let fs = MemFs::with(&[("a.txt", "alpha\nbeta\n")]);
        let patch = "--- a/a.txt\n+++ b/a.txt\n@@ -2 +2 @@\n-delta\n+BETA\n";
        let err = apply_unified_diff(&fs, patch).unwrap_err();
        assert!(matches!(err, PatchError::RemovalMismatch { line: 2, .. }));
    }

    #[test]
    fn failing_second_file_writes_nothing() {
        let fs = MemFs::with(&[("a.txt", "a\n"), ("b.txt", "b\n")]);
        let patch = "--- a/a.txt\n+++ b/a.txt\n@@ -1 +1 @@\n-a\n+A\n\
                     --- a/b.txt\n+++ b/b.txt\n@@ -1 +1 @@\n-x\n+X\n";
        assert!(apply_unified_diff(&fs, patch).is_err());
        assert_eq!(fs.get("a.txt").as_deref(), Some("a\n"));
    }

    #[test]
    fn creates_and_deletes_files() {
        let fs = MemFs::with(&[("old.txt", "bye\n")]);
        let patch = "--- /dev/null\n+++ b/new.txt\n@@ -0,0 +1,2 @@\n+hello\n+world\n\
                     --- a/old.txt\n+++ /dev/null\n@@ -1 +0,0 @@\n-bye\n";
        let changed = apply_unified_diff(&fs, patch).expect("apply");
        assert_eq!(changed, vec!["new.txt", "old.txt"]);
        assert_eq!(fs.get("new.txt").as_deref(), Some("hello\nworld\n"));
        assert_eq!(fs.get("old.txt"), None);
    }

    #[test]
    fn no_newline_marker_drops_trailing_newline() {
        let fs = MemFs::with(&[("a.txt", "x\ny\n")]);
        let patch = "--- a/a.txt\n+++ b/a.txt\n@@ -1,2 +1,2 @@\n x\n-y\n+z\n\\ No newline at end of file\n";
        apply_unified_diff(&fs, patch).expect("apply");
        assert_eq!(fs.get("a.txt").as_deref(), Some("x\nz"));
    }

    #[test]
    fn missing_trailing_newline_is_kept_when_tail_untouched() {
        let fs = MemFs::with(&[("a.txt", "1\n2\n3\n4\n5\n6\n7\n8")]);
        let patch = "--- a/a.txt\n+++ b/a.txt\n@@ -1,2 +1,2 @@\n-1\n+one\n 2\n";
        apply_unified_diff(&fs, patch).expect("apply");
        assert_eq!(fs.get("a.txt").as_deref(), Some("one\n2\n3\n4\n5\n6\n7\n8"));
    }

    #[test]
    fn crlf_files_keep_their_line_endings() {
        let fs = MemFs::with(&[("a.txt", "a\r\nb\r\n")]);
        let patch = "--- a/a.txt\r\n+++ b/a.txt\r\n@@ -1,2 +1,2 @@\r\n a\r\n-b\r\n+c\r\n";
        apply_unified_diff(&fs, patch).expect("apply");
        assert_eq!(fs.get("a.txt").as_deref(), Some("a\r\nc\r\n"));
    }

    #[test]
    fn blank_context_lines_without_space_are_accepted() {
        let fs = MemFs::with(&[("a.txt", "a\n\nb\n")]);
        let patch = "--- a/a.txt\n+++ b/a.txt\n@@ -1,3 +1,3 @@\n a\n\n-b\n+c\n\n\n";
        apply_unified_diff(&fs, patch).expect("apply");
        assert_eq!(fs.get("a.txt").as_deref(), Some("a\n\nc\n"));
    }

    #[test]
    fn header_errors_are_reported() {
        let fs = MemFs::default();
        assert!(matches!(
            apply_unified_diff(&fs, "--- a/x\n@@ -1 +1 @@\n"),
            Err(PatchError::InvalidHeader { line: 1 })
        ));
        assert!(matches!(
            apply_unified_diff(&fs, "--- a/x\n+++ b/x\n@@ bogus @@\n"),
            Err(PatchError::InvalidHunkHeader { line: 3 })
        ));
        assert!(matches!(
            apply_unified_diff(&fs, "just prose"),
            Err(PatchError::NoFiles)
        ));
    }

    #[test]
    fn extract_patch_files_strips_prefixes_and_metadata() {
        let patch = "diff --git a/src/a.rs b/src/a.rs\n\
                     --- a/src/a.rs\t2024-01-01 00:00:00\n+++ b/src/a.rs\t2024-01-02 00:00:00\n@@ -1 +1 @@\n-x\n+y\n\
                     --- a/gone.rs\n+++ /dev/null\n@@ -1 +0,0 @@\n-z\n\
                     --- a/src/a.rs\n+++ b/src/a.rs\n";
        assert_eq!(
            extract_patch_files(patch).expect("extract"),
            vec!["src/a.rs", "gone.rs"]
        );
    }

    #[test]
    fn header_lookalikes_inside_a_hunk_are_body_lines() {
        let fs = MemFs::with(&[("q.sql", "SELECT 1;\n-- old\nSELECT 2;\n")]);
        let patch = "--- a/q.sql\n+++ b/q.sql\n@@ -1,3 +1,3 @@\n SELECT 1;\n--- old\n+++ new\n SELECT 2;\n";
        assert_eq!(extract_patch_files(patch).expect("extract"), vec!["q.sql"]);
        let changed = apply_unified_diff(&fs, patch).expect("apply");
        assert_eq!(changed, vec!["q.sql"]);
        assert_eq!(
            fs.get("q.sql").as_deref(),
            Some("SELECT 1;\n++ new\nSELECT 2;\n")
        );
        assert_eq!(fs.get("new"), None);
    }

    #[test]
    fn hunk_body_must_match_header_counts() {
        let fs = MemFs::with(&[("a.txt", "one\ntwo\nthree\n")]);
        let short = "--- a/a.txt\n+++ b/a.txt\n@@ -1,3 +1,3 @@\n one\n-two\n+TWO\n";
        assert!(matches!(
            apply_unified_diff(&fs, short),
            Err(PatchError::HunkLength { line: 3 })
        ));
        let long = "--- a/a.txt\n+++ b/a.txt\n@@ -1,2 +1,2 @@\n one\n-two\n+TWO\n three\n";
        assert!(matches!(
            apply_unified_diff(&fs, long),
            Err(PatchError::HunkLength { line: 3 })
        ));
        assert!(matches!(
            extract_patch_files(short),
            Err(PatchError::HunkLength { .. })
        ));
        assert_eq!(fs.get("a.txt").as_deref(), Some("one\ntwo\nthree\n"));
    }

    #[test]
    fn overlapping_hunks_are_rejected() {
        let fs = MemFs::with(&[("a.txt", "1\n2\n3\n4\n")]);
        let patch = "--- a/a.txt\n+++ b/a.txt\n@@ -3 +3 @@\n-3\n+three\n@@ -1 +1 @@\n-1\n+one\n";
        assert!(matches!(
            apply_unified_diff(&fs, patch),
            Err(PatchError::HunkOrder { line: 6 })
        ));
        assert_eq!(fs.get("a.txt").as_deref(), Some("1\n2\n3\n4\n"));
    }

    #[test]
    fn pure_insertion_lands_after_the_named_line() {
        let fs = MemFs::with(&[("a.txt", "1\n2\n3\n")]);
        let patch = "--- a/a.txt\n+++ b/a.txt\n@@ -2,0 +3 @@\n+2.5\n";
        apply_unified_diff(&fs, patch).expect("apply");
        assert_eq!(fs.get("a.txt").as_deref(), Some("1\n2\n2.5\n3\n"));
    }

    #[test]
    fn mixed_line_endings_are_kept_per_line() {
        let fs = MemFs::with(&[("a.txt", "a\r\nb\nc\r\nd\n")]);
        let patch = "--- a/a.txt\n+++ b/a.txt\n@@ -2,2 +2,3 @@\n-b\n+B\n c\n+c2\n";
        apply_unified_diff(&fs, patch).expect("apply");
        assert_eq!(fs.get("a.txt").as_deref(), Some("a\r\nB\nc\r\nc2\nd\n"));
    }

    #[test]
    fn same_file_twice_applies_sequentially() {
        let fs = MemFs::with(&[("a.txt", "1\n2\n")]);
        let patch = "--- a/a.txt\n+++ b/a.txt\n@@ -1 +1 @@\n-1\n+one\n\
                     --- a/a.txt\n+++ b/a.txt\n@@ -2 +2 @@\n-2\n+two\n";
        let changed = apply_unified_diff(&fs, patch).expect("apply");
        assert_eq!(changed, vec!["a.txt"]);
        assert_eq!(fs.get("a.txt").as_deref(), Some("one\ntwo\n"));
    }
}
