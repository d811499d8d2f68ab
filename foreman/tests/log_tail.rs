//! Incremental tailing of logs while another thread appends.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use std::time::Duration;

use foreman::io::artifacts::{ArtifactLayout, Scope};
use foreman::io::joblog::LogBook;

fn book(temp: &tempfile::TempDir, max_bytes: u64) -> LogBook {
    LogBook::new(
        ArtifactLayout::new(temp.path().join("logs"), temp.path().join("reports")),
        max_bytes,
    )
}

#[test]
fn tailing_by_offset_sees_every_line_once() {
    let temp = tempfile::tempdir().expect("tempdir");
    let book = Arc::new(book(&temp, 16 * 1024 * 1024));
    let scope = Scope::Step {
        job_id: 1,
        step_id: 7,
    };
    let done = Arc::new(AtomicBool::new(false));

    let writer = {
        let book = Arc::clone(&book);
        let done = Arc::clone(&done);
        thread::spawn(move || {
            for n in 0..300 {
                book.append(scope, &format!("message {n} ünïcode")).expect("append");
            }
            done.store(true, Ordering::SeqCst);
        })
    };

    let mut offset = 0;
    let mut seen = String::new();
    loop {
        let finished = done.load(Ordering::SeqCst);
        let chunk = book.read_chunk(scope, offset).expect("read");
        assert!(chunk.offset >= offset);
        offset = chunk.offset;
        seen.push_str(&chunk.content);
        if finished && chunk.content.is_empty() {
            break;
        }
        thread::sleep(Duration::from_millis(1));
    }
    writer.join().expect("writer");

    let messages: Vec<&str> = seen
        .lines()
        .map(|line| line.split_once("] ").expect("timestamp prefix").1)
        .collect();
    let expected: Vec<String> = (0..300).map(|n| format!("message {n} ünïcode")).collect();
    assert_eq!(messages, expected);
}

#[test]
fn trimmed_log_keeps_whole_newest_lines() {
    let temp = tempfile::tempdir().expect("tempdir");
    let book = book(&temp, 200);
    let scope = Scope::Job(3);
    for n in 0..50 {
        book.append(scope, &format!("entry number {n}")).expect("append");
    }
    let chunk = book.read_chunk(scope, 0).expect("read");
    assert!(chunk.size <= 200);
    assert!(chunk.content.ends_with("entry number 49\n"));
    for line in chunk.content.lines() {
        assert!(line.starts_with('['), "partial line kept: {line:?}");
    }
}

#[test]
fn offset_past_end_is_clamped() {
    let temp = tempfile::tempdir().expect("tempdir");
    let book = book(&temp, 1024);
    let scope = Scope::Job(9);
    book.append(scope, "only").expect("append");
    let chunk = book.read_chunk(scope, 10_000).expect("read");
    assert!(chunk.content.is_empty());
    assert_eq!(chunk.offset, chunk.size);
    assert!(book.read_chunk(Scope::Job(10), 0).expect("missing").content.is_empty());
}
