//! Sandbox confinement through the public tool surface.

use std::fs;

use foreman::core::allowlist::{CommandAllowlist, PathAllowlist};
use foreman::core::command_policy::{CommandDenied, CommandPolicy};
use foreman::core::safe_path::PathError;
use foreman::io::sandbox::{Denial, Sandbox, SandboxLimits, ToolCall, ToolResult};
use serde_json::json;

fn sandbox(temp: &tempfile::TempDir) -> Sandbox {
    let root = temp.path().join("repo");
    fs::create_dir_all(root.join("src")).expect("src");
    fs::write(root.join("src/lib.rs"), "pub fn a() {}\n").expect("seed");
    fs::write(temp.path().join("secret.txt"), "hidden").expect("secret");
    Sandbox::new(root, CommandPolicy::default(), SandboxLimits::default())
}

fn call(name: &str, args: serde_json::Value) -> ToolCall {
    ToolCall::parse(name, args).expect("tool call")
}

fn denial(result: ToolResult) -> Denial {
    match result {
        ToolResult::Denied { error } => error,
        other => panic!("expected denial, got {other:?}"),
    }
}

#[test]
fn escaping_paths_are_denied_for_every_file_tool() {
    let temp = tempfile::tempdir().expect("tempdir");
    let sandbox = sandbox(&temp);
    let open = PathAllowlist::default();
    let any = CommandAllowlist::default();

    for (name, args) in [
        ("read_file", json!({"path": "../secret.txt"})),
        ("write_file", json!({"path": "src/../../x.txt", "content": "x"})),
        ("list_files", json!({"path": ".."})),
        ("mkdir", json!({"path": "../outside"})),
    ] {
        let result = sandbox.dispatch(&call(name, args), &open, &any);
        assert!(
            matches!(denial(result), Denial::Path(PathError::Escape(_))),
            "{name} was not confined"
        );
    }
    let result = sandbox.dispatch(&call("read_file", json!({"path": "/etc/passwd"})), &open, &any);
    assert!(matches!(denial(result), Denial::Path(PathError::Absolute(_))));
    assert!(!temp.path().join("x.txt").exists());
    assert!(!temp.path().join("outside").exists());
}

#[test]
fn file_allowlist_confines_patches_to_listed_prefixes() {
    let temp = tempfile::tempdir().expect("tempdir");
    let sandbox = sandbox(&temp);
    let files = PathAllowlist::new(&["src"]);
    let any = CommandAllowlist::default();

    let patch = "--- a/README.md\n+++ b/README.md\n@@ -0,0 +1 @@\n+hi\n";
    let result = sandbox.dispatch(&call("apply_patch", json!({"patch": patch})), &files, &any);
    assert_eq!(denial(result), Denial::PathNotAllowed("README.md".to_string()));
    assert!(!temp.path().join("repo/README.md").exists());

    let patch = "--- a/src/lib.rs\n+++ b/src/lib.rs\n@@ -1 +1 @@\n-pub fn a() {}\n+pub fn b() {}\n";
    let result = sandbox.dispatch(&call("apply_patch", json!({"patch": patch})), &files, &any);
    assert_eq!(
        result,
        ToolResult::Patched {
            applied: true,
            files: vec!["src/lib.rs".to_string()],
        }
    );
    assert_eq!(
        fs::read_to_string(temp.path().join("repo/src/lib.rs")).expect("read"),
        "pub fn b() {}\n"
    );
}

#[test]
fn commands_need_both_allowlists() {
    let temp = tempfile::tempdir().expect("tempdir");
    let sandbox = sandbox(&temp);
    let open = PathAllowlist::default();

    let only_cargo = CommandAllowlist::new(&["cargo"]);
    let result = sandbox.dispatch(
        &call("run_command", json!({"command": "ls src"})),
        &open,
        &only_cargo,
    );
    assert_eq!(denial(result), Denial::Command(CommandDenied::UnitAllowlist));

    let any = CommandAllowlist::default();
    let result = sandbox.dispatch(
        &call("run_command", json!({"command": "curl example.com"})),
        &open,
        &any,
    );
    assert_eq!(
        denial(result),
        Denial::Command(CommandDenied::NotAllowed("curl".to_string()))
    );

    let result = sandbox.dispatch(
        &call("run_command", json!({"command": "ls src; rm -rf src"})),
        &open,
        &any,
    );
    assert_eq!(denial(result), Denial::Command(CommandDenied::ForbiddenCharacters));
    assert!(temp.path().join("repo/src/lib.rs").exists());
}

#[cfg(unix)]
#[test]
fn allowed_command_runs_in_repository_root() {
    let temp = tempfile::tempdir().expect("tempdir");
    let sandbox = sandbox(&temp);
    let result = sandbox.dispatch(
        &call("run_command", json!({"command": "ls", "cwd": "src"})),
        &PathAllowlist::default(),
        &CommandAllowlist::new(&["ls"]),
    );
    match result {
        ToolResult::Command(output) => {
            assert_eq!(output.exit_code, 0);
            assert!(output.stdout.contains("lib.rs"));
        }
        other => panic!("expected command output, got {other:?}"),
    }
}
