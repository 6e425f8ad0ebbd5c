//! The process executor against small shell-script validators.

#![cfg(unix)]

use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use pmcheck_replay::{Invocation, NO_DIAGNOSTICS, ProcessExecutor, RecoveryExecutor};

fn script(dir: &Path, name: &str, body: &str) -> PathBuf {
    let path = dir.join(name);
    fs::write(&path, format!("#!/bin/sh\n{body}\n")).unwrap();
    fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
    path
}

fn invocation(program: PathBuf, dir: &Path, timeout: Duration) -> Invocation {
    Invocation {
        program,
        image: dir.join("pm-image-0-3-1"),
        mmap_size: 4096,
        layout: "list".to_owned(),
        op_file: dir.join("ops"),
        start_index: 1,
        skip_index: -1,
        output: dir.join("pm-image-0-3-1-output"),
        timeout,
    }
}

// One test so no other thread forks while a script is open for writing.
#[test]
fn process_executor_contract() {
    let dir = tempfile::tempdir().unwrap();
    let executor = ProcessExecutor::new(dir.path());

    let echo = script(dir.path(), "echo-args", "echo \"$1 $2 $3 $5 $6\" > \"$7\"");
    let inv = invocation(echo, dir.path(), Duration::from_secs(10));
    let outcome = executor.run(&inv).unwrap();
    assert!(outcome.succeeded(), "{outcome:?}");
    let written = fs::read_to_string(&inv.output).unwrap();
    assert_eq!(
        written,
        format!("{} 4096 list 1 -1\n", inv.image.display())
    );

    let failing = script(dir.path(), "fail", "exit 3");
    let inv = invocation(failing, dir.path(), Duration::from_secs(10));
    let outcome = executor.run(&inv).unwrap();
    assert_eq!(outcome.exit_code, Some(3));
    assert!(!outcome.timed_out);
    assert_eq!(executor.post_mortem(&inv, &outcome), NO_DIAGNOSTICS);

    let hanging = script(dir.path(), "hang", "exec sleep 30");
    let inv = invocation(hanging, dir.path(), Duration::from_millis(200));
    let outcome = executor.run(&inv).unwrap();
    assert!(outcome.timed_out);
    assert!(!outcome.succeeded());
    assert!(outcome.elapsed_ms < 10_000, "killed late: {}ms", outcome.elapsed_ms);
}
