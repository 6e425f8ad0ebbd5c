//! Shared fixtures: a scripted recovery executor and config helpers.

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};

use parking_lot::Mutex;
use pmcheck_error::Result;
use pmcheck_replay::{ExecOutcome, Invocation, RecoveryExecutor, ReplayConfig};

/// Executor that never spawns anything. Crash runs write `crash_output`
/// and exit with `crash_exit`; skip-oracle runs (start index 0) write
/// `skip_output`. Every crash image is captured before "recovery".
pub struct FakeExecutor {
    pub crash_output: String,
    pub crash_exit: i32,
    pub crash_timeout: bool,
    pub skip_output: String,
    pub runs: Mutex<Vec<Invocation>>,
    pub images: Mutex<Vec<(PathBuf, Vec<u8>)>>,
}

impl FakeExecutor {
    pub fn consistent(output: &str) -> Self {
        Self {
            crash_output: output.to_owned(),
            crash_exit: 0,
            crash_timeout: false,
            skip_output: output.to_owned(),
            runs: Mutex::new(Vec::new()),
            images: Mutex::new(Vec::new()),
        }
    }

    pub fn crash_runs(&self) -> Vec<Invocation> {
        self.runs
            .lock()
            .iter()
            .filter(|inv| inv.start_index != 0)
            .cloned()
            .collect()
    }

    pub fn skip_runs(&self) -> usize {
        self.runs.lock().iter().filter(|inv| inv.start_index == 0).count()
    }

    pub fn image_bytes(&self, index: usize) -> Vec<u8> {
        self.images.lock()[index].1.clone()
    }
}

impl RecoveryExecutor for FakeExecutor {
    fn run(&self, invocation: &Invocation) -> Result<ExecOutcome> {
        self.runs.lock().push(invocation.clone());
        let outcome = |exit_code, timed_out| ExecOutcome {
            exit_code: Some(exit_code),
            timed_out,
            elapsed_ms: 1,
            pid: 4242,
        };
        if invocation.start_index == 0 {
            fs::write(&invocation.output, &self.skip_output)?;
            return Ok(outcome(0, false));
        }
        let bytes = fs::read(&invocation.image)?;
        self.images.lock().push((invocation.image.clone(), bytes));
        if self.crash_timeout {
            return Ok(outcome(-1, true));
        }
        fs::write(&invocation.output, &self.crash_output)?;
        Ok(outcome(self.crash_exit, false))
    }
}

/// Config for a test run under `dir`, with a small image at `base`.
pub fn config(dir: &Path, base: u64, size: u64, full_oracle: &str) -> ReplayConfig {
    let oracle = dir.join("traced-output");
    fs::write(&oracle, full_oracle).unwrap();
    ReplayConfig {
        image_base: base,
        image_size: size,
        output_dir: dir.join("out"),
        validator_program: PathBuf::from("./recover"),
        layout: "test".to_owned(),
        op_file: dir.join("ops"),
        full_oracle_file: oracle,
        ..ReplayConfig::default()
    }
}

/// One 8-byte store record with every byte set to `fill`.
pub fn store(address: u64, fill: u8, src: &str) -> String {
    let bytes = vec![format!("{fill:02x}"); 8].join(" ");
    format!("Store,0,{address:x},8,{bytes},{src}\n")
}
