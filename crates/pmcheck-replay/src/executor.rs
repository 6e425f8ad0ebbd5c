//! Running the external recovery/verification program.
//!
//! The program is invoked as
//! `program image mmap_size layout op_file start_index skip_index output`
//! and must exit 0 when it finds the image consistent, writing one output
//! line per processed operation.

use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Child, Command, Stdio};
use std::thread;
use std::time::{Duration, Instant};

use pmcheck_error::{PmcheckError, Result};
use tracing::{debug, warn};

/// Signature used when a failing run left no core dump to inspect.
pub const NO_DIAGNOSTICS: &str = "abnormal exit with no diagnostics";
/// Signature of a run killed at its deadline.
pub const TIMEOUT_SIGNATURE: &str = "timeout";
/// Poll interval while waiting for the program.
pub const DEFAULT_POLL_INTERVAL_MILLIS: u64 = 25;

/// One invocation of the recovery program.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Invocation {
    pub program: PathBuf,
    pub image: PathBuf,
    pub mmap_size: u64,
    pub layout: String,
    pub op_file: PathBuf,
    pub start_index: i64,
    pub skip_index: i64,
    pub output: PathBuf,
    pub timeout: Duration,
}

impl Invocation {
    /// Positional arguments, program excluded.
    #[must_use]
    pub fn args(&self) -> Vec<OsString> {
        vec![
            self.image.clone().into_os_string(),
            self.mmap_size.to_string().into(),
            self.layout.clone().into(),
            self.op_file.clone().into_os_string(),
            self.start_index.to_string().into(),
            self.skip_index.to_string().into(),
            self.output.clone().into_os_string(),
        ]
    }
}

/// How a run ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExecOutcome {
    /// `None` when killed by a signal.
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub elapsed_ms: u64,
    pub pid: u32,
}

impl ExecOutcome {
    #[must_use]
    pub const fn succeeded(&self) -> bool {
        !self.timed_out && matches!(self.exit_code, Some(0))
    }
}

/// Seam between the validator and the program it runs.
pub trait RecoveryExecutor: Send + Sync {
    /// Run to completion or until the invocation's timeout.
    fn run(&self, invocation: &Invocation) -> Result<ExecOutcome>;

    /// Best-effort signature for a run that exited non-zero.
    fn post_mortem(&self, _invocation: &Invocation, _outcome: &ExecOutcome) -> String {
        NO_DIAGNOSTICS.to_owned()
    }
}

/// Runs the program as a child process.
#[derive(Debug, Clone)]
pub struct ProcessExecutor {
    core_dump_dir: PathBuf,
    poll_interval: Duration,
}

impl ProcessExecutor {
    pub fn new(core_dump_dir: impl Into<PathBuf>) -> Self {
        Self {
            core_dump_dir: core_dump_dir.into(),
            poll_interval: Duration::from_millis(DEFAULT_POLL_INTERVAL_MILLIS),
        }
    }

    /// Core file the kernel writes with `core_pattern=<dir>/%e-%p.core`.
    #[must_use]
    pub fn core_file(&self, program: &Path, pid: u32) -> PathBuf {
        let binary = program
            .file_name()
            .map_or_else(|| program.to_string_lossy(), |n| n.to_string_lossy());
        self.core_dump_dir.join(format!("{binary}-{pid}.core"))
    }

    fn wait_for_child(&self, child: &mut Child, invocation: &Invocation) -> Result<ExecOutcome> {
        let started_at = Instant::now();
        let pid = child.id();
        let spawn_err = |detail: String| PmcheckError::ValidatorSpawn {
            program: invocation.program.clone(),
            detail,
        };
        loop {
            match child.try_wait() {
                Ok(Some(status)) => {
                    return Ok(ExecOutcome {
                        exit_code: status.code(),
                        timed_out: false,
                        elapsed_ms: elapsed_ms_u64(started_at.elapsed()),
                        pid,
                    });
                }
                Ok(None) => {
                    if started_at.elapsed() >= invocation.timeout {
                        let _ = child.kill();
                        let status = child
                            .wait()
                            .map_err(|e| spawn_err(format!("wait after kill failed: {e}")))?;
                        return Ok(ExecOutcome {
                            exit_code: status.code(),
                            timed_out: true,
                            elapsed_ms: elapsed_ms_u64(started_at.elapsed()),
                            pid,
                        });
                    }
                    thread::sleep(self.poll_interval);
                }
                Err(e) => return Err(spawn_err(format!("try_wait failed: {e}"))),
            }
        }
    }
}

impl RecoveryExecutor for ProcessExecutor {
    fn run(&self, invocation: &Invocation) -> Result<ExecOutcome> {
        debug!(
            program = %invocation.program.display(),
            image = %invocation.image.display(),
            start = invocation.start_index,
            skip = invocation.skip_index,
            "running validator"
        );
        let mut child = Command::new(&invocation.program)
            .args(invocation.args())
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null())
            .spawn()
            .map_err(|e| PmcheckError::ValidatorSpawn {
                program: invocation.program.clone(),
                detail: e.to_string(),
            })?;
        self.wait_for_child(&mut child, invocation)
    }

    fn post_mortem(&self, invocation: &Invocation, outcome: &ExecOutcome) -> String {
        let core = self.core_file(&invocation.program, outcome.pid);
        if !core.is_file() {
            return NO_DIAGNOSTICS.to_owned();
        }
        let signature = Command::new("gdb")
            .arg(&invocation.program)
            .arg(&core)
            .arg("--batch")
            .stdin(Stdio::null())
            .stderr(Stdio::null())
            .output()
            .ok()
            .and_then(|out| crash_site(&String::from_utf8_lossy(&out.stdout)))
            .unwrap_or_else(|| NO_DIAGNOSTICS.to_owned());
        if let Err(error) = fs::remove_file(&core) {
            warn!(core = %core.display(), %error, "core dump cleanup failed");
        }
        signature
    }
}

/// Crash site from batch gdb output: the function named at the end of the
/// frame line, then the source line gdb printed for it.
fn crash_site(gdb_output: &str) -> Option<String> {
    let lines: Vec<&str> = gdb_output.lines().filter(|l| !l.trim().is_empty()).collect();
    let [.., frame, source] = lines.as_slice() else {
        return None;
    };
    let function = frame.split(' ').next_back().unwrap_or_default();
    Some(format!("{function}:{source}"))
}

fn elapsed_ms_u64(elapsed: Duration) -> u64 {
    u64::try_from(elapsed.as_millis()).unwrap_or(u64::MAX)
}
