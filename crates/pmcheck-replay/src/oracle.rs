//! Reference outputs and crash-output comparison.
//!
//! A crash image is consistent when the recovery program's output matches
//! one of two legal outcomes: the transaction fully happened ("full"
//! oracle, compared from the next transaction on) or it never happened
//! ("skip" oracle, compared from the transaction itself).

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};

use pmcheck_error::Result;
use tracing::{debug, warn};

use crate::config::ReplayConfig;
use crate::executor::{Invocation, RecoveryExecutor};

/// Comparison tag for a missing or truncated output.
pub const CRASH_TAG: &str = "crash";
/// Comparison tag for an exact match.
pub const MATCH_TAG: &str = "match";

/// Outcome of comparing one output against one oracle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OracleMatch {
    pub matched: bool,
    /// `match`, `crash` or `tx-<k>`.
    pub tag: String,
}

impl OracleMatch {
    fn matched() -> Self {
        Self {
            matched: true,
            tag: MATCH_TAG.to_owned(),
        }
    }

    fn crash() -> Self {
        Self {
            matched: false,
            tag: CRASH_TAG.to_owned(),
        }
    }
}

/// Verdict against both oracles.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Comparison {
    pub full: OracleMatch,
    pub skip: OracleMatch,
}

impl Comparison {
    /// Inconsistent only when neither legal outcome matched.
    #[must_use]
    pub fn is_inconsistent(&self) -> bool {
        !self.full.matched && !self.skip.matched
    }

    /// `<full tag> <skip tag>`.
    #[must_use]
    pub fn mismatch(&self) -> String {
        format!("{} {}", self.full.tag, self.skip.tag)
    }
}

fn read_lines(path: &Path) -> Option<Vec<String>> {
    let raw = fs::read(path).ok()?;
    Some(
        String::from_utf8_lossy(&raw)
            .split_inclusive('\n')
            .map(str::to_owned)
            .collect(),
    )
}

/// Compare `output` line by line with `oracle[index..]`.
pub fn compare_from_index(output: &Path, oracle: &Path, index: usize) -> OracleMatch {
    let Some(actual) = read_lines(output) else {
        return OracleMatch::crash();
    };
    let Some(expected) = read_lines(oracle) else {
        return OracleMatch::crash();
    };
    let expected = expected.get(index..).unwrap_or_default();
    if actual.len() != expected.len() {
        return OracleMatch::crash();
    }
    match actual.iter().zip(expected).position(|(a, e)| a != e) {
        Some(i) => OracleMatch {
            matched: false,
            tag: format!("tx-{}", index + i),
        },
        None => OracleMatch::matched(),
    }
}

/// Compare a crash output of transaction `tx` against both oracles.
pub fn compare_to_oracles(output: &Path, full: &Path, skip: &Path, tx: usize) -> Comparison {
    Comparison {
        full: compare_from_index(output, full, tx + 1),
        skip: compare_from_index(output, skip, tx),
    }
}

/// Per-worker memo of oracle files.
#[derive(Debug, Default)]
pub struct OracleCache {
    full: Option<PathBuf>,
    skip: HashMap<usize, PathBuf>,
}

impl OracleCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// `<output_dir>/oracle-full`, copied from the precomputed full run on
    /// first use.
    pub fn full(&mut self, config: &ReplayConfig) -> Result<PathBuf> {
        if let Some(path) = &self.full {
            return Ok(path.clone());
        }
        let path = config.output_dir.join("oracle-full");
        fs::copy(&config.full_oracle_file, &path)?;
        debug!(oracle = %path.display(), "full oracle ready");
        self.full = Some(path.clone());
        Ok(path)
    }

    /// `<output_dir>/oracle-skip-tx-<tx>`, produced by running the recovery
    /// program on a fresh image with transaction `tx` skipped.
    pub fn skip(
        &mut self,
        tx: usize,
        config: &ReplayConfig,
        executor: &dyn RecoveryExecutor,
    ) -> Result<PathBuf> {
        if let Some(path) = self.skip.get(&tx) {
            return Ok(path.clone());
        }
        let output = config.output_dir.join(format!("oracle-skip-tx-{tx}"));
        let image = config.output_dir.join(format!("oracle-skip-tx-{tx}-pm"));
        let invocation = Invocation {
            program: config.validator_program.clone(),
            image: image.clone(),
            mmap_size: config.image_size,
            layout: config.layout.clone(),
            op_file: config.op_file.clone(),
            start_index: 0,
            skip_index: i64::try_from(tx).unwrap_or(i64::MAX),
            output: output.clone(),
            timeout: config.timeout(),
        };
        let outcome = executor.run(&invocation)?;
        if !outcome.succeeded() {
            warn!(
                tx,
                exit_code = ?outcome.exit_code,
                timed_out = outcome.timed_out,
                "skip oracle run did not exit cleanly"
            );
        }
        if !config.keep_images {
            remove_if_present(&image);
        }
        debug!(tx, oracle = %output.display(), "skip oracle ready");
        self.skip.insert(tx, output.clone());
        Ok(output)
    }

    pub fn skip_count(&self) -> usize {
        self.skip.len()
    }
}

/// Remove a generated file; a missing file is fine, other failures are
/// logged.
pub(crate) fn remove_if_present(path: &Path) {
    match fs::remove_file(path) {
        Ok(()) => {}
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
        Err(error) => warn!(path = %path.display(), %error, "cleanup failed"),
    }
}

#[cfg(test)]
mod tests {
    use parking_lot::Mutex;

    use super::*;
    use crate::executor::ExecOutcome;

    fn write(dir: &Path, name: &str, text: &str) -> PathBuf {
        let path = dir.join(name);
        fs::write(&path, text).unwrap();
        path
    }

    #[test]
    fn match_mismatch_and_crash_tags() {
        let dir = tempfile::tempdir().unwrap();
        let oracle = write(dir.path(), "oracle", "a\nb\nc\nd\n");
        let same = write(dir.path(), "same", "c\nd\n");
        let diff = write(dir.path(), "diff", "c\nX\n");
        let short = write(dir.path(), "short", "c\n");

        assert_eq!(compare_from_index(&same, &oracle, 2), OracleMatch::matched());
        assert_eq!(compare_from_index(&diff, &oracle, 2).tag, "tx-3");
        assert_eq!(compare_from_index(&short, &oracle, 2).tag, CRASH_TAG);
        assert_eq!(
            compare_from_index(&dir.path().join("missing"), &oracle, 2).tag,
            CRASH_TAG
        );
        assert_eq!(
            compare_from_index(&same, &dir.path().join("missing"), 2).tag,
            CRASH_TAG
        );
    }

    #[test]
    fn index_past_oracle_end_compares_empty() {
        let dir = tempfile::tempdir().unwrap();
        let oracle = write(dir.path(), "oracle", "a\n");
        let empty = write(dir.path(), "empty", "");
        assert!(compare_from_index(&empty, &oracle, 5).matched);
    }

    #[test]
    fn either_oracle_is_enough() {
        let dir = tempfile::tempdir().unwrap();
        // Full run printed tx0..tx2; skipping tx1 printed tx0, tx2'.
        let full = write(dir.path(), "full", "0\n1\n2\n");
        let skip = write(dir.path(), "skip", "0\n2'\n");
        let rolled_back = write(dir.path(), "rb", "2'\n");
        let applied = write(dir.path(), "ap", "2\n");
        let broken = write(dir.path(), "br", "9\n");

        assert!(!compare_to_oracles(&rolled_back, &full, &skip, 1).is_inconsistent());
        assert!(!compare_to_oracles(&applied, &full, &skip, 1).is_inconsistent());
        let cmp = compare_to_oracles(&broken, &full, &skip, 1);
        assert!(cmp.is_inconsistent());
        assert_eq!(cmp.mismatch(), "tx-2 tx-1");
    }

    struct CountingExecutor {
        runs: Mutex<Vec<Invocation>>,
    }

    impl RecoveryExecutor for CountingExecutor {
        fn run(&self, invocation: &Invocation) -> Result<ExecOutcome> {
            fs::write(&invocation.output, "ok\n")?;
            fs::write(&invocation.image, "pm")?;
            self.runs.lock().push(invocation.clone());
            Ok(ExecOutcome {
                exit_code: Some(0),
                timed_out: false,
                elapsed_ms: 0,
                pid: 1,
            })
        }
    }

    #[test]
    fn oracles_are_memoized_and_skip_images_removed() {
        let dir = tempfile::tempdir().unwrap();
        let full_src = write(dir.path(), "traced-output", "x\n");
        let config = ReplayConfig {
            output_dir: dir.path().to_path_buf(),
            validator_program: PathBuf::from("validate"),
            full_oracle_file: full_src,
            ..ReplayConfig::default()
        };
        let executor = CountingExecutor {
            runs: Mutex::new(Vec::new()),
        };
        let mut cache = OracleCache::new();

        let full = cache.full(&config).unwrap();
        assert_eq!(full, dir.path().join("oracle-full"));
        assert_eq!(fs::read_to_string(&full).unwrap(), "x\n");

        let first = cache.skip(3, &config, &executor).unwrap();
        let again = cache.skip(3, &config, &executor).unwrap();
        assert_eq!(first, again);
        assert_eq!(first, dir.path().join("oracle-skip-tx-3"));
        assert!(!dir.path().join("oracle-skip-tx-3-pm").exists());

        let runs = executor.runs.lock();
        assert_eq!(runs.len(), 1);
        assert_eq!(runs[0].start_index, 0);
        assert_eq!(runs[0].skip_index, 3);
        assert_eq!(cache.skip_count(), 1);
    }
}
