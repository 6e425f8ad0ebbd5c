//! Crash image materialization and outcome classification.

use std::collections::BTreeSet;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};

use pmcheck_cache::{CacheSim, PmImage};
use pmcheck_error::Result;
use pmcheck_types::OpId;
use tracing::{debug, info};

use crate::config::ReplayConfig;
use crate::executor::{Invocation, RecoveryExecutor, TIMEOUT_SIGNATURE};
use crate::oracle::{OracleCache, compare_to_oracles, remove_if_present};
use crate::results::{CrashPlan, PlanKind, PlanRecord, ValidationResults};

/// `path` with `suffix` appended to its final component.
pub(crate) fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut raw: OsString = path.as_os_str().to_owned();
    raw.push(suffix);
    PathBuf::from(raw)
}

/// Why a tested plan was reported.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Verdict {
    Consistent,
    Inconsistent { signature: String },
}

pub struct CrashValidator<'a> {
    config: &'a ReplayConfig,
    executor: &'a dyn RecoveryExecutor,
    oracles: OracleCache,
    results: ValidationResults,
}

impl<'a> CrashValidator<'a> {
    pub fn new(config: &'a ReplayConfig, executor: &'a dyn RecoveryExecutor) -> Self {
        Self {
            config,
            executor,
            oracles: OracleCache::new(),
            results: ValidationResults::default(),
        }
    }

    /// Crash image path for one plan: `<image>-<tx>-<fence>-<op>`.
    #[must_use]
    pub fn crash_image_path(&self, tx: usize, fence: OpId, plan: &CrashPlan) -> PathBuf {
        self.config.output_dir.join(format!(
            "{}-{tx}-{fence}-{}",
            self.config.image_name, plan.op
        ))
    }

    /// Materialize and check every plan decided at `fence` of transaction
    /// `tx`. Returns the number of plans reported.
    pub fn validate(
        &mut self,
        tx: usize,
        fence: OpId,
        plans: &BTreeSet<CrashPlan>,
        cache: &CacheSim,
        image: &PmImage,
    ) -> Result<usize> {
        let mut reported = 0;
        for plan in plans {
            if let Verdict::Inconsistent { .. } = self.validate_plan(tx, fence, plan, cache, image)? {
                reported += 1;
            }
        }
        debug!(tx, fence = %fence, plans = plans.len(), reported, "fence validated");
        Ok(reported)
    }

    fn validate_plan(
        &mut self,
        tx: usize,
        fence: OpId,
        plan: &CrashPlan,
        cache: &CacheSim,
        image: &PmImage,
    ) -> Result<Verdict> {
        let crash_path = self.crash_image_path(tx, fence, plan);
        self.build_crash_image(&crash_path, plan, cache, image)?;

        let output = with_suffix(&crash_path, "-output");
        let record = PlanRecord {
            tx,
            fence,
            plan: plan.clone(),
            output: output.clone(),
        };
        self.results.record_tested(record.clone());

        let invocation = Invocation {
            program: self.config.validator_program.clone(),
            image: crash_path.clone(),
            mmap_size: self.config.image_size,
            layout: self.config.layout.clone(),
            op_file: self.config.op_file.clone(),
            start_index: i64::try_from(tx + 1).unwrap_or(i64::MAX),
            skip_index: -1,
            output: output.clone(),
            timeout: self.config.timeout(),
        };
        debug!(tx, fence = %fence, plan = %plan.op, kind = %plan.kind, "validating crash plan");
        let outcome = self.executor.run(&invocation)?;

        let verdict = if outcome.timed_out {
            Verdict::Inconsistent {
                signature: TIMEOUT_SIGNATURE.to_owned(),
            }
        } else if !outcome.succeeded() {
            Verdict::Inconsistent {
                signature: self.executor.post_mortem(&invocation, &outcome),
            }
        } else {
            let full = self.oracles.full(self.config)?;
            let skip = self.oracles.skip(tx, self.config, self.executor)?;
            let comparison = compare_to_oracles(&output, &full, &skip, tx);
            if comparison.is_inconsistent() {
                Verdict::Inconsistent {
                    signature: format!("output diff:{}", comparison.mismatch()),
                }
            } else {
                Verdict::Consistent
            }
        };

        if let Verdict::Inconsistent { signature } = &verdict {
            info!(
                tx,
                fence = %fence,
                plan = %plan.op,
                src = %plan.src,
                signature = %signature,
                "crash plan reported"
            );
            self.results.record_report(record, signature);
        }
        if !self.config.keep_images {
            remove_if_present(&crash_path);
        }
        Ok(verdict)
    }

    /// Copy the flushed image and apply the plan to the copy. A kept run
    /// also saves the untouched crash state as `<crash image>-crash`, since
    /// recovery rewrites the image in place.
    fn build_crash_image(
        &self,
        path: &Path,
        plan: &CrashPlan,
        cache: &CacheSim,
        image: &PmImage,
    ) -> Result<()> {
        let mut copy = image.copy_to(path)?;
        if plan.kind == PlanKind::PersistStore {
            for store in cache.stores_up_to(plan.op)? {
                copy.write_store(store.range, &store.bytes)?;
            }
        }
        copy.sync()?;
        if self.config.keep_images {
            fs::copy(path, with_suffix(path, "-crash"))?;
        }
        Ok(())
    }

    pub fn results(&self) -> &ValidationResults {
        &self.results
    }

    pub fn into_results(self) -> ValidationResults {
        self.results
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn suffix_appends_to_file_name() {
        assert_eq!(
            with_suffix(Path::new("/out/pm-image-0-5-3"), "-output"),
            PathBuf::from("/out/pm-image-0-5-3-output")
        );
    }

    #[test]
    fn crash_image_naming() {
        let config = ReplayConfig {
            output_dir: PathBuf::from("/out"),
            ..ReplayConfig::default()
        };
        let executor = crate::executor::ProcessExecutor::new("/tmp");
        let validator = CrashValidator::new(&config, &executor);
        let plan = CrashPlan::persist_store(OpId::new(3), pmcheck_types::SourceTag::new("a.c:1"));
        assert_eq!(
            validator.crash_image_path(0, OpId::new(5), &plan),
            PathBuf::from("/out/pm-image-0-5-3")
        );
    }
}
