//! One end-to-end checking run: candidates, replay, reports.

use std::fs;

use pmcheck_belief::BeliefDatabase;
use pmcheck_error::Result;
use pmcheck_types::{OpId, Trace};
use tracing::info;

use crate::candidates::CandidateSet;
use crate::config::ReplayConfig;
use crate::executor::RecoveryExecutor;
use crate::manager::CrashManager;
use crate::pool::TxWorkerPool;
use crate::report::{ReportWriter, Summary};
use crate::results::ValidationResults;

/// Which crash points a run tests.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum RunMode {
    /// Every candidate of every transaction.
    #[default]
    All,
    /// One `(pre, succ)` pair, first decidable fence only.
    Pair { pre: OpId, succ: OpId },
    /// One plan at one fence.
    Target { tx: usize, fence: OpId, op: OpId },
}

#[derive(Debug)]
pub struct SessionOutcome {
    pub results: ValidationResults,
    pub summary: Summary,
}

pub struct Session {
    config: ReplayConfig,
    trace: Trace,
    beliefs: Option<BeliefDatabase>,
    candidates: CandidateSet,
}

impl Session {
    /// Infer candidates from a belief database.
    pub fn from_beliefs(config: ReplayConfig, trace: Trace, beliefs: BeliefDatabase) -> Result<Self> {
        let candidates = CandidateSet::generate(&trace, &beliefs, config.max_tx_stores)?;
        Ok(Self {
            config,
            trace,
            beliefs: Some(beliefs),
            candidates,
        })
    }

    /// Reuse a previously written candidate set.
    pub fn from_candidates(config: ReplayConfig, trace: Trace, candidates: CandidateSet) -> Self {
        Self {
            config,
            trace,
            beliefs: None,
            candidates,
        }
    }

    pub fn config(&self) -> &ReplayConfig {
        &self.config
    }

    pub fn trace(&self) -> &Trace {
        &self.trace
    }

    pub fn candidates(&self) -> &CandidateSet {
        &self.candidates
    }

    pub fn beliefs(&self) -> Option<&BeliefDatabase> {
        self.beliefs.as_ref()
    }

    pub fn run(&self, mode: RunMode, executor: &dyn RecoveryExecutor) -> Result<SessionOutcome> {
        self.config.validate()?;
        fs::create_dir_all(&self.config.output_dir)?;
        info!(
            ops = self.trace.len(),
            transactions = self.trace.tx_count(),
            candidates = self.candidates.total(),
            mode = ?mode,
            "replay starting"
        );

        let results = match mode {
            RunMode::All if self.config.workers > 1 => TxWorkerPool::from(&self.config).run(
                &self.trace,
                &self.candidates,
                &self.config,
                executor,
            )?,
            RunMode::All => {
                let mut manager = CrashManager::new(&self.trace, &self.config, executor)?;
                manager.run(&self.candidates)?;
                manager.into_results()
            }
            RunMode::Pair { pre, succ } => {
                let mut manager = CrashManager::new(&self.trace, &self.config, executor)?;
                manager.run_pair(pre, succ)?;
                manager.into_results()
            }
            RunMode::Target { tx, fence, op } => {
                let mut manager = CrashManager::new(&self.trace, &self.config, executor)?;
                manager.run_target(tx, fence, op)?;
                manager.into_results()
            }
        };

        let writer = ReportWriter::new(&self.config.output_dir)?;
        let summary = writer.write_all(
            &self.trace,
            self.beliefs.as_ref(),
            &self.candidates,
            &results,
        )?;
        info!(summary = %results.triage_line(), "replay finished");
        Ok(SessionOutcome { results, summary })
    }
}
