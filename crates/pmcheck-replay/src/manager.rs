//! The crash manager: replays a trace through the cache simulator and, at
//! every fence inside a transaction, turns decidable candidates into crash
//! plans for the validator.

use std::collections::{BTreeSet, VecDeque};
use std::fmt;
use std::fs;

use pmcheck_cache::{CacheSim, PmImage};
use pmcheck_error::{PmcheckError, Result};
use pmcheck_types::{OpId, OpKind, Operation, Trace};
use tracing::{debug, info, warn};

use crate::candidates::{Candidate, CandidateSet};
use crate::config::ReplayConfig;
use crate::executor::RecoveryExecutor;
use crate::results::{CrashPlan, ValidationResults};
use crate::validator::CrashValidator;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ManagerState {
    BeforeTransactions,
    InTransaction { tx: usize },
    AtFence { tx: usize, fence: OpId },
    Done,
}

impl fmt::Display for ManagerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::BeforeTransactions => f.write_str("before_transactions"),
            Self::InTransaction { tx } => write!(f, "in_transaction({tx})"),
            Self::AtFence { tx, fence } => write!(f, "at_fence({tx}, {fence})"),
            Self::Done => f.write_str("done"),
        }
    }
}

/// What to do at the fences of a tested transaction.
#[derive(Debug, Clone, Copy)]
enum Mode {
    Candidates { stop_after_first: bool },
    Target { fence: OpId, op: OpId },
}

pub struct CrashManager<'a> {
    trace: &'a Trace,
    config: &'a ReplayConfig,
    cache: CacheSim,
    image: PmImage,
    validator: CrashValidator<'a>,
    state: ManagerState,
}

impl<'a> CrashManager<'a> {
    /// Create `output_dir` and a zero-filled replay image in it.
    pub fn new(
        trace: &'a Trace,
        config: &'a ReplayConfig,
        executor: &'a dyn RecoveryExecutor,
    ) -> Result<Self> {
        fs::create_dir_all(&config.output_dir)?;
        let image = PmImage::create(&config.image_path(), config.image_base, config.image_size)?;
        Ok(Self {
            trace,
            config,
            cache: CacheSim::new(config.granularity),
            image,
            validator: CrashValidator::new(config, executor),
            state: ManagerState::BeforeTransactions,
        })
    }

    pub const fn state(&self) -> ManagerState {
        self.state
    }

    pub fn cache(&self) -> &CacheSim {
        &self.cache
    }

    pub fn image(&self) -> &PmImage {
        &self.image
    }

    pub fn results(&self) -> &ValidationResults {
        self.validator.results()
    }

    pub fn into_results(self) -> ValidationResults {
        self.validator.into_results()
    }

    fn ensure_fresh(&self) -> Result<()> {
        if self.state == ManagerState::BeforeTransactions {
            Ok(())
        } else {
            Err(PmcheckError::internal(format!(
                "crash manager already ran (state {})",
                self.state
            )))
        }
    }

    /// Test every transaction of the trace against `candidates`.
    pub fn run(&mut self, candidates: &CandidateSet) -> Result<()> {
        self.ensure_fresh()?;
        let trace = self.trace;
        let mut cursor = 0;
        for (tx, range) in trace.tx_ranges().iter().enumerate() {
            self.replay_untested(trace.ops_between(cursor, range.start.index()))?;
            self.test_transaction(
                tx,
                candidates.get(tx),
                Mode::Candidates {
                    stop_after_first: false,
                },
            )?;
            cursor = range.end.index() + 1;
        }
        self.replay_untested(trace.ops_between(cursor, trace.len()))?;
        self.finish();
        Ok(())
    }

    /// Replay everything before transaction `tx`, then test only `tx`.
    pub fn run_transaction(&mut self, tx: usize, candidates: &CandidateSet) -> Result<()> {
        self.ensure_fresh()?;
        let trace = self.trace;
        let range = trace.tx(tx)?;
        self.replay_untested(trace.ops_between(0, range.start.index()))?;
        self.test_transaction(
            tx,
            candidates.get(tx),
            Mode::Candidates {
                stop_after_first: false,
            },
        )?;
        self.finish();
        Ok(())
    }

    /// Crash-test one externally chosen `(pre, succ)` pair the first time it
    /// becomes decidable, then stop.
    pub fn run_pair(&mut self, pre: OpId, succ: OpId) -> Result<()> {
        self.ensure_fresh()?;
        let trace = self.trace;
        let tx = self.pair_transaction(pre, succ)?;
        let range = trace.tx(tx)?;
        let candidate = [Candidate::new(pre, succ)];
        self.replay_untested(trace.ops_between(0, range.start.index()))?;
        self.test_transaction(
            tx,
            &candidate,
            Mode::Candidates {
                stop_after_first: true,
            },
        )?;
        self.finish();
        Ok(())
    }

    /// Re-validate one plan: persist `op` (or nothing, when `op` is the
    /// fence) at `fence` of transaction `tx`.
    pub fn run_target(&mut self, tx: usize, fence: OpId, op: OpId) -> Result<()> {
        self.ensure_fresh()?;
        let trace = self.trace;
        let range = trace.tx(tx)?;
        if !range.contains(fence) || !trace.op(fence)?.is_fence() {
            return Err(PmcheckError::config(format!(
                "op {fence} is not a fence of transaction {tx}"
            )));
        }
        self.replay_untested(trace.ops_between(0, range.start.index()))?;
        self.test_transaction(tx, &[], Mode::Target { fence, op })?;
        self.finish();
        Ok(())
    }

    fn pair_transaction(&self, pre: OpId, succ: OpId) -> Result<usize> {
        let tx = self.trace.tx_containing(pre);
        match tx {
            Some(tx) if self.trace.tx_containing(succ) == Some(tx) => Ok(tx),
            _ => Err(PmcheckError::config(format!(
                "stores {pre} and {succ} are not in the same transaction"
            ))),
        }
    }

    fn finish(&mut self) {
        self.state = ManagerState::Done;
        info!(summary = %self.validator.results().triage_line(), "crash manager done");
    }

    /// Replay without crash testing. Fences write back flushed stores;
    /// transaction boundaries and the end of the slice write back
    /// everything.
    fn replay_untested(&mut self, ops: &[Operation]) -> Result<()> {
        for op in ops {
            if self.cache.accept(op)? {
                self.cache.write_back_flushing(&mut self.image)?;
            } else if matches!(op.kind, OpKind::TxStart | OpKind::TxEnd) {
                self.cache.write_back_all(&mut self.image)?;
            }
        }
        self.cache.write_back_all(&mut self.image)?;
        Ok(())
    }

    fn test_transaction(&mut self, tx: usize, candidates: &[Candidate], mode: Mode) -> Result<()> {
        self.state = ManagerState::InTransaction { tx };
        let trace = self.trace;
        let interior = trace.tx_interior(tx)?;

        if let (Mode::Candidates { .. }, Some(max)) = (mode, self.config.max_candidates) {
            if candidates.len() > max {
                warn!(
                    tx,
                    candidates = candidates.len(),
                    max_candidates = max,
                    "too many candidates, transaction abandoned"
                );
                return self.replay_untested(interior);
            }
        }

        let mut pending: VecDeque<Candidate> = candidates.iter().copied().collect();
        let mut target_reached = false;
        for (idx, op) in interior.iter().enumerate() {
            if !self.cache.accept(op)? {
                continue;
            }
            self.state = ManagerState::AtFence { tx, fence: op.id };
            let stop = match mode {
                Mode::Candidates { stop_after_first } => {
                    let validated = self.at_fence(tx, op, &mut pending)?;
                    stop_after_first && validated
                }
                Mode::Target { fence, op: target } if fence == op.id => {
                    let plan = if target == fence {
                        CrashPlan::persist_nothing(fence, op.src.clone())
                    } else {
                        CrashPlan::persist_store(target, trace.op(target)?.src.clone())
                    };
                    self.validator.validate(
                        tx,
                        fence,
                        &BTreeSet::from([plan]),
                        &self.cache,
                        &self.image,
                    )?;
                    target_reached = true;
                    true
                }
                Mode::Target { .. } => {
                    self.cache.write_back_flushing(&mut self.image)?;
                    false
                }
            };
            self.state = ManagerState::InTransaction { tx };
            if stop {
                debug!(tx, fence = %op.id, "stopping after first validation");
                return self.replay_untested(&interior[idx + 1..]);
            }
        }
        if let Mode::Target { fence, .. } = mode {
            if !target_reached {
                return Err(PmcheckError::internal(format!(
                    "fence {fence} not reached in transaction {tx}"
                )));
            }
        }
        if !pending.is_empty() {
            debug!(tx, pending = pending.len(), "candidates left undecided at transaction end");
        }
        self.cache.write_back_all(&mut self.image)?;
        Ok(())
    }

    /// Verify, validate, write back, requeue. Returns whether any plan was
    /// validated.
    fn at_fence(
        &mut self,
        tx: usize,
        fence: &Operation,
        pending: &mut VecDeque<Candidate>,
    ) -> Result<bool> {
        let (plans, popped) = self.verify(fence, pending)?;
        let validated = !plans.is_empty();
        if validated {
            self.validator
                .validate(tx, fence.id, &plans, &self.cache, &self.image)?;
        }
        self.cache.write_back_flushing(&mut self.image)?;
        for candidate in popped.into_iter().rev() {
            if !self.cache.is_fenced(candidate.volatile) {
                pending.push_front(candidate);
            }
        }
        Ok(validated)
    }

    /// Pop every candidate decidable at `fence` and decide its crash plan.
    fn verify(
        &self,
        fence: &Operation,
        pending: &mut VecDeque<Candidate>,
    ) -> Result<(BTreeSet<CrashPlan>, Vec<Candidate>)> {
        let mut plans = BTreeSet::new();
        let mut popped = Vec::new();
        while let Some(candidate) = pending.front().copied() {
            if candidate.decidable_at() > fence.id {
                break;
            }
            pending.pop_front();
            popped.push(candidate);

            let pre = self.trace.op(candidate.pre)?;
            let volatile = self.trace.op(candidate.volatile)?;
            let pre_fenced = self.cache.is_fenced(pre.id);
            let volatile_fenced = self.cache.is_fenced(volatile.id);
            match (pre_fenced, volatile_fenced) {
                (false, false) => {
                    if pre.id < volatile.id || !self.cache.same_unit(pre, volatile) {
                        plans.insert(CrashPlan::persist_store(pre.id, pre.src.clone()));
                    }
                }
                (true, false) => {
                    plans.insert(CrashPlan::persist_nothing(fence.id, fence.src.clone()));
                }
                (_, true) => {}
            }
        }
        Ok((plans, popped))
    }
}
