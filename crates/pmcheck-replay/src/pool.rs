//! Per-transaction parallel testing.
//!
//! Each worker claims a transaction, replays the trace prefix into its own
//! cache and image under `<output_dir>/tx-<n>/`, tests that one transaction
//! and sends the results back. Workers share nothing mutable.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::mpsc;
use std::thread;

use pmcheck_error::Result;
use pmcheck_types::Trace;
use tracing::{debug, error, info};

use crate::candidates::CandidateSet;
use crate::config::ReplayConfig;
use crate::executor::RecoveryExecutor;
use crate::manager::CrashManager;
use crate::results::ValidationResults;

/// Results of one transaction, sent from a worker to the caller.
#[derive(Debug)]
pub struct TxOutcome {
    pub tx: usize,
    pub results: Result<ValidationResults>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TxWorkerPool {
    workers: usize,
}

impl TxWorkerPool {
    pub fn new(workers: usize) -> Self {
        Self {
            workers: workers.max(1),
        }
    }

    pub const fn workers(&self) -> usize {
        self.workers
    }

    /// Test every transaction with candidates and merge the results in
    /// transaction order. The first failing transaction aborts the run.
    pub fn run(
        &self,
        trace: &Trace,
        candidates: &CandidateSet,
        config: &ReplayConfig,
        executor: &dyn RecoveryExecutor,
    ) -> Result<ValidationResults> {
        let queue: Vec<usize> = (0..trace.tx_count())
            .filter(|&tx| !candidates.get(tx).is_empty())
            .collect();
        info!(
            transactions = queue.len(),
            skipped = trace.tx_count() - queue.len(),
            workers = self.workers,
            "dispatching transactions"
        );

        let next = AtomicUsize::new(0);
        let abort = AtomicBool::new(false);
        let (sender, receiver) = mpsc::channel::<TxOutcome>();

        let mut outcomes: Vec<TxOutcome> = thread::scope(|s| {
            for worker_id in 0..self.workers.min(queue.len()) {
                let sender = sender.clone();
                let (queue, next, abort) = (&queue, &next, &abort);
                s.spawn(move || {
                    while !abort.load(Ordering::Acquire) {
                        let slot = next.fetch_add(1, Ordering::Relaxed);
                        let Some(&tx) = queue.get(slot) else {
                            break;
                        };
                        debug!(worker_id, tx, "transaction claimed");
                        let results = test_one(tx, trace, candidates, config, executor);
                        if results.is_err() {
                            abort.store(true, Ordering::Release);
                        }
                        if sender.send(TxOutcome { tx, results }).is_err() {
                            break;
                        }
                    }
                });
            }
            drop(sender);
            receiver.iter().collect()
        });

        outcomes.sort_by_key(|o| o.tx);
        let mut merged = ValidationResults::default();
        for outcome in outcomes {
            match outcome.results {
                Ok(results) => merged.merge(results),
                Err(e) => {
                    error!(tx = outcome.tx, error = %e, "transaction failed");
                    return Err(e);
                }
            }
        }
        Ok(merged)
    }
}

fn test_one(
    tx: usize,
    trace: &Trace,
    candidates: &CandidateSet,
    config: &ReplayConfig,
    executor: &dyn RecoveryExecutor,
) -> Result<ValidationResults> {
    let worker_config = config.with_output_dir(config.output_dir.join(format!("tx-{tx}")));
    let mut manager = CrashManager::new(trace, &worker_config, executor)?;
    manager.run_transaction(tx, candidates)?;
    Ok(manager.into_results())
}

impl Default for TxWorkerPool {
    fn default() -> Self {
        Self::new(1)
    }
}

impl From<&ReplayConfig> for TxWorkerPool {
    fn from(config: &ReplayConfig) -> Self {
        Self::new(config.workers)
    }
}
