//! Crash candidate generation.
//!
//! A candidate `(pre, volatile)` asks: what if `pre` reached PM while
//! `volatile` was lost? Per-transaction lists are ordered by the larger of
//! the two ids, so the crash manager can pop every candidate decidable at a
//! fence from the front of the list.

use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use pmcheck_belief::BeliefDatabase;
use pmcheck_error::{PmcheckError, Result};
use pmcheck_types::{OpId, Operation, Trace};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Candidate {
    pub pre: OpId,
    pub volatile: OpId,
}

impl Candidate {
    pub const fn new(pre: OpId, volatile: OpId) -> Self {
        Self { pre, volatile }
    }

    /// First fence id at which the candidate can be evaluated.
    pub fn decidable_at(&self) -> OpId {
        self.pre.max(self.volatile)
    }
}

/// Candidates for the stores of one transaction, in program order.
///
/// Returns an empty list when the transaction holds more than
/// `max_stores` stores.
pub fn generate_for_stores(
    stores: &[&Operation],
    beliefs: &BeliefDatabase,
    max_stores: usize,
) -> Vec<Candidate> {
    if stores.len() > max_stores {
        warn!(
            stores = stores.len(),
            max_stores, "transaction too large, candidate generation skipped"
        );
        return Vec::new();
    }
    let critical: Vec<bool> = stores
        .iter()
        .map(|s| beliefs.is_critical_store(s))
        .collect();
    let mut out = Vec::new();
    for j in 1..stores.len() {
        for i in 0..j {
            let (pre, succ) = (stores[i], stores[j]);
            if critical[i] && critical[j] {
                out.push(Candidate::new(pre.id, succ.id));
                out.push(Candidate::new(succ.id, pre.id));
                continue;
            }
            if beliefs.violates_ordering(pre, succ) {
                out.push(Candidate::new(pre.id, succ.id));
            }
            if beliefs.violates_ordering(succ, pre) {
                out.push(Candidate::new(succ.id, pre.id));
            }
        }
    }
    out
}

/// Candidate lists for every transaction of a trace.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CandidateSet {
    per_tx: Vec<Vec<Candidate>>,
}

impl CandidateSet {
    /// Generate candidates for every transaction.
    pub fn generate(trace: &Trace, beliefs: &BeliefDatabase, max_stores: usize) -> Result<Self> {
        let mut per_tx = Vec::with_capacity(trace.tx_count());
        for tx in 0..trace.tx_count() {
            let stores = trace.tx_stores(tx)?;
            let list = generate_for_stores(&stores, beliefs, max_stores);
            debug!(tx, stores = stores.len(), candidates = list.len(), "candidates generated");
            per_tx.push(list);
        }
        let set = Self { per_tx };
        info!(
            transactions = set.tx_count(),
            candidates = set.total(),
            "crash candidates ready"
        );
        Ok(set)
    }

    /// A set holding one candidate for one transaction.
    pub fn single(tx_count: usize, tx: usize, candidate: Candidate) -> Self {
        let mut per_tx = vec![Vec::new(); tx_count.max(tx + 1)];
        per_tx[tx].push(candidate);
        Self { per_tx }
    }

    pub fn from_lists(mut per_tx: Vec<Vec<Candidate>>) -> Self {
        for list in &mut per_tx {
            list.sort_by_key(Candidate::decidable_at);
        }
        Self { per_tx }
    }

    pub fn tx_count(&self) -> usize {
        self.per_tx.len()
    }

    /// Candidates of `tx`; empty for transactions without any.
    pub fn get(&self, tx: usize) -> &[Candidate] {
        self.per_tx.get(tx).map(Vec::as_slice).unwrap_or_default()
    }

    pub fn total(&self) -> usize {
        self.per_tx.iter().map(Vec::len).sum()
    }

    /// Write in the reloadable `tx\t<n>` / `<pre>\t<volatile>` format.
    pub fn write(&self, path: &Path) -> Result<()> {
        let mut out = String::new();
        for (tx, list) in self.per_tx.iter().enumerate() {
            let _ = writeln!(out, "tx\t{tx}");
            for c in list {
                let _ = writeln!(out, "{}\t{}", c.pre, c.volatile);
            }
        }
        fs::write(path, out)?;
        Ok(())
    }

    /// Load a candidate file written by [`write`](Self::write).
    ///
    /// Lists are padded to `tx_count` transactions and re-sorted by
    /// decidability.
    pub fn load(path: &Path, tx_count: usize) -> Result<Self> {
        let text = fs::read_to_string(path)?;
        let set = Self::parse(&text, tx_count)?;
        info!(
            path = %path.display(),
            candidates = set.total(),
            "crash candidates loaded"
        );
        Ok(set)
    }

    pub fn parse(text: &str, tx_count: usize) -> Result<Self> {
        let mut per_tx: Vec<Vec<Candidate>> = vec![Vec::new(); tx_count];
        let mut current: Option<usize> = None;
        for (idx, raw) in text.lines().enumerate() {
            let line_no = idx + 1;
            let line = raw.trim();
            if line.is_empty() {
                continue;
            }
            let mut parts = line.split('\t');
            let (Some(first), Some(second), None) = (parts.next(), parts.next(), parts.next())
            else {
                return Err(PmcheckError::candidates(line_no, "expected two tab-separated fields"));
            };
            if first == "tx" {
                let tx = second.parse::<usize>().map_err(|e| {
                    PmcheckError::candidates(line_no, format!("bad transaction '{second}': {e}"))
                })?;
                if per_tx.len() <= tx {
                    per_tx.resize(tx + 1, Vec::new());
                }
                current = Some(tx);
                continue;
            }
            let tx = current
                .ok_or_else(|| PmcheckError::candidates(line_no, "pair before any 'tx' line"))?;
            let id = |field: &str| {
                field.parse::<u64>().map(OpId::new).map_err(|e| {
                    PmcheckError::candidates(line_no, format!("bad op id '{field}': {e}"))
                })
            };
            per_tx[tx].push(Candidate::new(id(first)?, id(second)?));
        }
        Ok(Self::from_lists(per_tx))
    }
}
