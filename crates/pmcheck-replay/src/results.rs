//! Crash plans and the aggregated outcome of validating them.

use std::collections::BTreeMap;
use std::fmt;
use std::path::PathBuf;

use pmcheck_error::{PmcheckError, Result};
use pmcheck_types::{OpId, SourceTag};
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanKind {
    /// The fence is the crash point; nothing further persists.
    PersistNothing,
    /// Persist one store and its unit predecessors.
    PersistStore,
}

impl PlanKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::PersistNothing => "persist_nothing",
            Self::PersistStore => "persist_store",
        }
    }
}

impl fmt::Display for PlanKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A validator-ready crash plan. Ordered by op id.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CrashPlan {
    pub op: OpId,
    pub kind: PlanKind,
    pub src: SourceTag,
}

impl CrashPlan {
    pub fn persist_nothing(fence: OpId, src: SourceTag) -> Self {
        Self {
            op: fence,
            kind: PlanKind::PersistNothing,
            src,
        }
    }

    pub fn persist_store(store: OpId, src: SourceTag) -> Self {
        Self {
            op: store,
            kind: PlanKind::PersistStore,
            src,
        }
    }
}

/// One validated plan.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlanRecord {
    pub tx: usize,
    pub fence: OpId,
    pub plan: CrashPlan,
    /// Validator output file of this plan.
    pub output: PathBuf,
}

impl fmt::Display for PlanRecord {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "tx={} fence={} {}={} src={} output={}",
            self.tx,
            self.fence,
            self.plan.kind,
            self.plan.op,
            self.plan.src,
            self.output.display()
        )
    }
}

/// Tested and reported plans, indexed for clustering duplicate bugs.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ValidationResults {
    pub tested: Vec<PlanRecord>,
    pub reported: Vec<PlanRecord>,
    /// Source location of the plan's op to its reports.
    pub by_source: BTreeMap<String, Vec<PlanRecord>>,
    /// Failure signature to its reports.
    pub by_signature: BTreeMap<String, Vec<PlanRecord>>,
    /// Source location, then signature.
    pub priority: BTreeMap<String, BTreeMap<String, Vec<PlanRecord>>>,
}

impl ValidationResults {
    pub fn record_tested(&mut self, record: PlanRecord) {
        self.tested.push(record);
    }

    pub fn record_report(&mut self, record: PlanRecord, signature: &str) {
        let src = record.plan.src.as_str().to_owned();
        self.by_source
            .entry(src.clone())
            .or_default()
            .push(record.clone());
        self.by_signature
            .entry(signature.to_owned())
            .or_default()
            .push(record.clone());
        self.priority
            .entry(src)
            .or_default()
            .entry(signature.to_owned())
            .or_default()
            .push(record.clone());
        self.reported.push(record);
    }

    /// Fold another worker's results into these.
    pub fn merge(&mut self, other: Self) {
        self.tested.extend(other.tested);
        self.reported.extend(other.reported);
        for (src, records) in other.by_source {
            self.by_source.entry(src).or_default().extend(records);
        }
        for (sig, records) in other.by_signature {
            self.by_signature.entry(sig).or_default().extend(records);
        }
        for (src, by_sig) in other.priority {
            let slot = self.priority.entry(src).or_default();
            for (sig, records) in by_sig {
                slot.entry(sig).or_default().extend(records);
            }
        }
    }

    #[must_use]
    pub fn is_clean(&self) -> bool {
        self.reported.is_empty()
    }

    pub fn to_json(&self) -> Result<String> {
        serde_json::to_string_pretty(self).map_err(|e| PmcheckError::serialization(e.to_string()))
    }

    pub fn from_json(input: &str) -> Result<Self> {
        serde_json::from_str(input).map_err(|e| PmcheckError::serialization(e.to_string()))
    }

    #[must_use]
    pub fn triage_line(&self) -> String {
        format!(
            "tested={} reported={} sources={} signatures={}",
            self.tested.len(),
            self.reported.len(),
            self.by_source.len(),
            self.by_signature.len()
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn record(tx: usize, op: u64, src: &str) -> PlanRecord {
        PlanRecord {
            tx,
            fence: OpId::new(op + 1),
            plan: CrashPlan::persist_store(OpId::new(op), SourceTag::new(src)),
            output: PathBuf::from(format!("img-{tx}-{}-{op}-output", op + 1)),
        }
    }

    #[test]
    fn plans_order_by_op_id() {
        let a = CrashPlan::persist_nothing(OpId::new(9), SourceTag::new("z"));
        let b = CrashPlan::persist_store(OpId::new(3), SourceTag::new("a"));
        let mut set = std::collections::BTreeSet::new();
        set.insert(a.clone());
        set.insert(b.clone());
        set.insert(b.clone());
        assert_eq!(set.into_iter().collect::<Vec<_>>(), vec![b, a]);
    }

    #[test]
    fn reports_are_indexed_three_ways() {
        let mut results = ValidationResults::default();
        results.record_tested(record(0, 4, "list.c:10"));
        results.record_tested(record(0, 5, "list.c:10"));
        results.record_report(record(0, 4, "list.c:10"), "timeout");
        results.record_report(record(0, 5, "list.c:10"), "output diff:tx-3 tx-2");
        assert_eq!(results.tested.len(), 2);
        assert_eq!(results.reported.len(), 2);
        assert_eq!(results.by_source["list.c:10"].len(), 2);
        assert_eq!(results.by_signature["timeout"].len(), 1);
        assert_eq!(results.priority["list.c:10"].len(), 2);
        assert!(!results.is_clean());
    }

    #[test]
    fn merge_combines_workers() {
        let mut left = ValidationResults::default();
        left.record_report(record(0, 4, "a.c:1"), "timeout");
        let mut right = ValidationResults::default();
        right.record_report(record(1, 14, "a.c:1"), "timeout");
        right.record_report(record(1, 15, "b.c:2"), "crash");
        left.merge(right);
        assert_eq!(left.reported.len(), 3);
        assert_eq!(left.by_signature["timeout"].len(), 2);
        assert_eq!(left.priority["a.c:1"]["timeout"].len(), 2);
        assert_eq!(left.triage_line(), "tested=0 reported=3 sources=2 signatures=2");
    }

    #[test]
    fn json_round_trip() {
        let mut results = ValidationResults::default();
        results.record_tested(record(2, 7, "x.c:9"));
        results.record_report(record(2, 7, "x.c:9"), "abnormal exit with no diagnostics");
        let back = ValidationResults::from_json(&results.to_json().unwrap()).unwrap();
        assert_eq!(back, results);
    }
}
