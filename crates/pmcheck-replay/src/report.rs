//! Result files under `<output_dir>/res/`.

use std::collections::BTreeMap;
use std::fmt::{self, Write as _};
use std::fs;
use std::path::{Path, PathBuf};

use pmcheck_belief::BeliefDatabase;
use pmcheck_error::Result;
use pmcheck_types::Trace;
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::candidates::CandidateSet;
use crate::results::{PlanRecord, ValidationResults};

/// Final run counts.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Summary {
    pub trace_store_count: usize,
    pub pm_object_count: usize,
    pub belief_count: usize,
    pub critical_read_count: usize,
    pub tested_crash_plan_count: usize,
    pub reported_crash_plan_count: usize,
}

impl Summary {
    /// Counts for a run; belief counts are zero when candidates were loaded
    /// from a file instead of inferred.
    pub fn collect(
        trace: &Trace,
        beliefs: Option<&BeliefDatabase>,
        results: &ValidationResults,
    ) -> Self {
        Self {
            trace_store_count: trace.store_count_in_transactions(),
            pm_object_count: beliefs.map_or(0, BeliefDatabase::pm_object_count),
            belief_count: beliefs.map_or(0, BeliefDatabase::belief_count),
            critical_read_count: beliefs.map_or(0, BeliefDatabase::critical_read_count),
            tested_crash_plan_count: results.tested.len(),
            reported_crash_plan_count: results.reported.len(),
        }
    }
}

impl fmt::Display for Summary {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "trace_store_count: {}", self.trace_store_count)?;
        writeln!(f, "pm_object_count: {}", self.pm_object_count)?;
        writeln!(f, "belief_count: {}", self.belief_count)?;
        writeln!(f, "critical_read_count: {}", self.critical_read_count)?;
        writeln!(f, "tested_crash_plan_count: {}", self.tested_crash_plan_count)?;
        writeln!(
            f,
            "reported_crash_plan_count: {}",
            self.reported_crash_plan_count
        )
    }
}

pub struct ReportWriter {
    dir: PathBuf,
}

impl ReportWriter {
    /// Create `<output_dir>/res/`.
    pub fn new(output_dir: &Path) -> Result<Self> {
        let dir = output_dir.join("res");
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    /// Write every result file and return the summary.
    pub fn write_all(
        &self,
        trace: &Trace,
        beliefs: Option<&BeliefDatabase>,
        candidates: &CandidateSet,
        results: &ValidationResults,
    ) -> Result<Summary> {
        trace.write_atomic(&self.dir.join("atomic_write.pmtrace"))?;
        if let Some(beliefs) = beliefs {
            self.write_beliefs(beliefs)?;
        }
        candidates.write(&self.dir.join("crash_candidates"))?;

        self.write_text("crash_plans_tested", &records(&results.tested))?;
        self.write_text("crash_plans_reported", &records(&results.reported))?;
        self.write_text(
            "crash_plans_reported_src_map",
            &grouped(&results.by_source),
        )?;
        self.write_text(
            "crash_plans_reported_signature_map",
            &grouped(&results.by_signature),
        )?;
        let mut priority = String::new();
        for (src, by_signature) in &results.priority {
            let _ = writeln!(priority, "{src}");
            for (signature, plans) in by_signature {
                let _ = writeln!(priority, "\t{signature}");
                for plan in plans {
                    let _ = writeln!(priority, "\t\t{plan}");
                }
            }
        }
        self.write_text("crash_plans_reported_priority_map", &priority)?;
        self.write_text("results.json", &results.to_json()?)?;

        let summary = Summary::collect(trace, beliefs, results);
        self.write_text("summary", &summary.to_string())?;
        info!(dir = %self.dir.display(), reported = summary.reported_crash_plan_count, "results written");
        Ok(summary)
    }

    fn write_beliefs(&self, beliefs: &BeliefDatabase) -> Result<()> {
        let mut objects = String::new();
        for object in beliefs.objects().iter() {
            let _ = writeln!(
                objects,
                "{}\t{:#x}\t{}",
                object.id, object.range.address, object.range.size
            );
        }
        self.write_text("pm_object", &objects)?;

        let mut edges = String::new();
        for belief in beliefs.beliefs() {
            let _ = writeln!(edges, "{}\t{}\t{}", belief.before, belief.after, belief.count);
        }
        self.write_text("belief", &edges)?;

        let mut critical = String::new();
        for object in beliefs.critical_objects() {
            let _ = writeln!(
                critical,
                "{}\t{:#x}\t{}",
                object.id, object.range.address, object.range.size
            );
        }
        self.write_text("critical_read", &critical)
    }

    fn write_text(&self, name: &str, text: &str) -> Result<()> {
        fs::write(self.dir.join(name), text)?;
        Ok(())
    }
}

fn records(plans: &[PlanRecord]) -> String {
    let mut out = String::new();
    for plan in plans {
        let _ = writeln!(out, "{plan}");
    }
    out
}

fn grouped(map: &BTreeMap<String, Vec<PlanRecord>>) -> String {
    let mut out = String::new();
    for (key, plans) in map {
        let _ = writeln!(out, "{key}");
        for plan in plans {
            let _ = writeln!(out, "\t{plan}");
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use pmcheck_types::{OpId, SourceTag};

    use super::*;
    use crate::results::CrashPlan;

    #[test]
    fn writes_every_result_file() {
        let dir = tempfile::tempdir().unwrap();
        let trace = Trace::parse(
            "TXStart,0,a\nStore,0,1000,8,0 0 0 0 0 0 0 1,x.c:1\nFence,0,f.c:2\nTXEnd,0,d\n",
        )
        .unwrap();
        let mut results = ValidationResults::default();
        let record = PlanRecord {
            tx: 0,
            fence: OpId::new(2),
            plan: CrashPlan::persist_store(OpId::new(1), SourceTag::new("x.c:1")),
            output: dir.path().join("pm-image-0-2-1-output"),
        };
        results.record_tested(record.clone());
        results.record_report(record, "timeout");

        let writer = ReportWriter::new(dir.path()).unwrap();
        let summary = writer
            .write_all(&trace, None, &CandidateSet::default(), &results)
            .unwrap();
        assert_eq!(summary.trace_store_count, 1);
        assert_eq!(summary.reported_crash_plan_count, 1);
        assert_eq!(summary.belief_count, 0);

        for name in [
            "atomic_write.pmtrace",
            "crash_candidates",
            "crash_plans_tested",
            "crash_plans_reported",
            "crash_plans_reported_src_map",
            "crash_plans_reported_signature_map",
            "crash_plans_reported_priority_map",
            "results.json",
            "summary",
        ] {
            assert!(writer.dir().join(name).is_file(), "{name} missing");
        }
        let priority =
            fs::read_to_string(writer.dir().join("crash_plans_reported_priority_map")).unwrap();
        assert!(priority.starts_with("x.c:1\n\ttimeout\n\t\ttx=0 fence=2"));
        let text = fs::read_to_string(writer.dir().join("summary")).unwrap();
        assert!(text.contains("tested_crash_plan_count: 1\n"));
    }
}
