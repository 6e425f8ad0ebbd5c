//! Crash candidate generation, the crash manager and the crash validator.
//!
//! A run replays a trace through the cache simulator. At each fence inside a
//! transaction the manager turns decidable candidates into crash plans; the
//! validator materializes each plan as a crash image, runs the external
//! recovery program against it and compares its output with two oracles.

pub mod candidates;
pub mod config;
pub mod executor;
pub mod manager;
pub mod oracle;
pub mod pool;
pub mod report;
pub mod results;
pub mod session;
pub mod validator;

pub use candidates::{Candidate, CandidateSet, generate_for_stores};
pub use config::ReplayConfig;
pub use executor::{
    ExecOutcome, Invocation, NO_DIAGNOSTICS, ProcessExecutor, RecoveryExecutor, TIMEOUT_SIGNATURE,
};
pub use manager::{CrashManager, ManagerState};
pub use oracle::{Comparison, OracleCache, OracleMatch, compare_from_index, compare_to_oracles};
pub use pool::{TxOutcome, TxWorkerPool};
pub use report::{ReportWriter, Summary};
pub use results::{CrashPlan, PlanKind, PlanRecord, ValidationResults};
pub use session::{RunMode, Session, SessionOutcome};
pub use validator::{CrashValidator, Verdict};
