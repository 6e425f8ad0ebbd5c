use std::path::PathBuf;

use thiserror::Error;

/// Primary error type for pmcheck operations.
///
/// Contract violations (malformed input, unbalanced nesting, unresolvable
/// stores) abort a run. Validator failures are never errors: they are the
/// results the checker exists to report.
#[derive(Error, Debug)]
pub enum PmcheckError {
    // === Input Errors ===
    /// A trace record could not be parsed.
    #[error("malformed trace record at line {line}: {detail}")]
    MalformedTrace { line: usize, detail: String },

    /// A dependence-graph line could not be parsed.
    #[error("malformed dependence graph at line {line}: {detail}")]
    MalformedGraph { line: usize, detail: String },

    /// Transaction or library-call begin/end markers do not pair up.
    #[error("unbalanced nesting at op {op}: {detail}")]
    UnbalancedNesting { op: u64, detail: String },

    /// A candidate file could not be parsed.
    #[error("malformed candidate file at line {line}: {detail}")]
    MalformedCandidates { line: usize, detail: String },

    // === Contract Errors ===
    /// A store does not fit in exactly one buffering unit.
    #[error("store {op} at {address:#x} (+{size}) straddles its cacheline")]
    CachelineStraddle { op: u64, address: u64, size: u64 },

    /// A write or read falls outside the backing memory image.
    #[error("range {address:#x} (+{size}) outside image of {image_len} bytes")]
    ImageOutOfBounds {
        address: u64,
        size: u64,
        image_len: u64,
    },

    /// A crash plan named a store the cache simulator is not holding.
    #[error("store {op} is not buffered in the cache simulator")]
    UnknownStore { op: u64 },

    /// An op id does not exist in the trace.
    #[error("no operation with id {op}")]
    UnknownOp { op: u64 },

    // === Environment Errors ===
    /// Configuration is missing a required value or holds an invalid one.
    #[error("invalid configuration: {detail}")]
    InvalidConfig { detail: String },

    /// The external validator could not be started or reaped.
    #[error("failed to run validator '{program}': {detail}")]
    ValidatorSpawn { program: PathBuf, detail: String },

    /// JSON (de)serialization failure.
    #[error("serialization error: {detail}")]
    Serialization { detail: String },

    /// File I/O error.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Internal logic error (should never happen).
    #[error("internal error: {0}")]
    Internal(String),
}

/// Coarse error classes, doubling as process exit codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(i32)]
pub enum ErrorCode {
    /// Successful result.
    Ok = 0,
    /// The run completed and reported inconsistencies.
    Reported = 1,
    /// Command-line usage error.
    Usage = 2,
    /// Malformed input file.
    Input = 3,
    /// Contract violation during replay.
    Contract = 4,
    /// Bad configuration.
    Config = 5,
    /// I/O or process failure.
    IoErr = 6,
    /// Internal logic error.
    Internal = 7,
}

impl PmcheckError {
    /// Map this error to its coarse class.
    #[allow(clippy::match_same_arms)]
    pub const fn error_code(&self) -> ErrorCode {
        match self {
            Self::MalformedTrace { .. }
            | Self::MalformedGraph { .. }
            | Self::MalformedCandidates { .. } => ErrorCode::Input,
            Self::UnbalancedNesting { .. }
            | Self::CachelineStraddle { .. }
            | Self::ImageOutOfBounds { .. }
            | Self::UnknownStore { .. }
            | Self::UnknownOp { .. } => ErrorCode::Contract,
            Self::InvalidConfig { .. } => ErrorCode::Config,
            Self::ValidatorSpawn { .. } | Self::Io(_) => ErrorCode::IoErr,
            Self::Serialization { .. } => ErrorCode::Input,
            Self::Internal(_) => ErrorCode::Internal,
        }
    }

    /// Whether this error means the input data broke a replay contract.
    pub const fn is_contract_violation(&self) -> bool {
        matches!(
            self,
            Self::MalformedTrace { .. }
                | Self::UnbalancedNesting { .. }
                | Self::CachelineStraddle { .. }
                | Self::ImageOutOfBounds { .. }
                | Self::UnknownStore { .. }
                | Self::UnknownOp { .. }
        )
    }

    /// Human-friendly suggestion for fixing this error.
    pub const fn suggestion(&self) -> Option<&'static str> {
        match self {
            Self::MalformedTrace { .. } | Self::UnbalancedNesting { .. } => {
                Some("Re-record the trace; the instrumented run may have been cut short")
            }
            Self::MalformedGraph { .. } => {
                Some("Regenerate the dependence graph with the matching compiler pass")
            }
            Self::ImageOutOfBounds { .. } => {
                Some("Check image_base and image_size against the traced mapping")
            }
            Self::ValidatorSpawn { .. } => Some("Check the validator path and its permissions"),
            _ => None,
        }
    }

    /// Get the process exit code for this error (for CLI use).
    pub const fn exit_code(&self) -> i32 {
        self.error_code() as i32
    }

    /// Create a trace parse error.
    pub fn trace(line: usize, detail: impl Into<String>) -> Self {
        Self::MalformedTrace {
            line,
            detail: detail.into(),
        }
    }

    /// Create a dependence-graph parse error.
    pub fn graph(line: usize, detail: impl Into<String>) -> Self {
        Self::MalformedGraph {
            line,
            detail: detail.into(),
        }
    }

    /// Create a candidate-file parse error.
    pub fn candidates(line: usize, detail: impl Into<String>) -> Self {
        Self::MalformedCandidates {
            line,
            detail: detail.into(),
        }
    }

    /// Create a configuration error.
    pub fn config(detail: impl Into<String>) -> Self {
        Self::InvalidConfig {
            detail: detail.into(),
        }
    }

    /// Create a serialization error.
    pub fn serialization(detail: impl Into<String>) -> Self {
        Self::Serialization {
            detail: detail.into(),
        }
    }

    /// Create an internal error.
    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}

/// Result type alias using `PmcheckError`.
pub type Result<T> = std::result::Result<T, PmcheckError>;
