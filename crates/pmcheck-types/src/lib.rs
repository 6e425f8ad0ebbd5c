//! Trace model shared by every pmcheck component.
//!
//! A trace is the operation log of one instrumented run: stores, flushes,
//! fences, transaction markers and library calls. Stores are split into
//! atomic-write chunks at load time, so every [`Operation`] here is already
//! at the granularity a crash can tear.

use std::fmt;

pub mod op;
pub mod range;
pub mod trace;

pub use op::{FlushState, OpKind, Operation, SourceTag};
pub use range::{ATOMIC_WRITE_BYTES, AddrRange, CACHELINE_BYTES, cacheline_address};
pub use trace::{Trace, TxRange};

/// Position of an operation in the atomic-write-granularity trace.
///
/// Ids are dense and strictly increasing from 0.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct OpId(u64);

impl OpId {
    #[inline]
    pub const fn new(raw: u64) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u64 {
        self.0
    }

    /// Index of this op in the trace's op vector.
    #[inline]
    #[allow(clippy::cast_possible_truncation)]
    pub const fn index(self) -> usize {
        self.0 as usize
    }
}

impl fmt::Display for OpId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u64> for OpId {
    fn from(value: u64) -> Self {
        Self(value)
    }
}

/// Thread that issued an operation in the traced run.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
#[repr(transparent)]
pub struct ThreadId(u32);

impl ThreadId {
    #[inline]
    pub const fn new(raw: u32) -> Self {
        Self(raw)
    }

    #[inline]
    pub const fn get(self) -> u32 {
        self.0
    }
}

impl fmt::Display for ThreadId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}
