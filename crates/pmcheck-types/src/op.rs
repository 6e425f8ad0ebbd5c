//! Typed trace operations.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::range::AddrRange;
use crate::{OpId, ThreadId};

/// Source location of the instrumented instruction, as recorded.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SourceTag(String);

impl SourceTag {
    pub fn new(tag: impl Into<String>) -> Self {
        Self(tag.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SourceTag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Persistence progress of one buffered store.
///
/// Transitions only move forward: `Clear -> Flushing -> Fenced`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum FlushState {
    /// Sitting in the cache, no flush seen.
    Clear,
    /// A covering flush was issued; the next fence makes it durable.
    Flushing,
    /// Written back to the image.
    Fenced,
}

impl FlushState {
    /// Advance to `target` if that is forward progress.
    ///
    /// Returns `true` when the state changed.
    pub fn advance_to(&mut self, target: Self) -> bool {
        if target > *self {
            *self = target;
            true
        } else {
            false
        }
    }

    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Clear => "clear",
            Self::Flushing => "flushing",
            Self::Fenced => "fenced",
        }
    }
}

impl fmt::Display for FlushState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an operation does.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum OpKind {
    TxStart,
    TxEnd,
    /// One atomic-write chunk. `bytes.len() == range.size`.
    Store { range: AddrRange, bytes: Vec<u8> },
    /// Always normalized to one aligned cacheline.
    Flush { range: AddrRange },
    Fence,
    /// Library entry/exit marker, replayed as a no-op.
    LibCall { name: String, phase: Option<String> },
    /// Undo-log registration of a range.
    LibRangeAdd { range: AddrRange },
    /// Transactional allocation of a range.
    LibRangeAlloc { range: AddrRange },
}

impl OpKind {
    /// Record tag used in trace files.
    pub fn tag(&self) -> &str {
        match self {
            Self::TxStart => "TXStart",
            Self::TxEnd => "TXEnd",
            Self::Store { .. } => "Store",
            Self::Flush { .. } => "Flush",
            Self::Fence => "Fence",
            Self::LibCall { name, .. } => name,
            Self::LibRangeAdd { .. } => "TXAdd",
            Self::LibRangeAlloc { .. } => "TXAlloc",
        }
    }
}

/// One operation of the atomic-write-granularity trace.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Operation {
    pub id: OpId,
    pub tid: ThreadId,
    pub src: SourceTag,
    pub kind: OpKind,
}

impl Operation {
    pub const fn is_store(&self) -> bool {
        matches!(self.kind, OpKind::Store { .. })
    }

    pub const fn is_fence(&self) -> bool {
        matches!(self.kind, OpKind::Fence)
    }

    /// The written range, for stores only.
    pub const fn store_range(&self) -> Option<AddrRange> {
        match &self.kind {
            OpKind::Store { range, .. } => Some(*range),
            _ => None,
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{},{},{}", self.id, self.kind.tag(), self.tid)?;
        match &self.kind {
            OpKind::Store { range, bytes } => {
                write!(f, ",{:#x},{},", range.address, range.size)?;
                for (i, byte) in bytes.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" ")?;
                    }
                    write!(f, "{byte:02x}")?;
                }
            }
            OpKind::Flush { range }
            | OpKind::LibRangeAdd { range }
            | OpKind::LibRangeAlloc { range } => {
                write!(f, ",{:#x},{}", range.address, range.size)?;
            }
            OpKind::LibCall {
                phase: Some(phase), ..
            } => write!(f, ",{phase}")?,
            OpKind::TxStart | OpKind::TxEnd | OpKind::Fence | OpKind::LibCall { .. } => {}
        }
        write!(f, ",{}", self.src)
    }
}
