//! Address ranges and the fixed hardware granules.

use std::cmp::Ordering;
use std::fmt;

/// Flush granule: a flush always covers one aligned cacheline.
pub const CACHELINE_BYTES: u64 = 64;

/// Largest store the hardware guarantees will not be torn by a crash.
pub const ATOMIC_WRITE_BYTES: u64 = 8;

/// Align `address` down to its cacheline.
#[inline]
pub const fn cacheline_address(address: u64) -> u64 {
    address / CACHELINE_BYTES * CACHELINE_BYTES
}

/// Half-open memory interval `[address, address + size)`.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, serde::Serialize, serde::Deserialize,
)]
pub struct AddrRange {
    pub address: u64,
    pub size: u64,
}

impl AddrRange {
    #[inline]
    pub const fn new(address: u64, size: u64) -> Self {
        Self { address, size }
    }

    /// One past the last byte.
    #[inline]
    pub const fn end(&self) -> u64 {
        self.address.saturating_add(self.size)
    }

    #[inline]
    pub const fn is_empty(&self) -> bool {
        self.size == 0
    }

    /// Strict overlap: ranges that only touch do not overlap.
    #[inline]
    pub const fn overlaps(&self, other: &Self) -> bool {
        self.address < other.end() && other.address < self.end()
    }

    /// Whether `other` lies entirely inside `self`.
    #[inline]
    pub const fn covers(&self, other: &Self) -> bool {
        self.address <= other.address && other.end() <= self.end()
    }

    /// Order ranges by position, treating any overlap as equal.
    ///
    /// This is the comparison the PM-object list is searched with: a range
    /// is "equal" to every object it touches.
    pub fn range_cmp(&self, other: &Self) -> Ordering {
        if self.overlaps(other) {
            Ordering::Equal
        } else if self.end() <= other.address {
            Ordering::Less
        } else {
            Ordering::Greater
        }
    }

    /// Smallest range containing both.
    pub fn union(&self, other: &Self) -> Self {
        let address = self.address.min(other.address);
        let end = self.end().max(other.end());
        Self::new(address, end - address)
    }

    /// The aligned cacheline the range starts in.
    #[inline]
    pub const fn cacheline(&self) -> u64 {
        cacheline_address(self.address)
    }

    /// Whether the range fits inside the cacheline it starts in.
    #[inline]
    pub const fn within_cacheline(&self) -> bool {
        self.end() <= self.cacheline() + CACHELINE_BYTES
    }
}

impl fmt::Display for AddrRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:#x}+{}", self.address, self.size)
    }
}
