//! The cache simulator proper.
//!
//! One state machine serves every persistence model; [`Granularity`] only
//! decides which stores share a buffering unit and therefore persist
//! together. A flush always covers one cacheline: it marks the buffered
//! stores inside that line `Flushing`, whatever unit they sit in.

use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::str::FromStr;

use pmcheck_error::{PmcheckError, Result};
use pmcheck_types::{
    ATOMIC_WRITE_BYTES, AddrRange, CACHELINE_BYTES, FlushState, OpId, OpKind, Operation,
};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::image::PmImage;

/// Unit that stores are buffered, and persisted, together in.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Granularity {
    /// Whole 64-byte cachelines.
    #[default]
    Cacheline,
    /// Aligned power-of-two buckets.
    Bucket { bytes: u64 },
    /// Every store on its own.
    Store,
}

impl Granularity {
    pub const fn unit_bytes(self) -> u64 {
        match self {
            Self::Cacheline | Self::Store => CACHELINE_BYTES,
            Self::Bucket { bytes } => bytes,
        }
    }

    pub fn validate(self) -> Result<()> {
        if let Self::Bucket { bytes } = self {
            if !bytes.is_power_of_two() || bytes < ATOMIC_WRITE_BYTES {
                return Err(PmcheckError::config(format!(
                    "bucket size {bytes} must be a power of two of at least {ATOMIC_WRITE_BYTES}"
                )));
            }
        }
        Ok(())
    }

    const fn align(self, address: u64) -> u64 {
        let unit = self.unit_bytes();
        address / unit * unit
    }

    /// Unit of a store, or `None` if it straddles one.
    fn unit_key(self, id: OpId, range: AddrRange) -> Option<UnitKey> {
        let base = self.align(range.address);
        if range.end() > base + self.unit_bytes() {
            return None;
        }
        let slot = match self {
            Self::Store => id.get(),
            Self::Cacheline | Self::Bucket { .. } => 0,
        };
        Some(UnitKey { base, slot })
    }
}

impl fmt::Display for Granularity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Cacheline => f.write_str("cacheline"),
            Self::Bucket { bytes } => write!(f, "bucket:{bytes}"),
            Self::Store => f.write_str("store"),
        }
    }
}

impl FromStr for Granularity {
    type Err = PmcheckError;

    fn from_str(s: &str) -> Result<Self> {
        let granularity = match s {
            "cacheline" => Self::Cacheline,
            "store" => Self::Store,
            other => {
                let bytes = other
                    .strip_prefix("bucket:")
                    .and_then(|b| b.parse::<u64>().ok())
                    .ok_or_else(|| PmcheckError::config(format!("unknown granularity '{s}'")))?;
                Self::Bucket { bytes }
            }
        };
        granularity.validate()?;
        Ok(granularity)
    }
}

/// Key of one buffering unit: aligned base plus a per-store slot when
/// every store is its own unit.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct UnitKey {
    pub base: u64,
    pub slot: u64,
}

/// A store waiting in the cache.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BufferedStore {
    pub id: OpId,
    pub range: AddrRange,
    pub bytes: Vec<u8>,
    pub state: FlushState,
}

#[derive(Debug)]
pub struct CacheSim {
    granularity: Granularity,
    units: BTreeMap<UnitKey, Vec<BufferedStore>>,
    /// Unit of every store still buffered.
    buffered: HashMap<OpId, UnitKey>,
    /// Ids accepted and no longer buffered.
    settled: IdSpans,
}

impl Default for CacheSim {
    fn default() -> Self {
        Self::new(Granularity::default())
    }
}

impl CacheSim {
    pub fn new(granularity: Granularity) -> Self {
        Self {
            granularity,
            units: BTreeMap::new(),
            buffered: HashMap::new(),
            settled: IdSpans::default(),
        }
    }

    pub const fn granularity(&self) -> Granularity {
        self.granularity
    }

    /// Feed one operation. Returns `true` for a fence; the caller decides
    /// when to write back.
    pub fn accept(&mut self, op: &Operation) -> Result<bool> {
        match &op.kind {
            OpKind::Store { range, bytes } => {
                self.buffer_store(op.id, *range, bytes)?;
                Ok(false)
            }
            OpKind::Flush { range } => {
                self.mark_flushing(op.id, *range);
                self.settled.insert(op.id.get());
                Ok(false)
            }
            OpKind::Fence => {
                self.settled.insert(op.id.get());
                Ok(true)
            }
            OpKind::TxStart
            | OpKind::TxEnd
            | OpKind::LibCall { .. }
            | OpKind::LibRangeAdd { .. }
            | OpKind::LibRangeAlloc { .. } => {
                self.settled.insert(op.id.get());
                Ok(false)
            }
        }
    }

    fn buffer_store(&mut self, id: OpId, range: AddrRange, bytes: &[u8]) -> Result<()> {
        if !range.within_cacheline() {
            return Err(PmcheckError::CachelineStraddle {
                op: id.get(),
                address: range.address,
                size: range.size,
            });
        }
        let key = self
            .granularity
            .unit_key(id, range)
            .ok_or(PmcheckError::CachelineStraddle {
                op: id.get(),
                address: range.address,
                size: range.size,
            })?;
        self.units.entry(key).or_default().push(BufferedStore {
            id,
            range,
            bytes: bytes.to_vec(),
            state: FlushState::Clear,
        });
        self.buffered.insert(id, key);
        Ok(())
    }

    fn mark_flushing(&mut self, flush: OpId, line: AddrRange) {
        let low = UnitKey {
            base: self.granularity.align(line.address),
            slot: 0,
        };
        let high = UnitKey {
            base: line.end(),
            slot: 0,
        };
        for stores in self.units.range_mut(low..high).map(|(_, stores)| stores) {
            for store in stores.iter_mut().filter(|s| s.range.overlaps(&line)) {
                if store.state == FlushState::Flushing {
                    debug!(flush = %flush, store = %store.id, "duplicated flush");
                }
                store.state.advance_to(FlushState::Flushing);
            }
        }
    }

    /// Write every `Flushing` store to `image` and drop it from the cache.
    ///
    /// Returns the number of stores written.
    pub fn write_back_flushing(&mut self, image: &mut PmImage) -> Result<usize> {
        self.write_back(image, false)
    }

    /// Write every buffered store to `image`, flushed or not, and empty the
    /// cache.
    pub fn write_back_all(&mut self, image: &mut PmImage) -> Result<usize> {
        self.write_back(image, true)
    }

    fn write_back(&mut self, image: &mut PmImage, all: bool) -> Result<usize> {
        let mut written = 0;
        let mut emptied = Vec::new();
        for (key, stores) in &mut self.units {
            for store in stores.iter_mut() {
                let due = match store.state {
                    FlushState::Flushing => true,
                    FlushState::Clear if all => {
                        debug!(store = %store.id, "missing flush");
                        true
                    }
                    FlushState::Clear | FlushState::Fenced => false,
                };
                if due {
                    image.write_store(store.range, &store.bytes)?;
                    store.state.advance_to(FlushState::Fenced);
                    self.settled.insert(store.id.get());
                    self.buffered.remove(&store.id);
                    written += 1;
                }
            }
            stores.retain(|s| s.state != FlushState::Fenced);
            if stores.is_empty() {
                emptied.push(*key);
            }
        }
        for key in emptied {
            self.units.remove(&key);
        }
        Ok(written)
    }

    /// Stores sharing `target`'s unit, in program order, up to and including
    /// `target`. These cannot become durable without it.
    pub fn stores_up_to(&self, target: OpId) -> Result<&[BufferedStore]> {
        let key = self
            .buffered
            .get(&target)
            .ok_or(PmcheckError::UnknownStore { op: target.get() })?;
        let stores = self
            .units
            .get(key)
            .ok_or(PmcheckError::UnknownStore { op: target.get() })?;
        let end = stores
            .iter()
            .position(|s| s.id == target)
            .ok_or(PmcheckError::UnknownStore { op: target.get() })?;
        Ok(&stores[..=end])
    }

    /// State of a store. Buffered stores report their unit entry; written
    /// back stores and other accepted ops read `Fenced`, ids never accepted
    /// `Clear`.
    pub fn flush_state(&self, id: OpId) -> FlushState {
        if let Some(key) = self.buffered.get(&id) {
            return self
                .units
                .get(key)
                .and_then(|stores| stores.iter().find(|s| s.id == id))
                .map_or(FlushState::Clear, |s| s.state);
        }
        if self.settled.contains(id.get()) {
            FlushState::Fenced
        } else {
            FlushState::Clear
        }
    }

    pub fn is_fenced(&self, id: OpId) -> bool {
        self.flush_state(id) == FlushState::Fenced
    }

    /// Whether two stores would be buffered in the same unit.
    pub fn same_unit(&self, a: &Operation, b: &Operation) -> bool {
        match (a.store_range(), b.store_range()) {
            (Some(ra), Some(rb)) => {
                self.granularity.unit_key(a.id, ra) == self.granularity.unit_key(b.id, rb)
            }
            _ => false,
        }
    }

    /// Stores accepted and not yet written back.
    pub fn pending_store_count(&self) -> usize {
        self.buffered.len()
    }

    pub fn unit_count(&self) -> usize {
        self.units.len()
    }

    /// Sum of all unit store lists; always equals `pending_store_count`.
    pub fn buffered_len(&self) -> usize {
        self.units.values().map(Vec::len).sum()
    }
}

/// Disjoint inclusive id spans. Ops are accepted and written back roughly
/// in id order, so the spans coalesce and stay few.
#[derive(Debug, Default)]
struct IdSpans {
    spans: BTreeMap<u64, u64>,
}

impl IdSpans {
    fn insert(&mut self, id: u64) {
        if self.contains(id) {
            return;
        }
        let mut start = id;
        let mut end = id;
        if let Some((&lo, &hi)) = self.spans.range(..id).next_back() {
            if hi.checked_add(1) == Some(id) {
                start = lo;
            }
        }
        if let Some(next) = id.checked_add(1) {
            if let Some(hi) = self.spans.remove(&next) {
                end = hi;
            }
        }
        self.spans.insert(start, end);
    }

    fn contains(&self, id: u64) -> bool {
        self.spans
            .range(..=id)
            .next_back()
            .is_some_and(|(_, &hi)| id <= hi)
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.spans.len()
    }
}
