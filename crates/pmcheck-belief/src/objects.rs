//! PM objects: merged, disjoint address intervals.

use std::cmp::Ordering;

use pmcheck_types::AddrRange;
use serde::{Deserialize, Serialize};

/// A merged memory interval with its id in the sorted list.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PmObject {
    pub id: u32,
    pub range: AddrRange,
}

/// Sorted, disjoint list of PM objects.
///
/// Inserting a range that overlaps existing objects coalesces all of them
/// into one. Ids are positions and are only meaningful after
/// [`assign_ids`](Self::assign_ids).
#[derive(Debug, Clone, Default)]
pub struct PmObjectList {
    objects: Vec<PmObject>,
}

impl PmObjectList {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.objects.len()
    }

    pub fn is_empty(&self) -> bool {
        self.objects.is_empty()
    }

    pub fn iter(&self) -> impl Iterator<Item = &PmObject> {
        self.objects.iter()
    }

    /// Insert `range`, merging it with every object it overlaps.
    pub fn insert(&mut self, range: AddrRange) {
        if range.is_empty() {
            return;
        }
        // First object not entirely below `range`.
        let at = self
            .objects
            .partition_point(|o| o.range.range_cmp(&range) == Ordering::Less);
        let mut merged = range;
        let mut last = at;
        while let Some(next) = self.objects.get(last) {
            if !next.range.overlaps(&merged) {
                break;
            }
            merged = merged.union(&next.range);
            last += 1;
        }
        self.objects.splice(
            at..last,
            [PmObject {
                id: 0,
                range: merged,
            }],
        );
    }

    /// Number objects by their sorted position.
    pub fn assign_ids(&mut self) {
        for (idx, object) in self.objects.iter_mut().enumerate() {
            object.id = u32::try_from(idx).unwrap_or(u32::MAX);
        }
    }

    /// The object that fully covers `range`, if any.
    pub fn find(&self, range: AddrRange) -> Option<&PmObject> {
        let at = self
            .objects
            .partition_point(|o| o.range.address <= range.address);
        let candidate = self.objects.get(at.checked_sub(1)?)?;
        candidate.range.covers(&range).then_some(candidate)
    }

    /// Whether the sorted-disjoint invariant holds.
    pub fn is_well_formed(&self) -> bool {
        self.objects
            .windows(2)
            .all(|w| w[0].range.end() <= w[1].range.address)
    }
}
