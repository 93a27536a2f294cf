//! Sets of dataset row indices stored as sorted, coalesced half-open ranges.
//!
//! Claims are usually one contiguous block, but reaping and completion
//! carve holes into the pool, so every set operation here works on
//! arbitrary unions of ranges. A scattered index list is just a set of
//! one-element ranges.

use serde::{Deserialize, Serialize};

/// Half-open range of row indices `[start, end)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct IndexRange {
    pub start: u64,
    pub end: u64,
}

impl IndexRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end: end.max(start) }
    }

    pub fn len(&self) -> u64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start >= self.end
    }
}

/// Normalized set of indices: ranges are sorted, non-empty, and neither
/// overlap nor touch. Deserialization re-normalizes, so a peer cannot hand
/// us a malformed set.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(from = "Vec<IndexRange>", into = "Vec<IndexRange>")]
pub struct RangeSet {
    ranges: Vec<IndexRange>,
}

impl From<Vec<IndexRange>> for RangeSet {
    fn from(ranges: Vec<IndexRange>) -> Self {
        Self::from_ranges(ranges)
    }
}

impl From<RangeSet> for Vec<IndexRange> {
    fn from(set: RangeSet) -> Self {
        set.ranges
    }
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// The whole index space `[0, n)`.
    pub fn full(n: u64) -> Self {
        let mut set = Self::new();
        set.insert(IndexRange::new(0, n));
        set
    }

    /// Sort once, then coalesce in a single pass.
    pub fn from_ranges(ranges: impl IntoIterator<Item = IndexRange>) -> Self {
        let mut ranges: Vec<IndexRange> = ranges.into_iter().filter(|r| !r.is_empty()).collect();
        ranges.sort_unstable_by_key(|r| r.start);

        let mut out: Vec<IndexRange> = Vec::with_capacity(ranges.len());
        for r in ranges {
            match out.last_mut() {
                Some(last) if r.start <= last.end => last.end = last.end.max(r.end),
                _ => out.push(r),
            }
        }
        RangeSet { ranges: out }
    }

    pub fn from_indices(indices: impl IntoIterator<Item = u64>) -> Self {
        Self::from_ranges(indices.into_iter().map(|i| IndexRange::new(i, i.saturating_add(1))))
    }

    pub fn ranges(&self) -> &[IndexRange] {
        &self.ranges
    }

    /// Number of indices in the set.
    pub fn len(&self) -> u64 {
        self.ranges.iter().map(IndexRange::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    pub fn contains(&self, index: u64) -> bool {
        self.ranges
            .binary_search_by(|r| {
                if r.end <= index {
                    std::cmp::Ordering::Less
                } else if r.start > index {
                    std::cmp::Ordering::Greater
                } else {
                    std::cmp::Ordering::Equal
                }
            })
            .is_ok()
    }

    /// Add a range, coalescing with anything it overlaps or touches.
    pub fn insert(&mut self, range: IndexRange) {
        if range.is_empty() {
            return;
        }
        let (mut start, mut end) = (range.start, range.end);
        let mut out = Vec::with_capacity(self.ranges.len() + 1);
        let mut placed = false;
        for r in self.ranges.drain(..) {
            if r.end < start {
                out.push(r);
            } else if r.start > end {
                if !placed {
                    out.push(IndexRange::new(start, end));
                    placed = true;
                }
                out.push(r);
            } else {
                start = start.min(r.start);
                end = end.max(r.end);
            }
        }
        if !placed {
            out.push(IndexRange::new(start, end));
        }
        self.ranges = out;
    }

    pub fn extend(&mut self, other: &RangeSet) {
        match other.ranges.as_slice() {
            [] => {}
            [single] => self.insert(*single),
            many => {
                let mut all = std::mem::take(&mut self.ranges);
                all.extend_from_slice(many);
                *self = Self::from_ranges(all);
            }
        }
    }

    pub fn union(&self, other: &RangeSet) -> RangeSet {
        let mut out = self.clone();
        out.extend(other);
        out
    }

    /// Indices in `self` that are not in `other`.
    pub fn difference(&self, other: &RangeSet) -> RangeSet {
        let mut out = Vec::new();
        let mut j = 0;
        for r in &self.ranges {
            let mut start = r.start;
            while j < other.ranges.len() && other.ranges[j].end <= start {
                j += 1;
            }
            let mut k = j;
            while start < r.end {
                match other.ranges.get(k) {
                    Some(o) if o.start < r.end => {
                        if o.start > start {
                            out.push(IndexRange::new(start, o.start));
                        }
                        start = start.max(o.end);
                        k += 1;
                    }
                    _ => {
                        out.push(IndexRange::new(start, r.end));
                        break;
                    }
                }
            }
        }
        RangeSet { ranges: out }
    }

    pub fn intersection(&self, other: &RangeSet) -> RangeSet {
        let mut out = Vec::new();
        let (mut i, mut j) = (0, 0);
        while i < self.ranges.len() && j < other.ranges.len() {
            let a = self.ranges[i];
            let b = other.ranges[j];
            let start = a.start.max(b.start);
            let end = a.end.min(b.end);
            if start < end {
                out.push(IndexRange::new(start, end));
            }
            if a.end < b.end {
                i += 1;
            } else {
                j += 1;
            }
        }
        RangeSet { ranges: out }
    }

    pub fn is_disjoint(&self, other: &RangeSet) -> bool {
        self.intersection(other).is_empty()
    }

    /// The lowest `n` indices of the set (fewer if the set is smaller).
    pub fn take_first(&self, n: u64) -> RangeSet {
        let mut out = Vec::new();
        let mut remaining = n;
        for r in &self.ranges {
            if remaining == 0 {
                break;
            }
            let take = r.len().min(remaining);
            out.push(IndexRange::new(r.start, r.start + take));
            remaining -= take;
        }
        RangeSet { ranges: out }
    }

    pub fn indices(&self) -> impl Iterator<Item = u64> + '_ {
        self.ranges.iter().flat_map(|r| r.start..r.end)
    }
}

impl std::fmt::Display for RangeSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let parts: Vec<String> = self
            .ranges
            .iter()
            .map(|r| format!("{}..{}", r.start, r.end))
            .collect();
        write!(f, "[{}]", parts.join(", "))
    }
}
