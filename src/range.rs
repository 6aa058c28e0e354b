use serde::{Deserialize, Serialize};
use std::fmt;

/// Half-open interval `[start, end)` of file offsets
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        debug_assert!(start < end, "empty or inverted range {}..{}", start, end);
        Self { start, end }
    }

    /// Number of bytes in the range
    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Whether `other` lies entirely inside this range
    pub fn contains(&self, other: &ByteRange) -> bool {
        self.start <= other.start && other.end <= self.end
    }

    pub fn overlaps(&self, other: &ByteRange) -> bool {
        self.start < other.end && other.start < self.end
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// Sorted set of downloaded byte ranges
///
/// Stored intervals never overlap and never touch: `insert` coalesces
/// overlapping and adjacent ranges, `remove` splits them. Queries are
/// binary searches over the sorted vector.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RangeSet {
    ranges: Vec<ByteRange>,
}

impl RangeSet {
    pub fn new() -> Self {
        Self::default()
    }

    /// True iff a single stored interval contains `range` entirely
    pub fn is_fully_covered(&self, range: ByteRange) -> bool {
        match self.containing(range.start) {
            Some(stored) => stored.end >= range.end,
            None => false,
        }
    }

    /// Earliest offset `>= from` that no stored interval covers
    ///
    /// A stored interval's `end` is not covered, so it is itself a gap start.
    pub fn next_gap_start(&self, from: u64) -> u64 {
        let mut position = from;
        while let Some(stored) = self.containing(position) {
            position = stored.end;
        }
        position
    }

    /// Smallest stored `start` that is `>= from`
    pub fn next_covered_range_start(&self, from: u64) -> Option<u64> {
        let index = self.ranges.partition_point(|r| r.start < from);
        self.ranges.get(index).map(|r| r.start)
    }

    /// Add a range, merging it with every overlapping or adjacent interval
    pub fn insert(&mut self, range: ByteRange) {
        if range.is_empty() {
            return;
        }

        // First interval that could touch `range` (its end reaches range.start)
        let first = self.ranges.partition_point(|r| r.end < range.start);
        // One past the last interval that could touch `range`
        let last = self.ranges.partition_point(|r| r.start <= range.end);

        let mut merged = range;
        if first < last {
            merged.start = merged.start.min(self.ranges[first].start);
            merged.end = merged.end.max(self.ranges[last - 1].end);
        }

        self.ranges.splice(first..last, std::iter::once(merged));
    }

    /// Remove a range, trimming or splitting intervals that overlap it
    pub fn remove(&mut self, range: ByteRange) {
        if range.is_empty() {
            return;
        }

        let first = self.ranges.partition_point(|r| r.end <= range.start);
        let last = self.ranges.partition_point(|r| r.start < range.end);
        if first >= last {
            return;
        }

        let mut remainder = Vec::with_capacity(2);
        let head = self.ranges[first];
        if head.start < range.start {
            remainder.push(ByteRange::new(head.start, range.start));
        }
        let tail = self.ranges[last - 1];
        if tail.end > range.end {
            remainder.push(ByteRange::new(range.end, tail.end));
        }

        self.ranges.splice(first..last, remainder);
    }

    pub fn iter(&self) -> impl Iterator<Item = &ByteRange> {
        self.ranges.iter()
    }

    pub fn len(&self) -> usize {
        self.ranges.len()
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// Total number of bytes covered by the set
    pub fn covered_bytes(&self) -> u64 {
        self.ranges.iter().map(ByteRange::len).sum()
    }

    pub fn to_vec(&self) -> Vec<ByteRange> {
        self.ranges.clone()
    }

    /// Stored interval that covers `offset`, if any
    fn containing(&self, offset: u64) -> Option<&ByteRange> {
        let index = self.ranges.partition_point(|r| r.start <= offset);
        if index == 0 {
            return None;
        }
        let candidate = &self.ranges[index - 1];
        (offset < candidate.end).then_some(candidate)
    }
}

impl FromIterator<ByteRange> for RangeSet {
    fn from_iter<I: IntoIterator<Item = ByteRange>>(iter: I) -> Self {
        let mut set = RangeSet::new();
        for range in iter {
            set.insert(range);
        }
        set
    }
}
