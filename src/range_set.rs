use std::collections::{btree_map, BTreeMap};
use std::ops::Range;

/// A set of `u64` values optimized for contiguous runs
///
/// Stored as disjoint, non-adjacent ranges, keyed by start with exclusive end. Used for the
/// ACK-pending set and per-stream received-byte accounting.
#[derive(Debug, Default, Clone)]
pub struct RangeSet(BTreeMap<u64, u64>);

impl RangeSet {
    pub fn new() -> Self {
        Default::default()
    }

    pub fn contains(&self, x: u64) -> bool {
        self.pred(x).map_or(false, |(_, end)| end > x)
    }

    pub fn insert_one(&mut self, x: u64) -> bool {
        self.insert(x..x + 1)
    }

    /// Add a range, merging with any existing neighbors; returns whether new values were added
    pub fn insert(&mut self, mut x: Range<u64>) -> bool {
        if x.start >= x.end {
            return false;
        }
        if let Some((start, end)) = self.pred(x.start) {
            if end >= x.end {
                // Wholly contained
                return false;
            }
            if end >= x.start {
                // Extend the overlapping or abutting predecessor
                self.0.remove(&start);
                x.start = start;
            }
        }
        // Swallow successors reached by the new range. Ranges are disjoint and non-adjacent, so
        // anything not wholly contained above necessarily covers a gap.
        while let Some((start, end)) = self.succ(x.start) {
            if start > x.end {
                break;
            }
            self.0.remove(&start);
            if end > x.end {
                x.end = end;
            }
        }
        self.0.insert(x.start, x.end);
        true
    }

    /// Remove every value present in `other`
    pub fn subtract(&mut self, other: &RangeSet) {
        for range in other.iter() {
            self.remove(range);
        }
    }

    pub fn remove(&mut self, x: Range<u64>) {
        if x.start >= x.end {
            return;
        }
        if let Some((start, end)) = self.pred(x.start) {
            if end > x.start {
                self.0.remove(&start);
                if start < x.start {
                    self.0.insert(start, x.start);
                }
                if end > x.end {
                    self.0.insert(x.end, end);
                }
            }
        }
        while let Some((start, end)) = self.succ(x.start) {
            if start >= x.end {
                break;
            }
            self.0.remove(&start);
            if end > x.end {
                self.0.insert(x.end, end);
                break;
            }
        }
    }

    pub fn min(&self) -> Option<u64> {
        self.0.keys().next().cloned()
    }

    pub fn max(&self) -> Option<u64> {
        self.0.values().next_back().map(|&x| x - 1)
    }

    /// Number of distinct ranges
    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn pop_min(&mut self) -> Option<Range<u64>> {
        let (&start, &end) = self.0.iter().next()?;
        self.0.remove(&start);
        Some(start..end)
    }

    pub fn iter(&self) -> Iter<'_> {
        Iter(self.0.iter())
    }

    fn pred(&self, x: u64) -> Option<(u64, u64)> {
        self.0
            .range(..=x)
            .next_back()
            .map(|(&start, &end)| (start, end))
    }

    fn succ(&self, x: u64) -> Option<(u64, u64)> {
        self.0
            .range(x + 1..)
            .next()
            .map(|(&start, &end)| (start, end))
    }
}

pub struct Iter<'a>(btree_map::Iter<'a, u64, u64>);

impl<'a> Iterator for Iter<'a> {
    type Item = Range<u64>;
    fn next(&mut self) -> Option<Range<u64>> {
        self.0.next().map(|(&start, &end)| start..end)
    }
}

impl<'a> DoubleEndedIterator for Iter<'a> {
    fn next_back(&mut self) -> Option<Range<u64>> {
        self.0.next_back().map(|(&start, &end)| start..end)
    }
}

impl<'a> IntoIterator for &'a RangeSet {
    type Item = Range<u64>;
    type IntoIter = Iter<'a>;
    fn into_iter(self) -> Iter<'a> {
        self.iter()
    }
}
