//! Inclusive timestamp ranges keyed by overlap

use std::cmp::Ordering;

use crate::domain::Timestamp;

/// Inclusive range `[begin, end]` of trace timestamps
///
/// Ranges compare by position: `a` is before `b` when `a.end < b.begin`, and
/// overlapping ranges compare [`Ordering::Equal`]. This is only a total order
/// over sets of pairwise disjoint ranges, which is what each thread's pending
/// stack list holds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct TimeRange {
    pub begin: Timestamp,
    pub end: Timestamp,
}

impl TimeRange {
    /// Range from two ends in either order
    #[must_use]
    pub fn new(a: Timestamp, b: Timestamp) -> Self {
        Self { begin: a.min(b), end: a.max(b) }
    }

    #[must_use]
    pub fn at(t: Timestamp) -> Self {
        Self { begin: t, end: t }
    }

    #[must_use]
    pub fn overlaps(&self, other: &TimeRange) -> bool {
        self.begin <= other.end && other.begin <= self.end
    }

    #[must_use]
    pub fn is_before(&self, other: &TimeRange) -> bool {
        self.end < other.begin
    }

    #[must_use]
    pub fn position(&self, other: &TimeRange) -> Ordering {
        if self.is_before(other) {
            Ordering::Less
        } else if other.is_before(self) {
            Ordering::Greater
        } else {
            Ordering::Equal
        }
    }

    /// Smallest range covering both
    #[must_use]
    pub fn union(&self, other: &TimeRange) -> TimeRange {
        TimeRange { begin: self.begin.min(other.begin), end: self.end.max(other.end) }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn r(a: u64, b: u64) -> TimeRange {
        TimeRange::new(Timestamp(a), Timestamp(b))
    }

    #[test]
    fn test_ordering() {
        assert_eq!(r(10, 20).position(&r(25, 30)), Ordering::Less);
        assert_eq!(r(25, 30).position(&r(10, 20)), Ordering::Greater);
        assert_eq!(r(10, 20).position(&r(15, 25)), Ordering::Equal);
        // inclusive ends touch
        assert_eq!(r(10, 20).position(&r(20, 30)), Ordering::Equal);
        assert_eq!(r(10, 20).position(&r(21, 30)), Ordering::Less);
    }

    #[test]
    fn test_union_and_point() {
        assert_eq!(r(10, 20).union(&r(15, 25)), r(10, 25));
        assert!(TimeRange::at(Timestamp(5)).overlaps(&r(5, 5)));
        assert_eq!(r(9, 3), r(3, 9));
    }
}
