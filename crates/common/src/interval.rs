//! Sets of half-open intervals over a numeric timeline.
//!
//! Timestamps are `f64` seconds and may be `±INFINITY`, so an interval can
//! describe "everything before t", "everything after t", or the whole
//! timeline. `IntervalSet` keeps its members disjoint, sorted, and
//! non-empty, and maintains the total covered size alongside.

use std::fmt;

/// A half-open interval `[start, end)` with `start <= end`.
#[derive(Clone, Copy, PartialEq)]
pub struct Interval {
    start: f64,
    end: f64,
}

impl Interval {
    pub fn new(start: f64, end: f64) -> anyhow::Result<Self> {
        anyhow::ensure!(
            !start.is_nan() && !end.is_nan(),
            "Invalid interval bound: NaN"
        );
        anyhow::ensure!(start <= end, "Invalid interval start={start} end={end}");
        Ok(Self { start, end })
    }

    /// The whole timeline, `(-inf, +inf)`.
    pub fn everything() -> Self {
        Self {
            start: f64::NEG_INFINITY,
            end: f64::INFINITY,
        }
    }

    pub fn start(&self) -> f64 {
        self.start
    }

    pub fn end(&self) -> f64 {
        self.end
    }

    pub fn size(&self) -> f64 {
        self.end - self.start
    }

    pub fn is_empty(&self) -> bool {
        self.start == self.end
    }

    pub fn intersect(&self, other: &Self) -> Option<Self> {
        let start = self.start.max(other.start);
        let end = self.end.min(other.end);
        (end > start).then_some(Self { start, end })
    }

    /// True when the two intervals overlap or touch. Touching counts so
    /// that `[0, 5)` and `[5, 10)` merge into a single interval on union.
    pub fn overlaps(&self, other: &Self) -> bool {
        let (earlier, later) = if self.start <= other.start {
            (self, other)
        } else {
            (other, self)
        };
        earlier.end >= later.start
    }

    pub fn subset_of(&self, other: &Self) -> bool {
        self.start >= other.start && self.end <= other.end
    }

    fn merge(&self, other: &Self) -> Self {
        Self {
            start: self.start.min(other.start),
            end: self.end.max(other.end),
        }
    }
}

impl fmt::Debug for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

/// A normalized set of disjoint, sorted, non-empty intervals.
#[derive(Clone, PartialEq, Default)]
pub struct IntervalSet {
    intervals: Vec<Interval>,
    size: f64,
}

impl IntervalSet {
    pub fn empty() -> Self {
        Self::default()
    }

    pub fn of(interval: Interval) -> Self {
        Self::from_intervals(vec![interval])
    }

    /// Normalize an arbitrary collection: drop empty intervals, sort, and
    /// merge every overlapping or touching pair.
    pub fn from_intervals(mut intervals: Vec<Interval>) -> Self {
        intervals.retain(|i| !i.is_empty());
        intervals.sort_by(|a, b| a.start.total_cmp(&b.start));
        let mut disjoint: Vec<Interval> = Vec::with_capacity(intervals.len());
        for interval in intervals {
            match disjoint.last_mut() {
                Some(last) if last.overlaps(&interval) => *last = last.merge(&interval),
                _ => disjoint.push(interval),
            }
        }
        let size = disjoint.iter().map(|i| i.size()).sum();
        Self {
            intervals: disjoint,
            size,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.intervals.is_empty()
    }

    pub fn len(&self) -> usize {
        self.intervals.len()
    }

    /// Total covered size, the sum of member sizes.
    pub fn size(&self) -> f64 {
        self.size
    }

    pub fn iter(&self) -> impl Iterator<Item = &Interval> {
        self.intervals.iter()
    }

    pub fn union(&self, other: &Self) -> Self {
        let mut intervals = self.intervals.clone();
        intervals.extend_from_slice(&other.intervals);
        Self::from_intervals(intervals)
    }

    pub fn intersect(&self, other: &Self) -> Self {
        let mut intersections = Vec::new();
        for i in &self.intervals {
            for j in &other.intervals {
                if let Some(overlap) = i.intersect(j) {
                    intersections.push(overlap);
                }
            }
        }
        Self::from_intervals(intersections)
    }

    pub fn intersect_interval(&self, interval: &Interval) -> Self {
        let intersections = self
            .intervals
            .iter()
            .filter_map(|i| i.intersect(interval))
            .collect();
        Self::from_intervals(intersections)
    }

    /// The complement over the whole timeline `(-inf, +inf)`: the gaps
    /// between members, plus the unbounded pieces on either side.
    pub fn complement(&self) -> Self {
        let mut complementary = Vec::new();
        let mut cursor = f64::NEG_INFINITY;
        for interval in &self.intervals {
            if cursor < interval.start {
                complementary.push(Interval {
                    start: cursor,
                    end: interval.start,
                });
            }
            cursor = interval.end;
        }
        if cursor < f64::INFINITY {
            complementary.push(Interval {
                start: cursor,
                end: f64::INFINITY,
            });
        }
        Self::from_intervals(complementary)
    }

    pub fn difference(&self, other: &Self) -> Self {
        self.intersect(&other.complement())
    }

    pub fn subset_of(&self, other: &Self) -> bool {
        self.intervals
            .iter()
            .all(|mine| other.intervals.iter().any(|theirs| mine.subset_of(theirs)))
    }
}

impl fmt::Debug for IntervalSet {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.intervals.iter()).finish()
    }
}
