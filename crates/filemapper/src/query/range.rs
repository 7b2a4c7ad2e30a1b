//! Closed value ranges used by every numeric filter dimension.

/// An inclusive `[start, end]` range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ValueRange<T> {
    pub start: T,
    pub end: T,
}

impl<T: PartialOrd + Copy> ValueRange<T> {
    /// Builds a range, swapping the bounds if they arrive reversed.
    pub fn new(start: T, end: T) -> Self {
        if end < start {
            Self { start: end, end: start }
        } else {
            Self { start, end }
        }
    }

    pub fn single(value: T) -> Self {
        Self {
            start: value,
            end: value,
        }
    }

    #[inline]
    pub fn contains(&self, value: T) -> bool {
        self.start <= value && value <= self.end
    }

    /// True when `[start, end]` intersects this range.
    #[inline]
    pub fn overlaps(&self, start: T, end: T) -> bool {
        self.start <= end && start <= self.end
    }
}

impl ValueRange<u64> {
    /// The whole `u64` domain.
    pub fn everything() -> Self {
        Self::new(0, u64::MAX)
    }
}

/// True when `ranges` is empty (dimension omitted) or any range contains `value`.
pub(crate) fn any_contains<T: PartialOrd + Copy>(ranges: &[ValueRange<T>], value: T) -> bool {
    ranges.is_empty() || ranges.iter().any(|range| range.contains(value))
}

/// Like `any_contains`, but a missing value only matches an omitted dimension.
pub(crate) fn any_contains_opt<T: PartialOrd + Copy>(
    ranges: &[ValueRange<T>],
    value: Option<T>,
) -> bool {
    match value {
        Some(value) => any_contains(ranges, value),
        None => ranges.is_empty(),
    }
}

pub(crate) fn any_overlaps<T: PartialOrd + Copy>(
    ranges: &[ValueRange<T>],
    start: T,
    end: T,
) -> bool {
    ranges.is_empty() || ranges.iter().any(|range| range.overlaps(start, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reversed_bounds_are_normalized() {
        let range = ValueRange::new(10u64, 2);
        assert_eq!((range.start, range.end), (2, 10));
        assert!(range.contains(2) && range.contains(10));
    }

    #[test]
    fn overlap_is_inclusive_at_both_ends() {
        let range = ValueRange::new(100u64, 199);
        assert!(range.overlaps(199, 300));
        assert!(range.overlaps(0, 100));
        assert!(!range.overlaps(200, 300));
        assert!(!range.overlaps(0, 99));
    }

    #[test]
    fn omitted_dimension_matches_everything_but_missing_values() {
        let none: [ValueRange<i64>; 0] = [];
        assert!(any_contains(&none, 5));
        assert!(any_contains_opt(&none, None));
        let some = [ValueRange::single(5i64)];
        assert!(!any_contains_opt(&some, None));
        assert!(any_contains_opt(&some, Some(5)));
    }
}
