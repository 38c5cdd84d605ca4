//! Half-open time intervals `[start, end)` where `end` may be open.

use serde::Serialize;
use time::OffsetDateTime;

use crate::BitemporalError;

#[derive(Debug, Clone, Copy, Serialize, Eq, PartialEq, Hash)]
pub struct Interval {
    #[serde(with = "time::serde::rfc3339")]
    start: OffsetDateTime,
    #[serde(with = "time::serde::rfc3339::option")]
    end: Option<OffsetDateTime>,
}

impl Interval {
    /// Build `[start, end)`; `None` leaves the upper bound open.
    ///
    /// # Errors
    /// Returns [`BitemporalError::InvalidInterval`] when a bounded `end` does
    /// not come after `start`.
    pub fn new(start: OffsetDateTime, end: Option<OffsetDateTime>) -> Result<Self, BitemporalError> {
        if let Some(end) = end {
            if end <= start {
                return Err(BitemporalError::InvalidInterval { start, end });
            }
        }
        Ok(Self { start, end })
    }

    #[must_use]
    pub fn open(start: OffsetDateTime) -> Self {
        Self { start, end: None }
    }

    // Stored rows are checked on the way in; reads do not re-validate them.
    pub(crate) fn from_parts(start: OffsetDateTime, end: Option<OffsetDateTime>) -> Self {
        Self { start, end }
    }

    #[must_use]
    pub fn start(&self) -> OffsetDateTime {
        self.start
    }

    #[must_use]
    pub fn end(&self) -> Option<OffsetDateTime> {
        self.end
    }

    #[must_use]
    pub fn is_open(&self) -> bool {
        self.end.is_none()
    }

    #[must_use]
    pub fn contains(&self, instant: OffsetDateTime) -> bool {
        instant >= self.start && self.end.map_or(true, |end| instant < end)
    }

    #[must_use]
    pub fn overlaps(&self, other: &Self) -> bool {
        let self_reaches_other = self.end.map_or(true, |end| other.start < end);
        let other_reaches_self = other.end.map_or(true, |end| self.start < end);
        self_reaches_other && other_reaches_self
    }
}

/// `instant >= start` and (`end` is open or `instant < end`).
#[must_use]
pub fn contains(interval: &Interval, instant: OffsetDateTime) -> bool {
    interval.contains(instant)
}

/// Half-open overlap with open ends treated as `+infinity`.
#[must_use]
pub fn overlaps(a: &Interval, b: &Interval) -> bool {
    a.overlaps(b)
}

#[cfg(test)]
mod tests {
    use proptest::prelude::*;
    use time::macros::datetime;
    use time::Duration;

    use super::*;

    fn at(offset_secs: i64) -> OffsetDateTime {
        datetime!(2024-01-01 00:00:00 UTC) + Duration::seconds(offset_secs)
    }

    fn interval(start: i64, end: Option<i64>) -> Interval {
        match Interval::new(at(start), end.map(at)) {
            Ok(interval) => interval,
            Err(err) => panic!("invalid fixture interval: {err}"),
        }
    }

    #[test]
    fn contains_is_inclusive_at_start_and_exclusive_at_end() {
        let bounded = interval(0, Some(10));
        assert!(contains(&bounded, at(0)));
        assert!(contains(&bounded, at(9)));
        assert!(!contains(&bounded, at(10)));
        assert!(!contains(&bounded, at(-1)));
    }

    #[test]
    fn open_interval_contains_everything_after_start() {
        let open = Interval::open(at(5));
        assert!(open.is_open());
        assert!(open.contains(at(5)));
        assert!(open.contains(at(1_000_000_000)));
        assert!(!open.contains(at(4)));
    }

    #[test]
    fn adjacent_intervals_do_not_overlap() {
        assert!(!overlaps(&interval(0, Some(10)), &interval(10, Some(20))));
        assert!(!overlaps(&interval(0, Some(10)), &interval(10, None)));
        assert!(overlaps(&interval(0, Some(11)), &interval(10, None)));
        assert!(overlaps(&interval(0, None), &interval(50, None)));
    }

    #[test]
    fn new_rejects_empty_and_inverted_intervals() {
        assert!(matches!(
            Interval::new(at(10), Some(at(10))),
            Err(BitemporalError::InvalidInterval { .. })
        ));
        assert!(matches!(
            Interval::new(at(10), Some(at(3))),
            Err(BitemporalError::InvalidInterval { .. })
        ));
    }

    fn arb_interval() -> impl Strategy<Value = Interval> {
        (-1_000_i64..1_000, proptest::option::of(1_i64..500))
            .prop_map(|(start, len)| interval(start, len.map(|len| start + len)))
    }

    proptest! {
        #[test]
        fn property_overlap_is_symmetric(a in arb_interval(), b in arb_interval()) {
            prop_assert_eq!(overlaps(&a, &b), overlaps(&b, &a));
        }

        #[test]
        fn property_shared_instant_implies_overlap(a in arb_interval(), b in arb_interval(), t in -1_500_i64..1_500) {
            if contains(&a, at(t)) && contains(&b, at(t)) {
                prop_assert!(overlaps(&a, &b));
            }
        }

        #[test]
        fn property_interval_contains_its_start(a in arb_interval()) {
            prop_assert!(contains(&a, a.start()));
            if let Some(end) = a.end() {
                prop_assert!(!contains(&a, end));
            }
        }
    }
}
