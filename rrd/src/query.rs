//! Range query bounds.
//!
//! Transports hand the store a `(start, end)` pair of microsecond
//! timestamps. [`validate_range`] is the check a transport runs before
//! calling the store; [`TimeRange::resolve`] applies the `(0, 0)` "no bound"
//! convention right before the scan.

use thiserror::Error;

use crate::record::now_micros;

/// A closed timestamp window `[min, max]`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TimeRange {
    /// Lower bound, inclusive.
    pub min: i64,
    /// Upper bound, inclusive.
    pub max: i64,
}

impl TimeRange {
    /// Creates a range.
    pub fn new(min: i64, max: i64) -> Self {
        Self { min, max }
    }

    /// Returns true for the `(0, 0)` "no bound specified" request.
    pub fn is_unbounded(&self) -> bool {
        self.min == 0 && self.max == 0
    }

    /// Applies the `(0, 0)` convention: an unbounded request becomes
    /// `[0, now]`. Any other range is returned as is.
    pub fn resolve(self) -> Self {
        self.resolve_at(now_micros())
    }

    /// Like [`TimeRange::resolve`] with an explicit "now".
    pub fn resolve_at(self, now: i64) -> Self {
        if self.is_unbounded() {
            Self::new(0, now)
        } else {
            self
        }
    }
}

/// A range request rejected at the boundary.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum InvalidRange {
    /// A bound is negative.
    #[error("range bounds must be non-negative: start {start}, end {end}")]
    Negative {
        /// Requested start.
        start: i64,
        /// Requested end.
        end: i64,
    },

    /// `start > end`.
    #[error("invalid time range: start {start} > end {end}")]
    Inverted {
        /// Requested start.
        start: i64,
        /// Requested end.
        end: i64,
    },
}

/// Checks `0 <= start <= end`.
///
/// # Errors
///
/// Returns [`InvalidRange`] describing the violated bound.
pub fn validate_range(start: i64, end: i64) -> Result<TimeRange, InvalidRange> {
    if start < 0 || end < 0 {
        return Err(InvalidRange::Negative { start, end });
    }
    if start > end {
        return Err(InvalidRange::Inverted { start, end });
    }
    Ok(TimeRange::new(start, end))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_unbounded_resolves_to_now() {
        let range = TimeRange::new(0, 0).resolve_at(1_000);
        assert_eq!(range, TimeRange::new(0, 1_000));
    }

    #[test]
    fn test_bounded_range_is_untouched() {
        assert_eq!(TimeRange::new(0, 10).resolve_at(1_000), TimeRange::new(0, 10));
        assert_eq!(TimeRange::new(5, 5).resolve_at(1_000), TimeRange::new(5, 5));
    }

    #[test]
    fn test_resolve_uses_wall_clock() {
        let before = now_micros();
        let range = TimeRange::new(0, 0).resolve();
        assert!(range.max >= before);
    }

    #[test]
    fn test_validate_range() {
        assert_eq!(validate_range(0, 10), Ok(TimeRange::new(0, 10)));
        assert_eq!(validate_range(0, 0), Ok(TimeRange::new(0, 0)));
        assert_eq!(validate_range(5, 1), Err(InvalidRange::Inverted { start: 5, end: 1 }));
        assert_eq!(validate_range(-1, 0), Err(InvalidRange::Negative { start: -1, end: 0 }));
        assert_eq!(validate_range(0, -1), Err(InvalidRange::Negative { start: 0, end: -1 }));
    }
}
