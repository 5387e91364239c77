//! Tariff periods
//!
//! A period is an immutable time window `[start, end)` with an optional
//! recurrence rule and a per-occurrence capacity limit. All instants are
//! UTC; occurrence arithmetic for months and years is calendar-correct and
//! clamps to the end of shorter months.

use chrono::{DateTime, Datelike, Duration, Months, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{TariffError, TariffResult};

/// Capacity sentinel: no limit on data transferred during an occurrence.
pub const CAPACITY_UNLIMITED: u64 = u64::MAX;

/// Capacity sentinel: no downloads permitted during an occurrence.
pub const CAPACITY_FORBIDDEN: u64 = 0;

/// Unit of recurrence for a period.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RepeatType {
    /// Single occurrence, no recurrence
    None,
    Hour,
    Day,
    Week,
    /// Calendar months; day-of-month clamps to month end
    Month,
    /// Calendar years; Feb 29 clamps on non-leap years
    Year,
}

impl RepeatType {
    /// Wire encoding used by the tariff codec
    pub fn as_u16(self) -> u16 {
        match self {
            RepeatType::None => 0,
            RepeatType::Hour => 1,
            RepeatType::Day => 2,
            RepeatType::Week => 3,
            RepeatType::Month => 4,
            RepeatType::Year => 5,
        }
    }

    /// Decode the wire encoding; `None` for unknown values
    pub fn from_u16(value: u16) -> Option<Self> {
        match value {
            0 => Some(RepeatType::None),
            1 => Some(RepeatType::Hour),
            2 => Some(RepeatType::Day),
            3 => Some(RepeatType::Week),
            4 => Some(RepeatType::Month),
            5 => Some(RepeatType::Year),
            _ => None,
        }
    }
}

/// One constant-policy time slice of a tariff, possibly recurring
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Period {
    start: DateTime<Utc>,
    end: DateTime<Utc>,
    repeat_type: RepeatType,
    repeat_period: u32,
    capacity_limit: u64,
}

impl Period {
    /// Create a period, validating its invariants.
    ///
    /// Fails with [`TariffError::InvalidPeriod`] when `end <= start` or when
    /// the recurrence rule is inconsistent: `repeat_period` must be zero
    /// exactly when `repeat_type` is [`RepeatType::None`].
    pub fn new(
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        repeat_type: RepeatType,
        repeat_period: u32,
        capacity_limit: u64,
    ) -> TariffResult<Self> {
        if end <= start {
            return Err(TariffError::InvalidPeriod(format!(
                "period end ({end}) must be after its start ({start})"
            )));
        }
        match (repeat_type, repeat_period) {
            (RepeatType::None, 0) => {}
            (RepeatType::None, n) => {
                return Err(TariffError::InvalidPeriod(format!(
                    "non-recurring period has repeat_period {n}"
                )));
            }
            (_, 0) => {
                return Err(TariffError::InvalidPeriod(
                    "recurring period has repeat_period 0".to_string(),
                ));
            }
            _ => {}
        }
        Ok(Self {
            start,
            end,
            repeat_type,
            repeat_period,
            capacity_limit,
        })
    }

    /// Start of the first occurrence (inclusive)
    pub fn start(&self) -> DateTime<Utc> {
        self.start
    }

    /// End of the first occurrence (exclusive)
    pub fn end(&self) -> DateTime<Utc> {
        self.end
    }

    pub fn repeat_type(&self) -> RepeatType {
        self.repeat_type
    }

    pub fn repeat_period(&self) -> u32 {
        self.repeat_period
    }

    /// Per-occurrence data budget in bytes. [`CAPACITY_UNLIMITED`] means no
    /// limit; [`CAPACITY_FORBIDDEN`] means no download may happen at all.
    pub fn capacity_limit(&self) -> u64 {
        self.capacity_limit
    }

    /// True iff some occurrence of this period contains `when`.
    pub fn contains(&self, when: DateTime<Utc>) -> bool {
        self.occurrence_containing(when).is_some()
    }

    /// The `[start, end)` bounds of the occurrence containing `when`.
    ///
    /// When occurrence windows are longer than the recurrence step and
    /// overlap, the latest containing occurrence is reported, so a
    /// per-occurrence budget resets at each new occurrence start.
    pub fn occurrence_containing(
        &self,
        when: DateTime<Utc>,
    ) -> Option<(DateTime<Utc>, DateTime<Utc>)> {
        let n = self.last_occurrence_starting_at_or_before(when)?;
        let occ_start = self.occurrence_start(n)?;
        let occ_end = self.occurrence_end(n)?;
        (when < occ_end).then_some((occ_start, occ_end))
    }

    /// The earliest occurrence boundary (a start or an end) at or after
    /// `when`, or `None` when no boundary remains.
    pub fn next_boundary_at_or_after(&self, when: DateTime<Utc>) -> Option<DateTime<Utc>> {
        let next_start = self.next_in_sequence(self.start, when);
        let next_end = self.next_in_sequence(self.end, when);
        match (next_start, next_end) {
            (Some(s), Some(e)) => Some(s.min(e)),
            (s, None) => s,
            (None, e) => e,
        }
    }

    /// `base` shifted by `n` recurrence steps; `None` when the period does
    /// not recur that far or the arithmetic overflows.
    fn offset_by(&self, base: DateTime<Utc>, n: u32) -> Option<DateTime<Utc>> {
        if n == 0 {
            return Some(base);
        }
        match self.repeat_type {
            RepeatType::None => None,
            RepeatType::Hour | RepeatType::Day | RepeatType::Week => {
                let steps = i64::from(n).checked_mul(i64::from(self.repeat_period))?;
                let delta = match self.repeat_type {
                    RepeatType::Hour => Duration::try_hours(steps)?,
                    RepeatType::Day => Duration::try_days(steps)?,
                    _ => Duration::try_weeks(steps)?,
                };
                base.checked_add_signed(delta)
            }
            RepeatType::Month | RepeatType::Year => {
                let months = n.checked_mul(self.step_months()?)?;
                base.checked_add_months(Months::new(months))
            }
        }
    }

    fn occurrence_start(&self, n: u32) -> Option<DateTime<Utc>> {
        self.offset_by(self.start, n)
    }

    fn occurrence_end(&self, n: u32) -> Option<DateTime<Utc>> {
        self.offset_by(self.end, n)
    }

    /// Recurrence step in calendar months, for month/year repeats only.
    fn step_months(&self) -> Option<u32> {
        match self.repeat_type {
            RepeatType::Month => Some(self.repeat_period),
            RepeatType::Year => self.repeat_period.checked_mul(12),
            _ => None,
        }
    }

    /// Largest `n` with `occurrence_start(n) <= when`, or `None` when
    /// `when` precedes the first occurrence.
    fn last_occurrence_starting_at_or_before(&self, when: DateTime<Utc>) -> Option<u32> {
        if when < self.start {
            return None;
        }
        if self.repeat_type == RepeatType::None {
            return Some(0);
        }
        let mut n = self.estimate_steps(self.start, when)?;
        while n > 0 && self.occurrence_start(n).is_none_or(|s| s > when) {
            n -= 1;
        }
        while let Some(next) = n.checked_add(1).and_then(|m| self.occurrence_start(m)) {
            if next <= when {
                n += 1;
            } else {
                break;
            }
        }
        self.occurrence_start(n).filter(|s| *s <= when).map(|_| n)
    }

    /// Least `base + n·step` at or after `when` (`n >= 0`), or `None`.
    fn next_in_sequence(&self, base: DateTime<Utc>, when: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if when <= base {
            return Some(base);
        }
        if self.repeat_type == RepeatType::None {
            return None;
        }
        let mut n = self.estimate_steps(base, when)?;
        while n > 0 && self.offset_by(base, n - 1).is_some_and(|t| t >= when) {
            n -= 1;
        }
        while self.offset_by(base, n).is_some_and(|t| t < when) {
            n = n.checked_add(1)?;
        }
        self.offset_by(base, n)
    }

    /// Approximate step count from `base` to `when`; exact for fixed-length
    /// steps, within one step for calendar months/years (callers correct by
    /// walking).
    fn estimate_steps(&self, base: DateTime<Utc>, when: DateTime<Utc>) -> Option<u32> {
        debug_assert!(when >= base);
        match self.repeat_type {
            RepeatType::None => None,
            RepeatType::Hour | RepeatType::Day | RepeatType::Week => {
                let steps = i64::from(self.repeat_period);
                // Milliseconds cannot overflow i64 within chrono's range;
                // the sub-millisecond truncation error is corrected by the
                // callers' walk.
                let step_ms = match self.repeat_type {
                    RepeatType::Hour => Duration::try_hours(steps)?,
                    RepeatType::Day => Duration::try_days(steps)?,
                    _ => Duration::try_weeks(steps)?,
                }
                .num_milliseconds();
                let elapsed_ms = (when - base).num_milliseconds();
                Some((elapsed_ms / step_ms).clamp(0, i64::from(u32::MAX)) as u32)
            }
            RepeatType::Month | RepeatType::Year => {
                let step_m = i64::from(self.step_months()?);
                let elapsed_m = (i64::from(when.year()) - i64::from(base.year())) * 12
                    + i64::from(when.month())
                    - i64::from(base.month());
                Some((elapsed_m / step_m).clamp(0, i64::from(u32::MAX)) as u32)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn dt(s: &str) -> DateTime<Utc> {
        s.parse().unwrap()
    }

    fn daily(start: &str, end: &str) -> Period {
        Period::new(dt(start), dt(end), RepeatType::Day, 1, CAPACITY_UNLIMITED).unwrap()
    }

    #[test]
    fn rejects_empty_window() {
        let at = dt("2018-01-22T00:00:00Z");
        assert!(matches!(
            Period::new(at, at, RepeatType::None, 0, CAPACITY_UNLIMITED),
            Err(TariffError::InvalidPeriod(_))
        ));
    }

    #[test]
    fn rejects_inverted_window() {
        let err = Period::new(
            dt("2018-02-22T00:00:00Z"),
            dt("2018-01-22T00:00:00Z"),
            RepeatType::None,
            0,
            CAPACITY_UNLIMITED,
        );
        assert!(matches!(err, Err(TariffError::InvalidPeriod(_))));
    }

    #[test]
    fn rejects_inconsistent_recurrence() {
        let start = dt("2018-01-22T00:00:00Z");
        let end = dt("2018-02-22T00:00:00Z");
        assert!(Period::new(start, end, RepeatType::None, 1, 0).is_err());
        assert!(Period::new(start, end, RepeatType::Day, 0, 0).is_err());
        assert!(Period::new(start, end, RepeatType::Day, 1, 0).is_ok());
    }

    #[test]
    fn non_recurring_membership() {
        let p = Period::new(
            dt("2018-01-22T00:00:00Z"),
            dt("2018-02-22T00:00:00Z"),
            RepeatType::None,
            0,
            CAPACITY_UNLIMITED,
        )
        .unwrap();
        assert!(!p.contains(dt("2018-01-21T23:59:59Z")));
        assert!(p.contains(dt("2018-01-22T00:00:00Z")));
        assert!(p.contains(dt("2018-02-21T23:59:59Z")));
        assert!(!p.contains(dt("2018-02-22T00:00:00Z")));
    }

    #[test]
    fn daily_recurrence_membership() {
        // 02:00-06:00 every day
        let p = daily("2018-01-01T02:00:00Z", "2018-01-01T06:00:00Z");
        assert!(p.contains(dt("2018-01-10T04:00:00Z")));
        assert!(!p.contains(dt("2018-01-10T01:59:59Z")));
        assert!(!p.contains(dt("2018-01-10T06:00:00Z")));
        assert!(!p.contains(dt("2017-12-31T04:00:00Z")));
    }

    #[test]
    fn occurrence_bounds_track_recurrence_index() {
        let p = daily("2018-01-01T02:00:00Z", "2018-01-01T06:00:00Z");
        let (s, e) = p.occurrence_containing(dt("2018-01-10T04:00:00Z")).unwrap();
        assert_eq!(s, dt("2018-01-10T02:00:00Z"));
        assert_eq!(e, dt("2018-01-10T06:00:00Z"));
    }

    #[test]
    fn overlapping_occurrences_report_latest() {
        // 48-hour window recurring daily: every instant past the first day
        // is covered by two occurrences.
        let p = Period::new(
            dt("2018-01-01T00:00:00Z"),
            dt("2018-01-03T00:00:00Z"),
            RepeatType::Day,
            1,
            CAPACITY_UNLIMITED,
        )
        .unwrap();
        let (s, _) = p.occurrence_containing(dt("2018-01-02T12:00:00Z")).unwrap();
        assert_eq!(s, dt("2018-01-02T00:00:00Z"));
    }

    #[test]
    fn month_addition_clamps_to_month_end() {
        // Jan 31 + 1 month lands on Feb 28 in a non-leap year.
        let p = Period::new(
            dt("2018-01-31T00:00:00Z"),
            dt("2018-01-31T12:00:00Z"),
            RepeatType::Month,
            1,
            CAPACITY_UNLIMITED,
        )
        .unwrap();
        assert!(p.contains(dt("2018-02-28T06:00:00Z")));
        let (s, e) = p.occurrence_containing(dt("2018-02-28T06:00:00Z")).unwrap();
        assert_eq!(s, dt("2018-02-28T00:00:00Z"));
        assert_eq!(e, dt("2018-02-28T12:00:00Z"));
        // March recovers the original day-of-month.
        assert!(p.contains(dt("2018-03-31T06:00:00Z")));
    }

    #[test]
    fn yearly_recurrence_preserves_date() {
        let p = Period::new(
            dt("2018-06-01T00:00:00Z"),
            dt("2018-07-01T00:00:00Z"),
            RepeatType::Year,
            1,
            CAPACITY_UNLIMITED,
        )
        .unwrap();
        assert!(p.contains(dt("2021-06-15T00:00:00Z")));
        assert!(!p.contains(dt("2021-05-31T23:59:59Z")));
    }

    #[test]
    fn next_boundary_before_first_occurrence_is_start() {
        let p = daily("2018-01-08T00:00:00Z", "2018-01-08T04:00:00Z");
        assert_eq!(
            p.next_boundary_at_or_after(dt("2018-01-01T00:00:00Z")),
            Some(dt("2018-01-08T00:00:00Z"))
        );
    }

    #[test]
    fn next_boundary_inside_occurrence_is_its_end() {
        let p = daily("2018-01-08T00:00:00Z", "2018-01-08T04:00:00Z");
        assert_eq!(
            p.next_boundary_at_or_after(dt("2018-01-08T01:00:00Z")),
            Some(dt("2018-01-08T04:00:00Z"))
        );
    }

    #[test]
    fn next_boundary_between_occurrences_is_next_start() {
        let p = daily("2018-01-08T00:00:00Z", "2018-01-08T04:00:00Z");
        assert_eq!(
            p.next_boundary_at_or_after(dt("2018-01-08T05:00:00Z")),
            Some(dt("2018-01-09T00:00:00Z"))
        );
    }

    #[test]
    fn next_boundary_exhausted_for_non_recurring() {
        let p = Period::new(
            dt("2018-01-22T00:00:00Z"),
            dt("2018-02-22T00:00:00Z"),
            RepeatType::None,
            0,
            CAPACITY_UNLIMITED,
        )
        .unwrap();
        assert_eq!(p.next_boundary_at_or_after(dt("2018-02-22T00:00:01Z")), None);
    }

    #[test]
    fn boundary_at_query_instant_is_returned() {
        let p = daily("2018-01-08T00:00:00Z", "2018-01-08T04:00:00Z");
        assert_eq!(
            p.next_boundary_at_or_after(dt("2018-01-09T00:00:00Z")),
            Some(dt("2018-01-09T00:00:00Z"))
        );
    }
}
