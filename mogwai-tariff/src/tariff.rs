//! Tariffs: named, immutable, ordered collections of periods
//!
//! Lookup follows a later-wins rule over the stored order, so a narrow
//! recurring period laid over a broad one acts as an override. The
//! transition algorithm reports the next instant at which the applicable
//! period (or its occurrence index) changes; it drives the scheduler's
//! alarms.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{TariffError, TariffResult};
use crate::period::Period;

/// Validate a tariff name: non-empty, no embedded NUL.
pub fn validate_name(name: &str) -> TariffResult<()> {
    if name.is_empty() {
        return Err(TariffError::InvalidTariff(
            "tariff name is empty".to_string(),
        ));
    }
    if name.contains('\0') {
        return Err(TariffError::InvalidTariff(
            "tariff name contains NUL".to_string(),
        ));
    }
    Ok(())
}

/// A change in the applicable period at a given instant.
///
/// Either side may be `None`: `from` is `None` before the first occurrence
/// (or when the transition was requested with no reference instant), `to`
/// is `None` after the last. `from == to` is a real transition too: the
/// occurrence index has incremented and any per-occurrence budget resets.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Transition {
    /// Instant at which the applicable period changes
    pub at: DateTime<Utc>,
    /// Applicable period immediately before `at`
    pub from: Option<Period>,
    /// Applicable period at `at`
    pub to: Option<Period>,
}

/// Named, immutable policy of time-varying capacity
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Tariff {
    name: String,
    periods: Vec<Period>,
}

impl Tariff {
    /// Create a tariff from a name and a non-empty period list.
    ///
    /// Periods are stored sorted by start (ties by end); the sort is stable
    /// so periods declared later stay later among equals and keep their
    /// override precedence.
    pub fn new(name: impl Into<String>, periods: Vec<Period>) -> TariffResult<Self> {
        let name = name.into();
        validate_name(&name)?;
        if periods.is_empty() {
            return Err(TariffError::InvalidTariff(format!(
                "tariff '{name}' has no periods"
            )));
        }
        let mut periods = periods;
        periods.sort_by_key(|p| (p.start(), p.end()));
        Ok(Self { name, periods })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Periods in stored (sorted) order
    pub fn periods(&self) -> &[Period] {
        &self.periods
    }

    /// The period applicable at `when`: the last period in stored order
    /// whose occurrences contain `when`, or `None` outside all occurrences.
    pub fn lookup_period(&self, when: DateTime<Utc>) -> Option<&Period> {
        self.periods.iter().rev().find(|p| p.contains(when))
    }

    /// The earliest transition strictly after `after`.
    ///
    /// `after = None` requests the very first transition, whose `from` is
    /// always `None`. Returns `None` when no period has a boundary left.
    pub fn next_transition(&self, after: Option<DateTime<Utc>>) -> Option<Transition> {
        let at = match after {
            // Before all occurrences the first boundary is the earliest
            // period start; stored order puts it first.
            None => self.periods.first().map(Period::start)?,
            Some(after) => {
                let probe = after.checked_add_signed(Duration::nanoseconds(1))?;
                self.periods
                    .iter()
                    .filter_map(|p| p.next_boundary_at_or_after(probe))
                    .min()?
            }
        };
        let from = after.and_then(|a| self.lookup_period(a).cloned());
        let to = self.lookup_period(at).cloned();
        Some(Transition { at, from, to })
    }
}

/// Incremental tariff construction
///
/// ```
/// use mogwai_tariff::{Period, RepeatType, TariffBuilder, CAPACITY_UNLIMITED};
///
/// let period = Period::new(
///     "2018-01-22T00:00:00Z".parse().unwrap(),
///     "2018-02-22T00:00:00Z".parse().unwrap(),
///     RepeatType::None,
///     0,
///     CAPACITY_UNLIMITED,
/// )
/// .unwrap();
/// let tariff = TariffBuilder::new().name("standard").period(period).build().unwrap();
/// assert_eq!(tariff.name(), "standard");
/// ```
#[derive(Debug, Default)]
pub struct TariffBuilder {
    name: Option<String>,
    periods: Vec<Period>,
}

impl TariffBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn period(mut self, period: Period) -> Self {
        self.periods.push(period);
        self
    }

    /// Build the tariff, validating name and period list.
    pub fn build(self) -> TariffResult<Tariff> {
        let name = self
            .name
            .ok_or_else(|| TariffError::InvalidTariff("tariff name not set".to_string()))?;
        Tariff::new(name, self.periods)
    }
}
