//! Fee policy: stay duration and slot class to amount due.

use std::fmt;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::slot::SlotClass;

/// Money in minor currency units.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct Amount(u64);

impl Amount {
    pub const ZERO: Amount = Amount(0);

    pub const fn new(minor_units: u64) -> Self {
        Self(minor_units)
    }

    pub const fn get(self) -> u64 {
        self.0
    }

    pub const fn saturating_add(self, other: Amount) -> Self {
        Self(self.0.saturating_add(other.0))
    }

    pub const fn saturating_mul(self, factor: u64) -> Self {
        Self(self.0.saturating_mul(factor))
    }
}

impl fmt::Display for Amount {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::iter::Sum for Amount {
    fn sum<I: Iterator<Item = Amount>>(iter: I) -> Self {
        iter.fold(Amount::ZERO, Amount::saturating_add)
    }
}

/// Maps a stay to the amount due.
///
/// Implementations must be pure: non-decreasing in `closed_at - issued_at` for a
/// fixed class, defined at zero duration, and never failing for long stays.
/// A `closed_at` earlier than `issued_at` counts as zero duration.
pub trait FeePolicy: Send + Sync {
    fn compute_fee(
        &self,
        class: SlotClass,
        issued_at: DateTime<Utc>,
        closed_at: DateTime<Utc>,
    ) -> Amount;
}

impl<F> FeePolicy for F
where
    F: Fn(SlotClass, DateTime<Utc>, DateTime<Utc>) -> Amount + Send + Sync,
{
    fn compute_fee(
        &self,
        class: SlotClass,
        issued_at: DateTime<Utc>,
        closed_at: DateTime<Utc>,
    ) -> Amount {
        self(class, issued_at, closed_at)
    }
}

/// How partial billing units are counted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Rounding {
    /// Only whole elapsed units are billed.
    #[default]
    Down,
    /// Any started unit is billed in full.
    Up,
}

/// Per-class rate per billing unit, with a minimum number of billed units.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RateTable {
    unit_millis: u64,
    minimum_units: u64,
    rounding: Rounding,
    rates: [Amount; SlotClass::COUNT],
}

impl RateTable {
    pub const DEFAULT_UNIT: Duration = Duration::from_secs(3600);

    /// Same rate for every class, hourly units, one-unit minimum, rounding down.
    pub fn uniform(rate: Amount) -> Self {
        Self {
            unit_millis: Self::DEFAULT_UNIT.as_millis() as u64,
            minimum_units: 1,
            rounding: Rounding::Down,
            rates: [rate; SlotClass::COUNT],
        }
    }

    pub fn with_rate(mut self, class: SlotClass, rate: Amount) -> Self {
        self.rates[class.index()] = rate;
        self
    }

    /// Billing unit; sub-millisecond and zero units are clamped to one millisecond.
    pub fn with_unit(mut self, unit: Duration) -> Self {
        self.unit_millis = u64::try_from(unit.as_millis()).unwrap_or(u64::MAX).max(1);
        self
    }

    pub fn with_minimum_units(mut self, units: u64) -> Self {
        self.minimum_units = units;
        self
    }

    pub fn with_rounding(mut self, rounding: Rounding) -> Self {
        self.rounding = rounding;
        self
    }

    pub fn rate(&self, class: SlotClass) -> Amount {
        self.rates[class.index()]
    }

    /// Units billed for a stay of `millis` milliseconds.
    pub fn billable_units(&self, millis: u64) -> u64 {
        let elapsed = match self.rounding {
            Rounding::Down => millis / self.unit_millis,
            Rounding::Up => millis.div_ceil(self.unit_millis),
        };
        elapsed.max(self.minimum_units)
    }
}

impl FeePolicy for RateTable {
    fn compute_fee(
        &self,
        class: SlotClass,
        issued_at: DateTime<Utc>,
        closed_at: DateTime<Utc>,
    ) -> Amount {
        let millis = (closed_at - issued_at).num_milliseconds().max(0) as u64;
        self.rate(class).saturating_mul(self.billable_units(millis))
    }
}
