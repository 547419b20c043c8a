//! Reconciliation of the live tick count against stored history.
//!
//! Each measurement cycle turns the drained tick count into a precipitation
//! rate and extends the running daily total. The previous total is not
//! trusted blindly: it is re-derived from the day's stored per-cycle rates
//! and discarded -- replaced by the explicit [`Accumulation::Unknown`]
//! marker -- whenever the stored value and the recomputed sum disagree or a
//! sample is missing. The total also restarts from zero at a configured
//! wall-clock boundary once per day.

use chrono::{DateTime, NaiveTime, TimeDelta, TimeZone, Utc};
use tracing::{debug, error};

use crate::store::Fetched;

/// Errors produced by this module.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// The configured reset boundary is not a valid time of day.
    #[error("{hour:02}:{minute:02}:{second:02}.{microsecond:06} is not a valid reset boundary")]
    InvalidBoundary {
        /// Configured hour.
        hour: u32,
        /// Configured minute.
        minute: u32,
        /// Configured second.
        second: u32,
        /// Configured microsecond.
        microsecond: u32,
    },
    /// A required field is absent from fetched store rows.
    #[error("field {field} is not present in fetched store data")]
    MissingField {
        /// The absent field name.
        field: String,
    },
}

/// A daily accumulated total, or the explicit marker that no trustworthy
/// value exists for this cycle.
///
/// `Unknown` is distinct from zero: zero means no rainfall, `Unknown` means
/// the stored history could not be validated. Unknown values are omitted
/// from the store write so consumers see the store's own missing-value
/// representation.
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Accumulation {
    /// A validated total.
    Known(f64),
    /// No trustworthy total exists for this cycle.
    Unknown,
}

impl Accumulation {
    /// The validated total, if there is one.
    #[must_use]
    pub fn known(self) -> Option<f64> {
        match self {
            Self::Known(value) => Some(value),
            Self::Unknown => None,
        }
    }
}

/// Round a value to the station's display precision of two decimal places.
///
/// Applied only at the point of persistence; intermediate arithmetic is
/// carried at full precision.
#[must_use]
pub fn round_display(value: f64) -> f64 {
    (value * 100.0).round() / 100.0
}

/// The daily wall-clock instant (UTC) after which accumulation restarts
/// from zero.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResetBoundary {
    time: NaiveTime,
}

impl ResetBoundary {
    /// Create a boundary at the given UTC time of day.
    ///
    /// # Errors
    ///
    /// Function will return an error if the fields do not name a valid time
    /// of day.
    pub fn new(hour: u32, minute: u32, second: u32, microsecond: u32) -> Result<Self, Error> {
        let time = NaiveTime::from_hms_micro_opt(hour, minute, second, microsecond).ok_or(
            Error::InvalidBoundary {
                hour,
                minute,
                second,
                microsecond,
            },
        )?;
        Ok(Self { time })
    }

    /// The most recent boundary crossing at-or-before `at`.
    #[must_use]
    pub fn previous_crossing(&self, at: DateTime<Utc>) -> DateTime<Utc> {
        let candidate = Utc.from_utc_datetime(&at.date_naive().and_time(self.time));
        if candidate > at {
            candidate - TimeDelta::days(1)
        } else {
            candidate
        }
    }

    /// Whether the previous accumulated total must be discarded: true when
    /// the last stored entry predates the most recent boundary crossing
    /// before `loop_start`. An entry exactly on the crossing is current.
    #[must_use]
    pub fn reset_due(&self, loop_start: DateTime<Utc>, last_entry: DateTime<Utc>) -> bool {
        last_entry < self.previous_crossing(loop_start)
    }
}

impl Default for ResetBoundary {
    /// Midnight UTC.
    fn default() -> Self {
        Self {
            time: NaiveTime::MIN,
        }
    }
}

/// Today's stored history, reduced to the two inputs reconciliation needs.
#[derive(Debug, Clone, PartialEq)]
pub struct DayHistory {
    /// Per-cycle rate samples since the reset boundary, oldest first. The
    /// store's trailing row is excluded: it is the slot the pending write
    /// will fill.
    rates: Vec<Option<f64>>,
    /// The stored accumulated total from the second-to-last row. A missing
    /// value reads as zero, which the sum check then arbitrates.
    stored_total: f64,
}

impl DayHistory {
    /// Extract reconciliation inputs from a store fetch.
    ///
    /// # Errors
    ///
    /// Function will return an error if either configured field is missing
    /// from the fetched data sources.
    pub fn from_fetched(
        fetched: &Fetched,
        rate_field: &str,
        total_field: &str,
    ) -> Result<Self, Error> {
        let rate_column = fetched
            .names
            .iter()
            .position(|name| name == rate_field)
            .ok_or_else(|| Error::MissingField {
                field: rate_field.to_string(),
            })?;
        let total_column = fetched
            .names
            .iter()
            .position(|name| name == total_field)
            .ok_or_else(|| Error::MissingField {
                field: total_field.to_string(),
            })?;

        let row_count = fetched.rows.len();
        let rates = fetched.rows[..row_count.saturating_sub(1)]
            .iter()
            .map(|row| row.values[rate_column])
            .collect();
        let stored_total = if row_count >= 2 {
            fetched.rows[row_count - 2].values[total_column].unwrap_or(0.0)
        } else {
            0.0
        };

        Ok(Self {
            rates,
            stored_total,
        })
    }

    #[cfg(test)]
    pub(crate) fn with_values(rates: Vec<Option<f64>>, stored_total: f64) -> Self {
        Self {
            rates,
            stored_total,
        }
    }
}

/// Converts drained tick counts into rates and composes the daily total.
#[derive(Debug, Clone, Copy)]
pub struct Reconciler {
    unit_per_tick: f64,
    tolerance: f64,
}

impl Reconciler {
    /// Create a new [`Reconciler`].
    ///
    /// `unit_per_tick` is the measured quantity one accepted tick
    /// represents; `tolerance` bounds the acceptable disagreement between
    /// the stored total and the recomputed sum of the day's rates.
    #[must_use]
    pub fn new(unit_per_tick: f64, tolerance: f64) -> Self {
        Self {
            unit_per_tick,
            tolerance,
        }
    }

    /// The rate measured by `ticks` accepted ticks this cycle.
    #[must_use]
    pub fn rate(&self, ticks: u64) -> f64 {
        ticks as f64 * self.unit_per_tick
    }

    /// Validate the stored total against the day's rate history and extend
    /// it by the current rate.
    ///
    /// The stored total is trusted only when every rate sample for the day
    /// is present and the recomputed sum agrees with it within tolerance;
    /// otherwise the result is [`Accumulation::Unknown`]. The discrepancy is
    /// logged for diagnosis, never raised as an error: the station keeps
    /// running and the rate is persisted regardless.
    #[must_use]
    pub fn compose(&self, rate: f64, history: &DayHistory) -> Accumulation {
        if history.rates.iter().any(Option::is_none) {
            error!(
                samples = history.rates.len(),
                "rate samples missing from today's series; total is unknown"
            );
            return Accumulation::Unknown;
        }

        let recomputed: f64 = history.rates.iter().flatten().sum();
        if (recomputed - history.stored_total).abs() >= self.tolerance {
            error!(
                stored_total = history.stored_total,
                recomputed_sum = recomputed,
                "stored accumulation does not match recomputed rate history; total is unknown"
            );
            return Accumulation::Unknown;
        }

        debug!(
            stored_total = history.stored_total,
            rate, "stored accumulation validated"
        );
        Accumulation::Known(history.stored_total + rate)
    }
}
