//! Simulated time.
//!
//! This module provides most notably:
//!
//! * [`SimTime`]: a simulated time or time interval, either dimensionless or
//!   tagged with a [`TimeUnit`],
//! * [`TimeUnit`]: the supported time dimensions (seconds, minutes, hours).
//!
//! Simulated time is a plain scalar quantity: it has no relationship to wall
//! clock time and is advanced exclusively by the event loop. Arithmetic
//! between two dimensioned values converts the operands to the smaller of
//! the two units; arithmetic mixing a dimensioned and a dimensionless value
//! is a unit mismatch and is reported as an error by the checked operations
//! (the operator implementations panic instead, which makes them mostly
//! suitable for tests and model constants).
//!
//! # Examples
//!
//! ```
//! use simproc::time::{SimTime, TimeUnit};
//!
//! let service = SimTime::new(90.0, TimeUnit::Seconds);
//! let brk = SimTime::new(1.0, TimeUnit::Minutes);
//! assert_eq!(service + brk, SimTime::new(150.0, TimeUnit::Seconds));
//! ```

use std::cmp::Ordering;
use std::error::Error;
use std::fmt;
use std::ops::{Add, Mul, Sub};

use serde::{Deserialize, Serialize};

/// A time dimension for [`SimTime`] values.
#[derive(Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum TimeUnit {
    /// Seconds.
    Seconds,
    /// Minutes.
    Minutes,
    /// Hours.
    Hours,
}

impl TimeUnit {
    /// Conversion factor from this unit to seconds.
    fn to_seconds(self) -> f64 {
        match self {
            TimeUnit::Seconds => 1.0,
            TimeUnit::Minutes => 60.0,
            TimeUnit::Hours => 3600.0,
        }
    }

    /// Name of the unit, singular form.
    fn name(self) -> &'static str {
        match self {
            TimeUnit::Seconds => "second",
            TimeUnit::Minutes => "minute",
            TimeUnit::Hours => "hour",
        }
    }
}

impl fmt::Display for TimeUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}s", self.name())
    }
}

/// Error returned when an operation mixes dimensioned and dimensionless
/// simulated times.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct UnitMismatchError;

impl fmt::Display for UnitMismatchError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "arithmetic between dimensioned and dimensionless simulated times"
        )
    }
}

impl Error for UnitMismatchError {}

/// A simulated time or time interval.
///
/// A `SimTime` is a non-negative scalar value optionally tagged with a
/// [`TimeUnit`]. Untagged values are *dimensionless*; they can only be
/// combined with other dimensionless values. A model-wide base unit
/// (configured via [`SimConfig`](crate::config::SimConfig)) determines the
/// unit assigned to dimensionless literals when they enter the engine
/// through e.g. [`wait_for`](crate::process::ProcessContext::wait_for).
#[derive(Clone, Copy, Debug)]
pub struct SimTime {
    value: f64,
    unit: Option<TimeUnit>,
}

impl SimTime {
    /// The zero (dimensionless) time.
    pub const ZERO: SimTime = SimTime {
        value: 0.0,
        unit: None,
    };

    /// Creates a time value with the specified unit.
    pub const fn new(value: f64, unit: TimeUnit) -> Self {
        Self {
            value,
            unit: Some(unit),
        }
    }

    /// Creates a dimensionless time value.
    pub const fn none(value: f64) -> Self {
        Self { value, unit: None }
    }

    /// Creates a time value in seconds.
    pub const fn seconds(value: f64) -> Self {
        Self::new(value, TimeUnit::Seconds)
    }

    /// Creates a time value in minutes.
    pub const fn minutes(value: f64) -> Self {
        Self::new(value, TimeUnit::Minutes)
    }

    /// Creates a time value in hours.
    pub const fn hours(value: f64) -> Self {
        Self::new(value, TimeUnit::Hours)
    }

    /// Returns the scalar value, without unit.
    pub fn value(&self) -> f64 {
        self.value
    }

    /// Returns the unit, or `None` for a dimensionless value.
    pub fn unit(&self) -> Option<TimeUnit> {
        self.unit
    }

    /// Returns `true` if the value is negative.
    pub fn is_negative(&self) -> bool {
        self.value < 0.0
    }

    /// Converts to the specified unit.
    ///
    /// A dimensionless value is re-tagged without scaling, which is how
    /// unit-less literals adopt the model base unit.
    pub fn to_unit(self, unit: TimeUnit) -> Self {
        match self.unit {
            None => Self::new(self.value, unit),
            Some(u) => Self::new(self.value * u.to_seconds() / unit.to_seconds(), unit),
        }
    }

    /// Re-tags a dimensionless value with the model base unit, if one is
    /// configured. Dimensioned values are converted to the base unit.
    pub(crate) fn coerced(self, base_unit: Option<TimeUnit>) -> Result<Self, UnitMismatchError> {
        match (self.unit, base_unit) {
            (None, None) => Ok(self),
            (_, Some(base)) => Ok(self.to_unit(base)),
            (Some(_), None) => Err(UnitMismatchError),
        }
    }

    /// The value converted to a canonical scale (seconds for dimensioned
    /// values, raw for dimensionless ones), used for comparisons.
    fn canonical(&self) -> f64 {
        match self.unit {
            None => self.value,
            Some(u) => self.value * u.to_seconds(),
        }
    }

    /// Converts `other` to this value's unit scale.
    ///
    /// Fails if exactly one of the operands is dimensionless.
    fn converted_other(&self, other: &SimTime) -> Result<f64, UnitMismatchError> {
        match (self.unit, other.unit) {
            (None, None) => Ok(other.value),
            (Some(u), Some(v)) => Ok(other.value * v.to_seconds() / u.to_seconds()),
            _ => Err(UnitMismatchError),
        }
    }

    /// Checked addition; fails on a unit mismatch.
    ///
    /// The result takes the smaller of the two units so that no precision is
    /// lost on the sub-unit side.
    pub fn checked_add(self, other: SimTime) -> Result<SimTime, UnitMismatchError> {
        let (small, large) = order_by_unit(self, other)?;
        let v = small.converted_other(&large)?;
        Ok(SimTime {
            value: small.value + v,
            unit: small.unit,
        })
    }

    /// Checked subtraction; fails on a unit mismatch.
    pub fn checked_sub(self, other: SimTime) -> Result<SimTime, UnitMismatchError> {
        let (small, _) = order_by_unit(self, other)?;
        let this = match small.unit {
            Some(u) => self.to_unit(u),
            None => self,
        };
        let other_conv = this.converted_other(&other)?;
        Ok(SimTime {
            value: this.value - other_conv,
            unit: this.unit,
        })
    }
}

/// Orders two times so that the first returned value carries the smaller
/// (finer) unit of the two.
fn order_by_unit(a: SimTime, b: SimTime) -> Result<(SimTime, SimTime), UnitMismatchError> {
    match (a.unit, b.unit) {
        (None, None) => Ok((a, b)),
        (Some(u), Some(v)) => {
            if u.to_seconds() <= v.to_seconds() {
                Ok((a, b))
            } else {
                Ok((b, a))
            }
        }
        _ => Err(UnitMismatchError),
    }
}

impl Default for SimTime {
    fn default() -> Self {
        SimTime::ZERO
    }
}

impl From<f64> for SimTime {
    /// Converts a bare scalar into a dimensionless time literal.
    fn from(value: f64) -> Self {
        SimTime::none(value)
    }
}

impl PartialEq for SimTime {
    fn eq(&self, other: &Self) -> bool {
        self.canonical() == other.canonical() && self.unit.is_some() == other.unit.is_some()
    }
}

impl Eq for SimTime {}

impl PartialOrd for SimTime {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for SimTime {
    /// Total order over canonical values.
    ///
    /// Dimensionless and dimensioned values never meet inside one run (the
    /// engine coerces everything to the base unit on entry); when they do
    /// compare equal on canonical value, the dimension flag breaks the tie
    /// so that the order stays total.
    fn cmp(&self, other: &Self) -> Ordering {
        self.canonical()
            .total_cmp(&other.canonical())
            .then_with(|| self.unit.is_some().cmp(&other.unit.is_some()))
    }
}

impl Add for SimTime {
    type Output = SimTime;

    /// # Panics
    ///
    /// Panics when adding a dimensioned and a dimensionless value. Use
    /// [`SimTime::checked_add`] to handle the mismatch as an error.
    fn add(self, other: SimTime) -> SimTime {
        match self.checked_add(other) {
            Ok(t) => t,
            Err(e) => panic!("{}", e),
        }
    }
}

impl Sub for SimTime {
    type Output = SimTime;

    /// # Panics
    ///
    /// Panics when subtracting a dimensioned and a dimensionless value. Use
    /// [`SimTime::checked_sub`] to handle the mismatch as an error.
    fn sub(self, other: SimTime) -> SimTime {
        match self.checked_sub(other) {
            Ok(t) => t,
            Err(e) => panic!("{}", e),
        }
    }
}

impl Mul<f64> for SimTime {
    type Output = SimTime;

    fn mul(self, rhs: f64) -> SimTime {
        SimTime {
            value: self.value * rhs,
            unit: self.unit,
        }
    }
}

impl fmt::Display for SimTime {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.unit {
            None => write!(f, "{}", self.value),
            Some(u) => {
                if self.value == 1.0 {
                    write!(f, "{} {}", self.value, u.name())
                } else {
                    write!(f, "{} {}s", self.value, u.name())
                }
            }
        }
    }
}
