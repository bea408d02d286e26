use core::{
    fmt::{Debug, Display, Formatter},
    ops::{Add, AddAssign, Neg, Sub, SubAssign},
};

use super::NANOS_PER_SECOND;

/// A signed span of time with nanosecond resolution
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct Duration {
    nanos: i64,
}

impl Duration {
    /// A duration of zero length
    pub const ZERO: Self = Self { nanos: 0 };

    /// A duration of exactly one second
    pub const ONE_SECOND: Self = Self {
        nanos: NANOS_PER_SECOND,
    };

    /// Create a [`Duration`] from a number of nanoseconds
    pub const fn from_nanos(nanos: i64) -> Self {
        Self { nanos }
    }

    /// Create a [`Duration`] from a number of microseconds
    pub const fn from_micros(micros: i64) -> Self {
        Self::from_nanos(micros * 1_000)
    }

    /// Create a [`Duration`] from a number of milliseconds
    pub const fn from_millis(millis: i64) -> Self {
        Self::from_nanos(millis * 1_000_000)
    }

    /// Create a [`Duration`] from a number of seconds
    pub const fn from_secs(secs: i64) -> Self {
        Self::from_nanos(secs * NANOS_PER_SECOND)
    }

    /// The length of this duration in nanoseconds
    pub const fn nanos(self) -> i64 {
        self.nanos
    }

    /// The length of this duration in (fractional) seconds
    pub fn seconds(self) -> f64 {
        self.nanos as f64 / NANOS_PER_SECOND as f64
    }

    /// The absolute value of this duration
    pub const fn abs(self) -> Self {
        Self {
            nanos: self.nanos.saturating_abs(),
        }
    }

    /// Whether this duration points backwards in time
    pub const fn is_negative(self) -> bool {
        self.nanos < 0
    }
}

impl Debug for Duration {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(f, "Duration({}ns)", self.nanos)
    }
}

impl Display for Duration {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}ns", self.nanos)
    }
}

impl Neg for Duration {
    type Output = Duration;

    fn neg(self) -> Self::Output {
        Self::from_nanos(-self.nanos)
    }
}

impl Add for Duration {
    type Output = Duration;

    fn add(self, rhs: Self) -> Self::Output {
        Self::from_nanos(self.nanos + rhs.nanos)
    }
}

impl AddAssign for Duration {
    fn add_assign(&mut self, rhs: Self) {
        self.nanos += rhs.nanos;
    }
}

impl Sub for Duration {
    type Output = Duration;

    fn sub(self, rhs: Self) -> Self::Output {
        Self::from_nanos(self.nanos - rhs.nanos)
    }
}

impl SubAssign for Duration {
    fn sub_assign(&mut self, rhs: Self) {
        self.nanos -= rhs.nanos;
    }
}

impl From<Duration> for core::time::Duration {
    /// Negative durations saturate to zero
    fn from(value: Duration) -> Self {
        core::time::Duration::from_nanos(value.nanos.max(0) as u64)
    }
}
