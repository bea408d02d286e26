use core::{
    fmt::{Debug, Display, Formatter},
    ops::{Add, AddAssign, Sub, SubAssign},
};

use super::{Duration, NANOS_PER_SECOND};

/// A point in time on the timescale of a clock, in nanoseconds since that
/// clock's epoch
#[derive(Copy, Clone, Default, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(transparent))]
pub struct Time {
    nanos: i64,
}

impl Time {
    /// The epoch of the clock
    pub const EPOCH: Self = Self { nanos: 0 };

    /// Create a [`Time`] from nanoseconds since the epoch
    pub const fn from_nanos(nanos: i64) -> Self {
        Self { nanos }
    }

    /// Create a [`Time`] from whole seconds plus a sub-second part
    ///
    /// # Example
    /// ```
    /// # use phcsync::time::Time;
    /// assert_eq!(Time::from_secs_nanos(2, 5).nanos(), 2_000_000_005);
    /// ```
    pub const fn from_secs_nanos(secs: i64, nanos: u32) -> Self {
        Self::from_nanos(secs * NANOS_PER_SECOND + nanos as i64)
    }

    /// Nanoseconds since the epoch
    pub const fn nanos(self) -> i64 {
        self.nanos
    }

    /// Whole seconds since the epoch, rounded towards negative infinity
    pub const fn secs(self) -> i64 {
        self.nanos.div_euclid(NANOS_PER_SECOND)
    }

    /// The nanosecond part within the current second, always in
    /// `0..1_000_000_000`
    pub const fn subsec_nanos(self) -> u32 {
        self.nanos.rem_euclid(NANOS_PER_SECOND) as u32
    }

    /// Drop the sub-second part, first moving to the next second if more
    /// than half of the current second has passed.
    ///
    /// Exactly half a second rounds down.
    ///
    /// # Example
    /// ```
    /// # use phcsync::time::Time;
    /// assert_eq!(Time::from_secs_nanos(7, 500_000_001).round_to_second(), Time::from_secs_nanos(8, 0));
    /// assert_eq!(Time::from_secs_nanos(7, 500_000_000).round_to_second(), Time::from_secs_nanos(7, 0));
    /// ```
    pub const fn round_to_second(self) -> Self {
        let mut secs = self.secs();
        if self.subsec_nanos() as i64 > NANOS_PER_SECOND / 2 {
            secs += 1;
        }
        Self::from_secs_nanos(secs, 0)
    }
}

impl Debug for Time {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(f, "Time({}.{:09})", self.secs(), self.subsec_nanos())
    }
}

impl Display for Time {
    fn fmt(&self, f: &mut Formatter<'_>) -> core::fmt::Result {
        write!(f, "{}.{:09}", self.secs(), self.subsec_nanos())
    }
}

impl Add<Duration> for Time {
    type Output = Time;

    fn add(self, rhs: Duration) -> Self::Output {
        Self::from_nanos(self.nanos + rhs.nanos())
    }
}

impl AddAssign<Duration> for Time {
    fn add_assign(&mut self, rhs: Duration) {
        self.nanos += rhs.nanos();
    }
}

impl Sub<Duration> for Time {
    type Output = Time;

    fn sub(self, rhs: Duration) -> Self::Output {
        Self::from_nanos(self.nanos - rhs.nanos())
    }
}

impl SubAssign<Duration> for Time {
    fn sub_assign(&mut self, rhs: Duration) {
        self.nanos -= rhs.nanos();
    }
}

impl Sub for Time {
    type Output = Duration;

    fn sub(self, rhs: Self) -> Self::Output {
        Duration::from_nanos(self.nanos - rhs.nanos)
    }
}
