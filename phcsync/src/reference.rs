//! The time reference that the edges of the pulse signal are attributed to

use crate::{
    clock::{ClockDevice, ClockId, ClockRegistry},
    servo::Servo,
    time::{Duration, Time},
};

/// TAI - UTC at the time of writing
pub const DEFAULT_UTC_OFFSET: Duration = Duration::from_secs(37);

/// A clock following UTC, typically the realtime clock of the operating
/// system
pub trait SystemClock {
    /// The current UTC time
    fn now(&self) -> Time;
}

/// Errors from reading the reference
#[derive(Debug)]
#[cfg_attr(feature = "std", derive(thiserror::Error))]
pub enum ReferenceError<E> {
    /// Reading the reference clock failed
    #[cfg_attr(feature = "std", error("reference clock error: {0:?}"))]
    Device(E),
    /// The reference clock is not in the registry
    #[cfg_attr(feature = "std", error("reference {0} does not exist"))]
    Unknown(ClockId),
}

/// Where the time of the pulse edges comes from
#[derive(Debug, Clone)]
pub enum Reference<C> {
    /// An external 1-PPS without time of day. The edge is assumed to be on
    /// the second of the system clock, which must be synchronized to within
    /// half a second.
    Generic {
        clock: C,
        /// Added to the UTC system time to get to the TAI timescale of PTP
        /// hardware clocks
        utc_offset: Duration,
    },
    /// A local hardware clock emitting the pulse on a periodic output
    Phc { clock: ClockId },
}

impl<C: SystemClock> Reference<C> {
    /// A generic reference on `clock` with the default UTC offset
    pub fn generic(clock: C) -> Self {
        Reference::Generic {
            clock,
            utc_offset: DEFAULT_UTC_OFFSET,
        }
    }

    /// The hardware clock behind this reference, if any
    pub fn clock(&self) -> Option<ClockId> {
        match self {
            Reference::Generic { .. } => None,
            Reference::Phc { clock } => Some(*clock),
        }
    }

    /// The current time of the reference, close to the last pulse edge
    pub fn pps_time<D: ClockDevice, S: Servo>(
        &self,
        registry: &ClockRegistry<D, S>,
    ) -> Result<Time, ReferenceError<D::Error>> {
        match self {
            Reference::Generic { clock, utc_offset } => Ok(clock.now() + *utc_offset),
            Reference::Phc { clock } => registry
                .get(*clock)
                .ok_or(ReferenceError::Unknown(*clock))?
                .device()
                .now()
                .map_err(ReferenceError::Device),
        }
    }

    /// The time of the last pulse edge: the reference time rounded to the
    /// nearest second, with the periodic output shifted by `perout_phase`.
    pub fn approximate_edge<D: ClockDevice, S: Servo>(
        &self,
        registry: &ClockRegistry<D, S>,
        perout_phase: Duration,
    ) -> Result<Time, ReferenceError<D::Error>> {
        let time = self.pps_time(registry)?;
        Ok(approximate_edge(time, perout_phase))
    }
}

/// Round `time` to the edge of a pulse train with period one second and
/// phase `perout_phase`
pub fn approximate_edge(time: Time, perout_phase: Duration) -> Time {
    (time - perout_phase).round_to_second() + perout_phase
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::sim::{SimOpener, SimServo, SimSystemClock};

    #[test]
    fn edge_approximation() {
        let phase = Duration::from_millis(100);
        assert_eq!(
            approximate_edge(Time::from_secs_nanos(10, 99_000_000), phase),
            Time::from_secs_nanos(10, 100_000_000)
        );
        assert_eq!(
            approximate_edge(Time::from_secs_nanos(10, 650_000_000), phase),
            Time::from_secs_nanos(11, 100_000_000)
        );
        assert_eq!(
            approximate_edge(Time::from_secs_nanos(10, 600_000_000), phase),
            Time::from_secs_nanos(10, 100_000_000)
        );
        assert_eq!(
            approximate_edge(Time::from_secs_nanos(10, 400), Duration::ZERO),
            Time::from_secs_nanos(10, 0)
        );
    }

    #[test]
    fn generic_reference_adds_utc_offset() {
        let registry: ClockRegistry<crate::sim::SimDevice, SimServo> = ClockRegistry::new();
        let reference = Reference::generic(SimSystemClock::new(Time::from_secs_nanos(100, 20)));

        assert_eq!(
            reference.pps_time(&registry).unwrap(),
            Time::from_secs_nanos(137, 20)
        );
        assert_eq!(
            reference
                .approximate_edge(&registry, Duration::ZERO)
                .unwrap(),
            Time::from_secs_nanos(137, 0)
        );
    }

    #[test]
    fn phc_reference_reads_the_device() {
        let mut opener = SimOpener::default();
        let mut registry = ClockRegistry::new();
        let id = registry
            .get_or_create(&mut opener, "/dev/ptp0", |_| Ok(SimServo::default()))
            .unwrap();
        registry
            .get(id)
            .unwrap()
            .device()
            .set_time(Time::from_secs_nanos(5, 999_999_990));

        let reference: Reference<SimSystemClock> = Reference::Phc { clock: id };
        assert_eq!(
            reference
                .approximate_edge(&registry, Duration::ZERO)
                .unwrap(),
            Time::from_secs_nanos(6, 0)
        );

        let missing: Reference<SimSystemClock> = Reference::Phc {
            clock: ClockId(9),
        };
        assert!(matches!(
            missing.pps_time(&registry),
            Err(ReferenceError::Unknown(_))
        ));
    }
}
