//! Synchronization of clocks that are only reachable through a slow
//! management bus
//!
//! Switches like the SJA1105 expose their PTP clock as registers behind an SPI
//! bus. The clock can be read, set, advanced by a given amount and have its
//! rate changed through a [`RatioRegister`], but not stepped backwards. Such a
//! clock is first brought close to the reference by setting it one second
//! behind and then adding the measured offset (the reset phase). After that a
//! PI servo tracks the reference through the rate register.

use core::num::NonZeroU32;

use crate::{
    clock::ClockDevice,
    ratio::{RangeError, RatioRegister},
    servo::{PiServo, PiServoConfig, Servo, ServoStateConfig},
    time::{Duration, NANOS_PER_SECOND},
};

/// Register access to a clock behind a management bus. Every call is a
/// blocking bus transaction.
pub trait ManagementBus {
    /// Error produced by a failing bus transaction
    type Error: core::fmt::Debug;

    /// Write the rate register
    fn write_ratio(&mut self, ratio: RatioRegister) -> Result<(), Self::Error>;

    /// Read the clock, in ticks
    fn read_counter(&mut self) -> Result<u64, Self::Error>;

    /// Set the clock to `ticks`
    fn set_absolute_time(&mut self, ticks: u64) -> Result<(), Self::Error>;

    /// Advance the clock by `ticks`
    fn add_time(&mut self, ticks: u64) -> Result<(), Self::Error>;
}

/// Settings of a [`RatioSync`]
#[derive(Debug, Copy, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(
    feature = "serde",
    serde(rename_all = "kebab-case", deny_unknown_fields)
)]
pub struct RatioSyncConfig {
    /// Offsets at or beyond this are not corrected (nanoseconds)
    #[cfg_attr(feature = "serde", serde(default = "default_max_offset"))]
    pub max_offset: i64,
    /// Length of one tick of the bus clock (nanoseconds)
    #[cfg_attr(feature = "serde", serde(default = "default_tick_ns"))]
    pub tick_ns: NonZeroU32,
    /// Time between two tracking cycles (milliseconds)
    #[cfg_attr(feature = "serde", serde(default = "default_sync_period_ms"))]
    pub sync_period_ms: u64,
    /// Gains of the tracking servo
    #[cfg_attr(feature = "serde", serde(default))]
    pub servo: PiServoConfig,
}

impl RatioSyncConfig {
    /// Time between two tracking cycles
    pub fn sync_period(&self) -> core::time::Duration {
        core::time::Duration::from_millis(self.sync_period_ms)
    }

    fn tick(&self) -> i64 {
        i64::from(self.tick_ns.get())
    }
}

impl Default for RatioSyncConfig {
    fn default() -> Self {
        Self {
            max_offset: default_max_offset(),
            tick_ns: default_tick_ns(),
            sync_period_ms: default_sync_period_ms(),
            servo: PiServoConfig::default(),
        }
    }
}

fn default_max_offset() -> i64 {
    10_000
}

fn default_tick_ns() -> NonZeroU32 {
    NonZeroU32::new(8).unwrap_or(NonZeroU32::MIN)
}

fn default_sync_period_ms() -> u64 {
    125
}

/// What a tracking cycle did
#[derive(Copy, Clone, Debug, PartialEq)]
pub enum RatioOutcome {
    /// The rate register was written
    Adjusted {
        offset: Duration,
        delay: Duration,
        ratio: RatioRegister,
    },
    /// The offset was too large to correct; a reset follows if requested
    Skipped {
        offset: Duration,
        delay: Duration,
        reset_requested: bool,
    },
}

/// Errors of a [`RatioSync`] cycle
#[derive(Debug)]
#[cfg_attr(feature = "std", derive(thiserror::Error))]
pub enum RatioSyncError<B, C> {
    /// A bus transaction failed
    #[cfg_attr(feature = "std", error("management bus fault: {0:?}"))]
    Bus(B),
    /// Reading the reference clock failed
    #[cfg_attr(feature = "std", error("reference clock error: {0:?}"))]
    Clock(C),
    #[cfg_attr(feature = "std", error("{0}"))]
    Range(RangeError),
}

/// A measurement of the bus clock against the reference
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct Measurement {
    /// Bus clock minus reference
    pub offset: Duration,
    /// Half of the round trip time of the bus read
    pub delay: Duration,
}

/// Steers a clock behind a [`ManagementBus`] to a local reference clock
#[derive(Debug)]
pub struct RatioSync<B> {
    bus: B,
    config: RatioSyncConfig,
    servo: PiServo,
    reset_requested: bool,
    last_offset: Option<Duration>,
}

impl<B: ManagementBus> RatioSync<B> {
    /// Start synchronizing the clock behind `bus`. The first cycle runs the
    /// reset phase.
    pub fn new(bus: B, config: RatioSyncConfig) -> Self {
        let servo = PiServo::new(
            config.servo,
            ServoStateConfig {
                first_step_threshold: 0,
                step_threshold: 0,
                ..Default::default()
            },
            0.0,
            0.0,
            config.sync_period().as_secs_f64(),
        );

        Self {
            bus,
            config,
            servo,
            reset_requested: true,
            last_offset: None,
        }
    }

    /// The bus
    pub fn bus(&self) -> &B {
        &self.bus
    }

    /// The bus, mutably
    pub fn bus_mut(&mut self) -> &mut B {
        &mut self.bus
    }

    /// Whether the next cycle starts with the reset phase
    pub fn reset_requested(&self) -> bool {
        self.reset_requested
    }

    /// The accumulated integral term of the tracking servo
    pub fn drift_sum(&self) -> f64 {
        self.servo.drift_sum()
    }

    /// The offset measured in the last successful cycle
    pub fn last_offset(&self) -> Option<Duration> {
        self.last_offset
    }

    /// Measure the offset of the bus clock, taking the best of three
    /// reference/bus/reference readings.
    pub fn measure<C: ClockDevice>(
        &mut self,
        reference: &C,
    ) -> Result<Measurement, RatioSyncError<B::Error, C::Error>> {
        let mut best_interval = i64::MAX;
        let mut offset = 0;

        for _ in 0..3 {
            let t1 = reference.now().map_err(RatioSyncError::Clock)?;
            let t2 = self.bus.read_counter().map_err(RatioSyncError::Bus)?;
            let t3 = reference.now().map_err(RatioSyncError::Clock)?;

            let interval = (t3 - t1).nanos();
            if interval < best_interval {
                best_interval = interval;
                offset = (t2 as i64) * self.config.tick() - t1.nanos() - interval / 2;
            }
        }

        Ok(Measurement {
            offset: Duration::from_nanos(offset),
            delay: Duration::from_nanos(best_interval / 2),
        })
    }

    /// Bring the bus clock close to `reference`: run it at the nominal rate,
    /// set it one second behind and add the measured offset.
    pub fn reset<C: ClockDevice>(
        &mut self,
        reference: &C,
    ) -> Result<(), RatioSyncError<B::Error, C::Error>> {
        self.bus
            .write_ratio(RatioRegister::NOMINAL)
            .map_err(RatioSyncError::Bus)?;

        let behind = reference.now().map_err(RatioSyncError::Clock)? - Duration::ONE_SECOND;
        let ticks = behind.nanos().max(0) as u64 / u64::from(self.config.tick_ns.get());
        self.bus
            .set_absolute_time(ticks)
            .map_err(RatioSyncError::Bus)?;

        let Measurement { offset, delay } = self.measure(reference)?;
        log::debug!("bus clock reset: offset {offset}, delay {delay}");

        if !offset.is_negative() {
            return Err(RatioSyncError::Range(RangeError::Offset(offset.nanos())));
        }

        self.bus
            .add_time((-offset.nanos() / self.config.tick()) as u64)
            .map_err(RatioSyncError::Bus)?;

        self.reset_requested = false;
        self.servo.reset();

        Ok(())
    }

    /// Run one cycle: reset the bus clock if requested, then measure the
    /// offset and correct the rate.
    ///
    /// On a bus fault the servo is left as is and, if the last measured offset
    /// was beyond the maximum, the next cycle resets the clock.
    pub fn sync<C: ClockDevice>(
        &mut self,
        reference: &C,
    ) -> Result<RatioOutcome, RatioSyncError<B::Error, C::Error>> {
        let result = self.run(reference);

        if let Err(RatioSyncError::Bus(_)) = &result {
            if self
                .last_offset
                .is_some_and(|offset| offset.abs().nanos() >= self.config.max_offset)
            {
                self.reset_requested = true;
            }
        }

        result
    }

    fn run<C: ClockDevice>(
        &mut self,
        reference: &C,
    ) -> Result<RatioOutcome, RatioSyncError<B::Error, C::Error>> {
        if self.reset_requested {
            self.reset(reference)?;
        }

        let Measurement { offset, delay } = self.measure(reference)?;
        self.last_offset = Some(offset);
        log::debug!(
            "bus clock offset {:>9} ns, delay {:>9} ns",
            offset.nanos(),
            delay.nanos()
        );

        let magnitude = offset.abs().nanos();
        if magnitude >= self.config.max_offset {
            log::error!(
                "bus clock offset {offset} exceeds maximum of {}ns",
                self.config.max_offset
            );

            if magnitude >= NANOS_PER_SECOND {
                self.reset_requested = true;
            }

            return Ok(RatioOutcome::Skipped {
                offset,
                delay,
                reset_requested: self.reset_requested,
            });
        }

        let (adjustment, _) = self.servo.sample(offset.nanos(), 0, 1.0);
        let ratio = RatioRegister::encode(1.0 + adjustment).map_err(RatioSyncError::Range)?;
        self.bus.write_ratio(ratio).map_err(RatioSyncError::Bus)?;

        Ok(RatioOutcome::Adjusted {
            offset,
            delay,
            ratio,
        })
    }
}
