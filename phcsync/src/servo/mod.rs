//! Definitions and implementations of the clock servos
//!
//! A servo turns a stream of measured offsets between a clock and its
//! reference into frequency corrections for that clock. This crate provides a
//! [`PiServo`], a proportional-integral controller, but users can implement
//! the [`Servo`] trait for other control laws.

mod pi;

pub use pi::{PiServo, PiServoConfig, ADJ_SCALE};

/// The lock state reported by a [`Servo`] after each sample
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum ServoState {
    /// No usable sample has been seen yet; no correction should be applied
    #[default]
    Unlocked,
    /// The clock is too far off: step it by the negated offset and set the
    /// returned frequency
    Jump,
    /// Only the frequency should be corrected
    Locked,
    /// Like [`Locked`](Self::Locked), with the offset having stayed small for
    /// a while
    LockedStable,
}

impl ServoState {
    /// Numeric representation used in log lines, matching the order of the
    /// variants
    pub fn as_index(self) -> u8 {
        match self {
            ServoState::Unlocked => 0,
            ServoState::Jump => 1,
            ServoState::Locked => 2,
            ServoState::LockedStable => 3,
        }
    }

    /// Whether the servo is tracking its reference
    pub fn is_locked(self) -> bool {
        matches!(self, ServoState::Locked | ServoState::LockedStable)
    }
}

/// A control loop converting time offsets into frequency corrections
pub trait Servo {
    /// Feed a new offset measurement into the servo.
    ///
    /// `offset` is the local clock minus the reference in nanoseconds,
    /// `local_ts` the local time of the measurement in nanoseconds. Returns the
    /// dimensionless frequency correction and the new lock state.
    fn sample(&mut self, offset: i64, local_ts: i64, weight: f64) -> (f64, ServoState);

    /// Forget all accumulated state, returning to [`ServoState::Unlocked`]
    fn reset(&mut self);

    /// The interval between samples in seconds
    fn sync_interval(&self) -> f64;

    /// Inform the servo of the interval between samples in seconds
    fn set_sync_interval(&mut self, interval: f64);

    /// The frequency, in parts per billion, to program into the clock for a
    /// correction returned by [`sample`](Self::sample)
    fn frequency_ppb(&self, adjustment: f64) -> f64 {
        adjustment * 1e9
    }
}

/// Thresholds deciding the lock state reported by a servo
///
/// The state only depends on the history of offset magnitudes; the control
/// arithmetic of the servo is independent of it.
#[derive(Debug, Copy, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(
    feature = "serde",
    serde(rename_all = "kebab-case", deny_unknown_fields)
)]
pub struct ServoStateConfig {
    /// Offset above which the very first sample steps the clock. Zero disables
    /// the initial step. (nanoseconds, 0+)
    #[cfg_attr(feature = "serde", serde(default = "default_first_step_threshold"))]
    pub first_step_threshold: i64,
    /// Offset above which later samples step the clock. Zero means the clock is
    /// only ever slewed after the first sample. (nanoseconds, 0+)
    #[cfg_attr(feature = "serde", serde(default))]
    pub step_threshold: i64,
    /// Offset below which samples count towards a stable lock. Zero disables
    /// [`ServoState::LockedStable`]. (nanoseconds, 0+)
    #[cfg_attr(feature = "serde", serde(default))]
    pub stable_offset_threshold: i64,
    /// Number of consecutive samples below
    /// [`stable_offset_threshold`](Self::stable_offset_threshold) before the
    /// lock is reported as stable. (count, 1+)
    #[cfg_attr(feature = "serde", serde(default = "default_stable_sample_count"))]
    pub stable_sample_count: u32,
}

impl Default for ServoStateConfig {
    fn default() -> Self {
        Self {
            first_step_threshold: default_first_step_threshold(),
            step_threshold: 0,
            stable_offset_threshold: 0,
            stable_sample_count: default_stable_sample_count(),
        }
    }
}

fn default_first_step_threshold() -> i64 {
    20_000
}

fn default_stable_sample_count() -> u32 {
    10
}

/// Tracks the lock state of a servo from the offsets it sees
#[derive(Debug, Clone)]
pub(crate) struct LockTracker {
    config: ServoStateConfig,
    state: ServoState,
    stable_samples: u32,
}

impl LockTracker {
    pub(crate) fn new(config: ServoStateConfig) -> Self {
        Self {
            config,
            state: ServoState::Unlocked,
            stable_samples: 0,
        }
    }

    pub(crate) fn state(&self) -> ServoState {
        self.state
    }

    pub(crate) fn reset(&mut self) {
        self.state = ServoState::Unlocked;
        self.stable_samples = 0;
    }

    pub(crate) fn update(&mut self, offset: i64) -> ServoState {
        let magnitude = offset.saturating_abs();
        let exceeds = |threshold: i64| threshold > 0 && magnitude > threshold;

        let next = match self.state {
            ServoState::Unlocked if exceeds(self.config.first_step_threshold) => ServoState::Jump,
            ServoState::Jump | ServoState::Locked | ServoState::LockedStable
                if exceeds(self.config.step_threshold) =>
            {
                ServoState::Jump
            }
            _ => self.locked_state(magnitude),
        };

        if next == ServoState::Jump {
            self.stable_samples = 0;
        }

        self.state = next;
        next
    }

    fn locked_state(&mut self, magnitude: i64) -> ServoState {
        let threshold = self.config.stable_offset_threshold;
        if threshold <= 0 {
            return ServoState::Locked;
        }

        if magnitude <= threshold {
            self.stable_samples = self.stable_samples.saturating_add(1);
        } else {
            self.stable_samples = 0;
        }

        if self.stable_samples >= self.config.stable_sample_count.max(1) {
            ServoState::LockedStable
        } else {
            ServoState::Locked
        }
    }
}
