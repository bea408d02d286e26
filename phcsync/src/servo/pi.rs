use super::{LockTracker, Servo, ServoState, ServoStateConfig};
use crate::clock::ClockDevice;

/// Bound of the integral accumulator of the [`PiServo`], in units of
/// `offset · ki`. The correction returned by the servo is scaled down by the
/// same factor.
pub const ADJ_SCALE: f64 = 10_000_000.0;

/// Gains of a [`PiServo`]
#[derive(Debug, Copy, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(
    feature = "serde",
    serde(rename_all = "kebab-case", deny_unknown_fields)
)]
pub struct PiServoConfig {
    /// Proportional gain
    #[cfg_attr(feature = "serde", serde(default = "default_kp"))]
    pub kp: f64,
    /// Integral gain
    #[cfg_attr(feature = "serde", serde(default = "default_ki"))]
    pub ki: f64,
}

impl Default for PiServoConfig {
    fn default() -> Self {
        Self {
            kp: default_kp(),
            ki: default_ki(),
        }
    }
}

fn default_kp() -> f64 {
    0.007
}

fn default_ki() -> f64 {
    0.003
}

/// A proportional-integral clock servo
///
/// Each sample adds `offset · ki · weight` to a drift accumulator clamped to
/// ±[`ADJ_SCALE`], and returns `-(offset · kp + drift) / ADJ_SCALE` as the
/// frequency correction.
#[derive(Debug, Clone)]
pub struct PiServo {
    config: PiServoConfig,
    drift_sum: f64,
    initial_freq: f64,
    max_adj: f64,
    sync_interval: f64,
    lock: LockTracker,
}

impl PiServo {
    /// Create a servo for a clock currently running at `initial_freq` ppb
    /// whose frequency can be adjusted by at most `max_adj` ppb.
    pub fn new(
        config: PiServoConfig,
        lock_config: ServoStateConfig,
        initial_freq: f64,
        max_adj: f64,
        sync_interval: f64,
    ) -> Self {
        Self {
            config,
            drift_sum: 0.0,
            initial_freq,
            max_adj,
            sync_interval,
            lock: LockTracker::new(lock_config),
        }
    }

    /// Create a servo for `device`, starting from its current frequency and
    /// limited to its maximum adjustment. Samples are expected once per
    /// second.
    pub fn for_device<D: ClockDevice>(
        config: PiServoConfig,
        lock_config: ServoStateConfig,
        device: &mut D,
    ) -> Result<Self, D::Error> {
        let freq = device.frequency()?;
        // make sure the kernel and the servo agree on the starting point
        device.set_frequency(freq)?;
        let max_adj = device.max_frequency()?;

        Ok(Self::new(config, lock_config, freq, max_adj, 1.0))
    }

    /// The current value of the integral accumulator
    pub fn drift_sum(&self) -> f64 {
        self.drift_sum
    }

    /// The state reported by the last sample
    pub fn state(&self) -> ServoState {
        self.lock.state()
    }
}

impl Servo for PiServo {
    fn sample(&mut self, offset: i64, local_ts: i64, weight: f64) -> (f64, ServoState) {
        let state = self.lock.update(offset);

        if state == ServoState::Jump {
            // the clock gets stepped by the full offset, nothing left to integrate
            self.drift_sum = 0.0;
            log::trace!("servo jump at {local_ts}, offset {offset}");
            return (0.0, state);
        }

        let offset = offset as f64;
        self.drift_sum =
            (self.drift_sum + offset * self.config.ki * weight).clamp(-ADJ_SCALE, ADJ_SCALE);
        let adj = -(offset * self.config.kp + self.drift_sum);

        (adj / ADJ_SCALE, state)
    }

    fn reset(&mut self) {
        self.drift_sum = 0.0;
        self.lock.reset();
    }

    fn sync_interval(&self) -> f64 {
        self.sync_interval
    }

    fn set_sync_interval(&mut self, interval: f64) {
        self.sync_interval = interval;
    }

    fn frequency_ppb(&self, adjustment: f64) -> f64 {
        let freq = self.initial_freq + adjustment * 1e9;
        if self.max_adj > 0.0 {
            freq.clamp(-self.max_adj, self.max_adj)
        } else {
            freq
        }
    }
}
