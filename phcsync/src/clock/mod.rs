//! Definitions of the hardware clock abstraction and the registry owning the
//! clocks.

mod registry;

use alloc::string::String;

pub use registry::{ClockRegistry, RegistryError};

use crate::{
    servo::{Servo, ServoState},
    time::{Duration, Time},
    topology::PortState,
};

/// A hardware clock that can be read, stepped and have its frequency adjusted
/// independently of the system clock
pub trait ClockDevice {
    /// Error produced by failing device operations
    type Error: core::fmt::Debug;

    /// Get the current time of the clock
    fn now(&self) -> Result<Time, Self::Error>;

    /// The current frequency offset of the clock in parts per billion
    fn frequency(&self) -> Result<f64, Self::Error>;

    /// Run the clock `ppb` parts per billion faster than its nominal rate
    fn set_frequency(&mut self, ppb: f64) -> Result<(), Self::Error>;

    /// Move the time of the clock by `offset`
    fn step_clock(&mut self, offset: Duration) -> Result<(), Self::Error>;

    /// Maximum frequency adjustment the clock supports, in parts per billion
    fn max_frequency(&self) -> Result<f64, Self::Error>;
}

/// Opens hardware clocks by name
pub trait ClockOpener {
    /// The kind of device opened
    type Device: ClockDevice;

    /// Open the clock with the given name, returning the device and its
    /// hardware index. Two names resolving to the same physical clock must
    /// return the same index.
    fn open(
        &mut self,
        name: &str,
    ) -> Result<(Self::Device, u32), <Self::Device as ClockDevice>::Error>;
}

/// Stable handle of a clock within a [`ClockRegistry`]
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct ClockId(pub(crate) usize);

impl core::fmt::Display for ClockId {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        write!(f, "clock#{}", self.0)
    }
}

/// A hardware clock known to the synchronization process, together with its
/// servo and synchronization role
#[derive(Debug)]
pub struct Clock<D, S> {
    name: String,
    index: u32,
    pub(crate) device: D,
    pub(crate) servo: S,
    pub(crate) servo_state: ServoState,
    pub(crate) state: Option<PortState>,
    last_ts: Option<Time>,
    pub(crate) is_destination: bool,
    pub(crate) free_running: bool,
    pub(crate) last_offset: Option<Duration>,
    pub(crate) last_frequency: Option<f64>,
}

impl<D: ClockDevice, S: Servo> Clock<D, S> {
    pub(crate) fn new(name: String, index: u32, device: D, servo: S) -> Self {
        Self {
            name,
            index,
            device,
            servo,
            servo_state: ServoState::Unlocked,
            state: None,
            last_ts: None,
            is_destination: false,
            free_running: false,
            last_offset: None,
            last_frequency: None,
        }
    }

    /// The name the clock was first opened under
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The hardware index identifying the physical clock
    pub fn index(&self) -> u32 {
        self.index
    }

    /// The underlying device
    pub fn device(&self) -> &D {
        &self.device
    }

    /// The underlying device, mutably
    pub fn device_mut(&mut self) -> &mut D {
        &mut self.device
    }

    /// The servo state after the last sample
    pub fn servo_state(&self) -> ServoState {
        self.servo_state
    }

    /// The aggregated port state, if any ports are bound to this clock
    pub fn port_state(&self) -> Option<PortState> {
        self.state
    }

    /// Whether this clock gets corrected
    pub fn is_destination(&self) -> bool {
        self.is_destination
    }

    /// Whether offsets of this clock are only observed, never corrected
    pub fn is_free_running(&self) -> bool {
        self.free_running
    }

    /// The last offset measured for this clock
    pub fn last_offset(&self) -> Option<Duration> {
        self.last_offset
    }

    /// The last frequency written to this clock, in parts per billion
    pub fn last_frequency(&self) -> Option<f64> {
        self.last_frequency
    }

    /// Stash a timestamp for the current cycle, replacing any earlier one
    pub fn add_timestamp(&mut self, ts: Time) {
        log::debug!("adding timestamp {} to clock {}", ts, self.name);
        self.last_ts = Some(ts);
    }

    /// Take the timestamp stashed during the current cycle
    pub fn take_timestamp(&mut self) -> Option<Time> {
        self.last_ts.take()
    }

    /// Drop any stashed timestamp
    pub fn flush_timestamp(&mut self) {
        self.last_ts = None;
    }

    #[cfg(test)]
    pub(crate) fn has_timestamp(&self) -> bool {
        self.last_ts.is_some()
    }

    /// Forget the servo history and start over unlocked
    pub fn unlock(&mut self) {
        self.servo.reset();
        self.servo_state = ServoState::Unlocked;
    }
}
