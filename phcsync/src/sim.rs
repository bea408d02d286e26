//! Simulated platform for the tests: clocks with external timestamp inputs, a
//! system clock, an event poller and a management bus.

use alloc::{
    collections::{BTreeMap, VecDeque},
    rc::Rc,
    string::String,
    vec::Vec,
};
use core::cell::{Cell, RefCell};

use crate::{
    clock::{ClockDevice, ClockOpener},
    extts::{EdgePolarity, ExtTsDevice, ExtTsEvent},
    ratio::RatioRegister,
    reference::SystemClock,
    servo::{Servo, ServoState},
    sync::{ratio::ManagementBus, EventPoller},
    time::{Duration, Time},
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SimError(pub &'static str);

#[derive(Debug, Default)]
struct DeviceState {
    time: Time,
    read_step: Duration,
    /// offset of the clock from true time, in nanoseconds
    phase: f64,
    frequency: f64,
    frequency_writes: usize,
    steps: Vec<Duration>,
    pins: u32,
    pin_functions: BTreeMap<u32, u32>,
    enabled: BTreeMap<u32, EdgePolarity>,
    events: VecDeque<ExtTsEvent>,
    failing: bool,
}

#[derive(Debug)]
struct OpenHandle(Rc<Cell<usize>>);

impl Drop for OpenHandle {
    fn drop(&mut self) {
        self.0.set(self.0.get() - 1);
    }
}

/// A simulated hardware clock. Clones share the same clock.
#[derive(Debug, Clone)]
pub struct SimDevice {
    state: Rc<RefCell<DeviceState>>,
    _handle: Option<Rc<OpenHandle>>,
}

impl SimDevice {
    pub fn new(_index: u32, pins: u32) -> Self {
        Self {
            state: Rc::new(RefCell::new(DeviceState {
                pins,
                ..Default::default()
            })),
            _handle: None,
        }
    }

    pub fn set_time(&self, time: Time) {
        self.state.borrow_mut().time = time;
    }

    /// Every read of the clock takes `step`, half of it before the time is
    /// latched
    pub fn set_read_step(&self, step: Duration) {
        self.state.borrow_mut().read_step = step;
    }

    pub fn set_phase(&self, phase: f64) {
        self.state.borrow_mut().phase = phase;
    }

    pub fn phase(&self) -> f64 {
        self.state.borrow().phase
    }

    pub fn set_failing(&self, failing: bool) {
        self.state.borrow_mut().failing = failing;
    }

    pub fn push_event(&self, channel: u32, time: Time) {
        self.state
            .borrow_mut()
            .events
            .push_back(ExtTsEvent { channel, time });
    }

    /// Latch an edge at true time `edge` on `channel`
    pub fn pulse(&self, channel: u32, edge: Time) {
        let phase = self.phase();
        self.push_event(channel, edge + Duration::from_nanos(phase.round() as i64));
    }

    /// Let one second of true time pass at the current frequency
    pub fn advance_second(&self) {
        let mut state = self.state.borrow_mut();
        let frequency = state.frequency;
        state.phase += frequency;
    }

    pub fn queued_events(&self) -> usize {
        self.state.borrow().events.len()
    }

    pub fn pin_function(&self, pin: u32) -> Option<u32> {
        self.state.borrow().pin_functions.get(&pin).copied()
    }

    pub fn enabled_channel(&self, channel: u32) -> Option<EdgePolarity> {
        self.state.borrow().enabled.get(&channel).copied()
    }

    pub fn current_frequency(&self) -> f64 {
        self.state.borrow().frequency
    }

    pub fn frequency_writes(&self) -> usize {
        self.state.borrow().frequency_writes
    }

    pub fn steps(&self) -> Vec<Duration> {
        self.state.borrow().steps.clone()
    }

    fn check(&self) -> Result<(), SimError> {
        if self.state.borrow().failing {
            Err(SimError("device failure"))
        } else {
            Ok(())
        }
    }
}

impl ClockDevice for SimDevice {
    type Error = SimError;

    fn now(&self) -> Result<Time, Self::Error> {
        self.check()?;
        let mut state = self.state.borrow_mut();
        let half = Duration::from_nanos(state.read_step.nanos() / 2);
        state.time += half;
        let now = state.time;
        let rest = state.read_step - half;
        state.time += rest;
        Ok(now)
    }

    fn frequency(&self) -> Result<f64, Self::Error> {
        self.check()?;
        Ok(self.state.borrow().frequency)
    }

    fn set_frequency(&mut self, ppb: f64) -> Result<(), Self::Error> {
        self.check()?;
        let mut state = self.state.borrow_mut();
        state.frequency = ppb;
        state.frequency_writes += 1;
        Ok(())
    }

    fn step_clock(&mut self, offset: Duration) -> Result<(), Self::Error> {
        self.check()?;
        let mut state = self.state.borrow_mut();
        state.phase += offset.nanos() as f64;
        state.time += offset;
        state.steps.push(offset);
        Ok(())
    }

    fn max_frequency(&self) -> Result<f64, Self::Error> {
        Ok(500_000.0)
    }
}

impl ExtTsDevice for SimDevice {
    fn pin_count(&self) -> Result<u32, Self::Error> {
        Ok(self.state.borrow().pins)
    }

    fn set_pin_function(&mut self, pin: u32, channel: u32) -> Result<(), Self::Error> {
        self.check()?;
        self.state.borrow_mut().pin_functions.insert(pin, channel);
        Ok(())
    }

    fn enable_extts(&mut self, channel: u32, polarity: EdgePolarity) -> Result<(), Self::Error> {
        self.check()?;
        self.state.borrow_mut().enabled.insert(channel, polarity);
        Ok(())
    }

    fn disable_extts(&mut self, channel: u32) -> Result<(), Self::Error> {
        self.check()?;
        self.state.borrow_mut().enabled.remove(&channel);
        Ok(())
    }

    fn read_extts(&mut self) -> Result<Option<ExtTsEvent>, Self::Error> {
        self.check()?;
        Ok(self.state.borrow_mut().events.pop_front())
    }
}

/// Opens `/dev/ptpN` as the clock with index N, plus any registered aliases
#[derive(Debug, Default)]
pub struct SimOpener {
    aliases: BTreeMap<String, String>,
    clocks: BTreeMap<u32, Rc<RefCell<DeviceState>>>,
    handles: Rc<Cell<usize>>,
    opened: usize,
}

impl SimOpener {
    pub fn alias(&mut self, alias: &str, name: &str) {
        self.aliases.insert(alias.into(), name.into());
    }

    /// Number of handles that are currently open
    pub fn open_handles(&self) -> usize {
        self.handles.get()
    }

    /// Number of successful opens
    pub fn opened(&self) -> usize {
        self.opened
    }

    /// A view on the clock called `name`, if it was opened
    pub fn device(&self, name: &str) -> Option<SimDevice> {
        let index = self.index_of(name)?;
        Some(SimDevice {
            state: self.clocks.get(&index)?.clone(),
            _handle: None,
        })
    }

    fn index_of(&self, name: &str) -> Option<u32> {
        let name = self.aliases.get(name).map(String::as_str).unwrap_or(name);
        name.strip_prefix("/dev/ptp")?.parse().ok()
    }
}

impl ClockOpener for SimOpener {
    type Device = SimDevice;

    fn open(&mut self, name: &str) -> Result<(SimDevice, u32), SimError> {
        let index = self.index_of(name).ok_or(SimError("no such device"))?;
        let state = self
            .clocks
            .entry(index)
            .or_insert_with(|| {
                Rc::new(RefCell::new(DeviceState {
                    pins: 4,
                    ..Default::default()
                }))
            })
            .clone();

        self.handles.set(self.handles.get() + 1);
        self.opened += 1;

        Ok((
            SimDevice {
                state,
                _handle: Some(Rc::new(OpenHandle(self.handles.clone()))),
            },
            index,
        ))
    }
}

/// A servo that records its samples and always reports lock
#[derive(Debug, Default)]
pub struct SimServo {
    pub samples: Vec<i64>,
    pub resets: usize,
}

impl Servo for SimServo {
    fn sample(&mut self, offset: i64, _local_ts: i64, _weight: f64) -> (f64, ServoState) {
        self.samples.push(offset);
        (0.0, ServoState::Locked)
    }

    fn reset(&mut self) {
        self.resets += 1;
    }

    fn sync_interval(&self) -> f64 {
        1.0
    }

    fn set_sync_interval(&mut self, _interval: f64) {}
}

/// A system clock with a settable time. Clones share the same clock.
#[derive(Debug, Clone)]
pub struct SimSystemClock(Rc<Cell<Time>>);

impl SimSystemClock {
    pub fn new(time: Time) -> Self {
        Self(Rc::new(Cell::new(time)))
    }

    pub fn set(&self, time: Time) {
        self.0.set(time);
    }
}

impl SystemClock for SimSystemClock {
    fn now(&self) -> Time {
        self.0.get()
    }
}

/// Reports the sources whose devices have queued events. Scripted answers
/// take precedence.
#[derive(Debug, Default)]
pub struct SimPoller {
    devices: Vec<SimDevice>,
    script: VecDeque<Result<Vec<usize>, SimError>>,
    pub waits: usize,
}

impl SimPoller {
    pub fn new(devices: Vec<SimDevice>) -> Self {
        Self {
            devices,
            script: VecDeque::new(),
            waits: 0,
        }
    }

    pub fn script(&mut self, answer: Result<Vec<usize>, SimError>) {
        self.script.push_back(answer);
    }
}

impl EventPoller for SimPoller {
    type Error = SimError;

    async fn wait(&mut self, _timeout: core::time::Duration) -> Result<Vec<usize>, SimError> {
        self.waits += 1;

        if let Some(answer) = self.script.pop_front() {
            return answer;
        }

        Ok(self
            .devices
            .iter()
            .enumerate()
            .filter(|(_, device)| device.queued_events() > 0)
            .map(|(i, _)| i)
            .collect())
    }
}

#[derive(Debug, Default)]
struct BusState {
    /// bus clock minus reference, in nanoseconds
    offset: i64,
    read_delays: Vec<Duration>,
    reads: usize,
    ratio_writes: Vec<RatioRegister>,
    added_ticks: u64,
    ignore_writes: bool,
    failing: bool,
}

/// A clock behind a management bus, running in lockstep with `reference`
/// apart from a settable offset
#[derive(Debug)]
pub struct SimBus {
    reference: SimDevice,
    tick_ns: i64,
    state: RefCell<BusState>,
}

impl SimBus {
    pub fn new(reference: &SimDevice, tick_ns: i64) -> Self {
        Self {
            reference: SimDevice {
                state: reference.state.clone(),
                _handle: None,
            },
            tick_ns,
            state: RefCell::new(BusState::default()),
        }
    }

    pub fn set_offset(&self, offset: Duration) {
        self.state.borrow_mut().offset = offset.nanos();
    }

    /// Round trip times of consecutive reads, repeating
    pub fn set_read_delays(&self, delays: &[Duration]) {
        self.state.borrow_mut().read_delays = delays.to_vec();
    }

    pub fn set_ignore_writes(&self, ignore: bool) {
        self.state.borrow_mut().ignore_writes = ignore;
    }

    pub fn set_failing(&self, failing: bool) {
        self.state.borrow_mut().failing = failing;
    }

    pub fn ratio_writes(&self) -> Vec<RatioRegister> {
        self.state.borrow().ratio_writes.clone()
    }

    pub fn added_ticks(&self) -> u64 {
        self.state.borrow().added_ticks
    }

    fn reference_time(&self) -> i64 {
        self.reference.state.borrow().time.nanos()
    }

    fn advance_reference(&self, by: Duration) {
        self.reference.state.borrow_mut().time += by;
    }

    fn check(&self) -> Result<(), SimError> {
        if self.state.borrow().failing {
            Err(SimError("bus failure"))
        } else {
            Ok(())
        }
    }
}

impl ManagementBus for SimBus {
    type Error = SimError;

    fn write_ratio(&mut self, ratio: RatioRegister) -> Result<(), SimError> {
        self.check()?;
        self.state.borrow_mut().ratio_writes.push(ratio);
        Ok(())
    }

    fn read_counter(&mut self) -> Result<u64, SimError> {
        self.check()?;

        let delay = {
            let mut state = self.state.borrow_mut();
            let delay = if state.read_delays.is_empty() {
                Duration::ZERO
            } else {
                state.read_delays[state.reads % state.read_delays.len()]
            };
            state.reads += 1;
            delay
        };

        let half = Duration::from_nanos(delay.nanos() / 2);
        self.advance_reference(half);
        let now = self.reference_time() + self.state.borrow().offset;
        self.advance_reference(delay - half);

        Ok(now.max(0) as u64 / self.tick_ns as u64)
    }

    fn set_absolute_time(&mut self, ticks: u64) -> Result<(), SimError> {
        self.check()?;
        if !self.state.borrow().ignore_writes {
            let target = ticks as i64 * self.tick_ns;
            let reference = self.reference_time();
            self.state.borrow_mut().offset = target - reference;
        }
        Ok(())
    }

    fn add_time(&mut self, ticks: u64) -> Result<(), SimError> {
        self.check()?;
        let mut state = self.state.borrow_mut();
        state.added_ticks += ticks;
        if !state.ignore_writes {
            state.offset += ticks as i64 * self.tick_ns;
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_land_mid_step() {
        let device = SimDevice::new(0, 1);
        device.set_time(Time::from_secs_nanos(10, 0));
        device.set_read_step(Duration::from_nanos(101));

        assert_eq!(device.now().unwrap(), Time::from_secs_nanos(10, 50));
        assert_eq!(device.now().unwrap(), Time::from_secs_nanos(10, 151));
    }
}
