/// Description of a free-running hardware cycle counter
///
/// A counter that is `bits` wide wraps around to zero after `mask` cycles.
/// Cycles are converted to nanoseconds as `(cycles * mult) >> shift`.
#[derive(Copy, Clone, Debug, PartialEq, Eq, Hash)]
pub struct CycleCounter {
    /// Mask covering the valid bits of a raw counter value
    pub mask: u64,
    /// Cycle to nanosecond multiplier
    pub mult: u32,
    /// Cycle to nanosecond shift
    pub shift: u32,
}

impl CycleCounter {
    /// Describe a counter that is `bits` wide
    ///
    /// # Example
    /// ```
    /// # use phcsync::time::CycleCounter;
    /// assert_eq!(CycleCounter::with_width(32, 1, 0).mask, 0xffff_ffff);
    /// ```
    pub const fn with_width(bits: u32, mult: u32, shift: u32) -> Self {
        let mask = if bits >= 64 {
            u64::MAX
        } else {
            (1u64 << bits) - 1
        };
        Self { mask, mult, shift }
    }

    fn fraction_mask(&self) -> u64 {
        if self.shift >= 64 {
            u64::MAX
        } else {
            (1u64 << self.shift) - 1
        }
    }

    /// Convert a cycle delta to nanoseconds, carrying the sub-nanosecond
    /// remainder in `frac` from one conversion to the next.
    fn cycles_to_nanos(&self, cycles: u64, frac: &mut u64) -> u64 {
        let scaled = cycles as u128 * self.mult as u128 + *frac as u128;
        *frac = scaled as u64 & self.fraction_mask();
        (scaled >> self.shift) as u64
    }

    /// Like [`Self::cycles_to_nanos`], but for a delta that lies before the
    /// point at which `frac` was captured.
    fn cycles_to_nanos_backwards(&self, cycles: u64, frac: u64) -> u64 {
        let scaled = (cycles as u128 * self.mult as u128).saturating_sub(frac as u128);
        (scaled >> self.shift) as u64
    }
}

/// Something that can be read as a raw cycle counter, such as the free
/// running counter of a switch or network controller
pub trait CycleSource {
    /// Error produced when reading the counter fails
    type Error: core::fmt::Debug;

    /// Read the current raw counter value
    fn read_cycles(&mut self) -> Result<u64, Self::Error>;
}

/// Wraparound safe translation from a [`CycleCounter`] into a continuous
/// nanosecond timeline.
///
/// The translation is correct as long as the counter does not wrap more than
/// once between two reads, that is as long as reads happen at least every
/// `mask / 2` cycles.
#[derive(Clone, Debug)]
pub struct TimeBase {
    counter: CycleCounter,
    cycle_last: u64,
    nsec: u64,
    frac: u64,
}

impl TimeBase {
    /// Start a new timeline at `initial_ns` for raw counter value
    /// `initial_cycle`.
    pub fn new(counter: CycleCounter, initial_cycle: u64, initial_ns: u64) -> Self {
        Self {
            counter,
            cycle_last: initial_cycle & counter.mask,
            nsec: initial_ns,
            frac: 0,
        }
    }

    /// Start a new timeline at `initial_ns`, taking the origin from the
    /// current value of `source`.
    pub fn from_source<S: CycleSource>(
        counter: CycleCounter,
        source: &mut S,
        initial_ns: u64,
    ) -> Result<Self, S::Error> {
        Ok(Self::new(counter, source.read_cycles()?, initial_ns))
    }

    /// The counter this timeline is based on
    pub fn counter(&self) -> CycleCounter {
        self.counter
    }

    /// Advance the timeline to the raw counter value `cycle_now`, returning
    /// the number of nanoseconds that passed since the previous read.
    ///
    /// A counter that wrapped around since the previous read yields the small
    /// forward delta, not a huge one. Callers that construct the time base
    /// from a value they did not read themselves should discard the first
    /// delta.
    pub fn read_delta(&mut self, cycle_now: u64) -> u64 {
        let cycle_delta = cycle_now.wrapping_sub(self.cycle_last) & self.counter.mask;
        let delta = self.counter.cycles_to_nanos(cycle_delta, &mut self.frac);

        self.cycle_last = cycle_now & self.counter.mask;
        self.nsec = self.nsec.wrapping_add(delta);

        delta
    }

    /// Advance the timeline to `cycle_now` and return the new time
    pub fn read(&mut self, cycle_now: u64) -> u64 {
        self.read_delta(cycle_now);
        self.nsec
    }

    /// Read `source` and advance the timeline to its value
    pub fn read_from<S: CycleSource>(&mut self, source: &mut S) -> Result<u64, S::Error> {
        let cycles = source.read_cycles()?;
        Ok(self.read(cycles))
    }

    /// The current time of the timeline: the initial time plus the sum of all
    /// deltas read so far
    pub fn now(&self) -> u64 {
        self.nsec
    }

    /// Convert a raw counter value, typically a hardware timestamp, to time
    /// on this timeline without advancing it.
    ///
    /// Values more than half the counter range ahead of the last read are
    /// interpreted as lying in the past, so timestamps latched slightly
    /// before the last live read convert correctly.
    pub fn cycle_to_time(&self, cycle_tstamp: u64) -> u64 {
        let mask = self.counter.mask;
        let delta = cycle_tstamp.wrapping_sub(self.cycle_last) & mask;

        if delta > mask / 2 {
            let delta = self.cycle_last.wrapping_sub(cycle_tstamp) & mask;
            self.nsec
                .wrapping_sub(self.counter.cycles_to_nanos_backwards(delta, self.frac))
        } else {
            let mut frac = self.frac;
            self.nsec
                .wrapping_add(self.counter.cycles_to_nanos(delta, &mut frac))
        }
    }
}
