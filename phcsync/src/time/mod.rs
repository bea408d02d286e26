//! Types that describe points in time ([`Time`]), durations between two
//! instants ([`Duration`]), and the translation of raw hardware cycle counts
//! into nanoseconds ([`TimeBase`]).
//!
//! Hardware clocks and external timestamp events report time with nanosecond
//! resolution, so both types are a plain count of nanoseconds.

mod counter;
mod duration;
mod instant;

pub use counter::{CycleCounter, CycleSource, TimeBase};
pub use duration::Duration;
pub use instant::Time;

/// Number of nanoseconds in one second
pub const NANOS_PER_SECOND: i64 = 1_000_000_000;
