//! External timestamp events and their conversion into clock offsets
//!
//! A hardware clock with an external timestamp (extts) input latches its time
//! whenever an edge arrives on that input. With a 1-PPS signal on the input,
//! the latched times should lie exactly on the second of the reference.

mod source;

pub use source::ExternalTimestampSource;

use crate::{
    clock::ClockDevice,
    time::{Duration, Time, NANOS_PER_SECOND},
};

/// Which edges of the pulse generate events
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum EdgePolarity {
    #[default]
    Rising,
    Falling,
    Both,
}

impl EdgePolarity {
    /// Whether both edges generate events, in which case every event could be
    /// either the start or the end of the pulse
    pub fn is_both(self) -> bool {
        self == EdgePolarity::Both
    }
}

/// A timestamp latched by the hardware on an external edge
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct ExtTsEvent {
    /// Channel the edge was seen on
    pub channel: u32,
    /// Time of the hardware clock at the edge
    pub time: Time,
}

/// A hardware clock with external timestamp inputs
pub trait ExtTsDevice: ClockDevice {
    /// Number of programmable pins of the device
    fn pin_count(&self) -> Result<u32, Self::Error>;

    /// Assign `pin` to the external timestamp function on `channel`
    fn set_pin_function(&mut self, pin: u32, channel: u32) -> Result<(), Self::Error>;

    /// Start generating events for edges of `polarity` on `channel`
    fn enable_extts(&mut self, channel: u32, polarity: EdgePolarity) -> Result<(), Self::Error>;

    /// Stop generating events on `channel`
    fn disable_extts(&mut self, channel: u32) -> Result<(), Self::Error>;

    /// Read the next queued event, or `None` when the queue is empty. Must not
    /// block.
    fn read_extts(&mut self) -> Result<Option<ExtTsEvent>, Self::Error>;
}

/// Bounds of the sub-second part of the reference time in which events are
/// ambiguous when both edges are timestamped
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub struct IgnoreWindow {
    /// Lower bound in nanoseconds, exclusive
    pub lower: i64,
    /// Upper bound in nanoseconds, exclusive
    pub upper: i64,
}

impl IgnoreWindow {
    /// The window for a pulse that stays high for `width`: events further than
    /// half the width away from the second are the falling edge.
    pub fn from_pulse_width(width: Duration) -> Self {
        let half = width.nanos() / 2;
        Self {
            lower: half,
            upper: NANOS_PER_SECOND - half,
        }
    }

    /// Whether `subsec_nanos` lies strictly inside the window
    pub fn contains(&self, subsec_nanos: u32) -> bool {
        let nanos = subsec_nanos as i64;
        nanos > self.lower && nanos < self.upper
    }
}

/// Result of pairing an event with the reference
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum ExtTsOutcome {
    /// The event yields a sample
    Ok {
        /// Corrected local time minus the reference edge
        offset: Duration,
        /// Corrected local time of the event
        local: Time,
    },
    /// The event may belong to either edge of the pulse and has to be skipped
    Ignore,
}

/// Errors from reading external timestamp events
#[derive(Debug)]
#[cfg_attr(feature = "std", derive(thiserror::Error))]
pub enum ExtTsError<E> {
    /// The device reported a failure
    #[cfg_attr(feature = "std", error("extts device error: {0:?}"))]
    Device(E),
    /// The event arrived on a channel this source does not listen to
    #[cfg_attr(
        feature = "std",
        error("extts on unexpected channel {got}, expected {expected}")
    )]
    UnexpectedChannel { expected: u32, got: u32 },
    /// The device was readable but had no event queued
    #[cfg_attr(feature = "std", error("no extts event available"))]
    NoEvent,
}

/// Turn an event into an offset against the reference.
///
/// `reference` is the reference time at which the event is processed. With
/// both edges enabled, a reference time inside `window` means the event can
/// not be attributed to an edge and it is ignored. Otherwise the reference is
/// rounded to the nearest second, which is taken as the time of the edge.
///
/// # Example
/// ```
/// # use phcsync::extts::{extts_offset, EdgePolarity, ExtTsOutcome, IgnoreWindow};
/// # use phcsync::time::{Duration, Time};
/// let outcome = extts_offset(
///     Time::from_secs_nanos(41, 999_999_950),
///     Duration::ZERO,
///     Time::from_secs_nanos(42, 1_000),
///     EdgePolarity::Rising,
///     IgnoreWindow::from_pulse_width(Duration::from_millis(500)),
/// );
/// assert_eq!(
///     outcome,
///     ExtTsOutcome::Ok {
///         offset: Duration::from_nanos(-50),
///         local: Time::from_secs_nanos(41, 999_999_950),
///     }
/// );
/// ```
pub fn extts_offset(
    event: Time,
    correction: Duration,
    reference: Time,
    polarity: EdgePolarity,
    window: IgnoreWindow,
) -> ExtTsOutcome {
    if polarity.is_both() && window.contains(reference.subsec_nanos()) {
        return ExtTsOutcome::Ignore;
    }

    let local = event + correction;
    ExtTsOutcome::Ok {
        offset: local - reference.round_to_second(),
        local,
    }
}

/// Read and discard all events queued on `device`, returning how many were
/// dropped
pub fn drain_stale<D: ExtTsDevice>(device: &mut D, name: &str) -> Result<usize, D::Error> {
    let mut dropped = 0;
    while let Some(event) = device.read_extts()? {
        log::debug!(
            "{name} skip extts index {} at {}",
            event.channel,
            event.time
        );
        dropped += 1;
    }
    Ok(dropped)
}

#[cfg(test)]
mod tests {
    use super::*;

    const WINDOW: IgnoreWindow = IgnoreWindow {
        lower: 100,
        upper: 900,
    };

    #[test]
    fn ambiguous_edges_are_ignored() {
        let event = Time::from_secs_nanos(3, 0);

        assert_eq!(
            extts_offset(
                event,
                Duration::ZERO,
                Time::from_secs_nanos(3, 500),
                EdgePolarity::Both,
                WINDOW
            ),
            ExtTsOutcome::Ignore
        );
        assert!(matches!(
            extts_offset(
                event,
                Duration::ZERO,
                Time::from_secs_nanos(3, 50),
                EdgePolarity::Both,
                WINDOW
            ),
            ExtTsOutcome::Ok { .. }
        ));
    }

    #[test]
    fn window_bounds_are_exclusive() {
        assert!(!WINDOW.contains(100));
        assert!(WINDOW.contains(101));
        assert!(WINDOW.contains(899));
        assert!(!WINDOW.contains(900));
    }

    #[test]
    fn single_edge_is_never_ignored() {
        let outcome = extts_offset(
            Time::from_secs_nanos(3, 0),
            Duration::ZERO,
            Time::from_secs_nanos(3, 500),
            EdgePolarity::Rising,
            WINDOW,
        );
        assert!(matches!(outcome, ExtTsOutcome::Ok { .. }));
    }

    #[test]
    fn correction_and_rounding() {
        let outcome = extts_offset(
            Time::from_secs_nanos(9, 999_999_000),
            Duration::from_nanos(1_500),
            Time::from_secs_nanos(9, 700_000_000),
            EdgePolarity::Falling,
            WINDOW,
        );
        assert_eq!(
            outcome,
            ExtTsOutcome::Ok {
                offset: Duration::from_nanos(500),
                local: Time::from_secs_nanos(10, 500),
            }
        );
    }

    #[test]
    fn pulse_width_window() {
        let window = IgnoreWindow::from_pulse_width(Duration::from_millis(500));
        assert_eq!(window.lower, 250_000_000);
        assert_eq!(window.upper, 750_000_000);
    }
}
