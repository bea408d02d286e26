//! phcsync is a library for synchronizing one or more PTP hardware clocks
//! (PHCs) to an external time reference. The reference can be a 1-PPS edge
//! detector, another PHC emitting a periodic output, or a clock that a PTP
//! daemon is keeping in sync with the network.
//!
//! # Building blocks
//! * [`time::TimeBase`] turns a free-running, wrapping cycle counter into a
//!   continuous nanosecond timeline.
//! * [`ratio::RatioRegister`] encodes a frequency ratio into the 32-bit
//!   fixed-point layout of a hardware rate register.
//! * [`servo::PiServo`] turns measured offsets into frequency corrections and
//!   reports a lock state.
//! * [`clock::ClockRegistry`] owns the hardware clocks, one per physical
//!   device, each with its own servo.
//! * [`extts`] converts external timestamp events into offsets, filtering
//!   events that could belong to either edge of a pulse.
//! * [`topology::TopologySelector`] elects the source clock from the port
//!   states reported by a PTP daemon.
//! * [`sync::SyncOrchestrator`] ties all of this together into the per-cycle
//!   control loop, and [`sync::ratio::RatioSync`] handles clocks that can
//!   only be steered through a slow management bus.
//!
//! # Device interfaces
//! This crate does not talk to hardware itself. The
//! [`clock::ClockDevice`], [`extts::ExtTsDevice`], [`sync::EventPoller`],
//! [`reference::SystemClock`] and [`sync::ratio::ManagementBus`] traits
//! describe what the platform needs to provide. On Linux, the
//! `phcsync-linux` crate provides ready to use implementations.

#![no_std]

extern crate alloc;

#[cfg(feature = "std")]
extern crate std;

pub mod clock;
pub mod config;
pub mod extts;
pub mod ratio;
pub mod reference;
pub mod servo;
pub mod sync;
pub mod time;
pub mod topology;

#[cfg(test)]
pub(crate) mod sim;

pub use clock::{ClockDevice, ClockId, ClockRegistry};
pub use ratio::RatioRegister;
pub use servo::{PiServo, Servo, ServoState};
pub use sync::SyncOrchestrator;
