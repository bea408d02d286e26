//! Configuration structures for the synchronization process

use alloc::string::String;

use crate::{extts::EdgePolarity, time::Duration, topology::FallbackPolicy};

/// Settings of the per-cycle synchronization loop
#[derive(Debug, Copy, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(
    feature = "serde",
    serde(rename_all = "kebab-case", deny_unknown_fields)
)]
pub struct SyncConfig {
    /// Weight of each sample in the integral term of the servo
    #[cfg_attr(feature = "serde", serde(default = "default_sample_weight"))]
    pub sample_weight: f64,
    /// Only measure and report offsets, never adjust the clocks
    #[cfg_attr(feature = "serde", serde(default))]
    pub free_running: bool,
    /// How long to wait for edge events before giving up on a cycle
    /// (milliseconds)
    #[cfg_attr(feature = "serde", serde(default = "default_poll_timeout_ms"))]
    pub poll_timeout_ms: u64,
    /// Phase of the periodic output of a hardware clock reference relative to
    /// the second (nanoseconds)
    #[cfg_attr(feature = "serde", serde(default))]
    pub perout_phase: i64,
    /// Behaviour when no port is synchronized to the network
    #[cfg_attr(feature = "serde", serde(default))]
    pub fallback: FallbackPolicy,
}

impl SyncConfig {
    /// The bounded wait for events
    pub fn poll_timeout(&self) -> core::time::Duration {
        core::time::Duration::from_millis(self.poll_timeout_ms)
    }

    /// Phase of the reference pulse train
    pub fn perout_phase(&self) -> Duration {
        Duration::from_nanos(self.perout_phase)
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self {
            sample_weight: default_sample_weight(),
            free_running: false,
            poll_timeout_ms: default_poll_timeout_ms(),
            perout_phase: 0,
            fallback: FallbackPolicy::default(),
        }
    }
}

fn default_sample_weight() -> f64 {
    1.0
}

fn default_poll_timeout_ms() -> u64 {
    2_000
}

/// An external timestamp input receiving the pulse signal
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(
    feature = "serde",
    serde(rename_all = "kebab-case", deny_unknown_fields)
)]
pub struct SourceConfig {
    /// Clock device or network interface name
    pub device: String,
    /// Pin the signal is connected to
    #[cfg_attr(feature = "serde", serde(default))]
    pub pin_index: u32,
    /// External timestamp channel the pin is routed to
    #[cfg_attr(feature = "serde", serde(default))]
    pub channel: u32,
    /// Edges to timestamp
    #[cfg_attr(feature = "serde", serde(default))]
    pub polarity: EdgePolarity,
    /// Added to every timestamp, to compensate for cable and input delays
    /// (nanoseconds)
    #[cfg_attr(feature = "serde", serde(default))]
    pub correction: i64,
    /// Time the pulse stays high (nanoseconds)
    #[cfg_attr(feature = "serde", serde(default = "default_pulse_width"))]
    pub pulse_width: i64,
}

impl SourceConfig {
    /// A source on channel 0 of `device` with default settings
    pub fn new(device: impl Into<String>) -> Self {
        Self {
            device: device.into(),
            pin_index: 0,
            channel: 0,
            polarity: EdgePolarity::default(),
            correction: 0,
            pulse_width: default_pulse_width(),
        }
    }
}

fn default_pulse_width() -> i64 {
    500_000_000
}
