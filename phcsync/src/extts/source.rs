use alloc::string::String;

use super::{
    drain_stale, extts_offset, EdgePolarity, ExtTsDevice, ExtTsError, ExtTsEvent, ExtTsOutcome,
    IgnoreWindow,
};
use crate::{
    clock::ClockId,
    config::SourceConfig,
    time::{Duration, Time},
};

/// One edge-triggered input of a hardware clock
#[derive(Debug, Clone)]
pub struct ExternalTimestampSource {
    name: String,
    clock: ClockId,
    pin_index: u32,
    channel: u32,
    polarity: EdgePolarity,
    correction: Duration,
    window: IgnoreWindow,
}

impl ExternalTimestampSource {
    /// Describe the input configured by `config` on `clock`
    pub fn new(config: &SourceConfig, clock: ClockId) -> Self {
        Self {
            name: config.device.clone(),
            clock,
            pin_index: config.pin_index,
            channel: config.channel,
            polarity: config.polarity,
            correction: Duration::from_nanos(config.correction),
            window: IgnoreWindow::from_pulse_width(Duration::from_nanos(config.pulse_width)),
        }
    }

    /// The device name the source was configured with
    pub fn name(&self) -> &str {
        &self.name
    }

    /// The clock latching the events
    pub fn clock(&self) -> ClockId {
        self.clock
    }

    /// The extts channel of the input
    pub fn channel(&self) -> u32 {
        self.channel
    }

    /// Edges generating events
    pub fn polarity(&self) -> EdgePolarity {
        self.polarity
    }

    /// Route the pin to the input and make sure no events are pending from an
    /// earlier user of the device.
    pub fn setup<D: ExtTsDevice>(&self, device: &mut D) -> Result<(), D::Error> {
        if device.pin_count()? > 0 {
            device.set_pin_function(self.pin_index, self.channel)?;
        }

        if let Err(error) = device.disable_extts(self.channel) {
            log::error!("{}: disabling extts failed: {error:?}", self.name);
        }

        drain_stale(device, &self.name)?;
        Ok(())
    }

    /// Start timestamping edges, dropping anything that was queued before
    pub fn arm<D: ExtTsDevice>(&self, device: &mut D) -> Result<(), D::Error> {
        drain_stale(device, &self.name)?;
        device.enable_extts(self.channel, self.polarity)
    }

    /// Stop timestamping edges and drop what is still queued
    pub fn disarm<D: ExtTsDevice>(&self, device: &mut D) -> Result<(), D::Error> {
        device.disable_extts(self.channel)?;
        drain_stale(device, &self.name)?;
        Ok(())
    }

    /// Take the next event of this source's channel off the queue of
    /// `device`
    pub fn take_event<D: ExtTsDevice>(
        &self,
        device: &mut D,
    ) -> Result<ExtTsEvent, ExtTsError<D::Error>> {
        let event = device
            .read_extts()
            .map_err(ExtTsError::Device)?
            .ok_or(ExtTsError::NoEvent)?;

        if event.channel != self.channel {
            return Err(ExtTsError::UnexpectedChannel {
                expected: self.channel,
                got: event.channel,
            });
        }

        Ok(event)
    }

    /// Pair an event taken from this source with `reference`
    pub fn pair(&self, event: ExtTsEvent, reference: Time) -> ExtTsOutcome {
        let outcome = extts_offset(
            event.time,
            self.correction,
            reference,
            self.polarity,
            self.window,
        );

        if outcome == ExtTsOutcome::Ignore {
            log::debug!(
                "{} skip extts index {} at {} src {}",
                self.name,
                event.channel,
                event.time,
                reference
            );
        }

        outcome
    }

    /// Read the next event from `device` and pair it with `reference`
    pub fn read_event<D: ExtTsDevice>(
        &self,
        device: &mut D,
        reference: Time,
    ) -> Result<ExtTsOutcome, ExtTsError<D::Error>> {
        let event = self.take_event(device)?;
        Ok(self.pair(event, reference))
    }
}
