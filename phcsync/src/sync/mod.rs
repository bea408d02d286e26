//! The per-cycle synchronization loop
//!
//! Every cycle the [`SyncOrchestrator`] waits until each external timestamp
//! source has seen an edge, pairs the events with the reference and feeds the
//! resulting offsets to the servos of the destination clocks.

pub mod ratio;

use alloc::{string::String, vec, vec::Vec};

use crate::{
    clock::{Clock, ClockDevice, ClockId, ClockOpener, ClockRegistry, RegistryError},
    config::{SourceConfig, SyncConfig},
    extts::{ExtTsDevice, ExtTsError, ExtTsOutcome, ExternalTimestampSource},
    reference::{Reference, ReferenceError, SystemClock},
    servo::{Servo, ServoState},
    time::{Duration, Time},
    topology::{PortState, Selection, TopologySelector},
};

/// Waits for external timestamp events of the sources of a
/// [`SyncOrchestrator`]
pub trait EventPoller {
    /// Error produced when waiting fails
    type Error: core::fmt::Debug;

    /// Wait at most `timeout` for events, returning the indices (in the order
    /// of [`SyncOrchestrator::sources`]) of all sources with pending events.
    /// An empty list means the wait timed out.
    async fn wait(&mut self, timeout: core::time::Duration) -> Result<Vec<usize>, Self::Error>;
}

/// How the event collection of a cycle ended
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PollOutcome {
    /// Every source produced an event
    Collected,
    /// Every source produced an event, but at least one could not be
    /// attributed to an edge. No corrections are made this cycle.
    Ambiguous,
    /// The wait timed out before every source produced an event
    Timeout,
}

/// The result of synchronizing one destination clock
#[derive(Clone, Debug, PartialEq)]
pub struct ClockReport {
    pub clock: ClockId,
    pub name: String,
    /// Clock time minus reference time
    pub offset: Duration,
    pub state: ServoState,
    /// Frequency written to the clock, in ppb, if any
    pub frequency: Option<f64>,
}

/// Errors of the synchronization loop
#[derive(Debug)]
#[cfg_attr(feature = "std", derive(thiserror::Error))]
pub enum SyncError<E> {
    #[cfg_attr(feature = "std", error("{0}"))]
    Registry(RegistryError<E>),
    #[cfg_attr(feature = "std", error("device error: {0:?}"))]
    Device(E),
    #[cfg_attr(feature = "std", error("waiting for events failed: {0:?}"))]
    Poll(E),
    #[cfg_attr(feature = "std", error("{0}"))]
    Reference(ReferenceError<E>),
    #[cfg_attr(feature = "std", error("{0} does not exist"))]
    UnknownClock(ClockId),
}

/// Drives the synchronization of all destination clocks to the reference
pub struct SyncOrchestrator<D, S, C, F> {
    config: SyncConfig,
    registry: ClockRegistry<D, S>,
    reference: Reference<C>,
    make_servo: F,
    sources: Vec<ExternalTimestampSource>,
    topology: Option<TopologySelector>,
    source_clock: Option<ClockId>,
}

impl<D, S, C, F> SyncOrchestrator<D, S, C, F>
where
    D: ExtTsDevice,
    S: Servo,
    C: SystemClock,
    F: FnMut(&mut D) -> Result<S, D::Error>,
{
    /// Create an orchestrator for the clocks in `registry`. `make_servo`
    /// creates the servo of every clock opened later on.
    pub fn new(
        config: SyncConfig,
        registry: ClockRegistry<D, S>,
        reference: Reference<C>,
        make_servo: F,
    ) -> Self {
        Self {
            config,
            registry,
            reference,
            make_servo,
            sources: Vec::new(),
            topology: None,
            source_clock: None,
        }
    }

    /// The clocks taking part in synchronization
    pub fn registry(&self) -> &ClockRegistry<D, S> {
        &self.registry
    }

    /// The external timestamp sources, in the order they were added
    pub fn sources(&self) -> &[ExternalTimestampSource] {
        &self.sources
    }

    /// The reference the edges are attributed to
    pub fn reference(&self) -> &Reference<C> {
        &self.reference
    }

    /// The clock currently selected as the source from the port states
    pub fn source_clock(&self) -> Option<ClockId> {
        self.source_clock
    }

    /// The device of the clock behind every source, in source order
    pub fn source_devices(&self) -> impl Iterator<Item = Option<&D>> {
        self.sources
            .iter()
            .map(|source| self.registry.get(source.clock()).map(Clock::device))
    }

    /// Get the clock with `name`, opening it if needed
    pub fn open_clock<O: ClockOpener<Device = D>>(
        &mut self,
        opener: &mut O,
        name: &str,
    ) -> Result<ClockId, SyncError<D::Error>> {
        let id = self
            .registry
            .get_or_create(opener, name, &mut self.make_servo)
            .map_err(SyncError::Registry)?;

        if let Some(clock) = self.registry.get_mut(id) {
            clock.free_running = self.config.free_running;
        }

        Ok(id)
    }

    /// Add an external timestamp source. The clock of the source becomes a
    /// destination. Adding a device a second time has no effect.
    pub fn add_source<O: ClockOpener<Device = D>>(
        &mut self,
        opener: &mut O,
        config: SourceConfig,
    ) -> Result<ClockId, SyncError<D::Error>> {
        if let Some(existing) = self.sources.iter().find(|s| s.name() == config.device) {
            log::debug!("source {} was already added", config.device);
            return Ok(existing.clock());
        }

        let clocks_before = self.registry.len();
        let id = self.open_clock(opener, &config.device)?;
        let source = ExternalTimestampSource::new(&config, id);

        let clock = self
            .registry
            .get_mut(id)
            .ok_or(SyncError::UnknownClock(id))?;

        if let Err(error) = source.setup(&mut clock.device) {
            log::error!("setting up extts on {} failed: {error:?}", config.device);
            if self.registry.len() > clocks_before {
                // the clock was only opened for this source
                if let Err(release) = self.registry.destroy(id, self.source_clock) {
                    log::warn!("releasing {} failed: {release:?}", config.device);
                }
            }
            return Err(SyncError::Device(error));
        }

        clock.is_destination = true;
        log::debug!("PHC source {} has index {}", config.device, clock.index());
        self.sources.push(source);

        Ok(id)
    }

    /// Bind port `number` of the PTP daemon, driven by the clock `device`,
    /// to the source selection.
    pub fn add_port<O: ClockOpener<Device = D>>(
        &mut self,
        opener: &mut O,
        number: u16,
        device: &str,
        state: PortState,
    ) -> Result<ClockId, SyncError<D::Error>> {
        let id = self.open_clock(opener, device)?;
        let fallback = self.config.fallback;
        self.topology
            .get_or_insert_with(|| TopologySelector::new(fallback))
            .add_port(number, id, state);
        Ok(id)
    }

    /// Record a port state change reported by the PTP daemon. Returns `false`
    /// for unknown ports.
    pub fn port_state_changed(&mut self, number: u16, state: PortState) -> bool {
        match self.topology.as_mut() {
            Some(topology) => topology.port_state_changed(number, state),
            None => false,
        }
    }

    /// Redo the source selection if port states changed since the last time
    pub fn reconfigure(&mut self) -> Option<Selection> {
        let topology = self.topology.as_mut()?;
        if !topology.needs_reconfigure() {
            return None;
        }

        let selection = topology.reconfigure();

        for (id, clock) in self.registry.iter_mut() {
            clock.state = topology.aggregate(id);
        }

        if let Some(destinations) = selection.destinations() {
            for id in destinations {
                if let Some(clock) = self.registry.get_mut(*id) {
                    if !clock.is_destination {
                        log::info!("selecting {} for synchronization", clock.name());
                        clock.is_destination = true;
                    }
                }
            }
        }

        self.source_clock = selection.source();
        if let Some(clock) = self.source_clock.and_then(|id| self.registry.get_mut(id)) {
            clock.is_destination = false;
        }

        Some(selection)
    }

    /// Start timestamping on all sources
    pub fn arm(&mut self) -> Result<(), SyncError<D::Error>> {
        for source in &self.sources {
            let clock = self
                .registry
                .get_mut(source.clock())
                .ok_or(SyncError::UnknownClock(source.clock()))?;
            source.arm(&mut clock.device).map_err(SyncError::Device)?;
        }
        Ok(())
    }

    fn flush_timestamps(&mut self) {
        for (_, clock) in self.registry.iter_mut() {
            clock.flush_timestamp();
        }
    }

    fn unlock_destinations(&mut self) {
        for (_, clock) in self.registry.iter_mut() {
            if clock.is_destination && clock.servo_state != ServoState::Unlocked {
                log::info!("{} lost its reference, unlocking", clock.name());
                clock.unlock();
            }
        }
    }

    fn handle_event(&mut self, index: usize) -> Result<ExtTsOutcome, ExtTsError<D::Error>> {
        let source = &self.sources[index];

        // the event is taken off the queue even when the reference can not be
        // read, otherwise it would be paired with the next edge
        let event = match self.registry.get_mut(source.clock()) {
            Some(clock) => source.take_event(&mut clock.device)?,
            None => return Ok(ExtTsOutcome::Ignore),
        };

        let reference = match self.reference.pps_time(&self.registry) {
            Ok(reference) => reference,
            Err(error) => {
                log::debug!("reference time not valid: {error:?}");
                return Ok(ExtTsOutcome::Ignore);
            }
        };

        let outcome = source.pair(event, reference);
        if let ExtTsOutcome::Ok { local, .. } = outcome {
            if let Some(clock) = self.registry.get_mut(source.clock()) {
                clock.add_timestamp(local);
            }
        }

        Ok(outcome)
    }

    /// Wait until every source has produced an event, stashing the timestamps
    /// on their clocks.
    ///
    /// Sources that report more than one event before the others caught up
    /// keep only the latest one. If any event of the cycle is ambiguous, the
    /// whole cycle is reported as [`PollOutcome::Ambiguous`] so events of
    /// different reference edges never mix.
    pub async fn poll<P>(&mut self, poller: &mut P) -> Result<PollOutcome, SyncError<D::Error>>
    where
        P: EventPoller<Error = D::Error>,
    {
        let timeout = self.config.poll_timeout();

        if self.sources.is_empty() {
            poller.wait(timeout).await.map_err(SyncError::Poll)?;
            return Ok(PollOutcome::Timeout);
        }

        let mut collected = vec![false; self.sources.len()];
        let mut ignore_any = false;

        while !collected.iter().all(|c| *c) {
            let ready = poller.wait(timeout).await.map_err(SyncError::Poll)?;

            if ready.is_empty() {
                log::debug!("poll returned no events");
                if !collected.iter().any(|c| *c) {
                    self.unlock_destinations();
                }
                return Ok(PollOutcome::Timeout);
            }

            for index in ready {
                if index >= self.sources.len() {
                    continue;
                }

                match self.handle_event(index) {
                    Ok(ExtTsOutcome::Ignore) => ignore_any = true,
                    Ok(ExtTsOutcome::Ok { .. }) => {}
                    Err(error) => {
                        log::error!(
                            "reading extts event of {} failed: {error:?}",
                            self.sources[index].name()
                        );
                    }
                }

                // also count ignored events, so events of the next edge do
                // not pile up behind them
                collected[index] = true;
            }
        }

        if ignore_any {
            Ok(PollOutcome::Ambiguous)
        } else {
            Ok(PollOutcome::Collected)
        }
    }

    /// Stash the approximated edge time on the reference clock, if the
    /// reference is a hardware clock.
    pub fn collect_reference(&mut self) -> Result<(), SyncError<D::Error>> {
        let Some(id) = self.reference.clock() else {
            return Ok(());
        };

        let edge = self
            .reference
            .approximate_edge(&self.registry, self.config.perout_phase())
            .map_err(SyncError::Reference)?;

        self.registry
            .get_mut(id)
            .ok_or(SyncError::UnknownClock(id))?
            .add_timestamp(edge);

        Ok(())
    }

    fn source_timestamp(&mut self) -> Option<Time> {
        if self.topology.is_none() {
            return match self
                .reference
                .approximate_edge(&self.registry, self.config.perout_phase())
            {
                Ok(ts) => Some(ts),
                Err(error) => {
                    log::error!("reference timestamp not valid: {error:?}");
                    None
                }
            };
        }

        let Some(id) = self.source_clock else {
            log::debug!("no source, skipping");
            return None;
        };

        let clock = self.registry.get_mut(id)?;
        let ts = clock.take_timestamp();
        if ts.is_none() {
            log::error!(
                "source clock ({}) timestamp not valid, skipping",
                clock.name()
            );
        }
        ts
    }

    /// Correct every destination clock that has a timestamp for this cycle
    pub fn synchronize(&mut self) -> Vec<ClockReport> {
        let Some(source_ts) = self.source_timestamp() else {
            return Vec::new();
        };

        let weight = self.config.sample_weight;
        let mut reports = Vec::new();

        for (id, clock) in self.registry.iter_mut() {
            if !clock.is_destination {
                continue;
            }

            let Some(ts) = clock.take_timestamp() else {
                log::debug!("{} timestamp not valid, skipping", clock.name());
                continue;
            };

            reports.push(synchronize_clock(id, clock, ts, source_ts, weight));
        }

        reports
    }

    /// Run one full cycle: redo the source selection if needed, wait for the
    /// events of the next edge and correct the clocks.
    pub async fn run_cycle<P>(
        &mut self,
        poller: &mut P,
    ) -> Result<Vec<ClockReport>, SyncError<D::Error>>
    where
        P: EventPoller<Error = D::Error>,
    {
        self.reconfigure();
        self.flush_timestamps();

        match self.poll(poller).await? {
            PollOutcome::Collected => {
                self.collect_reference()?;
                Ok(self.synchronize())
            }
            PollOutcome::Ambiguous | PollOutcome::Timeout => Ok(Vec::new()),
        }
    }

    /// Stop timestamping and release all clocks
    pub fn shutdown(mut self) {
        for source in &self.sources {
            if let Some(clock) = self.registry.get_mut(source.clock()) {
                if let Err(error) = source.disarm(&mut clock.device) {
                    log::error!("disarming {} failed: {error:?}", source.name());
                }
            }
        }

        self.source_clock = None;
        for id in self.registry.ids() {
            if let Some(clock) = self.registry.get_mut(id) {
                clock.is_destination = false;
            }
            if let Err(error) = self.registry.destroy(id, None) {
                log::error!("releasing {id} failed: {error:?}");
            }
        }
    }
}

fn synchronize_clock<D: ClockDevice, S: Servo>(
    id: ClockId,
    clock: &mut Clock<D, S>,
    ts: Time,
    source_ts: Time,
    weight: f64,
) -> ClockReport {
    let offset = ts - source_ts;
    clock.last_offset = Some(offset);

    let mut report = ClockReport {
        clock: id,
        name: clock.name().into(),
        offset,
        state: clock.servo_state,
        frequency: None,
    };

    if clock.free_running {
        log::info!("{} offset {:>10}", clock.name(), offset.nanos());
        return report;
    }

    let (adjustment, state) = clock.servo.sample(offset.nanos(), ts.nanos(), weight);
    clock.servo_state = state;
    report.state = state;

    let freq = clock.servo.frequency_ppb(adjustment);
    log::info!(
        "{} offset {:>10} s{} freq {:+7.0}",
        clock.name(),
        offset.nanos(),
        state.as_index(),
        freq
    );

    let result = match state {
        ServoState::Unlocked => return report,
        ServoState::Jump => clock
            .device
            .set_frequency(freq)
            .and_then(|()| clock.device.step_clock(-offset)),
        ServoState::Locked | ServoState::LockedStable => clock.device.set_frequency(freq),
    };

    match result {
        Ok(()) => {
            clock.last_frequency = Some(freq);
            report.frequency = Some(freq);
        }
        Err(error) => log::error!("adjusting {} failed: {error:?}", clock.name()),
    }

    report
}
