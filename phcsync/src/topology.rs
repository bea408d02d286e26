//! Selection of the source clock from the port states reported by a PTP
//! daemon.
//!
//! A PTP daemon running on the same machine knows which of its ports is
//! synchronized to the network. Every port is bound to a hardware clock; the
//! clock of the port in slave state is the natural source for all other
//! clocks.

use alloc::vec::Vec;

use crate::clock::ClockId;

/// State of a PTP port, numbered as in IEEE 1588
#[derive(
    Copy, Clone, Debug, PartialEq, Eq, Hash, num_enum::TryFromPrimitive, num_enum::IntoPrimitive,
)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
#[repr(u8)]
pub enum PortState {
    Initializing = 1,
    Faulty = 2,
    Disabled = 3,
    Listening = 4,
    PreMaster = 5,
    Master = 6,
    Passive = 7,
    Uncalibrated = 8,
    Slave = 9,
}

impl PortState {
    /// Collapse the state to the ones relevant for synchronization: slave,
    /// uncalibrated, master, pre-master and disabled.
    pub fn normalize(self) -> Self {
        match self {
            PortState::Slave
            | PortState::Uncalibrated
            | PortState::Master
            | PortState::PreMaster => self,
            _ => PortState::Disabled,
        }
    }

    fn precedence(self) -> u8 {
        self.normalize().into()
    }
}

/// What to do when there are clocks to synchronize but nothing to
/// synchronize them to
#[derive(Copy, Clone, Debug, Default, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
#[cfg_attr(feature = "serde", serde(rename_all = "kebab-case"))]
pub enum FallbackPolicy {
    /// Use the most recently added destination clock as the source until a
    /// port reaches slave state
    #[default]
    LastDestination,
    /// Wait without a source
    Disabled,
}

/// Why no source could be selected yet
#[derive(Copy, Clone, Debug, PartialEq, Eq)]
pub enum PostponeReason {
    /// More than one clock has a slave or uncalibrated port
    MultipleSources,
    /// The only candidate source is still calibrating
    SourceNotReady,
}

/// Outcome of a source selection
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Selection {
    /// `source` is the reference for all `destinations`
    Source {
        source: ClockId,
        destinations: Vec<ClockId>,
    },
    /// No real source exists, `source` stands in for one
    Fallback {
        source: ClockId,
        destinations: Vec<ClockId>,
    },
    /// Synchronization has to wait; destinations stay as they were
    Postponed(PostponeReason),
    /// There is nothing to synchronize
    Idle,
}

impl Selection {
    /// The selected source clock, if any
    pub fn source(&self) -> Option<ClockId> {
        match self {
            Selection::Source { source, .. } | Selection::Fallback { source, .. } => Some(*source),
            Selection::Postponed(_) | Selection::Idle => None,
        }
    }

    /// The selected destination clocks, if destinations changed
    pub fn destinations(&self) -> Option<&[ClockId]> {
        match self {
            Selection::Source { destinations, .. } | Selection::Fallback { destinations, .. } => {
                Some(destinations)
            }
            Selection::Postponed(_) | Selection::Idle => None,
        }
    }
}

#[derive(Copy, Clone, Debug)]
struct Port {
    number: u16,
    clock: ClockId,
    state: PortState,
}

/// Tracks the ports reported by a PTP daemon and elects the source clock
#[derive(Debug, Default)]
pub struct TopologySelector {
    ports: Vec<Port>,
    policy: FallbackPolicy,
    changed: bool,
}

impl TopologySelector {
    /// Create a selector without any ports
    pub fn new(policy: FallbackPolicy) -> Self {
        Self {
            ports: Vec::new(),
            policy,
            changed: false,
        }
    }

    /// Bind port `number` to `clock`. Adding a port that is already known
    /// only updates its state.
    pub fn add_port(&mut self, number: u16, clock: ClockId, state: PortState) {
        if self.port_state_changed(number, state) {
            return;
        }

        self.ports.push(Port {
            number,
            clock,
            state: state.normalize(),
        });
        self.changed = true;
    }

    /// Whether port `number` is known
    pub fn has_port(&self, number: u16) -> bool {
        self.ports.iter().any(|port| port.number == number)
    }

    /// The clocks ports are bound to, in the order they were first seen
    pub fn clocks(&self) -> Vec<ClockId> {
        let mut clocks = Vec::new();
        for port in &self.ports {
            if !clocks.contains(&port.clock) {
                clocks.push(port.clock);
            }
        }
        clocks
    }

    /// Record a new state for port `number`, returning `false` for unknown
    /// ports.
    pub fn port_state_changed(&mut self, number: u16, state: PortState) -> bool {
        let Some(port) = self.ports.iter_mut().find(|port| port.number == number) else {
            return false;
        };

        let state = state.normalize();
        if port.state != state {
            log::debug!("port {number} changed state to {state:?}");
            port.state = state;
            self.changed = true;
        }
        true
    }

    /// Whether port states changed since the last
    /// [`reconfigure`](Self::reconfigure)
    pub fn needs_reconfigure(&self) -> bool {
        self.changed
    }

    /// The state of `clock`: the highest precedence state over all of its
    /// ports, or `None` when no port is bound to it.
    pub fn aggregate(&self, clock: ClockId) -> Option<PortState> {
        self.ports
            .iter()
            .filter(|port| port.clock == clock)
            .map(|port| port.state)
            .max_by_key(|state| state.precedence())
    }

    /// Select source and destinations from `clocks`, given in creation order
    /// together with their aggregated states.
    ///
    /// This is a pure function of its input.
    pub fn select(&self, clocks: &[(ClockId, PortState)]) -> Selection {
        let mut source = None;
        let mut src_cnt = 0;
        let mut destinations = Vec::new();

        for &(clock, state) in clocks {
            match state.normalize() {
                PortState::Slave => {
                    source = Some(clock);
                    src_cnt += 1;
                }
                PortState::Uncalibrated => src_cnt += 1,
                PortState::Master | PortState::PreMaster => destinations.push(clock),
                _ => {}
            }
        }

        if src_cnt > 1 {
            log::info!("multiple source clocks available, postponing sync");
            return Selection::Postponed(PostponeReason::MultipleSources);
        }

        if let Some(source) = source {
            log::info!("selecting {source} as the source clock");
            return Selection::Source {
                source,
                destinations,
            };
        }

        if src_cnt > 0 {
            log::info!("source clock not ready, waiting");
            return Selection::Postponed(PostponeReason::SourceNotReady);
        }

        match (destinations.pop(), self.policy) {
            (Some(fallback), FallbackPolicy::LastDestination) => {
                log::info!("no source, selecting {fallback} as the default clock");
                Selection::Fallback {
                    source: fallback,
                    destinations,
                }
            }
            (Some(_), FallbackPolicy::Disabled) => {
                log::info!("no source clock, waiting");
                Selection::Idle
            }
            (None, _) => {
                log::info!("no clock ready, waiting");
                Selection::Idle
            }
        }
    }

    /// Aggregate the port states of all clocks bound to ports and select the
    /// source. Clears the change flag.
    pub fn reconfigure(&mut self) -> Selection {
        log::info!("reconfiguring after port state change");
        self.changed = false;

        let clocks: Vec<_> = self
            .clocks()
            .into_iter()
            .filter_map(|clock| Some((clock, self.aggregate(clock)?)))
            .collect();

        self.select(&clocks)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const A: ClockId = ClockId(0);
    const B: ClockId = ClockId(1);
    const C: ClockId = ClockId(2);

    #[test]
    fn normalization() {
        assert_eq!(PortState::Listening.normalize(), PortState::Disabled);
        assert_eq!(PortState::Faulty.normalize(), PortState::Disabled);
        assert_eq!(PortState::Passive.normalize(), PortState::Disabled);
        assert_eq!(PortState::PreMaster.normalize(), PortState::PreMaster);
        assert_eq!(PortState::try_from(9u8), Ok(PortState::Slave));
        assert!(PortState::try_from(10u8).is_err());
    }

    #[test]
    fn aggregation_takes_highest_precedence() {
        let mut selector = TopologySelector::default();
        selector.add_port(1, A, PortState::Master);
        selector.add_port(2, A, PortState::Uncalibrated);
        selector.add_port(3, A, PortState::Listening);
        selector.add_port(4, B, PortState::PreMaster);
        selector.add_port(5, B, PortState::Faulty);

        assert_eq!(selector.aggregate(A), Some(PortState::Uncalibrated));
        assert_eq!(selector.aggregate(B), Some(PortState::PreMaster));
        assert_eq!(selector.aggregate(C), None);

        selector.port_state_changed(2, PortState::Slave);
        assert_eq!(selector.aggregate(A), Some(PortState::Slave));
    }

    #[test]
    fn slave_clock_becomes_source() {
        let selector = TopologySelector::default();
        assert_eq!(
            selector.select(&[(A, PortState::Master), (B, PortState::Slave)]),
            Selection::Source {
                source: B,
                destinations: alloc::vec![A],
            }
        );
    }

    #[test]
    fn disabled_clocks_are_left_alone() {
        let selector = TopologySelector::default();
        let selection = selector.select(&[
            (A, PortState::Master),
            (B, PortState::Slave),
            (C, PortState::Disabled),
        ]);
        assert_eq!(selection.destinations(), Some(&[A][..]));
    }

    #[test]
    fn postponed_while_uncalibrated() {
        let selector = TopologySelector::default();
        assert_eq!(
            selector.select(&[(A, PortState::Uncalibrated), (B, PortState::Uncalibrated)]),
            Selection::Postponed(PostponeReason::MultipleSources)
        );
        assert_eq!(
            selector.select(&[(A, PortState::Uncalibrated), (B, PortState::Master)]),
            Selection::Postponed(PostponeReason::SourceNotReady)
        );
        assert_eq!(
            selector.select(&[(A, PortState::Slave), (B, PortState::Uncalibrated)]),
            Selection::Postponed(PostponeReason::MultipleSources)
        );
    }

    #[test]
    fn fallback_to_last_destination() {
        let selector = TopologySelector::default();
        assert_eq!(
            selector.select(&[
                (A, PortState::Master),
                (B, PortState::Disabled),
                (C, PortState::PreMaster)
            ]),
            Selection::Fallback {
                source: C,
                destinations: alloc::vec![A],
            }
        );

        let selector = TopologySelector::new(FallbackPolicy::Disabled);
        assert_eq!(
            selector.select(&[(A, PortState::Master)]),
            Selection::Idle
        );
    }

    #[test]
    fn nothing_to_do() {
        let selector = TopologySelector::default();
        assert_eq!(selector.select(&[]), Selection::Idle);
        assert_eq!(
            selector.select(&[(A, PortState::Disabled)]),
            Selection::Idle
        );
    }

    #[test]
    fn selection_is_idempotent() {
        let mut selector = TopologySelector::default();
        selector.add_port(1, A, PortState::Master);
        selector.add_port(2, B, PortState::Slave);
        assert!(selector.needs_reconfigure());

        let first = selector.reconfigure();
        assert!(!selector.needs_reconfigure());
        assert_eq!(selector.reconfigure(), first);
    }

    #[test]
    fn only_real_changes_flag_reconfiguration() {
        let mut selector = TopologySelector::default();
        selector.add_port(1, A, PortState::Master);
        selector.reconfigure();

        // listening normalizes to the same state as faulty
        selector.port_state_changed(1, PortState::Listening);
        assert!(selector.needs_reconfigure());
        selector.reconfigure();
        selector.port_state_changed(1, PortState::Faulty);
        assert!(!selector.needs_reconfigure());

        assert!(!selector.port_state_changed(7, PortState::Slave));
        assert!(!selector.has_port(7));
    }

    #[test]
    fn fallback_reverts_once_a_source_appears() {
        let mut selector = TopologySelector::default();
        selector.add_port(1, A, PortState::Master);
        selector.add_port(2, B, PortState::Master);
        assert_eq!(selector.reconfigure().source(), Some(B));

        selector.port_state_changed(1, PortState::Slave);
        assert_eq!(
            selector.reconfigure(),
            Selection::Source {
                source: A,
                destinations: alloc::vec![B],
            }
        );
    }
}
