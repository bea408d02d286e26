use alloc::{string::ToString, vec::Vec};

use super::{Clock, ClockDevice, ClockId, ClockOpener};
use crate::servo::Servo;

/// Errors from managing the clocks of a [`ClockRegistry`]
#[derive(Debug)]
#[cfg_attr(feature = "std", derive(thiserror::Error))]
pub enum RegistryError<E> {
    /// Opening or initializing the device failed
    #[cfg_attr(feature = "std", error("clock device error: {0:?}"))]
    Device(E),
    /// The clock still has a synchronization role
    #[cfg_attr(feature = "std", error("{0} is still in use"))]
    InUse(ClockId),
    /// No clock with this handle exists
    #[cfg_attr(feature = "std", error("{0} does not exist"))]
    Unknown(ClockId),
}

/// Owner of all hardware clocks, at most one per physical device
///
/// Clocks are addressed by [`ClockId`] handles that stay valid until the clock
/// is destroyed. Iteration visits clocks in the order they were created.
#[derive(Debug)]
pub struct ClockRegistry<D, S> {
    clocks: Vec<Option<Clock<D, S>>>,
}

impl<D, S> Default for ClockRegistry<D, S> {
    fn default() -> Self {
        Self { clocks: Vec::new() }
    }
}

impl<D: ClockDevice, S: Servo> ClockRegistry<D, S> {
    /// Create an empty registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Find the clock opened under `name`
    pub fn find_by_name(&self, name: &str) -> Option<ClockId> {
        self.iter()
            .find(|(_, clock)| clock.name() == name)
            .map(|(id, _)| id)
    }

    /// Find the clock with hardware index `index`
    pub fn find_by_index(&self, index: u32) -> Option<ClockId> {
        self.iter()
            .find(|(_, clock)| clock.index() == index)
            .map(|(id, _)| id)
    }

    /// Get the clock for `name`, opening it through `opener` if needed.
    ///
    /// When the name resolves to a physical clock that is already known under
    /// another name, the freshly opened handle is closed again and the
    /// existing clock is returned. Otherwise `make_servo` creates the servo of
    /// the new clock.
    pub fn get_or_create<O, F>(
        &mut self,
        opener: &mut O,
        name: &str,
        make_servo: F,
    ) -> Result<ClockId, RegistryError<D::Error>>
    where
        O: ClockOpener<Device = D>,
        F: FnOnce(&mut D) -> Result<S, D::Error>,
    {
        if let Some(id) = self.find_by_name(name) {
            return Ok(id);
        }

        let (mut device, index) = opener.open(name).map_err(RegistryError::Device)?;

        if let Some(id) = self.find_by_index(index) {
            // dropping the new handle closes it
            log::debug!("{name} has index {index} which is already known as {id}");
            return Ok(id);
        }

        let servo = make_servo(&mut device).map_err(RegistryError::Device)?;
        let id = ClockId(self.clocks.len());
        self.clocks
            .push(Some(Clock::new(name.to_string(), index, device, servo)));

        log::debug!("clock {name} has hardware index {index}");

        Ok(id)
    }

    /// Remove a clock, releasing its servo and device.
    ///
    /// Refuses clocks that are destinations or the current source.
    pub fn destroy(
        &mut self,
        id: ClockId,
        source: Option<ClockId>,
    ) -> Result<Clock<D, S>, RegistryError<D::Error>> {
        let clock = self.get(id).ok_or(RegistryError::Unknown(id))?;
        if clock.is_destination() || source == Some(id) {
            return Err(RegistryError::InUse(id));
        }

        self.clocks[id.0].take().ok_or(RegistryError::Unknown(id))
    }

    /// The clock behind `id`
    pub fn get(&self, id: ClockId) -> Option<&Clock<D, S>> {
        self.clocks.get(id.0).and_then(Option::as_ref)
    }

    /// The clock behind `id`, mutably
    pub fn get_mut(&mut self, id: ClockId) -> Option<&mut Clock<D, S>> {
        self.clocks.get_mut(id.0).and_then(Option::as_mut)
    }

    /// All clocks, in creation order
    pub fn iter(&self) -> impl Iterator<Item = (ClockId, &Clock<D, S>)> {
        self.clocks
            .iter()
            .enumerate()
            .filter_map(|(i, clock)| clock.as_ref().map(|clock| (ClockId(i), clock)))
    }

    /// All clocks, mutably, in creation order
    pub fn iter_mut(&mut self) -> impl Iterator<Item = (ClockId, &mut Clock<D, S>)> {
        self.clocks
            .iter_mut()
            .enumerate()
            .filter_map(|(i, clock)| clock.as_mut().map(|clock| (ClockId(i), clock)))
    }

    /// Handles of all clocks, in creation order
    pub fn ids(&self) -> Vec<ClockId> {
        self.iter().map(|(id, _)| id).collect()
    }

    /// Number of clocks
    pub fn len(&self) -> usize {
        self.iter().count()
    }

    /// Whether there are no clocks
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
