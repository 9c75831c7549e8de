//! Owned registry of running simulators.
//!
//! Hosts that run several simulations (the engine, test harnesses) keep them
//! in a [`SimulatorRegistry`] and pass around opaque [`SimulatorHandle`]s.
//! Handles are never reused, so a handle to a deregistered simulator stays
//! dead even after new simulators are registered.

use std::collections::BTreeMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::simulator::Simulator;

/// Opaque reference to a registered simulator.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SimulatorHandle(u64);

impl SimulatorHandle {
    /// Return the inner integer value.
    pub const fn into_inner(self) -> u64 {
        self.0
    }
}

impl fmt::Display for SimulatorHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "sim-{}", self.0)
    }
}

/// Arena of simulators keyed by handle.
#[derive(Debug, Default)]
pub struct SimulatorRegistry {
    simulators: BTreeMap<SimulatorHandle, Simulator>,
    next: u64,
}

impl SimulatorRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a simulator and return its handle.
    pub fn register(&mut self, simulator: Simulator) -> SimulatorHandle {
        let handle = SimulatorHandle(self.next);
        self.next = self.next.saturating_add(1);
        self.simulators.insert(handle, simulator);
        debug!(%handle, "Simulator registered");
        handle
    }

    /// The simulator behind `handle`, if still registered.
    pub fn get(&self, handle: SimulatorHandle) -> Option<&Simulator> {
        self.simulators.get(&handle)
    }

    /// Remove and return the simulator behind `handle`.
    pub fn deregister(&mut self, handle: SimulatorHandle) -> Option<Simulator> {
        let removed = self.simulators.remove(&handle);
        if removed.is_some() {
            debug!(%handle, "Simulator deregistered");
        }
        removed
    }

    /// Number of registered simulators.
    pub fn len(&self) -> usize {
        self.simulators.len()
    }

    /// Whether no simulator is registered.
    pub fn is_empty(&self) -> bool {
        self.simulators.is_empty()
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::testing::empty_config;

    #[test]
    fn handles_are_never_reused() {
        let mut registry = SimulatorRegistry::new();
        let first = registry.register(Simulator::new(empty_config()).unwrap());
        assert!(registry.deregister(first).is_some());
        let second = registry.register(Simulator::new(empty_config()).unwrap());
        assert_ne!(first, second);
        assert!(registry.get(first).is_none());
        assert!(registry.get(second).is_some());
        assert!(registry.deregister(first).is_none());
        assert_eq!(registry.len(), 1);
    }

    #[test]
    fn registered_simulators_are_independent() {
        let mut registry = SimulatorRegistry::new();
        let a = registry.register(Simulator::new(empty_config()).unwrap());
        let b = registry.register(Simulator::new(empty_config()).unwrap());
        let (id, _) = registry.get(a).unwrap().add_agent().unwrap();
        registry.get(a).unwrap().no_op(id).unwrap();
        assert_eq!(registry.get(a).unwrap().time(), 1);
        assert_eq!(registry.get(b).unwrap().time(), 0);
        assert!(registry.get(b).unwrap().agent_ids().is_empty());
    }
}
