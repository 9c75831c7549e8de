//! Fixtures shared by unit tests.

#![allow(clippy::unwrap_used)]

use std::collections::BTreeMap;

use patchwork_types::{Item, Position};
use patchwork_world::{WorldSnapshot, WorldStore};

use crate::config::SimulatorConfig;
use crate::simulator::{Simulator, StepState, item_table, world_settings};

/// Banana, onion (blocks movement) and jellybean (costs one banana).
/// Intensities are so low that sampling never places anything.
pub(crate) const EMPTY_WORLD: &str = r"
patch_size: 16
vision_range: 5
mcmc_num_iter: 50
items:
  - name: banana
    scent: [1.0, 0.0, 0.0]
    color: [1.0, 1.0, 0.0]
    required_item_counts: [0, 0, 0]
    required_item_costs: [0, 0, 0]
    intensity: { fn: constant, args: [-1000.0] }
    interactions: [{ fn: zero }, { fn: zero }, { fn: zero }]
  - name: onion
    scent: [0.0, 1.0, 0.0]
    color: [1.0, 0.0, 1.0]
    required_item_counts: [0, 0, 0]
    required_item_costs: [0, 0, 0]
    blocks_movement: true
    intensity: { fn: constant, args: [-1000.0] }
    interactions: [{ fn: zero }, { fn: zero }, { fn: zero }]
  - name: jellybean
    scent: [0.0, 0.0, 1.0]
    color: [0.0, 1.0, 1.0]
    required_item_counts: [1, 0, 0]
    required_item_costs: [1, 0, 0]
    intensity: { fn: constant, args: [-1000.0] }
    interactions: [{ fn: zero }, { fn: zero }, { fn: zero }]
";

pub(crate) fn empty_config() -> SimulatorConfig {
    serde_yml::from_str(EMPTY_WORLD).unwrap()
}

/// A simulator whose world starts with exactly `items`.
pub(crate) fn simulator_with_items(config: SimulatorConfig, items: Vec<Item>) -> Simulator {
    let mut patches: BTreeMap<Position, Vec<Item>> = BTreeMap::new();
    for item in items {
        patches
            .entry(item.position.patch_coordinate(config.patch_size))
            .or_default()
            .push(item);
    }
    let snapshot = WorldSnapshot {
        patches: patches.into_iter().collect(),
        rng_word_pos: 0,
    };
    let world = WorldStore::restore(item_table(&config).unwrap(), world_settings(&config), snapshot)
        .unwrap();
    Simulator::from_parts(config, world, StepState::default())
}
