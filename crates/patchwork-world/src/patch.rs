//! One fixed tile of the infinite grid.

use patchwork_types::{Item, Position};
use serde::{Deserialize, Serialize};

/// A materialized patch.
///
/// Patches enter the world store only after sampling, so every stored patch
/// is fixed. The scent cache is derived data and is rebuilt on demand after
/// a restore.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Patch {
    /// Items inside the patch, including tombstones not yet purged.
    pub items: Vec<Item>,
    /// Set once sampling finished; a fixed patch is never resampled.
    pub fixed: bool,
    /// Row-major `n x n x S` steady-state scent from the static items of this
    /// patch and its eight neighbors.
    #[serde(skip)]
    pub scent_cache: Option<Vec<f32>>,
}

impl Patch {
    /// A fixed patch holding `items`.
    pub const fn fixed(items: Vec<Item>) -> Self {
        Self {
            items,
            fixed: true,
            scent_cache: None,
        }
    }

    /// The live item at `position`, if any.
    pub fn live_item_at(&self, position: Position) -> Option<&Item> {
        self.items
            .iter()
            .find(|item| item.position == position && item.is_live())
    }

    /// Iterate items that have not been collected.
    pub fn live_items(&self) -> impl Iterator<Item = &Item> {
        self.items.iter().filter(|item| item.is_live())
    }
}
