//! Entity structs exchanged between the world, the resolver and clients.

use serde::{Deserialize, Serialize};

use crate::ids::AgentId;
use crate::position::{Direction, Position};

/// One item instance placed on the grid.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Item {
    /// Index into the simulator's item type table.
    pub item_type: usize,
    /// Cell the item occupies.
    pub position: Position,
    /// Step at which the item appeared. Generated items use `0`, meaning
    /// they have always existed.
    pub created_at: u64,
    /// Step at which the item was collected. A collected item lingers as a
    /// tombstone until its scent has fully decayed.
    pub deleted_at: Option<u64>,
}

impl Item {
    /// A freshly generated item that has always existed.
    pub const fn generated(item_type: usize, position: Position) -> Self {
        Self {
            item_type,
            position,
            created_at: 0,
            deleted_at: None,
        }
    }

    /// True while the item has not been collected.
    pub const fn is_live(&self) -> bool {
        self.deleted_at.is_none()
    }
}

/// Everything an agent observes about itself after a step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    /// The agent's identifier.
    pub id: AgentId,
    /// Current cell.
    pub position: Position,
    /// Current heading.
    pub direction: Direction,
    /// Scent vector read at the current cell.
    pub scent: Vec<f32>,
    /// Row-major `(2R+1) x (2R+1) x V` color window in the agent frame.
    /// Row `R + f` holds cells `f` steps ahead; column `R + r` holds cells
    /// `r` steps to the right.
    pub vision: Vec<f32>,
    /// Units of each item type collected so far, net of costs.
    pub collected: Vec<u32>,
    /// Whether the agent currently participates in the step barrier.
    pub active: bool,
}

/// A rendered view of one patch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PatchState {
    /// Patch coordinate (cell coordinate floor-divided by the patch size).
    pub coordinate: Position,
    /// Whether the patch has been sampled and frozen.
    pub fixed: bool,
    /// Live items inside the patch.
    pub items: Vec<Item>,
    /// Position and heading of each agent inside the patch.
    pub agents: Vec<(Position, Direction)>,
    /// Optional row-major `n x n x S` scent grid, rows by increasing `y`.
    pub scent: Option<Vec<f32>>,
    /// Optional row-major `n x n x V` color grid, rows by increasing `y`.
    pub vision: Option<Vec<f32>>,
}
