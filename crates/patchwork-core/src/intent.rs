//! Agent intents and the reasons a submission can be refused.

use patchwork_types::RelativeDirection;
use serde::{Deserialize, Serialize};

/// What an agent wants to do in the current step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Intent {
    /// Move `steps` cells toward `direction`, relative to the current heading.
    Move {
        /// Direction relative to the agent's heading.
        direction: RelativeDirection,
        /// Number of cells, between one and the configured maximum.
        steps: u32,
    },
    /// Turn toward `direction` without moving.
    Turn {
        /// Direction relative to the agent's heading.
        direction: RelativeDirection,
    },
    /// Stay put.
    NoOp,
}

/// An intent waiting for the step to resolve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PendingIntent {
    /// The requested action (already converted to a no-op if ignored).
    pub intent: Intent,
    /// Arrival order within the step, starting at zero.
    pub arrival: u64,
}

/// Why an intent submission was refused.
///
/// Refusals are immediate; the agent keeps its slot in the current step and
/// may submit again.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, thiserror::Error)]
#[serde(rename_all = "snake_case")]
pub enum ActionRejected {
    /// No agent with this id exists.
    #[error("unknown agent")]
    UnknownAgent,
    /// The agent is inactive and does not take part in steps.
    #[error("agent is inactive")]
    Inactive,
    /// The agent already submitted an intent this step.
    #[error("agent already acted this step")]
    AlreadyActed,
    /// The configured policy disallows this direction.
    #[error("action disallowed by policy")]
    Disallowed,
    /// The move is zero cells or longer than `max_steps_per_movement`.
    #[error("invalid number of movement steps")]
    TooManySteps,
    /// No-ops are disabled in this simulator.
    #[error("no-op is not allowed")]
    NoOpDisallowed,
}
