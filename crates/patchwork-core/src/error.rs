//! Error types for the simulator.
//!
//! Adding an agent has its own error type because one of its outcomes is
//! retryable; every other simulator failure is fatal for the operation.

use patchwork_types::AgentId;
use patchwork_world::WorldError;

use crate::clock::ClockError;
use crate::config::ConfigError;

/// Errors raised by simulator construction and queries.
#[derive(Debug, thiserror::Error)]
pub enum SimulatorError {
    /// The configuration is invalid.
    #[error("configuration error: {source}")]
    Config {
        /// The underlying config error.
        #[from]
        source: ConfigError,
    },

    /// The world could not be built.
    #[error("world error: {source}")]
    World {
        /// The underlying world error.
        #[from]
        source: WorldError,
    },

    /// The step clock overflowed.
    #[error("clock error: {source}")]
    Clock {
        /// The underlying clock error.
        #[from]
        source: ClockError,
    },

    /// No agent with this id exists.
    #[error("unknown agent {0}")]
    UnknownAgent(AgentId),

    /// The agent id counter is exhausted.
    #[error("agent id space exhausted")]
    AgentIdsExhausted,
}

/// Why an agent could not be added.
#[derive(Debug, thiserror::Error)]
pub enum AddAgentError {
    /// Another agent stands on the spawn cell. Retry after it moves away.
    #[error("spawn cell {0} is occupied")]
    SpawnOccupied(patchwork_types::Position),

    /// The simulator cannot add agents at all.
    #[error(transparent)]
    Fatal(#[from] SimulatorError),
}

impl AddAgentError {
    /// Whether retrying later may succeed.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::SpawnOccupied(_))
    }
}
