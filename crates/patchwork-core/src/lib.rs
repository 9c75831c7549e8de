//! Step clock, action resolution, simulator, and persistence for Patchwork.
//!
//! This crate turns the world model of `patchwork-world` into a running
//! multi-agent simulation advanced in lockstep.
//!
//! # Modules
//!
//! - [`clock`] -- Monotonic step counter.
//! - [`config`] -- Configuration loading from YAML into typed structs.
//! - [`intent`] -- Agent intents and submission refusals.
//! - [`resolver`] -- Settles contested moves under the collision policy.
//! - [`simulator`] -- [`Simulator`]: agents, the step barrier, and
//!   notifications.
//! - [`persistence`] -- Snapshot files and agent indexes.
//! - [`behavior`] -- [`AgentBehavior`] trait, built-in behaviors, and
//!   [`BehaviorRegistry`].
//! - [`registry`] -- [`SimulatorRegistry`] arena.
//!
//! [`Simulator`]: simulator::Simulator
//! [`AgentBehavior`]: behavior::AgentBehavior
//! [`BehaviorRegistry`]: behavior::BehaviorRegistry
//! [`SimulatorRegistry`]: registry::SimulatorRegistry

pub mod behavior;
pub mod clock;
pub mod config;
pub mod error;
pub mod intent;
pub mod persistence;
pub mod registry;
pub mod resolver;
pub mod simulator;

#[cfg(test)]
mod testing;

pub use behavior::{AgentBehavior, BehaviorError, BehaviorRegistry, Patrol, Wanderer};
pub use config::{ConfigError, EngineConfig, SimulatorConfig};
pub use error::{AddAgentError, SimulatorError};
pub use intent::{ActionRejected, Intent};
pub use persistence::{PersistenceError, SimulatorSnapshot};
pub use registry::{SimulatorHandle, SimulatorRegistry};
pub use resolver::MoveOutcome;
pub use simulator::{Simulator, StepReport};
