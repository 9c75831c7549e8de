//! Shared type definitions for the Patchwork simulation.
//!
//! This crate is the single source of truth for the plain data that flows
//! between the world store, the action resolver, the session protocol and
//! persisted snapshots. Nothing here owns behavior beyond small geometric
//! helpers.
//!
//! # Modules
//!
//! - [`ids`] -- Monotonic integer identifiers for agents and clients
//! - [`position`] -- Grid positions, absolute and relative directions
//! - [`enums`] -- Action and movement-conflict policies
//! - [`items`] -- Item type descriptions and energy function specs
//! - [`structs`] -- Item instances, agent observations, patch views
//! - [`permissions`] -- Per-client capability set

pub mod enums;
pub mod ids;
pub mod items;
pub mod permissions;
pub mod position;
pub mod structs;

// Re-export all public types at crate root for convenience.
pub use enums::{ActionPolicy, MovementConflictPolicy};
pub use ids::{AgentId, ClientId};
pub use items::{IntensityKind, IntensitySpec, InteractionKind, InteractionSpec, ItemType};
pub use permissions::Permissions;
pub use position::{Direction, Position, RelativeDirection};
pub use structs::{AgentState, Item, PatchState};
