//! The procedurally generated world of the Patchwork simulation.
//!
//! The grid is unbounded and split into square patches that are sampled
//! lazily from a Markov random field, then frozen forever.
//!
//! # Modules
//!
//! - [`energy`] -- Typed intensity and interaction functions
//! - [`item_table`] -- Validated item catalog with compiled energy functions
//! - [`gibbs`] -- Gibbs sampler that fills a patch with items
//! - [`diffusion`] -- Precomputed scent diffusion kernel
//! - [`patch`] -- A fixed tile of items with its scent cache
//! - [`store`] -- All patches, the world's random stream, scent and map queries
//! - [`vision`] -- Egocentric color windows
//! - [`error`] -- Construction and lookup errors

pub mod diffusion;
pub mod energy;
pub mod error;
pub mod gibbs;
pub mod item_table;
pub mod patch;
pub mod store;
pub mod vision;

pub use diffusion::ScentModel;
pub use error::WorldError;
pub use item_table::ItemTable;
pub use patch::Patch;
pub use store::{AgentIndex, WorldSettings, WorldSnapshot, WorldStore};
pub use vision::{VisionParams, render_vision};
