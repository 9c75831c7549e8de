//! Networked access to a Patchwork simulator.
//!
//! # Modules
//!
//! - [`protocol`] -- Length-prefixed JSON frames and message types.
//! - [`server`] -- TCP server multiplexing clients onto one simulator, and
//!   the persisted client table.
//! - [`client`] -- Async client with step notifications.
//! - [`api`] -- [`WorldApi`], implemented by the local simulator and the
//!   remote client alike.
//! - [`session`] -- [`AgentSession`], which drives agents with behaviors.
//!
//! [`WorldApi`]: api::WorldApi
//! [`AgentSession`]: session::AgentSession

pub mod api;
pub mod client;
pub mod protocol;
pub mod server;
pub mod session;

pub use api::{ApiError, WorldApi};
pub use client::{Client, ClientError, StepNotification};
pub use protocol::{ProtocolError, Status};
pub use server::{
    ClientDirectory, ClientTableSnapshot, SavedClient, Server, ServerError, ServerHandle,
};
pub use session::{AgentSession, SessionError};
