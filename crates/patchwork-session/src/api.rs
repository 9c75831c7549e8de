//! One async interface over a local simulator and a remote server.
//!
//! [`WorldApi`] is what agent code programs against. The in-process
//! [`Simulator`] runs its blocking calls on tokio's blocking pool; the
//! [`Client`] forwards them over the wire.

use std::future::Future;

use patchwork_core::{ActionRejected, AddAgentError, Intent, Simulator, SimulatorError};
use patchwork_types::{AgentId, AgentState};

use crate::client::{Client, ClientError};
use crate::protocol::Status;

/// Errors surfaced through [`WorldApi`].
#[derive(Debug, thiserror::Error)]
pub enum ApiError {
    /// A local agent could not be added.
    #[error(transparent)]
    AddAgent(#[from] AddAgentError),

    /// A local intent was refused.
    #[error(transparent)]
    Rejected(#[from] ActionRejected),

    /// A local simulator call failed.
    #[error(transparent)]
    Simulator(#[from] SimulatorError),

    /// A remote call failed.
    #[error(transparent)]
    Client(#[from] ClientError),

    /// A blocking call panicked or was cancelled.
    #[error("blocking task failed: {source}")]
    Join {
        /// The underlying join error.
        #[from]
        source: tokio::task::JoinError,
    },
}

impl ApiError {
    /// Whether retrying the same call later may succeed.
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::AddAgent(e) => e.is_retryable(),
            Self::Client(e) => e.is_retryable(),
            _ => false,
        }
    }

    /// The wire status equivalent of this error.
    pub fn status(&self) -> Status {
        match self {
            Self::AddAgent(e) => e.into(),
            Self::Rejected(r) => (*r).into(),
            Self::Simulator(e) => e.into(),
            Self::Client(ClientError::Status { status } | ClientError::Rejected { status }) => {
                *status
            }
            Self::Client(_) | Self::Join { .. } => Status::ServerError,
        }
    }
}

/// Operations agent code needs, wherever the world runs.
pub trait WorldApi: Send + Sync {
    /// Spawn an agent.
    fn add_agent(&self) -> impl Future<Output = Result<AgentState, ApiError>> + Send;

    /// Delete an agent.
    fn remove_agent(&self, id: AgentId) -> impl Future<Output = Result<(), ApiError>> + Send;

    /// Submit one intent for the current step.
    fn submit(&self, id: AgentId, intent: Intent) -> impl Future<Output = Result<(), ApiError>> + Send;

    /// Current states of the given agents.
    fn agent_states(
        &self,
        ids: &[AgentId],
    ) -> impl Future<Output = Result<Vec<AgentState>, ApiError>> + Send;

    /// Latest known time.
    fn time(&self) -> u64;

    /// Wait until the time passes `observed_time`; returns the new time.
    fn wait_for_step(&self, observed_time: u64) -> impl Future<Output = Result<u64, ApiError>> + Send;
}

impl WorldApi for Simulator {
    async fn add_agent(&self) -> Result<AgentState, ApiError> {
        let sim = self.clone();
        let (_, state) = tokio::task::spawn_blocking(move || sim.add_agent()).await??;
        Ok(state)
    }

    async fn remove_agent(&self, id: AgentId) -> Result<(), ApiError> {
        Self::remove_agent(self, id)?;
        Ok(())
    }

    async fn submit(&self, id: AgentId, intent: Intent) -> Result<(), ApiError> {
        // Completing the barrier resolves the step inside this call.
        let sim = self.clone();
        tokio::task::spawn_blocking(move || sim.submit_intent(id, intent)).await??;
        Ok(())
    }

    async fn agent_states(&self, ids: &[AgentId]) -> Result<Vec<AgentState>, ApiError> {
        Ok(Self::agent_states(self, ids)?)
    }

    fn time(&self) -> u64 {
        Self::time(self)
    }

    async fn wait_for_step(&self, observed_time: u64) -> Result<u64, ApiError> {
        let sim = self.clone();
        let timeout = self.config().step_timeout();
        let time =
            tokio::task::spawn_blocking(move || sim.wait_for_step(observed_time, timeout)).await??;
        Ok(time)
    }
}

impl WorldApi for Client {
    async fn add_agent(&self) -> Result<AgentState, ApiError> {
        Ok(Self::add_agent(self).await?)
    }

    async fn remove_agent(&self, id: AgentId) -> Result<(), ApiError> {
        Ok(Self::remove_agent(self, id).await?)
    }

    async fn submit(&self, id: AgentId, intent: Intent) -> Result<(), ApiError> {
        let sent = match intent {
            Intent::Move { direction, steps } => self.move_agent(id, direction, steps).await,
            Intent::Turn { direction } => self.turn_agent(id, direction).await,
            Intent::NoOp => self.no_op(id).await,
        };
        Ok(sent?)
    }

    async fn agent_states(&self, ids: &[AgentId]) -> Result<Vec<AgentState>, ApiError> {
        Ok(Self::agent_states(self, ids).await?)
    }

    fn time(&self) -> u64 {
        Self::time(self)
    }

    async fn wait_for_step(&self, observed_time: u64) -> Result<u64, ApiError> {
        Ok(Self::wait_for_step(self, observed_time).await?)
    }
}
