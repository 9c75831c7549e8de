//! Agent sessions: behaviors driving agents through a [`WorldApi`].

use std::collections::BTreeMap;
use std::time::Duration;

use futures::future::join_all;
use patchwork_core::persistence::{
    PersistenceError, agent_info_path, agent_state_path, read_agent_info, write_agent_info,
    write_atomically,
};
use patchwork_core::{AgentBehavior, BehaviorError, BehaviorRegistry, Intent};
use patchwork_types::AgentId;
use tracing::{debug, info, warn};

use crate::api::{ApiError, WorldApi};

/// Errors raised while running an agent session.
#[derive(Debug, thiserror::Error)]
pub enum SessionError {
    /// A world call failed.
    #[error(transparent)]
    Api(#[from] ApiError),

    /// A behavior could not be created or restored.
    #[error(transparent)]
    Behavior(#[from] BehaviorError),

    /// Reading or writing agent files failed.
    #[error(transparent)]
    Persistence(#[from] PersistenceError),

    /// An agent file does not hold valid JSON.
    #[error("malformed agent file for agent {agent_id}: {source}")]
    AgentFile {
        /// The agent whose file is malformed.
        agent_id: AgentId,
        /// The underlying JSON error.
        source: serde_json::Error,
    },

    /// Spawning kept hitting an occupied spawn cell.
    #[error("spawn cell still occupied after {attempts} attempts")]
    SpawnRetriesExhausted {
        /// Attempts made.
        attempts: u32,
    },
}

/// A set of agents, each driven by its own behavior.
pub struct AgentSession<W> {
    world: W,
    agents: BTreeMap<AgentId, Box<dyn AgentBehavior>>,
    spawn_attempts: u32,
    retry_delay: Duration,
}

impl<W> std::fmt::Debug for AgentSession<W> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AgentSession")
            .field("agents", &self.agents.keys().collect::<Vec<_>>())
            .finish_non_exhaustive()
    }
}

impl<W: WorldApi> AgentSession<W> {
    /// A session with no agents.
    pub const fn new(world: W) -> Self {
        Self {
            world,
            agents: BTreeMap::new(),
            spawn_attempts: 100,
            retry_delay: Duration::from_millis(10),
        }
    }

    /// Change how often and how patiently occupied spawns are retried.
    #[must_use]
    pub const fn with_spawn_retry(mut self, attempts: u32, delay: Duration) -> Self {
        self.spawn_attempts = attempts;
        self.retry_delay = delay;
        self
    }

    /// The world this session talks to.
    pub const fn world(&self) -> &W {
        &self.world
    }

    /// Ids of the session's agents.
    pub fn agent_ids(&self) -> Vec<AgentId> {
        self.agents.keys().copied().collect()
    }

    /// Spawn an agent driven by `behavior`, retrying while the spawn cell is
    /// occupied.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::SpawnRetriesExhausted`] if the cell never
    /// frees up, or [`SessionError::Api`] for any other failure.
    pub async fn spawn(&mut self, behavior: Box<dyn AgentBehavior>) -> Result<AgentId, SessionError> {
        let attempts = self.spawn_attempts.max(1);
        for attempt in 1..=attempts {
            match self.world.add_agent().await {
                Ok(state) => {
                    debug!(agent_id = %state.id, kind = behavior.kind(), attempt, "Agent spawned");
                    self.agents.insert(state.id, behavior);
                    return Ok(state.id);
                }
                Err(e) if e.is_retryable() => tokio::time::sleep(self.retry_delay).await,
                Err(e) => return Err(e.into()),
            }
        }
        Err(SessionError::SpawnRetriesExhausted { attempts })
    }

    /// Remove an agent from the world and the session.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Api`] if the world refuses.
    pub async fn remove(&mut self, id: AgentId) -> Result<(), SessionError> {
        self.world.remove_agent(id).await?;
        self.agents.remove(&id);
        Ok(())
    }

    /// Drive every agent through one step and return the new time.
    ///
    /// Each behavior picks an intent from its agent's state; all intents are
    /// submitted together. A refused intent is replaced by a no-op so the
    /// barrier is not left waiting on this session.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Api`] if the world cannot be reached.
    pub async fn step(&mut self) -> Result<u64, SessionError> {
        let observed = self.world.time();
        let ids = self.agent_ids();
        if ids.is_empty() {
            return Ok(observed);
        }

        let states = self.world.agent_states(&ids).await?;
        let mut intents = Vec::with_capacity(states.len());
        for state in &states {
            if let Some(behavior) = self.agents.get_mut(&state.id) {
                intents.push((state.id, behavior.produce_intent(state)));
            }
        }

        let world = &self.world;
        let results = join_all(intents.iter().map(|(id, intent)| async move {
            match world.submit(*id, *intent).await {
                Err(e) if !matches!(intent, Intent::NoOp) && !e.is_retryable() => {
                    warn!(agent_id = %id, ?intent, status = ?e.status(), "Intent refused, passing instead");
                    world.submit(*id, Intent::NoOp).await
                }
                other => other,
            }
        }))
        .await;
        for ((id, _), result) in intents.iter().zip(results) {
            if let Err(e) = result {
                warn!(agent_id = %id, status = ?e.status(), "Agent did not act this step");
            }
        }

        let time = self.world.wait_for_step(observed).await?;
        let states = self.world.agent_states(&ids).await?;
        for state in &states {
            if let Some(behavior) = self.agents.get_mut(&state.id) {
                behavior.receive_observation(state);
            }
        }
        Ok(time)
    }

    /// Write the agent index and each behavior's state next to the world
    /// snapshot for `time`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError::Persistence`] if a file cannot be written.
    pub fn save(&self, prefix: &str, time: u64) -> Result<(), SessionError> {
        let index: Vec<(AgentId, String)> = self
            .agents
            .iter()
            .map(|(id, behavior)| (*id, behavior.kind().to_owned()))
            .collect();
        for (id, behavior) in &self.agents {
            let json = serde_json::to_vec(&behavior.save_state())
                .map_err(|source| SessionError::AgentFile { agent_id: *id, source })?;
            write_atomically(&agent_state_path(prefix, time, *id), &json)?;
        }
        write_agent_info(&agent_info_path(prefix, time), &index)?;
        info!(time, agents = index.len(), "Agent session saved");
        Ok(())
    }

    /// Rebuild a session saved with [`AgentSession::save`]. The agents must
    /// already exist in `world`, typically a simulator loaded from the
    /// snapshot taken at the same `time`.
    ///
    /// # Errors
    ///
    /// Returns [`SessionError`] if a file is missing or malformed, or a kind
    /// is not registered.
    pub fn load(
        world: W,
        prefix: &str,
        time: u64,
        registry: &BehaviorRegistry,
    ) -> Result<Self, SessionError> {
        let mut session = Self::new(world);
        for (id, kind) in read_agent_info(&agent_info_path(prefix, time))? {
            let path = agent_state_path(prefix, time, id);
            let bytes = std::fs::read(&path).map_err(|source| PersistenceError::Io {
                path: path.clone(),
                source,
            })?;
            let state: serde_json::Value = serde_json::from_slice(&bytes)
                .map_err(|source| SessionError::AgentFile { agent_id: id, source })?;
            session.agents.insert(id, registry.restore(&kind, state)?);
        }
        info!(time, agents = session.agents.len(), "Agent session loaded");
        Ok(session)
    }
}
