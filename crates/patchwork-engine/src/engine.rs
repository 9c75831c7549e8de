//! Engine assembly: simulator, session server, and autosave.

use std::net::SocketAddr;
use std::path::PathBuf;

use patchwork_core::{EngineConfig, Simulator, SimulatorHandle, SimulatorRegistry};
use patchwork_session::{ClientDirectory, Server, ServerHandle};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::autosave;
use crate::error::EngineError;

/// A running engine.
#[derive(Debug)]
pub struct Engine {
    registry: SimulatorRegistry,
    handle: SimulatorHandle,
    clients: ClientDirectory,
    prefix: String,
    server: ServerHandle,
    stop_autosave: watch::Sender<bool>,
    autosave: Option<JoinHandle<()>>,
}

/// Build a fresh world, or restore the simulator and its client table when
/// `persistence.load_time` is set.
pub fn restore_world(config: &EngineConfig) -> Result<ClientDirectory, EngineError> {
    let permissions = config.server.default_permissions;
    let Some(time) = config.persistence.load_time else {
        let simulator = Simulator::new(config.simulator.clone())?;
        info!(seed = config.simulator.seed, "Fresh world created");
        return Ok(ClientDirectory::new(simulator, permissions));
    };
    let clients = ClientDirectory::load(&save_prefix(config), time, permissions)?;
    if clients.simulator().config() != &config.simulator {
        warn!(time, "Snapshot parameters differ from the config file; keeping the snapshot's");
    }
    Ok(clients)
}

fn save_prefix(config: &EngineConfig) -> String {
    config.persistence.save_path.to_string_lossy().into_owned()
}

impl Engine {
    /// Build or restore the world and start serving it.
    pub async fn start(config: &EngineConfig) -> Result<Self, EngineError> {
        let clients = restore_world(config)?;
        let prefix = save_prefix(config);

        let mut registry = SimulatorRegistry::new();
        let handle = registry.register(clients.simulator().clone());
        info!(
            %handle,
            time = clients.simulator().time(),
            agents = clients.simulator().agent_ids().len(),
            "Simulator registered"
        );

        let server = Server::serve(&config.server, clients.clone()).await?;
        let (stop_autosave, stop_rx) = watch::channel(false);
        let autosave = autosave::spawn(
            clients.clone(),
            prefix.clone(),
            config.persistence.save_frequency,
            stop_rx,
        );

        Ok(Self {
            registry,
            handle,
            clients,
            prefix,
            server,
            stop_autosave,
            autosave,
        })
    }

    /// Address clients connect to.
    pub const fn local_addr(&self) -> SocketAddr {
        self.server.local_addr()
    }

    /// The simulator being served, if still registered.
    pub fn simulator(&self) -> Option<&Simulator> {
        self.registry.get(self.handle)
    }

    /// Stop the server and autosave, then write a final snapshot.
    ///
    /// Returns the snapshot path, or `None` if the simulator was already
    /// deregistered.
    pub async fn shutdown(mut self) -> Result<Option<PathBuf>, EngineError> {
        self.server.shutdown().await;
        self.stop_autosave.send_replace(true);
        let stopped = match self.autosave.take() {
            Some(task) => task.await,
            None => Ok(()),
        };
        if let Err(e) = stopped {
            warn!(error = %e, "Autosave task failed");
        }
        let Some(simulator) = self.registry.deregister(self.handle) else {
            return Ok(None);
        };
        let path = autosave::save(&self.clients, &self.prefix).await?;
        info!(path = %path.display(), time = simulator.time(), "Final snapshot written");
        Ok(Some(path))
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::indexing_slicing,
    clippy::arithmetic_side_effects
)]
mod tests {
    use patchwork_session::Client;
    use patchwork_types::{ClientId, RelativeDirection};

    use super::*;

    fn config(dir: &std::path::Path, load_time: Option<u64>) -> EngineConfig {
        let load = load_time.map_or_else(String::new, |t| format!("  load_time: {t}\n"));
        let yaml = format!(
            r"
simulator:
  patch_size: 8
  mcmc_num_iter: 10
  seed: 3
  items:
    - name: banana
      scent: [1.0, 0.0, 0.0]
      color: [1.0, 1.0, 0.0]
      required_item_counts: [0]
      required_item_costs: [0]
      intensity: {{ fn: constant, args: [-1000.0] }}
      interactions: [{{ fn: zero }}]
server:
  port: 0
  num_workers: 2
persistence:
  save_path: {}/world_
  save_frequency: 0
{load}",
            dir.display()
        );
        EngineConfig::parse(&yaml).unwrap()
    }

    #[tokio::test]
    async fn shutdown_snapshot_restores_the_served_world() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::start(&config(dir.path(), None)).await.unwrap();

        let client = Client::connect(engine.local_addr(), None).await.unwrap();
        let agent = client.add_agent().await.unwrap();
        client
            .move_agent(agent.id, RelativeDirection::Forward, 1)
            .await
            .unwrap();
        client.wait_for_step(0).await.unwrap();
        drop(client);

        let path = engine.shutdown().await.unwrap().unwrap();
        assert!(path.ends_with("world_1"));

        let restored = restore_world(&config(dir.path(), Some(1))).unwrap();
        assert_eq!(restored.simulator().time(), 1);
        let states = restored.simulator().agent_states(&[agent.id]).unwrap();
        assert_eq!(states[0].position, agent.position + agent.direction.offset());
        let table = restored.snapshot();
        assert_eq!(table.clients.len(), 1);
        assert_eq!(table.clients[0].agents, vec![agent.id]);
    }

    #[tokio::test]
    async fn restarted_engine_hands_agents_back_to_their_client() {
        let dir = tempfile::tempdir().unwrap();
        let engine = Engine::start(&config(dir.path(), None)).await.unwrap();
        let client = Client::connect(engine.local_addr(), None).await.unwrap();
        let client_id = client.client_id();
        let agent = client.add_agent().await.unwrap();
        client.no_op(agent.id).await.unwrap();
        client.wait_for_step(0).await.unwrap();
        drop(client);
        engine.shutdown().await.unwrap().unwrap();

        let engine = Engine::start(&config(dir.path(), Some(1))).await.unwrap();
        let newcomer = Client::connect(engine.local_addr(), None).await.unwrap();
        assert_ne!(newcomer.client_id(), client_id);
        assert_eq!(newcomer.client_id(), ClientId(1));

        let resumed = Client::connect(engine.local_addr(), Some(client_id))
            .await
            .unwrap();
        assert_eq!(resumed.owned_agents(), vec![agent.id]);
        resumed
            .turn_agent(agent.id, RelativeDirection::Left)
            .await
            .unwrap();
        let step = tokio::time::timeout(std::time::Duration::from_secs(5), resumed.next_step())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(step.time, 2);
        engine.shutdown().await.unwrap();
    }

    #[test]
    fn missing_snapshots_are_fatal() {
        let dir = tempfile::tempdir().unwrap();
        let err = restore_world(&config(dir.path(), Some(9))).unwrap_err();
        assert!(matches!(err, EngineError::Persistence { .. }));
    }
}
