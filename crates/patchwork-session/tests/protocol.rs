//! Client and server talking over real sockets.

#![allow(clippy::unwrap_used, clippy::indexing_slicing)]

use std::time::Duration;

use patchwork_core::config::ServerConfig;
use patchwork_core::{Patrol, Simulator, SimulatorConfig};
use patchwork_session::{
    AgentSession, Client, ClientDirectory, ClientError, Server, ServerError, ServerHandle, Status,
};
use patchwork_types::{ClientId, Permissions, Position, RelativeDirection};

const WORLD: &str = r"
patch_size: 16
vision_range: 4
mcmc_num_iter: 20
items:
  - name: banana
    scent: [1.0, 0.0, 0.0]
    color: [1.0, 1.0, 0.0]
    required_item_counts: [0]
    required_item_costs: [0]
    intensity: { fn: constant, args: [-1000.0] }
    interactions: [{ fn: zero }]
";

fn world(step_timeout_ms: u64) -> Simulator {
    let mut config: SimulatorConfig = serde_yml::from_str(WORLD).unwrap();
    config.step_timeout_ms = step_timeout_ms;
    Simulator::new(config).unwrap()
}

fn server_config(permissions: Permissions) -> ServerConfig {
    ServerConfig {
        port: 0,
        conn_queue_capacity: 8,
        num_workers: 2,
        default_permissions: permissions,
        ..ServerConfig::default()
    }
}

async fn start(permissions: Permissions, step_timeout_ms: u64) -> (ServerHandle, Simulator) {
    let simulator = world(step_timeout_ms);
    let handle = Server::start(&server_config(permissions), simulator.clone())
        .await
        .unwrap();
    (handle, simulator)
}

fn denied(err: ClientError) -> bool {
    matches!(err, ClientError::Status { status: Status::PermissionDenied })
}

/// Poll `check` until it holds or two seconds pass.
async fn eventually(mut check: impl FnMut() -> bool) {
    for _ in 0..200 {
        if check() {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition never became true");
}

#[tokio::test]
async fn handshake_returns_config_and_fresh_identity() {
    let (server, _) = start(Permissions::grant_all(), 0).await;
    let first = Client::connect(server.local_addr(), None).await.unwrap();
    let second = Client::connect(server.local_addr(), None).await.unwrap();
    assert_ne!(first.client_id(), second.client_id());
    assert_eq!(first.config().patch_size, 16);
    assert_eq!(first.time(), 0);
    assert!(first.owned_agents().is_empty());
    server.shutdown().await;
}

#[tokio::test]
async fn moves_resolve_and_notify_the_owner() {
    let (server, simulator) = start(Permissions::grant_all(), 0).await;
    let client = Client::connect(server.local_addr(), None).await.unwrap();
    let agent = client.add_agent().await.unwrap();
    assert_eq!(agent.position, Position::ORIGIN);
    assert_eq!(client.owned_agents(), vec![agent.id]);

    let (step, moved) = tokio::join!(
        client.next_step(),
        client.move_agent(agent.id, RelativeDirection::Forward, 1)
    );
    moved.unwrap();
    let step = step.unwrap();
    assert_eq!(step.time, 1);
    assert_eq!(step.states.len(), 1);
    assert_eq!(step.states[0].position, Position::new(0, 1));
    assert_eq!(simulator.time(), 1);

    let err = client
        .move_agent(agent.id, RelativeDirection::Forward, 3)
        .await
        .unwrap_err();
    assert!(matches!(err, ClientError::Status { status: Status::ActionDisallowed }));
    server.shutdown().await;
}

#[tokio::test]
async fn acting_twice_in_one_step_is_refused() {
    let (server, _) = start(Permissions::grant_all(), 0).await;
    let owner = Client::connect(server.local_addr(), None).await.unwrap();
    let a = owner.add_agent().await.unwrap();
    owner.move_agent(a.id, RelativeDirection::Forward, 1).await.unwrap();
    owner.wait_for_step(0).await.unwrap();
    let b = owner.add_agent().await.unwrap();

    owner.no_op(a.id).await.unwrap();
    let err = owner.no_op(a.id).await.unwrap_err();
    assert!(matches!(err, ClientError::Status { status: Status::AgentAlreadyActed }));
    owner.turn_agent(b.id, RelativeDirection::Left).await.unwrap();
    assert_eq!(owner.wait_for_step(1).await.unwrap(), 2);
    server.shutdown().await;
}

#[tokio::test]
async fn clients_cannot_drive_foreign_agents() {
    let (server, _) = start(Permissions::grant_all(), 0).await;
    let owner = Client::connect(server.local_addr(), None).await.unwrap();
    let intruder = Client::connect(server.local_addr(), None).await.unwrap();
    let agent = owner.add_agent().await.unwrap();
    let err = intruder.no_op(agent.id).await.unwrap_err();
    assert!(matches!(err, ClientError::Status { status: Status::InvalidAgentId }));
    server.shutdown().await;
}

#[tokio::test]
async fn occupied_spawn_is_retryable() {
    let (server, _) = start(Permissions::grant_all(), 0).await;
    let client = Client::connect(server.local_addr(), None).await.unwrap();
    client.add_agent().await.unwrap();
    let err = client.add_agent().await.unwrap_err();
    assert!(err.is_retryable());
    server.shutdown().await;
}

#[tokio::test]
async fn permissions_are_enforced() {
    let permissions = Permissions {
        get_map: false,
        get_agent_ids: false,
        ..Permissions::grant_all()
    };
    let (server, _) = start(permissions, 0).await;
    let client = Client::connect(server.local_addr(), None).await.unwrap();
    assert!(denied(
        client
            .get_map(Position::ORIGIN, Position::ORIGIN, false, false)
            .await
            .unwrap_err()
    ));
    assert!(denied(client.agent_ids().await.unwrap_err()));
    // Reading one's own agents never needs extra permission.
    let agent = client.add_agent().await.unwrap();
    assert_eq!(client.agent_states(&[agent.id]).await.unwrap()[0].id, agent.id);
    server.shutdown().await;
}

#[tokio::test]
async fn permissions_change_per_client_at_runtime() {
    let (server, _) = start(Permissions::grant_all(), 0).await;
    let restricted = Client::connect(server.local_addr(), None).await.unwrap();
    let other = Client::connect(server.local_addr(), None).await.unwrap();
    let agent = restricted.add_agent().await.unwrap();

    let narrowed = Permissions {
        add_agent: false,
        set_active: false,
        get_map: false,
        ..Permissions::grant_all()
    };
    server.set_permissions(restricted.client_id(), narrowed).unwrap();
    assert_eq!(server.permissions(restricted.client_id()), Some(narrowed));

    assert!(denied(restricted.add_agent().await.unwrap_err()));
    assert!(denied(restricted.set_active(agent.id, false).await.unwrap_err()));
    assert!(denied(
        restricted
            .get_map(Position::ORIGIN, Position::ORIGIN, false, false)
            .await
            .unwrap_err()
    ));

    // Operations that stayed granted still work.
    assert_eq!(restricted.agent_ids().await.unwrap(), vec![agent.id]);
    assert!(restricted.is_active(agent.id).await.unwrap());
    restricted.no_op(agent.id).await.unwrap();
    assert_eq!(restricted.wait_for_step(0).await.unwrap(), 1);

    // Other clients keep the defaults.
    assert_eq!(server.permissions(other.client_id()), Some(Permissions::grant_all()));
    other
        .get_map(Position::ORIGIN, Position::ORIGIN, false, false)
        .await
        .unwrap();

    assert!(server.permissions(ClientId(99)).is_none());
    assert!(matches!(
        server.set_permissions(ClientId(99), Permissions::deny_all()),
        Err(ServerError::UnknownClient { client_id: ClientId(99) })
    ));
    server.shutdown().await;
}

#[tokio::test(flavor = "multi_thread", worker_threads = 2)]
async fn acting_then_waiting_sees_every_step() {
    let (server, _) = start(Permissions::grant_all(), 0).await;
    let client = Client::connect(server.local_addr(), None).await.unwrap();
    let agent = client.add_agent().await.unwrap();
    // The step may be announced before the action's reply arrives.
    for expected in 1..=20 {
        client.turn_agent(agent.id, RelativeDirection::Left).await.unwrap();
        let step = tokio::time::timeout(Duration::from_secs(2), client.next_step())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(step.time, expected);
    }
    server.shutdown().await;
}

#[tokio::test]
async fn restarted_server_returns_agents_to_their_client() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = format!("{}/world_", dir.path().display());
    let (server, _) = start(Permissions::grant_all(), 0).await;
    let client = Client::connect(server.local_addr(), None).await.unwrap();
    let client_id = client.client_id();
    let agent = client.add_agent().await.unwrap();
    client.no_op(agent.id).await.unwrap();
    client.wait_for_step(0).await.unwrap();
    let narrowed = Permissions {
        get_map: false,
        ..Permissions::grant_all()
    };
    server.set_permissions(client_id, narrowed).unwrap();
    server.clients().save(&prefix).unwrap();
    drop(client);
    server.shutdown().await;

    let restored = ClientDirectory::load(&prefix, 1, Permissions::grant_all()).unwrap();
    let simulator = restored.simulator().clone();
    let server = Server::serve(&server_config(Permissions::grant_all()), restored)
        .await
        .unwrap();
    // Nobody is connected, so the restored agent waits outside the barrier.
    assert!(!simulator.is_active(agent.id).unwrap());
    assert_eq!(server.permissions(client_id), Some(narrowed));

    let resumed = Client::connect(server.local_addr(), Some(client_id))
        .await
        .unwrap();
    assert_eq!(resumed.owned_agents(), vec![agent.id]);
    assert_eq!(resumed.time(), 1);
    assert!(simulator.is_active(agent.id).unwrap());
    resumed
        .turn_agent(agent.id, RelativeDirection::Right)
        .await
        .unwrap();
    let step = tokio::time::timeout(Duration::from_secs(5), resumed.next_step())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(step.time, 2);
    assert!(denied(
        resumed
            .get_map(Position::ORIGIN, Position::ORIGIN, false, false)
            .await
            .unwrap_err()
    ));

    let newcomer = Client::connect(server.local_addr(), None).await.unwrap();
    assert_ne!(newcomer.client_id(), client_id);
    server.shutdown().await;
}

#[tokio::test]
async fn restored_agents_without_an_owner_do_not_stall_steps() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = format!("{}/world_", dir.path().display());
    let simulator = world(0);
    let (orphan, _) = simulator.add_agent().unwrap();
    simulator
        .move_agent(orphan, RelativeDirection::Forward, 1)
        .unwrap();
    assert_eq!(simulator.time(), 1);
    // A bare simulator snapshot has no client table beside it.
    simulator.save(&prefix).unwrap();

    let restored = ClientDirectory::load(&prefix, 1, Permissions::grant_all()).unwrap();
    assert!(restored.snapshot().clients.is_empty());
    let server = Server::serve(&server_config(Permissions::grant_all()), restored)
        .await
        .unwrap();
    let client = Client::connect(server.local_addr(), None).await.unwrap();
    let agent = client.add_agent().await.unwrap();
    client.no_op(agent.id).await.unwrap();
    let step = tokio::time::timeout(Duration::from_secs(5), client.next_step())
        .await
        .unwrap()
        .unwrap();
    assert_eq!(step.time, 2);
    server.shutdown().await;
}

#[tokio::test]
async fn disconnect_deactivates_and_reconnect_restores() {
    let (server, simulator) = start(Permissions::grant_all(), 0).await;
    let first = Client::connect(server.local_addr(), None).await.unwrap();
    let a = first.add_agent().await.unwrap();
    first.move_agent(a.id, RelativeDirection::Forward, 1).await.unwrap();
    first.wait_for_step(0).await.unwrap();

    let other = Client::connect(server.local_addr(), None).await.unwrap();
    let b = other.add_agent().await.unwrap();

    let first_id = first.client_id();
    drop(first);
    eventually(|| !simulator.is_active(a.id).unwrap()).await;

    // The remaining agent steps alone.
    other.no_op(b.id).await.unwrap();
    assert_eq!(other.wait_for_step(1).await.unwrap(), 2);

    let resumed = Client::connect(server.local_addr(), Some(first_id)).await.unwrap();
    assert_eq!(resumed.client_id(), first_id);
    assert_eq!(resumed.owned_agents(), vec![a.id]);
    assert!(simulator.is_active(a.id).unwrap());
    assert_eq!(resumed.time(), 2);

    // A second connection cannot claim the same identity.
    let err = Client::connect(server.local_addr(), Some(first_id)).await.unwrap_err();
    assert!(matches!(err, ClientError::Rejected { status: Status::PermissionDenied }));
    server.shutdown().await;
}

#[tokio::test]
async fn removing_a_client_removes_its_agents() {
    let (server, simulator) = start(Permissions::grant_all(), 0).await;
    let client = Client::connect(server.local_addr(), None).await.unwrap();
    let agent = client.add_agent().await.unwrap();
    client.remove_client().await.unwrap();
    assert!(client.owned_agents().is_empty());
    assert!(simulator.agent_ids().is_empty());
    assert!(simulator.agent_states(&[agent.id]).is_err());
    server.shutdown().await;
}

#[tokio::test]
async fn watchdog_forces_stalled_steps() {
    let (server, _) = start(Permissions::grant_all(), 300).await;
    let client = Client::connect(server.local_addr(), None).await.unwrap();
    let a = client.add_agent().await.unwrap();
    client.move_agent(a.id, RelativeDirection::Forward, 1).await.unwrap();
    client.wait_for_step(0).await.unwrap();
    let b = client.add_agent().await.unwrap();

    // Only `a` acts; the watchdog fills in a no-op for `b`.
    client.turn_agent(a.id, RelativeDirection::Right).await.unwrap();
    let time = tokio::time::timeout(Duration::from_secs(5), client.wait_for_step(1))
        .await
        .unwrap()
        .unwrap();
    assert!(time >= 2);
    let states = client.agent_states(&[b.id]).await.unwrap();
    assert_eq!(states[0].position, Position::ORIGIN);
    server.shutdown().await;
}

#[tokio::test]
async fn shutdown_closes_connections() {
    let (server, _) = start(Permissions::grant_all(), 0).await;
    let client = Client::connect(server.local_addr(), None).await.unwrap();
    server.shutdown().await;
    tokio::time::timeout(Duration::from_secs(5), client.lost_connection())
        .await
        .unwrap();
    assert!(matches!(
        client.next_step().await,
        Err(ClientError::ConnectionLost)
    ));
}

#[tokio::test]
async fn agent_session_runs_over_the_wire() {
    let (server, simulator) = start(Permissions::grant_all(), 0).await;
    let client = Client::connect(server.local_addr(), None).await.unwrap();
    let mut session = AgentSession::new(client);
    session.spawn(Box::new(Patrol::new(3))).await.unwrap();
    session.step().await.unwrap();
    session.spawn(Box::new(Patrol::new(3))).await.unwrap();
    for _ in 0..6 {
        session.step().await.unwrap();
    }
    assert_eq!(simulator.time(), 7);
    assert_eq!(session.world().owned_agents().len(), 2);
    server.shutdown().await;
}
