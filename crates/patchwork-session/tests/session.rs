//! Agent sessions against an in-process simulator.

#![allow(clippy::unwrap_used)]

use patchwork_core::{BehaviorRegistry, Patrol, Simulator, SimulatorConfig, Wanderer};
use patchwork_session::{AgentSession, SessionError, WorldApi};

const WORLD: &str = r"
patch_size: 16
vision_range: 4
mcmc_num_iter: 50
seed: 5
items:
  - name: banana
    scent: [1.0, 0.0, 0.0]
    color: [1.0, 1.0, 0.0]
    required_item_counts: [0]
    required_item_costs: [0]
    intensity: { fn: constant, args: [-3.0] }
    interactions: [{ fn: piecewise_box, args: [4.0, 36.0, 0.0, -2.0] }]
";

fn simulator() -> Simulator {
    let config: SimulatorConfig = serde_yml::from_str(WORLD).unwrap();
    Simulator::new(config).unwrap()
}

async fn populated(sim: Simulator) -> AgentSession<Simulator> {
    let mut session = AgentSession::new(sim);
    // A patrol always steps off the spawn cell on its first move.
    session.spawn(Box::new(Patrol::new(2))).await.unwrap();
    session.step().await.unwrap();
    session.spawn(Box::new(Wanderer::new(9))).await.unwrap();
    session
}

#[tokio::test]
async fn each_step_advances_time_by_one() {
    let mut session = populated(simulator()).await;
    for expected in 2..12 {
        assert_eq!(session.step().await.unwrap(), expected);
    }
    assert_eq!(session.world().time(), 11);
    assert_eq!(session.agent_ids().len(), 2);
}

#[tokio::test]
async fn saved_sessions_resume_identically() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = format!("{}/run_", dir.path().display());

    let mut original = populated(simulator()).await;
    for _ in 0..4 {
        original.step().await.unwrap();
    }
    let time = original.world().time();
    original.world().save(&prefix).unwrap();
    original.save(&prefix, time).unwrap();

    let restored_world = Simulator::load(&prefix, time).unwrap();
    let registry = BehaviorRegistry::with_builtins();
    let mut restored = AgentSession::load(restored_world, &prefix, time, &registry).unwrap();
    assert_eq!(restored.agent_ids(), original.agent_ids());

    for _ in 0..8 {
        let a = original.step().await.unwrap();
        let b = restored.step().await.unwrap();
        assert_eq!(a, b);
    }
    let ids = original.agent_ids();
    let before = WorldApi::agent_states(original.world(), &ids).await.unwrap();
    let after = WorldApi::agent_states(restored.world(), &ids).await.unwrap();
    for (x, y) in before.iter().zip(&after) {
        assert_eq!(x.position, y.position);
        assert_eq!(x.direction, y.direction);
        assert_eq!(x.collected, y.collected);
    }
}

#[tokio::test]
async fn unknown_behavior_kinds_fail_to_load() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = format!("{}/run_", dir.path().display());
    let session = populated(simulator()).await;
    session.save(&prefix, 1).unwrap();

    let empty = BehaviorRegistry::new();
    let err = AgentSession::load(simulator(), &prefix, 1, &empty).unwrap_err();
    assert!(matches!(err, SessionError::Behavior(_)));
}

#[tokio::test]
async fn missing_agent_files_fail_to_load() {
    let dir = tempfile::tempdir().unwrap();
    let prefix = format!("{}/run_", dir.path().display());
    let registry = BehaviorRegistry::with_builtins();
    let err = AgentSession::load(simulator(), &prefix, 3, &registry).unwrap_err();
    assert!(matches!(err, SessionError::Persistence(_)));
}

#[tokio::test]
async fn spawn_gives_up_when_the_origin_stays_occupied() {
    let sim = simulator();
    sim.add_agent().unwrap();
    let mut session = AgentSession::new(sim)
        .with_spawn_retry(3, std::time::Duration::from_millis(1));
    let err = session.spawn(Box::new(Patrol::new(1))).await.unwrap_err();
    assert!(matches!(err, SessionError::SpawnRetriesExhausted { attempts: 3 }));
}
