//! The simulator: agents, the step barrier, and the world they share.
//!
//! A [`Simulator`] is a cheap, cloneable handle. Clones share one
//! simulation; separately constructed simulators share nothing.
//!
//! # Step lifecycle
//!
//! Each step collects at most one intent per active agent. The call that
//! delivers the last missing intent (or that deactivates or removes the
//! last agent being waited for) resolves the step before returning:
//! contested moves are settled, time advances by exactly one, moves and
//! turns apply, items are collected, observations are refreshed, and a
//! [`StepReport`] is published to subscribers.
//!
//! # Locking
//!
//! Agent state, pending intents and the clock sit behind one mutex; that
//! mutex is the step-wide critical section. The world store sits behind a
//! read-write lock taken after the mutex when both are needed. Map queries
//! over already generated patches only take the read lock.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::{
    Arc, Condvar, Mutex, MutexGuard, PoisonError, RwLock, RwLockReadGuard, RwLockWriteGuard,
};
use std::time::{Duration, Instant};

use patchwork_types::{AgentId, AgentState, Direction, PatchState, Position, RelativeDirection};
use patchwork_world::{
    AgentIndex, ItemTable, VisionParams, WorldSettings, WorldSnapshot, WorldStore, render_vision,
};
use serde::{Deserialize, Serialize};
use tokio::sync::broadcast;
use tracing::{debug, error, info, trace};

use crate::clock::StepClock;
use crate::config::SimulatorConfig;
use crate::error::{AddAgentError, SimulatorError};
use crate::intent::{ActionRejected, Intent, PendingIntent};
use crate::resolver::{MoveClaim, MoveOutcome, resolve_moves};

/// The spawn patch is sampled this many times longer than other patches.
const SPAWN_GENERATION_BOOST: u32 = 10;

/// Capacity of the step notification channel.
///
/// A subscriber that falls further behind receives `Lagged` and skips to
/// the newest report.
const STEP_CHANNEL_CAPACITY: usize = 256;

/// Everything that changed in one step.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StepReport {
    /// The new logical time.
    pub time: u64,
    /// What happened to each agent.
    pub outcomes: BTreeMap<AgentId, MoveOutcome>,
    /// Fresh state of every agent.
    pub states: BTreeMap<AgentId, AgentState>,
}

/// Mutable state guarded by the step-wide critical section.
#[derive(Debug, Clone, Default)]
pub(crate) struct StepState {
    pub(crate) clock: StepClock,
    pub(crate) agents: BTreeMap<AgentId, AgentState>,
    pub(crate) next_agent_id: AgentId,
    pub(crate) pending: BTreeMap<AgentId, PendingIntent>,
    pub(crate) arrivals: u64,
}

impl StepState {
    fn active_count(&self) -> usize {
        self.agents.values().filter(|a| a.active).count()
    }

    fn agent_index(&self) -> AgentIndex {
        self.agents
            .values()
            .map(|a| (a.position, a.direction))
            .collect()
    }
}

#[derive(Debug)]
struct Shared {
    config: SimulatorConfig,
    /// Cells around an agent that must be generated: vision and scent reach.
    reach: u32,
    state: Mutex<StepState>,
    world: RwLock<WorldStore>,
    stepped: Condvar,
    events: broadcast::Sender<Arc<StepReport>>,
}

/// Handle to one simulation.
#[derive(Debug, Clone)]
pub struct Simulator {
    shared: Arc<Shared>,
}

/// Translate the simulator configuration into world settings.
pub(crate) const fn world_settings(config: &SimulatorConfig) -> WorldSettings {
    WorldSettings {
        patch_size: config.patch_size,
        mcmc_iterations: config.mcmc_num_iter,
        decay: config.decay_param,
        diffusion: config.diffusion_param,
        deleted_item_lifetime: config.deleted_item_lifetime,
        seed: config.seed,
    }
}

/// Validate `config` and build its item table.
pub(crate) fn item_table(config: &SimulatorConfig) -> Result<ItemTable, SimulatorError> {
    config.validate()?;
    Ok(ItemTable::new(
        config.items.clone(),
        config.scent_dimension,
        config.color_dimension,
    )?)
}

impl Simulator {
    /// Build a simulator with an empty world at time zero.
    ///
    /// # Errors
    ///
    /// Returns [`SimulatorError::Config`] or [`SimulatorError::World`] when
    /// the configuration is invalid.
    pub fn new(config: SimulatorConfig) -> Result<Self, SimulatorError> {
        let table = item_table(&config)?;
        let world = WorldStore::new(table, world_settings(&config))?;
        info!(
            seed = config.seed,
            item_types = config.items.len(),
            patch_size = config.patch_size,
            policy = ?config.collision_policy,
            "Simulator created"
        );
        Ok(Self::from_parts(config, world, StepState::default()))
    }

    /// Assemble a simulator from restored parts.
    pub(crate) fn from_parts(config: SimulatorConfig, world: WorldStore, state: StepState) -> Self {
        let reach = config.vision_range.max(world.scent_model().radius());
        let (events, _) = broadcast::channel(STEP_CHANNEL_CAPACITY);
        Self {
            shared: Arc::new(Shared {
                config,
                reach,
                state: Mutex::new(state),
                world: RwLock::new(world),
                stepped: Condvar::new(),
                events,
            }),
        }
    }

    fn lock_state(&self) -> MutexGuard<'_, StepState> {
        self.shared
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn read_world(&self) -> RwLockReadGuard<'_, WorldStore> {
        self.shared
            .world
            .read()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn write_world(&self) -> RwLockWriteGuard<'_, WorldStore> {
        self.shared
            .world
            .write()
            .unwrap_or_else(PoisonError::into_inner)
    }

    /// The immutable configuration.
    pub fn config(&self) -> &SimulatorConfig {
        &self.shared.config
    }

    /// The current logical time.
    pub fn time(&self) -> u64 {
        self.lock_state().clock.time()
    }

    /// Subscribe to step reports.
    pub fn subscribe(&self) -> broadcast::Receiver<Arc<StepReport>> {
        self.shared.events.subscribe()
    }

    /// Spawn a new agent at the origin, facing up.
    ///
    /// # Errors
    ///
    /// Returns [`AddAgentError::SpawnOccupied`] (retryable) when another
    /// agent stands on the origin.
    pub fn add_agent(&self) -> Result<(AgentId, AgentState), AddAgentError> {
        let mut state = self.lock_state();
        let spawn = Position::ORIGIN;
        if state.agents.values().any(|a| a.position == spawn) {
            return Err(AddAgentError::SpawnOccupied(spawn));
        }
        let id = state.next_agent_id;
        state.next_agent_id = id.next().ok_or(SimulatorError::AgentIdsExhausted)?;

        let mut world = self.write_world();
        world.ensure_fixed_around(spawn, self.shared.reach, SPAWN_GENERATION_BOOST);
        let agent = AgentState {
            id,
            position: spawn,
            direction: Direction::Up,
            scent: Vec::new(),
            vision: Vec::new(),
            collected: vec![0; world.table().len()],
            active: true,
        };
        state.agents.insert(id, agent);

        let time = state.clock.time();
        let near = Some(spawn);
        refresh_observations(&mut world, &mut state.agents, &self.shared.config, time, near);
        let agent = state
            .agents
            .get(&id)
            .cloned()
            .ok_or(SimulatorError::UnknownAgent(id))?;
        info!(agent_id = %id, time, "Agent added");
        Ok((id, agent))
    }

    /// Remove an agent. Its pending intent is dropped, which may complete
    /// the current step.
    ///
    /// # Errors
    ///
    /// Returns [`SimulatorError::UnknownAgent`] if the agent does not exist.
    pub fn remove_agent(&self, id: AgentId) -> Result<AgentState, SimulatorError> {
        let mut state = self.lock_state();
        let removed = state
            .agents
            .remove(&id)
            .ok_or(SimulatorError::UnknownAgent(id))?;
        state.pending.remove(&id);
        info!(agent_id = %id, "Agent removed");
        self.step_if_ready(&mut state);
        Ok(removed)
    }

    /// Request a move of `steps` cells toward `direction`.
    ///
    /// Acceptance only means the intent is queued; whether the agent
    /// actually moves is reported in the step's [`StepReport::outcomes`].
    ///
    /// # Errors
    ///
    /// Returns an [`ActionRejected`] reason when the submission is refused.
    pub fn move_agent(
        &self,
        id: AgentId,
        direction: RelativeDirection,
        steps: u32,
    ) -> Result<(), ActionRejected> {
        self.submit(id, |config| {
            match config.movement_policy(direction) {
                patchwork_types::ActionPolicy::Disallowed => Err(ActionRejected::Disallowed),
                patchwork_types::ActionPolicy::Ignored => Ok(Intent::NoOp),
                patchwork_types::ActionPolicy::Allowed => {
                    if steps == 0 || steps > config.max_steps_per_movement {
                        Err(ActionRejected::TooManySteps)
                    } else {
                        Ok(Intent::Move { direction, steps })
                    }
                }
            }
        })
    }

    /// Request a turn toward `direction`.
    ///
    /// # Errors
    ///
    /// Returns an [`ActionRejected`] reason when the submission is refused.
    pub fn turn_agent(&self, id: AgentId, direction: RelativeDirection) -> Result<(), ActionRejected> {
        self.submit(id, |config| match config.turn_policy(direction) {
            patchwork_types::ActionPolicy::Disallowed => Err(ActionRejected::Disallowed),
            patchwork_types::ActionPolicy::Ignored => Ok(Intent::NoOp),
            patchwork_types::ActionPolicy::Allowed => Ok(Intent::Turn { direction }),
        })
    }

    /// Pass this step.
    ///
    /// # Errors
    ///
    /// Returns [`ActionRejected::NoOpDisallowed`] when no-ops are disabled,
    /// or another reason when the submission is refused.
    pub fn no_op(&self, id: AgentId) -> Result<(), ActionRejected> {
        self.submit(id, |config| {
            if config.no_op_allowed {
                Ok(Intent::NoOp)
            } else {
                Err(ActionRejected::NoOpDisallowed)
            }
        })
    }

    /// Submit any intent, applying the same policy checks as the dedicated
    /// methods.
    ///
    /// # Errors
    ///
    /// Returns an [`ActionRejected`] reason when the submission is refused.
    pub fn submit_intent(&self, id: AgentId, intent: Intent) -> Result<(), ActionRejected> {
        match intent {
            Intent::Move { direction, steps } => self.move_agent(id, direction, steps),
            Intent::Turn { direction } => self.turn_agent(id, direction),
            Intent::NoOp => self.no_op(id),
        }
    }

    fn submit(
        &self,
        id: AgentId,
        decide: impl FnOnce(&SimulatorConfig) -> Result<Intent, ActionRejected>,
    ) -> Result<(), ActionRejected> {
        let mut state = self.lock_state();
        let agent = state.agents.get(&id).ok_or(ActionRejected::UnknownAgent)?;
        if !agent.active {
            return Err(ActionRejected::Inactive);
        }
        if state.pending.contains_key(&id) {
            return Err(ActionRejected::AlreadyActed);
        }
        let intent = decide(&self.shared.config)?;
        let arrival = state.arrivals;
        state.arrivals = arrival.saturating_add(1);
        state.pending.insert(id, PendingIntent { intent, arrival });
        trace!(agent_id = %id, ?intent, arrival, "Intent accepted");
        self.step_if_ready(&mut state);
        Ok(())
    }

    /// Activate or deactivate an agent. Inactive agents stay in place and
    /// are not waited for; deactivating may complete the current step.
    ///
    /// # Errors
    ///
    /// Returns [`SimulatorError::UnknownAgent`] if the agent does not exist.
    pub fn set_active(&self, id: AgentId, active: bool) -> Result<(), SimulatorError> {
        let mut state = self.lock_state();
        let agent = state
            .agents
            .get_mut(&id)
            .ok_or(SimulatorError::UnknownAgent(id))?;
        if agent.active == active {
            return Ok(());
        }
        agent.active = active;
        debug!(agent_id = %id, active, "Agent activity changed");
        if !active {
            state.pending.remove(&id);
            self.step_if_ready(&mut state);
        }
        Ok(())
    }

    /// Take every agent out of the step barrier and discard queued intents.
    ///
    /// Unlike deactivating agents one at a time, this never resolves a step.
    /// Returns how many agents were active.
    pub fn deactivate_all(&self) -> usize {
        let mut state = self.lock_state();
        state.pending.clear();
        let mut released = 0_usize;
        for agent in state.agents.values_mut().filter(|a| a.active) {
            agent.active = false;
            released = released.saturating_add(1);
        }
        if released > 0 {
            debug!(released, "Every agent deactivated");
        }
        released
    }

    /// Whether the agent takes part in the step barrier.
    ///
    /// # Errors
    ///
    /// Returns [`SimulatorError::UnknownAgent`] if the agent does not exist.
    pub fn is_active(&self, id: AgentId) -> Result<bool, SimulatorError> {
        self.lock_state()
            .agents
            .get(&id)
            .map(|a| a.active)
            .ok_or(SimulatorError::UnknownAgent(id))
    }

    /// Whether the agent has already submitted an intent this step.
    pub fn has_acted(&self, id: AgentId) -> bool {
        self.lock_state().pending.contains_key(&id)
    }

    /// Ids of every agent, in increasing order.
    pub fn agent_ids(&self) -> Vec<AgentId> {
        self.lock_state().agents.keys().copied().collect()
    }

    /// Current state of each requested agent.
    ///
    /// # Errors
    ///
    /// Returns [`SimulatorError::UnknownAgent`] for the first unknown id.
    pub fn agent_states(&self, ids: &[AgentId]) -> Result<Vec<AgentState>, SimulatorError> {
        let state = self.lock_state();
        ids.iter()
            .map(|id| {
                state
                    .agents
                    .get(id)
                    .cloned()
                    .ok_or(SimulatorError::UnknownAgent(*id))
            })
            .collect()
    }

    /// Render every patch intersecting `[bottom_left, top_right]`,
    /// generating missing patches.
    pub fn get_map(
        &self,
        bottom_left: Position,
        top_right: Position,
        with_scent: bool,
        with_vision: bool,
    ) -> Vec<PatchState> {
        let (time, agents) = {
            let state = self.lock_state();
            (state.clock.time(), state.agent_index())
        };
        let color = &self.shared.config.agent_color;
        let fixed = self.read_world().map_fixed(
            bottom_left,
            top_right,
            time,
            &agents,
            color,
            with_scent,
            with_vision,
        );
        if let Some(patches) = fixed {
            return patches;
        }
        self.write_world().map(
            bottom_left,
            top_right,
            time,
            &agents,
            color,
            with_scent,
            with_vision,
        )
    }

    /// Block until the time passes `observed_time`.
    ///
    /// If `timeout` elapses first, every active agent that has not acted is
    /// treated as having submitted a no-op and the step resolves. Returns
    /// the time after waiting. `None` waits indefinitely.
    ///
    /// # Errors
    ///
    /// Returns [`SimulatorError::Clock`] if forcing the step overflows the clock.
    pub fn wait_for_step(
        &self,
        observed_time: u64,
        timeout: Option<Duration>,
    ) -> Result<u64, SimulatorError> {
        let deadline = timeout.and_then(|t| Instant::now().checked_add(t));
        let mut state = self.lock_state();
        loop {
            let time = state.clock.time();
            if time > observed_time {
                return Ok(time);
            }
            match deadline {
                None => {
                    state = self
                        .shared
                        .stepped
                        .wait(state)
                        .unwrap_or_else(PoisonError::into_inner);
                }
                Some(deadline) => {
                    let remaining = deadline.saturating_duration_since(Instant::now());
                    if remaining.is_zero() {
                        debug!(time, "Step timeout elapsed; forcing missing intents to no-ops");
                        self.force_locked(&mut state)?;
                        return Ok(state.clock.time());
                    }
                    let (guard, _) = self
                        .shared
                        .stepped
                        .wait_timeout(state, remaining)
                        .unwrap_or_else(PoisonError::into_inner);
                    state = guard;
                }
            }
        }
    }

    /// Resolve the current step now, treating missing intents as no-ops.
    ///
    /// Does nothing and returns `None` when no agent is active, so an
    /// abandoned world does not keep ticking.
    ///
    /// # Errors
    ///
    /// Returns [`SimulatorError::Clock`] if the clock overflows.
    pub fn force_step(&self) -> Result<Option<Arc<StepReport>>, SimulatorError> {
        let mut state = self.lock_state();
        self.force_locked(&mut state)
    }

    fn force_locked(&self, state: &mut StepState) -> Result<Option<Arc<StepReport>>, SimulatorError> {
        if state.active_count() == 0 {
            return Ok(None);
        }
        let missing: Vec<AgentId> = state
            .agents
            .values()
            .filter(|a| a.active && !state.pending.contains_key(&a.id))
            .map(|a| a.id)
            .collect();
        for id in missing {
            let arrival = state.arrivals;
            state.arrivals = arrival.saturating_add(1);
            state.pending.insert(
                id,
                PendingIntent {
                    intent: Intent::NoOp,
                    arrival,
                },
            );
        }
        self.resolve_step(state).map(Some)
    }

    /// Resolve the step if every active agent has acted.
    fn step_if_ready(&self, state: &mut StepState) {
        let active = state.active_count();
        if active == 0 || state.pending.len() < active {
            return;
        }
        if let Err(e) = self.resolve_step(state) {
            error!(error = %e, "Step resolution failed");
        }
    }

    fn resolve_step(&self, state: &mut StepState) -> Result<Arc<StepReport>, SimulatorError> {
        let config = &self.shared.config;
        let reach = self.shared.reach;
        let mut world = self.write_world();

        let mut claims = Vec::new();
        let mut stationary = BTreeSet::new();
        for (id, agent) in &state.agents {
            match state.pending.get(id) {
                Some(PendingIntent {
                    intent: Intent::Move { direction, steps },
                    arrival,
                }) if agent.active => {
                    let offset = agent
                        .direction
                        .rotate(direction.offset())
                        .scaled(i64::from(*steps));
                    let to = agent.position + offset;
                    world.ensure_fixed_around(to, 0, 1);
                    claims.push(MoveClaim {
                        agent_id: *id,
                        from: agent.position,
                        to,
                        arrival: *arrival,
                        blocked: world.is_blocked(to),
                    });
                }
                _ => {
                    stationary.insert(agent.position);
                }
            }
        }

        let moves = resolve_moves(&claims, &stationary, config.collision_policy, world.rng_mut());
        let time = state.clock.advance()?;

        let mut outcomes = BTreeMap::new();
        let mut moved = 0_usize;
        let mut collected = 0_usize;
        for (id, agent) in &mut state.agents {
            if let Some(PendingIntent {
                intent: Intent::Turn { direction },
                ..
            }) = state.pending.get(id)
            {
                agent.direction = agent.direction.turn(*direction);
            }
            let outcome = moves.get(id).copied().unwrap_or(MoveOutcome::Stayed);
            if outcome == MoveOutcome::Moved {
                if let Some(claim) = claims.iter().find(|c| c.agent_id == *id) {
                    agent.position = claim.to;
                    world.ensure_fixed_around(claim.to, reach, 1);
                    moved = moved.saturating_add(1);
                    if try_collect(&mut world, agent, time) {
                        collected = collected.saturating_add(1);
                    }
                }
            }
            outcomes.insert(*id, outcome);
        }
        state.pending.clear();
        state.arrivals = 0;

        let purged = world.purge_expired(time);
        refresh_observations(&mut world, &mut state.agents, config, time, None);
        drop(world);

        let report = Arc::new(StepReport {
            time,
            outcomes,
            states: state.agents.clone(),
        });
        debug!(time, agents = state.agents.len(), moved, collected, purged, "Step resolved");

        self.shared.stepped.notify_all();
        if self.shared.events.send(Arc::clone(&report)).is_err() {
            trace!(time, "No step subscribers");
        }
        Ok(report)
    }

    /// Capture the complete simulation state.
    pub(crate) fn capture(&self) -> (StepState, WorldSnapshot) {
        let state = self.lock_state();
        let world = self.read_world().snapshot();
        (state.clone(), world)
    }
}

/// Collect the item under `agent` if its requirements are met.
fn try_collect(world: &mut WorldStore, agent: &mut AgentState, time: u64) -> bool {
    let Some(item_type) = world.live_item_at(agent.position).map(|i| i.item_type) else {
        return false;
    };
    let Ok(kind) = world.table().get(item_type) else {
        return false;
    };
    let eligible = kind
        .required_item_counts
        .iter()
        .zip(&agent.collected)
        .all(|(need, have)| have >= need);
    if !eligible {
        return false;
    }
    let costs = kind.required_item_costs.clone();
    if world.collect_at(agent.position, time).is_none() {
        return false;
    }
    if let Some(count) = agent.collected.get_mut(item_type) {
        *count = count.saturating_add(1);
    }
    for (count, cost) in agent.collected.iter_mut().zip(&costs) {
        *count = count.saturating_sub(*cost);
    }
    true
}

/// Recompute scent and vision. With `near`, only agents that can see that
/// cell are refreshed.
fn refresh_observations(
    world: &mut WorldStore,
    agents: &mut BTreeMap<AgentId, AgentState>,
    config: &SimulatorConfig,
    time: u64,
    near: Option<Position>,
) {
    let index: AgentIndex = agents.values().map(|a| (a.position, a.direction)).collect();
    let range = u64::from(config.vision_range);
    let params = VisionParams {
        range: config.vision_range,
        field_of_view: config.agent_field_of_view,
        agent_color: &config.agent_color,
    };
    for agent in agents.values_mut() {
        if near.is_some_and(|p| (agent.position - p).chebyshev_length() > range) {
            continue;
        }
        world.warm_scent_cache(agent.position.patch_coordinate(config.patch_size));
        agent.scent = world.scent_at(agent.position, time);
        agent.vision = render_vision(world, agent.position, agent.direction, &index, &params);
    }
}

#[cfg(test)]
#[allow(
    clippy::unwrap_used,
    clippy::indexing_slicing,
    clippy::float_cmp,
    clippy::arithmetic_side_effects
)]
mod tests {
    use patchwork_types::{ActionPolicy, Item, MovementConflictPolicy};

    use super::*;
    use crate::testing::{empty_config, simulator_with_items};

    #[test]
    fn agents_spawn_at_origin_facing_up() {
        let sim = Simulator::new(empty_config()).unwrap();
        let (id, state) = sim.add_agent().unwrap();
        assert_eq!(id, AgentId(0));
        assert_eq!(state.position, Position::ORIGIN);
        assert_eq!(state.direction, Direction::Up);
        assert_eq!(state.vision.len(), 11 * 11 * 3);
        assert_eq!(state.scent.len(), 3);
        assert!(state.active);
    }

    #[test]
    fn second_spawn_on_occupied_origin_is_retryable() {
        let sim = Simulator::new(empty_config()).unwrap();
        sim.add_agent().unwrap();
        let err = sim.add_agent().unwrap_err();
        assert!(err.is_retryable());
    }

    #[test]
    fn step_waits_for_every_active_agent() {
        let sim = Simulator::new(empty_config()).unwrap();
        let (a, _) = sim.add_agent().unwrap();
        sim.move_agent(a, RelativeDirection::Forward, 1).unwrap();
        let (b, _) = sim.add_agent().unwrap();
        // `a`'s move resolved alone; now both must act.
        assert_eq!(sim.time(), 1);
        sim.no_op(b).unwrap();
        assert_eq!(sim.time(), 1);
        assert_eq!(sim.no_op(b), Err(ActionRejected::AlreadyActed));
        sim.turn_agent(a, RelativeDirection::Right).unwrap();
        assert_eq!(sim.time(), 2);
        let states = sim.agent_states(&[a]).unwrap();
        assert_eq!(states[0].direction, Direction::Right);
        assert_eq!(states[0].position, Position::new(0, 1));
    }

    #[test]
    fn deactivating_the_last_straggler_completes_the_step() {
        let sim = Simulator::new(empty_config()).unwrap();
        let (a, _) = sim.add_agent().unwrap();
        sim.move_agent(a, RelativeDirection::Forward, 1).unwrap();
        let (b, _) = sim.add_agent().unwrap();
        sim.no_op(a).unwrap();
        assert_eq!(sim.time(), 1);
        sim.set_active(b, false).unwrap();
        assert_eq!(sim.time(), 2);
        assert!(!sim.is_active(b).unwrap());
        assert_eq!(sim.no_op(b), Err(ActionRejected::Inactive));
    }

    #[test]
    fn deactivating_everyone_discards_intents_without_stepping() {
        let sim = Simulator::new(empty_config()).unwrap();
        let (a, _) = sim.add_agent().unwrap();
        sim.move_agent(a, RelativeDirection::Forward, 1).unwrap();
        let (b, _) = sim.add_agent().unwrap();
        sim.no_op(a).unwrap();
        assert_eq!(sim.deactivate_all(), 2);
        assert_eq!(sim.time(), 1);
        assert!(!sim.has_acted(a));
        assert!(!sim.is_active(a).unwrap() && !sim.is_active(b).unwrap());
        assert_eq!(sim.deactivate_all(), 0);

        sim.set_active(b, true).unwrap();
        sim.no_op(b).unwrap();
        assert_eq!(sim.time(), 2);
    }

    #[test]
    fn policies_gate_submissions() {
        let mut config = empty_config();
        config.allowed_movement_directions = [
            ActionPolicy::Allowed,
            ActionPolicy::Disallowed,
            ActionPolicy::Ignored,
            ActionPolicy::Allowed,
        ];
        config.no_op_allowed = false;
        let sim = Simulator::new(config).unwrap();
        let (a, _) = sim.add_agent().unwrap();
        assert_eq!(
            sim.move_agent(a, RelativeDirection::Backward, 1),
            Err(ActionRejected::Disallowed)
        );
        assert_eq!(
            sim.move_agent(a, RelativeDirection::Forward, 2),
            Err(ActionRejected::TooManySteps)
        );
        assert_eq!(sim.no_op(a), Err(ActionRejected::NoOpDisallowed));
        // Ignored moves count as the agent's action but leave it in place.
        sim.move_agent(a, RelativeDirection::Left, 1).unwrap();
        assert_eq!(sim.time(), 1);
        assert_eq!(sim.agent_states(&[a]).unwrap()[0].position, Position::ORIGIN);
        assert_eq!(
            sim.move_agent(AgentId(99), RelativeDirection::Forward, 1),
            Err(ActionRejected::UnknownAgent)
        );
    }

    #[test]
    fn first_come_first_served_scenario() {
        let mut config = empty_config();
        config.collision_policy = MovementConflictPolicy::FirstComeFirstServed;
        let sim = Simulator::new(config).unwrap();
        let mut rx = sim.subscribe();

        // a walks to (0, 2); b spawns at the origin. Both then target (0, 1):
        // a by stepping backward, b by stepping forward.
        let (a, _) = sim.add_agent().unwrap();
        sim.move_agent(a, RelativeDirection::Forward, 1).unwrap();
        sim.move_agent(a, RelativeDirection::Forward, 1).unwrap();
        let (b, _) = sim.add_agent().unwrap();
        sim.move_agent(b, RelativeDirection::Forward, 1).unwrap();
        sim.move_agent(a, RelativeDirection::Backward, 1).unwrap();

        let mut last = None;
        while let Ok(report) = rx.try_recv() {
            last = Some(report);
        }
        let report = last.unwrap();
        assert_eq!(report.time, 3);
        assert_eq!(report.outcomes[&b], MoveOutcome::Moved);
        assert_eq!(report.outcomes[&a], MoveOutcome::ConflictLost);
        assert_eq!(report.states[&b].position, Position::new(0, 1));
        assert_eq!(report.states[&a].position, Position::new(0, 2));
    }

    #[test]
    fn forced_step_turns_missing_intents_into_no_ops() {
        let sim = Simulator::new(empty_config()).unwrap();
        let (a, _) = sim.add_agent().unwrap();
        sim.move_agent(a, RelativeDirection::Forward, 1).unwrap();
        let (b, _) = sim.add_agent().unwrap();
        sim.turn_agent(b, RelativeDirection::Left).unwrap();
        let time = sim
            .wait_for_step(1, Some(Duration::from_millis(20)))
            .unwrap();
        assert_eq!(time, 2);
        let states = sim.agent_states(&[a, b]).unwrap();
        assert_eq!(states[0].position, Position::new(0, 1));
        assert_eq!(states[1].direction, Direction::Left);
    }

    #[test]
    fn wait_returns_immediately_once_time_has_passed() {
        let sim = Simulator::new(empty_config()).unwrap();
        let (a, _) = sim.add_agent().unwrap();
        sim.no_op(a).unwrap();
        assert_eq!(sim.wait_for_step(0, None).unwrap(), 1);
    }

    #[test]
    fn waiting_thread_wakes_when_the_step_resolves() {
        let sim = Simulator::new(empty_config()).unwrap();
        let (a, _) = sim.add_agent().unwrap();
        let waiter = {
            let sim = sim.clone();
            std::thread::spawn(move || sim.wait_for_step(0, None).unwrap())
        };
        std::thread::sleep(Duration::from_millis(20));
        sim.no_op(a).unwrap();
        assert_eq!(waiter.join().unwrap(), 1);
    }

    #[test]
    fn collection_requires_and_consumes_items() {
        let items = vec![
            Item::generated(2, Position::new(0, 1)),
            Item::generated(0, Position::new(0, 2)),
            Item::generated(2, Position::new(0, 3)),
        ];
        let sim = simulator_with_items(empty_config(), items);
        let (a, _) = sim.add_agent().unwrap();
        let collected = |sim: &Simulator| sim.agent_states(&[a]).unwrap()[0].collected.clone();

        // The first jellybean needs a banana the agent does not have yet.
        sim.move_agent(a, RelativeDirection::Forward, 1).unwrap();
        assert_eq!(collected(&sim), vec![0, 0, 0]);
        sim.move_agent(a, RelativeDirection::Forward, 1).unwrap();
        assert_eq!(collected(&sim), vec![1, 0, 0]);
        // The second jellybean consumes that banana.
        sim.move_agent(a, RelativeDirection::Forward, 1).unwrap();
        assert_eq!(collected(&sim), vec![0, 0, 1]);

        let map = sim.get_map(Position::ORIGIN, Position::ORIGIN, false, false);
        let live: Vec<_> = map[0].items.iter().map(|i| i.position).collect();
        assert_eq!(live, vec![Position::new(0, 1)]);
    }

    #[test]
    fn blocking_items_stop_moves() {
        let sim = simulator_with_items(
            empty_config(),
            vec![Item::generated(1, Position::new(0, 1))],
        );
        let mut rx = sim.subscribe();
        let (a, _) = sim.add_agent().unwrap();
        sim.move_agent(a, RelativeDirection::Forward, 1).unwrap();
        let report = rx.try_recv().unwrap();
        assert_eq!(report.outcomes[&a], MoveOutcome::Blocked);
        assert_eq!(report.states[&a].position, Position::ORIGIN);
        assert_eq!(report.time, 1);
    }

    #[test]
    fn scent_reaches_agents_near_items() {
        let sim = simulator_with_items(
            empty_config(),
            vec![Item::generated(0, Position::new(0, 1))],
        );
        let (_, state) = sim.add_agent().unwrap();
        assert!(state.scent[0] > 0.0);
        assert!(state.scent[1].abs() < f32::EPSILON);
        // The banana is directly ahead: row R+1, column R of the vision grid.
        let cell = (6 * 11 + 5) * 3;
        assert_eq!(&state.vision[cell..cell + 3], &[1.0, 1.0, 0.0]);
    }

    #[test]
    fn get_map_generates_requested_patches() {
        let sim = Simulator::new(empty_config()).unwrap();
        let patches = sim.get_map(Position::new(-1, -1), Position::new(1, 1), true, false);
        assert_eq!(patches.len(), 4);
        assert!(patches.iter().all(|p| p.fixed));
        assert_eq!(patches[0].scent.as_ref().unwrap().len(), 16 * 16 * 3);
    }
}
