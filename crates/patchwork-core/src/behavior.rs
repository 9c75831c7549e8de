//! Agent behaviors: what an agent does with its observations.
//!
//! An [`AgentBehavior`] turns the latest [`AgentState`] into an [`Intent`]
//! each step. Behaviors are plain synchronous state machines so the same
//! implementation can drive an agent in-process or over the wire. Their
//! internal state is persisted as JSON next to world snapshots, and a
//! [`BehaviorRegistry`] maps the `kind` written in the agent index back to a
//! constructor when loading.

use std::collections::BTreeMap;

use patchwork_types::{AgentState, RelativeDirection};
use rand::{Rng, SeedableRng};
use rand_chacha::ChaCha8Rng;
use serde::{Deserialize, Serialize};

use crate::intent::Intent;

/// Errors that can occur when creating or restoring behaviors.
#[derive(Debug, thiserror::Error)]
pub enum BehaviorError {
    /// No constructor is registered for this kind.
    #[error("unknown behavior kind {kind:?}")]
    UnknownKind {
        /// The requested kind.
        kind: String,
    },

    /// Saved state could not be decoded.
    #[error("invalid saved state for {kind}: {source}")]
    InvalidState {
        /// The behavior kind.
        kind: &'static str,
        /// The underlying decode error.
        source: serde_json::Error,
    },
}

/// Decision logic for one agent.
pub trait AgentBehavior: Send {
    /// Stable name used in the agent index.
    fn kind(&self) -> &'static str;

    /// Choose this step's intent.
    fn produce_intent(&mut self, state: &AgentState) -> Intent;

    /// Observe the agent after the step resolved.
    fn receive_observation(&mut self, state: &AgentState);

    /// Serialize internal state.
    fn save_state(&self) -> serde_json::Value;

    /// Restore internal state written by [`AgentBehavior::save_state`].
    ///
    /// # Errors
    ///
    /// Returns [`BehaviorError::InvalidState`] if `state` cannot be decoded.
    fn load_state(&mut self, state: serde_json::Value) -> Result<(), BehaviorError>;
}

/// Random walker: mostly steps forward, sometimes turns.
///
/// The walk is a pure function of the seed, so a saved wanderer resumes
/// exactly where it stopped.
#[derive(Debug, Clone)]
pub struct Wanderer {
    seed: u64,
    rng: ChaCha8Rng,
    /// Steps that did not change the agent's position in a row.
    stuck: u32,
    last_position: Option<patchwork_types::Position>,
}

#[derive(Serialize, Deserialize)]
struct WandererState {
    seed: u64,
    word_pos: u128,
    stuck: u32,
}

impl Wanderer {
    /// Chance of turning instead of moving, in percent.
    const TURN_PERCENT: u32 = 20;

    /// Create a wanderer whose walk is driven by `seed`.
    pub fn new(seed: u64) -> Self {
        Self {
            seed,
            rng: ChaCha8Rng::seed_from_u64(seed),
            stuck: 0,
            last_position: None,
        }
    }
}

impl AgentBehavior for Wanderer {
    fn kind(&self) -> &'static str {
        "wanderer"
    }

    fn produce_intent(&mut self, _state: &AgentState) -> Intent {
        // A blocked agent always turns so it cannot stall against a wall.
        if self.stuck > 0 || self.rng.random_range(0..100) < Self::TURN_PERCENT {
            let direction = if self.rng.random_bool(0.5) {
                RelativeDirection::Left
            } else {
                RelativeDirection::Right
            };
            Intent::Turn { direction }
        } else {
            Intent::Move {
                direction: RelativeDirection::Forward,
                steps: 1,
            }
        }
    }

    fn receive_observation(&mut self, state: &AgentState) {
        if self.last_position == Some(state.position) {
            self.stuck = self.stuck.saturating_add(1);
        } else {
            self.stuck = 0;
        }
        self.last_position = Some(state.position);
    }

    fn save_state(&self) -> serde_json::Value {
        let state = WandererState {
            seed: self.seed,
            word_pos: self.rng.get_word_pos(),
            stuck: self.stuck,
        };
        serde_json::to_value(state).unwrap_or_default()
    }

    fn load_state(&mut self, state: serde_json::Value) -> Result<(), BehaviorError> {
        let saved: WandererState = serde_json::from_value(state)
            .map_err(|source| BehaviorError::InvalidState { kind: self.kind(), source })?;
        let mut rng = ChaCha8Rng::seed_from_u64(saved.seed);
        rng.set_word_pos(saved.word_pos);
        self.seed = saved.seed;
        self.rng = rng;
        self.stuck = saved.stuck;
        self.last_position = None;
        Ok(())
    }
}

/// Walks `leg_length` cells forward, then turns right, forever.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct Patrol {
    leg_length: u32,
    walked: u32,
}

impl Patrol {
    /// Create a patrol tracing squares with sides of `leg_length` cells.
    pub const fn new(leg_length: u32) -> Self {
        Self {
            leg_length,
            walked: 0,
        }
    }
}

impl AgentBehavior for Patrol {
    fn kind(&self) -> &'static str {
        "patrol"
    }

    fn produce_intent(&mut self, _state: &AgentState) -> Intent {
        if self.walked >= self.leg_length {
            self.walked = 0;
            Intent::Turn {
                direction: RelativeDirection::Right,
            }
        } else {
            self.walked = self.walked.saturating_add(1);
            Intent::Move {
                direction: RelativeDirection::Forward,
                steps: 1,
            }
        }
    }

    fn receive_observation(&mut self, _state: &AgentState) {}

    fn save_state(&self) -> serde_json::Value {
        serde_json::to_value(self).unwrap_or_default()
    }

    fn load_state(&mut self, state: serde_json::Value) -> Result<(), BehaviorError> {
        *self = serde_json::from_value(state)
            .map_err(|source| BehaviorError::InvalidState { kind: self.kind(), source })?;
        Ok(())
    }
}

type Factory = Box<dyn Fn() -> Box<dyn AgentBehavior> + Send + Sync>;

/// Constructors for behaviors, keyed by [`AgentBehavior::kind`].
#[derive(Default)]
pub struct BehaviorRegistry {
    factories: BTreeMap<String, Factory>,
}

impl std::fmt::Debug for BehaviorRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BehaviorRegistry")
            .field("kinds", &self.factories.keys().collect::<Vec<_>>())
            .finish()
    }
}

impl BehaviorRegistry {
    /// An empty registry.
    pub fn new() -> Self {
        Self::default()
    }

    /// A registry with [`Wanderer`] (seed 0) and [`Patrol`] (legs of 4).
    pub fn with_builtins() -> Self {
        let mut registry = Self::new();
        registry.register("wanderer", || Box::new(Wanderer::new(0)));
        registry.register("patrol", || Box::new(Patrol::new(4)));
        registry
    }

    /// Register a constructor, replacing any previous one for `kind`.
    pub fn register<F>(&mut self, kind: &str, factory: F)
    where
        F: Fn() -> Box<dyn AgentBehavior> + Send + Sync + 'static,
    {
        self.factories.insert(kind.to_owned(), Box::new(factory));
    }

    /// Construct a fresh behavior of `kind`.
    ///
    /// # Errors
    ///
    /// Returns [`BehaviorError::UnknownKind`] if nothing is registered.
    pub fn create(&self, kind: &str) -> Result<Box<dyn AgentBehavior>, BehaviorError> {
        self.factories
            .get(kind)
            .map(|factory| factory())
            .ok_or_else(|| BehaviorError::UnknownKind {
                kind: kind.to_owned(),
            })
    }

    /// Construct a behavior of `kind` and restore its saved state.
    ///
    /// # Errors
    ///
    /// Returns [`BehaviorError`] if the kind is unknown or the state invalid.
    pub fn restore(
        &self,
        kind: &str,
        state: serde_json::Value,
    ) -> Result<Box<dyn AgentBehavior>, BehaviorError> {
        let mut behavior = self.create(kind)?;
        behavior.load_state(state)?;
        Ok(behavior)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use patchwork_types::{AgentId, Direction, Position};

    use super::*;

    fn state_at(position: Position) -> AgentState {
        AgentState {
            id: AgentId(0),
            position,
            direction: Direction::Up,
            scent: vec![0.0; 3],
            vision: Vec::new(),
            collected: vec![0; 3],
            active: true,
        }
    }

    #[test]
    fn patrol_turns_after_each_leg() {
        let mut patrol = Patrol::new(2);
        let state = state_at(Position::ORIGIN);
        let intents: Vec<Intent> = (0..6).map(|_| patrol.produce_intent(&state)).collect();
        let forward = Intent::Move {
            direction: RelativeDirection::Forward,
            steps: 1,
        };
        let right = Intent::Turn {
            direction: RelativeDirection::Right,
        };
        assert_eq!(intents, vec![forward, forward, right, forward, forward, right]);
    }

    #[test]
    fn wanderer_resumes_from_saved_state() {
        let state = state_at(Position::ORIGIN);
        let mut original = Wanderer::new(17);
        for _ in 0..5 {
            original.produce_intent(&state);
        }
        let saved = original.save_state();

        let mut restored = Wanderer::new(0);
        restored.load_state(saved).unwrap();
        for _ in 0..20 {
            let moved = state_at(Position::new(1, 1));
            original.receive_observation(&moved);
            restored.receive_observation(&moved);
            assert_eq!(original.produce_intent(&state), restored.produce_intent(&state));
        }
    }

    #[test]
    fn stuck_wanderer_turns() {
        let mut wanderer = Wanderer::new(3);
        let state = state_at(Position::ORIGIN);
        wanderer.receive_observation(&state);
        wanderer.receive_observation(&state);
        assert!(matches!(wanderer.produce_intent(&state), Intent::Turn { .. }));
    }

    #[test]
    fn registry_restores_known_kinds() {
        let registry = BehaviorRegistry::with_builtins();
        let mut patrol = Patrol::new(4);
        patrol.produce_intent(&state_at(Position::ORIGIN));
        let restored = registry.restore("patrol", patrol.save_state()).unwrap();
        assert_eq!(restored.kind(), "patrol");
        assert_eq!(restored.save_state(), patrol.save_state());

        assert!(matches!(
            registry.create("oracle"),
            Err(BehaviorError::UnknownKind { .. })
        ));
        assert!(matches!(
            registry.restore("wanderer", serde_json::json!({"seed": "x"})),
            Err(BehaviorError::InvalidState { .. })
        ));
    }
}
