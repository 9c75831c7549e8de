//! Movement conflict resolution.
//!
//! Given every move claim of a step, decide which agents actually move.
//! Agents that are not moving hold their cell with priority. A claim fails
//! when its destination holds a blocking item, when its destination is
//! held by an agent that stays in place, or when it loses a contest with
//! other claims for the same cell. Failures cascade: an agent that fails to
//! leave its cell keeps it, which may in turn block a claim into that cell.
//! Resolution repeats until nothing changes, so no two agents ever end the
//! step on the same cell.
//!
//! Contests are settled by [`MovementConflictPolicy`]:
//!
//! 1. **No collisions**: every contender fails.
//! 2. **First-come-first-served**: the lowest arrival order wins.
//! 3. **Random**: a uniform draw from the caller's stream picks the winner.
//!    Contested cells are visited in position order so the draws are
//!    reproducible.

use std::collections::{BTreeMap, BTreeSet};

use patchwork_types::{AgentId, MovementConflictPolicy, Position};
use rand::Rng;
use serde::{Deserialize, Serialize};

/// One agent's request to move this step.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MoveClaim {
    /// The moving agent.
    pub agent_id: AgentId,
    /// Cell the agent occupies now.
    pub from: Position,
    /// Cell the agent wants to reach.
    pub to: Position,
    /// Arrival order of the intent within the step.
    pub arrival: u64,
    /// Whether `to` holds a movement-blocking item.
    pub blocked: bool,
}

/// What happened to an agent during a step.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MoveOutcome {
    /// The agent did not try to move (turn, no-op, or inactive).
    Stayed,
    /// The agent reached its destination.
    Moved,
    /// The destination was blocked by an item or an agent staying in place.
    Blocked,
    /// Another agent won the destination.
    ConflictLost,
}

/// Resolve every claim of a step.
///
/// `stationary` holds the cells of agents that are not moving. Returns an
/// outcome for every claim.
pub fn resolve_moves<R: Rng + ?Sized>(
    claims: &[MoveClaim],
    stationary: &BTreeSet<Position>,
    policy: MovementConflictPolicy,
    rng: &mut R,
) -> BTreeMap<AgentId, MoveOutcome> {
    let mut outcomes: BTreeMap<AgentId, MoveOutcome> = BTreeMap::new();
    let mut occupied = stationary.clone();

    for claim in claims.iter().filter(|c| c.blocked) {
        outcomes.insert(claim.agent_id, MoveOutcome::Blocked);
        occupied.insert(claim.from);
    }

    loop {
        // Cascade: destinations held by agents that stay put.
        let mut changed = false;
        for claim in claims {
            if outcomes.contains_key(&claim.agent_id) || !occupied.contains(&claim.to) {
                continue;
            }
            outcomes.insert(claim.agent_id, MoveOutcome::Blocked);
            occupied.insert(claim.from);
            changed = true;
        }
        if changed {
            continue;
        }

        // Contests between remaining movers.
        let mut contests: BTreeMap<Position, Vec<&MoveClaim>> = BTreeMap::new();
        for claim in claims.iter().filter(|c| !outcomes.contains_key(&c.agent_id)) {
            contests.entry(claim.to).or_default().push(claim);
        }
        for contenders in contests.values().filter(|c| c.len() > 1) {
            let winner = pick_winner(contenders, policy, rng);
            for claim in contenders {
                if Some(claim.agent_id) != winner {
                    outcomes.insert(claim.agent_id, MoveOutcome::ConflictLost);
                    occupied.insert(claim.from);
                    changed = true;
                }
            }
        }
        if !changed {
            break;
        }
    }

    for claim in claims {
        outcomes.entry(claim.agent_id).or_insert(MoveOutcome::Moved);
    }
    outcomes
}

/// The agent that wins a contested cell, or `None` if nobody does.
fn pick_winner<R: Rng + ?Sized>(
    contenders: &[&MoveClaim],
    policy: MovementConflictPolicy,
    rng: &mut R,
) -> Option<AgentId> {
    match policy {
        MovementConflictPolicy::NoCollisions => None,
        MovementConflictPolicy::FirstComeFirstServed => contenders
            .iter()
            .min_by_key(|c| c.arrival)
            .map(|c| c.agent_id),
        MovementConflictPolicy::Random => {
            let index = rng.random_range(0..contenders.len());
            contenders.get(index).map(|c| c.agent_id)
        }
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use rand::SeedableRng;
    use rand_chacha::ChaCha8Rng;

    use super::*;

    fn claim(id: u64, from: (i64, i64), to: (i64, i64), arrival: u64) -> MoveClaim {
        MoveClaim {
            agent_id: AgentId(id),
            from: Position::new(from.0, from.1),
            to: Position::new(to.0, to.1),
            arrival,
            blocked: false,
        }
    }

    fn rng() -> ChaCha8Rng {
        ChaCha8Rng::seed_from_u64(5)
    }

    #[test]
    fn first_come_first_served_picks_earliest() {
        let claims = [claim(1, (0, 0), (1, 1), 1), claim(2, (2, 1), (1, 1), 0)];
        let out = resolve_moves(
            &claims,
            &BTreeSet::new(),
            MovementConflictPolicy::FirstComeFirstServed,
            &mut rng(),
        );
        assert_eq!(out[&AgentId(2)], MoveOutcome::Moved);
        assert_eq!(out[&AgentId(1)], MoveOutcome::ConflictLost);
    }

    #[test]
    fn no_collisions_fails_every_contender() {
        let claims = [claim(1, (0, 0), (1, 1), 0), claim(2, (2, 1), (1, 1), 1)];
        let out = resolve_moves(
            &claims,
            &BTreeSet::new(),
            MovementConflictPolicy::NoCollisions,
            &mut rng(),
        );
        assert_eq!(out[&AgentId(1)], MoveOutcome::ConflictLost);
        assert_eq!(out[&AgentId(2)], MoveOutcome::ConflictLost);
    }

    #[test]
    fn random_picks_exactly_one_winner() {
        let claims = [
            claim(1, (0, 0), (1, 1), 0),
            claim(2, (2, 1), (1, 1), 1),
            claim(3, (1, 2), (1, 1), 2),
        ];
        let out = resolve_moves(
            &claims,
            &BTreeSet::new(),
            MovementConflictPolicy::Random,
            &mut rng(),
        );
        let winners = out.values().filter(|o| **o == MoveOutcome::Moved).count();
        assert_eq!(winners, 1);
        let again = resolve_moves(
            &claims,
            &BTreeSet::new(),
            MovementConflictPolicy::Random,
            &mut rng(),
        );
        assert_eq!(out, again);
    }

    #[test]
    fn stationary_agents_keep_their_cell() {
        let claims = [claim(1, (0, 0), (0, 1), 0)];
        let stationary = BTreeSet::from([Position::new(0, 1)]);
        let out = resolve_moves(
            &claims,
            &stationary,
            MovementConflictPolicy::FirstComeFirstServed,
            &mut rng(),
        );
        assert_eq!(out[&AgentId(1)], MoveOutcome::Blocked);
    }

    #[test]
    fn failures_cascade_down_a_queue() {
        // 3 wants 2's cell, 2 wants 1's cell, 1 is blocked by an item.
        let mut first = claim(1, (0, 2), (0, 3), 0);
        first.blocked = true;
        let claims = [first, claim(2, (0, 1), (0, 2), 1), claim(3, (0, 0), (0, 1), 2)];
        let out = resolve_moves(
            &claims,
            &BTreeSet::new(),
            MovementConflictPolicy::FirstComeFirstServed,
            &mut rng(),
        );
        assert!(out.values().all(|o| *o == MoveOutcome::Blocked));
    }

    #[test]
    fn a_queue_moves_together_when_the_head_is_free() {
        let claims = [
            claim(1, (0, 2), (0, 3), 0),
            claim(2, (0, 1), (0, 2), 1),
            claim(3, (0, 0), (0, 1), 2),
        ];
        let out = resolve_moves(
            &claims,
            &BTreeSet::new(),
            MovementConflictPolicy::NoCollisions,
            &mut rng(),
        );
        assert!(out.values().all(|o| *o == MoveOutcome::Moved));
    }

    #[test]
    fn contest_loser_blocks_the_agent_behind_it() {
        // 1 and 2 contest (5, 5); 2 loses and keeps (5, 4), blocking 3.
        let claims = [
            claim(1, (4, 5), (5, 5), 0),
            claim(2, (5, 4), (5, 5), 1),
            claim(3, (5, 3), (5, 4), 2),
        ];
        let out = resolve_moves(
            &claims,
            &BTreeSet::new(),
            MovementConflictPolicy::FirstComeFirstServed,
            &mut rng(),
        );
        assert_eq!(out[&AgentId(1)], MoveOutcome::Moved);
        assert_eq!(out[&AgentId(2)], MoveOutcome::ConflictLost);
        assert_eq!(out[&AgentId(3)], MoveOutcome::Blocked);
    }
}
