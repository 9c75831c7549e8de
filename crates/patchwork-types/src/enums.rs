//! Policy enumerations carried in the simulator configuration.

use serde::{Deserialize, Serialize};

/// How the simulator treats a requested move or turn in one relative direction.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionPolicy {
    /// The request proceeds to resolution.
    #[default]
    Allowed,
    /// The request is rejected immediately.
    Disallowed,
    /// The request is accepted but silently converted into a no-op.
    Ignored,
}

/// How the resolver settles several agents moving into the same cell.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MovementConflictPolicy {
    /// Every contested move fails; contenders stay where they are.
    NoCollisions,
    /// The contender whose intent arrived first in the step wins.
    #[default]
    FirstComeFirstServed,
    /// A winner is drawn uniformly from the simulator's seeded stream.
    Random,
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn policies_parse_from_snake_case() {
        let p: MovementConflictPolicy = serde_yml::from_str("first_come_first_served").unwrap();
        assert_eq!(p, MovementConflictPolicy::FirstComeFirstServed);
        let a: Vec<ActionPolicy> = serde_yml::from_str("[allowed, disallowed, ignored]").unwrap();
        assert_eq!(
            a,
            vec![ActionPolicy::Allowed, ActionPolicy::Disallowed, ActionPolicy::Ignored]
        );
    }
}
