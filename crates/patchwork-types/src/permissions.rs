//! Per-client capability set enforced by the session server.

use serde::{Deserialize, Serialize};

/// Operations a connected client may perform.
///
/// Movement, turning and no-ops on a client's own agents are always
/// permitted; ownership is checked separately.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[allow(clippy::struct_excessive_bools)]
pub struct Permissions {
    /// May spawn new agents.
    pub add_agent: bool,
    /// May remove its own agents.
    pub remove_agent: bool,
    /// May remove whole clients (itself included) with their agents.
    pub remove_client: bool,
    /// May activate or deactivate its own agents.
    pub set_active: bool,
    /// May query map patches.
    pub get_map: bool,
    /// May list every agent id in the simulator.
    pub get_agent_ids: bool,
    /// May read the state of arbitrary agents.
    pub get_agent_states: bool,
}

impl Permissions {
    /// Every capability granted.
    pub const fn grant_all() -> Self {
        Self {
            add_agent: true,
            remove_agent: true,
            remove_client: true,
            set_active: true,
            get_map: true,
            get_agent_ids: true,
            get_agent_states: true,
        }
    }

    /// Every capability denied.
    pub const fn deny_all() -> Self {
        Self {
            add_agent: false,
            remove_agent: false,
            remove_client: false,
            set_active: false,
            get_map: false,
            get_agent_ids: false,
            get_agent_states: false,
        }
    }
}

impl Default for Permissions {
    fn default() -> Self {
        Self::grant_all()
    }
}
