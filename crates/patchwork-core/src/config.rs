//! Configuration loading and typed config structures for Patchwork.
//!
//! The engine reads a single YAML document with four sections:
//!
//! ```yaml
//! simulator:    # world physics, item catalog, action policies
//! server:       # listening address, worker pool, default permissions
//! persistence:  # snapshot prefix, autosave cadence, restore time
//! logging:      # level and output format
//! ```
//!
//! Only `simulator.items` is mandatory. Structural validation of the item
//! catalog happens when the world is built; [`SimulatorConfig::validate`]
//! covers the remaining scalar parameters.

use std::path::{Path, PathBuf};
use std::time::Duration;

use patchwork_types::{ActionPolicy, ItemType, MovementConflictPolicy, Permissions, RelativeDirection};
use serde::{Deserialize, Serialize};

/// Errors that can occur when loading or validating configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    /// Failed to read the configuration file from disk.
    #[error("failed to read config file: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// Failed to parse YAML content.
    #[error("failed to parse config YAML: {source}")]
    Yaml {
        /// The underlying YAML parse error.
        source: serde_yml::Error,
    },

    /// A parameter is out of range.
    #[error("invalid simulator configuration: {reason}")]
    Invalid {
        /// Explanation of what is wrong.
        reason: String,
    },
}

impl From<serde_yml::Error> for ConfigError {
    fn from(source: serde_yml::Error) -> Self {
        Self::Yaml { source }
    }
}

/// Top-level engine configuration.
#[derive(Debug, Clone, PartialEq, Deserialize)]
pub struct EngineConfig {
    /// Simulator parameters.
    pub simulator: SimulatorConfig,

    /// Session server parameters.
    #[serde(default)]
    pub server: ServerConfig,

    /// Snapshot and autosave parameters.
    #[serde(default)]
    pub persistence: PersistenceConfig,

    /// Logging configuration.
    #[serde(default)]
    pub logging: LoggingConfig,
}

impl EngineConfig {
    /// Load configuration from a YAML file at the given path.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Io`] if the file cannot be read, or
    /// [`ConfigError::Yaml`] if the content is not valid YAML.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path)?;
        Self::parse(&contents)
    }

    /// Parse configuration from a YAML string.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Yaml`] if the string is not valid YAML.
    pub fn parse(yaml: &str) -> Result<Self, ConfigError> {
        Ok(serde_yml::from_str(yaml)?)
    }
}

/// Immutable simulator parameters.
///
/// Policies for moves and turns are indexed by
/// [`RelativeDirection`]: forward, backward, left, right.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SimulatorConfig {
    /// Largest number of cells one move intent may cover.
    #[serde(default = "default_max_steps_per_movement")]
    pub max_steps_per_movement: u32,

    /// Policy for moves in each relative direction.
    #[serde(default)]
    pub allowed_movement_directions: [ActionPolicy; 4],

    /// Policy for turns toward each relative direction.
    #[serde(default)]
    pub allowed_turn_directions: [ActionPolicy; 4],

    /// Whether agents may explicitly pass a step.
    #[serde(default = "default_true")]
    pub no_op_allowed: bool,

    /// Length of every scent vector.
    #[serde(default = "default_dimension")]
    pub scent_dimension: usize,

    /// Length of every color vector.
    #[serde(default = "default_dimension")]
    pub color_dimension: usize,

    /// Cells visible in each direction.
    #[serde(default = "default_vision_range")]
    pub vision_range: u32,

    /// Angular width of the visual field in radians.
    #[serde(default = "default_field_of_view")]
    pub agent_field_of_view: f32,

    /// Side length of a patch in cells.
    #[serde(default = "default_patch_size")]
    pub patch_size: u32,

    /// Gibbs iterations spent on each new patch.
    #[serde(default = "default_mcmc_num_iter")]
    pub mcmc_num_iter: u32,

    /// Item catalog.
    pub items: Vec<ItemType>,

    /// Color other agents appear with in vision.
    #[serde(default = "default_agent_color")]
    pub agent_color: Vec<f32>,

    /// How contested moves are settled.
    #[serde(default)]
    pub collision_policy: MovementConflictPolicy,

    /// Per-step scent decay.
    #[serde(default = "default_decay_param")]
    pub decay_param: f32,

    /// Per-step scent diffusion rate.
    #[serde(default = "default_diffusion_param")]
    pub diffusion_param: f32,

    /// Steps a collected item lingers as a tombstone.
    #[serde(default = "default_deleted_item_lifetime")]
    pub deleted_item_lifetime: u32,

    /// Seed of the world's random stream.
    #[serde(default)]
    pub seed: u64,

    /// Milliseconds a step may wait for missing intents before they are
    /// treated as no-ops. Zero waits forever.
    #[serde(default)]
    pub step_timeout_ms: u64,
}

impl Default for SimulatorConfig {
    fn default() -> Self {
        Self {
            max_steps_per_movement: default_max_steps_per_movement(),
            allowed_movement_directions: [ActionPolicy::Allowed; 4],
            allowed_turn_directions: [ActionPolicy::Allowed; 4],
            no_op_allowed: true,
            scent_dimension: default_dimension(),
            color_dimension: default_dimension(),
            vision_range: default_vision_range(),
            agent_field_of_view: default_field_of_view(),
            patch_size: default_patch_size(),
            mcmc_num_iter: default_mcmc_num_iter(),
            items: Vec::new(),
            agent_color: default_agent_color(),
            collision_policy: MovementConflictPolicy::default(),
            decay_param: default_decay_param(),
            diffusion_param: default_diffusion_param(),
            deleted_item_lifetime: default_deleted_item_lifetime(),
            seed: 0,
            step_timeout_ms: 0,
        }
    }
}

impl SimulatorConfig {
    /// Check scalar parameters.
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::Invalid`] naming the first offending field.
    pub fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |reason: String| Err(ConfigError::Invalid { reason });
        if self.max_steps_per_movement == 0 {
            return invalid("max_steps_per_movement must be at least 1".to_owned());
        }
        if self.patch_size == 0 {
            return invalid("patch_size must be at least 1".to_owned());
        }
        if self.vision_range >= self.patch_size {
            return invalid(format!(
                "vision_range {} must be smaller than patch_size {}",
                self.vision_range, self.patch_size
            ));
        }
        if self.agent_color.len() != self.color_dimension {
            return invalid(format!(
                "agent_color has {} entries, expected color_dimension {}",
                self.agent_color.len(),
                self.color_dimension
            ));
        }
        if !(self.agent_field_of_view.is_finite() && self.agent_field_of_view > 0.0) {
            return invalid("agent_field_of_view must be a positive angle".to_owned());
        }
        Ok(())
    }

    /// How long a step may stall before missing intents become no-ops.
    pub const fn step_timeout(&self) -> Option<Duration> {
        if self.step_timeout_ms == 0 {
            None
        } else {
            Some(Duration::from_millis(self.step_timeout_ms))
        }
    }

    /// The policy for moving toward `direction`.
    pub const fn movement_policy(&self, direction: RelativeDirection) -> ActionPolicy {
        match direction {
            RelativeDirection::Forward => self.allowed_movement_directions[0],
            RelativeDirection::Backward => self.allowed_movement_directions[1],
            RelativeDirection::Left => self.allowed_movement_directions[2],
            RelativeDirection::Right => self.allowed_movement_directions[3],
        }
    }

    /// The policy for turning toward `direction`.
    pub const fn turn_policy(&self, direction: RelativeDirection) -> ActionPolicy {
        match direction {
            RelativeDirection::Forward => self.allowed_turn_directions[0],
            RelativeDirection::Backward => self.allowed_turn_directions[1],
            RelativeDirection::Left => self.allowed_turn_directions[2],
            RelativeDirection::Right => self.allowed_turn_directions[3],
        }
    }
}

/// Session server configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct ServerConfig {
    /// Address to bind.
    #[serde(default = "default_bind_address")]
    pub bind_address: String,

    /// TCP port. Zero picks an ephemeral port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Accepted connections waiting for a handler.
    #[serde(default = "default_conn_queue_capacity")]
    pub conn_queue_capacity: usize,

    /// Worker tasks executing client requests.
    #[serde(default = "default_num_workers")]
    pub num_workers: usize,

    /// Capabilities granted to newly connecting clients.
    #[serde(default)]
    pub default_permissions: Permissions,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
            port: default_port(),
            conn_queue_capacity: default_conn_queue_capacity(),
            num_workers: default_num_workers(),
            default_permissions: Permissions::grant_all(),
        }
    }
}

/// Snapshot and autosave configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct PersistenceConfig {
    /// Path prefix of snapshot files; the step number is appended.
    #[serde(default = "default_save_path")]
    pub save_path: PathBuf,

    /// Autosave every this many steps. Zero disables autosave.
    #[serde(default = "default_save_frequency")]
    pub save_frequency: u64,

    /// Restore from the snapshot taken at this step on startup.
    #[serde(default)]
    pub load_time: Option<u64>,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            save_path: default_save_path(),
            save_frequency: default_save_frequency(),
            load_time: None,
        }
    }
}

/// Logging configuration.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct LoggingConfig {
    /// Default filter directive when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// Output format: `text` or `json`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

const fn default_max_steps_per_movement() -> u32 {
    1
}

const fn default_true() -> bool {
    true
}

const fn default_dimension() -> usize {
    3
}

const fn default_vision_range() -> u32 {
    5
}

const fn default_field_of_view() -> f32 {
    core::f32::consts::TAU
}

const fn default_patch_size() -> u32 {
    32
}

const fn default_mcmc_num_iter() -> u32 {
    4000
}

fn default_agent_color() -> Vec<f32> {
    vec![0.0, 0.0, 1.0]
}

const fn default_decay_param() -> f32 {
    0.4
}

const fn default_diffusion_param() -> f32 {
    0.14
}

const fn default_deleted_item_lifetime() -> u32 {
    2000
}

fn default_bind_address() -> String {
    "127.0.0.1".to_owned()
}

const fn default_port() -> u16 {
    54353
}

const fn default_conn_queue_capacity() -> usize {
    256
}

const fn default_num_workers() -> usize {
    8
}

fn default_save_path() -> PathBuf {
    PathBuf::from("./saves/world_")
}

const fn default_save_frequency() -> u64 {
    1000
}

fn default_log_level() -> String {
    "info".to_owned()
}

fn default_log_format() -> String {
    "text".to_owned()
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use super::*;

    const MINIMAL: &str = r"
simulator:
  items:
    - name: banana
      scent: [1.0, 0.0, 0.0]
      color: [1.0, 1.0, 0.0]
      required_item_counts: [0]
      required_item_costs: [0]
      intensity: { fn: constant, args: [-5.3] }
      interactions:
        - { fn: piecewise_box, args: [40.0, 200.0, 0.0, -40.0] }
";

    #[test]
    fn minimal_config_fills_defaults() {
        let config = EngineConfig::parse(MINIMAL).unwrap();
        let sim = &config.simulator;
        assert_eq!(sim.patch_size, 32);
        assert_eq!(sim.mcmc_num_iter, 4000);
        assert_eq!(sim.collision_policy, MovementConflictPolicy::FirstComeFirstServed);
        assert_eq!(sim.allowed_movement_directions, [ActionPolicy::Allowed; 4]);
        assert!(sim.no_op_allowed);
        assert_eq!(config.server.port, 54353);
        assert_eq!(config.persistence.save_frequency, 1000);
        assert_eq!(config.logging.level, "info");
        sim.validate().unwrap();
    }

    #[test]
    fn parses_policies_and_server_section() {
        let yaml = format!(
            "{MINIMAL}  collision_policy: no_collisions
  allowed_movement_directions: [allowed, disallowed, ignored, allowed]
  seed: 99
server:
  port: 0
  num_workers: 2
  default_permissions:
    add_agent: true
    remove_agent: false
    remove_client: false
    set_active: true
    get_map: false
    get_agent_ids: true
    get_agent_states: true
"
        );
        let config = EngineConfig::parse(&yaml).unwrap();
        assert_eq!(config.simulator.collision_policy, MovementConflictPolicy::NoCollisions);
        assert_eq!(
            config.simulator.movement_policy(RelativeDirection::Backward),
            ActionPolicy::Disallowed
        );
        assert_eq!(config.simulator.seed, 99);
        assert_eq!(config.server.num_workers, 2);
        assert!(!config.server.default_permissions.get_map);
    }

    #[test]
    fn rejects_mismatched_agent_color() {
        let config = SimulatorConfig {
            agent_color: vec![1.0],
            ..SimulatorConfig::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { .. })));
    }

    #[test]
    fn rejects_vision_wider_than_patch() {
        let config = SimulatorConfig {
            vision_range: 8,
            patch_size: 8,
            ..SimulatorConfig::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn rejects_missing_items_section() {
        assert!(matches!(
            EngineConfig::parse("simulator: {}\n"),
            Err(ConfigError::Yaml { .. })
        ));
    }
}
