//! Snapshot files.
//!
//! A snapshot is written to `{prefix}{time}` as JSON. Agent sessions add
//! `{prefix}{time}.agent_info` (one `"<id> <kind>"` line per agent) and a
//! `{prefix}{time}.agent{id}` file per agent next to it, and a session
//! server adds `{prefix}{time}.clients` with its client table.
//!
//! Writes go to a `.tmp` sibling that is renamed into place, so a crash
//! mid-write never leaves a truncated snapshot under the final name.

use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use patchwork_types::{AgentId, AgentState};
use patchwork_world::{WorldSnapshot, WorldStore};
use serde::{Deserialize, Serialize};
use tracing::info;

use crate::clock::StepClock;
use crate::config::SimulatorConfig;
use crate::error::SimulatorError;
use crate::intent::PendingIntent;
use crate::simulator::{Simulator, StepState, item_table, world_settings};

/// Version stamped into every snapshot this build writes.
pub const SNAPSHOT_FORMAT_VERSION: u32 = 1;

/// Errors that can occur while saving or loading snapshots.
#[derive(Debug, thiserror::Error)]
pub enum PersistenceError {
    /// Reading or writing a file failed.
    #[error("i/o error on {}: {source}", path.display())]
    Io {
        /// The file involved.
        path: PathBuf,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// A file did not contain valid JSON for its kind.
    #[error("malformed snapshot {}: {source}", path.display())]
    Json {
        /// The file involved.
        path: PathBuf,
        /// The underlying JSON error.
        source: serde_json::Error,
    },

    /// The snapshot was written by an incompatible version.
    #[error("unsupported snapshot format version {found} (expected {SNAPSHOT_FORMAT_VERSION})")]
    UnsupportedVersion {
        /// Version found in the file.
        found: u32,
    },

    /// The snapshot content is inconsistent.
    #[error("corrupt snapshot: {reason}")]
    Corrupt {
        /// What is inconsistent.
        reason: String,
    },

    /// The embedded configuration or world could not be rebuilt.
    #[error("failed to restore simulator: {source}")]
    Simulator {
        /// The underlying simulator error.
        #[from]
        source: SimulatorError,
    },
}

/// Complete serializable simulator state.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SimulatorSnapshot {
    /// Snapshot format version.
    pub format_version: u32,
    /// Wall-clock time the snapshot was taken.
    pub saved_at: DateTime<Utc>,
    /// Logical time.
    pub time: u64,
    /// Configuration the simulator was built with.
    pub config: SimulatorConfig,
    /// Next id `add_agent` will hand out.
    pub next_agent_id: AgentId,
    /// Every agent, in id order.
    pub agents: Vec<AgentState>,
    /// Intents submitted for the step in progress.
    pub pending: Vec<(AgentId, PendingIntent)>,
    /// Fixed patches and the random stream position.
    pub world: WorldSnapshot,
}

/// Path of the snapshot for `time` under `prefix`.
pub fn snapshot_path(prefix: &str, time: u64) -> PathBuf {
    PathBuf::from(format!("{prefix}{time}"))
}

/// Path of the agent index written alongside a snapshot.
pub fn agent_info_path(prefix: &str, time: u64) -> PathBuf {
    PathBuf::from(format!("{prefix}{time}.agent_info"))
}

/// Path of the client table a session server writes alongside a snapshot.
pub fn clients_path(prefix: &str, time: u64) -> PathBuf {
    PathBuf::from(format!("{prefix}{time}.clients"))
}

/// Path of one agent's behavior state written alongside a snapshot.
pub fn agent_state_path(prefix: &str, time: u64, id: AgentId) -> PathBuf {
    PathBuf::from(format!("{prefix}{time}.agent{id}"))
}

impl Simulator {
    /// Capture the complete simulator state.
    pub fn snapshot(&self) -> SimulatorSnapshot {
        let (state, world) = self.capture();
        SimulatorSnapshot {
            format_version: SNAPSHOT_FORMAT_VERSION,
            saved_at: Utc::now(),
            time: state.clock.time(),
            config: self.config().clone(),
            next_agent_id: state.next_agent_id,
            agents: state.agents.into_values().collect(),
            pending: state.pending.into_iter().collect(),
            world,
        }
    }

    /// Rebuild a simulator from a snapshot.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError`] if the version is unsupported, the
    /// embedded config is invalid, or the content is inconsistent.
    pub fn from_snapshot(snapshot: SimulatorSnapshot) -> Result<Self, PersistenceError> {
        if snapshot.format_version != SNAPSHOT_FORMAT_VERSION {
            return Err(PersistenceError::UnsupportedVersion {
                found: snapshot.format_version,
            });
        }
        let config = snapshot.config;
        let table = item_table(&config)?;
        let item_types = table.len();
        let world = WorldStore::restore(table, world_settings(&config), snapshot.world)
            .map_err(|source| PersistenceError::Simulator {
                source: SimulatorError::World { source },
            })?;

        let mut agents = BTreeMap::new();
        for agent in snapshot.agents {
            if agent.id >= snapshot.next_agent_id {
                return Err(PersistenceError::Corrupt {
                    reason: format!("agent {} is not below the id counter", agent.id),
                });
            }
            if agent.collected.len() != item_types {
                return Err(PersistenceError::Corrupt {
                    reason: format!("agent {} has a malformed collected vector", agent.id),
                });
            }
            agents.insert(agent.id, agent);
        }
        let pending: BTreeMap<AgentId, PendingIntent> = snapshot.pending.into_iter().collect();
        if let Some(id) = pending.keys().find(|id| !agents.contains_key(id)) {
            return Err(PersistenceError::Corrupt {
                reason: format!("pending intent for unknown agent {id}"),
            });
        }
        let arrivals = pending
            .values()
            .map(|p| p.arrival.saturating_add(1))
            .max()
            .unwrap_or(0);

        let state = StepState {
            clock: StepClock::resume_at(snapshot.time),
            agents,
            next_agent_id: snapshot.next_agent_id,
            pending,
            arrivals,
        };
        Ok(Self::from_parts(config, world, state))
    }

    /// Write a snapshot to `{prefix}{time}` and return its path.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError::Io`] if the file cannot be written.
    pub fn save(&self, prefix: &str) -> Result<PathBuf, PersistenceError> {
        write_snapshot(&self.snapshot(), prefix)
    }

    /// Restore the simulator saved at `time` under `prefix`.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError`] if the file is missing, malformed, or
    /// inconsistent.
    pub fn load(prefix: &str, time: u64) -> Result<Self, PersistenceError> {
        let path = snapshot_path(prefix, time);
        let bytes = std::fs::read(&path).map_err(|source| PersistenceError::Io {
            path: path.clone(),
            source,
        })?;
        let snapshot: SimulatorSnapshot =
            serde_json::from_slice(&bytes).map_err(|source| PersistenceError::Json {
                path: path.clone(),
                source,
            })?;
        let agents = snapshot.agents.len();
        let simulator = Self::from_snapshot(snapshot)?;
        info!(path = %path.display(), time, agents, "Snapshot loaded");
        Ok(simulator)
    }
}

/// Write `snapshot` to `{prefix}{time}` and return its path.
///
/// # Errors
///
/// Returns [`PersistenceError::Io`] if the file cannot be written.
pub fn write_snapshot(snapshot: &SimulatorSnapshot, prefix: &str) -> Result<PathBuf, PersistenceError> {
    let path = snapshot_path(prefix, snapshot.time);
    let json = serde_json::to_vec(snapshot).map_err(|source| PersistenceError::Json {
        path: path.clone(),
        source,
    })?;
    write_atomically(&path, &json)?;
    info!(
        path = %path.display(),
        time = snapshot.time,
        agents = snapshot.agents.len(),
        patches = snapshot.world.patches.len(),
        "Snapshot saved"
    );
    Ok(path)
}

/// Write `bytes` to a temporary sibling of `path`, then rename it into place.
///
/// # Errors
///
/// Returns [`PersistenceError::Io`] on any file system failure.
pub fn write_atomically(path: &Path, bytes: &[u8]) -> Result<(), PersistenceError> {
    let io = |source| PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    };
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent).map_err(io)?;
    }
    let mut tmp = path.as_os_str().to_owned();
    tmp.push(".tmp");
    let tmp = PathBuf::from(tmp);
    std::fs::write(&tmp, bytes).map_err(io)?;
    std::fs::rename(&tmp, path).map_err(io)
}

/// Write the agent index: one `"<id> <kind>"` line per agent.
///
/// # Errors
///
/// Returns [`PersistenceError::Io`] if the file cannot be written.
pub fn write_agent_info(path: &Path, agents: &[(AgentId, String)]) -> Result<(), PersistenceError> {
    let mut text = String::new();
    for (id, kind) in agents {
        // Writing to a String cannot fail.
        let _ = writeln!(text, "{id} {kind}");
    }
    write_atomically(path, text.as_bytes())
}

/// Read an agent index written by [`write_agent_info`].
///
/// # Errors
///
/// Returns [`PersistenceError::Io`] if the file cannot be read, or
/// [`PersistenceError::Corrupt`] for a malformed line.
pub fn read_agent_info(path: &Path) -> Result<Vec<(AgentId, String)>, PersistenceError> {
    let text = std::fs::read_to_string(path).map_err(|source| PersistenceError::Io {
        path: path.to_path_buf(),
        source,
    })?;
    text.lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let corrupt = || PersistenceError::Corrupt {
                reason: format!("bad agent_info line {line:?}"),
            };
            let (id, kind) = line.trim().split_once(' ').ok_or_else(corrupt)?;
            let id = id.parse::<u64>().map_err(|_parse| corrupt())?;
            Ok((AgentId(id), kind.trim().to_owned()))
        })
        .collect()
}
