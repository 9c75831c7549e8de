//! Wire protocol between clients and the session server.
//!
//! Every message travels in one frame: a 4-byte big-endian length followed
//! by that many bytes of JSON. Frames longer than [`MAX_FRAME_LEN`] are
//! malformed and end the connection.
//!
//! A connection opens with the client's [`ClientMessage::Hello`], answered
//! by [`ServerMessage::Welcome`] or [`ServerMessage::Rejected`]. After that
//! the client sends requests tagged with a `request_id` of its choosing;
//! each gets exactly one [`ServerMessage::Response`] echoing the id.
//! [`ServerMessage::StepCompleted`] is pushed after every step.

use patchwork_core::{ActionRejected, AddAgentError, SimulatorConfig, SimulatorError};
use patchwork_types::{AgentId, AgentState, ClientId, PatchState, Position, RelativeDirection};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

/// Largest accepted frame body, in bytes.
pub const MAX_FRAME_LEN: u32 = 16 * 1024 * 1024;

/// Errors that can occur while reading or writing frames.
#[derive(Debug, thiserror::Error)]
pub enum ProtocolError {
    /// The underlying stream failed.
    #[error("i/o error: {source}")]
    Io {
        /// The underlying I/O error.
        #[from]
        source: std::io::Error,
    },

    /// The frame body was not a valid message.
    #[error("malformed message: {source}")]
    Json {
        /// The underlying JSON error.
        #[from]
        source: serde_json::Error,
    },

    /// The frame exceeds [`MAX_FRAME_LEN`].
    #[error("frame of {len} bytes exceeds the {MAX_FRAME_LEN} byte limit")]
    FrameTooLarge {
        /// Declared length.
        len: u64,
    },
}

/// Messages sent by clients.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ClientMessage {
    /// Opening handshake. Pass a previous id to reclaim its agents.
    Hello {
        /// Identity to resume, if any.
        client_id: Option<ClientId>,
    },
    /// An operation on the simulator.
    Request {
        /// Echoed in the response.
        request_id: u64,
        /// The operation.
        request: Request,
    },
}

/// Operations a client can request.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum Request {
    /// Spawn an agent owned by this client.
    AddAgent,
    /// Delete one of this client's agents.
    RemoveAgent {
        /// Target agent.
        agent_id: AgentId,
    },
    /// Delete this client and all of its agents.
    RemoveClient,
    /// Move an owned agent.
    Move {
        /// Target agent.
        agent_id: AgentId,
        /// Direction relative to the agent's heading.
        direction: RelativeDirection,
        /// Number of cells.
        steps: u32,
    },
    /// Turn an owned agent.
    Turn {
        /// Target agent.
        agent_id: AgentId,
        /// Direction relative to the agent's heading.
        direction: RelativeDirection,
    },
    /// Let an owned agent pass this step.
    NoOp {
        /// Target agent.
        agent_id: AgentId,
    },
    /// Activate or deactivate an owned agent.
    SetActive {
        /// Target agent.
        agent_id: AgentId,
        /// New activity.
        active: bool,
    },
    /// Whether an owned agent is active.
    IsActive {
        /// Target agent.
        agent_id: AgentId,
    },
    /// Render patches intersecting a cell box.
    GetMap {
        /// Lower-left cell, inclusive.
        bottom_left: Position,
        /// Upper-right cell, inclusive.
        top_right: Position,
        /// Include per-cell scent.
        with_scent: bool,
        /// Include per-cell color.
        with_vision: bool,
    },
    /// Every agent id in the simulator.
    GetAgentIds,
    /// States of arbitrary agents.
    GetAgentStates {
        /// Agents to read.
        agent_ids: Vec<AgentId>,
    },
}

impl Request {
    /// Short name used in logs.
    pub const fn name(&self) -> &'static str {
        match self {
            Self::AddAgent => "add_agent",
            Self::RemoveAgent { .. } => "remove_agent",
            Self::RemoveClient => "remove_client",
            Self::Move { .. } => "move",
            Self::Turn { .. } => "turn",
            Self::NoOp { .. } => "no_op",
            Self::SetActive { .. } => "set_active",
            Self::IsActive { .. } => "is_active",
            Self::GetMap { .. } => "get_map",
            Self::GetAgentIds => "get_agent_ids",
            Self::GetAgentStates { .. } => "get_agent_states",
        }
    }
}

/// Outcome of a request or handshake.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Status {
    /// Success.
    Ok,
    /// The client lacks the required permission.
    PermissionDenied,
    /// The agent does not exist or is not owned by the client.
    InvalidAgentId,
    /// The agent already acted this step.
    AgentAlreadyActed,
    /// The action is disallowed by policy or otherwise invalid.
    ActionDisallowed,
    /// The spawn cell is occupied. Retry later.
    SpawnOccupied,
    /// The server failed to carry out the request.
    ServerError,
}

impl From<ActionRejected> for Status {
    fn from(rejected: ActionRejected) -> Self {
        match rejected {
            ActionRejected::UnknownAgent => Self::InvalidAgentId,
            ActionRejected::AlreadyActed => Self::AgentAlreadyActed,
            ActionRejected::Inactive
            | ActionRejected::Disallowed
            | ActionRejected::TooManySteps
            | ActionRejected::NoOpDisallowed => Self::ActionDisallowed,
        }
    }
}

impl From<&SimulatorError> for Status {
    fn from(err: &SimulatorError) -> Self {
        match err {
            SimulatorError::UnknownAgent(_) => Self::InvalidAgentId,
            _ => Self::ServerError,
        }
    }
}

impl From<&AddAgentError> for Status {
    fn from(err: &AddAgentError) -> Self {
        match err {
            AddAgentError::SpawnOccupied(_) => Self::SpawnOccupied,
            AddAgentError::Fatal(inner) => inner.into(),
        }
    }
}

/// Payload of a successful response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ResponseBody {
    /// Nothing to return.
    Empty,
    /// A single agent.
    Agent {
        /// Its state.
        state: AgentState,
    },
    /// Activity of an agent.
    Active {
        /// Whether it is active.
        active: bool,
    },
    /// Rendered patches, row-major by patch coordinate.
    Map {
        /// The patches.
        patches: Vec<PatchState>,
    },
    /// Agent ids.
    AgentIds {
        /// The ids, increasing.
        agent_ids: Vec<AgentId>,
    },
    /// Agent states, in request order.
    AgentStates {
        /// The states.
        states: Vec<AgentState>,
    },
}

/// Messages sent by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ServerMessage {
    /// Handshake accepted.
    Welcome {
        /// The client's identity; keep it to reconnect.
        client_id: ClientId,
        /// Current logical time.
        time: u64,
        /// The simulator configuration.
        config: Box<SimulatorConfig>,
        /// States of the agents this client owns.
        agents: Vec<(AgentId, AgentState)>,
    },
    /// Handshake refused.
    Rejected {
        /// Why.
        status: Status,
    },
    /// Reply to one request.
    Response {
        /// The request being answered.
        request_id: u64,
        /// Outcome.
        status: Status,
        /// Payload, [`ResponseBody::Empty`] on failure.
        body: ResponseBody,
    },
    /// A step finished.
    StepCompleted {
        /// The new time.
        time: u64,
        /// States of the receiving client's agents.
        states: Vec<AgentState>,
    },
}

/// Write one framed message.
///
/// # Errors
///
/// Returns [`ProtocolError`] if encoding or writing fails, or if the
/// encoded message exceeds [`MAX_FRAME_LEN`].
pub async fn write_frame<W, T>(writer: &mut W, message: &T) -> Result<(), ProtocolError>
where
    W: AsyncWrite + Unpin,
    T: Serialize,
{
    let body = serde_json::to_vec(message)?;
    let len = u32::try_from(body.len())
        .ok()
        .filter(|len| *len <= MAX_FRAME_LEN)
        .ok_or_else(|| ProtocolError::FrameTooLarge {
            len: u64::try_from(body.len()).unwrap_or(u64::MAX),
        })?;
    writer.write_u32(len).await?;
    writer.write_all(&body).await?;
    writer.flush().await?;
    Ok(())
}

/// Read one framed message. Returns `None` if the stream ends cleanly
/// before a new frame starts.
///
/// # Errors
///
/// Returns [`ProtocolError`] on I/O failure, an oversized frame, a stream
/// ending mid-frame, or a body that does not decode.
pub async fn read_frame<R, T>(reader: &mut R) -> Result<Option<T>, ProtocolError>
where
    R: AsyncRead + Unpin,
    T: DeserializeOwned,
{
    let len = match reader.read_u32().await {
        Ok(len) => len,
        Err(e) if e.kind() == std::io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(e) => return Err(e.into()),
    };
    if len > MAX_FRAME_LEN {
        return Err(ProtocolError::FrameTooLarge {
            len: u64::from(len),
        });
    }
    let mut body = vec![0_u8; usize::try_from(len).unwrap_or(usize::MAX)];
    reader.read_exact(&mut body).await?;
    Ok(Some(serde_json::from_slice(&body)?))
}
