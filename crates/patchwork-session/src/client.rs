//! Async client for the session server.
//!
//! A background task reads every frame from the server, completes the
//! matching pending request, and publishes step notifications on a watch
//! channel. When the connection drops, that task ends: pending requests and
//! [`Client::next_step`] then fail with [`ClientError::ConnectionLost`].

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use patchwork_core::SimulatorConfig;
use patchwork_types::{AgentId, AgentState, ClientId, PatchState, Position, RelativeDirection};
use tokio::net::tcp::{OwnedReadHalf, OwnedWriteHalf};
use tokio::net::{TcpStream, ToSocketAddrs};
use tokio::sync::{oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::protocol::{
    ClientMessage, ProtocolError, Request, ResponseBody, ServerMessage, Status, read_frame,
    write_frame,
};

/// Errors returned by [`Client`] operations.
#[derive(Debug, thiserror::Error)]
pub enum ClientError {
    /// Connecting failed.
    #[error("failed to connect: {source}")]
    Connect {
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// Framing or decoding failed.
    #[error(transparent)]
    Protocol(#[from] ProtocolError),

    /// The server refused the handshake.
    #[error("handshake rejected: {status:?}")]
    Rejected {
        /// The server's reason.
        status: Status,
    },

    /// The server answered a request with a failure status.
    #[error("request failed: {status:?}")]
    Status {
        /// The server's status.
        status: Status,
    },

    /// The server answered with a payload of the wrong kind.
    #[error("unexpected response to {op}")]
    UnexpectedResponse {
        /// The request that got it.
        op: &'static str,
    },

    /// The connection is closed.
    #[error("connection lost")]
    ConnectionLost,
}

impl ClientError {
    /// Whether retrying the same request later may succeed.
    pub const fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Status {
                status: Status::SpawnOccupied
            }
        )
    }
}

/// One completed step as seen by this client.
#[derive(Debug, Clone, PartialEq)]
pub struct StepNotification {
    /// The new time.
    pub time: u64,
    /// States of this client's agents.
    pub states: Vec<AgentState>,
}

type PendingMap = BTreeMap<u64, oneshot::Sender<(Status, ResponseBody)>>;

/// Connection to a session server.
#[derive(Debug)]
pub struct Client {
    client_id: ClientId,
    config: SimulatorConfig,
    writer: tokio::sync::Mutex<OwnedWriteHalf>,
    pending: Arc<Mutex<PendingMap>>,
    next_request: AtomicU64,
    time: Arc<AtomicU64>,
    /// Latest step time handed to a caller of `next_step` or `wait_for_step`.
    seen: AtomicU64,
    owned: Mutex<BTreeSet<AgentId>>,
    steps: watch::Receiver<Option<StepNotification>>,
    reader: JoinHandle<()>,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl Client {
    /// Connect and perform the handshake. Pass the id of an earlier session
    /// to take back its agents.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Connect`] if the server is unreachable and
    /// [`ClientError::Rejected`] if it refuses the handshake.
    pub async fn connect<A: ToSocketAddrs>(
        addr: A,
        client_id: Option<ClientId>,
    ) -> Result<Self, ClientError> {
        let stream = TcpStream::connect(addr)
            .await
            .map_err(|source| ClientError::Connect { source })?;
        let (mut reader, mut writer) = stream.into_split();
        write_frame(&mut writer, &ClientMessage::Hello { client_id }).await?;

        let (client_id, time, config, agents) = match read_frame(&mut reader).await? {
            Some(ServerMessage::Welcome {
                client_id,
                time,
                config,
                agents,
            }) => (client_id, time, *config, agents),
            Some(ServerMessage::Rejected { status }) => return Err(ClientError::Rejected { status }),
            Some(_) => return Err(ClientError::UnexpectedResponse { op: "hello" }),
            None => return Err(ClientError::ConnectionLost),
        };
        info!(%client_id, time, agents = agents.len(), "Connected to session server");

        let pending = Arc::new(Mutex::new(PendingMap::new()));
        let time = Arc::new(AtomicU64::new(time));
        let (steps_tx, steps) = watch::channel(None);
        let reader = tokio::spawn(read_loop(
            reader,
            Arc::clone(&pending),
            Arc::clone(&time),
            steps_tx,
        ));

        Ok(Self {
            client_id,
            config,
            writer: tokio::sync::Mutex::new(writer),
            pending,
            next_request: AtomicU64::new(0),
            seen: AtomicU64::new(time.load(Ordering::Acquire)),
            time,
            owned: Mutex::new(agents.into_iter().map(|(id, _)| id).collect()),
            steps,
            reader,
        })
    }

    /// This client's identity. Keep it to reconnect later.
    pub const fn client_id(&self) -> ClientId {
        self.client_id
    }

    /// The simulator configuration sent in the handshake.
    pub const fn config(&self) -> &SimulatorConfig {
        &self.config
    }

    /// Latest time announced by the server.
    pub fn time(&self) -> u64 {
        self.time.load(Ordering::Acquire)
    }

    /// Agents owned by this client.
    pub fn owned_agents(&self) -> Vec<AgentId> {
        lock(&self.owned).iter().copied().collect()
    }

    /// Wait for a step this client has not been told about yet.
    ///
    /// A step that completed before the call, for example while the
    /// caller was still awaiting the response to its action, is returned
    /// at once. If several steps completed since the last call, only the
    /// newest is returned.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ConnectionLost`] once the connection is closed.
    pub async fn next_step(&self) -> Result<StepNotification, ClientError> {
        let mut steps = self.steps.clone();
        loop {
            let seen = self.seen.load(Ordering::Acquire);
            let unseen = steps
                .borrow_and_update()
                .clone()
                .filter(|step| step.time > seen);
            if let Some(step) = unseen {
                self.seen.fetch_max(step.time, Ordering::AcqRel);
                return Ok(step);
            }
            steps
                .changed()
                .await
                .map_err(|_closed| ClientError::ConnectionLost)?;
        }
    }

    /// Wait until the time passes `observed_time`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::ConnectionLost`] once the connection is closed.
    pub async fn wait_for_step(&self, observed_time: u64) -> Result<u64, ClientError> {
        let mut steps = self.steps.clone();
        loop {
            steps.borrow_and_update();
            let time = self.time();
            if time > observed_time {
                self.seen.fetch_max(time, Ordering::AcqRel);
                return Ok(time);
            }
            steps
                .changed()
                .await
                .map_err(|_closed| ClientError::ConnectionLost)?;
        }
    }

    /// Resolves once the connection is closed.
    pub async fn lost_connection(&self) {
        let mut steps = self.steps.clone();
        while steps.changed().await.is_ok() {}
    }

    async fn request(&self, request: Request) -> Result<ResponseBody, ClientError> {
        let request_id = self.next_request.fetch_add(1, Ordering::Relaxed);
        let (tx, rx) = oneshot::channel();
        lock(&self.pending).insert(request_id, tx);
        let op = request.name();
        let sent = {
            let mut writer = self.writer.lock().await;
            write_frame(&mut *writer, &ClientMessage::Request { request_id, request }).await
        };
        if let Err(e) = sent {
            lock(&self.pending).remove(&request_id);
            return Err(e.into());
        }
        let (status, body) = rx.await.map_err(|_closed| ClientError::ConnectionLost)?;
        debug!(request_id, op, ?status, "Response received");
        if status == Status::Ok {
            Ok(body)
        } else {
            Err(ClientError::Status { status })
        }
    }

    async fn request_empty(&self, request: Request) -> Result<(), ClientError> {
        let op = request.name();
        match self.request(request).await? {
            ResponseBody::Empty => Ok(()),
            _ => Err(ClientError::UnexpectedResponse { op }),
        }
    }

    /// Spawn an agent owned by this client.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Status`] with [`Status::SpawnOccupied`]
    /// (retryable) or another failure status.
    pub async fn add_agent(&self) -> Result<AgentState, ClientError> {
        match self.request(Request::AddAgent).await? {
            ResponseBody::Agent { state } => {
                lock(&self.owned).insert(state.id);
                Ok(state)
            }
            _ => Err(ClientError::UnexpectedResponse { op: "add_agent" }),
        }
    }

    /// Delete one of this client's agents.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] if the request fails.
    pub async fn remove_agent(&self, agent_id: AgentId) -> Result<(), ClientError> {
        self.request_empty(Request::RemoveAgent { agent_id }).await?;
        lock(&self.owned).remove(&agent_id);
        Ok(())
    }

    /// Delete this client and every agent it owns on the server.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] if the request fails.
    pub async fn remove_client(&self) -> Result<(), ClientError> {
        self.request_empty(Request::RemoveClient).await?;
        lock(&self.owned).clear();
        Ok(())
    }

    /// Request a move.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Status`] if the server refuses the intent.
    pub async fn move_agent(
        &self,
        agent_id: AgentId,
        direction: RelativeDirection,
        steps: u32,
    ) -> Result<(), ClientError> {
        self.request_empty(Request::Move {
            agent_id,
            direction,
            steps,
        })
        .await
    }

    /// Request a turn.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Status`] if the server refuses the intent.
    pub async fn turn_agent(
        &self,
        agent_id: AgentId,
        direction: RelativeDirection,
    ) -> Result<(), ClientError> {
        self.request_empty(Request::Turn {
            agent_id,
            direction,
        })
        .await
    }

    /// Pass this step.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError::Status`] if the server refuses the intent.
    pub async fn no_op(&self, agent_id: AgentId) -> Result<(), ClientError> {
        self.request_empty(Request::NoOp { agent_id }).await
    }

    /// Activate or deactivate an owned agent.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] if the request fails.
    pub async fn set_active(&self, agent_id: AgentId, active: bool) -> Result<(), ClientError> {
        self.request_empty(Request::SetActive { agent_id, active })
            .await
    }

    /// Whether an owned agent is active.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] if the request fails.
    pub async fn is_active(&self, agent_id: AgentId) -> Result<bool, ClientError> {
        match self.request(Request::IsActive { agent_id }).await? {
            ResponseBody::Active { active } => Ok(active),
            _ => Err(ClientError::UnexpectedResponse { op: "is_active" }),
        }
    }

    /// Render patches intersecting `[bottom_left, top_right]`.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] if the request fails.
    pub async fn get_map(
        &self,
        bottom_left: Position,
        top_right: Position,
        with_scent: bool,
        with_vision: bool,
    ) -> Result<Vec<PatchState>, ClientError> {
        let request = Request::GetMap {
            bottom_left,
            top_right,
            with_scent,
            with_vision,
        };
        match self.request(request).await? {
            ResponseBody::Map { patches } => Ok(patches),
            _ => Err(ClientError::UnexpectedResponse { op: "get_map" }),
        }
    }

    /// Every agent id in the simulator.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] if the request fails.
    pub async fn agent_ids(&self) -> Result<Vec<AgentId>, ClientError> {
        match self.request(Request::GetAgentIds).await? {
            ResponseBody::AgentIds { agent_ids } => Ok(agent_ids),
            _ => Err(ClientError::UnexpectedResponse { op: "get_agent_ids" }),
        }
    }

    /// States of the given agents.
    ///
    /// # Errors
    ///
    /// Returns [`ClientError`] if the request fails.
    pub async fn agent_states(&self, agent_ids: &[AgentId]) -> Result<Vec<AgentState>, ClientError> {
        let request = Request::GetAgentStates {
            agent_ids: agent_ids.to_vec(),
        };
        match self.request(request).await? {
            ResponseBody::AgentStates { states } => Ok(states),
            _ => Err(ClientError::UnexpectedResponse {
                op: "get_agent_states",
            }),
        }
    }
}

impl Drop for Client {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

async fn read_loop(
    mut reader: OwnedReadHalf,
    pending: Arc<Mutex<PendingMap>>,
    time: Arc<AtomicU64>,
    steps: watch::Sender<Option<StepNotification>>,
) {
    loop {
        let message = match read_frame::<_, ServerMessage>(&mut reader).await {
            Ok(Some(message)) => message,
            Ok(None) => break,
            Err(e) => {
                warn!(error = %e, "Connection to server failed");
                break;
            }
        };
        match message {
            ServerMessage::Response {
                request_id,
                status,
                body,
            } => {
                let waiter = lock(&pending).remove(&request_id);
                match waiter {
                    Some(tx) => {
                        if tx.send((status, body)).is_err() {
                            debug!(request_id, "Requester gave up");
                        }
                    }
                    None => warn!(request_id, "Response to unknown request"),
                }
            }
            ServerMessage::StepCompleted { time: now, states } => {
                time.fetch_max(now, Ordering::AcqRel);
                steps.send_replace(Some(StepNotification { time: now, states }));
            }
            ServerMessage::Welcome { .. } | ServerMessage::Rejected { .. } => {
                warn!("Unexpected handshake message");
            }
        }
    }
    // Dropping the waiters fails every outstanding request.
    lock(&pending).clear();
    info!("Disconnected from session server");
}
