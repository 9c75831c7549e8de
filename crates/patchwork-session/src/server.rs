//! TCP session server.
//!
//! Task layout:
//!
//! - an accept loop pushes new sockets into a bounded connection queue;
//! - a dispatcher pops sockets and spawns one task per connection, which
//!   performs the handshake, then reads request frames into a bounded job
//!   queue while a sibling writer task drains the connection's outbox;
//! - `num_workers` workers pop jobs, run them against the simulator on the
//!   blocking pool, and post responses to the originating outbox;
//! - a forwarder turns each step report into one `StepCompleted` per
//!   connected client, carrying only that client's agents;
//! - with a step timeout configured, a watchdog forces stalled steps.
//!
//! Clients own the agents they spawn. Dropping the connection deactivates
//! those agents so the rest of the world keeps stepping; reconnecting with
//! the same client id reactivates them. The client table (ids, owned agents,
//! per-client permissions) lives in a [`ClientDirectory`], which is saved
//! beside each simulator snapshot so a restarted server recognizes the
//! clients of the world it restored.

use std::collections::{BTreeMap, BTreeSet};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use std::time::Duration;

use patchwork_core::config::ServerConfig;
use patchwork_core::persistence::{self, PersistenceError};
use patchwork_core::{Simulator, StepReport};
use patchwork_types::{AgentId, ClientId, Permissions};
use serde::{Deserialize, Serialize};
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{broadcast, mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::protocol::{ClientMessage, Request, ResponseBody, ServerMessage, Status, read_frame, write_frame};

/// Messages buffered per connection before step notifications are dropped.
const OUTBOX_CAPACITY: usize = 1024;

/// Errors that can occur when starting the server.
#[derive(Debug, thiserror::Error)]
pub enum ServerError {
    /// Failed to bind the listening socket.
    #[error("failed to bind {addr}: {source}")]
    Bind {
        /// The address that was requested.
        addr: String,
        /// The underlying I/O error.
        source: std::io::Error,
    },

    /// No client with this id is registered.
    #[error("unknown client {client_id}")]
    UnknownClient {
        /// The id that was looked up.
        client_id: ClientId,
    },

    /// A task on the blocking pool panicked or was cancelled.
    #[error("blocking task failed: {source}")]
    Blocking {
        /// The underlying join error.
        #[from]
        source: tokio::task::JoinError,
    },
}

/// One client as written to disk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SavedClient {
    /// The client's identity.
    pub id: ClientId,
    /// Agents it owns.
    pub agents: Vec<AgentId>,
    /// Operations it may perform.
    pub permissions: Permissions,
}

/// Serializable form of the client table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClientTableSnapshot {
    /// Next id a new client will get.
    pub next_client_id: u64,
    /// Every registered client, in id order.
    pub clients: Vec<SavedClient>,
}

#[derive(Debug)]
struct ClientRecord {
    agents: BTreeSet<AgentId>,
    permissions: Permissions,
    /// Outbox of the live connection, `None` while disconnected.
    outbox: Option<mpsc::Sender<ServerMessage>>,
    /// Generation of the live connection.
    connection: u64,
}

#[derive(Debug, Default)]
struct ClientTable {
    clients: BTreeMap<ClientId, ClientRecord>,
    next_client: u64,
    next_connection: u64,
}

impl ClientTable {
    fn snapshot(&self) -> ClientTableSnapshot {
        ClientTableSnapshot {
            next_client_id: self.next_client,
            clients: self
                .clients
                .iter()
                .map(|(id, record)| SavedClient {
                    id: *id,
                    agents: record.agents.iter().copied().collect(),
                    permissions: record.permissions,
                })
                .collect(),
        }
    }
}

#[derive(Debug)]
struct ServerState {
    simulator: Simulator,
    default_permissions: Permissions,
    clients: Mutex<ClientTable>,
}

#[derive(Debug)]
struct Job {
    client_id: ClientId,
    request_id: u64,
    request: Request,
    reply: mpsc::Sender<ServerMessage>,
}

/// Entry point for starting a session server.
#[derive(Debug, Clone, Copy)]
pub struct Server;

impl Server {
    /// Serve a simulator that no client has connected to yet.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound.
    pub async fn start(config: &ServerConfig, simulator: Simulator) -> Result<ServerHandle, ServerError> {
        Self::serve(config, ClientDirectory::new(simulator, config.default_permissions)).await
    }

    /// Bind the listening socket and spawn every server task.
    ///
    /// No client is connected yet, so every agent of the simulator is taken
    /// out of the step barrier. Agents of a client in `clients` become
    /// active again when that client reconnects with its id.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::Bind`] if the address cannot be bound, or
    /// [`ServerError::Blocking`] if releasing the agents fails.
    pub async fn serve(config: &ServerConfig, clients: ClientDirectory) -> Result<ServerHandle, ServerError> {
        let addr = format!("{}:{}", config.bind_address, config.port);
        let listener = TcpListener::bind(&addr)
            .await
            .map_err(|source| ServerError::Bind {
                addr: addr.clone(),
                source,
            })?;
        let local_addr = listener
            .local_addr()
            .map_err(|source| ServerError::Bind { addr, source })?;

        let releasing = clients.simulator().clone();
        let released = tokio::task::spawn_blocking(move || releasing.deactivate_all()).await?;
        if released > 0 {
            info!(released, "Agents wait for their clients to reconnect");
        }

        let state = Arc::clone(&clients.state);
        let step_timeout = state.simulator.config().step_timeout();
        let capacity = config.conn_queue_capacity.max(1);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let (conn_tx, conn_rx) = mpsc::channel::<TcpStream>(capacity);
        let (job_tx, job_rx) = mpsc::channel::<Job>(capacity);
        let job_rx = Arc::new(tokio::sync::Mutex::new(job_rx));

        let mut tasks = vec![
            tokio::spawn(accept_loop(listener, conn_tx, shutdown_rx.clone())),
            tokio::spawn(dispatch_connections(
                conn_rx,
                Arc::clone(&state),
                job_tx,
                shutdown_rx.clone(),
            )),
            tokio::spawn(forward_steps(Arc::clone(&state), shutdown_rx.clone())),
        ];
        let workers = config.num_workers.max(1);
        for index in 0..workers {
            tasks.push(tokio::spawn(run_worker(
                index,
                Arc::clone(&job_rx),
                Arc::clone(&state),
            )));
        }
        if let Some(timeout) = step_timeout {
            tasks.push(tokio::spawn(watchdog(
                state.simulator.clone(),
                timeout,
                shutdown_rx,
            )));
        }

        info!(%local_addr, workers, ?step_timeout, "Session server listening");
        Ok(ServerHandle {
            local_addr,
            clients,
            shutdown: shutdown_tx,
            tasks,
        })
    }
}

/// Shared handle to the client table and the simulator it serves.
///
/// Cloning is cheap; the server and the autosave task hold the same table.
#[derive(Debug, Clone)]
pub struct ClientDirectory {
    state: Arc<ServerState>,
}

impl ClientDirectory {
    /// An empty table for `simulator`. New clients get `default_permissions`.
    pub fn new(simulator: Simulator, default_permissions: Permissions) -> Self {
        Self::from_table(simulator, default_permissions, ClientTable::default())
    }

    /// Rebuild the table saved with `simulator`'s snapshot. Owned agents
    /// that no longer exist are dropped.
    pub fn restore(
        simulator: Simulator,
        default_permissions: Permissions,
        snapshot: ClientTableSnapshot,
    ) -> Self {
        let known: BTreeSet<AgentId> = simulator.agent_ids().into_iter().collect();
        let mut table = ClientTable {
            next_client: snapshot.next_client_id,
            ..ClientTable::default()
        };
        for saved in snapshot.clients {
            let (agents, missing): (BTreeSet<AgentId>, BTreeSet<AgentId>) =
                saved.agents.into_iter().partition(|id| known.contains(id));
            if !missing.is_empty() {
                warn!(client_id = %saved.id, ?missing, "Dropping agents absent from the snapshot");
            }
            table.next_client = table.next_client.max(saved.id.into_inner().saturating_add(1));
            table.clients.insert(
                saved.id,
                ClientRecord {
                    agents,
                    permissions: saved.permissions,
                    outbox: None,
                    connection: 0,
                },
            );
        }
        info!(clients = table.clients.len(), "Client table restored");
        Self::from_table(simulator, default_permissions, table)
    }

    /// Restore the simulator saved at `time` under `prefix` together with
    /// its client table. A snapshot without a table restores with no
    /// clients, and its agents stay inactive.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError`] if either file is unreadable or malformed.
    pub fn load(prefix: &str, time: u64, default_permissions: Permissions) -> Result<Self, PersistenceError> {
        let simulator = Simulator::load(prefix, time)?;
        let path = persistence::clients_path(prefix, time);
        let snapshot = match std::fs::read(&path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|source| PersistenceError::Json {
                path: path.clone(),
                source,
            })?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                warn!(path = %path.display(), "No client table beside the snapshot");
                ClientTableSnapshot::default()
            }
            Err(source) => return Err(PersistenceError::Io { path, source }),
        };
        Ok(Self::restore(simulator, default_permissions, snapshot))
    }

    fn from_table(simulator: Simulator, default_permissions: Permissions, table: ClientTable) -> Self {
        Self {
            state: Arc::new(ServerState {
                simulator,
                default_permissions,
                clients: Mutex::new(table),
            }),
        }
    }

    /// The simulator being served.
    pub fn simulator(&self) -> &Simulator {
        &self.state.simulator
    }

    /// Permissions of `client_id`, or `None` for an unknown client.
    pub fn permissions(&self, client_id: ClientId) -> Option<Permissions> {
        self.state
            .lock_clients()
            .clients
            .get(&client_id)
            .map(|record| record.permissions)
    }

    /// Replace the permissions of `client_id`. Requests already queued are
    /// checked against the new set.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::UnknownClient`] if no such client is registered.
    pub fn set_permissions(&self, client_id: ClientId, permissions: Permissions) -> Result<(), ServerError> {
        let mut table = self.state.lock_clients();
        let record = table
            .clients
            .get_mut(&client_id)
            .ok_or(ServerError::UnknownClient { client_id })?;
        record.permissions = permissions;
        info!(%client_id, ?permissions, "Client permissions changed");
        Ok(())
    }

    /// Capture the client table.
    pub fn snapshot(&self) -> ClientTableSnapshot {
        self.state.lock_clients().snapshot()
    }

    /// Write the simulator snapshot to `{prefix}{time}` and the client table
    /// beside it, both captured at the same instant. Returns the simulator
    /// snapshot's path.
    ///
    /// # Errors
    ///
    /// Returns [`PersistenceError`] if either file cannot be written.
    pub fn save(&self, prefix: &str) -> Result<PathBuf, PersistenceError> {
        let (world, clients) = {
            let table = self.state.lock_clients();
            (self.state.simulator.snapshot(), table.snapshot())
        };
        let path = persistence::write_snapshot(&world, prefix)?;
        let table_path = persistence::clients_path(prefix, world.time);
        let json = serde_json::to_vec(&clients).map_err(|source| PersistenceError::Json {
            path: table_path.clone(),
            source,
        })?;
        persistence::write_atomically(&table_path, &json)?;
        debug!(path = %table_path.display(), clients = clients.clients.len(), "Client table saved");
        Ok(path)
    }
}

/// Handle to a running server.
#[derive(Debug)]
pub struct ServerHandle {
    local_addr: SocketAddr,
    clients: ClientDirectory,
    shutdown: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

impl ServerHandle {
    /// The address the server is listening on.
    pub const fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The client table this server maintains.
    pub const fn clients(&self) -> &ClientDirectory {
        &self.clients
    }

    /// Permissions of `client_id`, or `None` for an unknown client.
    pub fn permissions(&self, client_id: ClientId) -> Option<Permissions> {
        self.clients.permissions(client_id)
    }

    /// Replace the permissions of one client.
    ///
    /// # Errors
    ///
    /// Returns [`ServerError::UnknownClient`] if no such client is registered.
    pub fn set_permissions(&self, client_id: ClientId, permissions: Permissions) -> Result<(), ServerError> {
        self.clients.set_permissions(client_id, permissions)
    }

    /// Stop accepting, close every connection, and wait for the server's
    /// tasks to finish.
    pub async fn shutdown(self) {
        if self.shutdown.send(true).is_err() {
            debug!("Server tasks already stopped");
        }
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Server task failed");
            }
        }
        info!("Session server stopped");
    }
}

async fn accept_loop(
    listener: TcpListener,
    connections: mpsc::Sender<TcpStream>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "Connection accepted");
                    if connections.send(stream).await.is_err() {
                        break;
                    }
                }
                Err(e) => warn!(error = %e, "Accept failed"),
            },
            _ = shutdown.changed() => break,
        }
    }
    debug!("Accept loop stopped");
}

async fn dispatch_connections(
    mut connections: mpsc::Receiver<TcpStream>,
    state: Arc<ServerState>,
    jobs: mpsc::Sender<Job>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        let stream = tokio::select! {
            stream = connections.recv() => stream,
            _ = shutdown.changed() => None,
        };
        let Some(stream) = stream else { break };
        tokio::spawn(serve_connection(
            stream,
            Arc::clone(&state),
            jobs.clone(),
            shutdown.clone(),
        ));
    }
}

async fn serve_connection(
    stream: TcpStream,
    state: Arc<ServerState>,
    jobs: mpsc::Sender<Job>,
    mut shutdown: watch::Receiver<bool>,
) {
    let peer = stream.peer_addr().ok();
    let (mut reader, mut writer) = stream.into_split();

    let hello = tokio::select! {
        frame = read_frame::<_, ClientMessage>(&mut reader) => frame,
        _ = shutdown.changed() => return,
    };
    let requested = match hello {
        Ok(Some(ClientMessage::Hello { client_id })) => client_id,
        Ok(Some(ClientMessage::Request { .. })) => {
            warn!(?peer, "Request before handshake");
            return;
        }
        Ok(None) => return,
        Err(e) => {
            warn!(?peer, error = %e, "Handshake failed");
            return;
        }
    };

    let (outbox, mut outbox_rx) = mpsc::channel(OUTBOX_CAPACITY);
    let connecting = Arc::clone(&state);
    let welcome_outbox = outbox.clone();
    let session =
        tokio::task::spawn_blocking(move || connecting.connect(requested, &welcome_outbox)).await;
    let (client_id, connection) = match session {
        Ok(Ok(session)) => session,
        Ok(Err(status)) => {
            if let Err(e) = write_frame(&mut writer, &ServerMessage::Rejected { status }).await {
                debug!(?peer, error = %e, "Failed to send rejection");
            }
            return;
        }
        Err(e) => {
            error!(?peer, error = %e, "Handshake task failed");
            return;
        }
    };

    let writer_task = tokio::spawn(async move {
        while let Some(message) = outbox_rx.recv().await {
            if let Err(e) = write_frame(&mut writer, &message).await {
                debug!(%client_id, error = %e, "Write failed");
                break;
            }
        }
    });

    loop {
        let frame = tokio::select! {
            frame = read_frame::<_, ClientMessage>(&mut reader) => frame,
            _ = shutdown.changed() => break,
        };
        match frame {
            Ok(Some(ClientMessage::Request { request_id, request })) => {
                let job = Job {
                    client_id,
                    request_id,
                    request,
                    reply: outbox.clone(),
                };
                if jobs.send(job).await.is_err() {
                    break;
                }
            }
            Ok(Some(ClientMessage::Hello { .. })) => {
                warn!(%client_id, "Ignoring repeated hello");
            }
            Ok(None) => break,
            Err(e) => {
                warn!(%client_id, error = %e, "Dropping connection");
                break;
            }
        }
    }

    drop(outbox);
    let cleanup = Arc::clone(&state);
    if let Err(e) =
        tokio::task::spawn_blocking(move || cleanup.disconnect(client_id, connection)).await
    {
        error!(%client_id, error = %e, "Disconnect cleanup failed");
    }
    if let Err(e) = writer_task.await {
        warn!(%client_id, error = %e, "Writer task failed");
    }
}

async fn run_worker(
    index: usize,
    jobs: Arc<tokio::sync::Mutex<mpsc::Receiver<Job>>>,
    state: Arc<ServerState>,
) {
    loop {
        let job = jobs.lock().await.recv().await;
        let Some(Job {
            client_id,
            request_id,
            request,
            reply,
        }) = job
        else {
            break;
        };
        let op = request.name();
        let worker_state = Arc::clone(&state);
        let (status, body) =
            match tokio::task::spawn_blocking(move || worker_state.execute(client_id, request)).await {
                Ok(result) => result,
                Err(e) => {
                    error!(%client_id, op, error = %e, "Request execution failed");
                    (Status::ServerError, ResponseBody::Empty)
                }
            };
        debug!(worker = index, %client_id, request_id, op, ?status, "Request handled");
        let response = ServerMessage::Response {
            request_id,
            status,
            body,
        };
        if reply.send(response).await.is_err() {
            debug!(%client_id, request_id, "Client gone before response");
        }
    }
    debug!(worker = index, "Worker stopped");
}

async fn forward_steps(state: Arc<ServerState>, mut shutdown: watch::Receiver<bool>) {
    let mut steps = state.simulator.subscribe();
    loop {
        let received = tokio::select! {
            received = steps.recv() => received,
            _ = shutdown.changed() => break,
        };
        match received {
            Ok(report) => state.fan_out(&report),
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
                warn!(skipped, "Step forwarder lagged, skipping ahead");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
}

async fn watchdog(simulator: Simulator, timeout: Duration, mut shutdown: watch::Receiver<bool>) {
    loop {
        let observed = simulator.time();
        let waiting = simulator.clone();
        let wait = tokio::task::spawn_blocking(move || waiting.wait_for_step(observed, Some(timeout)));
        tokio::select! {
            waited = wait => match waited {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => {
                    error!(error = %e, "Watchdog could not force the step");
                    break;
                }
                Err(e) => {
                    error!(error = %e, "Watchdog wait failed");
                    break;
                }
            },
            _ = shutdown.changed() => break,
        }
    }
}

const fn reply(status: Status) -> (Status, ResponseBody) {
    (status, ResponseBody::Empty)
}

impl ServerState {
    fn lock_clients(&self) -> MutexGuard<'_, ClientTable> {
        self.clients.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Register a new client or resume an existing one, and queue the
    /// welcome message. Returns the client id and connection generation.
    fn connect(
        &self,
        requested: Option<ClientId>,
        outbox: &mpsc::Sender<ServerMessage>,
    ) -> Result<(ClientId, u64), Status> {
        let mut table = self.lock_clients();
        let connection = table.next_connection;
        table.next_connection = connection.saturating_add(1);

        let client_id = match requested {
            None => {
                let id = ClientId(table.next_client);
                table.next_client = table.next_client.saturating_add(1);
                table.clients.insert(
                    id,
                    ClientRecord {
                        agents: BTreeSet::new(),
                        permissions: self.default_permissions,
                        outbox: None,
                        connection,
                    },
                );
                id
            }
            Some(id) => match table.clients.get(&id) {
                Some(record) if record.outbox.is_none() => id,
                Some(_) => {
                    warn!(client_id = %id, "Client id already connected");
                    return Err(Status::PermissionDenied);
                }
                None => {
                    warn!(client_id = %id, "Unknown client id");
                    return Err(Status::PermissionDenied);
                }
            },
        };

        let record = table
            .clients
            .get_mut(&client_id)
            .ok_or(Status::ServerError)?;
        record.outbox = Some(outbox.clone());
        record.connection = connection;
        let agents: Vec<AgentId> = record.agents.iter().copied().collect();
        for id in &agents {
            if let Err(e) = self.simulator.set_active(*id, true) {
                warn!(%client_id, agent_id = %id, error = %e, "Failed to reactivate agent");
            }
        }
        let states = self.simulator.agent_states(&agents).unwrap_or_default();
        let welcome = ServerMessage::Welcome {
            client_id,
            time: self.simulator.time(),
            config: Box::new(self.simulator.config().clone()),
            agents: states.into_iter().map(|s| (s.id, s)).collect(),
        };
        outbox.try_send(welcome).map_err(|_full| Status::ServerError)?;
        info!(%client_id, resumed = requested.is_some(), agents = agents.len(), "Client connected");
        Ok((client_id, connection))
    }

    /// Mark the client disconnected and release its agents from the barrier.
    fn disconnect(&self, client_id: ClientId, connection: u64) {
        let mut table = self.lock_clients();
        let Some(record) = table.clients.get_mut(&client_id) else {
            return;
        };
        if record.connection != connection {
            return;
        }
        record.outbox = None;
        for id in &record.agents {
            if let Err(e) = self.simulator.set_active(*id, false) {
                debug!(%client_id, agent_id = %id, error = %e, "Failed to deactivate agent");
            }
        }
        info!(%client_id, agents = record.agents.len(), "Client disconnected");
    }

    /// Record `agent_id` as owned by `client_id`.
    fn adopt(&self, client_id: ClientId, agent_id: AgentId) {
        let mut table = self.lock_clients();
        match table.clients.get_mut(&client_id) {
            Some(record) => {
                record.agents.insert(agent_id);
                if record.outbox.is_none() && self.simulator.set_active(agent_id, false).is_err() {
                    debug!(%client_id, %agent_id, "Agent vanished before adoption");
                }
            }
            None => {
                if self.simulator.remove_agent(agent_id).is_err() {
                    debug!(%client_id, %agent_id, "Agent vanished before adoption");
                }
            }
        }
    }

    fn remove_client(&self, client_id: ClientId) -> (Status, ResponseBody) {
        let Some(record) = self.lock_clients().clients.remove(&client_id) else {
            return reply(Status::PermissionDenied);
        };
        for id in &record.agents {
            if let Err(e) = self.simulator.remove_agent(*id) {
                debug!(%client_id, agent_id = %id, error = %e, "Agent already gone");
            }
        }
        info!(%client_id, agents = record.agents.len(), "Client removed");
        reply(Status::Ok)
    }

    /// Run one request on behalf of `client_id`.
    fn execute(&self, client_id: ClientId, request: Request) -> (Status, ResponseBody) {
        let (permissions, owned) = {
            let table = self.lock_clients();
            match table.clients.get(&client_id) {
                Some(record) => (record.permissions, record.agents.clone()),
                None => return reply(Status::PermissionDenied),
            }
        };
        let sim = &self.simulator;
        let acted = |result: Result<(), patchwork_core::ActionRejected>| match result {
            Ok(()) => reply(Status::Ok),
            Err(rejected) => reply(rejected.into()),
        };

        match request {
            Request::AddAgent if !permissions.add_agent => reply(Status::PermissionDenied),
            Request::AddAgent => match sim.add_agent() {
                Ok((agent_id, state)) => {
                    self.adopt(client_id, agent_id);
                    (Status::Ok, ResponseBody::Agent { state })
                }
                Err(e) => reply((&e).into()),
            },
            Request::RemoveAgent { .. } if !permissions.remove_agent => {
                reply(Status::PermissionDenied)
            }
            Request::RemoveAgent { agent_id } if owned.contains(&agent_id) => {
                match sim.remove_agent(agent_id) {
                    Ok(_) => {
                        let mut table = self.lock_clients();
                        if let Some(record) = table.clients.get_mut(&client_id) {
                            record.agents.remove(&agent_id);
                        }
                        reply(Status::Ok)
                    }
                    Err(e) => reply((&e).into()),
                }
            }
            Request::RemoveClient if !permissions.remove_client => reply(Status::PermissionDenied),
            Request::RemoveClient => self.remove_client(client_id),
            Request::Move {
                agent_id,
                direction,
                steps,
            } if owned.contains(&agent_id) => acted(sim.move_agent(agent_id, direction, steps)),
            Request::Turn {
                agent_id,
                direction,
            } if owned.contains(&agent_id) => acted(sim.turn_agent(agent_id, direction)),
            Request::NoOp { agent_id } if owned.contains(&agent_id) => acted(sim.no_op(agent_id)),
            Request::SetActive { .. } if !permissions.set_active => reply(Status::PermissionDenied),
            Request::SetActive { agent_id, active } if owned.contains(&agent_id) => {
                match sim.set_active(agent_id, active) {
                    Ok(()) => reply(Status::Ok),
                    Err(e) => reply((&e).into()),
                }
            }
            Request::IsActive { agent_id } if owned.contains(&agent_id) => {
                match sim.is_active(agent_id) {
                    Ok(active) => (Status::Ok, ResponseBody::Active { active }),
                    Err(e) => reply((&e).into()),
                }
            }
            Request::RemoveAgent { .. }
            | Request::Move { .. }
            | Request::Turn { .. }
            | Request::NoOp { .. }
            | Request::SetActive { .. }
            | Request::IsActive { .. } => reply(Status::InvalidAgentId),
            Request::GetMap { .. } if !permissions.get_map => reply(Status::PermissionDenied),
            Request::GetMap {
                bottom_left,
                top_right,
                with_scent,
                with_vision,
            } => {
                let patches = sim.get_map(bottom_left, top_right, with_scent, with_vision);
                (Status::Ok, ResponseBody::Map { patches })
            }
            Request::GetAgentIds if !permissions.get_agent_ids => reply(Status::PermissionDenied),
            Request::GetAgentIds => (
                Status::Ok,
                ResponseBody::AgentIds {
                    agent_ids: sim.agent_ids(),
                },
            ),
            Request::GetAgentStates { agent_ids }
                if permissions.get_agent_states || agent_ids.iter().all(|id| owned.contains(id)) =>
            {
                match sim.agent_states(&agent_ids) {
                    Ok(states) => (Status::Ok, ResponseBody::AgentStates { states }),
                    Err(e) => reply((&e).into()),
                }
            }
            Request::GetAgentStates { .. } => reply(Status::PermissionDenied),
        }
    }

    /// Queue a `StepCompleted` for every connected client.
    fn fan_out(&self, report: &StepReport) {
        let table = self.lock_clients();
        for (client_id, record) in &table.clients {
            let Some(outbox) = &record.outbox else { continue };
            let states = record
                .agents
                .iter()
                .filter_map(|id| report.states.get(id).cloned())
                .collect();
            let message = ServerMessage::StepCompleted {
                time: report.time,
                states,
            };
            if outbox.try_send(message).is_err() {
                warn!(%client_id, time = report.time, "Outbox full, dropping step notification");
            }
        }
    }
}
