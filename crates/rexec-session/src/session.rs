//! Remote execution session
//!
//! The session ties discovery, the command connection and the event registry
//! together. It is an explicit object: create as many as needed, share one
//! behind an `Arc` to call it from several tasks.
//!
//! # Connection lifecycle
//!
//! ```text
//! Closed --open_command_connection--> Opening --node dials in--> Open
//!    ^                                   |                        |
//!    +----------- timeout / error -------+                        |
//!    +------ close_command_connection / remote hangup / stop -----+
//! ```
//!
//! Connection attempts are serialized. A caller that arrives while an attempt
//! for the same node is running shares its outcome; a caller for another node
//! waits for the attempt to resolve and then applies the usual rules.

use std::sync::{Arc, Mutex, MutexGuard, PoisonError, RwLock};
use std::time::Duration;

use tokio::sync::watch;
use tokio_util::sync::CancellationToken;

use rexec_core::config::RemoteExecutionConfig;
use rexec_core::{
    CloseReason, CommandResult, ConnectionState, DiscoveryError, EventKind, EventRegistry,
    RemoteNode, SessionError, SessionEvent, SubscriptionId,
};
use rexec_protocol::{CommandResultData, ExecMode, Message, NodeId};

use crate::command::{CommandChannel, CommandListener};
use crate::discovery::{
    DiscoveryChannel, MulticastTransportFactory, NodeRegistry, TransportFactory,
};

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// Command connection bookkeeping, shared with the connection task's close
/// callback
struct ConnectionSlot {
    /// Bumped for every attempt so a stale close callback can be recognised
    generation: u64,
    state: ConnectionState,
    node: Option<RemoteNode>,
    channel: Option<Arc<CommandChannel>>,
    /// Cancels the attempt while `Opening`
    opening: Option<CancellationToken>,
}

impl ConnectionSlot {
    fn reset(&mut self) {
        self.state = ConnectionState::Closed;
        self.node = None;
        self.channel = None;
        self.opening = None;
    }
}

/// `None` while the attempt runs, then its outcome
type AttemptOutcome = Option<Result<(), String>>;

/// The connection attempt currently in progress
struct PendingAttempt {
    node_id: NodeId,
    outcome: watch::Receiver<AttemptOutcome>,
}

enum Turn {
    Lead(watch::Sender<AttemptOutcome>),
    Wait(NodeId, watch::Receiver<AttemptOutcome>),
}

/// Clears the attempt record when the leading caller finishes or is dropped
struct AttemptGuard<'a> {
    attempt: &'a Mutex<Option<PendingAttempt>>,
}

impl Drop for AttemptGuard<'_> {
    fn drop(&mut self) {
        lock(self.attempt).take();
    }
}

/// Returns the slot to `Closed` unless disarmed, so an abandoned attempt
/// never leaves the session stuck in `Opening`
struct OpeningGuard<'a> {
    connection: &'a Mutex<ConnectionSlot>,
    generation: u64,
    armed: bool,
}

impl Drop for OpeningGuard<'_> {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }
        let mut slot = lock(self.connection);
        if slot.generation == self.generation && slot.state == ConnectionState::Opening {
            slot.reset();
        }
    }
}

/// A remote execution session
pub struct Session {
    config: RemoteExecutionConfig,
    transports: Arc<dyn TransportFactory>,
    events: Arc<EventRegistry>,
    nodes: Arc<NodeRegistry>,
    local_id: RwLock<NodeId>,
    discovery: Mutex<Option<Arc<DiscoveryChannel>>>,
    connection: Arc<Mutex<ConnectionSlot>>,
    attempt: Mutex<Option<PendingAttempt>>,
}

impl Session {
    /// Create a stopped session that discovers nodes over UDP multicast
    pub fn new(config: RemoteExecutionConfig) -> Self {
        Self::with_transport_factory(config, Arc::new(MulticastTransportFactory))
    }

    /// Create a stopped session with a custom discovery transport
    pub fn with_transport_factory(
        config: RemoteExecutionConfig,
        transports: Arc<dyn TransportFactory>,
    ) -> Self {
        Self {
            config,
            transports,
            events: Arc::new(EventRegistry::new()),
            nodes: Arc::new(NodeRegistry::new()),
            local_id: RwLock::new(NodeId::generate()),
            discovery: Mutex::new(None),
            connection: Arc::new(Mutex::new(ConnectionSlot {
                generation: 0,
                state: ConnectionState::Closed,
                node: None,
                channel: None,
                opening: None,
            })),
            attempt: Mutex::new(None),
        }
    }

    /// Configuration the session was created with
    pub fn config(&self) -> &RemoteExecutionConfig {
        &self.config
    }

    /// Event registry
    pub fn events(&self) -> &EventRegistry {
        &self.events
    }

    /// Register a listener for session events of `kind`
    pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> SubscriptionId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        self.events.subscribe(kind, listener)
    }

    /// Remove a listener
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        self.events.unsubscribe(id)
    }

    /// Start discovery and begin searching for nodes.
    ///
    /// A fresh node id is generated on every start. Starting a running
    /// session does nothing. Must be called from within a Tokio runtime.
    pub fn start(&self) -> Result<(), SessionError> {
        let mut discovery = lock(&self.discovery);
        if discovery.is_some() {
            return Ok(());
        }

        let local_id = NodeId::generate();
        let transport = self.transports.open(&self.config)?;
        let channel = DiscoveryChannel::start(
            local_id.clone(),
            transport,
            Arc::clone(&self.nodes),
            Arc::clone(&self.events),
            self.config.node_timeout,
        );
        channel.start_searching(self.config.node_ping_interval)?;

        *self.local_id.write().unwrap_or_else(PoisonError::into_inner) = local_id.clone();
        *discovery = Some(Arc::new(channel));

        tracing::info!(
            "Session {} started (group {})",
            local_id,
            self.config.multicast_group_endpoint
        );
        Ok(())
    }

    /// Abandon any connection attempt, close the command connection, stop
    /// discovery and forget all nodes
    pub async fn stop(&self) {
        self.abort_opening();
        self.close_command_connection().await;

        let discovery = lock(&self.discovery).take();
        if let Some(discovery) = discovery {
            discovery.stop();
            tracing::info!("Session {} stopped", discovery.local_id());
        }
        self.nodes.clear();
    }

    /// Whether discovery is running
    pub fn is_running(&self) -> bool {
        lock(&self.discovery).is_some()
    }

    /// Id this session uses on the wire
    pub fn local_node_id(&self) -> NodeId {
        self.local_id
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Known nodes, oldest discovery first
    pub fn remote_nodes(&self) -> Vec<RemoteNode> {
        self.nodes.list()
    }

    /// Restart the search loop with a different ping interval
    pub fn start_searching_for_nodes(&self, interval: Duration) -> Result<(), SessionError> {
        self.discovery_channel()?.start_searching(interval)?;
        Ok(())
    }

    /// Stop pinging the group. Known nodes stay listed until the next search.
    pub fn stop_searching_for_nodes(&self) {
        if let Some(discovery) = lock(&self.discovery).as_ref() {
            discovery.stop_searching();
        }
    }

    /// Wait for the earliest discovered node, pinging every `interval`.
    ///
    /// Starts the session if needed.
    pub async fn get_first_remote_node(
        &self,
        interval: Duration,
        timeout: Duration,
    ) -> Result<RemoteNode, SessionError> {
        self.start()?;
        self.start_searching_for_nodes(interval)?;

        let deadline = tokio::time::Instant::now() + timeout;
        self.nodes
            .wait_for_first(deadline)
            .await
            .ok_or_else(|| SessionError::Timeout("Timed out waiting for a remote node".into()))
    }

    /// Open the command connection to `node`.
    ///
    /// Succeeds immediately if `node` is already connected. If another node
    /// holds the connection, fails with [`SessionError::AlreadyConnected`]
    /// unless `force` is set, in which case that connection is closed first.
    pub async fn open_command_connection(
        &self,
        node: &RemoteNode,
        force: bool,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        loop {
            let turn = {
                let mut attempt = lock(&self.attempt);
                let running = attempt
                    .as_ref()
                    .map(|pending| (pending.node_id.clone(), pending.outcome.clone()));
                match running {
                    Some((node_id, outcome)) => Turn::Wait(node_id, outcome),
                    None => {
                        let (sender, outcome) = watch::channel(None);
                        *attempt = Some(PendingAttempt {
                            node_id: node.node_id.clone(),
                            outcome,
                        });
                        Turn::Lead(sender)
                    }
                }
            };

            let (pending_node, mut outcome) = match turn {
                Turn::Lead(sender) => {
                    let _guard = AttemptGuard {
                        attempt: &self.attempt,
                    };
                    let result = self.drive_open(node, force, timeout).await;
                    sender.send_replace(Some(
                        result.as_ref().map(|_| ()).map_err(ToString::to_string),
                    ));
                    return result;
                }
                Turn::Wait(pending_node, outcome) => (pending_node, outcome),
            };

            tracing::debug!("Waiting for the connection attempt to {}", pending_node);
            let shared = match outcome.wait_for(Option::is_some).await {
                Ok(value) => value.clone(),
                // The leading caller was cancelled; run our own attempt
                Err(_) => None,
            };

            if pending_node == node.node_id {
                if let Some(result) = shared {
                    return result.map_err(SessionError::ConnectionAttemptFailed);
                }
            }
        }
    }

    async fn drive_open(
        &self,
        node: &RemoteNode,
        force: bool,
        timeout: Duration,
    ) -> Result<(), SessionError> {
        let current = {
            let slot = lock(&self.connection);
            match (slot.state, slot.node.as_ref()) {
                (ConnectionState::Open, Some(current)) => Some(current.node_id.clone()),
                _ => None,
            }
        };
        if let Some(current) = current {
            if current == node.node_id {
                return Ok(());
            }
            if !force {
                return Err(SessionError::AlreadyConnected { node_id: current });
            }
            tracing::info!("Closing connection to {} to connect to {}", current, node.node_id);
            self.close_command_connection().await;
        }

        self.start()?;
        let discovery = self.discovery_channel()?;
        let local_id = self.local_node_id();

        let abort = CancellationToken::new();
        let generation = {
            let mut slot = lock(&self.connection);
            slot.generation += 1;
            slot.state = ConnectionState::Opening;
            slot.node = Some(node.clone());
            slot.channel = None;
            slot.opening = Some(abort.clone());
            slot.generation
        };
        let mut opening = OpeningGuard {
            connection: &self.connection,
            generation,
            armed: true,
        };

        tracing::info!("Opening command connection to {}", node);
        let listener = CommandListener::bind(self.config.command_endpoint).await?;
        let request =
            Message::open_connection(local_id.clone(), node.node_id.clone(), listener.advertised());
        discovery.send(&request).await?;
        let (stream, peer) = tokio::select! {
            accepted = listener.accept(&node.node_id, timeout) => accepted?,
            _ = abort.cancelled() => return Err(SessionError::Stopped),
        };

        {
            // Spawn under the lock so a hangup cannot be processed before Open
            let mut slot = lock(&self.connection);
            if slot.generation != generation || slot.state != ConnectionState::Opening {
                tracing::debug!("Dropping connection from {}: attempt was abandoned", peer);
                return Err(SessionError::Stopped);
            }
            let channel = CommandChannel::spawn(
                stream,
                node.clone(),
                local_id,
                self.close_callback(node.clone(), generation),
            );
            slot.state = ConnectionState::Open;
            slot.channel = Some(Arc::new(channel));
            slot.opening = None;
        }
        opening.armed = false;

        tracing::info!("Command connection to {} open ({})", node, peer);
        self.events
            .emit(&SessionEvent::CommandConnectionOpened(node.clone()));
        Ok(())
    }

    /// Cancel a connection attempt that has not reached `Open`.
    ///
    /// The generation moves on, so a node dialing in afterwards is dropped.
    fn abort_opening(&self) {
        let (node, abort) = {
            let mut slot = lock(&self.connection);
            if slot.state != ConnectionState::Opening {
                return;
            }
            slot.generation += 1;
            let node = slot.node.take();
            let abort = slot.opening.take();
            slot.reset();
            (node, abort)
        };

        if let Some(abort) = abort {
            abort.cancel();
        }
        if let Some(node) = node {
            tracing::info!("Abandoned connection attempt to {}", node.node_id);
        }
    }

    /// Callback run by the connection task once its stream is gone
    fn close_callback(
        &self,
        node: RemoteNode,
        generation: u64,
    ) -> impl FnOnce(CloseReason) + Send + 'static {
        let connection = Arc::clone(&self.connection);
        let events = Arc::clone(&self.events);

        move |reason| {
            let stale = {
                let mut slot = lock(&connection);
                if slot.generation == generation && slot.state == ConnectionState::Open {
                    slot.reset();
                }
                slot.generation != generation
            };
            if stale {
                tracing::trace!("Close of superseded connection to {}", node.node_id);
            }
            events.emit(&SessionEvent::CommandConnectionClosed { node, reason });
        }
    }

    /// Close the command connection if one is open.
    ///
    /// Tells the node over discovery first, then closes the stream and waits
    /// until the close event has been emitted.
    pub async fn close_command_connection(&self) {
        let (node, channel) = {
            let mut slot = lock(&self.connection);
            if slot.state != ConnectionState::Open {
                return;
            }
            let node = slot.node.take();
            let channel = slot.channel.take();
            slot.reset();
            (node, channel)
        };

        if let (Some(node), Ok(discovery)) = (node.as_ref(), self.discovery_channel()) {
            let request = Message::close_connection(self.local_node_id(), node.node_id.clone());
            if let Err(e) = discovery.send(&request).await {
                tracing::warn!("Failed to notify {} of close: {}", node.node_id, e);
            }
        }

        if let Some(channel) = channel {
            channel.close().await;
        }
    }

    /// Whether a command connection is open
    pub fn has_command_connection(&self) -> bool {
        lock(&self.connection).state == ConnectionState::Open
    }

    /// Current connection state
    pub fn connection_state(&self) -> ConnectionState {
        lock(&self.connection).state
    }

    /// Node the command connection is open to
    pub fn connected_node(&self) -> Option<RemoteNode> {
        let slot = lock(&self.connection);
        match slot.state {
            ConnectionState::Open => slot.node.clone(),
            _ => None,
        }
    }

    /// Run `command` on the connected node.
    ///
    /// Concurrent calls are sent in call order, one at a time. A result with
    /// `success == false` is returned as `Ok`; use
    /// [`CommandResult::into_checked`] to treat it as an error.
    pub async fn run_command(
        &self,
        command: &str,
        unattended: bool,
        exec_mode: ExecMode,
    ) -> Result<CommandResult, SessionError> {
        let channel = {
            let slot = lock(&self.connection);
            match (slot.state, slot.channel.as_ref()) {
                (ConnectionState::Open, Some(channel)) => Arc::clone(channel),
                _ => return Err(SessionError::NotConnected),
            }
        };

        tracing::debug!("Running {} on {}", exec_mode, channel.node().node_id);
        let message = Message::command(self.local_node_id(), command, unattended, exec_mode);
        let response = channel.send(message).await?;
        let data: CommandResultData = response.data_as()?;
        Ok(data.into())
    }

    fn discovery_channel(&self) -> Result<Arc<DiscoveryChannel>, SessionError> {
        lock(&self.discovery)
            .as_ref()
            .map(Arc::clone)
            .ok_or(SessionError::Discovery(DiscoveryError::NotRunning))
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(discovery) = lock(&self.discovery).take() {
            discovery.stop();
        }
    }
}
