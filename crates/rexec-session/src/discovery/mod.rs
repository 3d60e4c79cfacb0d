//! UDP multicast discovery
//!
//! The discovery channel owns the multicast transport and two background
//! tasks:
//!
//! - a receive loop that decodes datagrams and records node announcements
//! - a search loop that pings the group on an interval and expires nodes
//!   that stopped answering
//!
//! Searching can be stopped and restarted with a different interval without
//! tearing the channel down; the receive loop runs until [`DiscoveryChannel::stop`].

mod registry;
mod search;
mod transport;

pub use registry::NodeRegistry;
pub use transport::{
    DiscoveryTransport, MulticastTransport, MulticastTransportFactory, TransportFactory,
    MAX_DATAGRAM_SIZE,
};

use std::io;
use std::net::SocketAddr;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{Duration, Instant};

use serde_json::{Map, Value};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use rexec_core::{DiscoveryError, EventRegistry, SessionEvent};
use rexec_protocol::{codec, Message, MessageType, NodeId};

/// State shared between the discovery channel and its tasks
pub(crate) struct DiscoveryContext {
    pub local_id: NodeId,
    pub nodes: Arc<NodeRegistry>,
    pub events: Arc<EventRegistry>,
    pub node_timeout: Duration,
}

struct SearchTask {
    interval: Duration,
    cancel: CancellationToken,
    handle: JoinHandle<()>,
}

/// A running discovery channel
pub struct DiscoveryChannel {
    context: Arc<DiscoveryContext>,
    transport: Arc<dyn DiscoveryTransport>,
    cancel: CancellationToken,
    receiver: JoinHandle<()>,
    search: Mutex<Option<SearchTask>>,
}

impl DiscoveryChannel {
    /// Start receiving on `transport`.
    ///
    /// Nodes are recorded in `nodes` and announced through `events`. Searching
    /// is not started; call [`start_searching`](Self::start_searching).
    pub fn start(
        local_id: NodeId,
        transport: Arc<dyn DiscoveryTransport>,
        nodes: Arc<NodeRegistry>,
        events: Arc<EventRegistry>,
        node_timeout: Duration,
    ) -> Self {
        let context = Arc::new(DiscoveryContext {
            local_id,
            nodes,
            events,
            node_timeout,
        });
        let cancel = CancellationToken::new();

        let receiver = tokio::spawn(receive_loop(
            Arc::clone(&context),
            Arc::clone(&transport),
            cancel.clone(),
        ));

        tracing::debug!("Discovery started as node {}", context.local_id);

        Self {
            context,
            transport,
            cancel,
            receiver,
            search: Mutex::new(None),
        }
    }

    /// Id this channel sends as
    pub fn local_id(&self) -> &NodeId {
        &self.context.local_id
    }

    /// Whether the channel has not been stopped
    pub fn is_running(&self) -> bool {
        !self.cancel.is_cancelled()
    }

    /// Ping the group every `interval` and expire silent nodes.
    ///
    /// Restarts the search loop if it is running with a different interval.
    pub fn start_searching(&self, interval: Duration) -> Result<(), DiscoveryError> {
        if !self.is_running() {
            return Err(DiscoveryError::NotRunning);
        }

        let mut search = self.search.lock().unwrap_or_else(PoisonError::into_inner);
        if let Some(task) = search.as_ref() {
            if task.interval == interval && !task.handle.is_finished() {
                return Ok(());
            }
        }
        if let Some(task) = search.take() {
            task.cancel.cancel();
        }

        let cancel = self.cancel.child_token();
        let handle = tokio::spawn(search::run_search(
            Arc::clone(&self.context),
            Arc::clone(&self.transport),
            interval,
            cancel.clone(),
        ));
        *search = Some(SearchTask {
            interval,
            cancel,
            handle,
        });
        Ok(())
    }

    /// Stop pinging. Known nodes are kept and no longer expire.
    pub fn stop_searching(&self) {
        let task = self
            .search
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(task) = task {
            task.cancel.cancel();
            tracing::debug!("Stopped searching for nodes");
        }
    }

    /// Encode and send a message to the group
    pub async fn send(&self, message: &Message) -> Result<(), DiscoveryError> {
        if !self.is_running() {
            return Err(DiscoveryError::NotRunning);
        }
        let datagram = codec::encode(message)?;
        self.transport
            .send_to_group(&datagram)
            .await
            .map_err(DiscoveryError::Send)?;
        tracing::trace!("Sent {} to {:?}", message.message_type, message.dest);
        Ok(())
    }

    /// Stop both tasks and leave the group. Idempotent.
    pub fn stop(&self) {
        if self.cancel.is_cancelled() {
            return;
        }
        self.stop_searching();
        self.cancel.cancel();
        self.receiver.abort();
        self.transport.leave();
        tracing::debug!("Discovery stopped for node {}", self.context.local_id);
    }
}

impl Drop for DiscoveryChannel {
    fn drop(&mut self) {
        self.stop();
    }
}

async fn receive_loop(
    context: Arc<DiscoveryContext>,
    transport: Arc<dyn DiscoveryTransport>,
    cancel: CancellationToken,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM_SIZE];

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            received = transport.recv(&mut buf) => match received {
                Ok((len, from)) => {
                    handle_datagram(&context, &buf[..len], from, now());
                }
                Err(e) if is_fatal(&e) => {
                    tracing::warn!("Discovery socket closed: {}", e);
                    break;
                }
                Err(e) => {
                    // Windows reports ICMP port unreachable on the next recv
                    tracing::debug!("Discovery receive error: {}", e);
                }
            }
        }
    }
}

fn is_fatal(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::NotConnected | io::ErrorKind::BrokenPipe | io::ErrorKind::UnexpectedEof
    )
}

/// Current time on the Tokio clock, so paused-time tests see it advance
pub(crate) fn now() -> Instant {
    tokio::time::Instant::now().into_std()
}

/// Process one received datagram
pub(crate) fn handle_datagram(
    context: &DiscoveryContext,
    datagram: &[u8],
    from: SocketAddr,
    now: Instant,
) {
    let message = match codec::decode(datagram) {
        Ok(message) => message,
        Err(e) if e.is_foreign() => {
            tracing::trace!("Dropping datagram from {}: {}", from, e);
            return;
        }
        Err(e) => {
            tracing::warn!("Failed to read datagram from {}: {}", from, e);
            return;
        }
    };

    if !message.passes_receive_filter(&context.local_id) {
        return;
    }

    match message.message_type {
        MessageType::Pong => {
            let data = match message.data {
                Some(Value::Object(map)) => map,
                _ => Map::new(),
            };
            if let Some(node) = context.nodes.upsert(message.source, data, now) {
                tracing::info!("Found node {}", node);
                context.events.emit(&SessionEvent::NodeFound(node));
            }
        }
        other => {
            tracing::debug!("Ignoring {} from {} ({})", other, message.source, from);
        }
    }
}
