//! Session events and the callback registry that delivers them
//!
//! Listeners are registered per [`EventKind`] and invoked synchronously, in
//! registration order, on the task that emits the event. A listener must not
//! block; hand work off to a channel if it needs to await.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, PoisonError};

use crate::types::RemoteNode;

/// Why a command connection was closed
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// Closed by `close_command_connection`, a forced reconnect or `stop`
    Requested,
    /// The node closed the socket
    RemoteClosed,
    /// The socket failed
    Error(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CloseReason::Requested => write!(f, "closed locally"),
            CloseReason::RemoteClosed => write!(f, "closed by the remote node"),
            CloseReason::Error(e) => write!(f, "{}", e),
        }
    }
}

/// Events emitted by a session
#[derive(Debug, Clone)]
pub enum SessionEvent {
    /// A node announced itself for the first time
    NodeFound(RemoteNode),
    /// A node stopped announcing itself and was removed
    NodeTimedOut(RemoteNode),
    /// A command connection reached the open state
    CommandConnectionOpened(RemoteNode),
    /// The open command connection was closed
    CommandConnectionClosed {
        node: RemoteNode,
        reason: CloseReason,
    },
}

impl SessionEvent {
    /// Kind used to route this event to listeners
    pub fn kind(&self) -> EventKind {
        match self {
            SessionEvent::NodeFound(_) => EventKind::NodeFound,
            SessionEvent::NodeTimedOut(_) => EventKind::NodeTimedOut,
            SessionEvent::CommandConnectionOpened(_) => EventKind::CommandConnectionOpened,
            SessionEvent::CommandConnectionClosed { .. } => EventKind::CommandConnectionClosed,
        }
    }
}

/// Event routing key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventKind {
    NodeFound,
    NodeTimedOut,
    CommandConnectionOpened,
    CommandConnectionClosed,
}

/// Handle returned by [`EventRegistry::subscribe`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(u64);

type Listener = Arc<dyn Fn(&SessionEvent) + Send + Sync>;

struct Subscription {
    id: SubscriptionId,
    kind: EventKind,
    listener: Listener,
}

/// Registry of typed event callbacks
pub struct EventRegistry {
    next_id: AtomicU64,
    subscriptions: Mutex<Vec<Subscription>>,
}

impl EventRegistry {
    /// Create an empty registry
    pub fn new() -> Self {
        Self {
            next_id: AtomicU64::new(1),
            subscriptions: Mutex::new(Vec::new()),
        }
    }

    /// Register `listener` for events of `kind`
    pub fn subscribe<F>(&self, kind: EventKind, listener: F) -> SubscriptionId
    where
        F: Fn(&SessionEvent) + Send + Sync + 'static,
    {
        let id = SubscriptionId(self.next_id.fetch_add(1, Ordering::Relaxed));
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Subscription {
                id,
                kind,
                listener: Arc::new(listener),
            });
        id
    }

    /// Remove a listener. Returns false if it was not registered.
    pub fn unsubscribe(&self, id: SubscriptionId) -> bool {
        let mut subscriptions = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner);
        let before = subscriptions.len();
        subscriptions.retain(|s| s.id != id);
        subscriptions.len() != before
    }

    /// Number of listeners registered for `kind`
    pub fn listener_count(&self, kind: EventKind) -> usize {
        self.subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.kind == kind)
            .count()
    }

    /// Deliver `event` to every listener of its kind
    pub fn emit(&self, event: &SessionEvent) {
        let kind = event.kind();
        // Snapshot so listeners may (un)subscribe while being called
        let listeners: Vec<Listener> = self
            .subscriptions
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|s| s.kind == kind)
            .map(|s| Arc::clone(&s.listener))
            .collect();

        tracing::debug!(event = ?kind, listeners = listeners.len(), "Emitting session event");

        for listener in listeners {
            listener(event);
        }
    }
}

impl Default for EventRegistry {
    fn default() -> Self {
        Self::new()
    }
}
