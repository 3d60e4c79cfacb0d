//! Node search loop
//!
//! Every tick broadcasts a ping and then sweeps the registry for nodes whose
//! last announcement is older than the node timeout. A node that times out
//! and later answers again is reported as found again.

use std::sync::Arc;
use std::time::{Duration, Instant};

use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;

use rexec_core::SessionEvent;
use rexec_protocol::{codec, Message};

use super::{now, DiscoveryContext, DiscoveryTransport};

/// Run the search loop until `cancel` fires
pub(crate) async fn run_search(
    context: Arc<DiscoveryContext>,
    transport: Arc<dyn DiscoveryTransport>,
    interval: Duration,
    cancel: CancellationToken,
) {
    let mut ticker = tokio::time::interval(interval);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    tracing::debug!(
        "Searching for nodes (ping interval: {:?}, node timeout: {:?})",
        interval,
        context.node_timeout
    );

    loop {
        tokio::select! {
            _ = ticker.tick() => {
                ping(&context, transport.as_ref()).await;
                expire_nodes(&context, now());
            }
            _ = cancel.cancelled() => break,
        }
    }
}

async fn ping(context: &DiscoveryContext, transport: &dyn DiscoveryTransport) {
    let datagram = match codec::encode(&Message::ping(context.local_id.clone())) {
        Ok(datagram) => datagram,
        Err(e) => {
            tracing::error!("Failed to encode ping: {}", e);
            return;
        }
    };

    // Send failures are transient (no route yet, interface down); retry next tick
    if let Err(e) = transport.send_to_group(&datagram).await {
        tracing::debug!("Failed to send ping: {}", e);
    }
}

/// Remove expired nodes and report each one
pub(crate) fn expire_nodes(context: &DiscoveryContext, now: Instant) -> usize {
    let expired = context.nodes.remove_expired(now, context.node_timeout);
    for node in &expired {
        tracing::info!("Node {} timed out", node);
        context.events.emit(&SessionEvent::NodeTimedOut(node.clone()));
    }
    expired.len()
}
