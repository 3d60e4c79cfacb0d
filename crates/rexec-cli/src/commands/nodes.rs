//! Nodes command implementation

use std::time::Duration;

use anyhow::{bail, Context, Result};

use rexec_core::config::RemoteExecutionConfig;
use rexec_core::RemoteNode;
use rexec_session::Session;

use crate::output::{format_nodes, nodes_to_json};

/// Listen on the discovery group for `wait` and print the nodes that answered
pub async fn nodes_command(
    config: RemoteExecutionConfig,
    wait: Duration,
    long: bool,
    json: bool,
) -> Result<()> {
    let session = Session::new(config);
    session
        .start()
        .context("Failed to start node discovery")?;

    tokio::time::sleep(wait).await;
    let nodes = session.remote_nodes();
    session.stop().await;

    if json {
        println!("{}", serde_json::to_string_pretty(&nodes_to_json(&nodes))?);
    } else {
        println!("{}", format_nodes(&nodes, long));
    }

    Ok(())
}

/// Find a node on a started session.
///
/// Without a filter this is the earliest discovered node. A filter matches a
/// node id exactly or a project name case-insensitively.
pub async fn find_node(
    session: &Session,
    filter: Option<&str>,
    interval: Duration,
    timeout: Duration,
) -> Result<RemoteNode> {
    let Some(filter) = filter else {
        return session
            .get_first_remote_node(interval, timeout)
            .await
            .context("No engine node answered; is remote execution enabled in the editor?");
    };

    session.start().context("Failed to start node discovery")?;
    session.start_searching_for_nodes(interval)?;
    let deadline = tokio::time::Instant::now() + timeout;

    loop {
        if let Some(node) = session
            .remote_nodes()
            .into_iter()
            .find(|node| matches_filter(node, filter))
        {
            return Ok(node);
        }
        if tokio::time::Instant::now() >= deadline {
            bail!("No node matching '{}' answered within {:?}", filter, timeout);
        }
        tokio::time::sleep(interval.min(Duration::from_millis(100))).await;
    }
}

fn matches_filter(node: &RemoteNode, filter: &str) -> bool {
    node.node_id.as_str() == filter
        || node
            .project_name()
            .map_or(false, |name| name.eq_ignore_ascii_case(filter))
}

#[cfg(test)]
mod tests {
    use super::*;
    use rexec_protocol::NodeId;
    use serde_json::json;
    use std::time::Instant;

    #[test]
    fn test_matches_filter() {
        let data = match json!({ "project_name": "ShooterGame" }) {
            serde_json::Value::Object(map) => map,
            _ => unreachable!(),
        };
        let node = RemoteNode::new(NodeId::new("abc-123"), data, Instant::now());

        assert!(matches_filter(&node, "abc-123"));
        assert!(matches_filter(&node, "shootergame"));
        assert!(!matches_filter(&node, "abc"));
        assert!(!matches_filter(&node, "Lyra"));
    }
}
