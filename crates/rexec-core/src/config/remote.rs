//! Remote execution endpoint configuration

use serde::{Deserialize, Serialize};
use std::net::{Ipv4Addr, SocketAddr, SocketAddrV4};
use std::time::Duration;

use super::serde_utils::duration_millis;
use crate::error::ConfigError;

/// Multicast TTL (0 keeps traffic on the local host, 1 on the local subnet)
pub const DEFAULT_MULTICAST_TTL: u32 = 0;

/// Group the discovery socket joins; must match the engine plugin setting
pub const DEFAULT_MULTICAST_GROUP_ENDPOINT: SocketAddrV4 =
    SocketAddrV4::new(Ipv4Addr::new(239, 0, 0, 1), 6766);

/// Adapter the discovery socket binds to (all adapters by default)
pub const DEFAULT_MULTICAST_BIND_ADDRESS: Ipv4Addr = Ipv4Addr::UNSPECIFIED;

/// Endpoint of the TCP listener this session hosts for the node to dial
pub const DEFAULT_COMMAND_ENDPOINT: SocketAddrV4 =
    SocketAddrV4::new(Ipv4Addr::LOCALHOST, 6776);

/// Delay between two discovery pings
pub const NODE_PING_INTERVAL: Duration = Duration::from_secs(1);

/// Silence after which a discovered node is dropped
pub const NODE_TIMEOUT: Duration = Duration::from_secs(5);

/// How long to wait for a node to dial the command endpoint
pub const DEFAULT_CONNECT_TIMEOUT: Duration = Duration::from_secs(5);

/// Endpoint and timing configuration for a session
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RemoteExecutionConfig {
    /// Multicast TTL for discovery datagrams
    pub multicast_ttl: u32,

    /// Multicast group address and port
    pub multicast_group_endpoint: SocketAddrV4,

    /// Local adapter address for the discovery socket
    pub multicast_bind_address: Ipv4Addr,

    /// Address of the command listener advertised to nodes
    pub command_endpoint: SocketAddr,

    /// Discovery ping interval
    #[serde(with = "duration_millis")]
    pub node_ping_interval: Duration,

    /// Node expiry timeout
    #[serde(with = "duration_millis")]
    pub node_timeout: Duration,

    /// Default timeout for opening a command connection
    #[serde(with = "duration_millis")]
    pub connect_timeout: Duration,
}

impl Default for RemoteExecutionConfig {
    fn default() -> Self {
        Self {
            multicast_ttl: DEFAULT_MULTICAST_TTL,
            multicast_group_endpoint: DEFAULT_MULTICAST_GROUP_ENDPOINT,
            multicast_bind_address: DEFAULT_MULTICAST_BIND_ADDRESS,
            command_endpoint: SocketAddr::V4(DEFAULT_COMMAND_ENDPOINT),
            node_ping_interval: NODE_PING_INTERVAL,
            node_timeout: NODE_TIMEOUT,
            connect_timeout: DEFAULT_CONNECT_TIMEOUT,
        }
    }
}

impl RemoteExecutionConfig {
    /// Local address the discovery socket binds to: the bind adapter on the
    /// group's port
    pub fn multicast_bind_endpoint(&self) -> SocketAddrV4 {
        SocketAddrV4::new(
            self.multicast_bind_address,
            self.multicast_group_endpoint.port(),
        )
    }

    /// Check settings that would otherwise fail later at socket setup
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !self.multicast_group_endpoint.ip().is_multicast() {
            return Err(ConfigError::Invalid(format!(
                "multicast_group_endpoint {} is not a multicast address",
                self.multicast_group_endpoint
            )));
        }
        if self.multicast_ttl > 255 {
            return Err(ConfigError::Invalid(format!(
                "multicast_ttl {} is out of range (0-255)",
                self.multicast_ttl
            )));
        }
        if self.node_ping_interval.is_zero() {
            return Err(ConfigError::Invalid(
                "node_ping_interval must be greater than zero".to_string(),
            ));
        }
        if self.node_timeout <= self.node_ping_interval {
            return Err(ConfigError::Invalid(format!(
                "node_timeout ({:?}) must be longer than node_ping_interval ({:?})",
                self.node_timeout, self.node_ping_interval
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_engine_plugin() {
        let config = RemoteExecutionConfig::default();
        assert_eq!(config.multicast_ttl, 0);
        assert_eq!(config.multicast_group_endpoint.to_string(), "239.0.0.1:6766");
        assert_eq!(config.multicast_bind_address.to_string(), "0.0.0.0");
        assert_eq!(config.command_endpoint.to_string(), "127.0.0.1:6776");
        assert_eq!(config.multicast_bind_endpoint().to_string(), "0.0.0.0:6766");
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: RemoteExecutionConfig = toml::from_str(
            r#"
            multicast_ttl = 1
            command_endpoint = "192.168.1.20:7000"
            node_timeout = 10000
            "#,
        )
        .unwrap();

        assert_eq!(config.multicast_ttl, 1);
        assert_eq!(config.command_endpoint.port(), 7000);
        assert_eq!(config.node_timeout, Duration::from_secs(10));
        assert_eq!(config.node_ping_interval, NODE_PING_INTERVAL);
        assert_eq!(config.multicast_group_endpoint, DEFAULT_MULTICAST_GROUP_ENDPOINT);
    }

    #[test]
    fn test_validate_rejects_unicast_group() {
        let config = RemoteExecutionConfig {
            multicast_group_endpoint: "127.0.0.1:6766".parse().unwrap(),
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_validate_rejects_bad_timing() {
        let config = RemoteExecutionConfig {
            node_ping_interval: Duration::ZERO,
            ..Default::default()
        };
        assert!(config.validate().is_err());

        let config = RemoteExecutionConfig {
            node_timeout: Duration::from_millis(500),
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }
}
