//! Datagram transport used by the discovery channel
//!
//! [`MulticastTransport`] is the real UDP socket. The [`DiscoveryTransport`]
//! trait lets the session run over any datagram carrier, which is how the
//! integration tests stand in for an engine without multicast routing.

use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;

use async_trait::async_trait;
use socket2::{Domain, Protocol, Socket, Type};
use tokio::net::UdpSocket;

use rexec_core::config::RemoteExecutionConfig;
use rexec_core::DiscoveryError;

/// Largest payload a single UDP datagram can carry
pub const MAX_DATAGRAM_SIZE: usize = 65_507;

/// A datagram carrier joined to the discovery group
#[async_trait]
pub trait DiscoveryTransport: Send + Sync {
    /// Send one datagram to the whole group
    async fn send_to_group(&self, datagram: &[u8]) -> io::Result<()>;

    /// Receive the next datagram, returning its length and sender
    async fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)>;

    /// Leave the group. Called once when discovery stops.
    fn leave(&self) {}
}

/// Opens a fresh transport each time discovery starts
pub trait TransportFactory: Send + Sync {
    fn open(
        &self,
        config: &RemoteExecutionConfig,
    ) -> Result<Arc<dyn DiscoveryTransport>, DiscoveryError>;
}

/// UDP socket bound to the group port and joined to the group
pub struct MulticastTransport {
    socket: UdpSocket,
    group: SocketAddrV4,
    interface: std::net::Ipv4Addr,
}

impl MulticastTransport {
    /// Bind and join the group described by `config`.
    ///
    /// The socket allows address reuse so several sessions on one host can
    /// share the group port. Must be called from within a Tokio runtime.
    pub fn bind(config: &RemoteExecutionConfig) -> Result<Self, DiscoveryError> {
        let bind_endpoint = config.multicast_bind_endpoint();
        let group = config.multicast_group_endpoint;
        let interface = config.multicast_bind_address;

        let bind_err = |source: io::Error| DiscoveryError::Bind {
            addr: SocketAddr::V4(bind_endpoint),
            source,
        };
        let group_err = |source: io::Error| DiscoveryError::Multicast {
            group: SocketAddr::V4(group),
            source,
        };

        let socket =
            Socket::new(Domain::IPV4, Type::DGRAM, Some(Protocol::UDP)).map_err(bind_err)?;
        socket.set_reuse_address(true).map_err(bind_err)?;
        socket.set_nonblocking(true).map_err(bind_err)?;
        socket
            .bind(&SocketAddr::V4(bind_endpoint).into())
            .map_err(bind_err)?;

        socket.set_multicast_loop_v4(true).map_err(group_err)?;
        socket
            .set_multicast_ttl_v4(config.multicast_ttl)
            .map_err(group_err)?;
        socket.set_multicast_if_v4(&interface).map_err(group_err)?;
        socket
            .join_multicast_v4(group.ip(), &interface)
            .map_err(group_err)?;

        let socket = UdpSocket::from_std(socket.into()).map_err(bind_err)?;

        tracing::debug!(
            "Joined multicast group {} on {} (ttl {})",
            group,
            bind_endpoint,
            config.multicast_ttl
        );

        Ok(Self {
            socket,
            group,
            interface,
        })
    }

    /// Local address of the socket
    pub fn local_addr(&self) -> io::Result<SocketAddr> {
        self.socket.local_addr()
    }
}

#[async_trait]
impl DiscoveryTransport for MulticastTransport {
    async fn send_to_group(&self, datagram: &[u8]) -> io::Result<()> {
        self.socket.send_to(datagram, self.group).await.map(|_| ())
    }

    async fn recv(&self, buf: &mut [u8]) -> io::Result<(usize, SocketAddr)> {
        self.socket.recv_from(buf).await
    }

    fn leave(&self) {
        if let Err(e) = self.socket.leave_multicast_v4(*self.group.ip(), self.interface) {
            tracing::debug!("Failed to leave multicast group {}: {}", self.group, e);
        }
    }
}

/// Factory for [`MulticastTransport`]
#[derive(Debug, Default, Clone, Copy)]
pub struct MulticastTransportFactory;

impl TransportFactory for MulticastTransportFactory {
    fn open(
        &self,
        config: &RemoteExecutionConfig,
    ) -> Result<Arc<dyn DiscoveryTransport>, DiscoveryError> {
        Ok(Arc::new(MulticastTransport::bind(config)?))
    }
}
