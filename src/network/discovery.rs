//! Multicast Peer Discovery Module
//!
//! Nodes announce their mesh key and link port to an IPv6 link-local
//! multicast group. An announcement heard from another node we are not yet
//! linked to leads to a TCP connection to the announcing address, handed to
//! the mesh transport.

use std::ffi::CString;
use std::net::{Ipv6Addr, SocketAddr, SocketAddrV6};
use std::sync::Arc;
use std::time::Duration;

use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::{TcpStream, UdpSocket};

use crate::config::DiscoveryConfig;
use crate::error::{Error, Result};
use crate::mesh::{MeshTransport, PublicKey};

/// Discovery message prefix
const DISCOVERY_PREFIX: &str = "WOLFMESH";

/// Discovery message version
const DISCOVERY_VERSION: u8 = 1;

/// A parsed announcement
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Announcement {
    pub key: PublicKey,
    pub port: u16,
}

/// Multicast announcer and listener for one node
pub struct Discovery {
    key: PublicKey,
    link_port: u16,
    config: DiscoveryConfig,
    mesh: Arc<dyn MeshTransport>,
}

impl Discovery {
    /// `link_port` is the port the link acceptor is actually bound to
    pub fn new(config: DiscoveryConfig, link_port: u16, mesh: Arc<dyn MeshTransport>) -> Self {
        Self {
            key: mesh.local_key(),
            link_port,
            config,
            mesh,
        }
    }

    /// Announce ourselves on every configured interface, forever
    pub async fn run_announcer(&self) -> Result<()> {
        let message = format_announcement(&self.key, self.link_port);
        let mut targets = Vec::new();
        for if_index in resolve_interfaces(&self.config.interfaces)? {
            match create_announce_socket(if_index) {
                Ok(socket) => targets.push((
                    socket,
                    SocketAddrV6::new(self.config.group, self.config.port, 0, if_index),
                )),
                Err(e) => tracing::warn!("Cannot announce on interface index {}: {}", if_index, e),
            }
        }
        if targets.is_empty() {
            return Err(Error::Network("no usable interface for discovery announcements".into()));
        }

        tracing::info!(
            "Announcing on [{}]:{} via {} interface(s)",
            self.config.group,
            self.config.port,
            targets.len()
        );

        let mut interval = tokio::time::interval(self.config.interval());
        loop {
            interval.tick().await;
            for (socket, target) in &targets {
                if let Err(e) = socket.send_to(message.as_bytes(), SocketAddr::V6(*target)).await {
                    // Interfaces come and go; keep announcing on the others
                    tracing::trace!("Announcement to {} failed: {}", target, e);
                }
            }
        }
    }

    /// Listen for announcements and link to every other node heard
    pub async fn run_listener(&self) -> Result<()> {
        let if_indexes = resolve_interfaces(&self.config.interfaces)?;
        let socket = create_listen_socket(self.config.group, self.config.port, &if_indexes)
            .map_err(|e| Error::Network(format!("Failed to bind discovery listener on port {}: {}", self.config.port, e)))?;
        tracing::info!("Listening for peers on [{}]:{}", self.config.group, self.config.port);

        let mut buf = [0u8; 512];
        loop {
            let (len, src) = match socket.recv_from(&mut buf).await {
                Ok(received) => received,
                Err(e) => {
                    tracing::trace!("Discovery recv error: {}", e);
                    continue;
                }
            };

            let target = match self.dial_target(&buf[..len], src) {
                Some(target) => target,
                None => continue,
            };

            let mesh = Arc::clone(&self.mesh);
            let connect_timeout = self.config.connect_timeout();
            tokio::spawn(async move {
                if let Err(e) = connect_peer(mesh, target, connect_timeout).await {
                    tracing::debug!("Could not link to {}: {}", target, e);
                }
            });
        }
    }

    /// Where to connect for one received datagram, if anywhere.
    ///
    /// Malformed datagrams, our own announcements and announcements from
    /// peers we already have a link to yield `None`.
    pub fn dial_target(&self, datagram: &[u8], src: SocketAddr) -> Option<SocketAddr> {
        let announcement = std::str::from_utf8(datagram).ok().and_then(parse_announcement)?;
        if announcement.key == self.key || self.mesh.is_linked(&announcement.key) {
            return None;
        }

        let target = peer_link_address(src, announcement.port);
        tracing::debug!("Heard {} at {}, connecting", announcement.key, target);
        Some(target)
    }
}

/// Open a TCP connection to `target` and give it to the transport
pub async fn connect_peer(mesh: Arc<dyn MeshTransport>, target: SocketAddr, connect_timeout: Duration) -> Result<()> {
    let stream = tokio::time::timeout(connect_timeout, TcpStream::connect(target))
        .await
        .map_err(|_| Error::ConnectionTimeout(target.to_string()))??;
    mesh.handle_stream(stream).await
}

/// Link address of an announcing node: the datagram's source address and
/// scope with the advertised port
fn peer_link_address(src: SocketAddr, port: u16) -> SocketAddr {
    match src {
        SocketAddr::V6(v6) => SocketAddr::V6(SocketAddrV6::new(*v6.ip(), port, 0, v6.scope_id())),
        SocketAddr::V4(v4) => SocketAddr::new((*v4.ip()).into(), port),
    }
}

/// Resolve interface names to indexes; no names means the default interface (0)
pub fn resolve_interfaces(names: &[String]) -> Result<Vec<u32>> {
    if names.is_empty() {
        return Ok(vec![0]);
    }
    names
        .iter()
        .map(|name| {
            let c_name = CString::new(name.as_str())
                .map_err(|_| Error::Config(format!("invalid interface name '{}'", name)))?;
            let index = unsafe { libc::if_nametoindex(c_name.as_ptr()) };
            if index == 0 {
                return Err(Error::Network(format!("unknown interface '{}'", name)));
            }
            Ok(index)
        })
        .collect()
}

fn create_announce_socket(if_index: u32) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_nonblocking(true)?;
    socket.set_multicast_if_v6(if_index)?;
    socket.bind(&SockAddr::from(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, 0, 0, if_index)))?;

    let std_sock: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_sock)
}

fn create_listen_socket(group: Ipv6Addr, port: u16, if_indexes: &[u32]) -> std::io::Result<UdpSocket> {
    let socket = Socket::new(Domain::IPV6, Type::DGRAM, Some(Protocol::UDP))?;
    socket.set_reuse_address(true)?;
    #[cfg(unix)]
    socket.set_reuse_port(true)?;
    socket.set_only_v6(true)?;
    socket.set_nonblocking(true)?;

    for if_index in if_indexes {
        socket.join_multicast_v6(&group, *if_index)?;
    }
    socket.bind(&SockAddr::from(SocketAddrV6::new(Ipv6Addr::UNSPECIFIED, port, 0, 0)))?;

    let std_sock: std::net::UdpSocket = socket.into();
    UdpSocket::from_std(std_sock)
}

/// Format a discovery announcement
pub fn format_announcement(key: &PublicKey, port: u16) -> String {
    format!("{}|{}|{}|{}", DISCOVERY_PREFIX, DISCOVERY_VERSION, key.to_hex(), port)
}

/// Parse a discovery announcement
pub fn parse_announcement(message: &str) -> Option<Announcement> {
    let parts: Vec<&str> = message.trim_end().split('|').collect();

    if parts.len() != 4 || parts[0] != DISCOVERY_PREFIX {
        return None;
    }

    let version: u8 = parts[1].parse().ok()?;
    if version != DISCOVERY_VERSION {
        return None;
    }

    let key = PublicKey::from_hex(parts[2]).ok()?;
    let port: u16 = parts[3].parse().ok()?;
    if port == 0 {
        return None;
    }

    Some(Announcement { key, port })
}
