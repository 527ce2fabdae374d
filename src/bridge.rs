//! Tunnel bridge
//!
//! Moves packets between the tunnel device and the mesh transport.
//! Outbound, the destination address is resolved to a key through the key
//! cache (or the configured fallback). Inbound, every packet that passes
//! validation teaches the cache the sender's full key before it is written
//! to the tunnel.
//!
//! Validation failures drop the packet and keep the loop running. Device
//! or transport failures end the loop with an error for the supervisor.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::trace;

use crate::address::Address;
use crate::cache::KeyCache;
use crate::error::{Error, Result};
use crate::mesh::{MeshTransport, PublicKey};
use crate::tun::{self, TunDevice, IPV6_HEADER_LEN, PACKET_BUFFER_SIZE, TUN_OFFSET_BYTES};

/// What to do with an outbound packet whose destination has no cached key
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FallbackPolicy {
    /// Send to the key prefix embedded in the address and let the owner
    /// pick it up as undeliverable
    #[default]
    PrefixGuess,
    /// Drop until the key has been learned from inbound traffic
    Drop,
}

/// Which transport receive path an inbound loop drains
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum InboundPath {
    Delivered,
    Undeliverable,
}

/// How an inbound packet reached us
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Received {
    /// Addressed to our exact key
    Delivered { remote: PublicKey },
    /// Addressed to `local`, a key other than ours
    Undeliverable { local: PublicKey, remote: PublicKey },
}

impl Received {
    /// Full key of the sender
    pub fn remote(&self) -> PublicKey {
        match self {
            Received::Delivered { remote } | Received::Undeliverable { remote, .. } => *remote,
        }
    }
}

/// Why a packet was dropped
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DropReason {
    Undersized,
    SpoofedSource,
    ForeignScope,
    WrongDestination,
    NotAddressedToUs,
    KeyMismatch,
    NoCachedKey,
}

impl DropReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DropReason::Undersized => "undersized",
            DropReason::SpoofedSource => "source is not our address",
            DropReason::ForeignScope => "address outside fd00::/8",
            DropReason::WrongDestination => "destination is not our address",
            DropReason::NotAddressedToUs => "addressed key does not match our address",
            DropReason::KeyMismatch => "sender key does not own source address",
            DropReason::NoCachedKey => "no cached key for destination",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OutboundVerdict {
    /// Send to `key`; `guessed` when it came from the address prefix
    Send { key: PublicKey, guessed: bool },
    Drop(DropReason),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum InboundVerdict {
    /// Learn `source` → `remote` and write the packet to the tunnel
    Accept { source: Address, remote: PublicKey },
    Drop(DropReason),
}

#[derive(Default)]
struct Counters {
    outbound_sent: AtomicU64,
    outbound_guessed: AtomicU64,
    outbound_dropped: AtomicU64,
    inbound_delivered: AtomicU64,
    inbound_undeliverable: AtomicU64,
    inbound_dropped: AtomicU64,
}

/// Packet counters
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BridgeStats {
    pub outbound_sent: u64,
    pub outbound_guessed: u64,
    pub outbound_dropped: u64,
    pub inbound_delivered: u64,
    pub inbound_undeliverable: u64,
    pub inbound_dropped: u64,
}

/// Bridge between one tunnel device and one mesh transport
pub struct TunBridge {
    tun: Arc<dyn TunDevice>,
    mesh: Arc<dyn MeshTransport>,
    cache: Arc<KeyCache>,
    local: Address,
    fallback: FallbackPolicy,
    counters: Counters,
}

impl TunBridge {
    pub fn new(
        tun: Arc<dyn TunDevice>,
        mesh: Arc<dyn MeshTransport>,
        cache: Arc<KeyCache>,
        fallback: FallbackPolicy,
    ) -> Self {
        let local = Address::for_key(&mesh.local_key());
        Self {
            tun,
            mesh,
            cache,
            local,
            fallback,
            counters: Counters::default(),
        }
    }

    pub fn local_address(&self) -> Address {
        self.local
    }

    pub fn stats(&self) -> BridgeStats {
        let c = &self.counters;
        BridgeStats {
            outbound_sent: c.outbound_sent.load(Ordering::Relaxed),
            outbound_guessed: c.outbound_guessed.load(Ordering::Relaxed),
            outbound_dropped: c.outbound_dropped.load(Ordering::Relaxed),
            inbound_delivered: c.inbound_delivered.load(Ordering::Relaxed),
            inbound_undeliverable: c.inbound_undeliverable.load(Ordering::Relaxed),
            inbound_dropped: c.inbound_dropped.load(Ordering::Relaxed),
        }
    }

    /// Decide where a packet read from the tunnel goes.
    ///
    /// An undersized packet means the device is misbehaving and is an error.
    pub fn classify_outbound(&self, packet: &[u8]) -> Result<OutboundVerdict> {
        if packet.len() < IPV6_HEADER_LEN {
            return Err(Error::UndersizedPacket(packet.len()));
        }
        let (src, dst) = header_addresses(packet)?;

        if src != self.local {
            return Ok(OutboundVerdict::Drop(DropReason::SpoofedSource));
        }
        if !dst.is_mesh() {
            return Ok(OutboundVerdict::Drop(DropReason::ForeignScope));
        }

        if let Some(key) = self.cache.get(&dst) {
            return Ok(OutboundVerdict::Send { key, guessed: false });
        }
        Ok(match self.fallback {
            FallbackPolicy::PrefixGuess => OutboundVerdict::Send { key: dst.key_prefix(), guessed: true },
            FallbackPolicy::Drop => OutboundVerdict::Drop(DropReason::NoCachedKey),
        })
    }

    /// Decide whether a packet from the mesh may enter the tunnel
    pub fn accept_inbound(&self, packet: &[u8], received: &Received) -> InboundVerdict {
        if packet.len() < IPV6_HEADER_LEN {
            return InboundVerdict::Drop(DropReason::Undersized);
        }
        let (src, dst) = match header_addresses(packet) {
            Ok(addrs) => addrs,
            Err(_) => return InboundVerdict::Drop(DropReason::Undersized),
        };

        if !src.is_mesh() || !dst.is_mesh() {
            return InboundVerdict::Drop(DropReason::ForeignScope);
        }
        if dst != self.local {
            return InboundVerdict::Drop(DropReason::WrongDestination);
        }
        if let Received::Undeliverable { local, .. } = received {
            if !self.local.matches_key(local) {
                return InboundVerdict::Drop(DropReason::NotAddressedToUs);
            }
        }

        let remote = received.remote();
        if !self.cache.check_key(&src, &remote) {
            return InboundVerdict::Drop(DropReason::KeyMismatch);
        }
        InboundVerdict::Accept { source: src, remote }
    }

    /// Tunnel → mesh, until the device or transport fails
    pub async fn run_outbound(&self) -> Result<()> {
        let mut buf = vec![0u8; PACKET_BUFFER_SIZE];
        tracing::info!("Outbound bridge running on {} for {}", self.tun.name(), self.local);

        loop {
            let n = self.tun.read(&mut buf, TUN_OFFSET_BYTES).await?;
            let packet = buf
                .get(TUN_OFFSET_BYTES..TUN_OFFSET_BYTES + n)
                .ok_or_else(|| Error::Tun(format!("device reported {} bytes, more than the buffer holds", n)))?;

            match self.classify_outbound(packet)? {
                OutboundVerdict::Send { key, guessed } => {
                    let written = self.mesh.send_to(packet, &key).await?;
                    if written != n {
                        return Err(Error::ShortWrite { target: "mesh", expected: n, written });
                    }
                    self.counters.outbound_sent.fetch_add(1, Ordering::Relaxed);
                    if guessed {
                        self.counters.outbound_guessed.fetch_add(1, Ordering::Relaxed);
                        trace!("Sent {} bytes to guessed key {:?}", n, key);
                    }
                }
                OutboundVerdict::Drop(reason) => {
                    self.counters.outbound_dropped.fetch_add(1, Ordering::Relaxed);
                    trace!("Dropped outbound packet: {}", reason.as_str());
                }
            }
        }
    }

    /// Mesh → tunnel for one receive path, until the device or transport fails
    pub async fn run_inbound(&self, path: InboundPath) -> Result<()> {
        let mut buf = vec![0u8; PACKET_BUFFER_SIZE];
        tracing::info!("Inbound bridge running for {:?} packets", path);

        loop {
            let (n, received) = match path {
                InboundPath::Delivered => {
                    let (n, remote) = self.mesh.recv_from(&mut buf[TUN_OFFSET_BYTES..]).await?;
                    (n, Received::Delivered { remote })
                }
                InboundPath::Undeliverable => {
                    let (n, local, remote) = self.mesh.recv_undeliverable(&mut buf[TUN_OFFSET_BYTES..]).await?;
                    (n, Received::Undeliverable { local, remote })
                }
            };
            let end = TUN_OFFSET_BYTES + n;
            let packet = buf
                .get(TUN_OFFSET_BYTES..end)
                .ok_or_else(|| Error::Mesh(format!("transport reported {} bytes, more than the buffer holds", n)))?;

            match self.accept_inbound(packet, &received) {
                InboundVerdict::Accept { source, remote } => {
                    self.cache.put(source, remote);
                    let written = self.tun.write(&buf[..end], TUN_OFFSET_BYTES).await?;
                    if written != n {
                        return Err(Error::ShortWrite { target: "tun", expected: n, written });
                    }
                    let counter = match received {
                        Received::Delivered { .. } => &self.counters.inbound_delivered,
                        Received::Undeliverable { .. } => &self.counters.inbound_undeliverable,
                    };
                    counter.fetch_add(1, Ordering::Relaxed);
                }
                InboundVerdict::Drop(reason) => {
                    self.counters.inbound_dropped.fetch_add(1, Ordering::Relaxed);
                    trace!("Dropped inbound packet from {:?}: {}", received.remote(), reason.as_str());
                }
            }
        }
    }
}

fn header_addresses(packet: &[u8]) -> Result<(Address, Address)> {
    let src = tun::source_bytes(packet).ok_or(Error::UndersizedPacket(packet.len()))?;
    let dst = tun::destination_bytes(packet).ok_or(Error::UndersizedPacket(packet.len()))?;
    Ok((Address::from_slice(src)?, Address::from_slice(dst)?))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::{Identity, MemoryMesh, MemoryNetwork};
    use crate::tun::testing::ipv6_packet;
    use crate::tun::{MemoryTun, MemoryTunHandle};
    use std::time::Duration;
    use tokio::task::JoinHandle;
    use tokio::time::timeout;

    struct TestNode {
        bridge: Arc<TunBridge>,
        tun: MemoryTunHandle,
        mesh: MemoryMesh,
        cache: Arc<KeyCache>,
        key: PublicKey,
        addr: Address,
    }

    impl TestNode {
        fn new(net: &Arc<MemoryNetwork>, seed: u8, fallback: FallbackPolicy) -> Self {
            let key = Identity::from_seed(&[seed; 32]).public_key();
            let addr = Address::for_key(&key);
            let mesh = net.join(key);
            mesh.set_recv_filter(Arc::new(move |k: &PublicKey| addr.matches_key(k)));

            let (tun, handle) = MemoryTun::new(&format!("mem{}", seed), 1280);
            let cache = Arc::new(KeyCache::default());
            let bridge = Arc::new(TunBridge::new(
                Arc::new(tun),
                Arc::new(mesh.clone()),
                Arc::clone(&cache),
                fallback,
            ));
            Self { bridge, tun: handle, mesh, cache, key, addr }
        }

        fn spawn_loops(&self) -> Vec<JoinHandle<Result<()>>> {
            let out = Arc::clone(&self.bridge);
            let delivered = Arc::clone(&self.bridge);
            let undeliverable = Arc::clone(&self.bridge);
            vec![
                tokio::spawn(async move { out.run_outbound().await }),
                tokio::spawn(async move { delivered.run_inbound(InboundPath::Delivered).await }),
                tokio::spawn(async move { undeliverable.run_inbound(InboundPath::Undeliverable).await }),
            ]
        }
    }

    fn peer(seed: u8) -> (PublicKey, Address) {
        let key = Identity::from_seed(&[seed; 32]).public_key();
        (key, Address::for_key(&key))
    }

    #[tokio::test]
    async fn test_outbound_drops_spoofed_source() {
        let net = MemoryNetwork::new();
        let node = TestNode::new(&net, 1, FallbackPolicy::PrefixGuess);
        let (_, other) = peer(2);
        let (_, third) = peer(3);

        let packet = ipv6_packet(&other, &third, b"spoof");
        assert_eq!(
            node.bridge.classify_outbound(&packet).unwrap(),
            OutboundVerdict::Drop(DropReason::SpoofedSource)
        );
    }

    #[tokio::test]
    async fn test_outbound_drops_foreign_destination() {
        let net = MemoryNetwork::new();
        let node = TestNode::new(&net, 1, FallbackPolicy::PrefixGuess);
        let outside = Address::from(std::net::Ipv6Addr::new(0x2001, 0xdb8, 0, 0, 0, 0, 0, 1));

        let packet = ipv6_packet(&node.addr, &outside, b"");
        assert_eq!(
            node.bridge.classify_outbound(&packet).unwrap(),
            OutboundVerdict::Drop(DropReason::ForeignScope)
        );
    }

    #[tokio::test]
    async fn test_outbound_key_resolution() {
        let net = MemoryNetwork::new();
        let guessing = TestNode::new(&net, 1, FallbackPolicy::PrefixGuess);
        let strict = TestNode::new(&net, 2, FallbackPolicy::Drop);
        let (peer_key, peer_addr) = peer(3);

        let packet = ipv6_packet(&guessing.addr, &peer_addr, b"");
        assert_eq!(
            guessing.bridge.classify_outbound(&packet).unwrap(),
            OutboundVerdict::Send { key: peer_addr.key_prefix(), guessed: true }
        );

        let packet = ipv6_packet(&strict.addr, &peer_addr, b"");
        assert_eq!(
            strict.bridge.classify_outbound(&packet).unwrap(),
            OutboundVerdict::Drop(DropReason::NoCachedKey)
        );

        strict.cache.put(peer_addr, peer_key);
        assert_eq!(
            strict.bridge.classify_outbound(&packet).unwrap(),
            OutboundVerdict::Send { key: peer_key, guessed: false }
        );
    }

    #[tokio::test]
    async fn test_undersized_outbound_is_fatal() {
        let net = MemoryNetwork::new();
        let node = TestNode::new(&net, 1, FallbackPolicy::PrefixGuess);
        node.tun.inject(vec![0x60; 20]);

        let result = timeout(Duration::from_secs(1), node.bridge.run_outbound()).await.unwrap();
        assert!(matches!(result, Err(Error::UndersizedPacket(20))));
    }

    #[tokio::test]
    async fn test_inbound_drops_wrong_destination() {
        let net = MemoryNetwork::new();
        let node = TestNode::new(&net, 1, FallbackPolicy::PrefixGuess);
        let (sender_key, sender_addr) = peer(2);
        let (_, elsewhere) = peer(3);

        let packet = ipv6_packet(&sender_addr, &elsewhere, b"");
        let received = Received::Delivered { remote: sender_key };
        assert_eq!(
            node.bridge.accept_inbound(&packet, &received),
            InboundVerdict::Drop(DropReason::WrongDestination)
        );
        assert!(node.cache.is_empty());
    }

    #[tokio::test]
    async fn test_inbound_drops_forged_source() {
        let net = MemoryNetwork::new();
        let node = TestNode::new(&net, 1, FallbackPolicy::PrefixGuess);
        let (sender_key, _) = peer(2);
        let (_, claimed) = peer(3);

        let packet = ipv6_packet(&claimed, &node.addr, b"");
        let received = Received::Delivered { remote: sender_key };
        assert_eq!(
            node.bridge.accept_inbound(&packet, &received),
            InboundVerdict::Drop(DropReason::KeyMismatch)
        );
    }

    #[tokio::test]
    async fn test_inbound_drops_undersized() {
        let net = MemoryNetwork::new();
        let node = TestNode::new(&net, 1, FallbackPolicy::PrefixGuess);
        let (sender_key, _) = peer(2);

        let received = Received::Delivered { remote: sender_key };
        assert_eq!(
            node.bridge.accept_inbound(&[0x60; 39], &received),
            InboundVerdict::Drop(DropReason::Undersized)
        );
    }

    #[tokio::test]
    async fn test_undeliverable_repair() {
        let net = MemoryNetwork::new();
        let node = TestNode::new(&net, 1, FallbackPolicy::PrefixGuess);
        let (sender_key, sender_addr) = peer(2);
        let (other_key, _) = peer(3);
        let packet = ipv6_packet(&sender_addr, &node.addr, b"");

        let misaddressed = Received::Undeliverable { local: other_key, remote: sender_key };
        assert_eq!(
            node.bridge.accept_inbound(&packet, &misaddressed),
            InboundVerdict::Drop(DropReason::NotAddressedToUs)
        );

        let guessed = Received::Undeliverable { local: node.addr.key_prefix(), remote: sender_key };
        assert_eq!(
            node.bridge.accept_inbound(&packet, &guessed),
            InboundVerdict::Accept { source: sender_addr, remote: sender_key }
        );
    }

    #[tokio::test]
    async fn test_short_tunnel_write_is_fatal() {
        let net = MemoryNetwork::new();
        let node = TestNode::new(&net, 1, FallbackPolicy::PrefixGuess);
        let sender = net.join(peer(2).0);
        node.tun.set_short_writes(true);

        let packet = ipv6_packet(&peer(2).1, &node.addr, b"data");
        sender.send_to(&packet, &node.key).await.unwrap();

        let result = timeout(Duration::from_secs(1), node.bridge.run_inbound(InboundPath::Delivered))
            .await
            .unwrap();
        assert!(matches!(result, Err(Error::ShortWrite { target: "tun", .. })));
        // The key was learned before the write failed
        assert_eq!(node.cache.get(&peer(2).1), Some(peer(2).0));
    }

    #[tokio::test]
    async fn test_closed_transport_ends_inbound_loop() {
        let net = MemoryNetwork::new();
        let node = TestNode::new(&net, 1, FallbackPolicy::PrefixGuess);
        node.mesh.close().await.unwrap();

        let result = node.bridge.run_inbound(InboundPath::Undeliverable).await;
        assert!(matches!(result, Err(Error::MeshClosed)));
    }

    #[tokio::test]
    async fn test_two_nodes_learn_each_other() {
        let net = MemoryNetwork::new();
        let mut x = TestNode::new(&net, 1, FallbackPolicy::PrefixGuess);
        let mut y = TestNode::new(&net, 2, FallbackPolicy::PrefixGuess);
        let mut tasks = x.spawn_loops();
        tasks.extend(y.spawn_loops());
        let wait = Duration::from_secs(2);

        // First contact goes to the prefix guess and arrives as undeliverable
        let hello = ipv6_packet(&x.addr, &y.addr, b"hello");
        x.tun.inject(hello.clone());
        let got = timeout(wait, y.tun.next_written()).await.unwrap().unwrap();
        assert_eq!(got, hello);
        assert_eq!(y.cache.get(&x.addr), Some(x.key));
        assert_eq!(y.mesh.stats().undeliverable, 1);

        // The reply uses the learned key and teaches x the full key of y
        let reply = ipv6_packet(&y.addr, &x.addr, b"reply");
        y.tun.inject(reply.clone());
        let got = timeout(wait, x.tun.next_written()).await.unwrap().unwrap();
        assert_eq!(got, reply);
        assert_eq!(x.cache.get(&y.addr), Some(y.key));

        // From now on x addresses y exactly
        let again = ipv6_packet(&x.addr, &y.addr, b"again");
        x.tun.inject(again.clone());
        let got = timeout(wait, y.tun.next_written()).await.unwrap().unwrap();
        assert_eq!(got, again);
        assert_eq!(y.mesh.stats().undeliverable, 1);
        assert_eq!(y.mesh.stats().delivered, 1);

        assert_eq!(x.bridge.stats().outbound_guessed, 1);
        assert_eq!(y.bridge.stats().inbound_undeliverable, 1);

        for task in tasks {
            task.abort();
        }
    }
}
