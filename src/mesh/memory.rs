//! In-process mesh transport
//!
//! Nodes joined to the same [`MemoryNetwork`] reach each other directly.
//! Routing follows the same rule as the link transport: exact key first,
//! then the longest shared prefix. Used by tests and local simulations.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};

use async_trait::async_trait;
use bytes::Bytes;
use serde::Serialize;
use tokio::net::TcpStream;

use super::inbox::Inbox;
use super::{classify_delivery, select_route, Delivery, MeshTransport, PublicKey, RecvFilter};
use crate::error::{Error, Result};

const MEMORY_QUEUE_DEPTH: usize = 256;

#[derive(Default)]
struct NodeStats {
    sent: AtomicU64,
    delivered: AtomicU64,
    undeliverable: AtomicU64,
    dropped: AtomicU64,
}

/// Counters for one in-process node
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MemoryStats {
    pub sent: u64,
    pub delivered: u64,
    pub undeliverable: u64,
    pub dropped: u64,
}

struct MemoryNode {
    key: PublicKey,
    inbox: Inbox,
    filter: RwLock<Option<RecvFilter>>,
    stats: NodeStats,
}

impl MemoryNode {
    fn accept(&self, packet: Bytes, dest: &PublicKey, from: PublicKey) -> bool {
        let filter = self.filter.read().unwrap_or_else(|e| e.into_inner()).clone();
        let queued = match classify_delivery(&self.key, dest, filter.as_ref()) {
            Delivery::Local => {
                let ok = self.inbox.push_delivered(packet, from);
                if ok {
                    self.stats.delivered.fetch_add(1, Ordering::Relaxed);
                }
                ok
            }
            Delivery::Undeliverable => {
                let ok = self.inbox.push_undeliverable(packet, *dest, from);
                if ok {
                    self.stats.undeliverable.fetch_add(1, Ordering::Relaxed);
                }
                ok
            }
            Delivery::Reject => false,
        };
        if !queued {
            self.stats.dropped.fetch_add(1, Ordering::Relaxed);
        }
        queued
    }
}

/// Shared medium for in-process nodes
#[derive(Default)]
pub struct MemoryNetwork {
    nodes: RwLock<HashMap<PublicKey, Arc<MemoryNode>>>,
}

impl MemoryNetwork {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    /// Attach a node reachable at `key`, replacing any previous node with it
    pub fn join(self: &Arc<Self>, key: PublicKey) -> MemoryMesh {
        let node = Arc::new(MemoryNode {
            key,
            inbox: Inbox::new(MEMORY_QUEUE_DEPTH),
            filter: RwLock::new(None),
            stats: NodeStats::default(),
        });
        self.nodes
            .write()
            .unwrap_or_else(|e| e.into_inner())
            .insert(key, Arc::clone(&node));
        MemoryMesh {
            network: Arc::clone(self),
            node,
        }
    }

    fn route(&self, dest: &PublicKey) -> Option<Arc<MemoryNode>> {
        let nodes = self.nodes.read().unwrap_or_else(|e| e.into_inner());
        select_route(dest, nodes.keys()).and_then(|key| nodes.get(&key).cloned())
    }

    fn node_count(&self) -> usize {
        self.nodes.read().unwrap_or_else(|e| e.into_inner()).len()
    }
}

/// One node's handle on a [`MemoryNetwork`]
#[derive(Clone)]
pub struct MemoryMesh {
    network: Arc<MemoryNetwork>,
    node: Arc<MemoryNode>,
}

impl MemoryMesh {
    pub fn stats(&self) -> MemoryStats {
        let s = &self.node.stats;
        MemoryStats {
            sent: s.sent.load(Ordering::Relaxed),
            delivered: s.delivered.load(Ordering::Relaxed),
            undeliverable: s.undeliverable.load(Ordering::Relaxed),
            dropped: s.dropped.load(Ordering::Relaxed),
        }
    }
}

#[async_trait]
impl MeshTransport for MemoryMesh {
    fn local_key(&self) -> PublicKey {
        self.node.key
    }

    async fn send_to(&self, packet: &[u8], dest: &PublicKey) -> Result<usize> {
        self.node.stats.sent.fetch_add(1, Ordering::Relaxed);
        match self.network.route(dest) {
            Some(target) => {
                target.accept(Bytes::copy_from_slice(packet), dest, self.node.key);
            }
            None => tracing::trace!("No memory node near {:?}, dropped packet", dest),
        }
        Ok(packet.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, PublicKey)> {
        self.node.inbox.recv_delivered(buf).await
    }

    async fn recv_undeliverable(&self, buf: &mut [u8]) -> Result<(usize, PublicKey, PublicKey)> {
        self.node.inbox.recv_undeliverable(buf).await
    }

    async fn handle_stream(&self, _stream: TcpStream) -> Result<()> {
        Err(Error::Mesh("memory transport does not take byte streams".into()))
    }

    fn set_recv_filter(&self, filter: RecvFilter) {
        *self.node.filter.write().unwrap_or_else(|e| e.into_inner()) = Some(filter);
    }

    fn link_count(&self) -> usize {
        self.network.node_count().saturating_sub(1)
    }

    fn is_linked(&self, key: &PublicKey) -> bool {
        *key != self.node.key && self.network.nodes.read().unwrap_or_else(|e| e.into_inner()).contains_key(key)
    }

    async fn close(&self) -> Result<()> {
        {
            let mut nodes = self.network.nodes.write().unwrap_or_else(|e| e.into_inner());
            if nodes.get(&self.node.key).map_or(false, |n| Arc::ptr_eq(n, &self.node)) {
                nodes.remove(&self.node.key);
            }
        }
        self.node.inbox.close();
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mesh::ROUTE_PREFIX_BYTES;

    fn key(prefix: u8, tail: u8) -> PublicKey {
        let mut bytes = [prefix; 32];
        bytes[ROUTE_PREFIX_BYTES..].fill(tail);
        PublicKey::from_bytes(bytes)
    }

    #[tokio::test]
    async fn test_exact_delivery() {
        let net = MemoryNetwork::new();
        let a = net.join(key(1, 1));
        let b = net.join(key(2, 2));

        a.send_to(b"ping", &b.local_key()).await.unwrap();
        let mut buf = [0u8; 64];
        let (n, from) = b.recv_from(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"ping");
        assert_eq!(from, a.local_key());
        assert_eq!(b.stats().delivered, 1);
    }

    #[tokio::test]
    async fn test_prefix_guess_is_undeliverable() {
        let net = MemoryNetwork::new();
        let a = net.join(key(1, 1));
        let b = net.join(key(2, 2));
        let owner = b.local_key();
        b.set_recv_filter(Arc::new(move |k: &PublicKey| k.common_prefix_len(&owner) >= ROUTE_PREFIX_BYTES));

        let guess = key(2, 0);
        a.send_to(b"who", &guess).await.unwrap();

        let mut buf = [0u8; 64];
        let (n, local, remote) = b.recv_undeliverable(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"who");
        assert_eq!(local, guess);
        assert_eq!(remote, a.local_key());
    }

    #[tokio::test]
    async fn test_guess_without_filter_is_dropped() {
        let net = MemoryNetwork::new();
        let a = net.join(key(1, 1));
        let b = net.join(key(2, 2));

        a.send_to(b"who", &key(2, 0)).await.unwrap();
        assert_eq!(b.stats().dropped, 1);
        assert_eq!(b.stats().undeliverable, 0);
    }

    #[tokio::test]
    async fn test_close_detaches_node() {
        let net = MemoryNetwork::new();
        let a = net.join(key(1, 1));
        let b = net.join(key(2, 2));
        assert_eq!(a.link_count(), 1);
        assert!(a.is_linked(&b.local_key()));
        assert!(!a.is_linked(&a.local_key()));

        b.close().await.unwrap();
        assert_eq!(a.link_count(), 0);
        assert!(!a.is_linked(&b.local_key()));
        let mut buf = [0u8; 8];
        assert!(matches!(b.recv_from(&mut buf).await, Err(Error::MeshClosed)));
    }
}
