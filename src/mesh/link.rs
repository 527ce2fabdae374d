//! Direct link transport
//!
//! A one-hop [`MeshTransport`] over TCP links. Each link authenticates the
//! remote key with a signed nonce exchange, after which every data frame
//! received on it is attributed to that key. Multi-hop routing is left to
//! a full mesh router; this transport only forwards to directly linked
//! peers, picking the link whose key best matches the destination.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, RwLock};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use rand::RngCore;
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch, Notify};
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use super::inbox::Inbox;
use super::wire::{proof_message, Frame, NONCE_LEN};
use super::{
    classify_delivery, select_route, verify_signature, Delivery, Identity, MeshTransport, PublicKey,
    RecvFilter,
};
use crate::error::{Error, Result};

/// Largest frame accepted on a link
const MAX_FRAME_LEN: usize = 65_535 + 64;

/// Link transport tuning
#[derive(Debug, Clone)]
pub struct LinkConfig {
    /// Depth of each receive queue and of each link's send queue
    pub queue_depth: usize,
    /// Time allowed for the hello/proof exchange
    pub handshake_timeout: Duration,
}

impl Default for LinkConfig {
    fn default() -> Self {
        Self {
            queue_depth: 1024,
            handshake_timeout: Duration::from_secs(5),
        }
    }
}

/// Orders concurrent links between the same pair of nodes.
///
/// The nonce the lower-keyed node sent in the handshake. Both ends compute
/// the same tag for a connection, so both keep the same one.
type LinkTag = [u8; NONCE_LEN];

struct LinkHandle {
    id: u64,
    tag: LinkTag,
    remote_addr: SocketAddr,
    tx: mpsc::Sender<Bytes>,
    evicted: Arc<Notify>,
    established: Instant,
}

struct Inner {
    identity: Identity,
    config: LinkConfig,
    links: RwLock<HashMap<PublicKey, LinkHandle>>,
    inbox: Inbox,
    filter: RwLock<Option<RecvFilter>>,
    next_link_id: AtomicU64,
    shutdown: watch::Sender<bool>,
}

/// Summary of one live link
#[derive(Debug, Clone)]
pub struct LinkInfo {
    pub key: PublicKey,
    pub remote_addr: SocketAddr,
    pub uptime: Duration,
}

/// One-hop mesh transport over authenticated TCP links
#[derive(Clone)]
pub struct LinkMesh {
    inner: Arc<Inner>,
}

impl LinkMesh {
    /// Create a transport for `identity`
    pub fn new(identity: Identity, config: LinkConfig) -> Self {
        let (shutdown, _) = watch::channel(false);
        let inbox = Inbox::new(config.queue_depth);
        Self {
            inner: Arc::new(Inner {
                identity,
                config,
                links: RwLock::new(HashMap::new()),
                inbox,
                filter: RwLock::new(None),
                next_link_id: AtomicU64::new(1),
                shutdown,
            }),
        }
    }

    /// Live links, for status reporting
    pub fn links(&self) -> Vec<LinkInfo> {
        let links = self.inner.links.read().unwrap_or_else(|e| e.into_inner());
        links
            .iter()
            .map(|(key, link)| LinkInfo {
                key: *key,
                remote_addr: link.remote_addr,
                uptime: link.established.elapsed(),
            })
            .collect()
    }

    fn is_closed(&self) -> bool {
        *self.inner.shutdown.borrow()
    }
}

#[async_trait]
impl MeshTransport for LinkMesh {
    fn local_key(&self) -> PublicKey {
        self.inner.identity.public_key()
    }

    async fn send_to(&self, packet: &[u8], dest: &PublicKey) -> Result<usize> {
        if self.is_closed() {
            return Err(Error::MeshClosed);
        }

        let tx = {
            let links = self.inner.links.read().unwrap_or_else(|e| e.into_inner());
            select_route(dest, links.keys()).and_then(|key| links.get(&key).map(|l| l.tx.clone()))
        };

        match tx {
            Some(tx) => {
                let frame = Frame::Data { dest: *dest, payload: Bytes::copy_from_slice(packet) }.encode();
                if tx.try_send(frame).is_err() {
                    tracing::trace!("Link queue full or closing, dropped packet for {:?}", dest);
                }
            }
            None => tracing::trace!("No link towards {:?}, dropped packet", dest),
        }

        Ok(packet.len())
    }

    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, PublicKey)> {
        self.inner.inbox.recv_delivered(buf).await
    }

    async fn recv_undeliverable(&self, buf: &mut [u8]) -> Result<(usize, PublicKey, PublicKey)> {
        self.inner.inbox.recv_undeliverable(buf).await
    }

    async fn handle_stream(&self, stream: TcpStream) -> Result<()> {
        if self.is_closed() {
            return Err(Error::MeshClosed);
        }
        let remote_addr = stream.peer_addr()?;
        stream.set_nodelay(true)?;

        let inner = Arc::clone(&self.inner);
        tokio::spawn(async move {
            if let Err(e) = run_link(inner, stream, remote_addr).await {
                tracing::debug!("Link with {} ended: {}", remote_addr, e);
            }
        });
        Ok(())
    }

    fn set_recv_filter(&self, filter: RecvFilter) {
        *self.inner.filter.write().unwrap_or_else(|e| e.into_inner()) = Some(filter);
    }

    fn link_count(&self) -> usize {
        self.inner.links.read().unwrap_or_else(|e| e.into_inner()).len()
    }

    fn is_linked(&self, key: &PublicKey) -> bool {
        self.inner.links.read().unwrap_or_else(|e| e.into_inner()).contains_key(key)
    }

    async fn close(&self) -> Result<()> {
        self.inner.shutdown.send_replace(true);
        self.inner.links.write().unwrap_or_else(|e| e.into_inner()).clear();
        self.inner.inbox.close();
        tracing::info!("Link transport closed");
        Ok(())
    }
}

type LinkStream = Framed<TcpStream, LengthDelimitedCodec>;

/// Drive one link from handshake to teardown
async fn run_link(inner: Arc<Inner>, stream: TcpStream, remote_addr: SocketAddr) -> Result<()> {
    let codec = LengthDelimitedCodec::builder()
        .max_frame_length(MAX_FRAME_LEN)
        .new_codec();
    let mut framed = Framed::new(stream, codec);

    let (peer_key, tag) = tokio::time::timeout(
        inner.config.handshake_timeout,
        handshake(&mut framed, &inner.identity, remote_addr),
    )
    .await
    .map_err(|_| Error::ConnectionTimeout(remote_addr.to_string()))??;

    if peer_key == inner.identity.public_key() {
        tracing::debug!("Dropping link to ourselves via {}", remote_addr);
        return Ok(());
    }

    let (tx, mut rx) = mpsc::channel::<Bytes>(inner.config.queue_depth.max(1));
    let link_id = inner.next_link_id.fetch_add(1, Ordering::Relaxed);
    let evicted = Arc::new(Notify::new());
    let mut shutdown_rx = inner.shutdown.subscribe();
    {
        let mut links = inner.links.write().unwrap_or_else(|e| e.into_inner());
        if *shutdown_rx.borrow() {
            return Err(Error::MeshClosed);
        }
        if let Some(existing) = links.get(&peer_key) {
            if existing.tag <= tag {
                tracing::debug!("Already linked to {:?}, dropping duplicate from {}", peer_key, remote_addr);
                return Ok(());
            }
            tracing::debug!("Replacing link to {:?} at {} with {}", peer_key, existing.remote_addr, remote_addr);
            existing.evicted.notify_one();
        }
        let handle = LinkHandle {
            id: link_id,
            tag,
            remote_addr,
            tx,
            evicted: Arc::clone(&evicted),
            established: Instant::now(),
        };
        links.insert(peer_key, handle);
    }
    tracing::info!("Link up with {} at {}", peer_key, remote_addr);

    let (mut sink, mut frames) = framed.split();
    let writer = tokio::spawn(async move {
        while let Some(frame) = rx.recv().await {
            if let Err(e) = sink.send(frame).await {
                tracing::debug!("Link write to {} failed: {}", remote_addr, e);
                break;
            }
        }
    });

    let result = loop {
        tokio::select! {
            frame = frames.next() => {
                match frame {
                    Some(Ok(data)) => match Frame::decode(data) {
                        Some(Frame::Data { dest, payload }) => deliver(&inner, peer_key, dest, payload),
                        Some(_) => tracing::debug!("Unexpected handshake frame from {}", remote_addr),
                        None => tracing::debug!("Malformed frame from {}", remote_addr),
                    },
                    Some(Err(e)) => break Err(Error::Io(e)),
                    None => break Ok(()),
                }
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break Ok(());
                }
            }
            _ = evicted.notified() => break Ok(()),
        }
    };

    writer.abort();
    {
        let mut links = inner.links.write().unwrap_or_else(|e| e.into_inner());
        if links.get(&peer_key).map_or(false, |l| l.id == link_id) {
            links.remove(&peer_key);
        }
    }
    tracing::info!("Link down with {} at {}", peer_key, remote_addr);
    result
}

/// Exchange hellos and signed nonces; returns the authenticated peer key
/// and the tag of this connection
async fn handshake(
    framed: &mut LinkStream,
    identity: &Identity,
    remote_addr: SocketAddr,
) -> Result<(PublicKey, LinkTag)> {
    let fail = |reason: &str| Error::Handshake { peer: remote_addr.to_string(), reason: reason.to_string() };

    let mut our_nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut our_nonce);
    framed
        .send(Frame::Hello { key: identity.public_key(), nonce: our_nonce }.encode())
        .await?;

    let (peer_key, peer_nonce) = match next_frame(framed).await? {
        Some(Frame::Hello { key, nonce }) => (key, nonce),
        _ => return Err(fail("expected hello")),
    };

    let signature = identity.sign(&proof_message(&peer_nonce, &identity.public_key()));
    framed.send(Frame::Proof { signature }.encode()).await?;

    match next_frame(framed).await? {
        Some(Frame::Proof { signature }) => {
            verify_signature(&peer_key, &proof_message(&our_nonce, &peer_key), &signature)
                .map_err(|_| fail("bad key proof"))?;
        }
        _ => return Err(fail("expected proof")),
    }

    let tag = if identity.public_key() < peer_key { our_nonce } else { peer_nonce };
    Ok((peer_key, tag))
}

async fn next_frame(framed: &mut LinkStream) -> Result<Option<Frame>> {
    match framed.next().await {
        Some(Ok(data)) => Ok(Frame::decode(data)),
        Some(Err(e)) => Err(Error::Io(e)),
        None => Err(Error::Network("link closed during handshake".into())),
    }
}

fn deliver(inner: &Inner, remote: PublicKey, dest: PublicKey, payload: Bytes) {
    let local = inner.identity.public_key();
    let filter = inner.filter.read().unwrap_or_else(|e| e.into_inner()).clone();
    let queued = match classify_delivery(&local, &dest, filter.as_ref()) {
        Delivery::Local => inner.inbox.push_delivered(payload, remote),
        Delivery::Undeliverable => inner.inbox.push_undeliverable(payload, dest, remote),
        Delivery::Reject => {
            tracing::trace!("Rejected packet from {:?} addressed to {:?}", remote, dest);
            return;
        }
    };
    if !queued {
        tracing::trace!("Receive queue full, dropped packet from {:?}", remote);
    }
}
