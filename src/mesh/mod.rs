//! Mesh Transport Module
//!
//! The public-key routed packet transport the tunnel bridge rides on.
//! The bridge only sees the [`MeshTransport`] contract: send to a key,
//! receive with the sender's key, receive packets that were not addressed
//! to our exact key, and hand over byte streams for link setup.

mod inbox;
pub mod link;
pub mod memory;
pub mod wire;

pub use link::{LinkConfig, LinkMesh};
pub use memory::{MemoryMesh, MemoryNetwork};

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use ed25519_dalek::{Signature, Signer, SigningKey, Verifier, VerifyingKey};
use tokio::net::TcpStream;

use crate::error::{Error, Result};

/// Length of a mesh public key in bytes
pub const PUBLIC_KEY_LEN: usize = 32;

/// Minimum shared key prefix for a link to carry a packet addressed to a
/// key that is not exactly its own. Matches the key bytes an address holds.
pub const ROUTE_PREFIX_BYTES: usize = 15;

/// Raw mesh public key.
///
/// Not required to be a valid curve point: keys guessed from an address
/// prefix are carried in this type too.
#[derive(Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PublicKey([u8; PUBLIC_KEY_LEN]);

impl PublicKey {
    pub const fn from_bytes(bytes: [u8; PUBLIC_KEY_LEN]) -> Self {
        Self(bytes)
    }

    /// Build a key from a slice, failing unless it is exactly 32 bytes
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        let arr: [u8; PUBLIC_KEY_LEN] = bytes
            .try_into()
            .map_err(|_| Error::Key(format!("expected {} bytes, got {}", PUBLIC_KEY_LEN, bytes.len())))?;
        Ok(Self(arr))
    }

    /// Parse a hex encoded key
    pub fn from_hex(s: &str) -> Result<Self> {
        let bytes = hex::decode(s.trim()).map_err(|e| Error::Key(e.to_string()))?;
        Self::from_slice(&bytes)
    }

    pub fn as_bytes(&self) -> &[u8; PUBLIC_KEY_LEN] {
        &self.0
    }

    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Number of leading bytes this key shares with `other`
    pub fn common_prefix_len(&self, other: &PublicKey) -> usize {
        self.0
            .iter()
            .zip(other.0.iter())
            .take_while(|(a, b)| a == b)
            .count()
    }

    /// Convert to a verifying key, failing for bytes that are not a curve point
    pub fn verifying_key(&self) -> Result<VerifyingKey> {
        Ok(VerifyingKey::from_bytes(&self.0)?)
    }
}

impl fmt::Display for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_hex())
    }
}

impl fmt::Debug for PublicKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PublicKey({}..)", hex::encode(&self.0[..8]))
    }
}

/// This node's mesh identity: an Ed25519 keypair generated once per process.
pub struct Identity {
    signing_key: SigningKey,
    public_key: PublicKey,
}

impl Identity {
    /// Generate a new random identity
    pub fn generate() -> Self {
        Self::from_signing_key(SigningKey::generate(&mut rand::rngs::OsRng))
    }

    /// Build an identity from a 32-byte seed
    pub fn from_seed(seed: &[u8; 32]) -> Self {
        Self::from_signing_key(SigningKey::from_bytes(seed))
    }

    fn from_signing_key(signing_key: SigningKey) -> Self {
        let public_key = PublicKey(signing_key.verifying_key().to_bytes());
        Self { signing_key, public_key }
    }

    pub fn public_key(&self) -> PublicKey {
        self.public_key
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        self.signing_key.sign(message)
    }
}

/// Verify an Ed25519 signature made by `key`
pub fn verify_signature(key: &PublicKey, message: &[u8], signature: &Signature) -> Result<()> {
    key.verifying_key()?.verify(message, signature)?;
    Ok(())
}

/// Predicate over the key a packet claims to be addressed to.
///
/// Packets addressed to a key other than our exact key are surfaced on the
/// undeliverable path only when the filter accepts that key.
pub type RecvFilter = Arc<dyn Fn(&PublicKey) -> bool + Send + Sync>;

/// Contract of the mesh transport consumed by the bridge, discovery and the
/// link acceptor.
#[async_trait]
pub trait MeshTransport: Send + Sync {
    /// Key this transport is reachable at
    fn local_key(&self) -> PublicKey;

    /// Send one packet to `dest`, returning the number of bytes accepted
    async fn send_to(&self, packet: &[u8], dest: &PublicKey) -> Result<usize>;

    /// Receive a packet addressed to our exact key.
    /// Returns (length, sender's full key).
    async fn recv_from(&self, buf: &mut [u8]) -> Result<(usize, PublicKey)>;

    /// Receive a packet that reached us but was addressed to a different key.
    /// Returns (length, key it was addressed to, sender's full key).
    async fn recv_undeliverable(&self, buf: &mut [u8]) -> Result<(usize, PublicKey, PublicKey)>;

    /// Hand an accepted or initiated byte stream to the transport for link setup
    async fn handle_stream(&self, stream: TcpStream) -> Result<()>;

    /// Install the filter deciding which misaddressed packets are surfaced
    fn set_recv_filter(&self, filter: RecvFilter);

    /// Number of live links
    fn link_count(&self) -> usize;

    /// Whether a link to exactly `key` is up
    fn is_linked(&self, key: &PublicKey) -> bool;

    /// Close the transport; pending and future receives fail with `MeshClosed`
    async fn close(&self) -> Result<()>;
}

/// Pick the key to carry a packet addressed to `dest`.
///
/// An exact match wins. Otherwise the candidate sharing the longest key
/// prefix with `dest` is used, provided it shares at least
/// [`ROUTE_PREFIX_BYTES`].
pub fn select_route<'a, I>(dest: &PublicKey, candidates: I) -> Option<PublicKey>
where
    I: IntoIterator<Item = &'a PublicKey>,
{
    let mut best: Option<(usize, PublicKey)> = None;
    for key in candidates {
        let shared = key.common_prefix_len(dest);
        if shared == PUBLIC_KEY_LEN {
            return Some(*key);
        }
        if shared >= ROUTE_PREFIX_BYTES && best.map_or(true, |(len, _)| shared > len) {
            best = Some((shared, *key));
        }
    }
    best.map(|(_, key)| key)
}

/// What a receiving node does with a packet addressed to `dest`
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Delivery {
    /// Addressed to our exact key
    Local,
    /// Addressed to another key the receive filter accepts
    Undeliverable,
    /// Not for us
    Reject,
}

pub(crate) fn classify_delivery(
    local: &PublicKey,
    dest: &PublicKey,
    filter: Option<&RecvFilter>,
) -> Delivery {
    if dest == local {
        Delivery::Local
    } else if filter.map_or(false, |f| f(dest)) {
        Delivery::Undeliverable
    } else {
        Delivery::Reject
    }
}
