//! WolfMesh - IPv6 tunnel bridge for public-key routed mesh networks
//!
//! WolfMesh gives every node an IPv6 address in `fd00::/8` derived from its
//! Ed25519 public key and carries ordinary IPv6 traffic from a TUN
//! interface over a transport that routes by public key.
//!
//! # Architecture
//!
//! An address only holds the first 15 bytes of its owner's key. Outbound
//! packets are sent to the full key when it is cached, or to the embedded
//! prefix otherwise; the owner receives such packets as "undeliverable"
//! and learns the sender's full key from them. Replies then travel to
//! exact keys in both directions.
//!
//! # Features
//!
//! - Address codec and expiring address → key cache
//! - Tunnel bridge with outbound, delivered and undeliverable loops
//! - IPv6 multicast LAN discovery and an inbound link acceptor
//! - Authenticated one-hop link transport over TCP
//! - Supervised loops with restart policies
//! - Read-only HTTP status API

pub mod address;
pub mod api;
pub mod bridge;
pub mod cache;
pub mod config;
pub mod error;
pub mod mesh;
pub mod network;
pub mod supervisor;
pub mod tun;

pub use config::WolfMeshConfig;
pub use error::{Error, Result};

/// Re-export commonly used types
pub mod prelude {
    pub use crate::address::Address;
    pub use crate::bridge::{FallbackPolicy, InboundPath, TunBridge};
    pub use crate::cache::KeyCache;
    pub use crate::config::WolfMeshConfig;
    pub use crate::error::{Error, Result};
    pub use crate::mesh::{Identity, MeshTransport, PublicKey};
    pub use crate::supervisor::{RestartPolicy, Supervisor};
    pub use crate::tun::TunDevice;
}
