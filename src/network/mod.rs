//! Network Module
//!
//! LAN peer discovery and the inbound link listener. Both only produce TCP
//! streams; link setup belongs to the mesh transport.

pub mod acceptor;
pub mod discovery;

pub use acceptor::LinkAcceptor;
pub use discovery::{connect_peer, Discovery};
