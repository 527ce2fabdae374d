//! Link Acceptor
//!
//! TCP listener handing every accepted stream to the mesh transport.

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use tokio::net::TcpListener;

use crate::error::{Error, Result};
use crate::mesh::MeshTransport;

/// Pause after a failed accept (e.g. out of file descriptors)
const ACCEPT_ERROR_BACKOFF: Duration = Duration::from_millis(100);

/// Inbound link listener
pub struct LinkAcceptor {
    listener: TcpListener,
    local_addr: SocketAddr,
    mesh: Arc<dyn MeshTransport>,
}

impl LinkAcceptor {
    /// Bind the listener; port 0 picks an ephemeral port
    pub async fn bind(addr: SocketAddr, mesh: Arc<dyn MeshTransport>) -> Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| Error::Network(format!("Failed to bind link listener on {}: {}", addr, e)))?;
        let local_addr = listener.local_addr()?;
        tracing::info!("Link acceptor listening on {}", local_addr);
        Ok(Self { listener, local_addr, mesh })
    }

    /// Address actually bound, including the resolved port
    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Accept forever; returns only when the transport refuses streams
    pub async fn run(&self) -> Result<()> {
        loop {
            let (stream, peer) = match self.listener.accept().await {
                Ok(accepted) => accepted,
                Err(e) => {
                    accept_failed(&e).await;
                    continue;
                }
            };

            tracing::debug!("Accepted link connection from {}", peer);
            match self.mesh.handle_stream(stream).await {
                Ok(()) => {}
                Err(e) if e.is_terminal() => return Err(e),
                Err(e) => tracing::warn!("Transport rejected stream from {}: {}", peer, e),
            }
        }
    }
}

async fn accept_failed(e: &std::io::Error) {
    tracing::error!("Accept error: {}", e);
    tokio::time::sleep(ACCEPT_ERROR_BACKOFF).await;
}
