//! HTTP API Server
//!
//! Read-only status endpoints: health, node status and the key cache.

use std::sync::Arc;
use std::time::Instant;

use axum::{extract::State, response::Json, routing::get, Router};
use chrono::{DateTime, Utc};
use serde::Serialize;
use tower_http::trace::TraceLayer;

use crate::address::Address;
use crate::bridge::{BridgeStats, TunBridge};
use crate::cache::{CacheSnapshot, KeyCache};
use crate::error::{Error, Result};
use crate::mesh::MeshTransport;
use crate::supervisor::{LoopStatus, SupervisorHandle};

/// Shared application state
pub struct AppState {
    /// Our mesh address
    pub address: Address,
    /// Tunnel interface name, if a tunnel is running
    pub tun_name: Option<String>,
    /// Link acceptor port
    pub link_port: u16,
    pub mesh: Arc<dyn MeshTransport>,
    pub cache: Arc<KeyCache>,
    pub bridge: Option<Arc<TunBridge>>,
    pub supervisor: SupervisorHandle,
    pub started_at: DateTime<Utc>,
    started: Instant,
}

impl AppState {
    pub fn new(
        tun_name: Option<String>,
        link_port: u16,
        mesh: Arc<dyn MeshTransport>,
        cache: Arc<KeyCache>,
        bridge: Option<Arc<TunBridge>>,
        supervisor: SupervisorHandle,
    ) -> Self {
        Self {
            address: Address::for_key(&mesh.local_key()),
            tun_name,
            link_port,
            mesh,
            cache,
            bridge,
            supervisor,
            started_at: Utc::now(),
            started: Instant::now(),
        }
    }
}

/// HTTP API server
pub struct HttpServer {
    bind_address: std::net::SocketAddr,
    state: Arc<AppState>,
}

impl HttpServer {
    /// Create a new HTTP server
    pub fn new(bind_address: std::net::SocketAddr, state: AppState) -> Self {
        Self {
            bind_address,
            state: Arc::new(state),
        }
    }

    /// Create the router
    fn create_router(state: Arc<AppState>) -> Router {
        Router::new()
            .route("/health", get(handle_health))
            .route("/status", get(handle_status))
            .route("/cache", get(handle_cache))
            .layer(TraceLayer::new_for_http())
            .with_state(state)
    }

    /// Start the HTTP server
    pub async fn start(&self) -> Result<()> {
        let app = Self::create_router(Arc::clone(&self.state));

        let listener = tokio::net::TcpListener::bind(self.bind_address).await?;
        tracing::info!("HTTP API listening on {}", self.bind_address);

        axum::serve(listener, app)
            .await
            .map_err(|e| Error::Network(format!("HTTP server error: {}", e)))?;

        Ok(())
    }
}

// ============ Response Types ============

/// Health response
#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub healthy: bool,
    pub address: String,
}

/// Status response
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub address: Address,
    pub public_key: String,
    pub tun: Option<String>,
    pub link_port: u16,
    pub started_at: DateTime<Utc>,
    pub uptime_seconds: u64,
    pub links: usize,
    pub cached_keys: usize,
    pub bridge: Option<BridgeStats>,
    pub loops: Vec<LoopStatus>,
}

/// Cache listing response
#[derive(Debug, Serialize)]
pub struct CacheResponse {
    pub ttl_seconds: u64,
    pub entries: Vec<CacheSnapshot>,
}

// ============ Handlers ============

async fn handle_health(State(state): State<Arc<AppState>>) -> Json<HealthResponse> {
    let failed = state
        .supervisor
        .statuses()
        .iter()
        .any(|s| s.state == crate::supervisor::LoopState::Failed);

    Json(HealthResponse {
        healthy: !failed,
        address: state.address.to_string(),
    })
}

async fn handle_status(State(state): State<Arc<AppState>>) -> Json<StatusResponse> {
    Json(StatusResponse {
        address: state.address,
        public_key: state.mesh.local_key().to_hex(),
        tun: state.tun_name.clone(),
        link_port: state.link_port,
        started_at: state.started_at,
        uptime_seconds: state.started.elapsed().as_secs(),
        links: state.mesh.link_count(),
        cached_keys: state.cache.len(),
        bridge: state.bridge.as_ref().map(|b| b.stats()),
        loops: state.supervisor.statuses(),
    })
}

async fn handle_cache(State(state): State<Arc<AppState>>) -> Json<CacheResponse> {
    Json(CacheResponse {
        ttl_seconds: state.cache.ttl().as_secs(),
        entries: state.cache.snapshot(),
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::Error;
    use crate::mesh::{Identity, MemoryNetwork};
    use crate::supervisor::{RestartPolicy, Supervisor};

    fn state(supervisor: &Supervisor) -> Arc<AppState> {
        let net = MemoryNetwork::new();
        let mesh: Arc<dyn MeshTransport> = Arc::new(net.join(Identity::from_seed(&[1u8; 32]).public_key()));
        Arc::new(AppState::new(
            None,
            9600,
            mesh,
            Arc::new(KeyCache::default()),
            None,
            supervisor.handle(),
        ))
    }

    #[tokio::test]
    async fn test_status_reports_identity() {
        let supervisor = Supervisor::new(RestartPolicy::never());
        let state = state(&supervisor);
        let peer = Identity::from_seed(&[2u8; 32]).public_key();
        state.cache.put(Address::for_key(&peer), peer);

        let Json(status) = handle_status(State(Arc::clone(&state))).await;
        assert_eq!(status.address, state.address);
        assert_eq!(status.public_key, state.mesh.local_key().to_hex());
        assert_eq!(status.cached_keys, 1);
        assert!(status.bridge.is_none());

        let Json(cache) = handle_cache(State(state)).await;
        assert_eq!(cache.ttl_seconds, 60);
        assert_eq!(cache.entries[0].key, peer.to_hex());
    }

    #[tokio::test]
    async fn test_health_reflects_failed_loops() {
        let supervisor = Supervisor::new(RestartPolicy::never());
        let state = state(&supervisor);
        let Json(health) = handle_health(State(Arc::clone(&state))).await;
        assert!(health.healthy);

        supervisor.spawn("acceptor", || async { Err(Error::Network("bind failed".into())) });
        supervisor.join().await;
        let Json(health) = handle_health(State(state)).await;
        assert!(!health.healthy);
    }
}
