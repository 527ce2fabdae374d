//! HTTP API Module
//!
//! Provides a read-only status API for a running node.

mod http;

pub use http::{AppState, HttpServer};
