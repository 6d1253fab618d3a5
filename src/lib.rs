//! Per-symbol limit-order matching engine with price-time priority,
//! conditional (stop) orders, a write-ahead log with deterministic replay,
//! and asynchronous broadcast fan-out for client-facing updates.
//!
//! The HTTP and WebSocket layers are external collaborators: they hand the
//! [`engine::Engine`] validated requests and receive serialized updates
//! through a [`broadcast::BroadcastSink`].

use serde::{Deserialize, Serialize};

pub mod broadcast;
pub mod engine;
pub mod model;
pub mod orderbook;
pub mod stops;
pub mod wal;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CoreHealth {
    pub service: String,
    pub status: String,
}

pub fn health() -> CoreHealth {
    CoreHealth {
        service: "matching-core".to_string(),
        status: "ok".to_string(),
    }
}
