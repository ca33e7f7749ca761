//! CLI command implementations.

pub mod envelope;
pub mod send;
pub mod watch;

use gymsync_engine::{StaticTokenProvider, SyncConfig, SyncEngine};
use std::sync::Arc;

/// Where and as whom to connect.
pub struct Endpoint {
    /// WebSocket URL.
    pub url: String,
    /// Bearer token.
    pub token: Option<String>,
    /// User id.
    pub user_id: String,
    /// Device id.
    pub device_id: String,
}

impl Endpoint {
    /// Builds a WebSocket engine for this endpoint, subscribed to `tables`
    /// (every table when empty).
    pub fn engine(&self, tables: Vec<String>) -> Result<SyncEngine, Box<dyn std::error::Error>> {
        let token = self
            .token
            .clone()
            .ok_or("auth token required (--token or GYMSYNC_TOKEN)")?;

        let mut config = SyncConfig::new(self.url.clone(), self.device_id.clone());
        if !tables.is_empty() {
            config = config.with_sync_tables(tables);
        }
        let tokens = Arc::new(StaticTokenProvider::new(token, self.user_id.clone()));
        Ok(SyncEngine::websocket(config, tokens)?)
    }
}
