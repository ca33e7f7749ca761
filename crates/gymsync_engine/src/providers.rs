//! Collaborator interfaces consumed by the engine.
//!
//! The engine does not authenticate users or persist settings itself. It
//! asks a [`TokenProvider`] for credentials on every connect and reads its
//! settings through a [`ConfigProvider`].

use parking_lot::RwLock;

/// Supplies the bearer token and user id for the connection.
pub trait TokenProvider: Send + Sync {
    /// Returns the current bearer token, if the user is logged in.
    fn token(&self) -> Option<String>;

    /// Returns the authenticated user id.
    fn user_id(&self) -> Option<String>;
}

/// A token provider with fixed credentials.
#[derive(Debug, Clone)]
pub struct StaticTokenProvider {
    token: String,
    user_id: String,
}

impl StaticTokenProvider {
    /// Creates a new static token provider.
    pub fn new(token: impl Into<String>, user_id: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            user_id: user_id.into(),
        }
    }
}

impl TokenProvider for StaticTokenProvider {
    fn token(&self) -> Option<String> {
        Some(self.token.clone())
    }

    fn user_id(&self) -> Option<String> {
        Some(self.user_id.clone())
    }
}

/// Simple get/set access to the persisted sync settings.
pub trait ConfigProvider: Send + Sync {
    /// WebSocket endpoint.
    fn websocket_url(&self) -> Option<String>;
    /// Stores the WebSocket endpoint.
    fn set_websocket_url(&self, url: &str);
    /// Device id.
    fn device_id(&self) -> Option<String>;
    /// Stores the device id.
    fn set_device_id(&self, device_id: &str);
    /// Selective-sync tables.
    fn sync_tables(&self) -> Option<Vec<String>>;
    /// Stores the selective-sync tables.
    fn set_sync_tables(&self, tables: Vec<String>);
}

#[derive(Debug, Default)]
struct Settings {
    websocket_url: Option<String>,
    device_id: Option<String>,
    sync_tables: Option<Vec<String>>,
}

/// In-memory configuration provider.
#[derive(Debug, Default)]
pub struct MemoryConfigProvider {
    settings: RwLock<Settings>,
}

impl MemoryConfigProvider {
    /// Creates an empty provider.
    pub fn new() -> Self {
        Self::default()
    }
}

impl ConfigProvider for MemoryConfigProvider {
    fn websocket_url(&self) -> Option<String> {
        self.settings.read().websocket_url.clone()
    }

    fn set_websocket_url(&self, url: &str) {
        self.settings.write().websocket_url = Some(url.to_string());
    }

    fn device_id(&self) -> Option<String> {
        self.settings.read().device_id.clone()
    }

    fn set_device_id(&self, device_id: &str) {
        self.settings.write().device_id = Some(device_id.to_string());
    }

    fn sync_tables(&self) -> Option<Vec<String>> {
        self.settings.read().sync_tables.clone()
    }

    fn set_sync_tables(&self, tables: Vec<String>) {
        self.settings.write().sync_tables = Some(tables);
    }
}
