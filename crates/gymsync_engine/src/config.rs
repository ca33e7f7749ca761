//! Configuration for the sync engine.

use crate::error::{SyncError, SyncResult};
use crate::providers::ConfigProvider;
use gymsync_protocol::{CompressionSettings, ResolutionStrategy};
use std::collections::HashMap;
use std::time::Duration;

/// Default WebSocket endpoint.
pub const DEFAULT_WEBSOCKET_URL: &str = "ws://localhost:8000/ws/sync";

/// Configuration for the sync engine.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// WebSocket endpoint of the sync server.
    pub websocket_url: String,
    /// Device id (unique per installation).
    pub device_id: String,
    /// Selective-sync allow-list; `None` subscribes to every table.
    pub sync_tables: Option<Vec<String>>,
    /// Envelope compression settings.
    pub compression: CompressionSettings,
    /// Reconnection behaviour.
    pub reconnect: ReconnectConfig,
    /// Maximum queued operations; `None` means unbounded.
    pub queue_capacity: Option<usize>,
    /// Queue length above which a backpressure warning is logged.
    pub queue_warn_threshold: usize,
    /// Transmission attempts per operation before it is dropped.
    pub max_delivery_attempts: u32,
    /// Pause before retrying a failed transmission.
    pub delivery_retry_delay: Duration,
    /// Number of resolved conflicts kept for inspection.
    pub conflict_history_limit: usize,
    /// Outbound messages allowed per minute; `None` means unlimited.
    pub max_messages_per_minute: Option<u32>,
    /// Time allowed for opening the socket.
    pub connect_timeout: Duration,
    /// Per-table resolution strategy overrides.
    pub table_policies: HashMap<String, ResolutionStrategy>,
}

impl SyncConfig {
    /// Creates a new sync configuration.
    pub fn new(websocket_url: impl Into<String>, device_id: impl Into<String>) -> Self {
        Self {
            websocket_url: websocket_url.into(),
            device_id: device_id.into(),
            sync_tables: None,
            compression: CompressionSettings::default(),
            reconnect: ReconnectConfig::default(),
            queue_capacity: None,
            queue_warn_threshold: 1000,
            max_delivery_attempts: 3,
            delivery_retry_delay: Duration::from_millis(250),
            conflict_history_limit: 1000,
            max_messages_per_minute: None,
            connect_timeout: Duration::from_secs(10),
            table_policies: HashMap::new(),
        }
    }

    /// Builds a configuration from the external configuration provider.
    pub fn from_provider(provider: &dyn ConfigProvider) -> SyncResult<Self> {
        let url = provider
            .websocket_url()
            .unwrap_or_else(|| DEFAULT_WEBSOCKET_URL.to_string());
        let device_id = provider
            .device_id()
            .ok_or_else(|| SyncError::Config("device_id is not configured".into()))?;

        let mut config = Self::new(url, device_id);
        config.sync_tables = provider.sync_tables().filter(|tables| !tables.is_empty());
        config.validate()?;
        Ok(config)
    }

    /// Restricts inbound replication to `tables`.
    pub fn with_sync_tables<I, S>(mut self, tables: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.sync_tables = Some(tables.into_iter().map(Into::into).collect());
        self
    }

    /// Sets the compression settings.
    pub fn with_compression(mut self, compression: CompressionSettings) -> Self {
        self.compression = compression;
        self
    }

    /// Sets the reconnection behaviour.
    pub fn with_reconnect(mut self, reconnect: ReconnectConfig) -> Self {
        self.reconnect = reconnect;
        self
    }

    /// Bounds the outbound queue.
    pub fn with_queue_capacity(mut self, capacity: usize) -> Self {
        self.queue_capacity = Some(capacity);
        self
    }

    /// Sets the number of transmission attempts per operation.
    pub fn with_max_delivery_attempts(mut self, attempts: u32) -> Self {
        self.max_delivery_attempts = attempts;
        self
    }

    /// Sets the pause between transmission attempts.
    pub fn with_delivery_retry_delay(mut self, delay: Duration) -> Self {
        self.delivery_retry_delay = delay;
        self
    }

    /// Sets how many resolved conflicts are kept.
    pub fn with_conflict_history_limit(mut self, limit: usize) -> Self {
        self.conflict_history_limit = limit;
        self
    }

    /// Caps outbound messages per minute.
    pub fn with_max_messages_per_minute(mut self, limit: u32) -> Self {
        self.max_messages_per_minute = Some(limit);
        self
    }

    /// Sets the connect timeout.
    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Overrides the resolution strategy for one table.
    pub fn with_table_policy(
        mut self,
        table: impl Into<String>,
        strategy: ResolutionStrategy,
    ) -> Self {
        self.table_policies.insert(table.into(), strategy);
        self
    }

    /// Checks the configuration for values the engine cannot work with.
    pub fn validate(&self) -> SyncResult<()> {
        if !(self.websocket_url.starts_with("ws://") || self.websocket_url.starts_with("wss://")) {
            return Err(SyncError::Config(format!(
                "websocket_url must use ws:// or wss://, got {:?}",
                self.websocket_url
            )));
        }
        if self.device_id.trim().is_empty() {
            return Err(SyncError::Config("device_id must not be empty".into()));
        }
        if self.max_delivery_attempts == 0 {
            return Err(SyncError::Config(
                "max_delivery_attempts must be at least 1".into(),
            ));
        }
        if self.reconnect.max_attempts == 0 {
            return Err(SyncError::Config(
                "reconnect.max_attempts must be at least 1".into(),
            ));
        }
        if self.queue_capacity == Some(0) {
            return Err(SyncError::Config("queue_capacity must be at least 1".into()));
        }
        Ok(())
    }
}

impl Default for SyncConfig {
    fn default() -> Self {
        Self::new(DEFAULT_WEBSOCKET_URL, "local-device")
    }
}

/// Configuration for reconnection after a dropped or failed connection.
///
/// Backoff is linear: attempt `n` waits `base_delay * n`, optionally capped
/// at `max_delay`. After `max_attempts` consecutive failures the connection
/// settles as disconnected until reconnection is requested explicitly.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectConfig {
    /// Delay unit for the linear backoff.
    pub base_delay: Duration,
    /// Consecutive failures tolerated before giving up.
    pub max_attempts: u32,
    /// Upper bound on a single delay.
    pub max_delay: Option<Duration>,
}

impl ReconnectConfig {
    /// Creates a new reconnect configuration.
    pub fn new(base_delay: Duration, max_attempts: u32) -> Self {
        Self {
            base_delay,
            max_attempts,
            max_delay: None,
        }
    }

    /// Caps individual delays.
    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = Some(max_delay);
        self
    }

    /// Calculates the delay before reconnect attempt `attempt` (1-indexed).
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.base_delay.saturating_mul(attempt);
        match self.max_delay {
            Some(cap) => delay.min(cap),
            None => delay,
        }
    }
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self::new(Duration::from_secs(5), 10)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::providers::MemoryConfigProvider;

    #[test]
    fn sync_config_builder() {
        let config = SyncConfig::new("wss://gym.example.com/ws/sync", "tablet-1")
            .with_sync_tables(["pagos", "clases"])
            .with_queue_capacity(500)
            .with_max_delivery_attempts(5)
            .with_table_policy("asistencias", ResolutionStrategy::Merge);

        assert_eq!(config.device_id, "tablet-1");
        assert_eq!(
            config.sync_tables,
            Some(vec!["pagos".to_string(), "clases".to_string()])
        );
        assert_eq!(config.queue_capacity, Some(500));
        assert_eq!(config.max_delivery_attempts, 5);
        assert_eq!(
            config.table_policies.get("asistencias"),
            Some(&ResolutionStrategy::Merge)
        );
        assert!(config.validate().is_ok());
    }

    #[test]
    fn defaults_match_documented_values() {
        let config = SyncConfig::default();
        assert_eq!(config.compression.threshold, 1024);
        assert_eq!(config.reconnect.base_delay, Duration::from_secs(5));
        assert_eq!(config.reconnect.max_attempts, 10);
        assert_eq!(config.max_delivery_attempts, 3);
        assert_eq!(config.conflict_history_limit, 1000);
        assert_eq!(config.queue_capacity, None);
    }

    #[test]
    fn validation_rejects_bad_values() {
        assert!(SyncConfig::new("http://gym.example.com", "d1").validate().is_err());
        assert!(SyncConfig::new("ws://gym.example.com", " ").validate().is_err());
        assert!(SyncConfig::default()
            .with_max_delivery_attempts(0)
            .validate()
            .is_err());
        assert!(SyncConfig::default()
            .with_queue_capacity(0)
            .validate()
            .is_err());
    }

    #[test]
    fn linear_backoff() {
        let config = ReconnectConfig::new(Duration::from_secs(5), 10);
        assert_eq!(config.delay_for_attempt(0), Duration::ZERO);
        assert_eq!(config.delay_for_attempt(1), Duration::from_secs(5));
        assert_eq!(config.delay_for_attempt(3), Duration::from_secs(15));

        let capped = config.with_max_delay(Duration::from_secs(20));
        assert_eq!(capped.delay_for_attempt(10), Duration::from_secs(20));
    }

    #[test]
    fn from_provider_reads_collaborator_values() {
        let provider = MemoryConfigProvider::new();
        assert!(SyncConfig::from_provider(&provider).is_err());

        provider.set_device_id("recepcion-2");
        provider.set_sync_tables(vec!["usuarios".into()]);
        let config = SyncConfig::from_provider(&provider).unwrap();
        assert_eq!(config.websocket_url, DEFAULT_WEBSOCKET_URL);
        assert_eq!(config.device_id, "recepcion-2");
        assert_eq!(config.sync_tables, Some(vec!["usuarios".to_string()]));

        provider.set_sync_tables(Vec::new());
        provider.set_websocket_url("wss://sync.gym.test/ws");
        let config = SyncConfig::from_provider(&provider).unwrap();
        assert_eq!(config.sync_tables, None);
        assert_eq!(config.websocket_url, "wss://sync.gym.test/ws");
    }
}
