//! Client and pool configuration.

use std::time::Duration;

use crate::error::{DriverError, DriverResult};
use crate::read_preference::ReadPreference;
use crate::selection::DEFAULT_LOCAL_THRESHOLD;
use crate::topology::{DEFAULT_HEARTBEAT_FREQUENCY, ServerAddress};
use crate::wire::{DEFAULT_MAX_MESSAGE_SIZE, WireProtocol};

/// Per-server connection pool options.
#[derive(Debug, Clone, PartialEq)]
pub struct PoolOptions {
    /// Upper bound on connections per server, checked out or idle.
    pub max_pool_size: usize,
    /// Connections the maintenance task keeps open.
    pub min_pool_size: usize,
    /// Idle connections older than this are closed.
    pub max_idle_time: Option<Duration>,
    /// Connections open longer than this are closed instead of reused.
    pub max_lifetime: Option<Duration>,
    /// How long a checkout waits for a free slot.
    pub wait_queue_timeout: Duration,
    /// How often the maintenance task runs.
    pub maintenance_interval: Duration,
    /// TCP connect timeout.
    pub connect_timeout: Duration,
}

impl Default for PoolOptions {
    fn default() -> Self {
        Self {
            max_pool_size: 10,
            min_pool_size: 0,
            max_idle_time: Some(Duration::from_secs(300)),
            max_lifetime: None,
            wait_queue_timeout: Duration::from_secs(10),
            maintenance_interval: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
        }
    }
}

impl PoolOptions {
    /// Default options.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the maximum pool size.
    pub fn max_pool_size(mut self, size: usize) -> Self {
        self.max_pool_size = size;
        self
    }

    /// Set the minimum pool size.
    pub fn min_pool_size(mut self, size: usize) -> Self {
        self.min_pool_size = size;
        self
    }

    /// Set the idle time limit.
    pub fn max_idle_time(mut self, duration: Duration) -> Self {
        self.max_idle_time = Some(duration);
        self
    }

    /// Keep idle connections forever.
    pub fn no_idle_limit(mut self) -> Self {
        self.max_idle_time = None;
        self
    }

    /// Close connections once they have been open for `lifetime`.
    pub fn max_lifetime(mut self, lifetime: Duration) -> Self {
        self.max_lifetime = Some(lifetime);
        self
    }

    /// Set the checkout wait timeout.
    pub fn wait_queue_timeout(mut self, timeout: Duration) -> Self {
        self.wait_queue_timeout = timeout;
        self
    }

    /// Set the maintenance interval.
    pub fn maintenance_interval(mut self, interval: Duration) -> Self {
        self.maintenance_interval = interval;
        self
    }

    /// Set the connect timeout.
    pub fn connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout = timeout;
        self
    }

    /// Check the options are consistent.
    pub fn validate(&self) -> DriverResult<()> {
        if self.max_pool_size == 0 {
            return Err(DriverError::config("max_pool_size must be at least 1"));
        }
        if self.min_pool_size > self.max_pool_size {
            return Err(DriverError::config(format!(
                "min_pool_size ({}) exceeds max_pool_size ({})",
                self.min_pool_size, self.max_pool_size
            )));
        }
        if self.maintenance_interval.is_zero() {
            return Err(DriverError::config("maintenance_interval must be positive"));
        }
        Ok(())
    }
}

/// Client configuration.
#[derive(Debug, Clone)]
pub struct ClientConfig {
    /// Seed servers for a static topology.
    pub hosts: Vec<ServerAddress>,
    /// Application name, sent to servers when connecting.
    pub app_name: Option<String>,
    /// Pool options, shared by every server's pool.
    pub pool: PoolOptions,
    /// How long selection waits for an eligible server.
    pub server_selection_timeout: Duration,
    /// Width of the latency window.
    pub local_threshold: Duration,
    /// Heartbeat frequency assumed for staleness checks.
    pub heartbeat_frequency: Duration,
    /// Bound on one request/response exchange.
    pub socket_timeout: Option<Duration>,
    /// Default read preference.
    pub read_preference: ReadPreference,
    /// Frame format used for commands.
    pub wire_protocol: WireProtocol,
    /// Largest accepted reply frame.
    pub max_message_size: usize,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            hosts: Vec::new(),
            app_name: Some("lodestar".to_string()),
            pool: PoolOptions::default(),
            server_selection_timeout: Duration::from_secs(30),
            local_threshold: DEFAULT_LOCAL_THRESHOLD,
            heartbeat_frequency: DEFAULT_HEARTBEAT_FREQUENCY,
            socket_timeout: None,
            read_preference: ReadPreference::primary(),
            wire_protocol: WireProtocol::OpMsg,
            max_message_size: DEFAULT_MAX_MESSAGE_SIZE,
        }
    }
}

impl ClientConfig {
    /// Create a builder.
    pub fn builder() -> ClientConfigBuilder {
        ClientConfigBuilder::new()
    }
}

/// Builder for [`ClientConfig`].
#[derive(Debug, Default)]
pub struct ClientConfigBuilder {
    hosts: Vec<ServerAddress>,
    app_name: Option<String>,
    pool: Option<PoolOptions>,
    server_selection_timeout: Option<Duration>,
    local_threshold: Option<Duration>,
    heartbeat_frequency: Option<Duration>,
    socket_timeout: Option<Duration>,
    read_preference: Option<ReadPreference>,
    wire_protocol: Option<WireProtocol>,
    max_message_size: Option<usize>,
}

impl ClientConfigBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Add a seed host.
    pub fn host(mut self, address: ServerAddress) -> Self {
        self.hosts.push(address);
        self
    }

    /// Add seed hosts.
    pub fn hosts(mut self, addresses: impl IntoIterator<Item = ServerAddress>) -> Self {
        self.hosts.extend(addresses);
        self
    }

    /// Set the application name.
    pub fn app_name(mut self, name: impl Into<String>) -> Self {
        self.app_name = Some(name.into());
        self
    }

    /// Set pool options.
    pub fn pool(mut self, options: PoolOptions) -> Self {
        self.pool = Some(options);
        self
    }

    /// Set the server selection timeout.
    pub fn server_selection_timeout(mut self, timeout: Duration) -> Self {
        self.server_selection_timeout = Some(timeout);
        self
    }

    /// Set the latency window.
    pub fn local_threshold(mut self, threshold: Duration) -> Self {
        self.local_threshold = Some(threshold);
        self
    }

    /// Set the heartbeat frequency.
    pub fn heartbeat_frequency(mut self, frequency: Duration) -> Self {
        self.heartbeat_frequency = Some(frequency);
        self
    }

    /// Set the socket timeout.
    pub fn socket_timeout(mut self, timeout: Duration) -> Self {
        self.socket_timeout = Some(timeout);
        self
    }

    /// Set the default read preference.
    pub fn read_preference(mut self, pref: ReadPreference) -> Self {
        self.read_preference = Some(pref);
        self
    }

    /// Set the frame format.
    pub fn wire_protocol(mut self, protocol: WireProtocol) -> Self {
        self.wire_protocol = Some(protocol);
        self
    }

    /// Set the largest accepted reply frame.
    pub fn max_message_size(mut self, size: usize) -> Self {
        self.max_message_size = Some(size);
        self
    }

    /// Build the configuration.
    pub fn build(self) -> DriverResult<ClientConfig> {
        let defaults = ClientConfig::default();
        let pool = self.pool.unwrap_or(defaults.pool);
        pool.validate()?;

        let heartbeat_frequency = self
            .heartbeat_frequency
            .unwrap_or(defaults.heartbeat_frequency);
        let read_preference = self.read_preference.unwrap_or(defaults.read_preference);
        read_preference.validate(heartbeat_frequency)?;

        let max_message_size = self.max_message_size.unwrap_or(defaults.max_message_size);
        if max_message_size < crate::wire::HEADER_LEN {
            return Err(DriverError::config(format!(
                "max_message_size ({}) is smaller than a frame header",
                max_message_size
            )));
        }

        Ok(ClientConfig {
            hosts: self.hosts,
            app_name: self.app_name.or(defaults.app_name),
            pool,
            server_selection_timeout: self
                .server_selection_timeout
                .unwrap_or(defaults.server_selection_timeout),
            local_threshold: self.local_threshold.unwrap_or(defaults.local_threshold),
            heartbeat_frequency,
            socket_timeout: self.socket_timeout,
            read_preference,
            wire_protocol: self.wire_protocol.unwrap_or(defaults.wire_protocol),
            max_message_size,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_defaults() {
        let config = ClientConfig::builder().build().unwrap();
        assert_eq!(config.local_threshold, Duration::from_millis(15));
        assert_eq!(config.server_selection_timeout, Duration::from_secs(30));
        assert_eq!(config.app_name.as_deref(), Some("lodestar"));
        assert_eq!(config.wire_protocol, WireProtocol::OpMsg);
        assert!(config.read_preference.is_primary());
    }

    #[test]
    fn test_config_builder() {
        let config = ClientConfig::builder()
            .host(ServerAddress::new("db1", 27017))
            .app_name("inventory")
            .pool(PoolOptions::new().max_pool_size(20).min_pool_size(2))
            .local_threshold(Duration::from_millis(5))
            .read_preference(ReadPreference::nearest())
            .build()
            .unwrap();
        assert_eq!(config.hosts.len(), 1);
        assert_eq!(config.pool.max_pool_size, 20);
        assert_eq!(config.local_threshold, Duration::from_millis(5));
    }

    #[test]
    fn test_pool_validation() {
        assert!(PoolOptions::new().max_pool_size(0).validate().is_err());
        assert!(
            PoolOptions::new()
                .max_pool_size(2)
                .min_pool_size(3)
                .validate()
                .is_err()
        );
        let result = ClientConfig::builder()
            .pool(PoolOptions::new().max_pool_size(0))
            .build();
        assert!(matches!(result, Err(DriverError::Configuration(_))));
    }

    #[test]
    fn test_invalid_read_preference_rejected() {
        let result = ClientConfig::builder()
            .read_preference(ReadPreference::primary().with_max_staleness(Duration::from_secs(120)))
            .build();
        assert!(result.is_err());
    }
}
