//! Cluster topology snapshots and the provider seam.
//!
//! Monitoring lives outside this crate: something else learns about servers
//! and publishes [`TopologySnapshot`]s. Selection only reads snapshots and
//! waits for the next one when nothing is eligible.

use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::watch;

use crate::error::DriverError;
use crate::read_preference::TagSet;

/// Default port servers listen on.
pub const DEFAULT_PORT: u16 = 27017;

/// Default heartbeat frequency assumed for snapshots.
pub const DEFAULT_HEARTBEAT_FREQUENCY: Duration = Duration::from_secs(10);

/// Host and port of a server.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ServerAddress {
    /// Host name or IP.
    pub host: String,
    /// TCP port.
    pub port: u16,
}

impl ServerAddress {
    /// Create an address.
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for ServerAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

impl FromStr for ServerAddress {
    type Err = DriverError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.rsplit_once(':') {
            Some((host, port)) if !host.is_empty() => {
                let port = port
                    .parse()
                    .map_err(|_| DriverError::config(format!("invalid port in address '{}'", s)))?;
                Ok(Self::new(host, port))
            }
            None if !s.is_empty() => Ok(Self::new(s, DEFAULT_PORT)),
            _ => Err(DriverError::config(format!("invalid server address '{}'", s))),
        }
    }
}

/// Role a server currently plays.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum ServerRole {
    /// Accepts writes.
    Primary,
    /// Replicates from the primary; serves reads.
    Secondary,
    /// Votes in elections only; holds no data.
    Arbiter,
    /// Not yet contacted or unreachable.
    #[default]
    Unknown,
}

impl ServerRole {
    /// Whether the server holds data and can serve commands.
    pub fn is_data_bearing(&self) -> bool {
        matches!(self, Self::Primary | Self::Secondary)
    }
}

/// What the monitor last learned about one server.
#[derive(Debug, Clone, PartialEq)]
pub struct ServerDescription {
    /// Server address.
    pub address: ServerAddress,
    /// Current role.
    pub role: ServerRole,
    /// Smoothed round trip time.
    pub round_trip_time: Duration,
    /// Server tags.
    pub tags: TagSet,
    /// When this description was produced.
    pub last_update_time: DateTime<Utc>,
    /// Time of the server's most recent write, when known.
    pub last_write_time: Option<DateTime<Utc>>,
}

impl ServerDescription {
    /// Describe a server with zero RTT and no tags, updated now.
    pub fn new(address: ServerAddress, role: ServerRole) -> Self {
        let now = Utc::now();
        Self {
            address,
            role,
            round_trip_time: Duration::ZERO,
            tags: TagSet::new(),
            last_update_time: now,
            last_write_time: Some(now),
        }
    }

    /// Set the round trip time.
    pub fn with_round_trip_time(mut self, rtt: Duration) -> Self {
        self.round_trip_time = rtt;
        self
    }

    /// Set the tags.
    pub fn with_tags(mut self, tags: TagSet) -> Self {
        self.tags = tags;
        self
    }

    /// Set the update and last write times.
    pub fn with_times(
        mut self,
        last_update_time: DateTime<Utc>,
        last_write_time: Option<DateTime<Utc>>,
    ) -> Self {
        self.last_update_time = last_update_time;
        self.last_write_time = last_write_time;
        self
    }

    /// Whether this is the primary.
    pub fn is_primary(&self) -> bool {
        self.role == ServerRole::Primary
    }

    /// Whether this is a secondary.
    pub fn is_secondary(&self) -> bool {
        self.role == ServerRole::Secondary
    }
}

/// Immutable view of the cluster at one point in time.
#[derive(Debug, Clone, PartialEq)]
pub struct TopologySnapshot {
    /// Increases with every published snapshot.
    pub version: u64,
    /// Known servers.
    pub servers: Vec<ServerDescription>,
    /// How often the monitor refreshes server descriptions.
    pub heartbeat_frequency: Duration,
}

impl TopologySnapshot {
    /// Create a version-0 snapshot.
    pub fn new(servers: Vec<ServerDescription>) -> Self {
        Self {
            version: 0,
            servers,
            heartbeat_frequency: DEFAULT_HEARTBEAT_FREQUENCY,
        }
    }

    /// Set the heartbeat frequency.
    pub fn with_heartbeat_frequency(mut self, heartbeat_frequency: Duration) -> Self {
        self.heartbeat_frequency = heartbeat_frequency;
        self
    }

    /// The primary, if one is known.
    pub fn primary(&self) -> Option<&ServerDescription> {
        self.servers.iter().find(|s| s.is_primary())
    }

    /// One-line summary for diagnostics.
    pub fn summary(&self) -> String {
        let servers: Vec<String> = self
            .servers
            .iter()
            .map(|s| format!("{}({:?})", s.address, s.role))
            .collect();
        format!("v{} [{}]", self.version, servers.join(", "))
    }
}

/// Source of topology snapshots.
#[async_trait]
pub trait TopologyProvider: Send + Sync + fmt::Debug {
    /// The latest snapshot.
    fn snapshot(&self) -> Arc<TopologySnapshot>;

    /// Resolve once a snapshot newer than `seen_version` is available.
    /// Providers that never change never resolve.
    async fn wait_for_change(&self, seen_version: u64);
}

/// A topology that never changes.
#[derive(Debug, Clone)]
pub struct StaticTopology {
    snapshot: Arc<TopologySnapshot>,
}

impl StaticTopology {
    /// Wrap a fixed snapshot.
    pub fn new(snapshot: TopologySnapshot) -> Self {
        Self {
            snapshot: Arc::new(snapshot),
        }
    }
}

#[async_trait]
impl TopologyProvider for StaticTopology {
    fn snapshot(&self) -> Arc<TopologySnapshot> {
        Arc::clone(&self.snapshot)
    }

    async fn wait_for_change(&self, _seen_version: u64) {
        std::future::pending::<()>().await
    }
}

/// A topology fed by an external monitor through [`TopologyWatch::publish`].
#[derive(Debug)]
pub struct TopologyWatch {
    sender: watch::Sender<Arc<TopologySnapshot>>,
}

impl TopologyWatch {
    /// Start from `initial`.
    pub fn new(initial: TopologySnapshot) -> Self {
        let (sender, _) = watch::channel(Arc::new(initial));
        Self { sender }
    }

    /// Publish a new snapshot. Its version is set to one past the current one.
    pub fn publish(&self, mut snapshot: TopologySnapshot) -> u64 {
        let mut version = 0;
        self.sender.send_modify(|current| {
            version = current.version + 1;
            snapshot.version = version;
            *current = Arc::new(snapshot);
        });
        version
    }
}

#[async_trait]
impl TopologyProvider for TopologyWatch {
    fn snapshot(&self) -> Arc<TopologySnapshot> {
        Arc::clone(&self.sender.borrow())
    }

    async fn wait_for_change(&self, seen_version: u64) {
        let mut receiver = self.sender.subscribe();
        loop {
            if receiver.borrow_and_update().version > seen_version {
                return;
            }
            if receiver.changed().await.is_err() {
                std::future::pending::<()>().await
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn server(port: u16, role: ServerRole) -> ServerDescription {
        ServerDescription::new(ServerAddress::new("localhost", port), role)
    }

    #[test]
    fn test_address_parsing() {
        let addr: ServerAddress = "db1.example.com:27018".parse().unwrap();
        assert_eq!(addr, ServerAddress::new("db1.example.com", 27018));

        let addr: ServerAddress = "db2".parse().unwrap();
        assert_eq!(addr.port, DEFAULT_PORT);
        assert_eq!(addr.to_string(), "db2:27017");

        assert!("db:notaport".parse::<ServerAddress>().is_err());
        assert!("".parse::<ServerAddress>().is_err());
    }

    #[test]
    fn test_snapshot_lookup() {
        let snapshot = TopologySnapshot::new(vec![
            server(1, ServerRole::Secondary),
            server(2, ServerRole::Primary),
            server(3, ServerRole::Arbiter),
        ]);
        assert_eq!(snapshot.primary().map(|s| s.address.port), Some(2));
        assert!(!snapshot.servers[2].role.is_data_bearing());
        assert!(snapshot.summary().contains("localhost:2(Primary)"));
    }

    #[tokio::test]
    async fn test_watch_wakes_waiters() {
        let watch = Arc::new(TopologyWatch::new(TopologySnapshot::new(vec![])));
        assert_eq!(watch.snapshot().version, 0);

        let waiter = {
            let watch = Arc::clone(&watch);
            tokio::spawn(async move { watch.wait_for_change(0).await })
        };
        tokio::task::yield_now().await;
        let version = watch.publish(TopologySnapshot::new(vec![server(1, ServerRole::Primary)]));
        assert_eq!(version, 1);
        tokio::time::timeout(Duration::from_secs(1), waiter)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(watch.snapshot().servers.len(), 1);
    }

    #[test]
    fn test_static_topology_never_changes() {
        let topology = StaticTopology::new(TopologySnapshot::new(vec![]));
        let mut wait = tokio_test::task::spawn(topology.wait_for_change(0));
        tokio_test::assert_pending!(wait.poll());
        tokio_test::assert_pending!(wait.poll());
    }

    #[test]
    fn test_watch_resolves_for_already_newer_snapshot() {
        let watch = TopologyWatch::new(TopologySnapshot::new(vec![]));
        watch.publish(TopologySnapshot::new(vec![]));
        let mut wait = tokio_test::task::spawn(watch.wait_for_change(0));
        tokio_test::assert_ready!(wait.poll());
    }
}
