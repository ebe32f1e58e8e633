//! Server selection.
//!
//! Selection runs as a pipeline of [`ServerSelector`]s over a topology
//! snapshot. Reads use a [`ReadPreferenceSelector`] followed by a
//! [`LatencyLimitingSelector`]; writes use a [`WritableServerSelector`]
//! followed by the same latency window. [`select_servers`] re-runs the
//! pipeline on every topology change until something is eligible or the
//! deadline passes.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use rand::seq::SliceRandom;
use tokio::time::Instant;
use tracing::debug;

use crate::error::{DriverError, DriverResult};
use crate::read_preference::{ReadMode, ReadPreference};
use crate::topology::{ServerDescription, TopologyProvider, TopologySnapshot};

/// Default width of the latency window.
pub const DEFAULT_LOCAL_THRESHOLD: Duration = Duration::from_millis(15);

/// Picks eligible servers out of a snapshot.
pub trait ServerSelector: fmt::Display + Send + Sync {
    /// Eligible servers, in the order callers should try them.
    fn select(&self, topology: &TopologySnapshot) -> Vec<ServerDescription>;
}

/// Filters by role, staleness and tags according to a read preference.
#[derive(Debug, Clone)]
pub struct ReadPreferenceSelector {
    read_preference: ReadPreference,
}

impl ReadPreferenceSelector {
    /// Create a selector for `read_preference`.
    pub fn new(read_preference: ReadPreference) -> Self {
        Self { read_preference }
    }

    fn primaries(topology: &TopologySnapshot) -> Vec<ServerDescription> {
        topology
            .servers
            .iter()
            .filter(|s| s.is_primary())
            .cloned()
            .collect()
    }

    /// Secondaries that pass the staleness bound and the tag sets.
    fn eligible_secondaries(&self, topology: &TopologySnapshot) -> Vec<ServerDescription> {
        let secondaries = topology
            .servers
            .iter()
            .filter(|s| s.is_secondary())
            .cloned()
            .collect();
        let fresh = self.filter_stale(topology, secondaries);
        self.filter_tags(fresh)
    }

    fn filter_stale(
        &self,
        topology: &TopologySnapshot,
        servers: Vec<ServerDescription>,
    ) -> Vec<ServerDescription> {
        let Some(max_staleness) = self.read_preference.max_staleness() else {
            return servers;
        };
        servers
            .into_iter()
            .filter(|s| {
                if !s.is_secondary() {
                    return true;
                }
                match staleness(topology, s) {
                    Some(estimate) => estimate <= max_staleness,
                    None => false,
                }
            })
            .collect()
    }

    fn filter_tags(&self, servers: Vec<ServerDescription>) -> Vec<ServerDescription> {
        let tag_sets = self.read_preference.tag_sets();
        if tag_sets.is_empty() {
            return servers;
        }
        for tag_set in tag_sets {
            let matched: Vec<_> = servers
                .iter()
                .filter(|s| tag_set.matches(&s.tags))
                .cloned()
                .collect();
            if !matched.is_empty() {
                return matched;
            }
        }
        Vec::new()
    }
}

/// Estimated replication lag of `server`, or `None` when the needed write
/// times are unknown.
fn staleness(topology: &TopologySnapshot, server: &ServerDescription) -> Option<Duration> {
    let heartbeat = chrono::Duration::from_std(topology.heartbeat_frequency).ok()?;
    let last_write = server.last_write_time?;
    let estimate = match topology.primary() {
        Some(primary) => {
            let primary_write = primary.last_write_time?;
            (server.last_update_time - last_write) - (primary.last_update_time - primary_write)
                + heartbeat
        }
        None => {
            let max_write = topology
                .servers
                .iter()
                .filter(|s| s.is_secondary())
                .filter_map(|s| s.last_write_time)
                .max()?;
            (max_write - last_write) + heartbeat
        }
    };
    Some(estimate.to_std().unwrap_or(Duration::ZERO))
}

impl ServerSelector for ReadPreferenceSelector {
    fn select(&self, topology: &TopologySnapshot) -> Vec<ServerDescription> {
        match self.read_preference.mode() {
            ReadMode::Primary => Self::primaries(topology),
            ReadMode::PrimaryPreferred => {
                let primaries = Self::primaries(topology);
                if primaries.is_empty() {
                    self.eligible_secondaries(topology)
                } else {
                    primaries
                }
            }
            ReadMode::Secondary => self.eligible_secondaries(topology),
            ReadMode::SecondaryPreferred => {
                let secondaries = self.eligible_secondaries(topology);
                if secondaries.is_empty() {
                    Self::primaries(topology)
                } else {
                    secondaries
                }
            }
            ReadMode::Nearest => {
                let members = topology
                    .servers
                    .iter()
                    .filter(|s| s.role.is_data_bearing())
                    .cloned()
                    .collect();
                let fresh = self.filter_stale(topology, members);
                self.filter_tags(fresh)
            }
        }
    }
}

impl fmt::Display for ReadPreferenceSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ReadPreferenceSelector({})", self.read_preference)
    }
}

/// Selects the primary, for writes.
#[derive(Debug, Clone, Copy, Default)]
pub struct WritableServerSelector;

impl ServerSelector for WritableServerSelector {
    fn select(&self, topology: &TopologySnapshot) -> Vec<ServerDescription> {
        ReadPreferenceSelector::primaries(topology)
    }
}

impl fmt::Display for WritableServerSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("WritableServerSelector")
    }
}

/// Keeps servers whose round trip time is within `local_threshold` of the
/// fastest, in uniformly random order.
#[derive(Debug, Clone, Copy)]
pub struct LatencyLimitingSelector {
    local_threshold: Duration,
}

impl LatencyLimitingSelector {
    /// Create a latency window of `local_threshold`.
    pub fn new(local_threshold: Duration) -> Self {
        Self { local_threshold }
    }
}

impl Default for LatencyLimitingSelector {
    fn default() -> Self {
        Self::new(DEFAULT_LOCAL_THRESHOLD)
    }
}

impl ServerSelector for LatencyLimitingSelector {
    fn select(&self, topology: &TopologySnapshot) -> Vec<ServerDescription> {
        let Some(fastest) = topology.servers.iter().map(|s| s.round_trip_time).min() else {
            return Vec::new();
        };
        let ceiling = fastest.saturating_add(self.local_threshold);
        let mut within: Vec<_> = topology
            .servers
            .iter()
            .filter(|s| s.round_trip_time <= ceiling)
            .cloned()
            .collect();
        within.shuffle(&mut rand::thread_rng());
        within
    }
}

impl fmt::Display for LatencyLimitingSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "LatencyLimitingSelector({}ms)",
            self.local_threshold.as_millis()
        )
    }
}

/// Runs selectors in sequence, each over the previous one's survivors.
#[derive(Clone)]
pub struct CompositeSelector {
    selectors: Vec<Arc<dyn ServerSelector>>,
}

impl CompositeSelector {
    /// Chain `selectors`.
    pub fn new(selectors: Vec<Arc<dyn ServerSelector>>) -> Self {
        Self { selectors }
    }

    /// Read preference filtering, then the latency window.
    pub fn for_read(read_preference: ReadPreference, local_threshold: Duration) -> Self {
        Self::new(vec![
            Arc::new(ReadPreferenceSelector::new(read_preference)),
            Arc::new(LatencyLimitingSelector::new(local_threshold)),
        ])
    }

    /// The primary, through the latency window.
    pub fn for_write(local_threshold: Duration) -> Self {
        Self::new(vec![
            Arc::new(WritableServerSelector),
            Arc::new(LatencyLimitingSelector::new(local_threshold)),
        ])
    }
}

impl ServerSelector for CompositeSelector {
    fn select(&self, topology: &TopologySnapshot) -> Vec<ServerDescription> {
        let mut current = TopologySnapshot {
            version: topology.version,
            servers: topology.servers.clone(),
            heartbeat_frequency: topology.heartbeat_frequency,
        };
        for (i, selector) in self.selectors.iter().enumerate() {
            // The first stage sees the whole snapshot so staleness can
            // consult the primary.
            let view = if i == 0 { topology } else { &current };
            let survivors = selector.select(view);
            if survivors.is_empty() {
                return survivors;
            }
            current.servers = survivors;
        }
        current.servers
    }
}

impl fmt::Display for CompositeSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let names: Vec<String> = self.selectors.iter().map(|s| s.to_string()).collect();
        write!(f, "CompositeSelector[{}]", names.join(", "))
    }
}

impl fmt::Debug for CompositeSelector {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

/// Select servers, waiting for topology changes until `timeout` elapses.
pub async fn select_servers(
    provider: &dyn TopologyProvider,
    selector: &dyn ServerSelector,
    timeout: Duration,
) -> DriverResult<Vec<ServerDescription>> {
    let started = Instant::now();
    let deadline = started + timeout;
    loop {
        let snapshot = provider.snapshot();
        let servers = selector.select(&snapshot);
        if !servers.is_empty() {
            debug!(
                selector = %selector,
                topology_version = snapshot.version,
                candidates = servers.len(),
                "selected servers"
            );
            return Ok(servers);
        }

        debug!(
            selector = %selector,
            topology_version = snapshot.version,
            "no eligible servers; waiting for topology change"
        );
        let changed =
            tokio::time::timeout_at(deadline, provider.wait_for_change(snapshot.version)).await;
        if changed.is_err() {
            return Err(DriverError::Selection {
                selector: selector.to_string(),
                topology: Box::new((*provider.snapshot()).clone()),
                elapsed: started.elapsed(),
            });
        }
    }
}
