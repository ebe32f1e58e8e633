//! Client façade over the command execution core.

use std::fmt;
use std::sync::Arc;

use lodestar_bson::{Document, SerializerRegistry, doc};
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::info;

use crate::config::ClientConfig;
use crate::error::{DriverError, DriverResult};
use crate::event::CommandListener;
use crate::operation::{CommandOperation, CommandResult};
use crate::pool::{AuthHook, ConnectionPools, Connector, NoAuth, PoolStatus, TcpConnector};
use crate::read_preference::ReadPreference;
use crate::topology::{
    ServerAddress, ServerDescription, ServerRole, StaticTopology, TopologyProvider, TopologySnapshot,
};

/// Everything an operation needs to run: topology, pools, serializers,
/// settings and the optional listener.
pub struct Cluster {
    config: ClientConfig,
    topology: Arc<dyn TopologyProvider>,
    pools: ConnectionPools,
    registry: Arc<SerializerRegistry>,
    listener: Option<Arc<dyn CommandListener>>,
}

impl Cluster {
    /// Client settings.
    pub fn config(&self) -> &ClientConfig {
        &self.config
    }

    /// Topology provider.
    pub fn topology(&self) -> &Arc<dyn TopologyProvider> {
        &self.topology
    }

    /// Per-server pools.
    pub fn pools(&self) -> &ConnectionPools {
        &self.pools
    }

    /// Serializer registry.
    pub fn registry(&self) -> &SerializerRegistry {
        &self.registry
    }

    /// Command listener, if one was installed.
    pub fn listener(&self) -> Option<&dyn CommandListener> {
        self.listener.as_deref()
    }
}

impl fmt::Debug for Cluster {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Cluster")
            .field("config", &self.config)
            .field("topology", &self.topology)
            .field("pools", &self.pools)
            .field("listener", &self.listener)
            .finish()
    }
}

/// Handle for running commands. Cheap to clone.
#[derive(Clone, Debug)]
pub struct Client {
    cluster: Arc<Cluster>,
}

impl Client {
    /// Connect with `config` and default collaborators.
    pub fn new(config: ClientConfig) -> DriverResult<Self> {
        Self::builder().config(config).build()
    }

    /// Create a builder.
    pub fn builder() -> ClientBuilder {
        ClientBuilder::new()
    }

    /// The shared cluster state.
    pub fn cluster(&self) -> &Cluster {
        &self.cluster
    }

    /// Client settings.
    pub fn config(&self) -> &ClientConfig {
        &self.cluster.config
    }

    /// Serializer registry.
    pub fn registry(&self) -> &SerializerRegistry {
        &self.cluster.registry
    }

    /// Execute a prepared operation.
    pub async fn execute<R>(&self, operation: &CommandOperation<R>) -> DriverResult<R>
    where
        R: Serialize + DeserializeOwned + Send + 'static,
    {
        operation.execute(&self.cluster).await
    }

    /// Run `command` against `database` with the default read preference.
    pub async fn run_command(&self, database: &str, command: Document) -> DriverResult<CommandResult> {
        self.execute(&CommandOperation::command(database, command))
            .await
    }

    /// Run `command` against `database`, routed by `read_preference`.
    pub async fn run_command_with(
        &self,
        database: &str,
        command: Document,
        read_preference: ReadPreference,
    ) -> DriverResult<CommandResult> {
        let operation = CommandOperation::command(database, command)
            .with_read_preference(read_preference)
            .with_is_query(true);
        self.execute(&operation).await
    }

    /// Round-trip a `ping` to the primary.
    pub async fn ping(&self) -> DriverResult<()> {
        let operation: CommandOperation<CommandResult> =
            CommandOperation::command("admin", doc! { "ping" => 1 })
                .with_read_preference(ReadPreference::primary());
        self.execute(&operation).await.map(|_| ())
    }

    /// Pool status for `address`, if a pool exists.
    pub fn pool_status(&self, address: &ServerAddress) -> Option<PoolStatus> {
        self.cluster.pools.get(address).map(|pool| pool.status())
    }

    /// Close idle connections everywhere and retire checked-out ones.
    pub fn clear_pools(&self) {
        self.cluster.pools.clear_all();
    }
}

/// Builder for [`Client`].
#[derive(Default)]
pub struct ClientBuilder {
    config: Option<ClientConfig>,
    topology: Option<Arc<dyn TopologyProvider>>,
    connector: Option<Arc<dyn Connector>>,
    auth: Option<Arc<dyn AuthHook>>,
    registry: Option<Arc<SerializerRegistry>>,
    listener: Option<Arc<dyn CommandListener>>,
}

impl ClientBuilder {
    /// Create a new builder.
    pub fn new() -> Self {
        Self::default()
    }

    /// Set the configuration.
    pub fn config(mut self, config: ClientConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Take topology snapshots from `provider`.
    pub fn topology(mut self, provider: Arc<dyn TopologyProvider>) -> Self {
        self.topology = Some(provider);
        self
    }

    /// Open connections through `connector`.
    pub fn connector(mut self, connector: Arc<dyn Connector>) -> Self {
        self.connector = Some(connector);
        self
    }

    /// Run `hook` on every new connection.
    pub fn auth_hook(mut self, hook: Arc<dyn AuthHook>) -> Self {
        self.auth = Some(hook);
        self
    }

    /// Share an existing serializer registry.
    pub fn registry(mut self, registry: Arc<SerializerRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    /// Observe commands with `listener`.
    pub fn listener(mut self, listener: Arc<dyn CommandListener>) -> Self {
        self.listener = Some(listener);
        self
    }

    /// Build the client.
    ///
    /// Without a topology provider the configuration must name exactly one
    /// host, which is then treated as a directly connected primary.
    pub fn build(self) -> DriverResult<Client> {
        let config = match self.config {
            Some(config) => config,
            None => ClientConfig::builder().build()?,
        };
        let topology = match self.topology {
            Some(provider) => provider,
            None => direct_topology(&config)?,
        };

        let pools = ConnectionPools::new(
            config.pool.clone(),
            self.connector.unwrap_or_else(|| Arc::new(TcpConnector)),
            self.auth.unwrap_or_else(|| Arc::new(NoAuth)),
        );

        info!(
            app_name = config.app_name.as_deref().unwrap_or_default(),
            hosts = config.hosts.len(),
            protocol = %config.wire_protocol,
            "client created"
        );

        Ok(Client {
            cluster: Arc::new(Cluster {
                config,
                topology,
                pools,
                registry: self.registry.unwrap_or_else(|| Arc::new(SerializerRegistry::new())),
                listener: self.listener,
            }),
        })
    }
}

fn direct_topology(config: &ClientConfig) -> DriverResult<Arc<dyn TopologyProvider>> {
    match config.hosts.as_slice() {
        [host] => {
            let snapshot = TopologySnapshot::new(vec![ServerDescription::new(
                host.clone(),
                ServerRole::Primary,
            )])
            .with_heartbeat_frequency(config.heartbeat_frequency);
            Ok(Arc::new(StaticTopology::new(snapshot)))
        }
        [] => Err(DriverError::config(
            "no hosts configured and no topology provider given",
        )),
        _ => Err(DriverError::config(
            "several hosts need a topology provider",
        )),
    }
}

impl fmt::Debug for ClientBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ClientBuilder")
            .field("config", &self.config)
            .field("topology", &self.topology)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn test_build_needs_hosts_or_topology() {
        let err = Client::builder().build().unwrap_err();
        assert!(matches!(err, DriverError::Configuration(_)));

        let config = ClientConfig::builder()
            .host(ServerAddress::new("a", 1))
            .host(ServerAddress::new("b", 1))
            .build()
            .unwrap();
        assert!(Client::new(config).is_err());
    }

    #[test]
    fn test_single_host_is_direct_primary() {
        let config = ClientConfig::builder()
            .host(ServerAddress::new("db", 27017))
            .heartbeat_frequency(Duration::from_secs(5))
            .build()
            .unwrap();
        let client = Client::new(config).unwrap();
        let snapshot = client.cluster().topology().snapshot();
        assert_eq!(snapshot.heartbeat_frequency, Duration::from_secs(5));
        assert_eq!(
            snapshot.primary().map(|s| s.address.to_string()),
            Some("db:27017".to_string())
        );
        assert!(client.cluster().listener().is_none());
        assert!(client.pool_status(&ServerAddress::new("db", 27017)).is_none());
    }

    #[tokio::test]
    async fn test_unreachable_selection_times_out() {
        let config = ClientConfig::builder()
            .server_selection_timeout(Duration::from_millis(20))
            .build()
            .unwrap();
        let client = Client::builder()
            .config(config)
            .topology(Arc::new(StaticTopology::new(TopologySnapshot::new(vec![]))))
            .build()
            .unwrap();
        let err = client.ping().await.unwrap_err();
        assert!(matches!(err, DriverError::Selection { .. }));
        assert!(err.is_retryable_by_caller());
    }
}
