//! # lodestar-core
//!
//! Request execution for a document database client: pick a server from a
//! topology snapshot under a read preference, check a connection out of
//! that server's pool, exchange one command frame pair and decode the reply.
//!
//! ```rust,no_run
//! use lodestar_core::prelude::*;
//!
//! # async fn run() -> DriverResult<()> {
//! let config = ClientConfig::builder()
//!     .host("localhost:27017".parse()?)
//!     .build()?;
//! let client = Client::new(config)?;
//!
//! client.ping().await?;
//! let reply = client
//!     .run_command_with("app", doc! { "count" => "users" }, ReadPreference::secondary_preferred())
//!     .await?;
//! println!("{}", reply.document());
//! # Ok(())
//! # }
//! ```

pub mod client;
pub mod config;
pub mod error;
pub mod event;
pub mod logging;
pub mod operation;
pub mod pool;
pub mod read_preference;
pub mod selection;
pub mod topology;
pub mod wire;

pub use client::{Client, ClientBuilder, Cluster};
pub use config::{ClientConfig, ClientConfigBuilder, PoolOptions};
pub use error::{DriverError, DriverResult};
pub use event::{CommandFailedEvent, CommandListener, CommandStartedEvent, CommandSucceededEvent};
pub use operation::{CommandOperation, CommandResult};
pub use pool::{
    AuthHook, Channel, Connection, ConnectionPool, ConnectionPools, Connector, NoAuth, PoolStatus,
    TcpConnector,
};
pub use read_preference::{ReadMode, ReadPreference, TagSet};
pub use selection::{
    CompositeSelector, LatencyLimitingSelector, ReadPreferenceSelector, ServerSelector,
    WritableServerSelector, select_servers,
};
pub use topology::{
    ServerAddress, ServerDescription, ServerRole, StaticTopology, TopologyProvider,
    TopologySnapshot, TopologyWatch,
};
pub use wire::WireProtocol;

/// Prelude for convenient imports.
pub mod prelude {
    pub use crate::client::{Client, ClientBuilder};
    pub use crate::config::{ClientConfig, PoolOptions};
    pub use crate::error::{DriverError, DriverResult};
    pub use crate::operation::{CommandOperation, CommandResult};
    pub use crate::read_preference::{ReadMode, ReadPreference, TagSet};
    pub use crate::topology::{ServerAddress, TopologySnapshot, TopologyWatch};
    pub use lodestar_bson::{Bson, Document, doc};
}
