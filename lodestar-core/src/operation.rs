//! Command execution: select a server, check out a channel, exchange one
//! frame pair, release the channel.

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use lodestar_bson::{Document, SharedSerializer};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{Instrument, debug, info_span};

use crate::client::Cluster;
use crate::error::{DriverError, DriverResult};
use crate::event::{CommandFailedEvent, CommandStartedEvent, CommandSucceededEvent};
use crate::read_preference::ReadPreference;
use crate::selection::{CompositeSelector, select_servers};
use crate::wire::{CommandRequest, next_request_id};

/// Reply of a command, kept as a document.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct CommandResult(Document);

impl CommandResult {
    /// Wrap a reply document.
    pub fn new(reply: Document) -> Self {
        Self(reply)
    }

    /// Whether `ok` is 1.
    pub fn ok(&self) -> bool {
        self.0.get_number("ok").is_some_and(|ok| ok == 1.0)
    }

    /// Server error code, if any.
    pub fn code(&self) -> Option<i32> {
        self.0.get_number("code").map(|c| c as i32)
    }

    /// Server error message, if any.
    pub fn error_message(&self) -> Option<&str> {
        self.0.get_str("errmsg").or_else(|| self.0.get_str("$err"))
    }

    /// The reply document.
    pub fn document(&self) -> &Document {
        &self.0
    }

    /// Unwrap the reply document.
    pub fn into_document(self) -> Document {
        self.0
    }
}

/// A command against one database, decoded into `R`.
pub struct CommandOperation<R> {
    database: Option<String>,
    command: Option<Document>,
    read_preference: Option<ReadPreference>,
    is_query: bool,
    serializer: Option<SharedSerializer<R>>,
    timeout: Option<Duration>,
}

impl<R> Default for CommandOperation<R> {
    fn default() -> Self {
        Self {
            database: None,
            command: None,
            read_preference: None,
            is_query: false,
            serializer: None,
            timeout: None,
        }
    }
}

impl<R> CommandOperation<R> {
    /// An operation with nothing set.
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `command` against `database`.
    pub fn command(database: impl Into<String>, command: Document) -> Self {
        Self::new().with_database(database).with_command(command)
    }

    /// Set the database.
    pub fn with_database(mut self, database: impl Into<String>) -> Self {
        self.database = Some(database.into());
        self
    }

    /// Set the command document.
    pub fn with_command(mut self, command: Document) -> Self {
        self.command = Some(command);
        self
    }

    /// Route by `read_preference` instead of the client default.
    pub fn with_read_preference(mut self, read_preference: ReadPreference) -> Self {
        self.read_preference = Some(read_preference);
        self
    }

    /// Mark the command as a read, allowing legacy frames to target
    /// secondaries.
    pub fn with_is_query(mut self, is_query: bool) -> Self {
        self.is_query = is_query;
        self
    }

    /// Decode the reply with `serializer` instead of the registry's.
    pub fn with_serializer(mut self, serializer: SharedSerializer<R>) -> Self {
        self.serializer = Some(serializer);
        self
    }

    /// Bound selection, checkout and the exchange together.
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    fn validate(&self) -> DriverResult<(&str, &Document)> {
        let database = self
            .database
            .as_deref()
            .ok_or_else(|| DriverError::config("command operation has no database"))?;
        if database.is_empty() {
            return Err(DriverError::config("database name is empty"));
        }
        let command = self
            .command
            .as_ref()
            .ok_or_else(|| DriverError::config("command operation has no command"))?;
        if command.is_empty() {
            return Err(DriverError::config("command document is empty"));
        }
        Ok((database, command))
    }
}

impl<R> CommandOperation<R>
where
    R: Serialize + DeserializeOwned + Send + 'static,
{
    /// Execute against `cluster`.
    pub async fn execute(&self, cluster: &Cluster) -> DriverResult<R> {
        let (database, command) = self.validate()?;
        let config = cluster.config();
        let read_preference = self
            .read_preference
            .as_ref()
            .unwrap_or(&config.read_preference);
        read_preference.validate(config.heartbeat_frequency)?;
        let serializer = match &self.serializer {
            Some(serializer) => Arc::clone(serializer),
            None => cluster.registry().lookup_or_derive::<R>(),
        };

        let request = CommandRequest {
            database,
            command,
            read_preference,
            is_query: self.is_query,
        };
        let span = info_span!(
            "command",
            name = request.command_name(),
            database,
            read_preference = %read_preference,
        );
        let deadline = self.timeout.map(|budget| Deadline {
            at: Instant::now() + budget,
            budget,
        });
        run(cluster, &request, serializer, deadline)
            .instrument(span)
            .await
    }
}

/// Operation budget shared by selection, checkout and the exchange.
#[derive(Debug, Clone, Copy)]
struct Deadline {
    at: Instant,
    budget: Duration,
}

async fn within<T>(
    deadline: Option<Deadline>,
    step: impl Future<Output = DriverResult<T>>,
) -> DriverResult<T> {
    match deadline {
        Some(deadline) => tokio::time::timeout_at(deadline.at, step)
            .await
            .unwrap_or_else(|_| Err(DriverError::timeout("operation", deadline.budget))),
        None => step.await,
    }
}

async fn run<R>(
    cluster: &Cluster,
    request: &CommandRequest<'_>,
    serializer: SharedSerializer<R>,
    deadline: Option<Deadline>,
) -> DriverResult<R> {
    let config = cluster.config();
    let selector = CompositeSelector::for_read(request.read_preference.clone(), config.local_threshold);
    let servers = within(
        deadline,
        select_servers(
            cluster.topology().as_ref(),
            &selector,
            config.server_selection_timeout,
        ),
    )
    .await?;
    let server = servers
        .into_iter()
        .next()
        .ok_or_else(|| DriverError::protocol("selection returned no server"))?;

    let pool = cluster.pools().get_or_create(&server.address);
    let mut channel = within(deadline, pool.acquire(config.pool.wait_queue_timeout)).await?;
    let request_id = next_request_id();
    let command_name = request.command_name();
    let listener = cluster.listener();

    if let Some(listener) = listener {
        listener.started(&CommandStartedEvent {
            command_name,
            database: request.database,
            command: request.command,
            request_id,
            address: &server.address,
            connection_id: channel.connection_id(),
        });
    }
    debug!(request_id, address = %server.address, "sending command");

    let started = Instant::now();
    let exchange = async {
        let connection = channel.connection_mut()?;
        config
            .wire_protocol
            .exchange(
                connection.stream_mut(),
                request_id,
                request,
                config.max_message_size,
            )
            .await
    };
    let exchange = async {
        match config.socket_timeout {
            Some(timeout) => tokio::time::timeout(timeout, exchange)
                .await
                .unwrap_or_else(|_| Err(DriverError::timeout("socket", timeout))),
            None => exchange.await,
        }
    };
    let frame = within(deadline, exchange).await;
    let result = frame.and_then(|frame| frame.into_result(serializer.as_ref()));
    let duration = started.elapsed();

    match result {
        Ok((reply, value)) => {
            channel.release(true);
            debug!(request_id, elapsed_ms = duration.as_millis() as u64, "command succeeded");
            if let Some(listener) = listener {
                listener.succeeded(&CommandSucceededEvent {
                    command_name,
                    request_id,
                    address: &server.address,
                    duration,
                    reply: &reply,
                });
            }
            Ok(value)
        }
        Err(error) => {
            channel.release(!error.discards_channel());
            debug!(request_id, error = %error, "command failed");
            if let Some(listener) = listener {
                listener.failed(&CommandFailedEvent {
                    command_name,
                    request_id,
                    address: &server.address,
                    duration,
                    error: &error,
                });
            }
            Err(error)
        }
    }
}

impl<R> fmt::Debug for CommandOperation<R> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CommandOperation")
            .field("database", &self.database)
            .field("command", &self.command)
            .field("read_preference", &self.read_preference)
            .field("is_query", &self.is_query)
            .field("timeout", &self.timeout)
            .finish_non_exhaustive()
    }
}
