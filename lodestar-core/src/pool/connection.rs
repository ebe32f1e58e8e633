//! Physical connections and the hooks that create them.

use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::debug;

use crate::error::{DriverError, DriverResult};
use crate::topology::ServerAddress;

/// Byte stream a connection runs over.
pub trait Stream: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> Stream for T {}

/// Boxed connection stream.
pub type BoxedStream = Box<dyn Stream>;

/// Opens byte streams to servers.
#[async_trait]
pub trait Connector: Send + Sync + fmt::Debug {
    /// Open a stream to `address` within `timeout`.
    async fn connect(&self, address: &ServerAddress, timeout: Duration) -> DriverResult<BoxedStream>;
}

/// Plain TCP.
#[derive(Debug, Default, Clone, Copy)]
pub struct TcpConnector;

#[async_trait]
impl Connector for TcpConnector {
    async fn connect(&self, address: &ServerAddress, timeout: Duration) -> DriverResult<BoxedStream> {
        let target = (address.host.as_str(), address.port);
        let stream = tokio::time::timeout(timeout, TcpStream::connect(target))
            .await
            .map_err(|_| DriverError::timeout("connect", timeout))?
            .map_err(|e| DriverError::connection(format!("connect to {}: {}", address, e)))?;
        stream.set_nodelay(true)?;
        Ok(Box::new(stream))
    }
}

/// Runs once on every new connection before it is first used.
#[async_trait]
pub trait AuthHook: Send + Sync + fmt::Debug {
    /// Authenticate `connection`. An error closes it.
    async fn authenticate(&self, connection: &mut Connection) -> DriverResult<()>;
}

/// Leaves connections unauthenticated.
#[derive(Debug, Default, Clone, Copy)]
pub struct NoAuth;

#[async_trait]
impl AuthHook for NoAuth {
    async fn authenticate(&self, _connection: &mut Connection) -> DriverResult<()> {
        Ok(())
    }
}

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// One physical connection to a server.
pub struct Connection {
    id: u64,
    address: ServerAddress,
    generation: u64,
    created_at: Instant,
    last_used: Instant,
    stream: BoxedStream,
}

impl Connection {
    /// Wrap an open stream.
    pub fn new(address: ServerAddress, generation: u64, stream: BoxedStream) -> Self {
        let now = Instant::now();
        let id = NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed);
        debug!(connection_id = id, %address, "connection opened");
        Self {
            id,
            address,
            generation,
            created_at: now,
            last_used: now,
            stream,
        }
    }

    /// Process-unique connection id.
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Server this connection talks to.
    pub fn address(&self) -> &ServerAddress {
        &self.address
    }

    /// Pool generation the connection was created in.
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Age of the connection.
    pub fn age(&self) -> Duration {
        self.created_at.elapsed()
    }

    /// Time since the connection was last returned.
    pub fn idle_time(&self) -> Duration {
        self.last_used.elapsed()
    }

    /// The underlying stream.
    pub fn stream_mut(&mut self) -> &mut BoxedStream {
        &mut self.stream
    }

    pub(crate) fn touch(&mut self) {
        self.last_used = Instant::now();
    }
}

impl fmt::Debug for Connection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("address", &self.address)
            .field("generation", &self.generation)
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::io::{AsyncReadExt, AsyncWriteExt, duplex};

    #[tokio::test]
    async fn test_connection_wraps_stream() {
        let (client, mut server) = duplex(64);
        let mut conn = Connection::new(ServerAddress::new("mem", 1), 3, Box::new(client));
        assert_eq!(conn.generation(), 3);
        assert_eq!(conn.address().to_string(), "mem:1");

        conn.stream_mut().write_all(b"hi").await.unwrap();
        let mut buf = [0u8; 2];
        server.read_exact(&mut buf).await.unwrap();
        assert_eq!(&buf, b"hi");
    }

    #[tokio::test]
    async fn test_ids_are_unique() {
        let (a, _) = duplex(8);
        let (b, _) = duplex(8);
        let first = Connection::new(ServerAddress::new("mem", 1), 0, Box::new(a));
        let second = Connection::new(ServerAddress::new("mem", 1), 0, Box::new(b));
        assert_ne!(first.id(), second.id());
    }

    #[tokio::test]
    async fn test_tcp_connect_refused() {
        let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        drop(listener);
        let result = TcpConnector
            .connect(&ServerAddress::new("127.0.0.1", port), Duration::from_secs(2))
            .await;
        assert!(result.err().unwrap().is_connection_error());
    }
}
