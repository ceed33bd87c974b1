//! Pooled connections and the resource manager that opens them.

use std::fmt;
use std::io;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::ClientConfig;
use crate::error::{Result, TransportError};
use crate::node::{Node, choose_node};
use crate::pool::ResourceManager;
use crate::protocol::Protocol;

/// Unique identifier for a pooled connection, used in logs.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(uuid::Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(uuid::Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> &uuid::Uuid {
        &self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Opens and closes the raw streams behind connections.
pub trait Connector: Send + Sync + 'static {
    type Stream: Send + 'static;

    fn open(&self, node: &Node, protocol: Protocol) -> Result<Self::Stream>;

    /// Must tolerate streams that are already broken.
    fn close(&self, stream: Self::Stream);
}

/// A live connection to one node, speaking one protocol.
pub struct Connection<S> {
    id: ConnectionId,
    node: Arc<Node>,
    protocol: Protocol,
    stream: S,
    opened_at: Instant,
}

impl<S> Connection<S> {
    pub fn new(node: Arc<Node>, protocol: Protocol, stream: S) -> Self {
        Self {
            id: ConnectionId::new(),
            node,
            protocol,
            stream,
            opened_at: Instant::now(),
        }
    }

    pub fn id(&self) -> ConnectionId {
        self.id
    }

    /// The node this connection was opened against.
    pub fn node(&self) -> &Arc<Node> {
        &self.node
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn stream(&self) -> &S {
        &self.stream
    }

    pub fn stream_mut(&mut self) -> &mut S {
        &mut self.stream
    }

    pub fn age(&self) -> Duration {
        self.opened_at.elapsed()
    }

    pub fn into_stream(self) -> S {
        self.stream
    }
}

impl<S> fmt::Debug for Connection<S> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Connection")
            .field("id", &self.id)
            .field("node", &self.node.to_string())
            .field("protocol", &self.protocol)
            .finish()
    }
}

/// Plain TCP connector.
#[derive(Debug, Clone)]
pub struct TcpConnector {
    connect_timeout: Duration,
    io_timeout: Option<Duration>,
}

impl TcpConnector {
    /// Rejects a zero `connect_timeout`, which the OS refuses on every connect.
    pub fn new(connect_timeout: Duration) -> Result<Self> {
        if connect_timeout.is_zero() {
            return Err(TransportError::Config(
                "connect timeout must be positive".to_string(),
            ));
        }
        Ok(Self {
            connect_timeout,
            io_timeout: None,
        })
    }

    pub fn from_config(config: &ClientConfig) -> Result<Self> {
        let connector = Self::new(config.connect_timeout())?;
        Ok(match config.io_timeout() {
            Some(timeout) => connector.with_io_timeout(timeout),
            None => connector,
        })
    }

    /// Read/write timeout for opened sockets. Zero means no timeout.
    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout = (!timeout.is_zero()).then_some(timeout);
        self
    }
}

impl Default for TcpConnector {
    fn default() -> Self {
        Self {
            connect_timeout: ClientConfig::default().connect_timeout(),
            io_timeout: None,
        }
    }
}

impl Connector for TcpConnector {
    type Stream = TcpStream;

    fn open(&self, node: &Node, protocol: Protocol) -> Result<TcpStream> {
        let mut last_error = None;
        for addr in (node.host(), node.port(protocol)).to_socket_addrs()? {
            match TcpStream::connect_timeout(&addr, self.connect_timeout) {
                Ok(stream) => {
                    stream.set_nodelay(true)?;
                    stream.set_read_timeout(self.io_timeout)?;
                    stream.set_write_timeout(self.io_timeout)?;
                    return Ok(stream);
                }
                Err(e) => last_error = Some(e),
            }
        }
        Err(last_error
            .unwrap_or_else(|| {
                io::Error::new(
                    io::ErrorKind::AddrNotAvailable,
                    format!("{} resolved to no addresses", node.host()),
                )
            })
            .into())
    }

    fn close(&self, stream: TcpStream) {
        if let Err(e) = stream.shutdown(Shutdown::Both) {
            tracing::trace!(error = %e, "Ignoring shutdown error on closed stream");
        }
    }
}

/// Pool hooks for connections of one protocol.
///
/// New connections go to a node picked by [`choose_node`]. A node that
/// refuses a connection has its error rate bumped.
pub struct ConnectionManager<C: Connector> {
    protocol: Protocol,
    nodes: Arc<[Arc<Node>]>,
    connector: Arc<C>,
}

impl<C: Connector> ConnectionManager<C> {
    pub fn new(protocol: Protocol, nodes: Arc<[Arc<Node>]>, connector: Arc<C>) -> Self {
        Self {
            protocol,
            nodes,
            connector,
        }
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol
    }

    pub fn connector(&self) -> &C {
        &self.connector
    }
}

impl<C: Connector> ResourceManager for ConnectionManager<C> {
    type Resource = Connection<C::Stream>;
    type Error = TransportError;

    fn create_resource(&self) -> Result<Self::Resource> {
        let node = choose_node(&self.nodes).ok_or(TransportError::NoNodes)?;
        match self.connector.open(&node, self.protocol) {
            Ok(stream) => {
                let connection = Connection::new(node, self.protocol, stream);
                tracing::debug!(
                    connection = %connection.id(),
                    node = %connection.node(),
                    protocol = %self.protocol,
                    "Opened connection"
                );
                Ok(connection)
            }
            Err(e) => {
                node.error_rate().incr(1.0);
                tracing::warn!(
                    node = %node,
                    protocol = %self.protocol,
                    error = %e,
                    "Failed to open connection"
                );
                Err(e)
            }
        }
    }

    fn destroy_resource(&self, connection: Self::Resource) {
        tracing::debug!(
            connection = %connection.id(),
            node = %connection.node(),
            protocol = %self.protocol,
            age = ?connection.age(),
            "Closing connection"
        );
        self.connector.close(connection.into_stream());
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::{Read, Write};
    use std::net::TcpListener;
    use std::sync::atomic::{AtomicUsize, Ordering};

    use crate::pool::Pool;

    fn nodes(list: Vec<Node>) -> Arc<[Arc<Node>]> {
        list.into_iter().map(Arc::new).collect()
    }

    /// Connector whose streams are plain serial numbers.
    #[derive(Default)]
    struct FakeConnector {
        opened: AtomicUsize,
        closed: AtomicUsize,
        refuse: bool,
    }

    impl Connector for FakeConnector {
        type Stream = usize;

        fn open(&self, _node: &Node, _protocol: Protocol) -> Result<usize> {
            if self.refuse {
                return Err(io::Error::from(io::ErrorKind::ConnectionRefused).into());
            }
            Ok(self.opened.fetch_add(1, Ordering::SeqCst))
        }

        fn close(&self, _stream: usize) {
            self.closed.fetch_add(1, Ordering::SeqCst);
        }
    }

    #[test]
    fn connection_ids_are_unique() {
        assert_ne!(ConnectionId::new(), ConnectionId::new());
    }

    #[test]
    fn connection_keeps_node_back_reference() {
        let node = Arc::new(Node::new("db1", 1, 2));
        let conn = Connection::new(Arc::clone(&node), Protocol::Http, ());
        assert!(Arc::ptr_eq(conn.node(), &node));
        assert_eq!(conn.protocol(), Protocol::Http);
    }

    #[test]
    fn manager_opens_against_configured_node() {
        let node = Arc::new(Node::new("db1", 1, 2));
        let manager = ConnectionManager::new(
            Protocol::Pbc,
            Arc::from(vec![Arc::clone(&node)]),
            Arc::new(FakeConnector::default()),
        );

        let conn = manager.create_resource().unwrap();
        assert!(Arc::ptr_eq(conn.node(), &node));
        assert_eq!(conn.protocol(), Protocol::Pbc);
        assert_eq!(manager.connector().opened.load(Ordering::SeqCst), 1);

        manager.destroy_resource(conn);
        assert_eq!(manager.connector().closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn manager_without_nodes_fails() {
        let manager = ConnectionManager::new(
            Protocol::Pbc,
            nodes(vec![]),
            Arc::new(FakeConnector::default()),
        );
        assert!(matches!(
            manager.create_resource(),
            Err(TransportError::NoNodes)
        ));
    }

    #[test]
    fn refused_connection_penalizes_node() {
        let node = Arc::new(Node::new("db1", 1, 2));
        let manager = ConnectionManager::new(
            Protocol::Http,
            Arc::from(vec![Arc::clone(&node)]),
            Arc::new(FakeConnector {
                refuse: true,
                ..FakeConnector::default()
            }),
        );

        assert!(matches!(
            manager.create_resource(),
            Err(TransportError::Io(_))
        ));
        assert!((node.error_rate().value() - 1.0).abs() < 1e-3);
    }

    #[test]
    fn pool_eviction_closes_connection() {
        let pool = Pool::new(ConnectionManager::new(
            Protocol::Pbc,
            nodes(vec![Node::new("db1", 1, 2)]),
            Arc::new(FakeConnector::default()),
        ));

        let lease = pool.take().unwrap();
        lease.evict();
        assert!(pool.is_empty());
        assert_eq!(pool.manager().connector().closed.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn tcp_connector_round_trip() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let server = std::thread::spawn(move || {
            let (mut socket, _) = listener.accept().unwrap();
            let mut buf = [0u8; 4];
            socket.read_exact(&mut buf).unwrap();
            socket.write_all(&buf).unwrap();
        });

        let connector = TcpConnector::new(Duration::from_secs(1))
            .unwrap()
            .with_io_timeout(Duration::from_secs(5));
        let node = Node::new("127.0.0.1", 1, port);
        let mut stream = connector.open(&node, Protocol::Pbc).unwrap();
        stream.write_all(b"ping").unwrap();
        let mut reply = [0u8; 4];
        stream.read_exact(&mut reply).unwrap();
        assert_eq!(&reply, b"ping");

        connector.close(stream);
        server.join().unwrap();
    }

    #[test]
    fn tcp_connector_refused_is_io_error() {
        let port = {
            let listener = TcpListener::bind("127.0.0.1:0").unwrap();
            listener.local_addr().unwrap().port()
        };
        let connector = TcpConnector::new(Duration::from_secs(1)).unwrap();
        let node = Node::new("127.0.0.1", port, port);
        assert!(matches!(
            connector.open(&node, Protocol::Http),
            Err(TransportError::Io(_))
        ));
    }

    #[test]
    fn tcp_close_tolerates_dead_stream() {
        let listener = TcpListener::bind("127.0.0.1:0").unwrap();
        let port = listener.local_addr().unwrap().port();
        let connector = TcpConnector::default();
        let node = Node::new("127.0.0.1", port, port);
        let stream = connector.open(&node, Protocol::Pbc).unwrap();
        let (accepted, _) = listener.accept().unwrap();
        drop(accepted);
        let _ = stream.shutdown(Shutdown::Both);
        // A second shutdown may fail; close must swallow it.
        connector.close(stream);
    }

    #[test]
    fn tcp_connector_rejects_zero_connect_timeout() {
        assert!(matches!(
            TcpConnector::new(Duration::ZERO),
            Err(TransportError::Config(_))
        ));

        let mut config = ClientConfig::default();
        config.connect_timeout_ms = 0;
        assert!(matches!(
            TcpConnector::from_config(&config),
            Err(TransportError::Config(_))
        ));
    }

    #[test]
    fn tcp_connector_zero_io_timeout_means_none() {
        let connector = TcpConnector::default().with_io_timeout(Duration::ZERO);
        assert!(connector.io_timeout.is_none());

        let config = ClientConfig::default().with_io_timeout(Duration::from_millis(750));
        let connector = TcpConnector::from_config(&config).unwrap();
        assert_eq!(connector.connect_timeout, Duration::from_secs(5));
        assert_eq!(connector.io_timeout, Some(Duration::from_millis(750)));
    }
}
