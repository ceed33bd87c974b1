//! kvtransport: connection pooling and retrying dispatch for clients of a
//! replicated key-value database.
//!
//! - [`Decaying`] counters score each [`Node`] by recent failures
//! - a generic [`Pool`] hands out exclusive [`Lease`]s on connections
//! - the [`Dispatcher`] runs work against pooled connections, retrying
//!   transient failures on other nodes

mod config;
mod connection;
mod decaying;
mod dispatcher;
mod error;
mod logging;
mod node;
pub mod pool;
mod protocol;

pub use config::{ClientConfig, DEFAULT_RETRIES, NodeConfig};
pub use connection::{Connection, ConnectionId, ConnectionManager, Connector, TcpConnector};
pub use decaying::{DEFAULT_HALF_LIFE, Decaying};
pub use dispatcher::{CallOptions, ConnectionPool, Dispatcher, RetryScope};
pub use error::{Result, TransportError};
pub use logging::init_tracing;
pub use node::{GOOD_NODE_THRESHOLD, Node, NodeHealth, choose_node};
pub use pool::{Lease, Pool, PoolStats, ResourceManager, Sweep};
pub use protocol::{Protocol, RetryClassifier};
