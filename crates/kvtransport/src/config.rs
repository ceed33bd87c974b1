//! Client configuration.
//!
//! These types are plain data: callers build them in code or deserialize them
//! from whatever source they load configuration from.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Result, TransportError};
use crate::protocol::Protocol;

/// Attempts per logical call unless overridden.
pub const DEFAULT_RETRIES: usize = 3;

/// Address and per-protocol ports of one backend node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct NodeConfig {
    pub host: String,
    pub http_port: u16,
    pub pb_port: u16,
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            host: "127.0.0.1".to_string(),
            http_port: 8098,
            pb_port: 8087,
        }
    }
}

impl NodeConfig {
    pub fn new(host: impl Into<String>) -> Self {
        Self {
            host: host.into(),
            ..Self::default()
        }
    }

    pub fn with_http_port(mut self, port: u16) -> Self {
        self.http_port = port;
        self
    }

    pub fn with_pb_port(mut self, port: u16) -> Self {
        self.pb_port = port;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ClientConfig {
    pub nodes: Vec<NodeConfig>,
    /// Protocol used when a call does not pick one.
    pub protocol: Protocol,
    /// Default attempt budget for every thread.
    pub retries: usize,
    pub connect_timeout_ms: u64,
    /// Read/write timeout applied to every socket; `None` blocks indefinitely.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub io_timeout_ms: Option<u64>,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            nodes: vec![NodeConfig::default()],
            protocol: Protocol::default(),
            retries: DEFAULT_RETRIES,
            connect_timeout_ms: 5000,
            io_timeout_ms: None,
        }
    }
}

impl ClientConfig {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the node list.
    pub fn with_nodes(mut self, nodes: Vec<NodeConfig>) -> Self {
        self.nodes = nodes;
        self
    }

    pub fn with_protocol(mut self, protocol: Protocol) -> Self {
        self.protocol = protocol;
        self
    }

    pub fn with_retries(mut self, retries: usize) -> Self {
        self.retries = retries;
        self
    }

    pub fn with_connect_timeout(mut self, timeout: Duration) -> Self {
        self.connect_timeout_ms = millis(timeout);
        self
    }

    pub fn with_io_timeout(mut self, timeout: Duration) -> Self {
        self.io_timeout_ms = Some(millis(timeout));
        self
    }

    pub fn connect_timeout(&self) -> Duration {
        Duration::from_millis(self.connect_timeout_ms)
    }

    pub fn io_timeout(&self) -> Option<Duration> {
        self.io_timeout_ms.map(Duration::from_millis)
    }

    pub fn validate(&self) -> Result<()> {
        if self.nodes.is_empty() {
            return Err(TransportError::NoNodes);
        }
        if self.retries == 0 {
            return Err(TransportError::Config(
                "retries must be at least 1".to_string(),
            ));
        }
        if self.connect_timeout_ms == 0 {
            return Err(TransportError::Config(
                "connect_timeout_ms must be positive".to_string(),
            ));
        }
        if self.io_timeout_ms == Some(0) {
            return Err(TransportError::Config(
                "io_timeout_ms must be positive when set".to_string(),
            ));
        }
        Ok(())
    }
}

/// Whole milliseconds, saturating at `u64::MAX`.
fn millis(timeout: Duration) -> u64 {
    u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults() {
        let config = ClientConfig::default();
        assert_eq!(config.nodes, vec![NodeConfig::default()]);
        assert_eq!(config.protocol, Protocol::Pbc);
        assert_eq!(config.retries, 3);
        assert_eq!(config.connect_timeout(), Duration::from_secs(5));
        assert!(config.io_timeout().is_none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn default_serializes() {
        insta::assert_json_snapshot!(ClientConfig::default(), @r#"
        {
          "nodes": [
            {
              "host": "127.0.0.1",
              "http_port": 8098,
              "pb_port": 8087
            }
          ],
          "protocol": "pbc",
          "retries": 3,
          "connect_timeout_ms": 5000
        }
        "#);
    }

    #[test]
    fn partial_document_fills_defaults() {
        let config: ClientConfig = serde_json::from_str(
            r#"{"nodes": [{"host": "db1"}, {"host": "db2", "pb_port": 18087}], "protocol": "http"}"#,
        )
        .unwrap();

        assert_eq!(config.nodes.len(), 2);
        assert_eq!(config.nodes[0].host, "db1");
        assert_eq!(config.nodes[0].pb_port, 8087);
        assert_eq!(config.nodes[1].pb_port, 18087);
        assert_eq!(config.nodes[1].http_port, 8098);
        assert_eq!(config.protocol, Protocol::Http);
        assert_eq!(config.retries, DEFAULT_RETRIES);
    }

    #[test]
    fn builder_pattern() {
        let config = ClientConfig::new()
            .with_nodes(vec![NodeConfig::new("db1").with_pb_port(1).with_http_port(2)])
            .with_protocol(Protocol::Http)
            .with_retries(5)
            .with_connect_timeout(Duration::from_millis(250))
            .with_io_timeout(Duration::from_secs(2));

        assert_eq!(config.nodes[0].pb_port, 1);
        assert_eq!(config.nodes[0].http_port, 2);
        assert_eq!(config.retries, 5);
        assert_eq!(config.connect_timeout_ms, 250);
        assert_eq!(config.io_timeout(), Some(Duration::from_secs(2)));
    }

    #[test]
    fn validate_rejects_empty_nodes() {
        let config = ClientConfig::new().with_nodes(vec![]);
        assert!(matches!(config.validate(), Err(TransportError::NoNodes)));
    }

    #[test]
    fn validate_rejects_zero_retries() {
        let config = ClientConfig::new().with_retries(0);
        assert!(matches!(config.validate(), Err(TransportError::Config(_))));
    }

    #[test]
    fn validate_rejects_zero_timeouts() {
        let mut config = ClientConfig::new();
        config.connect_timeout_ms = 0;
        assert!(config.validate().is_err());

        let config = ClientConfig::new().with_io_timeout(Duration::ZERO);
        assert!(config.validate().is_err());
    }

    #[test]
    fn huge_timeouts_saturate() {
        let config = ClientConfig::new()
            .with_connect_timeout(Duration::MAX)
            .with_io_timeout(Duration::MAX);
        assert_eq!(config.connect_timeout_ms, u64::MAX);
        assert_eq!(config.io_timeout_ms, Some(u64::MAX));
    }
}
