//! Backend node records and failure-aware node selection.

use std::fmt;
use std::sync::Arc;

use rand::seq::IndexedRandom;
use serde::{Deserialize, Serialize};

use crate::config::NodeConfig;
use crate::decaying::Decaying;
use crate::protocol::Protocol;

/// Nodes whose decayed error rate is below this are considered healthy.
pub const GOOD_NODE_THRESHOLD: f64 = 0.1;

/// A configured backend endpoint and its recent-error score.
///
/// Identity is by reference: two nodes built from the same configuration are
/// distinct. Share them as `Arc<Node>` and compare with [`Arc::ptr_eq`].
#[derive(Debug)]
pub struct Node {
    host: String,
    http_port: u16,
    pb_port: u16,
    error_rate: Decaying,
}

impl Node {
    pub fn new(host: impl Into<String>, http_port: u16, pb_port: u16) -> Self {
        Self {
            host: host.into(),
            http_port,
            pb_port,
            error_rate: Decaying::new(),
        }
    }

    pub fn from_config(config: &NodeConfig) -> Self {
        Self::new(config.host.clone(), config.http_port, config.pb_port)
    }

    pub fn host(&self) -> &str {
        &self.host
    }

    pub fn http_port(&self) -> u16 {
        self.http_port
    }

    pub fn pb_port(&self) -> u16 {
        self.pb_port
    }

    pub fn port(&self, protocol: Protocol) -> u16 {
        match protocol {
            Protocol::Http => self.http_port,
            Protocol::Pbc => self.pb_port,
        }
    }

    /// Decaying count of transient failures seen against this node.
    pub fn error_rate(&self) -> &Decaying {
        &self.error_rate
    }

    pub fn health(&self) -> NodeHealth {
        NodeHealth {
            host: self.host.clone(),
            http_port: self.http_port,
            pb_port: self.pb_port,
            error_rate: self.error_rate.value(),
        }
    }
}

impl fmt::Display for Node {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{} (http:{}, pbc:{})",
            self.host, self.http_port, self.pb_port
        )
    }
}

/// Point-in-time health report for one node.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NodeHealth {
    pub host: String,
    pub http_port: u16,
    pub pb_port: u16,
    pub error_rate: f64,
}

impl NodeHealth {
    pub fn is_good(&self) -> bool {
        self.error_rate < GOOD_NODE_THRESHOLD
    }
}

/// Pick a node to open a new connection against.
///
/// Chooses uniformly among nodes under [`GOOD_NODE_THRESHOLD`]; if none
/// qualify, falls back to the node with the lowest error rate.
pub fn choose_node(nodes: &[Arc<Node>]) -> Option<Arc<Node>> {
    let scored: Vec<(f64, &Arc<Node>)> = nodes
        .iter()
        .map(|node| (node.error_rate().value(), node))
        .collect();

    let good: Vec<&Arc<Node>> = scored
        .iter()
        .filter(|(rate, _)| *rate < GOOD_NODE_THRESHOLD)
        .map(|(_, node)| *node)
        .collect();

    if let Some(node) = good.choose(&mut rand::rng()) {
        return Some(Arc::clone(node));
    }

    scored
        .iter()
        .min_by(|(a, _), (b, _)| a.total_cmp(b))
        .map(|(_, node)| Arc::clone(node))
}
