//! Transport protocols and their retryability predicates.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::TransportError;

/// Wire protocol a connection speaks. Each protocol has its own pool.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    Http,
    /// Binary protocol-buffers transport
    #[default]
    Pbc,
}

impl Protocol {
    pub const ALL: [Protocol; 2] = [Protocol::Http, Protocol::Pbc];

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Pbc => "pbc",
        }
    }
}

impl fmt::Display for Protocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Protocol {
    type Err = TransportError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "http" => Ok(Self::Http),
            "pbc" => Ok(Self::Pbc),
            other => Err(TransportError::Config(format!(
                "unknown protocol '{other}', expected 'http' or 'pbc'"
            ))),
        }
    }
}

/// Decides whether a failed unit of work may be retried on another connection.
///
/// The dispatcher ORs every registered classifier; I/O errors are transient
/// regardless.
pub trait RetryClassifier: Send + Sync {
    fn is_retryable(&self, error: &TransportError) -> bool;
}

impl RetryClassifier for Protocol {
    fn is_retryable(&self, error: &TransportError) -> bool {
        match self {
            Self::Http => matches!(
                error,
                TransportError::BadStatusLine(_) | TransportError::CannotSendRequest(_)
            ),
            Self::Pbc => matches!(error, TransportError::ConnectionClosed),
        }
    }
}
