//! Node identity: the `(hostname, port)` pair that names a node controller.
//!
//! The same pair is the primary key of the `node_info` table, the address
//! peers dial, and the payload of the `IdentifyNode` handshake.

use std::fmt;

use serde::{Deserialize, Serialize};

use crate::error::CoreError;

/// Maximum length of a hostname (RFC 1035 limit for a full name).
const MAX_HOSTNAME_LEN: usize = 253;

/// Address of one node controller's peer endpoint.
///
/// Ordering is `(host, port)` lexicographic, which is the order nodes use
/// to find their own slot in the staggered recovery schedule.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct NodeAddress {
    pub host: String,
    pub port: u16,
}

impl NodeAddress {
    pub fn new(host: impl Into<String>, port: u16) -> Self {
        Self {
            host: host.into(),
            port,
        }
    }
}

impl fmt::Display for NodeAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Validate a hostname advertised to the rest of the cluster.
///
/// Rules:
/// - Must not be empty.
/// - Must not exceed `MAX_HOSTNAME_LEN` characters.
/// - Must contain only alphanumeric, hyphen, underscore, or dot characters.
pub fn validate_hostname(host: &str) -> Result<(), CoreError> {
    if host.is_empty() {
        return Err(CoreError::Validation(
            "Hostname must not be empty".to_string(),
        ));
    }
    if host.len() > MAX_HOSTNAME_LEN {
        return Err(CoreError::Validation(format!(
            "Hostname must not exceed {MAX_HOSTNAME_LEN} characters"
        )));
    }
    if !host
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.')
    {
        return Err(CoreError::Validation(format!(
            "Hostname '{host}' may only contain alphanumeric, hyphen, underscore, or dot characters"
        )));
    }
    Ok(())
}

/// Position of `this` among `nodes` once sorted, or `None` if absent.
///
/// Duplicates are collapsed before ranking so a stale duplicate row cannot
/// push a node out of range.
pub fn node_index(nodes: &[NodeAddress], this: &NodeAddress) -> Option<usize> {
    let mut sorted: Vec<&NodeAddress> = nodes.iter().collect();
    sorted.sort();
    sorted.dedup();
    sorted.iter().position(|n| *n == this)
}
