//! Node registry entity (`node_info` table).

use peerwork_core::node::NodeAddress;
use peerwork_core::types::Timestamp;
use serde::{Deserialize, Serialize};

use crate::schema::{Column, Table};

/// Table name for the node registry.
pub const NODE_INFO_TABLE: &str = "node_info";

/// A row from the `node_info` table: one live coordinator node.
///
/// Keyed by `(hostname, port)`. `time` is the last registration or
/// heartbeat.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeInfo {
    pub hostname: String,
    pub port: i32,
    pub pid: i32,
    pub time: Timestamp,
}

impl NodeInfo {
    /// Peer-link address of this node, if the stored port is valid.
    pub fn address(&self) -> Option<NodeAddress> {
        u16::try_from(self.port)
            .ok()
            .map(|port| NodeAddress::new(self.hostname.clone(), port))
    }
}

/// Definition of the `node_info` table.
pub fn node_info_table() -> Table {
    Table::new(NODE_INFO_TABLE)
        .with_column(Column::text("hostname"))
        .with_column(Column::integer("port"))
        .with_column(Column::integer("pid"))
        .with_column(Column::timestamp("time").default_now())
        .with_primary_key(["hostname", "port"])
}

#[cfg(test)]
mod tests {
    use super::*;

    fn info(port: i32) -> NodeInfo {
        NodeInfo {
            hostname: "cal1.example.com".into(),
            port,
            pid: 100,
            time: chrono::DateTime::from_timestamp(0, 0).unwrap(),
        }
    }

    #[test]
    fn address_from_valid_port() {
        assert_eq!(
            info(7654).address(),
            Some(NodeAddress::new("cal1.example.com", 7654))
        );
    }

    #[test]
    fn out_of_range_port_has_no_address() {
        assert_eq!(info(-1).address(), None);
        assert_eq!(info(70_000).address(), None);
    }
}
