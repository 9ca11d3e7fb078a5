//! Record types stored by the coordination layer.

pub mod node_info;
