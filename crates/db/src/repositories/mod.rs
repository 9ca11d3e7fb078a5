//! Repositories over [`Transaction`](crate::transaction::Transaction)s.

pub mod node_info_repo;

pub use node_info_repo::NodeInfoRepo;
