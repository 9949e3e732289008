// Cluster-aware client for Gryphon servers

pub mod client;
pub mod cluster;
mod connection;
pub mod error;
pub mod host;
pub mod result_set;

pub use client::{Client, SessionClient};
pub use cluster::{Cluster, ClusterBuilder};
pub use error::{ClientError, Result};
pub use host::{Host, HostState};
pub use result_set::ResultSet;
