//! Multi-cluster deployment for the interoperator
//!
//! This crate keeps service instances, bindings and cluster records in sync
//! between the primary cluster and its sister clusters:
//! - `registry`: resolves cluster ids to clients and typed stores
//! - `watch_manager`: watches every sister and republishes its events
//! - `replicator`: the per-kind replication state machines
//! - `membership`: keeps the watched set equal to the SFCluster records
//! - `usage`: reports the own cluster's capacity and requests

pub mod membership;
pub mod registry;
pub mod replicator;
pub mod store;
pub mod usage;
pub mod watch_manager;

pub use membership::{ClusterWatches, MembershipContext};
pub use registry::{ClusterRegistry, CredentialResolver, KubeClusterRegistry};
pub use replicator::ReplicatorContext;
pub use store::{ClusterClient, KubeStore, ResourceStore};
pub use usage::UsageContext;
pub use watch_manager::{RegistryConnector, SisterEvent, WatchManager};

// Re-export common error types
pub use interop_common::{Error, Result};
