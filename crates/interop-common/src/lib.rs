//! Common types for the interoperator: CRDs, errors, config and utilities

#![deny(missing_docs)]

pub mod config;
pub mod crd;
pub mod error;
pub mod kube_utils;
pub mod retry;
pub mod telemetry;

pub use error::Error;

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Namespace holding SFCluster records, catalog objects and the config map
pub const DEFAULT_NAMESPACE: &str = "interoperator";

/// Label recording which trigger state last moved an object to `in progress`
pub const LAST_OPERATION_LABEL: &str = "lastOperation";

/// Label marking the SFCluster that describes the primary cluster
pub const PRIMARY_CLUSTER_LABEL: &str = "interoperator.servicefabrik.io/primarycluster";

/// Key inside a cluster credential secret holding the kubeconfig blob
pub const KUBECONFIG_SECRET_KEY: &str = "kubeconfig";

/// Server-side timeout for each sister cluster watch (must stay below 295s)
pub const MULTI_CLUSTER_WATCH_TIMEOUT_SECS: u32 = 290;

/// Capacity of each shared sister event queue
pub const EVENT_QUEUE_CAPACITY: usize = 1024;

/// Field manager used for server-side apply and status patches
pub const FIELD_MANAGER: &str = "interoperator-mcd";

/// Annotation flipped on a deleting SFPlan whenever one of its instances is
/// deleted, so the plan's own controller re-checks whether it can go
pub const PLAN_DELETE_ATTEMPTS_ANNOTATION: &str = "interoperator.servicefabrik.io/plan-delete-attempts";

/// Prefix for generated binding secrets when the binding carries no secretRef
pub const BINDING_SECRET_PREFIX: &str = "sf-";
