//! SFCluster CRD
//!
//! One record per registered cluster, living in the control namespace of the
//! primary and mirrored into the cluster it describes. The name is the
//! cluster id.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::resource_list::ResourceList;

/// Declared configuration of a cluster
///
/// Example:
/// ```yaml
/// apiVersion: resource.servicefabrik.io/v1alpha1
/// kind: SFCluster
/// metadata:
///   name: "2"
///   namespace: interoperator
/// spec:
///   secretRef: cluster-2-kubeconfig
///   schedulingLimitPercentage: 80
///   totalCapacity:
///     cpu: "64"
///     memory: 256Gi
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "resource.servicefabrik.io",
    version = "v1alpha1",
    kind = "SFCluster",
    namespaced,
    status = "SFClusterStatus",
    shortname = "sfc",
    printcolumn = r#"{"name":"Secret","type":"string","jsonPath":".spec.secretRef"}"#,
    printcolumn = r#"{"name":"Instances","type":"integer","jsonPath":".status.serviceInstanceCount"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SFClusterSpec {
    /// Name of the secret (same namespace) holding the cluster kubeconfig
    #[serde(default)]
    pub secret_ref: String,

    /// Capacity declared by the operator, overriding node discovery
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_capacity: Option<ResourceList>,

    /// Share of capacity the scheduler may fill, in percent
    #[serde(default)]
    pub scheduling_limit_percentage: i32,
}

/// Observed usage of a cluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SFClusterStatus {
    /// Sum of node allocatable
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_capacity: Option<ResourceList>,

    /// Copy of `spec.totalCapacity` as seen by the cluster itself
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub total_capacity: Option<ResourceList>,

    /// Sum of pod requests
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub requests: Option<ResourceList>,

    /// Number of service instances scheduled on the cluster
    #[serde(default)]
    pub service_instance_count: i32,
}

impl SFCluster {
    /// Status, or an empty one when the cluster has not reported yet
    pub fn status_or_default(&self) -> SFClusterStatus {
        self.status.clone().unwrap_or_default()
    }
}
