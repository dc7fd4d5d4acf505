//! SFServiceInstance CRD
//!
//! A service instance requested through the broker. The scheduler writes
//! `spec.clusterId`; the instance replicator then mirrors it into that cluster.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{preserve_unknown_fields, Replicated, Source, State, StateValue};

/// Desired state of a service instance
///
/// Example:
/// ```yaml
/// apiVersion: osb.servicefabrik.io/v1alpha1
/// kind: SFServiceInstance
/// metadata:
///   name: 0f2c6a1e
///   namespace: sf-0f2c6a1e
/// spec:
///   serviceId: postgresql
///   planId: postgresql-small
///   clusterId: "2"
/// status:
///   state: in_queue
/// ```
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "osb.servicefabrik.io",
    version = "v1alpha1",
    kind = "SFServiceInstance",
    namespaced,
    status = "SFServiceInstanceStatus",
    shortname = "sfsi",
    printcolumn = r#"{"name":"Cluster","type":"string","jsonPath":".spec.clusterId"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SFServiceInstanceSpec {
    /// Catalog service id
    pub service_id: String,

    /// Catalog plan id
    pub plan_id: String,

    /// Broker-facing instance id
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_id: Option<String>,

    /// Platform context passed through by the broker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub context: Option<serde_json::Value>,

    /// Organization guid of the requester
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub organization_guid: Option<String>,

    /// Space guid of the requester
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub space_guid: Option<String>,

    /// Provisioning parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub parameters: Option<serde_json::Value>,

    /// Broker metadata (labels, attributes)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub metadata: Option<serde_json::Value>,

    /// Values before the current update
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub previous_values: Option<serde_json::Value>,

    /// Cluster the scheduler assigned this instance to
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cluster_id: Option<String>,
}

/// Observed state of a service instance
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SFServiceInstanceStatus {
    /// Replication/provisioning state
    #[serde(default)]
    pub state: StateValue,

    /// Last error reported by the provisioner
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Human readable description of the last operation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,

    /// Dashboard url of the instance
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub dashboard_url: Option<String>,

    /// Whether the instance can be used after a failed operation
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub instance_usable: Option<String>,

    /// Whether a failed update can be retried
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub update_repeatable: Option<String>,

    /// Spec that was last applied successfully
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_spec: Option<SFServiceInstanceSpec>,

    /// Objects the provisioner created for this instance
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<Source>,
}

impl SFServiceInstance {
    /// Assigned cluster id, `None` until the scheduler ran
    pub fn cluster_id(&self) -> Option<&str> {
        self.spec.cluster_id.as_deref().filter(|id| !id.is_empty())
    }
}

impl Replicated for SFServiceInstance {
    fn state(&self) -> State {
        self.status.as_ref().map(|s| s.state.state()).unwrap_or_default()
    }

    fn set_state(&mut self, state: State) {
        self.status.get_or_insert_with(Default::default).state = state.into();
    }
}
