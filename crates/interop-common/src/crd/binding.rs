//! SFServiceBinding CRD

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{preserve_unknown_fields, Replicated, Source, State, StateValue};
use crate::BINDING_SECRET_PREFIX;

/// Desired state of a service binding
///
/// A binding belongs to the cluster of the instance named by `instanceId`.
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "osb.servicefabrik.io",
    version = "v1alpha1",
    kind = "SFServiceBinding",
    namespaced,
    status = "SFServiceBindingStatus",
    shortname = "sfsb",
    printcolumn = r#"{"name":"Instance","type":"string","jsonPath":".spec.instanceId"}"#,
    printcolumn = r#"{"name":"State","type":"string","jsonPath":".status.state"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct SFServiceBindingSpec {
    /// Broker-facing binding id
    #[serde(default)]
    pub id: String,

    /// Name of the SFServiceInstance this binding belongs to
    pub instance_id: String,

    /// Catalog plan id
    #[serde(default)]
    pub plan_id: String,

    /// Catalog service id
    #[serde(default)]
    pub service_id: String,

    /// Application guid
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub app_guid: Option<String>,

    /// Bind resource as sent by the platform
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub bind_resource: Option<serde_json::Value>,

    /// Platform context
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub context: Option<serde_json::Value>,

    /// Bind parameters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub parameters: Option<serde_json::Value>,

    /// Whether the platform accepts asynchronous completion
    #[serde(default)]
    pub accepts_incomplete: bool,
}

/// Response generated by the provisioner for a binding
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct BindingResponse {
    /// Name of the secret holding the credentials
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub secret_ref: String,
}

/// Observed state of a service binding
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SFServiceBindingStatus {
    /// Replication/provisioning state
    #[serde(default)]
    pub state: StateValue,

    /// Last error reported by the provisioner
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    /// Generated response
    #[serde(default)]
    pub response: BindingResponse,

    /// Spec that was last applied successfully
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_spec: Option<SFServiceBindingSpec>,

    /// Objects the provisioner created for this binding
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub resources: Vec<Source>,
}

impl SFServiceBinding {
    /// Name of the credentials secret, falling back to `sf-<binding name>`
    pub fn secret_name(&self) -> String {
        self.status
            .as_ref()
            .map(|s| s.response.secret_ref.as_str())
            .filter(|name| !name.is_empty())
            .map(str::to_string)
            .unwrap_or_else(|| {
                format!(
                    "{}{}",
                    BINDING_SECRET_PREFIX,
                    self.metadata.name.as_deref().unwrap_or_default()
                )
            })
    }
}

impl Replicated for SFServiceBinding {
    fn state(&self) -> State {
        self.status.as_ref().map(|s| s.state.state()).unwrap_or_default()
    }

    fn set_state(&mut self, state: State) {
        self.status.get_or_insert_with(Default::default).state = state.into();
    }
}
