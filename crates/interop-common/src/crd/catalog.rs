//! SFService and SFPlan catalog CRDs
//!
//! Catalog records are only copied between clusters by this controller, so
//! the nested broker structures (schemas, templates, manager) are kept as
//! free-form JSON.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::preserve_unknown_fields;

/// A service offered through the broker catalog
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "osb.servicefabrik.io",
    version = "v1alpha1",
    kind = "SFService",
    namespaced,
    shortname = "sfs"
)]
#[serde(rename_all = "camelCase")]
pub struct SFServiceSpec {
    /// Display name
    pub name: String,

    /// Catalog id
    pub id: String,

    /// Description shown in the marketplace
    #[serde(default)]
    pub description: String,

    /// Catalog tags
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Permissions the service requires
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub requires: Vec<String>,

    /// Whether instances of the service can be bound
    #[serde(default)]
    pub bindable: bool,

    /// Whether plans can be changed after provisioning
    #[serde(default)]
    pub plan_updatable: bool,

    /// Broker metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub metadata: Option<serde_json::Value>,

    /// Dashboard client registration
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub dashboard_client: Option<serde_json::Value>,

    /// Free-form context for the provisioners
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub context: Option<serde_json::Value>,
}

/// A plan of a catalog service
#[derive(CustomResource, Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "osb.servicefabrik.io",
    version = "v1alpha1",
    kind = "SFPlan",
    namespaced,
    shortname = "sfp"
)]
#[serde(rename_all = "camelCase")]
pub struct SFPlanSpec {
    /// Display name
    pub name: String,

    /// Catalog id
    pub id: String,

    /// Description shown in the marketplace
    #[serde(default)]
    pub description: String,

    /// Id of the owning SFService
    pub service_id: String,

    /// Whether the plan is free of charge
    #[serde(default)]
    pub free: bool,

    /// Whether instances of the plan can be bound
    #[serde(default)]
    pub bindable: bool,

    /// Whether the plan can be changed after provisioning
    #[serde(default)]
    pub plan_updatable: bool,

    /// Whether existing instances follow plan updates automatically
    #[serde(default)]
    pub auto_update_instances: bool,

    /// Longest time the broker polls a pending operation, in seconds
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum_polling_duration: Option<i64>,

    /// Broker metadata
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub metadata: Option<serde_json::Value>,

    /// Parameter schemas for instances and bindings
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub schemas: Option<serde_json::Value>,

    /// Provisioner templates
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub templates: Vec<TemplateSpec>,

    /// Free-form context for the provisioners
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub context: Option<serde_json::Value>,

    /// Provisioner selection
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schemars(schema_with = "preserve_unknown_fields")]
    pub manager: Option<serde_json::Value>,
}

/// One provisioner template of a plan
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct TemplateSpec {
    /// Operation the template renders for (provision, bind, status, ...)
    pub action: String,

    /// Template engine
    #[serde(rename = "type")]
    pub template_type: String,

    /// Remote template location
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub url: Option<String>,

    /// Inline template body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content: Option<String>,

    /// Base64 encoded template body
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub content_encoded: Option<String>,
}
