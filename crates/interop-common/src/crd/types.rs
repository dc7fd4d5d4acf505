//! Types shared by the service fabrik CRDs

use std::fmt;

use kube::ResourceExt;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use crate::LAST_OPERATION_LABEL;

/// Replication state of an instance or binding.
///
/// `InQueue`, `Update` and `Delete` are triggers set by the broker,
/// `InProgress` marks an operation handed to a provisioner, and
/// `Succeeded`/`Failed` are terminal.
#[derive(Clone, Copy, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq, Eq, Hash)]
pub enum State {
    /// Waiting for provisioning
    #[default]
    #[serde(rename = "in_queue")]
    InQueue,
    /// Waiting for an update
    #[serde(rename = "update")]
    Update,
    /// Waiting for deprovisioning
    #[serde(rename = "delete")]
    Delete,
    /// Handed to the provisioner
    #[serde(rename = "in progress")]
    InProgress,
    /// Operation finished
    #[serde(rename = "succeeded")]
    Succeeded,
    /// Operation failed
    #[serde(rename = "failed")]
    Failed,
    /// A value this controller does not know
    #[serde(other, rename = "unknown")]
    Unknown,
}

impl State {
    /// Wire representation
    pub fn as_str(&self) -> &'static str {
        match self {
            State::InQueue => "in_queue",
            State::Update => "update",
            State::Delete => "delete",
            State::InProgress => "in progress",
            State::Succeeded => "succeeded",
            State::Failed => "failed",
            State::Unknown => "unknown",
        }
    }

    /// Parse a wire value, mapping anything unrecognized to `Unknown`
    pub fn parse(s: &str) -> Self {
        match s {
            "in_queue" => State::InQueue,
            "update" => State::Update,
            "delete" => State::Delete,
            "in progress" => State::InProgress,
            "succeeded" => State::Succeeded,
            "failed" => State::Failed,
            _ => State::Unknown,
        }
    }

    /// True for the states that ask a replicator to push to the sister
    pub fn is_trigger(&self) -> bool {
        matches!(self, State::InQueue | State::Update | State::Delete)
    }
}

impl fmt::Display for State {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// `status.state` exactly as written by the broker or a provisioner.
///
/// Values outside the known vocabulary read as [`State::Unknown`] but are
/// kept verbatim, so copying a status between clusters never rewrites them.
#[derive(Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq, Eq)]
#[serde(transparent)]
pub struct StateValue(String);

impl StateValue {
    /// Parsed state
    pub fn state(&self) -> State {
        State::parse(&self.0)
    }

    /// Raw wire value
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Default for StateValue {
    fn default() -> Self {
        State::default().into()
    }
}

impl From<State> for StateValue {
    fn from(state: State) -> Self {
        Self(state.as_str().to_string())
    }
}

/// Reference to a Kubernetes object created for an instance or binding
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct Source {
    /// API version of the referenced object
    pub api_version: String,
    /// Kind of the referenced object
    pub kind: String,
    /// Name of the referenced object
    pub name: String,
    /// Namespace of the referenced object
    #[serde(default, skip_serializing_if = "String::is_empty")]
    pub namespace: String,
}

/// Schema for free-form JSON fields (`parameters`, `context`, ...)
pub(crate) fn preserve_unknown_fields(
    _gen: &mut schemars::gen::SchemaGenerator,
) -> schemars::schema::Schema {
    let mut obj = schemars::schema::SchemaObject {
        instance_type: Some(schemars::schema::InstanceType::Object.into()),
        ..Default::default()
    };
    obj.extensions.insert(
        "x-kubernetes-preserve-unknown-fields".to_string(),
        serde_json::Value::Bool(true),
    );
    schemars::schema::Schema::Object(obj)
}

/// Objects driven through the replication state machine.
///
/// The state lives in `status.state`; the operation that started the current
/// `in progress` phase lives in the `lastOperation` label.
pub trait Replicated: ResourceExt {
    /// Current `status.state` (defaults to `in_queue` when unset)
    fn state(&self) -> State;

    /// Overwrite `status.state`
    fn set_state(&mut self, state: State);

    /// Operation recorded by the last transition to `in progress`
    fn last_operation(&self) -> State {
        self.labels()
            .get(LAST_OPERATION_LABEL)
            .map(|v| State::parse(v))
            .unwrap_or(State::InQueue)
    }

    /// Record the operation that moved the object to `in progress`
    fn set_last_operation(&mut self, op: State) {
        self.labels_mut()
            .insert(LAST_OPERATION_LABEL.to_string(), op.as_str().to_string());
    }

    /// True once a deletion timestamp is set
    fn is_deleting(&self) -> bool {
        self.meta().deletion_timestamp.is_some()
    }
}
