//! Custom Resource Definitions for the interoperator
//!
//! Instances, bindings and catalog records live in `osb.servicefabrik.io`;
//! cluster records live in `resource.servicefabrik.io`.

mod binding;
mod catalog;
mod cluster;
mod instance;
pub mod resource_list;
mod types;

pub use binding::{BindingResponse, SFServiceBinding, SFServiceBindingSpec, SFServiceBindingStatus};
pub use catalog::{SFPlan, SFPlanSpec, SFService, SFServiceSpec, TemplateSpec};
pub use cluster::{SFCluster, SFClusterSpec, SFClusterStatus};
pub use instance::{SFServiceInstance, SFServiceInstanceSpec, SFServiceInstanceStatus};
pub use resource_list::{
    resource_list_add, resource_list_equal, resource_list_less, resource_list_sub, ResourceList,
};
pub use types::{Replicated, Source, State, StateValue};
