//! CRD installation
//!
//! The operator installs its own CRDs on startup using server-side apply, so
//! the installed versions always match the binary.

use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Api, Patch, PatchParams};
use kube::{Client, CustomResourceExt};

use interop_common::crd::{SFCluster, SFPlan, SFService, SFServiceBinding, SFServiceInstance};
use interop_common::FIELD_MANAGER;

/// CRD definition with name and resource
struct CrdDef {
    name: &'static str,
    crd: CustomResourceDefinition,
}

fn all_crds() -> Vec<CrdDef> {
    vec![
        CrdDef {
            name: "sfserviceinstances.osb.servicefabrik.io",
            crd: SFServiceInstance::crd(),
        },
        CrdDef {
            name: "sfservicebindings.osb.servicefabrik.io",
            crd: SFServiceBinding::crd(),
        },
        CrdDef {
            name: "sfservices.osb.servicefabrik.io",
            crd: SFService::crd(),
        },
        CrdDef {
            name: "sfplans.osb.servicefabrik.io",
            crd: SFPlan::crd(),
        },
        CrdDef {
            name: "sfclusters.resource.servicefabrik.io",
            crd: SFCluster::crd(),
        },
    ]
}

/// All CRD manifests as one multi-document YAML stream
pub fn render_all() -> anyhow::Result<String> {
    let docs = all_crds()
        .into_iter()
        .map(|def| serde_yaml::to_string(&def.crd))
        .collect::<Result<Vec<_>, _>>()?;
    Ok(docs.join("---\n"))
}

/// Ensure all interoperator CRDs are installed
pub async fn ensure_crds_installed(client: &Client) -> anyhow::Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    for def in all_crds() {
        tracing::info!("Installing {} CRD...", def.name);
        crds.patch(def.name, &params, &Patch::Apply(&def.crd))
            .await
            .map_err(|e| anyhow::anyhow!("failed to install {} CRD: {}", def.name, e))?;
    }

    tracing::info!("All interoperator CRDs installed/updated");
    Ok(())
}
