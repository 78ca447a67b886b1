//! Minio CRD installation

use crate::crd::Minio;
use crate::error::{Error, Result};
use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
use kube::api::{Patch, PatchParams};
use kube::runtime::wait::{await_condition, conditions};
use kube::{Api, Client, CustomResourceExt, ResourceExt};
use std::time::Duration;
use tracing::info;

/// Field manager used for server-side apply
pub const FIELD_MANAGER: &str = "minio-operator";

/// Apply the Minio CRD and wait until the API server serves it.
pub async fn install_crd(client: Client, timeout: Duration) -> Result<()> {
    let crds: Api<CustomResourceDefinition> = Api::all(client);
    let crd = Minio::crd();
    let name = crd.name_any();

    crds.patch(
        &name,
        &PatchParams::apply(FIELD_MANAGER).force(),
        &Patch::Apply(&crd),
    )
    .await
    .map_err(|e| Error::from_kube(e, "CustomResourceDefinition", &name))?;
    info!(crd = %name, "Applied CRD");

    let established = await_condition(crds, &name, conditions::is_crd_established());
    tokio::time::timeout(timeout, established)
        .await
        .map_err(|_| Error::Timeout {
            operation: format!("establishing CRD {}", name),
            after: timeout,
        })?
        .map_err(|e| Error::Internal(format!("Waiting for CRD {}: {}", name, e)))?;

    info!(crd = %name, "CRD established");
    Ok(())
}
