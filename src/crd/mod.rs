//! Custom Resource Definitions for the MinIO operator
//!
//! This module contains the `Minio` resource, its defaulting rules and
//! the helpers that read and write its placement annotations.

pub mod minio;

pub use minio::*;

use kube::CustomResourceExt;

/// Render the Minio CRD as YAML, e.g. for `kubectl apply -f -`.
pub fn crd_yaml() -> crate::error::Result<String> {
    Ok(serde_yaml::to_string(&Minio::crd())?)
}
