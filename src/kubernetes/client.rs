//! Cluster client backed by the Kubernetes API server

use crate::crd::Minio;
use crate::domain::ports::ClusterClient;
use crate::error::{Error, Result};
use async_trait::async_trait;
use k8s_openapi::api::core::v1::{Pod, Service};
use kube::api::PostParams;
use kube::{Api, Client, ResourceExt};
use tracing::debug;

/// `ClusterClient` writing straight to the API server
#[derive(Clone)]
pub struct KubeClusterClient {
    client: Client,
}

impl KubeClusterClient {
    pub fn new(client: Client) -> Self {
        Self { client }
    }

    fn namespaced<K>(&self, obj: &K) -> Api<K>
    where
        K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
        K::DynamicType: Default,
    {
        Api::namespaced(self.client.clone(), &obj.namespace().unwrap_or_default())
    }
}

fn full_name<K: kube::Resource>(obj: &K) -> String {
    format!("{}/{}", obj.namespace().unwrap_or_default(), obj.name_any())
}

#[async_trait]
impl ClusterClient for KubeClusterClient {
    async fn create_pod(&self, pod: &Pod) -> Result<Pod> {
        debug!(pod = %full_name(pod), "Creating pod");
        self.namespaced(pod)
            .create(&PostParams::default(), pod)
            .await
            .map_err(|e| Error::from_kube(e, "Pod", &full_name(pod)))
    }

    async fn create_service(&self, service: &Service) -> Result<Service> {
        debug!(service = %full_name(service), "Creating service");
        self.namespaced(service)
            .create(&PostParams::default(), service)
            .await
            .map_err(|e| Error::from_kube(e, "Service", &full_name(service)))
    }

    async fn update_minio(&self, minio: &Minio) -> Result<Minio> {
        debug!(minio = %full_name(minio), "Updating minio");
        self.namespaced(minio)
            .replace(&minio.name_any(), &PostParams::default(), minio)
            .await
            .map_err(|e| Error::from_kube(e, "Minio", &full_name(minio)))
    }

    async fn update_minio_status(&self, minio: &Minio) -> Result<Minio> {
        debug!(minio = %full_name(minio), "Updating minio status");
        let body = serde_json::to_vec(minio)?;
        self.namespaced(minio)
            .replace_status(&minio.name_any(), &PostParams::default(), body)
            .await
            .map_err(|e| Error::from_kube(e, "Minio", &full_name(minio)))
    }
}
