//! Kubernetes adapters
//!
//! Implementations of the domain ports on top of kube-rs: watch-backed
//! caches, the cluster write client and CRD installation.

pub mod client;
pub mod crd;
pub mod informer;

pub use client::KubeClusterClient;
pub use crd::install_crd;
pub use informer::Informer;

use crate::controller::Caches;
use crate::crd::Minio;
use k8s_openapi::api::core::v1::{Node, Pod, Service};
use kube::{Api, Client};
use std::sync::Arc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// The four watched kinds
pub struct Informers {
    pub minios: Arc<Informer<Minio>>,
    pub pods: Arc<Informer<Pod>>,
    pub services: Arc<Informer<Service>>,
    pub nodes: Arc<Informer<Node>>,
}

impl Informers {
    pub fn new() -> Self {
        Self {
            minios: Informer::new("Minio"),
            pods: Informer::new("Pod"),
            services: Informer::new("Service"),
            nodes: Informer::new("Node"),
        }
    }

    pub fn caches(&self) -> Caches {
        Caches {
            minios: self.minios.clone(),
            pods: self.pods.clone(),
            services: self.services.clone(),
            nodes: self.nodes.clone(),
        }
    }

    /// Spawn the watches, scoped to `namespace` when given.
    ///
    /// Nodes are always watched cluster-wide.
    pub fn spawn(
        &self,
        client: Client,
        namespace: Option<&str>,
        shutdown: &CancellationToken,
    ) -> Vec<JoinHandle<()>> {
        fn scoped<K>(client: &Client, namespace: Option<&str>) -> Api<K>
        where
            K: kube::Resource<Scope = k8s_openapi::NamespaceResourceScope>,
            K::DynamicType: Default,
        {
            match namespace {
                Some(ns) => Api::namespaced(client.clone(), ns),
                None => Api::all(client.clone()),
            }
        }

        vec![
            tokio::spawn(
                self.minios
                    .clone()
                    .run(scoped(&client, namespace), shutdown.clone()),
            ),
            tokio::spawn(
                self.pods
                    .clone()
                    .run(scoped(&client, namespace), shutdown.clone()),
            ),
            tokio::spawn(
                self.services
                    .clone()
                    .run(scoped(&client, namespace), shutdown.clone()),
            ),
            tokio::spawn(self.nodes.clone().run(Api::all(client), shutdown.clone())),
        ]
    }
}

impl Default for Informers {
    fn default() -> Self {
        Self::new()
    }
}
