//! MinIO Operator
//!
//! A Kubernetes operator that runs MinIO servers declared through the
//! `Minio` custom resource. Replica pods are spread over the ready nodes,
//! pinned to their node for life, and recreated on the same node when
//! they disappear.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────┐
//! │                          Kubernetes API                              │
//! └───────┬───────────────────────────────────────────────▲──────────────┘
//!         │ watch (Minio, Pod, Service, Node)             │ create / update
//! ┌───────▼────────────┐                        ┌─────────┴──────────────┐
//! │     Informers      │                        │   KubeClusterClient    │
//! │  (DashMap caches)  │                        └─────────▲──────────────┘
//! └───────┬────────────┘                                  │
//!         │ events                                        │
//! ┌───────▼────────────┐   ┌───────────────┐   ┌──────────┴─────────────┐
//! │   Event Handlers   ├──►│   WorkQueue   ├──►│      Reconciler        │
//! │ (change detector)  │   │ (rate limited)│   │ census → services →    │
//! └────────────────────┘   └───────────────┘   │ pods → bootstrap       │
//!                                              └──────┬─────────┬───────┘
//!                                                     │         │
//!                                     ┌───────────────▼──┐  ┌───▼─────────────┐
//!                                     │ Allocation Pool  │  │  MinIO (S3 API) │
//!                                     └──────────────────┘  └─────────────────┘
//! ```
//!
//! # Modules
//!
//! - [`controller`]: Change detector, trigger queue and reconcile engine
//! - [`allocation`]: Node census and replica spreading
//! - [`kubernetes`]: kube-rs adapters (caches, client, CRD install)
//! - [`backends`]: Object store adapters
//! - [`crd`]: Custom Resource Definitions
//! - [`domain`]: Core identity type and port traits
//! - [`metrics`]: Prometheus metrics
//! - [`error`]: Error types and handling

pub mod allocation;
pub mod backends;
pub mod controller;
pub mod crd;
pub mod domain;
pub mod error;
pub mod kubernetes;
pub mod metrics;

// Re-export commonly used types
pub use allocation::{ready_nodes, AllocationPool, Placement};

pub use backends::{MinioClient, MinioConnector};

pub use controller::{Caches, Controller, ControllerConfig, Reconciler, WorkQueue};

pub use crd::{Credential, Minio, MinioSpec, MinioStatus, PortSpec};

pub use domain::ports::{
    BucketOptions, ClusterClient, Endpoint, ObjectCache, ObjectKey, ObjectStore,
    ObjectStoreConnector,
};

pub use error::{Error, ErrorAction, Result};

pub use kubernetes::{install_crd, Informer, Informers, KubeClusterClient};

pub use metrics::Metrics;

/// Library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Library name
pub const NAME: &str = env!("CARGO_PKG_NAME");
