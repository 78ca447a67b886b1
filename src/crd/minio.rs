//! Minio CRD
//!
//! Declares one MinIO deployment: replica count, image, host storage path,
//! root credentials and the buckets that must exist once it is online.
//! The resource's annotation map doubles as the durable record of which
//! node each replica pod was placed on.

use crate::domain::ports::ObjectKey;
use kube::{CustomResource, ResourceExt};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

// =============================================================================
// Constants
// =============================================================================

/// API group of the Minio resource
pub const GROUP: &str = "miniooperator.io";

/// API version of the Minio resource
pub const VERSION: &str = "v1alpha1";

/// Label carried by every pod and service pointing at the owning workload
pub const APP_NAME_LABEL: &str = "miniooperator.io/app-name";

/// Annotation carried by a pod naming the node it was pinned to
pub const NODE_NAME_ANNOTATION: &str = "miniooperator.io/node-name";

/// Status marker written once the object store is serving
pub const INITED_OK: &str = "Ok";

pub const DEFAULT_IMAGE: &str = "quay.io/minio/minio:latest";
pub const DEFAULT_HOST_PATH: &str = "/data/minio";
pub const DEFAULT_ACCESS_KEY: &str = "root123";
pub const DEFAULT_SECRET_KEY: &str = "adminadmin";
pub const DEFAULT_API_PORT: i32 = 9000;
pub const DEFAULT_CONSOLE_PORT: i32 = 9001;

// =============================================================================
// Minio CRD
// =============================================================================

/// Minio describes a MinIO deployment whose pods are spread over the
/// ready nodes of the cluster.
#[derive(CustomResource, Debug, Clone, Default, PartialEq, Serialize, Deserialize, JsonSchema)]
#[kube(
    group = "miniooperator.io",
    version = "v1alpha1",
    kind = "Minio",
    plural = "minios",
    shortname = "mio",
    status = "MinioStatus",
    printcolumn = r#"{"name": "Replicas", "type": "integer", "jsonPath": ".spec.replicas"}"#,
    printcolumn = r#"{"name": "Inited", "type": "string", "jsonPath": ".status.inited"}"#,
    printcolumn = r#"{"name": "Age", "type": "date", "jsonPath": ".metadata.creationTimestamp"}"#,
    namespaced
)]
pub struct MinioSpec {
    /// Number of MinIO server pods
    #[serde(default)]
    pub replicas: i32,

    /// Container image of the MinIO server
    #[serde(default)]
    pub image: String,

    /// Directory on the host under which each pod gets its data directory
    #[serde(default)]
    pub hostpath: String,

    /// Root credential pair
    #[serde(default)]
    pub credential: Credential,

    /// Buckets to create once the server is online
    #[serde(default)]
    pub buckets: Vec<String>,

    /// Listening ports
    #[serde(default)]
    pub port: PortSpec,
}

// =============================================================================
// Sub-Types
// =============================================================================

/// Root access/secret key pair
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct Credential {
    #[serde(default)]
    pub access_key: String,
    #[serde(default)]
    pub secret_key: String,
}

/// Ports exposed by the MinIO pods and services
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "camelCase")]
pub struct PortSpec {
    /// S3 API port
    #[serde(default)]
    pub api_port: i32,

    /// Web console port
    #[serde(default)]
    pub console_port: i32,

    /// Node port of the S3 API. When set, an externally reachable
    /// NodePort service is created as well.
    #[serde(default)]
    pub node_port: Option<i32>,
}

// =============================================================================
// Status
// =============================================================================

/// Status of the Minio resource
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
pub struct MinioStatus {
    /// Set to "Ok" once the server answered and its buckets exist
    #[serde(default)]
    pub inited: String,
}

// =============================================================================
// Implementations
// =============================================================================

impl MinioSpec {
    /// Fill zero-valued fields with their fixed defaults.
    ///
    /// Explicitly set values, the bucket list and the node port are left
    /// untouched. Applying it twice is the same as applying it once.
    pub fn apply_defaults(&mut self) {
        if self.replicas <= 0 {
            self.replicas = 1;
        }
        if self.image.is_empty() {
            self.image = DEFAULT_IMAGE.to_string();
        }
        if self.hostpath.is_empty() {
            self.hostpath = DEFAULT_HOST_PATH.to_string();
        }
        if self.credential.access_key.is_empty() {
            self.credential.access_key = DEFAULT_ACCESS_KEY.to_string();
        }
        if self.credential.secret_key.is_empty() {
            self.credential.secret_key = DEFAULT_SECRET_KEY.to_string();
        }
        if self.port.api_port == 0 {
            self.port.api_port = DEFAULT_API_PORT;
        }
        if self.port.console_port == 0 {
            self.port.console_port = DEFAULT_CONSOLE_PORT;
        }
    }

    /// Single-replica mode: no erasure coding, no object locking.
    pub fn is_singleton(&self) -> bool {
        self.replicas == 1
    }
}

impl Minio {
    /// Identity of this workload
    pub fn key(&self) -> ObjectKey {
        ObjectKey::new(self.namespace().unwrap_or_default(), self.name_any())
    }

    /// Deterministic name of the replica pod at `index`
    pub fn pod_name(&self, index: i32) -> String {
        format!("{}-{}", self.name_any(), index)
    }

    /// Headless service used by the replicas to address each other
    pub fn internal_service_name(&self) -> String {
        format!("{}-internal", self.name_any())
    }

    /// NodePort service used by clients outside the cluster
    pub fn external_service_name(&self) -> String {
        format!("{}-external", self.name_any())
    }

    /// Whether an externally reachable service is requested
    pub fn wants_external_service(&self) -> bool {
        self.spec.port.node_port.is_some()
    }

    /// Force a single replica when only one node can host pods.
    ///
    /// Returns true if the replica count changed.
    pub fn force_singleton(&mut self, ready_nodes: usize) -> bool {
        if ready_nodes == 1 && self.spec.replicas != 1 {
            self.spec.replicas = 1;
            return true;
        }
        false
    }

    /// Node a pod of this workload was placed on before, if any
    pub fn recorded_node(&self, pod_name: &str) -> Option<&str> {
        self.metadata
            .annotations
            .as_ref()
            .and_then(|a| a.get(pod_name))
            .map(String::as_str)
    }

    /// Remember the node a pod was placed on.
    ///
    /// Returns true if the annotation map changed.
    pub fn record_placement(&mut self, pod_name: &str, node_name: &str) -> bool {
        let annotations = self.annotations_mut();
        if annotations.get(pod_name).map(String::as_str) == Some(node_name) {
            return false;
        }
        annotations.insert(pod_name.to_string(), node_name.to_string());
        true
    }

    /// Whether the server has been bootstrapped
    pub fn is_initialized(&self) -> bool {
        self.status.as_ref().map(|s| s.inited == INITED_OK).unwrap_or(false)
    }

    /// Mark the server as bootstrapped
    pub fn mark_initialized(&mut self) {
        self.status.get_or_insert_with(MinioStatus::default).inited = INITED_OK.to_string();
    }
}
