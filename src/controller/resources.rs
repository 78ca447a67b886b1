//! Pod and Service templates for a Minio workload

use crate::crd::{Minio, APP_NAME_LABEL, NODE_NAME_ANNOTATION};
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EnvVar, HostPathVolumeSource, Pod, PodSpec, Service, ServicePort,
    ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::{ObjectMeta, OwnerReference};
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::{Resource, ResourceExt};
use std::collections::BTreeMap;

/// Mount point of the data volume inside the server container
pub const DATA_DIR: &str = "/data";

const DATA_VOLUME: &str = "data";

/// Labels identifying objects owned by the workload
pub fn labels(minio: &Minio) -> BTreeMap<String, String> {
    BTreeMap::from([(APP_NAME_LABEL.to_string(), minio.name_any())])
}

fn annotations(minio: &Minio, node_name: Option<&str>) -> BTreeMap<String, String> {
    let mut annotations = labels(minio);
    if let Some(node) = node_name {
        annotations.insert(NODE_NAME_ANNOTATION.to_string(), node.to_string());
    }
    annotations
}

fn owner_references(minio: &Minio) -> Option<Vec<OwnerReference>> {
    minio.controller_owner_ref(&()).map(|owner| vec![owner])
}

fn object_meta(minio: &Minio, name: String, node_name: Option<&str>) -> ObjectMeta {
    ObjectMeta {
        name: Some(name),
        namespace: minio.namespace(),
        labels: Some(labels(minio)),
        annotations: Some(annotations(minio, node_name)),
        owner_references: owner_references(minio),
        ..Default::default()
    }
}

/// Volume argument of `minio server`.
///
/// A single replica serves a plain directory; several replicas form one
/// erasure-coded set addressed through the internal service.
pub fn server_volumes(minio: &Minio) -> String {
    if minio.spec.is_singleton() {
        return DATA_DIR.to_string();
    }
    format!(
        "http://{}-{{0...{}}}.{}.{}.svc.cluster.local{}",
        minio.name_any(),
        minio.spec.replicas - 1,
        minio.internal_service_name(),
        minio.namespace().unwrap_or_default(),
        DATA_DIR,
    )
}

fn env(name: &str, value: &str) -> EnvVar {
    EnvVar {
        name: name.to_string(),
        value: Some(value.to_string()),
        ..Default::default()
    }
}

// =============================================================================
// Pod
// =============================================================================

/// Replica pod `pod_name` pinned to `node_name`
pub fn build_pod(minio: &Minio, pod_name: &str, node_name: &str) -> Pod {
    let spec = &minio.spec;
    let credential = &spec.credential;

    let container = Container {
        name: minio.name_any(),
        image: Some(spec.image.clone()),
        args: Some(vec![
            "server".to_string(),
            format!("--console-address=:{}", spec.port.console_port),
            format!("--address=:{}", spec.port.api_port),
            server_volumes(minio),
        ]),
        env: Some(vec![
            env("MINIO_ROOT_USER", &credential.access_key),
            env("MINIO_ROOT_PASSWORD", &credential.secret_key),
            env("MINIO_ACCESS_KEY", &credential.access_key),
            env("MINIO_SECRET_KEY", &credential.secret_key),
        ]),
        ports: Some(vec![
            ContainerPort {
                name: Some("api".to_string()),
                container_port: spec.port.api_port,
                ..Default::default()
            },
            ContainerPort {
                name: Some("console".to_string()),
                container_port: spec.port.console_port,
                ..Default::default()
            },
        ]),
        volume_mounts: Some(vec![VolumeMount {
            name: DATA_VOLUME.to_string(),
            mount_path: DATA_DIR.to_string(),
            ..Default::default()
        }]),
        ..Default::default()
    };

    let host_path = format!("{}/{}", spec.hostpath.trim_end_matches('/'), pod_name);

    Pod {
        metadata: object_meta(minio, pod_name.to_string(), Some(node_name)),
        spec: Some(PodSpec {
            containers: vec![container],
            volumes: Some(vec![Volume {
                name: DATA_VOLUME.to_string(),
                host_path: Some(HostPathVolumeSource {
                    path: host_path,
                    type_: Some("DirectoryOrCreate".to_string()),
                }),
                ..Default::default()
            }]),
            node_name: Some(node_name.to_string()),
            hostname: Some(pod_name.to_string()),
            subdomain: Some(minio.internal_service_name()),
            restart_policy: Some("Always".to_string()),
            enable_service_links: Some(false),
            ..Default::default()
        }),
        status: None,
    }
}

// =============================================================================
// Services
// =============================================================================

fn service_port(name: &str, port: i32, node_port: Option<i32>) -> ServicePort {
    ServicePort {
        name: Some(name.to_string()),
        port,
        target_port: Some(IntOrString::Int(port)),
        node_port,
        ..Default::default()
    }
}

/// Headless service giving every replica a stable DNS name
pub fn build_internal_service(minio: &Minio) -> Service {
    let port = &minio.spec.port;
    Service {
        metadata: object_meta(minio, minio.internal_service_name(), None),
        spec: Some(ServiceSpec {
            cluster_ip: Some("None".to_string()),
            type_: Some("ClusterIP".to_string()),
            selector: Some(labels(minio)),
            publish_not_ready_addresses: Some(true),
            ports: Some(vec![
                service_port("api", port.api_port, None),
                service_port("console", port.console_port, None),
            ]),
            ..Default::default()
        }),
        status: None,
    }
}

/// NodePort service for clients outside the cluster; `None` unless a node
/// port is configured
pub fn build_external_service(minio: &Minio) -> Option<Service> {
    let port = &minio.spec.port;
    let node_port = port.node_port?;
    Some(Service {
        metadata: object_meta(minio, minio.external_service_name(), None),
        spec: Some(ServiceSpec {
            type_: Some("NodePort".to_string()),
            selector: Some(labels(minio)),
            ports: Some(vec![
                service_port("api", port.api_port, Some(node_port)),
                service_port("console", port.console_port, None),
            ]),
            ..Default::default()
        }),
        status: None,
    })
}

/// Services the workload needs, internal first
pub fn desired_services(minio: &Minio) -> Vec<Service> {
    let mut services = vec![build_internal_service(minio)];
    services.extend(build_external_service(minio));
    services
}
