//! Platform resources backing self-hosted members
//!
//! Every self-hosted member is one Pod plus one Service of the same name; the
//! Service gives the member a stable DNS name for its peer and client URLs.
//! A cluster-wide `<cluster>-client` Service fronts all members.
//!
//! The platform is treated as at-least-once and eventually consistent:
//! applies are server-side and idempotent, deletes of something already gone
//! succeed, and an existing member Pod is never re-specified (its startup
//! flags are only meaningful the first time etcd starts).

use std::collections::BTreeMap;

use async_trait::async_trait;
use k8s_openapi::api::core::v1::{
    Container, ContainerPort, EmptyDirVolumeSource, HTTPGetAction, Pod, PodSpec, Probe, Service,
    ServicePort, ServiceSpec, Volume, VolumeMount,
};
use k8s_openapi::apimachinery::pkg::apis::meta::v1::ObjectMeta;
use k8s_openapi::apimachinery::pkg::util::intstr::IntOrString;
use kube::api::{Api, DeleteParams, ListParams, Patch, PatchParams};
use kube::Client;
use tracing::{debug, info};

#[cfg(test)]
use mockall::automock;

use etcd_selfhost_common::{
    client_service_name, Error, CLUSTER_LABEL_KEY, DEFAULT_CLIENT_PORT, DEFAULT_PEER_PORT,
    FIELD_MANAGER, MEMBER_LABEL_KEY,
};

/// Data directory inside member Pods
pub const DATA_DIR: &str = "/var/lib/etcd";

/// How a new member joins
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum InitialClusterState {
    /// First member of a cluster created from scratch
    New,
    /// Joining a cluster that already has members
    Existing,
}

impl InitialClusterState {
    fn as_flag(self) -> &'static str {
        match self {
            Self::New => "new",
            Self::Existing => "existing",
        }
    }
}

/// Everything needed to materialize one member on the platform
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct MemberResources {
    /// Owning cluster
    pub cluster: String,
    /// Member name (also the Pod and Service name)
    pub name: String,
    /// Namespace to create resources in
    pub namespace: String,
    /// Container image
    pub image: String,
    /// Advertised client URL
    pub client_url: String,
    /// Advertised peer URL
    pub peer_url: String,
    /// `--initial-cluster` value
    pub initial_cluster: String,
    /// `--initial-cluster-state` value
    pub initial_cluster_state: InitialClusterState,
}

/// Trait abstracting the platform API that hosts members
#[cfg_attr(test, automock)]
#[async_trait]
pub trait Platform: Send + Sync {
    /// Create the member's Pod and Service if they don't exist
    async fn ensure_member(&self, resources: &MemberResources) -> Result<(), Error>;

    /// Delete the member's Pod and Service; missing resources are not an error
    async fn delete_member(&self, name: &str) -> Result<(), Error>;

    /// Whether the member's Pod exists and is running
    async fn member_running(&self, name: &str) -> Result<bool, Error>;

    /// Create the cluster-wide client Service if it doesn't exist
    async fn ensure_client_service(&self, cluster: &str) -> Result<(), Error>;

    /// Delete the cluster-wide client Service
    async fn delete_client_service(&self, cluster: &str) -> Result<(), Error>;

    /// Names of member Pods labelled as belonging to `cluster`
    async fn list_members(&self, cluster: &str) -> Result<Vec<String>, Error>;
}

fn member_labels(cluster: &str, member: &str) -> BTreeMap<String, String> {
    BTreeMap::from([
        (CLUSTER_LABEL_KEY.to_string(), cluster.to_string()),
        (MEMBER_LABEL_KEY.to_string(), member.to_string()),
    ])
}

fn etcd_ports() -> Vec<ServicePort> {
    vec![
        ServicePort {
            name: Some("client".to_string()),
            port: i32::from(DEFAULT_CLIENT_PORT),
            target_port: Some(IntOrString::Int(i32::from(DEFAULT_CLIENT_PORT))),
            ..Default::default()
        },
        ServicePort {
            name: Some("peer".to_string()),
            port: i32::from(DEFAULT_PEER_PORT),
            target_port: Some(IntOrString::Int(i32::from(DEFAULT_PEER_PORT))),
            ..Default::default()
        },
    ]
}

/// Container command line for a member
pub fn etcd_command(resources: &MemberResources) -> Vec<String> {
    vec![
        "/usr/local/bin/etcd".to_string(),
        format!("--name={}", resources.name),
        format!("--data-dir={}", DATA_DIR),
        format!("--listen-client-urls=http://0.0.0.0:{}", DEFAULT_CLIENT_PORT),
        format!("--advertise-client-urls={}", resources.client_url),
        format!("--listen-peer-urls=http://0.0.0.0:{}", DEFAULT_PEER_PORT),
        format!("--initial-advertise-peer-urls={}", resources.peer_url),
        format!("--initial-cluster={}", resources.initial_cluster),
        format!(
            "--initial-cluster-state={}",
            resources.initial_cluster_state.as_flag()
        ),
        format!("--initial-cluster-token={}", resources.cluster),
    ]
}

/// Pod running one etcd member
pub fn build_member_pod(resources: &MemberResources) -> Pod {
    let labels = member_labels(&resources.cluster, &resources.name);
    Pod {
        metadata: ObjectMeta {
            name: Some(resources.name.clone()),
            namespace: Some(resources.namespace.clone()),
            labels: Some(labels),
            ..Default::default()
        },
        spec: Some(PodSpec {
            hostname: Some(resources.name.clone()),
            restart_policy: Some("Always".to_string()),
            containers: vec![Container {
                name: "etcd".to_string(),
                image: Some(resources.image.clone()),
                command: Some(etcd_command(resources)),
                ports: Some(vec![
                    ContainerPort {
                        name: Some("client".to_string()),
                        container_port: i32::from(DEFAULT_CLIENT_PORT),
                        ..Default::default()
                    },
                    ContainerPort {
                        name: Some("peer".to_string()),
                        container_port: i32::from(DEFAULT_PEER_PORT),
                        ..Default::default()
                    },
                ]),
                readiness_probe: Some(Probe {
                    http_get: Some(HTTPGetAction {
                        path: Some("/health".to_string()),
                        port: IntOrString::Int(i32::from(DEFAULT_CLIENT_PORT)),
                        ..Default::default()
                    }),
                    initial_delay_seconds: Some(5),
                    period_seconds: Some(5),
                    ..Default::default()
                }),
                volume_mounts: Some(vec![VolumeMount {
                    name: "data".to_string(),
                    mount_path: DATA_DIR.to_string(),
                    ..Default::default()
                }]),
                ..Default::default()
            }],
            volumes: Some(vec![Volume {
                name: "data".to_string(),
                empty_dir: Some(EmptyDirVolumeSource::default()),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Per-member Service giving the member a stable DNS name.
///
/// Not-ready addresses are published because peers must resolve a joining
/// member before it can ever report healthy.
pub fn build_member_service(resources: &MemberResources) -> Service {
    Service {
        metadata: ObjectMeta {
            name: Some(resources.name.clone()),
            namespace: Some(resources.namespace.clone()),
            labels: Some(member_labels(&resources.cluster, &resources.name)),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(member_labels(&resources.cluster, &resources.name)),
            ports: Some(etcd_ports()),
            publish_not_ready_addresses: Some(true),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Cluster-wide client Service over every ready member
pub fn build_client_service(cluster: &str, namespace: &str) -> Service {
    let selector = BTreeMap::from([(CLUSTER_LABEL_KEY.to_string(), cluster.to_string())]);
    Service {
        metadata: ObjectMeta {
            name: Some(client_service_name(cluster)),
            namespace: Some(namespace.to_string()),
            labels: Some(selector.clone()),
            ..Default::default()
        },
        spec: Some(ServiceSpec {
            selector: Some(selector),
            ports: Some(vec![ServicePort {
                name: Some("client".to_string()),
                port: i32::from(DEFAULT_CLIENT_PORT),
                target_port: Some(IntOrString::Int(i32::from(DEFAULT_CLIENT_PORT))),
                ..Default::default()
            }]),
            ..Default::default()
        }),
        ..Default::default()
    }
}

/// Kubernetes-backed platform for one namespace
#[derive(Clone)]
pub struct KubePlatform {
    client: Client,
    namespace: String,
}

impl KubePlatform {
    /// Manage member resources in `namespace`
    pub fn new(client: Client, namespace: impl Into<String>) -> Self {
        Self {
            client,
            namespace: namespace.into(),
        }
    }

    fn pods(&self) -> Api<Pod> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    fn services(&self) -> Api<Service> {
        Api::namespaced(self.client.clone(), &self.namespace)
    }

    async fn apply_service(&self, service: &Service) -> Result<(), Error> {
        let name = service.metadata.name.as_deref().unwrap_or_default();
        self.services()
            .patch(
                name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(service),
            )
            .await?;
        debug!(service = %name, namespace = %self.namespace, "applied service");
        Ok(())
    }

    async fn delete_service(&self, name: &str) -> Result<(), Error> {
        match self.services().delete(name, &DeleteParams::default()).await {
            Ok(_) => Ok(()),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(service = %name, "service not found (already deleted)");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }
}

#[async_trait]
impl Platform for KubePlatform {
    async fn ensure_member(&self, resources: &MemberResources) -> Result<(), Error> {
        self.apply_service(&build_member_service(resources)).await?;

        if self.pods().get_opt(&resources.name).await?.is_some() {
            debug!(member = %resources.name, "member pod already exists");
            return Ok(());
        }

        self.pods()
            .patch(
                &resources.name,
                &PatchParams::apply(FIELD_MANAGER).force(),
                &Patch::Apply(&build_member_pod(resources)),
            )
            .await?;
        info!(
            cluster = %resources.cluster,
            member = %resources.name,
            namespace = %self.namespace,
            initial_cluster_state = resources.initial_cluster_state.as_flag(),
            "created member pod"
        );
        Ok(())
    }

    async fn delete_member(&self, name: &str) -> Result<(), Error> {
        match self.pods().delete(name, &DeleteParams::default()).await {
            Ok(_) => info!(member = %name, "deleted member pod"),
            Err(kube::Error::Api(ae)) if ae.code == 404 => {
                debug!(member = %name, "member pod not found (already deleted)");
            }
            Err(e) => return Err(e.into()),
        }
        self.delete_service(name).await
    }

    async fn member_running(&self, name: &str) -> Result<bool, Error> {
        let pod = self.pods().get_opt(name).await?;
        Ok(pod
            .and_then(|p| p.status)
            .and_then(|s| s.phase)
            .is_some_and(|phase| phase == "Running"))
    }

    async fn ensure_client_service(&self, cluster: &str) -> Result<(), Error> {
        self.apply_service(&build_client_service(cluster, &self.namespace))
            .await
    }

    async fn delete_client_service(&self, cluster: &str) -> Result<(), Error> {
        self.delete_service(&client_service_name(cluster)).await
    }

    async fn list_members(&self, cluster: &str) -> Result<Vec<String>, Error> {
        let params = ListParams::default().labels(&format!("{}={}", CLUSTER_LABEL_KEY, cluster));
        let pods = self.pods().list(&params).await?;
        Ok(pods
            .items
            .into_iter()
            .filter_map(|p| p.metadata.name)
            .collect())
    }
}
