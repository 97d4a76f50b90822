//! Common types for the self-hosted etcd bootstrap: CRDs, errors, and utilities

#![deny(missing_docs)]

pub mod config;
pub mod crd;
pub mod error;
pub mod poll;
pub mod quorum;
pub mod retry;
pub mod telemetry;

pub use error::{Error, ResultCode};

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Port etcd serves clients on
pub const DEFAULT_CLIENT_PORT: u16 = 2379;

/// Port etcd members use for peer (Raft) traffic
pub const DEFAULT_PEER_PORT: u16 = 2380;

/// Default etcd release used for self-hosted members
pub const DEFAULT_ETCD_VERSION: &str = "3.5.17";

/// Container image repository for self-hosted members
pub const ETCD_IMAGE_REPOSITORY: &str = "quay.io/coreos/etcd";

/// Field manager used for server-side apply and status patches
pub const FIELD_MANAGER: &str = "etcd-selfhost-operator";

/// Label key carrying the owning cluster name on member resources
pub const CLUSTER_LABEL_KEY: &str = "etcd.selfhost.dev/cluster";

/// Label key carrying the member name on member resources
pub const MEMBER_LABEL_KEY: &str = "etcd.selfhost.dev/member";

/// Longest cluster name that still leaves room for the member suffix
/// inside a 63 character DNS label.
pub const MAX_CLUSTER_NAME_LEN: usize = 50;

/// Name of self-hosted member `index` of `cluster`.
///
/// Names are deterministic so that retrying a creation with the same index
/// converges on the same member instead of producing a second one.
pub fn member_name(cluster: &str, index: usize) -> String {
    format!("{}-{:04}", cluster, index)
}

/// Parse the creation index back out of a member name produced by [`member_name`]
pub fn member_index(cluster: &str, name: &str) -> Option<usize> {
    name.strip_prefix(cluster)?
        .strip_prefix('-')
        .filter(|suffix| suffix.len() == 4)?
        .parse()
        .ok()
}

/// Peer URL for a self-hosted member, addressed through its own Service
pub fn member_peer_url(name: &str, namespace: &str) -> String {
    format!("http://{}.{}.svc:{}", name, namespace, DEFAULT_PEER_PORT)
}

/// Client URL for a self-hosted member, addressed through its own Service
pub fn member_client_url(name: &str, namespace: &str) -> String {
    format!("http://{}.{}.svc:{}", name, namespace, DEFAULT_CLIENT_PORT)
}

/// Name of the cluster-wide client Service
pub fn client_service_name(cluster: &str) -> String {
    format!("{}-client", cluster)
}

/// Client URL of the cluster-wide client Service
pub fn cluster_client_url(cluster: &str, namespace: &str) -> String {
    format!(
        "http://{}.{}.svc:{}",
        client_service_name(cluster),
        namespace,
        DEFAULT_CLIENT_PORT
    )
}
