//! EtcdCluster Custom Resource Definition
//!
//! An EtcdCluster describes a self-hosted etcd cluster: how many members it
//! should have and, optionally, an externally started boot member to migrate
//! from. The spec is immutable once bootstrap begins.

use kube::CustomResource;
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};

use super::types::{BootstrapPhase, Member};
use crate::{Error, MAX_CLUSTER_NAME_LEN};

/// Specification for an EtcdCluster
#[derive(CustomResource, Clone, Debug, Deserialize, Serialize, JsonSchema, PartialEq)]
#[kube(
    group = "etcd.selfhost.dev",
    version = "v1alpha1",
    kind = "EtcdCluster",
    plural = "etcdclusters",
    shortname = "etcd",
    status = "EtcdClusterStatus",
    namespaced,
    printcolumn = r#"{"name":"Size","type":"integer","jsonPath":".spec.size"}"#,
    printcolumn = r#"{"name":"Phase","type":"string","jsonPath":".status.phase"}"#,
    printcolumn = r#"{"name":"Age","type":"date","jsonPath":".metadata.creationTimestamp"}"#
)]
#[serde(rename_all = "camelCase")]
pub struct EtcdClusterSpec {
    /// Target number of members
    pub size: usize,

    /// etcd release for self-hosted members (defaults to the operator's pinned release)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,

    /// Self-hosting policy
    ///
    /// Absent or without a boot member endpoint, every member is created
    /// self-hosted from scratch. With a boot member endpoint, the cluster is
    /// migrated off that member.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_hosted: Option<SelfHostedPolicy>,
}

/// Self-hosting policy for an EtcdCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct SelfHostedPolicy {
    /// Client URL of an externally started single-node etcd to migrate from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub boot_member_client_endpoint: Option<String>,
}

impl EtcdClusterSpec {
    /// Spec for a cluster created from scratch
    pub fn new(size: usize) -> Self {
        Self {
            size,
            version: None,
            self_hosted: Some(SelfHostedPolicy::default()),
        }
    }

    /// Spec for a cluster migrated from a boot member
    pub fn with_boot_member(size: usize, endpoint: impl Into<String>) -> Self {
        Self {
            size,
            version: None,
            self_hosted: Some(SelfHostedPolicy {
                boot_member_client_endpoint: Some(endpoint.into()),
            }),
        }
    }

    /// Client endpoint of the boot member, if this is a migration
    pub fn boot_member_endpoint(&self) -> Option<&str> {
        self.self_hosted
            .as_ref()
            .and_then(|p| p.boot_member_client_endpoint.as_deref())
            .filter(|e| !e.is_empty())
    }

    /// Validate the cluster specification
    pub fn validate(&self, cluster: &str) -> Result<(), Error> {
        validate_cluster_name(cluster)?;

        if self.size == 0 {
            return Err(Error::validation_for_field(
                cluster,
                "spec.size",
                "size must be at least 1",
            ));
        }

        if let Some(endpoint) = self.boot_member_endpoint() {
            validate_endpoint(endpoint).map_err(|msg| {
                Error::validation_for_field(
                    cluster,
                    "spec.selfHosted.bootMemberClientEndpoint",
                    msg,
                )
            })?;
        }

        Ok(())
    }
}

/// Cluster names become Service and Pod name prefixes, so they must be
/// DNS-1035 labels with room for the member suffix.
fn validate_cluster_name(name: &str) -> Result<(), Error> {
    if name.is_empty() || name.len() > MAX_CLUSTER_NAME_LEN {
        return Err(Error::validation_for(
            name,
            format!("cluster name must be 1-{} characters", MAX_CLUSTER_NAME_LEN),
        ));
    }
    let starts_alpha = name.starts_with(|c: char| c.is_ascii_lowercase());
    let ends_alnum = name.ends_with(|c: char| c.is_ascii_lowercase() || c.is_ascii_digit());
    let charset_ok = name
        .chars()
        .all(|c| c.is_ascii_lowercase() || c.is_ascii_digit() || c == '-');
    if !(starts_alpha && ends_alnum && charset_ok) {
        return Err(Error::validation_for(
            name,
            "cluster name must be a lowercase DNS label starting with a letter",
        ));
    }
    Ok(())
}

fn validate_endpoint(endpoint: &str) -> Result<(), String> {
    let rest = endpoint
        .strip_prefix("http://")
        .or_else(|| endpoint.strip_prefix("https://"))
        .ok_or_else(|| format!("'{}' must start with http:// or https://", endpoint))?;
    let authority = rest.split('/').next().unwrap_or_default();
    let (host, port) = authority
        .rsplit_once(':')
        .ok_or_else(|| format!("'{}' must include a port", endpoint))?;
    if host.is_empty() {
        return Err(format!("'{}' has an empty host", endpoint));
    }
    port.parse::<u16>()
        .map_err(|_| format!("'{}' has an invalid port '{}'", endpoint, port))?;
    Ok(())
}

/// Status for an EtcdCluster
#[derive(Clone, Debug, Default, Deserialize, Serialize, JsonSchema, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct EtcdClusterStatus {
    /// Current bootstrap phase
    #[serde(default)]
    pub phase: BootstrapPhase,

    /// Human-readable message about the current phase
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,

    /// Registry snapshot in join order
    #[serde(default)]
    pub members: Vec<Member>,

    /// The generation of the spec that was last processed by the controller
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub observed_generation: Option<i64>,

    /// When the phase last changed (RFC 3339)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_transition_time: Option<String>,
}

impl EtcdClusterStatus {
    /// Build a status for the given phase, stamped with the current time
    pub fn with_phase(phase: BootstrapPhase) -> Self {
        Self {
            phase,
            last_transition_time: Some(chrono::Utc::now().to_rfc3339()),
            ..Default::default()
        }
    }

    /// Attach a message
    pub fn message(mut self, message: impl Into<String>) -> Self {
        self.message = Some(message.into());
        self
    }

    /// Attach the registry snapshot
    pub fn members(mut self, members: Vec<Member>) -> Self {
        self.members = members;
        self
    }
}
