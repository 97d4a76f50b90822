//! Member health probing
//!
//! [`HealthProbe`] asks a single etcd endpoint whether it is serving and how
//! many members it sees. [`MemberEndpoint`] is the capability every member
//! exposes to the orchestrator regardless of where it came from: the boot
//! member adapter and provisioned self-hosted members both implement it, so
//! "wait until healthy" is written once.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

#[cfg(test)]
use mockall::automock;

use etcd_selfhost_common::crd::Member;
use etcd_selfhost_common::Error;

/// Result of probing one etcd endpoint
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ProbeReport {
    /// Whether the endpoint reports itself healthy
    pub healthy: bool,
    /// Member count the endpoint reports (0 when unhealthy)
    pub member_count: usize,
}

impl ProbeReport {
    /// A healthy endpoint that sees `member_count` members
    pub fn healthy(member_count: usize) -> Self {
        Self {
            healthy: true,
            member_count,
        }
    }

    /// An endpoint that answered but is not serving
    pub fn unhealthy() -> Self {
        Self {
            healthy: false,
            member_count: 0,
        }
    }
}

/// Trait abstracting etcd health checks
#[cfg_attr(test, automock)]
#[async_trait]
pub trait HealthProbe: Send + Sync {
    /// Probe a client endpoint for readiness and cluster size
    async fn probe(&self, endpoint: &str) -> Result<ProbeReport, Error>;
}

/// Probe `endpoint`, giving up after `timeout`.
///
/// The in-flight request is dropped when the timeout fires, so a hung
/// endpoint never outlives the caller's budget.
pub async fn probe_with_timeout(
    probe: &dyn HealthProbe,
    endpoint: &str,
    timeout: Duration,
) -> Result<ProbeReport, Error> {
    match tokio::time::timeout(timeout, probe.probe(endpoint)).await {
        Ok(result) => result,
        Err(_) => Err(Error::transient(
            endpoint,
            format!("probe timed out after {}ms", timeout.as_millis()),
        )),
    }
}

/// Minimal capability set shared by boot and self-hosted members
#[async_trait]
pub trait MemberEndpoint: Send + Sync {
    /// Member name
    fn name(&self) -> &str;

    /// Client URL the member is probed on
    fn client_url(&self) -> &str;

    /// Whether the member is serving, bounded by `timeout`
    async fn probe(&self, timeout: Duration) -> Result<bool, Error>;
}

/// A self-hosted member paired with the probe used to check it
pub struct ProvisionedMember {
    member: Member,
    client_url: String,
    probe: Arc<dyn HealthProbe>,
}

impl ProvisionedMember {
    /// Wrap a provisioned member; fails if it has no client URL to probe
    pub fn new(member: Member, probe: Arc<dyn HealthProbe>) -> Result<Self, Error> {
        let client_url = member
            .client_url()
            .ok_or_else(|| {
                Error::internal_with_context(
                    "probe",
                    format!("member {} has no client URL", member.name),
                )
            })?
            .to_string();
        Ok(Self {
            member,
            client_url,
            probe,
        })
    }
}

#[async_trait]
impl MemberEndpoint for ProvisionedMember {
    fn name(&self) -> &str {
        &self.member.name
    }

    fn client_url(&self) -> &str {
        &self.client_url
    }

    async fn probe(&self, timeout: Duration) -> Result<bool, Error> {
        let report = probe_with_timeout(self.probe.as_ref(), &self.client_url, timeout).await?;
        Ok(report.healthy)
    }
}
