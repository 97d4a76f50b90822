//! Boot member adapter
//!
//! Wraps the externally started single-node etcd a cluster is migrated off.
//! The adapter is built from the cluster spec and is absent when the spec
//! has no boot endpoint, which is how the from-scratch path is signalled.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use etcd_selfhost_common::crd::{EtcdClusterSpec, Member};
use etcd_selfhost_common::{member_index, Error};

use crate::etcd::{EtcdMember, EtcdMembership};
use crate::probe::{probe_with_timeout, HealthProbe, MemberEndpoint};

/// Name used for the boot member when etcd reports none
pub const DEFAULT_BOOT_MEMBER_NAME: &str = "boot";

/// The externally started member a cluster is migrated off
pub struct BootMemberAdapter {
    endpoint: String,
    probe: Arc<dyn HealthProbe>,
}

impl BootMemberAdapter {
    /// Adapter for the boot member at `endpoint`
    pub fn new(endpoint: impl Into<String>, probe: Arc<dyn HealthProbe>) -> Self {
        Self {
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            probe,
        }
    }

    /// Adapter for the spec's boot member, or `None` for a from-scratch cluster
    pub fn from_spec(spec: &EtcdClusterSpec, probe: Arc<dyn HealthProbe>) -> Option<Self> {
        spec.boot_member_endpoint()
            .map(|endpoint| Self::new(endpoint, probe))
    }

    /// Client URL of the boot member
    pub fn endpoint(&self) -> &str {
        &self.endpoint
    }

    /// Look up the boot member's etcd identity and wrap it as a registry member.
    ///
    /// Also returns the full membership as the boot member reports it.
    pub async fn discover(
        &self,
        cluster: &str,
        etcd: &dyn EtcdMembership,
    ) -> Result<(Member, Vec<EtcdMember>), Error> {
        let members = etcd
            .list_members(&[self.endpoint.clone()])
            .await
            .map_err(|e| self.unreachable(e))?;
        let boot = identify_boot(cluster, &self.endpoint, &members).ok_or_else(|| {
            Error::internal_with_context(
                "boot_member",
                format!(
                    "cannot tell which of {} members behind {} is the boot member",
                    members.len(),
                    self.endpoint
                ),
            )
        })?;

        let name = if boot.name.is_empty() {
            DEFAULT_BOOT_MEMBER_NAME.to_string()
        } else {
            boot.name.clone()
        };
        let client_urls = if boot.client_urls.is_empty() {
            vec![self.endpoint.clone()]
        } else {
            boot.client_urls.clone()
        };
        debug!(cluster, member = %name, id = boot.id, "identified boot member");
        let member = Member::boot(name, boot.id, client_urls, boot.peer_urls.clone());
        Ok((member, members))
    }

    fn unreachable(&self, e: Error) -> Error {
        match e {
            Error::BootMemberUnreachable { .. } => e,
            other => Error::boot_unreachable(&self.endpoint, other.to_string()),
        }
    }
}

#[async_trait]
impl MemberEndpoint for BootMemberAdapter {
    fn name(&self) -> &str {
        DEFAULT_BOOT_MEMBER_NAME
    }

    fn client_url(&self) -> &str {
        &self.endpoint
    }

    /// Any failure to get an answer is `BootMemberUnreachable`
    async fn probe(&self, timeout: Duration) -> Result<bool, Error> {
        let report = probe_with_timeout(self.probe.as_ref(), &self.endpoint, timeout)
            .await
            .map_err(|e| self.unreachable(e))?;
        Ok(report.healthy)
    }
}

/// Pick the boot member out of a member list seen through its endpoint.
///
/// A member advertising `endpoint` wins. Otherwise the boot member is the
/// only member that isn't one of `cluster`'s own self-hosted members.
pub fn identify_boot<'a>(
    cluster: &str,
    endpoint: &str,
    members: &'a [EtcdMember],
) -> Option<&'a EtcdMember> {
    let endpoint = endpoint.trim_end_matches('/');
    if let Some(m) = members.iter().find(|m| {
        m.client_urls
            .iter()
            .any(|url| url.trim_end_matches('/') == endpoint)
    }) {
        return Some(m);
    }

    let mut foreign = members
        .iter()
        .filter(|m| m.is_started() && member_index(cluster, &m.name).is_none());
    match (foreign.next(), foreign.next()) {
        (Some(m), None) => Some(m),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    use crate::etcd::MockEtcdMembership;
    use crate::probe::{MockHealthProbe, ProbeReport};

    fn etcd_member(id: u64, name: &str, client: &str) -> EtcdMember {
        EtcdMember {
            id,
            name: name.to_string(),
            peer_urls: vec![format!("http://{}:2380", name)],
            client_urls: if client.is_empty() {
                vec![]
            } else {
                vec![client.to_string()]
            },
        }
    }

    #[test]
    fn test_from_spec_without_boot_endpoint_is_none() {
        let probe: Arc<dyn HealthProbe> = Arc::new(MockHealthProbe::new());
        assert!(BootMemberAdapter::from_spec(&EtcdClusterSpec::new(3), probe.clone()).is_none());

        let spec = EtcdClusterSpec::with_boot_member(3, "http://10.0.0.5:2379/");
        let adapter = BootMemberAdapter::from_spec(&spec, probe).unwrap();
        assert_eq!(adapter.endpoint(), "http://10.0.0.5:2379");
    }

    #[tokio::test]
    async fn test_probe_failure_is_boot_member_unreachable() {
        let mut probe = MockHealthProbe::new();
        probe
            .expect_probe()
            .returning(|endpoint| Err(Error::transient(endpoint, "connection refused")));
        let adapter = BootMemberAdapter::new("http://10.0.0.5:2379", Arc::new(probe));

        let err = adapter.probe(Duration::from_secs(1)).await.unwrap_err();
        assert!(matches!(
            err,
            Error::BootMemberUnreachable { ref endpoint, .. } if endpoint == "http://10.0.0.5:2379"
        ));
    }

    #[tokio::test]
    async fn test_probe_reports_readiness() {
        let mut probe = MockHealthProbe::new();
        probe
            .expect_probe()
            .returning(|_| Ok(ProbeReport::healthy(1)));
        let adapter = BootMemberAdapter::new("http://10.0.0.5:2379", Arc::new(probe));
        assert!(adapter.probe(Duration::from_secs(1)).await.unwrap());
        assert_eq!(adapter.client_url(), "http://10.0.0.5:2379");
    }

    #[test]
    fn test_identify_boot_by_advertised_client_url() {
        let members = vec![
            etcd_member(1, "etcd-0000", "http://etcd-0000.ns.svc:2379"),
            etcd_member(2, "default", "http://10.0.0.5:2379/"),
        ];
        let boot = identify_boot("etcd", "http://10.0.0.5:2379", &members).unwrap();
        assert_eq!(boot.id, 2);
    }

    #[test]
    fn test_identify_boot_by_elimination() {
        let members = vec![
            etcd_member(1, "etcd-0000", "http://etcd-0000.ns.svc:2379"),
            etcd_member(2, "default", "http://192.168.1.5:2379"),
            etcd_member(3, "", ""),
        ];
        let boot = identify_boot("etcd", "http://boot.example:2379", &members).unwrap();
        assert_eq!(boot.name, "default");
    }

    #[test]
    fn test_identify_boot_ambiguous() {
        let members = vec![
            etcd_member(1, "a", "http://a:2379"),
            etcd_member(2, "b", "http://b:2379"),
        ];
        assert!(identify_boot("etcd", "http://c:2379", &members).is_none());
    }

    #[tokio::test]
    async fn test_discover_builds_healthy_boot_member() {
        let mut etcd = MockEtcdMembership::new();
        etcd.expect_list_members()
            .times(1)
            .returning(|_| Ok(vec![etcd_member(42, "default", "http://10.0.0.5:2379")]));
        let adapter = BootMemberAdapter::new("http://10.0.0.5:2379", Arc::new(MockHealthProbe::new()));

        let (member, live) = adapter.discover("etcd", &etcd).await.unwrap();
        assert_eq!(live.len(), 1);
        assert!(member.is_boot());
        assert_eq!(member.name, "default");
        assert_eq!(member.id, Some(42));
        assert_eq!(member.client_url(), Some("http://10.0.0.5:2379"));
    }

    #[tokio::test]
    async fn test_discover_unreachable() {
        let mut etcd = MockEtcdMembership::new();
        etcd.expect_list_members()
            .returning(|_| Err(Error::transient("http://10.0.0.5:2379", "timed out")));
        let adapter = BootMemberAdapter::new("http://10.0.0.5:2379", Arc::new(MockHealthProbe::new()));

        let err = adapter.discover("etcd", &etcd).await.unwrap_err();
        assert!(matches!(err, Error::BootMemberUnreachable { .. }));
    }
}
