//! Self-hosted member provisioning
//!
//! Creating a member is two side effects that must stay consistent: an
//! etcd membership add through the existing quorum, then the platform
//! resources the new member runs in. Both are keyed by the member's
//! deterministic name and peer URL, so retrying a creation for the same index
//! finds the half-finished member instead of adding a second one.

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info, warn};

#[cfg(test)]
use mockall::automock;

use etcd_selfhost_common::config::BootstrapConfig;
use etcd_selfhost_common::crd::{Member, MemberRole, MemberState};
use etcd_selfhost_common::{
    cluster_client_url, member_client_url, member_index, member_name, member_peer_url, Error,
};

use crate::etcd::{initial_cluster, EtcdMember, EtcdMembership};
use crate::platform::{InitialClusterState, MemberResources, Platform};
use crate::registry::RegistryView;

/// What a provisioner needs to know about the cluster it works on
#[derive(Clone, Debug)]
pub struct ClusterContext {
    /// Cluster name
    pub name: String,
    /// Namespace member resources live in
    pub namespace: String,
    /// etcd release pinned by the cluster spec
    pub version: Option<String>,
    /// Read-only view of the cluster's registry
    pub registry: RegistryView,
}

impl ClusterContext {
    /// Client endpoints to reach the cluster through.
    ///
    /// Healthy registry members come first; the client Service is the
    /// fallback when the registry is empty (e.g. during teardown).
    pub fn endpoints(&self) -> Vec<String> {
        let mut endpoints = self.registry.healthy_endpoints();
        let service = cluster_client_url(&self.name, &self.namespace);
        if !endpoints.contains(&service) {
            endpoints.push(service);
        }
        endpoints
    }
}

/// Trait abstracting creation and destruction of members
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MemberProvisioner: Send + Sync {
    /// Create self-hosted member `index` and add it to etcd membership.
    ///
    /// Returns the member in state `Joining`. Idempotent per index.
    async fn create_member(&self, ctx: &ClusterContext, index: usize) -> Result<Member, Error>;

    /// Remove `name` from etcd membership and release its platform resources
    async fn destroy_member(&self, ctx: &ClusterContext, name: &str) -> Result<(), Error>;

    /// Whether the platform reports `name` as running
    async fn member_running(&self, ctx: &ClusterContext, name: &str) -> Result<bool, Error>;

    /// Release cluster-wide resources and any member resources left behind.
    ///
    /// Returns the names of leftover members that were cleaned up.
    async fn release_cluster(&self, ctx: &ClusterContext) -> Result<Vec<String>, Error>;
}

/// Provisioner backed by etcd's membership API and a [`Platform`]
pub struct PlatformProvisioner {
    etcd: Arc<dyn EtcdMembership>,
    platform: Arc<dyn Platform>,
    config: BootstrapConfig,
}

impl PlatformProvisioner {
    /// Create a provisioner
    pub fn new(
        etcd: Arc<dyn EtcdMembership>,
        platform: Arc<dyn Platform>,
        config: BootstrapConfig,
    ) -> Self {
        Self {
            etcd,
            platform,
            config,
        }
    }

    /// Find the etcd entry for `name`, if it has one
    async fn lookup(&self, ctx: &ClusterContext, name: &str) -> Result<Option<EtcdMember>, Error> {
        let peer_url = member_peer_url(name, &ctx.namespace);
        let registered_id = ctx
            .registry
            .snapshot()
            .into_iter()
            .find(|m| m.name == name)
            .and_then(|m| m.id);
        let live = self.etcd.list_members(&ctx.endpoints()).await?;
        Ok(live.into_iter().find(|m| {
            registered_id == Some(m.id) || m.name == name || m.peer_urls.contains(&peer_url)
        }))
    }

    fn role_of(&self, ctx: &ClusterContext, name: &str) -> MemberRole {
        ctx.registry
            .snapshot()
            .into_iter()
            .find(|m| m.name == name)
            .map(|m| m.role)
            .unwrap_or_else(|| {
                if member_index(&ctx.name, name).is_some() {
                    MemberRole::SelfHosted
                } else {
                    MemberRole::Boot
                }
            })
    }
}

fn platform_error(ctx: &ClusterContext, member: &str, e: Error) -> Error {
    let retryable = e.is_retryable();
    let message = e.to_string();
    if retryable {
        Error::provisioner(&ctx.name, member, message)
    } else {
        Error::provisioner_permanent(&ctx.name, member, message)
    }
}

#[async_trait]
impl MemberProvisioner for PlatformProvisioner {
    async fn create_member(&self, ctx: &ClusterContext, index: usize) -> Result<Member, Error> {
        let name = member_name(&ctx.name, index);
        let peer_url = member_peer_url(&name, &ctx.namespace);
        let client_url = member_client_url(&name, &ctx.namespace);
        let endpoints = ctx.registry.healthy_endpoints();

        let (id, initial, state) = if endpoints.is_empty() {
            // Seed of a from-scratch cluster; it forms the cluster on start
            debug!(cluster = %ctx.name, member = %name, "provisioning seed member");
            (
                None,
                format!("{}={}", name, peer_url),
                InitialClusterState::New,
            )
        } else {
            let live = self.etcd.list_members(&endpoints).await?;
            match live.iter().find(|m| m.peer_urls.contains(&peer_url)) {
                Some(existing) => {
                    info!(
                        cluster = %ctx.name,
                        member = %name,
                        id = existing.id,
                        "member already in etcd membership, resuming creation"
                    );
                    (
                        Some(existing.id),
                        initial_cluster(&live, existing.id, &name),
                        InitialClusterState::Existing,
                    )
                }
                None => {
                    let added = self
                        .etcd
                        .add_member(&endpoints, std::slice::from_ref(&peer_url))
                        .await?;
                    info!(
                        cluster = %ctx.name,
                        member = %name,
                        id = added.member.id,
                        members = added.members.len(),
                        "added member to etcd membership"
                    );
                    (
                        Some(added.member.id),
                        added.initial_cluster(&name),
                        InitialClusterState::Existing,
                    )
                }
            }
        };

        let resources = MemberResources {
            cluster: ctx.name.clone(),
            name: name.clone(),
            namespace: ctx.namespace.clone(),
            image: self.config.image(ctx.version.as_deref()),
            client_url: client_url.clone(),
            peer_url: peer_url.clone(),
            initial_cluster: initial,
            initial_cluster_state: state,
        };
        self.platform
            .ensure_client_service(&ctx.name)
            .await
            .map_err(|e| platform_error(ctx, &name, e))?;
        self.platform
            .ensure_member(&resources)
            .await
            .map_err(|e| platform_error(ctx, &name, e))?;

        let mut member =
            Member::self_hosted(name, index, client_url, peer_url).with_state(MemberState::Joining);
        member.id = id;
        Ok(member)
    }

    async fn destroy_member(&self, ctx: &ClusterContext, name: &str) -> Result<(), Error> {
        match self.lookup(ctx, name).await? {
            Some(live) => {
                let others: Vec<String> = ctx
                    .endpoints()
                    .into_iter()
                    .filter(|e| !live.client_urls.contains(e))
                    .collect();
                let remaining = self.etcd.remove_member(&others, live.id).await?;
                info!(
                    cluster = %ctx.name,
                    member = %name,
                    id = live.id,
                    remaining = remaining.len(),
                    "removed member from etcd membership"
                );
            }
            None => debug!(cluster = %ctx.name, member = %name, "member not in etcd membership"),
        }

        if self.role_of(ctx, name) == MemberRole::SelfHosted {
            self.platform
                .delete_member(name)
                .await
                .map_err(|e| platform_error(ctx, name, e))?;
        }
        Ok(())
    }

    async fn member_running(&self, ctx: &ClusterContext, name: &str) -> Result<bool, Error> {
        self.platform
            .member_running(name)
            .await
            .map_err(|e| platform_error(ctx, name, e))
    }

    async fn release_cluster(&self, ctx: &ClusterContext) -> Result<Vec<String>, Error> {
        let leftovers = self
            .platform
            .list_members(&ctx.name)
            .await
            .map_err(|e| platform_error(ctx, &ctx.name, e))?;
        for name in &leftovers {
            warn!(cluster = %ctx.name, member = %name, "deleting leftover member resources");
            self.platform
                .delete_member(name)
                .await
                .map_err(|e| platform_error(ctx, name, e))?;
        }
        self.platform
            .delete_client_service(&ctx.name)
            .await
            .map_err(|e| platform_error(ctx, &ctx.name, e))?;
        Ok(leftovers)
    }
}
