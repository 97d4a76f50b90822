//! Deriving the starting phase from live membership
//!
//! No phase marker is persisted. Each bootstrap looks at what etcd reports,
//! rebuilds the registry from it, and picks the phase that membership
//! implies. A crash anywhere therefore resumes at the right step: an add
//! that reached etcd but not the platform is finished rather than repeated,
//! and a boot member that is already gone is not adopted again.

use tracing::{debug, info};

use etcd_selfhost_common::crd::{BootstrapPhase, Member, MemberState};
use etcd_selfhost_common::{
    cluster_client_url, member_client_url, member_index, member_name, member_peer_url, Error,
};

use super::{adopting, Run};
use crate::boot::identify_boot;
use crate::etcd::EtcdMember;
use crate::registry::MembershipRegistry;

/// Phase implied by the registry rebuilt from live membership.
///
/// An unfinished add always resumes `ScalingOut`; otherwise the target is
/// measured in healthy self-hosted members, so a boot member never counts
/// towards it.
pub fn determine_phase(
    size: usize,
    has_boot: bool,
    self_hosted_healthy: usize,
    in_flight: bool,
) -> BootstrapPhase {
    if in_flight || self_hosted_healthy < size {
        BootstrapPhase::ScalingOut
    } else if has_boot {
        BootstrapPhase::RetiringBoot
    } else {
        BootstrapPhase::SelfHosted
    }
}

/// Creation index of a self-hosted member of `cluster`, if `member` is one.
///
/// Started members are recognised by name; members that were added but never
/// started have no name yet and are recognised by their peer URL.
pub(crate) fn self_hosted_index(cluster: &str, namespace: &str, member: &EtcdMember) -> Option<usize> {
    if let Some(index) = member_index(cluster, &member.name) {
        return Some(index);
    }
    member.peer_urls.iter().find_map(|url| {
        let host = url.strip_prefix("http://")?.split('.').next()?;
        let index = member_index(cluster, host)?;
        (member_peer_url(host, namespace) == *url).then_some(index)
    })
}

/// Adopt the boot member if it still matters, seed the registry, and return
/// the phase to continue from.
pub(super) async fn resume(run: &mut Run<'_>) -> Result<BootstrapPhase, Error> {
    let mut live = observe_cluster(run).await.unwrap_or_default();

    let boot_endpoint = run.boot.as_ref().map(|b| b.endpoint().to_string());
    if let Some(endpoint) = boot_endpoint {
        if !live.is_empty() && identify_boot(&run.cluster, &endpoint, &live).is_none() {
            info!(
                cluster = %run.cluster,
                endpoint = %endpoint,
                "boot member already retired, skipping adoption"
            );
        } else {
            run.enter(BootstrapPhase::AdoptingBoot).await;
            live = adopting::adopt(run).await?;
        }
    }

    seed(&run.registry, &run.orch.config.namespace, &live)?;
    run.registry.verify_against(&live)?;

    let self_hosted = run.registry.snapshot().iter().filter(|m| !m.is_boot()).count();
    if self_hosted > run.spec.size {
        return Err(oversized(&run.cluster, run.spec.size, self_hosted));
    }

    let phase = determine_phase(
        run.spec.size,
        run.registry.boot().is_some(),
        run.registry.self_hosted_healthy(),
        run.registry.in_flight().is_some(),
    );
    info!(
        cluster = %run.cluster,
        live_members = live.len(),
        phase = %phase,
        "derived bootstrap phase from live membership"
    );
    Ok(phase)
}

/// A cluster that already has more self-hosted members than asked for.
///
/// Scaling down is not a bootstrap operation, so the request is refused
/// rather than reported as converged.
pub(super) fn oversized(cluster: &str, size: usize, found: usize) -> Error {
    Error::validation_for_field(
        cluster,
        "spec.size",
        format!("cluster already has {} self-hosted members, more than size {}", found, size),
    )
}

/// Membership as seen through the cluster's client Service, if it answers
async fn observe_cluster(run: &Run<'_>) -> Option<Vec<EtcdMember>> {
    let url = cluster_client_url(&run.cluster, &run.orch.config.namespace);
    let list = run.orch.etcd.list_members(std::slice::from_ref(&url));
    match tokio::time::timeout(run.config().probe_timeout, list).await {
        Ok(Ok(live)) => Some(live),
        Ok(Err(e)) => {
            debug!(cluster = %run.cluster, error = %e, "cluster client service not answering");
            None
        }
        Err(_) => {
            debug!(cluster = %run.cluster, "cluster client service timed out");
            None
        }
    }
}

/// Register every self-hosted member etcd reports, in creation order.
///
/// Started members are registered healthy; an added-but-unstarted member is
/// registered `Joining` and becomes the in-flight add to finish. Members
/// already in the registry (the adopted boot member) are skipped; anything
/// else is foreign and refused.
fn seed(registry: &MembershipRegistry, namespace: &str, live: &[EtcdMember]) -> Result<(), Error> {
    let cluster = registry.cluster().to_string();
    let known: Vec<u64> = registry.snapshot().iter().filter_map(|m| m.id).collect();

    let mut self_hosted = Vec::new();
    for member in live {
        if known.contains(&member.id) {
            continue;
        }
        match self_hosted_index(&cluster, namespace, member) {
            Some(index) => self_hosted.push((index, member)),
            None => {
                return Err(Error::internal_with_context(
                    "recovery",
                    format!(
                        "member {} ({}) of {} is neither the boot member nor self-hosted",
                        member.id, member.name, cluster
                    ),
                ))
            }
        }
    }
    self_hosted.sort_by_key(|(index, _)| *index);

    for (index, live_member) in self_hosted {
        let name = member_name(&cluster, index);
        let mut member = Member::self_hosted(
            &name,
            index,
            member_client_url(&name, namespace),
            member_peer_url(&name, namespace),
        );
        member.id = Some(live_member.id);
        if live_member.is_started() {
            registry.add(member.with_state(MemberState::Healthy))?;
        } else {
            registry.add(member)?;
            registry.mark_joining(&name, Some(live_member.id))?;
        }
    }
    Ok(())
}
