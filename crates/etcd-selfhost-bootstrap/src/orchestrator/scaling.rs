//! ScalingOut phase handler.
//!
//! Adds self-hosted members strictly one at a time: quorum check, register,
//! create through the provisioner, wait for health, mark healthy. The next
//! member is not started until the previous one is confirmed, so new members
//! that haven't caught up never outnumber confirmed voters.

use tracing::info;

use etcd_selfhost_common::crd::Member;
use etcd_selfhost_common::quorum::can_add_voter;
use etcd_selfhost_common::retry::retry_if;
use etcd_selfhost_common::{member_client_url, member_name, member_peer_url, Error};

use super::Run;

/// Add members until the target count of healthy self-hosted members is reached
pub(super) async fn scale_out(run: &mut Run<'_>) -> Result<(), Error> {
    let run = &*run;

    if let Some(member) = run.registry.in_flight() {
        let index = member.index.ok_or_else(|| {
            Error::internal_with_context(
                "scaling",
                format!("in-flight member {} has no creation index", member.name),
            )
        })?;
        info!(cluster = %run.cluster, member = %member.name, "finishing interrupted member add");
        join_member(run, index).await?;
    }

    while run.registry.self_hosted_healthy() < run.spec.size {
        let index = run.registry.next_index();
        join_member(run, index).await?;
    }
    Ok(())
}

/// Refuse an add that the currently healthy voters could not absorb
async fn check_quorum_for_add(run: &Run<'_>) -> Result<(), Error> {
    let active = run.registry.active();
    if active.is_empty() {
        return Ok(());
    }
    let healthy = run.live_healthy(&active).await;
    if can_add_voter(healthy, active.len()) {
        return Ok(());
    }
    Err(Error::quorum_unsafe(
        &run.cluster,
        format!("adding a member to {} voters", active.len()),
        healthy,
        active.len(),
    ))
}

async fn join_member(run: &Run<'_>, index: usize) -> Result<(), Error> {
    let name = member_name(&run.cluster, index);
    let namespace = &run.orch.config.namespace;

    if run.registry.get(&name).is_none() {
        check_quorum_for_add(run).await?;
        run.registry.add(Member::self_hosted(
            &name,
            index,
            member_client_url(&name, namespace),
            member_peer_url(&name, namespace),
        ))?;
    }

    let ctx = run.ctx();
    let provisioner = &run.orch.provisioner;
    let created = retry_if(
        &run.config().retry,
        "create_member",
        |e: &Error| e.is_retryable(),
        || provisioner.create_member(&ctx, index),
    )
    .await?;

    run.registry.mark_joining(&name, created.id)?;
    info!(cluster = %run.cluster, member = %name, id = ?created.id, "member joining");
    run.report(Some(format!("member {} joining", name))).await;

    run.wait_healthy(&created, run.config().member_ready_timeout)
        .await?;

    if created.id.is_none() {
        let endpoints: Vec<String> = created.client_urls.clone();
        let live = run.orch.etcd.list_members(&endpoints).await?;
        if let Some(started) = live.iter().find(|m| m.name == name) {
            run.registry.record_id(&name, started.id)?;
        }
    }

    run.registry.mark_healthy(&name)?;
    info!(
        cluster = %run.cluster,
        member = %name,
        self_hosted_healthy = run.registry.self_hosted_healthy(),
        target = run.spec.size,
        "member healthy"
    );
    run.report(Some(format!("member {} healthy", name))).await;
    Ok(())
}
