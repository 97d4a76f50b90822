//! RetiringBoot phase handler.

use tracing::info;

use etcd_selfhost_common::crd::Member;
use etcd_selfhost_common::quorum::can_remove_voter;
use etcd_selfhost_common::retry::{retry_if, RetryConfig};
use etcd_selfhost_common::Error;

use super::Run;

/// Remove the boot member once the self-hosted members hold a majority without it
pub(super) async fn retire_boot(run: &Run<'_>) -> Result<(), Error> {
    let Some(boot) = run.registry.boot() else {
        return Ok(());
    };

    let active = run.registry.active();
    let self_hosted: Vec<Member> = active.iter().filter(|m| !m.is_boot()).cloned().collect();
    let healthy = run.live_healthy(&self_hosted).await;
    if !can_remove_voter(healthy, active.len()) {
        return Err(Error::quorum_unsafe(
            &run.cluster,
            format!("removing boot member {}", boot.name),
            healthy,
            active.len(),
        ));
    }

    run.registry.mark_removing(&boot.name)?;
    run.report(Some(format!("removing boot member {}", boot.name)))
        .await;

    let ctx = run.ctx();
    let provisioner = &run.orch.provisioner;
    let budget = run.config().retire_timeout;
    let retry = RetryConfig {
        max_elapsed: Some(budget),
        ..run.config().retry.clone()
    };
    let removal = retry_if(
        &retry,
        "destroy_boot_member",
        |e: &Error| e.is_retryable(),
        || provisioner.destroy_member(&ctx, &boot.name),
    );
    match tokio::time::timeout(budget, removal).await {
        Ok(result) => result?,
        Err(_) => return Err(Error::deadline(&run.cluster, "retire_boot", budget)),
    }

    run.registry.remove(&boot.name)?;
    info!(
        cluster = %run.cluster,
        member = %boot.name,
        remaining = run.registry.active().len(),
        "boot member retired"
    );
    Ok(())
}
