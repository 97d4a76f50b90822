//! AdoptingBoot phase handler.
//!
//! Waits for the externally started boot member to answer, then registers it
//! as the first member. Probes back off exponentially inside the adoption
//! budget; once the budget is spent the boot member is reported unreachable.

use tracing::{info, warn};

use etcd_selfhost_common::retry::{retry_if, RetryConfig};
use etcd_selfhost_common::Error;

use super::Run;
use crate::etcd::EtcdMember;
use crate::probe::MemberEndpoint;

/// Adopt the boot member, returning membership as the boot member sees it
pub(super) async fn adopt(run: &Run<'_>) -> Result<Vec<EtcdMember>, Error> {
    let boot = run.boot.as_ref().ok_or_else(|| {
        Error::internal_with_context("adopting", format!("{} has no boot member", run.cluster))
    })?;
    let budget = run.config().adopt_timeout;
    let probe_timeout = run.config().probe_timeout;
    let retry = RetryConfig {
        max_attempts: 0,
        max_elapsed: Some(budget),
        ..run.config().retry.clone()
    };

    let attempts = retry_if(
        &retry,
        "adopt_boot",
        |e: &Error| matches!(e, Error::BootMemberUnreachable { .. }) || e.is_retryable(),
        || async move {
            if boot.probe(probe_timeout).await? {
                Ok(())
            } else {
                Err(Error::boot_unreachable(
                    boot.endpoint(),
                    "boot member reports unhealthy",
                ))
            }
        },
    );
    match tokio::time::timeout(budget, attempts).await {
        Ok(result) => result?,
        Err(_) => {
            warn!(cluster = %run.cluster, endpoint = %boot.endpoint(), "boot member never answered");
            return Err(Error::boot_unreachable(
                boot.endpoint(),
                format!("no healthy answer within {}s", budget.as_secs()),
            ));
        }
    }

    let (member, live) = boot.discover(&run.cluster, run.orch.etcd.as_ref()).await?;
    info!(
        cluster = %run.cluster,
        member = %member.name,
        id = ?member.id,
        live_members = live.len(),
        "adopted boot member"
    );
    run.registry.add(member)?;
    Ok(live)
}
