//! Majority arithmetic for membership changes
//!
//! These mirror the checks etcd applies under `--strict-reconfig-check`, so
//! the orchestrator refuses a change before etcd would, and refuses the
//! boot-member removal that etcd would happily accept.

/// Minimum number of voters that must agree for a cluster of `total` voters
pub fn quorum(total: usize) -> usize {
    total / 2 + 1
}

/// Whether adding one voter to a cluster of `total` voters, of which `healthy`
/// are started and reachable, keeps the cluster able to commit.
///
/// After the add the new member is not yet started, so the existing healthy
/// voters alone must reach the quorum of the enlarged cluster. Growing a
/// single seed member to two is the one exception etcd permits: the cluster
/// is briefly unable to commit until the second member starts.
pub fn can_add_voter(healthy: usize, total: usize) -> bool {
    if total == 1 && healthy == 1 {
        return true;
    }
    healthy >= quorum(total + 1)
}

/// Whether removing one voter leaves a majority of the pre-removal total.
///
/// `healthy_remaining` counts healthy voters excluding the one being removed.
pub fn can_remove_voter(healthy_remaining: usize, total: usize) -> bool {
    total > 1 && healthy_remaining >= quorum(total)
}
