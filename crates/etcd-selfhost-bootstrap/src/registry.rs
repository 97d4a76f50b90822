//! Membership registry
//!
//! The registry is the orchestrator's ordered view of a cluster's members:
//! insertion order is join order, and the boot member (when there is one) is
//! always first. It caches etcd's own membership rather than competing with
//! it, and [`MembershipRegistry::verify_against`] checks that the two still
//! agree by majority.
//!
//! Only the orchestrator for a cluster holds a [`MembershipRegistry`]; every
//! other reader gets a [`RegistryView`], which only hands out owned
//! snapshots. Each mutation happens under a single write lock, so a reader
//! never sees a member half-way through a transition.

use std::sync::Arc;

use parking_lot::RwLock;
use tracing::{debug, info};

use etcd_selfhost_common::crd::{Member, MemberRole, MemberState};
use etcd_selfhost_common::quorum::quorum;
use etcd_selfhost_common::Error;

use crate::etcd::EtcdMember;

/// Ordered, concurrently readable membership of one cluster
#[derive(Debug)]
pub struct MembershipRegistry {
    cluster: String,
    members: Arc<RwLock<Vec<Member>>>,
}

impl MembershipRegistry {
    /// Create an empty registry for `cluster`
    pub fn new(cluster: impl Into<String>) -> Self {
        Self {
            cluster: cluster.into(),
            members: Arc::new(RwLock::new(Vec::new())),
        }
    }

    /// Cluster this registry tracks
    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// Read-only handle for status reporters and waiters
    pub fn view(&self) -> RegistryView {
        RegistryView {
            cluster: self.cluster.clone(),
            members: Arc::clone(&self.members),
        }
    }

    /// Register a member at the end of the join order.
    ///
    /// Fails with `DuplicateName` if the name is taken, and with
    /// `QuorumUnsafe` if `member` would be a second membership change in
    /// flight.
    pub fn add(&self, member: Member) -> Result<(), Error> {
        let mut members = self.members.write();
        if members.iter().any(|m| m.name == member.name) {
            return Err(Error::duplicate(&member.name));
        }
        if member.state.is_in_flight() {
            if let Some(in_flight) = members.iter().find(|m| m.state.is_in_flight()) {
                let healthy = count_state(&members, MemberState::Healthy);
                return Err(Error::quorum_unsafe(
                    &self.cluster,
                    format!(
                        "cannot add {} while {} is still {}",
                        member.name, in_flight.name, in_flight.state
                    ),
                    healthy,
                    members.len(),
                ));
            }
        }
        debug!(
            cluster = %self.cluster,
            member = %member.name,
            role = %member.role,
            state = %member.state,
            "registered member"
        );
        members.push(member);
        Ok(())
    }

    /// Record that `name` was added to etcd membership.
    ///
    /// `id` is `None` for the seed member of a from-scratch cluster, which
    /// only gets an etcd ID once it starts.
    pub fn mark_joining(&self, name: &str, id: Option<u64>) -> Result<Member, Error> {
        self.transition(name, |m| {
            if m.state != MemberState::Pending && m.state != MemberState::Joining {
                return Err(invalid_transition(m, MemberState::Joining));
            }
            if id.is_some() {
                m.id = id;
            }
            m.state = MemberState::Joining;
            Ok(())
        })
    }

    /// Record the etcd ID of a member that didn't have one yet
    pub fn record_id(&self, name: &str, id: u64) -> Result<Member, Error> {
        self.transition(name, |m| {
            m.id = Some(id);
            Ok(())
        })
    }

    /// Record that `name` started and answers health probes
    pub fn mark_healthy(&self, name: &str) -> Result<Member, Error> {
        self.transition(name, |m| match m.state {
            MemberState::Joining | MemberState::Healthy => {
                m.state = MemberState::Healthy;
                Ok(())
            }
            _ => Err(invalid_transition(m, MemberState::Healthy)),
        })
    }

    /// Record that `name` is being removed from etcd membership
    pub fn mark_removing(&self, name: &str) -> Result<Member, Error> {
        self.transition(name, |m| {
            if m.state == MemberState::Removed {
                return Err(invalid_transition(m, MemberState::Removing));
            }
            m.state = MemberState::Removing;
            Ok(())
        })
    }

    /// Drop `name` from the registry, returning it in state `Removed`
    pub fn remove(&self, name: &str) -> Result<Member, Error> {
        let mut members = self.members.write();
        let pos = members
            .iter()
            .position(|m| m.name == name)
            .ok_or_else(|| Error::not_found(name))?;
        let mut member = members.remove(pos);
        member.state = MemberState::Removed;
        info!(cluster = %self.cluster, member = %name, "member removed from registry");
        Ok(member)
    }

    /// Copy of a single member
    pub fn get(&self, name: &str) -> Option<Member> {
        self.members.read().iter().find(|m| m.name == name).cloned()
    }

    /// Copy of every member in join order
    pub fn snapshot(&self) -> Vec<Member> {
        self.members.read().clone()
    }

    /// Members in `Joining` or `Healthy`, in join order
    pub fn active(&self) -> Vec<Member> {
        self.members
            .read()
            .iter()
            .filter(|m| m.state.is_active())
            .cloned()
            .collect()
    }

    /// The registered boot member, if any
    pub fn boot(&self) -> Option<Member> {
        self.members.read().iter().find(|m| m.is_boot()).cloned()
    }

    /// The member with a membership change in flight, if any
    pub fn in_flight(&self) -> Option<Member> {
        self.members
            .read()
            .iter()
            .find(|m| m.state.is_in_flight())
            .cloned()
    }

    /// Number of healthy self-hosted members
    pub fn self_hosted_healthy(&self) -> usize {
        self.members
            .read()
            .iter()
            .filter(|m| m.role == MemberRole::SelfHosted && m.state == MemberState::Healthy)
            .count()
    }

    /// Client URLs of healthy members, boot member first
    pub fn healthy_endpoints(&self) -> Vec<String> {
        healthy_endpoints(&self.members.read())
    }

    /// Creation index for the next self-hosted member
    pub fn next_index(&self) -> usize {
        self.members
            .read()
            .iter()
            .filter_map(|m| m.index)
            .max()
            .map_or(0, |i| i + 1)
    }

    /// Check that the active registry members agree with etcd by majority.
    ///
    /// Agreement means an active member's etcd ID appears in `live`. The
    /// agreeing members must form a majority of whichever view is larger.
    pub fn verify_against(&self, live: &[EtcdMember]) -> Result<(), Error> {
        let members = self.members.read();
        let active: Vec<&Member> = members.iter().filter(|m| m.state.is_active()).collect();
        let agreeing = active
            .iter()
            .filter(|m| m.id.is_some_and(|id| live.iter().any(|l| l.id == id)))
            .count();
        let total = active.len().max(live.len());
        if total == 0 || agreeing >= quorum(total) {
            return Ok(());
        }
        Err(Error::internal_with_context(
            "registry",
            format!(
                "registry for {} disagrees with etcd: {} of {} active members confirmed, etcd reports {}",
                self.cluster,
                agreeing,
                active.len(),
                live.len()
            ),
        ))
    }

    fn transition<F>(&self, name: &str, apply: F) -> Result<Member, Error>
    where
        F: FnOnce(&mut Member) -> Result<(), Error>,
    {
        let mut members = self.members.write();
        let member = members
            .iter_mut()
            .find(|m| m.name == name)
            .ok_or_else(|| Error::not_found(name))?;
        let from = member.state;
        apply(member)?;
        debug!(
            cluster = %self.cluster,
            member = %name,
            from = %from,
            to = %member.state,
            "member state changed"
        );
        Ok(member.clone())
    }
}

/// Read-only handle on a cluster's registry
///
/// Every accessor returns owned copies taken under the read lock.
#[derive(Clone, Debug)]
pub struct RegistryView {
    cluster: String,
    members: Arc<RwLock<Vec<Member>>>,
}

impl RegistryView {
    /// Cluster this view observes
    pub fn cluster(&self) -> &str {
        &self.cluster
    }

    /// Copy of every member in join order
    pub fn snapshot(&self) -> Vec<Member> {
        self.members.read().clone()
    }

    /// Client URLs of healthy members, boot member first
    pub fn healthy_endpoints(&self) -> Vec<String> {
        healthy_endpoints(&self.members.read())
    }
}

fn count_state(members: &[Member], state: MemberState) -> usize {
    members.iter().filter(|m| m.state == state).count()
}

fn healthy_endpoints(members: &[Member]) -> Vec<String> {
    members
        .iter()
        .filter(|m| m.state == MemberState::Healthy)
        .filter_map(|m| m.client_url().map(str::to_string))
        .collect()
}

fn invalid_transition(member: &Member, to: MemberState) -> Error {
    Error::internal_with_context(
        "registry",
        format!(
            "member {} cannot move from {} to {}",
            member.name, member.state, to
        ),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pending(index: usize) -> Member {
        let name = format!("etcd-{:04}", index);
        Member::self_hosted(
            &name,
            index,
            format!("http://{}.ns.svc:2379", name),
            format!("http://{}.ns.svc:2380", name),
        )
    }

    fn boot() -> Member {
        Member::boot(
            "default",
            100,
            vec!["http://10.0.0.5:2379".to_string()],
            vec!["http://10.0.0.5:2380".to_string()],
        )
    }

    fn live(id: u64) -> EtcdMember {
        EtcdMember {
            id,
            name: format!("m{}", id),
            ..Default::default()
        }
    }

    #[test]
    fn test_duplicate_name_rejected() {
        let registry = MembershipRegistry::new("etcd");
        registry.add(boot()).unwrap();
        let err = registry.add(boot()).unwrap_err();
        assert!(matches!(err, Error::DuplicateName { ref name } if name == "default"));
    }

    #[test]
    fn test_remove_unknown_is_not_found() {
        let registry = MembershipRegistry::new("etcd");
        let err = registry.remove("etcd-0009").unwrap_err();
        assert!(matches!(err, Error::NotFound { .. }));
    }

    #[test]
    fn test_second_in_flight_member_refused() {
        let registry = MembershipRegistry::new("etcd");
        registry.add(boot()).unwrap();
        registry.add(pending(0)).unwrap();
        registry.mark_joining("etcd-0000", Some(1)).unwrap();

        let err = registry.add(pending(1)).unwrap_err();
        assert!(matches!(err, Error::QuorumUnsafe { .. }));

        registry.mark_healthy("etcd-0000").unwrap();
        registry.add(pending(1)).unwrap();
    }

    #[test]
    fn test_member_lifecycle_in_join_order() {
        let registry = MembershipRegistry::new("etcd");
        registry.add(boot()).unwrap();
        registry.add(pending(0)).unwrap();

        assert_eq!(registry.active().len(), 1, "pending members are not active");

        let joining = registry.mark_joining("etcd-0000", Some(7)).unwrap();
        assert_eq!(joining.state, MemberState::Joining);
        assert_eq!(joining.id, Some(7));
        assert_eq!(registry.active().len(), 2);
        assert_eq!(registry.healthy_endpoints().len(), 1);

        registry.mark_healthy("etcd-0000").unwrap();
        assert_eq!(registry.self_hosted_healthy(), 1);
        assert_eq!(
            registry.healthy_endpoints(),
            vec![
                "http://10.0.0.5:2379".to_string(),
                "http://etcd-0000.ns.svc:2379".to_string()
            ]
        );

        let names: Vec<String> = registry.snapshot().into_iter().map(|m| m.name).collect();
        assert_eq!(names, vec!["default", "etcd-0000"]);
    }

    #[test]
    fn test_seed_member_gets_id_after_start() {
        let registry = MembershipRegistry::new("etcd");
        registry.add(pending(0)).unwrap();
        let joining = registry.mark_joining("etcd-0000", None).unwrap();
        assert_eq!(joining.id, None);
        registry.mark_healthy("etcd-0000").unwrap();
        assert_eq!(registry.record_id("etcd-0000", 9).unwrap().id, Some(9));
        assert!(registry.verify_against(&[live(9)]).is_ok());
    }

    #[test]
    fn test_healthy_requires_joining_first() {
        let registry = MembershipRegistry::new("etcd");
        registry.add(pending(0)).unwrap();
        assert!(registry.mark_healthy("etcd-0000").is_err());
    }

    #[test]
    fn test_remove_returns_removed_member() {
        let registry = MembershipRegistry::new("etcd");
        registry.add(boot()).unwrap();
        registry.mark_removing("default").unwrap();
        assert!(registry.active().is_empty());

        let removed = registry.remove("default").unwrap();
        assert_eq!(removed.state, MemberState::Removed);
        assert!(registry.snapshot().is_empty());
        assert!(registry.boot().is_none());
    }

    #[test]
    fn test_next_index_follows_highest_index() {
        let registry = MembershipRegistry::new("etcd");
        assert_eq!(registry.next_index(), 0);
        registry.add(boot()).unwrap();
        assert_eq!(registry.next_index(), 0);
        registry
            .add(pending(3).with_state(MemberState::Healthy))
            .unwrap();
        assert_eq!(registry.next_index(), 4);
    }

    #[test]
    fn test_view_snapshots_are_detached_copies() {
        let registry = MembershipRegistry::new("etcd");
        let view = registry.view();
        registry.add(boot()).unwrap();

        let mut snapshot = view.snapshot();
        snapshot[0].state = MemberState::Removed;

        assert_eq!(view.snapshot()[0].state, MemberState::Healthy);
    }

    #[test]
    fn test_verify_against_requires_majority_agreement() {
        let registry = MembershipRegistry::new("etcd");
        registry.add(boot()).unwrap();
        registry
            .add(pending(0).with_state(MemberState::Healthy))
            .unwrap();
        registry.mark_joining("etcd-0000", Some(1)).unwrap_err();

        // boot (id 100) agrees, etcd-0000 has no id yet: 1 of 2
        assert!(registry.verify_against(&[live(100), live(1)]).is_err());

        let registry = MembershipRegistry::new("etcd");
        registry.add(boot()).unwrap();
        registry.add(pending(0)).unwrap();
        registry.mark_joining("etcd-0000", Some(1)).unwrap();
        assert!(registry.verify_against(&[live(100), live(1)]).is_ok());
        assert!(registry.verify_against(&[live(100), live(1), live(2)]).is_ok());
        assert!(registry
            .verify_against(&[live(100), live(5), live(6)])
            .is_err());
    }

    #[test]
    fn test_empty_registry_agrees_with_empty_cluster() {
        let registry = MembershipRegistry::new("etcd");
        assert!(registry.verify_against(&[]).is_ok());
    }
}
