//! Custom Resource Definitions for the self-hosted etcd operator
//!
//! `EtcdCluster` carries the cluster spec; the member and phase types are
//! shared with the bootstrap crate so the registry snapshot can be written
//! straight into status.

mod cluster;
mod types;

pub use cluster::{EtcdCluster, EtcdClusterSpec, EtcdClusterStatus, SelfHostedPolicy};
pub use types::{BootstrapPhase, Member, MemberRole, MemberState};
