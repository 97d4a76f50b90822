//! Self-hosted etcd bootstrap
//!
//! Takes an etcd cluster from nothing, or from an externally started boot
//! member, to a set of members that run on the platform they serve:
//!
//! - [`probe`] and [`boot`]: health of provisioned members and of the boot member
//! - [`registry`]: the per-cluster cache of etcd membership
//! - [`provisioner`] and [`platform`]: creating and destroying member resources
//! - [`orchestrator`]: the phase state machine
//! - [`waiter`]: blocking until etcd reports a target size
//! - [`controller`]: the `EtcdCluster` reconciler that drives all of the above

#![deny(missing_docs)]

pub mod boot;
pub mod controller;
pub mod etcd;
pub mod orchestrator;
pub mod platform;
pub mod probe;
pub mod provisioner;
pub mod registry;
pub mod status;
pub mod waiter;

pub use orchestrator::{BootstrapFailure, BootstrapOutcome, Orchestrator};
