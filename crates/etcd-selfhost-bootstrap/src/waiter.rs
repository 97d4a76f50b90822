//! Convergence waiter
//!
//! Polls a cluster's live member count until it reaches a target or an
//! absolute deadline passes. Read failures along the way are treated as
//! transient and retried silently; the deadline is wall-clock, so a slow
//! cluster that keeps answering is still bounded.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, instrument, warn};

#[cfg(test)]
use mockall::automock;

use etcd_selfhost_common::poll::{poll_until_deadline, Poll, PollError, DEFAULT_POLL_INTERVAL};
use etcd_selfhost_common::{cluster_client_url, Error};

use crate::etcd::EtcdMembership;

/// Source of a cluster's live member count
#[cfg_attr(test, automock)]
#[async_trait]
pub trait MemberCounter: Send + Sync {
    /// Number of started members `cluster` currently reports
    async fn count(&self, cluster: &str) -> Result<usize, Error>;
}

/// Counts started members through etcd's member list
///
/// The cluster is reached through its client Service unless fixed endpoints
/// were supplied (useful when the caller runs outside the platform network).
pub struct EtcdMemberCounter {
    etcd: Arc<dyn EtcdMembership>,
    namespace: String,
    endpoints: Vec<String>,
}

impl EtcdMemberCounter {
    /// Count members of clusters in `namespace` via their client Service
    pub fn new(etcd: Arc<dyn EtcdMembership>, namespace: impl Into<String>) -> Self {
        Self {
            etcd,
            namespace: namespace.into(),
            endpoints: Vec::new(),
        }
    }

    /// Always query these endpoints instead of the client Service
    pub fn with_endpoints(mut self, endpoints: Vec<String>) -> Self {
        self.endpoints = endpoints;
        self
    }

    fn endpoints_for(&self, cluster: &str) -> Vec<String> {
        if self.endpoints.is_empty() {
            vec![cluster_client_url(cluster, &self.namespace)]
        } else {
            self.endpoints.clone()
        }
    }
}

#[async_trait]
impl MemberCounter for EtcdMemberCounter {
    async fn count(&self, cluster: &str) -> Result<usize, Error> {
        let members = self.etcd.list_members(&self.endpoints_for(cluster)).await?;
        Ok(members.iter().filter(|m| m.is_started()).count())
    }
}

/// Waits for a cluster to reach a member count
pub struct ConvergenceWaiter {
    counter: Arc<dyn MemberCounter>,
    interval: Duration,
    cancel: CancellationToken,
}

impl ConvergenceWaiter {
    /// Create a waiter polling `counter` at the default interval
    pub fn new(counter: Arc<dyn MemberCounter>) -> Self {
        Self {
            counter,
            interval: DEFAULT_POLL_INTERVAL,
            cancel: CancellationToken::new(),
        }
    }

    /// Poll at `interval` instead of the default
    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }

    /// Abort waits when `cancel` fires
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Wait until `cluster` reports at least `target` members.
    ///
    /// Returns the observed size as soon as it reaches `target`, or
    /// `DeadlineExceeded` once `deadline` passes (never before).
    #[instrument(skip(self, cluster, deadline), fields(cluster = %cluster))]
    pub async fn wait_until_size(
        &self,
        cluster: &str,
        target: usize,
        deadline: Instant,
    ) -> Result<usize, Error> {
        let budget = deadline.saturating_duration_since(Instant::now());
        let counter = Arc::clone(&self.counter);

        let result = poll_until_deadline(
            "wait_until_size",
            deadline,
            self.interval,
            &self.cancel,
            |_: &Error| false,
            || {
                let counter = Arc::clone(&counter);
                async move {
                    let size = counter.count(cluster).await?;
                    debug!(size, target, "observed cluster size");
                    Ok::<_, Error>(if size >= target {
                        Poll::Ready(size)
                    } else {
                        Poll::Pending
                    })
                }
            },
        )
        .await;

        match result {
            Ok(size) => {
                info!(size, "cluster reached target size");
                Ok(size)
            }
            Err(PollError::DeadlineExceeded { last_error }) => {
                if let Some(e) = last_error {
                    warn!(error = %e, "cluster size still unreadable at deadline");
                }
                Err(Error::deadline(cluster, "wait_until_size", budget))
            }
            Err(PollError::Cancelled) => Err(Error::internal_with_context(
                "waiter",
                format!("wait for {} cancelled", cluster),
            )),
            Err(PollError::Fatal(e)) => Err(e),
        }
    }

    /// Wait until `cluster` reports `size` members, giving up after `timeout`
    pub async fn wait_until_size_reached(
        &self,
        cluster: &str,
        size: usize,
        timeout: Duration,
    ) -> Result<usize, Error> {
        self.wait_until_size(cluster, size, Instant::now() + timeout)
            .await
    }
}
