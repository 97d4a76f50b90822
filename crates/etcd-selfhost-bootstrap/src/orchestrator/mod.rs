//! Bootstrap orchestrator
//!
//! Sequences a cluster through its bootstrap phases:
//!
//! ```text
//! NotStarted ─┬─► AdoptingBoot ─► ScalingOut ─► RetiringBoot ─► SelfHosted
//!             └──────────────────► ScalingOut ─────────────────► SelfHosted
//!                       (any phase) ─► Failed
//! ```
//!
//! One [`Orchestrator::bootstrap`] call is a single sequential control loop
//! for one cluster: it owns that cluster's [`MembershipRegistry`] and makes
//! at most one membership change at a time. Nothing about progress is
//! persisted; every call re-derives where it is from live etcd membership
//! (see [`recovery`]), so a crashed bootstrap simply resumes.
//!
//! Phase handlers live in submodules and share a per-call [`Run`].

mod adopting;
mod recovery;
mod retiring;
mod scaling;

pub use recovery::determine_phase;

use std::sync::Arc;
use std::time::Duration;

use futures::future::join_all;
use thiserror::Error;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use etcd_selfhost_common::config::BootstrapConfig;
use etcd_selfhost_common::crd::{BootstrapPhase, EtcdClusterSpec, Member};
use etcd_selfhost_common::poll::{poll_until_deadline, Poll, PollError};
use etcd_selfhost_common::{Error, ResultCode};

use crate::boot::BootMemberAdapter;
use crate::etcd::EtcdMembership;
use crate::probe::{HealthProbe, MemberEndpoint, ProvisionedMember};
use crate::provisioner::{ClusterContext, MemberProvisioner};
use crate::registry::MembershipRegistry;
use crate::status::{report_best_effort, LogStatusReporter, StatusReporter};
use crate::waiter::{ConvergenceWaiter, EtcdMemberCounter};

/// Result of a successful bootstrap
#[derive(Clone, Debug, PartialEq)]
pub struct BootstrapOutcome {
    /// Final phase (always `SelfHosted`)
    pub phase: BootstrapPhase,
    /// Final membership in join order
    pub members: Vec<Member>,
    /// Member count etcd reported at the end
    pub reached_size: usize,
}

/// A bootstrap that stopped before reaching `SelfHosted`
///
/// Carries the registry snapshot at the time of failure so a caller can
/// retry, tear down, or alert with full knowledge of what exists.
#[derive(Debug, Error)]
#[error("bootstrap of {cluster} failed during {phase}: {source}")]
pub struct BootstrapFailure {
    /// Cluster being bootstrapped
    pub cluster: String,
    /// Phase the failure happened in
    pub phase: BootstrapPhase,
    /// Registry snapshot at the time of failure
    pub members: Vec<Member>,
    /// Underlying cause
    #[source]
    pub source: Error,
}

impl BootstrapFailure {
    /// Caller-facing result code
    pub fn code(&self) -> ResultCode {
        self.source.code()
    }

    /// Whether rerunning the whole bootstrap may succeed
    pub fn is_retryable(&self) -> bool {
        self.source.is_retryable() || matches!(self.source, Error::DeadlineExceeded { .. })
    }
}

/// Drives clusters from nothing (or a boot member) to self-hosted
pub struct Orchestrator {
    config: BootstrapConfig,
    etcd: Arc<dyn EtcdMembership>,
    probe: Arc<dyn HealthProbe>,
    provisioner: Arc<dyn MemberProvisioner>,
    reporter: Arc<dyn StatusReporter>,
    cancel: CancellationToken,
}

impl Orchestrator {
    /// Create an orchestrator that reports progress to the log only
    pub fn new(
        config: BootstrapConfig,
        etcd: Arc<dyn EtcdMembership>,
        probe: Arc<dyn HealthProbe>,
        provisioner: Arc<dyn MemberProvisioner>,
    ) -> Self {
        Self {
            config,
            etcd,
            probe,
            provisioner,
            reporter: Arc::new(LogStatusReporter),
            cancel: CancellationToken::new(),
        }
    }

    /// Publish progress through `reporter`
    pub fn with_reporter(mut self, reporter: Arc<dyn StatusReporter>) -> Self {
        self.reporter = reporter;
        self
    }

    /// Abort in-flight waits when `cancel` fires
    pub fn with_cancel(mut self, cancel: CancellationToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Configuration in use
    pub fn config(&self) -> &BootstrapConfig {
        &self.config
    }

    /// Bring `cluster` to `spec.size` healthy self-hosted members.
    ///
    /// Safe to call again after a failure or crash: progress is re-derived
    /// from live membership, and creation is idempotent per member index.
    #[instrument(skip(self, cluster, spec), fields(cluster = %cluster, size = spec.size))]
    pub async fn bootstrap(
        &self,
        cluster: &str,
        spec: &EtcdClusterSpec,
    ) -> Result<BootstrapOutcome, BootstrapFailure> {
        if let Err(e) = self.config.validate().and_then(|_| spec.validate(cluster)) {
            error!(error = %e, "refusing to bootstrap");
            return Err(BootstrapFailure {
                cluster: cluster.to_string(),
                phase: BootstrapPhase::NotStarted,
                members: Vec::new(),
                source: e,
            });
        }

        let mut run = Run::new(self, cluster, spec);
        let budget = self.config.bootstrap_timeout;
        let result = match tokio::time::timeout(budget, run.drive()).await {
            Ok(result) => result,
            Err(_) => Err(Error::deadline(cluster, "bootstrap", budget)),
        };

        match result {
            Ok(reached_size) => {
                let members = run.registry.snapshot();
                info!(members = members.len(), reached_size, "cluster is self-hosted");
                Ok(BootstrapOutcome {
                    phase: run.phase,
                    members,
                    reached_size,
                })
            }
            Err(source) => {
                let failure = BootstrapFailure {
                    cluster: cluster.to_string(),
                    phase: run.phase,
                    members: run.registry.snapshot(),
                    source,
                };
                error!(
                    phase = %failure.phase,
                    members = failure.members.len(),
                    retryable = failure.is_retryable(),
                    error = %failure.source,
                    "bootstrap failed"
                );
                // A retryable failure leaves the cluster in its phase; only
                // terminal ones are published as Failed
                let reported = if failure.is_retryable() {
                    failure.phase
                } else {
                    BootstrapPhase::Failed
                };
                report_best_effort(
                    self.reporter.as_ref(),
                    cluster,
                    reported,
                    failure.members.clone(),
                    Some(format!("{} during {}", failure.source, failure.phase)),
                )
                .await;
                Err(failure)
            }
        }
    }

    /// Wait until `cluster` reports `size` started members
    pub async fn wait_until_size_reached(
        &self,
        cluster: &str,
        size: usize,
        timeout: Duration,
    ) -> Result<usize, Error> {
        self.waiter(Vec::new())
            .wait_until_size_reached(cluster, size, timeout)
            .await
    }

    /// Destroy every self-hosted member of `cluster` and its client Service.
    ///
    /// Members leave etcd membership in reverse join order; the last one is
    /// not removed from etcd (a cluster cannot remove its only member) and
    /// its resources are released with the rest of the cluster.
    #[instrument(skip(self, cluster), fields(cluster = %cluster))]
    pub async fn teardown(&self, cluster: &str, version: Option<String>) -> Result<Vec<String>, Error> {
        let registry = MembershipRegistry::new(cluster);
        let ctx = ClusterContext {
            name: cluster.to_string(),
            namespace: self.config.namespace.clone(),
            version,
            registry: registry.view(),
        };

        let live = match self.etcd.list_members(&ctx.endpoints()).await {
            Ok(live) => live,
            Err(e) => {
                warn!(error = %e, "cluster unreachable, releasing platform resources only");
                Vec::new()
            }
        };
        let mut members: Vec<(usize, String)> = live
            .iter()
            .filter_map(|m| {
                recovery::self_hosted_index(cluster, &self.config.namespace, m)
                    .map(|i| (i, etcd_selfhost_common::member_name(cluster, i)))
            })
            .collect();
        members.sort();

        let mut destroyed = Vec::new();
        while members.len() > 1 {
            let Some((_, name)) = members.pop() else {
                break;
            };
            self.provisioner.destroy_member(&ctx, &name).await?;
            info!(member = %name, "member destroyed");
            destroyed.push(name);
        }

        for name in self.provisioner.release_cluster(&ctx).await? {
            if !destroyed.contains(&name) {
                destroyed.push(name);
            }
        }
        info!(destroyed = destroyed.len(), "cluster torn down");
        Ok(destroyed)
    }

    fn waiter(&self, endpoints: Vec<String>) -> ConvergenceWaiter {
        let counter = EtcdMemberCounter::new(Arc::clone(&self.etcd), &self.config.namespace)
            .with_endpoints(endpoints);
        ConvergenceWaiter::new(Arc::new(counter))
            .with_interval(self.config.poll_interval)
            .with_cancel(self.cancel.clone())
    }
}

/// State of one `bootstrap` call
struct Run<'a> {
    orch: &'a Orchestrator,
    cluster: String,
    spec: EtcdClusterSpec,
    registry: MembershipRegistry,
    boot: Option<BootMemberAdapter>,
    phase: BootstrapPhase,
}

impl<'a> Run<'a> {
    fn new(orch: &'a Orchestrator, cluster: &str, spec: &EtcdClusterSpec) -> Self {
        Self {
            orch,
            cluster: cluster.to_string(),
            spec: spec.clone(),
            registry: MembershipRegistry::new(cluster),
            boot: BootMemberAdapter::from_spec(spec, Arc::clone(&orch.probe)),
            phase: BootstrapPhase::NotStarted,
        }
    }

    fn config(&self) -> &BootstrapConfig {
        &self.orch.config
    }

    fn ctx(&self) -> ClusterContext {
        ClusterContext {
            name: self.cluster.clone(),
            namespace: self.orch.config.namespace.clone(),
            version: self.spec.version.clone(),
            registry: self.registry.view(),
        }
    }

    async fn enter(&mut self, phase: BootstrapPhase) {
        if self.phase != phase {
            info!(cluster = %self.cluster, from = %self.phase, to = %phase, "phase transition");
            self.phase = phase;
        }
        self.report(None).await;
    }

    async fn report(&self, message: Option<String>) {
        report_best_effort(
            self.orch.reporter.as_ref(),
            &self.cluster,
            self.phase,
            self.registry.snapshot(),
            message,
        )
        .await;
    }

    /// Run phases until `SelfHosted`, returning the size etcd reports
    async fn drive(&mut self) -> Result<usize, Error> {
        let mut phase = recovery::resume(self).await?;
        loop {
            self.enter(phase).await;
            phase = match phase {
                BootstrapPhase::ScalingOut => {
                    scaling::scale_out(self).await?;
                    if self.registry.boot().is_some() {
                        BootstrapPhase::RetiringBoot
                    } else {
                        BootstrapPhase::SelfHosted
                    }
                }
                BootstrapPhase::RetiringBoot => {
                    retiring::retire_boot(self).await?;
                    BootstrapPhase::SelfHosted
                }
                BootstrapPhase::SelfHosted => return self.confirm_converged().await,
                other => {
                    return Err(Error::internal_with_context(
                        "orchestrator",
                        format!("cannot drive {} from phase {}", self.cluster, other),
                    ))
                }
            };
        }
    }

    /// Final check that etcd itself reports the target size
    async fn confirm_converged(&self) -> Result<usize, Error> {
        let waiter = self.orch.waiter(self.registry.healthy_endpoints());
        let deadline = Instant::now() + self.config().member_ready_timeout;
        let reached = waiter
            .wait_until_size(&self.cluster, self.spec.size, deadline)
            .await?;
        if reached != self.spec.size {
            return Err(recovery::oversized(&self.cluster, self.spec.size, reached));
        }

        let live = self
            .orch
            .etcd
            .list_members(&self.registry.healthy_endpoints())
            .await?;
        self.registry.verify_against(&live)?;
        Ok(reached)
    }

    /// Probe-able handle for a registry member
    fn endpoint_for(&self, member: &Member) -> Result<Box<dyn MemberEndpoint>, Error> {
        if member.is_boot() {
            let url = member
                .client_url()
                .or_else(|| self.boot.as_ref().map(|b| b.endpoint()))
                .ok_or_else(|| {
                    Error::internal_with_context("orchestrator", "boot member has no client URL")
                })?;
            return Ok(Box::new(BootMemberAdapter::new(
                url,
                Arc::clone(&self.orch.probe),
            )));
        }
        Ok(Box::new(ProvisionedMember::new(
            member.clone(),
            Arc::clone(&self.orch.probe),
        )?))
    }

    /// Count how many of `members` answer a health probe right now
    async fn live_healthy(&self, members: &[Member]) -> usize {
        let timeout = self.config().probe_timeout;
        let probes = members.iter().map(|m| async move {
            let endpoint = match self.endpoint_for(m) {
                Ok(endpoint) => endpoint,
                Err(e) => {
                    warn!(member = %m.name, error = %e, "member cannot be probed");
                    return false;
                }
            };
            match endpoint.probe(timeout).await {
                Ok(healthy) => healthy,
                Err(e) => {
                    debug!(member = %m.name, error = %e, "member probe failed");
                    false
                }
            }
        });
        join_all(probes).await.into_iter().filter(|h| *h).count()
    }

    /// Poll `member` until it reports healthy or `timeout` passes
    async fn wait_healthy(&self, member: &Member, timeout: Duration) -> Result<(), Error> {
        let endpoint = self.endpoint_for(member)?;
        let probe_timeout = self.config().probe_timeout;
        let endpoint = endpoint.as_ref();

        let result = poll_until_deadline(
            "member_healthy",
            Instant::now() + timeout,
            self.config().poll_interval,
            &self.orch.cancel,
            |_: &Error| false,
            || async move {
                let healthy = endpoint.probe(probe_timeout).await?;
                Ok::<_, Error>(if healthy { Poll::Ready(()) } else { Poll::Pending })
            },
        )
        .await;

        match result {
            Ok(()) => Ok(()),
            Err(PollError::DeadlineExceeded { last_error }) => {
                let running = self
                    .orch
                    .provisioner
                    .member_running(&self.ctx(), &member.name)
                    .await
                    .ok();
                warn!(
                    member = %member.name,
                    running = ?running,
                    last_error = ?last_error.map(|e| e.to_string()),
                    "member never became healthy"
                );
                Err(Error::deadline(
                    &self.cluster,
                    format!("waiting for member {} to become healthy", member.name),
                    timeout,
                ))
            }
            Err(PollError::Cancelled) => Err(Error::internal_with_context(
                "orchestrator",
                format!("bootstrap of {} cancelled", self.cluster),
            )),
            Err(PollError::Fatal(e)) => Err(e),
        }
    }
}
