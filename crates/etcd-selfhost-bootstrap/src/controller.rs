//! EtcdCluster controller
//!
//! Reconciles `EtcdCluster` objects by running a bootstrap for each. The
//! kube-runtime scheduler never runs two reconciles for the same object at
//! once, which gives the one-control-loop-per-cluster guarantee for free,
//! while different clusters bootstrap in parallel.
//!
//! Every cluster carries [`CLUSTER_FINALIZER`] so that deleting the object
//! tears down the members it created before the object goes away.

use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use kube::api::{Patch, PatchParams};
use kube::runtime::controller::Action;
use kube::runtime::watcher::Config as WatcherConfig;
use kube::runtime::Controller;
use kube::{Api, Client, ResourceExt};
use tracing::{debug, error, info, warn};

use etcd_selfhost_common::config::BootstrapConfig;
use etcd_selfhost_common::crd::{BootstrapPhase, EtcdCluster};
use etcd_selfhost_common::{Error, FIELD_MANAGER};

use crate::etcd::EtcdGatewayClient;
use crate::orchestrator::Orchestrator;
use crate::platform::KubePlatform;
use crate::provisioner::PlatformProvisioner;
use crate::status::{KubeStatusReporter, LogStatusReporter, StatusReporter};

/// Finalizer that holds a cluster until its members are torn down
pub const CLUSTER_FINALIZER: &str = "etcd.selfhost.dev/teardown";

/// How often a converged cluster is looked at again
pub const CONVERGED_REQUEUE: Duration = Duration::from_secs(300);

/// Requeue delay after a retryable failure
pub const RETRY_REQUEUE: Duration = Duration::from_secs(15);

/// Requeue delay after a failure that needs a spec change to clear
pub const FAILED_REQUEUE: Duration = Duration::from_secs(60);

/// Shared state for all reconciles
pub struct Context {
    client: Client,
    config: BootstrapConfig,
    etcd: Arc<EtcdGatewayClient>,
}

impl Context {
    /// Create a controller context
    pub fn new(client: Client, config: BootstrapConfig) -> Result<Self, Error> {
        let etcd = Arc::new(EtcdGatewayClient::new(config.probe_timeout)?);
        Ok(Self {
            client,
            config,
            etcd,
        })
    }
}

/// Build an orchestrator that manages members in `config.namespace` on Kubernetes
pub fn kube_orchestrator(
    client: Client,
    config: BootstrapConfig,
    etcd: Arc<EtcdGatewayClient>,
    reporter: Arc<dyn StatusReporter>,
) -> Orchestrator {
    let platform = Arc::new(KubePlatform::new(client, &config.namespace));
    let provisioner = Arc::new(PlatformProvisioner::new(
        etcd.clone(),
        platform,
        config.clone(),
    ));
    Orchestrator::new(config, etcd.clone(), etcd, provisioner).with_reporter(reporter)
}

/// What a reconcile should do
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ReconcileAction {
    /// Add the teardown finalizer before touching anything
    AddFinalizer,
    /// Object is being deleted; tear the cluster down and release it
    TearDown,
    /// Run (or resume) the bootstrap
    Bootstrap,
    /// Converged at this generation; check back later
    Requeue,
    /// Failed at this generation, or already released; wait for a change
    AwaitChange,
}

/// Check if a cluster carries the teardown finalizer
pub fn has_finalizer(cluster: &EtcdCluster) -> bool {
    cluster
        .metadata
        .finalizers
        .as_ref()
        .is_some_and(|f| f.iter().any(|s| s == CLUSTER_FINALIZER))
}

/// Decide what to do with `cluster` in its current state
pub fn determine_reconcile_action(cluster: &EtcdCluster) -> ReconcileAction {
    let finalized = has_finalizer(cluster);
    if cluster.metadata.deletion_timestamp.is_some() {
        return if finalized {
            ReconcileAction::TearDown
        } else {
            ReconcileAction::AwaitChange
        };
    }
    if !finalized {
        return ReconcileAction::AddFinalizer;
    }

    let status = cluster.status.as_ref();
    determine_bootstrap_action(
        status.map(|s| s.phase),
        status.and_then(|s| s.observed_generation),
        cluster.metadata.generation,
    )
}

/// Decide whether a live cluster needs a bootstrap from its recorded phase
pub fn determine_bootstrap_action(
    phase: Option<BootstrapPhase>,
    observed_generation: Option<i64>,
    generation: Option<i64>,
) -> ReconcileAction {
    let current = observed_generation.is_some() && observed_generation == generation;
    match phase {
        Some(BootstrapPhase::SelfHosted) if current => ReconcileAction::Requeue,
        Some(BootstrapPhase::Failed) if current => ReconcileAction::AwaitChange,
        _ => ReconcileAction::Bootstrap,
    }
}

/// Reconcile one EtcdCluster
pub async fn reconcile(cluster: Arc<EtcdCluster>, ctx: Arc<Context>) -> Result<Action, Error> {
    let name = cluster.name_any();
    let namespace = cluster
        .namespace()
        .unwrap_or_else(|| ctx.config.namespace.clone());
    let api: Api<EtcdCluster> = Api::namespaced(ctx.client.clone(), &namespace);
    let config = BootstrapConfig {
        namespace: namespace.clone(),
        ..ctx.config.clone()
    };

    match determine_reconcile_action(&cluster) {
        ReconcileAction::AddFinalizer => {
            info!(cluster = %name, "adding teardown finalizer");
            patch_finalizers(&api, &name, finalizers_with(&cluster)).await?;
            return Ok(Action::requeue(Duration::from_secs(1)));
        }
        ReconcileAction::TearDown => {
            info!(cluster = %name, namespace = %namespace, "cluster deleted, tearing down members");
            let orchestrator = kube_orchestrator(
                ctx.client.clone(),
                config,
                ctx.etcd.clone(),
                Arc::new(LogStatusReporter),
            );
            let destroyed = orchestrator
                .teardown(&name, cluster.spec.version.clone())
                .await?;
            info!(cluster = %name, destroyed = destroyed.len(), "members released, removing finalizer");
            match patch_finalizers(&api, &name, finalizers_without(&cluster)).await {
                Ok(()) => {}
                Err(Error::Kube {
                    source: kube::Error::Api(ae),
                }) if ae.code == 404 => {
                    debug!(cluster = %name, "cluster already gone");
                }
                Err(e) => return Err(e),
            }
            return Ok(Action::await_change());
        }
        ReconcileAction::Requeue => return Ok(Action::requeue(CONVERGED_REQUEUE)),
        ReconcileAction::AwaitChange => return Ok(Action::await_change()),
        ReconcileAction::Bootstrap => {}
    }

    info!(cluster = %name, namespace = %namespace, size = cluster.spec.size, "reconciling cluster");
    let reporter = KubeStatusReporter::new(ctx.client.clone(), &namespace)
        .with_generation(cluster.metadata.generation);
    let orchestrator = kube_orchestrator(
        ctx.client.clone(),
        config,
        ctx.etcd.clone(),
        Arc::new(reporter),
    );

    match orchestrator.bootstrap(&name, &cluster.spec).await {
        Ok(outcome) => {
            info!(cluster = %name, members = outcome.members.len(), "cluster converged");
            Ok(Action::requeue(CONVERGED_REQUEUE))
        }
        Err(failure) if failure.is_retryable() => {
            warn!(cluster = %name, phase = %failure.phase, error = %failure.source, "bootstrap will be retried");
            Err(failure.source)
        }
        Err(failure) => {
            error!(
                cluster = %name,
                phase = %failure.phase,
                code = %failure.code(),
                error = %failure.source,
                "bootstrap failed, waiting for a spec change"
            );
            Ok(Action::await_change())
        }
    }
}

/// Finalizers of `cluster` with the teardown finalizer added
fn finalizers_with(cluster: &EtcdCluster) -> Vec<String> {
    let mut finalizers = cluster.finalizers().to_vec();
    if !finalizers.iter().any(|f| f == CLUSTER_FINALIZER) {
        finalizers.push(CLUSTER_FINALIZER.to_string());
    }
    finalizers
}

/// Finalizers of `cluster` with the teardown finalizer removed
fn finalizers_without(cluster: &EtcdCluster) -> Vec<String> {
    cluster
        .finalizers()
        .iter()
        .filter(|f| *f != CLUSTER_FINALIZER)
        .cloned()
        .collect()
}

async fn patch_finalizers(
    api: &Api<EtcdCluster>,
    name: &str,
    finalizers: Vec<String>,
) -> Result<(), Error> {
    let patch = serde_json::json!({
        "metadata": {
            "finalizers": finalizers
        }
    });
    api.patch(name, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
        .await?;
    Ok(())
}

/// Requeue delay for a failed reconcile
pub fn requeue_delay(error: &Error) -> Duration {
    if error.is_retryable() || matches!(error, Error::DeadlineExceeded { .. }) {
        RETRY_REQUEUE
    } else {
        FAILED_REQUEUE
    }
}

/// Error policy for the controller
pub fn error_policy(cluster: Arc<EtcdCluster>, error: &Error, _ctx: Arc<Context>) -> Action {
    error!(
        ?error,
        cluster = %cluster.name_any(),
        "reconciliation failed"
    );
    Action::requeue(requeue_delay(error))
}

/// Run the EtcdCluster controller until shutdown is signalled
pub async fn run(client: Client, config: BootstrapConfig) -> Result<(), Error> {
    let ctx = Arc::new(Context::new(client.clone(), config)?);
    let clusters: Api<EtcdCluster> = Api::all(client);

    info!("starting EtcdCluster controller");
    Controller::new(clusters, WatcherConfig::default())
        .shutdown_on_signal()
        .run(reconcile, error_policy, ctx)
        .for_each(|result| async move {
            match result {
                Ok(action) => {
                    debug!(?action, "EtcdCluster reconciliation completed");
                }
                Err(e) => {
                    error!(error = ?e, "EtcdCluster reconciliation error");
                }
            }
        })
        .await;
    info!("EtcdCluster controller stopped");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    use etcd_selfhost_common::crd::{EtcdClusterSpec, EtcdClusterStatus};
    use k8s_openapi::apimachinery::pkg::apis::meta::v1::Time;
    use k8s_openapi::chrono::Utc;

    fn cluster(finalizers: &[&str]) -> EtcdCluster {
        let mut cluster = EtcdCluster::new("etcd", EtcdClusterSpec::new(3));
        cluster.metadata.namespace = Some("kube-system".to_string());
        cluster.metadata.generation = Some(1);
        cluster.metadata.finalizers = Some(finalizers.iter().map(|f| f.to_string()).collect());
        cluster
    }

    fn deleting(mut cluster: EtcdCluster) -> EtcdCluster {
        cluster.metadata.deletion_timestamp = Some(Time(Utc::now()));
        cluster
    }

    #[test]
    fn test_new_cluster_gets_finalizer_first() {
        let fresh = cluster(&[]);
        assert_eq!(determine_reconcile_action(&fresh), ReconcileAction::AddFinalizer);
        assert_eq!(finalizers_with(&fresh), vec![CLUSTER_FINALIZER.to_string()]);
    }

    #[test]
    fn test_finalized_cluster_is_bootstrapped() {
        let finalized = cluster(&[CLUSTER_FINALIZER]);
        assert!(has_finalizer(&finalized));
        assert_eq!(determine_reconcile_action(&finalized), ReconcileAction::Bootstrap);
    }

    #[test]
    fn test_deleted_cluster_is_torn_down() {
        let mut converged = cluster(&["other.dev/keep", CLUSTER_FINALIZER]);
        converged.status = Some(EtcdClusterStatus {
            observed_generation: Some(1),
            ..EtcdClusterStatus::with_phase(BootstrapPhase::SelfHosted)
        });
        let converged = deleting(converged);

        assert_eq!(determine_reconcile_action(&converged), ReconcileAction::TearDown);
        assert_eq!(finalizers_without(&converged), vec!["other.dev/keep".to_string()]);
    }

    #[test]
    fn test_released_cluster_is_left_alone() {
        let released = deleting(cluster(&["other.dev/keep"]));
        assert_eq!(determine_reconcile_action(&released), ReconcileAction::AwaitChange);
    }

    #[test]
    fn test_adding_finalizer_twice_keeps_one() {
        let finalized = cluster(&[CLUSTER_FINALIZER]);
        assert_eq!(finalizers_with(&finalized), vec![CLUSTER_FINALIZER.to_string()]);
    }

    #[test]
    fn test_new_cluster_is_bootstrapped() {
        assert_eq!(
            determine_bootstrap_action(None, None, Some(1)),
            ReconcileAction::Bootstrap
        );
    }

    #[test]
    fn test_converged_cluster_is_requeued() {
        assert_eq!(
            determine_bootstrap_action(Some(BootstrapPhase::SelfHosted), Some(2), Some(2)),
            ReconcileAction::Requeue
        );
    }

    #[test]
    fn test_spec_change_restarts_bootstrap() {
        assert_eq!(
            determine_bootstrap_action(Some(BootstrapPhase::SelfHosted), Some(1), Some(2)),
            ReconcileAction::Bootstrap
        );
        assert_eq!(
            determine_bootstrap_action(Some(BootstrapPhase::Failed), Some(1), Some(2)),
            ReconcileAction::Bootstrap
        );
    }

    #[test]
    fn test_failed_cluster_waits_for_change() {
        assert_eq!(
            determine_bootstrap_action(Some(BootstrapPhase::Failed), Some(3), Some(3)),
            ReconcileAction::AwaitChange
        );
    }

    #[test]
    fn test_interrupted_phases_resume() {
        for phase in [
            BootstrapPhase::AdoptingBoot,
            BootstrapPhase::ScalingOut,
            BootstrapPhase::RetiringBoot,
        ] {
            assert_eq!(
                determine_bootstrap_action(Some(phase), Some(1), Some(1)),
                ReconcileAction::Bootstrap
            );
        }
    }

    #[test]
    fn test_requeue_delay_by_retryability() {
        assert_eq!(
            requeue_delay(&Error::transient("http://a:2379", "reset")),
            RETRY_REQUEUE
        );
        assert_eq!(
            requeue_delay(&Error::deadline("etcd", "bootstrap", Duration::from_secs(1))),
            RETRY_REQUEUE
        );
        assert_eq!(
            requeue_delay(&Error::quorum_unsafe("etcd", "remove", 1, 4)),
            FAILED_REQUEUE
        );
    }
}
