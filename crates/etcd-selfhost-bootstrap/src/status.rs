//! Bootstrap progress reporting
//!
//! The orchestrator reports every phase change together with the registry
//! snapshot, so partial progress stays observable even when a bootstrap
//! fails. Reporting is best effort: a failed report is logged and the
//! bootstrap carries on.

use async_trait::async_trait;
use kube::api::{Api, Patch, PatchParams};
use kube::Client;
use tracing::{info, warn};

#[cfg(test)]
use mockall::automock;

use etcd_selfhost_common::crd::{BootstrapPhase, EtcdCluster, EtcdClusterStatus, Member};
use etcd_selfhost_common::{Error, FIELD_MANAGER};

/// Trait abstracting where bootstrap progress is published
#[cfg_attr(test, automock)]
#[async_trait]
pub trait StatusReporter: Send + Sync {
    /// Publish the current phase and registry snapshot of `cluster`
    async fn report(
        &self,
        cluster: &str,
        phase: BootstrapPhase,
        members: Vec<Member>,
        message: Option<String>,
    ) -> Result<(), Error>;
}

/// Publishes progress to the `EtcdCluster` status subresource
pub struct KubeStatusReporter {
    api: Api<EtcdCluster>,
    observed_generation: Option<i64>,
}

impl KubeStatusReporter {
    /// Report on `EtcdCluster` objects in `namespace`
    pub fn new(client: Client, namespace: &str) -> Self {
        Self {
            api: Api::namespaced(client, namespace),
            observed_generation: None,
        }
    }

    /// Stamp reports with the generation being reconciled
    pub fn with_generation(mut self, generation: Option<i64>) -> Self {
        self.observed_generation = generation;
        self
    }
}

#[async_trait]
impl StatusReporter for KubeStatusReporter {
    async fn report(
        &self,
        cluster: &str,
        phase: BootstrapPhase,
        members: Vec<Member>,
        message: Option<String>,
    ) -> Result<(), Error> {
        let mut status = EtcdClusterStatus::with_phase(phase).members(members);
        status.message = message;
        status.observed_generation = self.observed_generation;

        let patch = serde_json::json!({ "status": status });
        self.api
            .patch_status(cluster, &PatchParams::apply(FIELD_MANAGER), &Patch::Merge(&patch))
            .await?;
        Ok(())
    }
}

/// Reporter that only logs, for runs without an `EtcdCluster` object
#[derive(Clone, Copy, Debug, Default)]
pub struct LogStatusReporter;

#[async_trait]
impl StatusReporter for LogStatusReporter {
    async fn report(
        &self,
        cluster: &str,
        phase: BootstrapPhase,
        members: Vec<Member>,
        message: Option<String>,
    ) -> Result<(), Error> {
        let names: Vec<String> = members
            .iter()
            .map(|m| format!("{}:{}", m.name, m.state))
            .collect();
        info!(
            cluster,
            phase = %phase,
            members = ?names,
            message = message.as_deref().unwrap_or(""),
            "bootstrap progress"
        );
        Ok(())
    }
}

/// Report progress, logging instead of failing when the report is rejected
pub async fn report_best_effort(
    reporter: &dyn StatusReporter,
    cluster: &str,
    phase: BootstrapPhase,
    members: Vec<Member>,
    message: Option<String>,
) {
    if let Err(e) = reporter.report(cluster, phase, members, message).await {
        warn!(cluster, phase = %phase, error = %e, "failed to report bootstrap status");
    }
}
