//! Bootstrap configuration
//!
//! Per-phase timeouts and polling knobs consumed by the orchestrator. The
//! operator binary fills this from CLI flags (with `ETCD_SELFHOST_*`
//! environment fallbacks) and calls [`BootstrapConfig::validate`] before any
//! orchestrator starts.

use std::time::Duration;

use crate::retry::RetryConfig;
use crate::{Error, DEFAULT_ETCD_VERSION};

/// Default namespace self-hosted members run in
pub const DEFAULT_NAMESPACE: &str = "kube-system";

/// Timeouts and knobs for one bootstrap run
#[derive(Clone, Debug, PartialEq)]
pub struct BootstrapConfig {
    /// Namespace member Pods and Services are created in
    pub namespace: String,
    /// etcd release used when the cluster spec doesn't pin one
    pub etcd_version: String,
    /// Budget for reaching the boot member during `AdoptingBoot`
    pub adopt_timeout: Duration,
    /// Budget for one new member to report healthy during `ScalingOut`
    pub member_ready_timeout: Duration,
    /// Budget for removing the boot member during `RetiringBoot`
    pub retire_timeout: Duration,
    /// Budget for a whole `bootstrap` call, across all phases
    pub bootstrap_timeout: Duration,
    /// Timeout of a single health probe or etcd API call
    pub probe_timeout: Duration,
    /// Interval between polls while waiting on health or size
    pub poll_interval: Duration,
    /// Backoff policy for transient errors inside a phase
    pub retry: RetryConfig,
}

impl Default for BootstrapConfig {
    fn default() -> Self {
        Self {
            namespace: DEFAULT_NAMESPACE.to_string(),
            etcd_version: DEFAULT_ETCD_VERSION.to_string(),
            adopt_timeout: Duration::from_secs(60),
            member_ready_timeout: Duration::from_secs(300),
            retire_timeout: Duration::from_secs(60),
            bootstrap_timeout: Duration::from_secs(1800),
            probe_timeout: Duration::from_secs(5),
            poll_interval: Duration::from_secs(2),
            retry: RetryConfig::with_max_attempts(5)
                .delays(Duration::from_millis(500), Duration::from_secs(10)),
        }
    }
}

impl BootstrapConfig {
    /// Reject configurations the orchestrator cannot run with
    pub fn validate(&self) -> Result<(), Error> {
        if self.namespace.is_empty() {
            return Err(Error::validation("namespace cannot be empty"));
        }
        if self.etcd_version.is_empty() {
            return Err(Error::validation("etcd version cannot be empty"));
        }

        let timeouts = [
            ("adopt_timeout", self.adopt_timeout),
            ("member_ready_timeout", self.member_ready_timeout),
            ("retire_timeout", self.retire_timeout),
            ("bootstrap_timeout", self.bootstrap_timeout),
            ("probe_timeout", self.probe_timeout),
            ("poll_interval", self.poll_interval),
        ];
        for (name, value) in timeouts {
            if value.is_zero() {
                return Err(Error::validation(format!("{} must be greater than zero", name)));
            }
        }

        if self.probe_timeout > self.member_ready_timeout {
            return Err(Error::validation(
                "probe_timeout cannot exceed member_ready_timeout",
            ));
        }
        if self.adopt_timeout > self.bootstrap_timeout {
            return Err(Error::validation(
                "adopt_timeout cannot exceed bootstrap_timeout",
            ));
        }
        if self.retry.backoff_multiplier < 1.0 {
            return Err(Error::validation("retry backoff multiplier must be >= 1.0"));
        }

        Ok(())
    }

    /// Image for self-hosted members at the given release
    pub fn image(&self, version: Option<&str>) -> String {
        let version = version.unwrap_or(&self.etcd_version);
        let version = version.strip_prefix('v').unwrap_or(version);
        format!("{}:v{}", crate::ETCD_IMAGE_REPOSITORY, version)
    }
}
