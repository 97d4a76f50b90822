//! etcd-selfhost - bootstrap etcd onto the platform it serves

use std::sync::Arc;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use kube::{Api, Client, CustomResourceExt};
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use etcd_selfhost_bootstrap::controller::{self, kube_orchestrator};
use etcd_selfhost_bootstrap::etcd::EtcdGatewayClient;
use etcd_selfhost_bootstrap::status::{KubeStatusReporter, LogStatusReporter, StatusReporter};
use etcd_selfhost_bootstrap::Orchestrator;
use etcd_selfhost_common::config::{BootstrapConfig, DEFAULT_NAMESPACE};
use etcd_selfhost_common::crd::{EtcdCluster, EtcdClusterSpec};
use etcd_selfhost_common::telemetry::{init_telemetry, LogFormat, TelemetryConfig};
use etcd_selfhost_common::{ResultCode, DEFAULT_ETCD_VERSION, FIELD_MANAGER};

/// etcd-selfhost - migrate etcd clusters onto self-hosted members
#[derive(Parser, Debug)]
#[command(name = "etcd-selfhost", version, about, long_about = None)]
struct Cli {
    /// Generate the EtcdCluster CRD manifest and exit
    #[arg(long)]
    crd: bool,

    #[command(flatten)]
    config: ConfigArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run as controller (default mode)
    ///
    /// Watches EtcdCluster resources and bootstraps each one. Clusters are
    /// reconciled in parallel, one control loop per cluster.
    Controller,

    /// Bootstrap a single cluster and exit with its result code
    Bootstrap(BootstrapArgs),

    /// Wait until a cluster reports a member count
    Wait(WaitArgs),

    /// Destroy every self-hosted member of a cluster
    Teardown(TeardownArgs),
}

#[derive(Args, Debug)]
struct BootstrapArgs {
    /// Cluster name
    #[arg(long)]
    cluster: String,

    /// Target number of members
    #[arg(long)]
    size: usize,

    /// Client URL of an externally started boot member to migrate from
    #[arg(long)]
    boot_endpoint: Option<String>,

    /// etcd release for self-hosted members
    #[arg(long)]
    version: Option<String>,

    /// Publish progress to the cluster's EtcdCluster status
    #[arg(long)]
    report_status: bool,
}

#[derive(Args, Debug)]
struct WaitArgs {
    /// Cluster name
    #[arg(long)]
    cluster: String,

    /// Member count to wait for
    #[arg(long)]
    size: usize,

    /// Seconds to wait before giving up
    #[arg(long, default_value_t = 300)]
    timeout_secs: u64,
}

#[derive(Args, Debug)]
struct TeardownArgs {
    /// Cluster name
    #[arg(long)]
    cluster: String,

    /// etcd release the members were created with
    #[arg(long)]
    version: Option<String>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
enum LogFormatArg {
    Json,
    Text,
}

impl From<LogFormatArg> for LogFormat {
    fn from(format: LogFormatArg) -> Self {
        match format {
            LogFormatArg::Json => LogFormat::Json,
            LogFormatArg::Text => LogFormat::Text,
        }
    }
}

/// Orchestrator knobs, settable by flag or `ETCD_SELFHOST_*` environment variable
#[derive(Args, Debug)]
struct ConfigArgs {
    /// Namespace member Pods and Services are created in
    #[arg(long, global = true, env = "ETCD_SELFHOST_NAMESPACE", default_value = DEFAULT_NAMESPACE)]
    namespace: String,

    /// etcd release used when a cluster doesn't pin one
    #[arg(long, global = true, env = "ETCD_SELFHOST_ETCD_VERSION", default_value = DEFAULT_ETCD_VERSION)]
    etcd_version: String,

    /// Seconds to wait for the boot member to answer
    #[arg(long, global = true, env = "ETCD_SELFHOST_ADOPT_TIMEOUT", default_value_t = 60)]
    adopt_timeout_secs: u64,

    /// Seconds to wait for each new member to become healthy
    #[arg(long, global = true, env = "ETCD_SELFHOST_MEMBER_READY_TIMEOUT", default_value_t = 300)]
    member_ready_timeout_secs: u64,

    /// Seconds to wait for the boot member removal
    #[arg(long, global = true, env = "ETCD_SELFHOST_RETIRE_TIMEOUT", default_value_t = 60)]
    retire_timeout_secs: u64,

    /// Seconds a whole bootstrap may take
    #[arg(long, global = true, env = "ETCD_SELFHOST_BOOTSTRAP_TIMEOUT", default_value_t = 1800)]
    bootstrap_timeout_secs: u64,

    /// Seconds a single probe or etcd call may take
    #[arg(long, global = true, env = "ETCD_SELFHOST_PROBE_TIMEOUT", default_value_t = 5)]
    probe_timeout_secs: u64,

    /// Seconds between polls
    #[arg(long, global = true, env = "ETCD_SELFHOST_POLL_INTERVAL", default_value_t = 2)]
    poll_interval_secs: u64,

    /// Log output format
    #[arg(long, global = true, env = "ETCD_SELFHOST_LOG_FORMAT", value_enum, default_value = "json")]
    log_format: LogFormatArg,
}

impl ConfigArgs {
    fn to_config(&self) -> BootstrapConfig {
        BootstrapConfig {
            namespace: self.namespace.clone(),
            etcd_version: self.etcd_version.clone(),
            adopt_timeout: Duration::from_secs(self.adopt_timeout_secs),
            member_ready_timeout: Duration::from_secs(self.member_ready_timeout_secs),
            retire_timeout: Duration::from_secs(self.retire_timeout_secs),
            bootstrap_timeout: Duration::from_secs(self.bootstrap_timeout_secs),
            probe_timeout: Duration::from_secs(self.probe_timeout_secs),
            poll_interval: Duration::from_secs(self.poll_interval_secs),
            ..BootstrapConfig::default()
        }
    }
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    if cli.crd {
        let crd = serde_yaml::to_string(&EtcdCluster::crd())
            .map_err(|e| anyhow::anyhow!("Failed to serialize CRD: {}", e))?;
        println!("{crd}");
        return Ok(());
    }

    init_telemetry(TelemetryConfig {
        format: cli.config.log_format.into(),
        ..TelemetryConfig::default()
    })?;

    let config = cli.config.to_config();
    let code = match cli.command.unwrap_or(Commands::Controller) {
        Commands::Controller => {
            run_controller(config).await?;
            ResultCode::Success
        }
        Commands::Bootstrap(args) => run_bootstrap(config, args).await?,
        Commands::Wait(args) => run_wait(config, args).await?,
        Commands::Teardown(args) => run_teardown(config, args).await?,
    };

    if code != ResultCode::Success {
        std::process::exit(code.exit_code());
    }
    Ok(())
}

/// Install the EtcdCluster CRD with server-side apply so it always matches
/// this binary's version
async fn ensure_crd_installed(client: &Client) -> anyhow::Result<()> {
    use k8s_openapi::apiextensions_apiserver::pkg::apis::apiextensions::v1::CustomResourceDefinition;
    use kube::api::{Patch, PatchParams};

    let crds: Api<CustomResourceDefinition> = Api::all(client.clone());
    let params = PatchParams::apply(FIELD_MANAGER).force();

    info!("Installing EtcdCluster CRD...");
    crds.patch(
        "etcdclusters.etcd.selfhost.dev",
        &params,
        &Patch::Apply(&EtcdCluster::crd()),
    )
    .await
    .map_err(|e| anyhow::anyhow!("Failed to install EtcdCluster CRD: {}", e))?;
    Ok(())
}

async fn run_controller(config: BootstrapConfig) -> anyhow::Result<()> {
    config.validate()?;
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;
    ensure_crd_installed(&client).await?;
    controller::run(client, config).await?;
    Ok(())
}

/// Orchestrator for one-shot commands, cancelled on Ctrl-C
async fn orchestrator(
    config: BootstrapConfig,
    report_status: bool,
) -> anyhow::Result<Orchestrator> {
    let client = Client::try_default()
        .await
        .map_err(|e| anyhow::anyhow!("Failed to create Kubernetes client: {}", e))?;
    let etcd = Arc::new(EtcdGatewayClient::new(config.probe_timeout)?);
    let reporter: Arc<dyn StatusReporter> = if report_status {
        Arc::new(KubeStatusReporter::new(client.clone(), &config.namespace))
    } else {
        Arc::new(LogStatusReporter)
    };

    let cancel = CancellationToken::new();
    let on_signal = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupted, cancelling in-flight waits");
            on_signal.cancel();
        }
    });

    Ok(kube_orchestrator(client, config, etcd, reporter).with_cancel(cancel))
}

fn cluster_spec(args: &BootstrapArgs) -> EtcdClusterSpec {
    let mut spec = match &args.boot_endpoint {
        Some(endpoint) => EtcdClusterSpec::with_boot_member(args.size, endpoint),
        None => EtcdClusterSpec::new(args.size),
    };
    spec.version = args.version.clone();
    spec
}

async fn run_bootstrap(config: BootstrapConfig, args: BootstrapArgs) -> anyhow::Result<ResultCode> {
    let spec = cluster_spec(&args);
    let orchestrator = orchestrator(config, args.report_status).await?;

    match orchestrator.bootstrap(&args.cluster, &spec).await {
        Ok(outcome) => {
            let members: Vec<&str> = outcome.members.iter().map(|m| m.name.as_str()).collect();
            info!(
                cluster = %args.cluster,
                size = outcome.reached_size,
                members = ?members,
                "bootstrap complete"
            );
            Ok(ResultCode::Success)
        }
        Err(failure) => {
            let members: Vec<String> = failure
                .members
                .iter()
                .map(|m| format!("{}={}", m.name, m.state))
                .collect();
            error!(
                cluster = %failure.cluster,
                phase = %failure.phase,
                code = %failure.code(),
                retryable = failure.is_retryable(),
                members = ?members,
                error = %failure.source,
                "bootstrap failed"
            );
            Ok(failure.code())
        }
    }
}

async fn run_wait(config: BootstrapConfig, args: WaitArgs) -> anyhow::Result<ResultCode> {
    let orchestrator = orchestrator(config, false).await?;
    let result = orchestrator
        .wait_until_size_reached(&args.cluster, args.size, Duration::from_secs(args.timeout_secs))
        .await;
    match &result {
        Ok(size) => info!(cluster = %args.cluster, size, "cluster reached size"),
        Err(e) => error!(cluster = %args.cluster, error = %e, "cluster did not reach size"),
    }
    Ok(ResultCode::of(&result))
}

async fn run_teardown(config: BootstrapConfig, args: TeardownArgs) -> anyhow::Result<ResultCode> {
    let orchestrator = orchestrator(config, false).await?;
    let result = orchestrator.teardown(&args.cluster, args.version).await;
    match &result {
        Ok(destroyed) => info!(cluster = %args.cluster, destroyed = ?destroyed, "cluster torn down"),
        Err(e) => error!(cluster = %args.cluster, error = %e, "teardown failed"),
    }
    Ok(ResultCode::of(&result))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_match_library_config() {
        let cli = Cli::try_parse_from(["etcd-selfhost"]).unwrap();
        assert!(cli.command.is_none());
        assert_eq!(cli.config.to_config(), BootstrapConfig::default());
    }

    #[test]
    fn test_bootstrap_args_build_boot_spec() {
        let cli = Cli::try_parse_from([
            "etcd-selfhost",
            "bootstrap",
            "--cluster",
            "etcd",
            "--size",
            "3",
            "--boot-endpoint",
            "http://10.0.0.5:2379",
            "--namespace",
            "etcd-system",
        ])
        .unwrap();

        assert_eq!(cli.config.to_config().namespace, "etcd-system");
        let Some(Commands::Bootstrap(args)) = cli.command else {
            panic!("expected bootstrap command");
        };
        let spec = cluster_spec(&args);
        assert_eq!(spec.size, 3);
        assert_eq!(spec.boot_member_endpoint(), Some("http://10.0.0.5:2379"));
    }

    #[test]
    fn test_bootstrap_without_boot_endpoint_is_from_scratch() {
        let cli =
            Cli::try_parse_from(["etcd-selfhost", "bootstrap", "--cluster", "etcd", "--size", "5"])
                .unwrap();
        let Some(Commands::Bootstrap(args)) = cli.command else {
            panic!("expected bootstrap command");
        };
        assert!(cluster_spec(&args).boot_member_endpoint().is_none());
    }

    #[test]
    fn test_timeouts_from_flags() {
        let cli = Cli::try_parse_from([
            "etcd-selfhost",
            "wait",
            "--cluster",
            "etcd",
            "--size",
            "3",
            "--member-ready-timeout-secs",
            "30",
            "--log-format",
            "text",
        ])
        .unwrap();
        let config = cli.config.to_config();
        assert_eq!(config.member_ready_timeout, Duration::from_secs(30));
        assert!(matches!(cli.config.log_format, LogFormatArg::Text));
    }
}
