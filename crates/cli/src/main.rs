use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use carto_controller::{Components, ControllerConfig, WorkloadReconciler};
use carto_kubehub::InformerTracker;
use clap::{Args, Parser, Subcommand};
use metrics::describe_counter;
use tracing::{error, info, warn};

#[derive(Parser, Debug)]
#[command(name = "carto-controller", version, about = "Reconciles workloads against cluster supply chains")]
struct Cli {
    #[command(flatten)]
    config: Config,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args, Debug, Clone)]
struct Config {
    /// Requeue interval after a successful reconcile, in seconds
    #[arg(long, env = "CARTO_RESYNC_SECS", default_value_t = 36_000, global = true)]
    resync_secs: u64,
    /// Requeue interval after a failed reconcile, in seconds
    #[arg(long, env = "CARTO_ERROR_BACKOFF_SECS", default_value_t = 10, global = true)]
    error_backoff_secs: u64,
    /// How long an applied object body is remembered, in seconds
    #[arg(long, env = "CARTO_CACHE_TTL_SECS", default_value_t = 600, global = true)]
    cache_ttl_secs: u64,
    /// Only reconcile workloads in this namespace
    #[arg(long = "ns", env = "CARTO_NAMESPACE", global = true)]
    namespace: Option<String>,
}

impl From<Config> for ControllerConfig {
    fn from(c: Config) -> Self {
        Self {
            resync: Duration::from_secs(c.resync_secs.max(1)),
            error_backoff: Duration::from_secs(c.error_backoff_secs.max(1)),
            cache_ttl: Duration::from_secs(c.cache_ttl_secs),
            namespace: c.namespace.filter(|ns| !ns.is_empty()),
        }
    }
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run the controller until interrupted (default)
    Run,
    /// Reconcile every workload once and exit
    ReconcileOnce,
}

fn init_tracing() {
    let env = std::env::var("CARTO_LOG").unwrap_or_else(|_| "info".to_string());
    let filter = tracing_subscriber::EnvFilter::from_str(&env).unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    tracing_subscriber::fmt().with_env_filter(filter).with_target(true).init();
}

fn init_metrics() {
    if let Ok(addr) = std::env::var("CARTO_METRICS_ADDR") {
        if let Ok(sock) = addr.parse::<std::net::SocketAddr>() {
            let builder = metrics_exporter_prometheus::PrometheusBuilder::new();
            match builder.with_http_listener(sock).install() {
                Ok(_) => info!(addr = %addr, "Prometheus metrics exporter listening"),
                Err(e) => warn!(error = %e, "failed to install metrics exporter"),
            }
        } else {
            warn!(addr = %addr, "invalid CARTO_METRICS_ADDR; expected host:port");
        }
    }
    describe_counter!("workload_reconcile_total", "Workload reconciliations started");
    describe_counter!("workload_reconcile_errors_total", "Workload reconciliations that returned an error");
    describe_counter!("stamped_object_apply_total", "Stamped objects applied to the cluster");
    describe_counter!("stamped_object_apply_skipped_total", "Applies skipped because the live object already matched");
    describe_counter!("orphan_delete_total", "Stamped objects deleted after leaving the supply chain");
    describe_counter!("stamped_watch_started_total", "Watches started on stamped kinds");
    describe_counter!("dependency_lookup_total", "Dependency tracker lookups");
    describe_counter!("resource_realize_total", "Supply chain resources realized, by result");
}

async fn reconcile_once(kube_config: kube::Config, config: ControllerConfig) -> Result<()> {
    let client = kube::Client::try_from(kube_config.clone()).context("building controller client")?;
    let parts = Components::new(client.clone(), kube_config, &config);
    let (informers, _requests) = InformerTracker::new(client, Arc::clone(&parts.scheme), config.namespace.clone());
    let reconciler = WorkloadReconciler::new(parts.repository, parts.builder, parts.tracker, Arc::new(informers));

    let results = reconciler.reconcile_all().await?;
    let mut failed = 0usize;
    for (key, res) in &results {
        match res {
            Ok(()) => info!(workload = %key, "reconciled"),
            Err(e) => {
                failed += 1;
                error!(workload = %key, error = %e, "reconcile failed");
            }
        }
    }
    info!(total = results.len(), failed, "reconcile pass finished");
    if failed > 0 {
        anyhow::bail!("{} of {} workloads failed to reconcile", failed, results.len());
    }
    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    init_metrics();
    let cli = Cli::parse();
    let config = ControllerConfig::from(cli.config);
    let kube_config = kube::Config::infer().await.context("inferring kubeconfig")?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => carto_controller::run(kube_config, config).await,
        Commands::ReconcileOnce => reconcile_once(kube_config, config).await,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_match_controller_config() {
        let cli = Cli::try_parse_from(["carto-controller"]).unwrap();
        assert!(cli.command.is_none());
        let config = ControllerConfig::from(cli.config);
        let defaults = ControllerConfig::default();
        assert_eq!(config.resync, defaults.resync);
        assert_eq!(config.error_backoff, defaults.error_backoff);
        assert_eq!(config.cache_ttl, defaults.cache_ttl);
    }

    #[test]
    fn flags_override_and_empty_namespace_means_all() {
        let cli = Cli::try_parse_from(["carto-controller", "reconcile-once", "--resync-secs", "60", "--ns", ""]).unwrap();
        assert!(matches!(cli.command, Some(Commands::ReconcileOnce)));
        let config = ControllerConfig::from(cli.config);
        assert_eq!(config.resync, Duration::from_secs(60));
        assert!(config.namespace.is_none());
    }
}
