//! event-healer - watches cluster events and deletes pods stuck in failure loops

use anyhow::{Context, Result};
use clap::{Parser, ValueEnum};
use event_healer::k8s::{KubeEventSource, KubePodActions};
use event_healer::{ClusterActions, EventSource, HealerConfig, NamespacePipeline, RemediationRateLimiter};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::signal;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

#[derive(Clone, Copy, Debug, Default, ValueEnum)]
enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Event Healer - automatic recovery of pods stuck in transient failure loops
#[derive(Parser)]
#[command(name = "event-healer")]
#[command(about = "Watches cluster events and deletes pods stuck in known failure loops")]
#[command(version)]
struct Cli {
    /// Path to the YAML configuration file
    #[arg(short, long, env = "EVENT_HEALER_CONFIG")]
    config: Option<PathBuf>,

    /// Namespace to watch (repeatable or comma separated); replaces the configured list
    #[arg(long = "namespace", env = "EVENT_HEALER_NAMESPACES", value_delimiter = ',')]
    namespaces: Vec<String>,

    /// Run every decision but never delete anything
    #[arg(short = 'n', long, env = "EVENT_HEALER_DRY_RUN")]
    dry_run: bool,

    /// Log output format
    #[arg(long, value_enum, default_value_t = LogFormat::Text, env = "EVENT_HEALER_LOG_FORMAT")]
    log_format: LogFormat,
}

fn init_tracing(format: LogFormat) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into());
    let registry = tracing_subscriber::registry().with(filter);
    match format {
        LogFormat::Text => registry.with(fmt::layer()).init(),
        LogFormat::Json => registry.with(fmt::layer().json()).init(),
    }
}

fn load_config(cli: &Cli) -> Result<HealerConfig> {
    let config = match &cli.config {
        Some(path) => HealerConfig::from_file(path)
            .with_context(|| format!("Failed to load configuration from {}", path.display()))?,
        None => HealerConfig::default(),
    };
    let config = config.with_overrides(cli.namespaces.clone(), cli.dry_run);
    config.validate().context("Invalid configuration")?;
    Ok(config)
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(cli.log_format);

    info!("Starting event-healer v{}", env!("CARGO_PKG_VERSION"));

    let config = load_config(&cli)?;
    info!(
        namespaces = ?config.namespaces,
        dry_run = config.dry_run,
        threshold = config.flapping_threshold,
        cooldown_secs = config.cooldown_seconds,
        max_actions = config.rate_limit.max_actions,
        "Configuration loaded"
    );
    if config.dry_run {
        info!("Dry-run mode: remediations are evaluated and logged but never applied");
    }

    let client = kube::Client::try_default()
        .await
        .context("Failed to create Kubernetes client")?;
    info!("Connected to Kubernetes cluster");

    let source: Arc<dyn EventSource> = Arc::new(KubeEventSource::new(client.clone()));
    let actions: Arc<dyn ClusterActions> = Arc::new(KubePodActions::new(client));
    let limiter = Arc::new(RemediationRateLimiter::new(config.rate_limit_config()));
    let cancel = CancellationToken::new();

    let mut pipelines = JoinSet::new();
    for namespace in &config.namespaces {
        let pipeline = NamespacePipeline::new(
            namespace.clone(),
            &config,
            Arc::clone(&source),
            Arc::clone(&actions),
            Arc::clone(&limiter),
            cancel.clone(),
        );
        let namespace = namespace.clone();
        pipelines.spawn(async move { (namespace, pipeline.run().await) });
    }

    let shutdown = cancel.clone();
    tokio::spawn(async move {
        shutdown_signal().await;
        shutdown.cancel();
    });

    let mut failed = Vec::new();
    while let Some(joined) = pipelines.join_next().await {
        match joined {
            Ok((namespace, Ok(stats))) => {
                info!(
                    namespace = %namespace,
                    events = stats.events,
                    applied = stats.applied,
                    simulated = stats.simulated,
                    "Pipeline finished"
                );
            }
            Ok((namespace, Err(e))) => {
                error!(namespace = %namespace, error = %e, "Pipeline failed; stopping all pipelines");
                failed.push(namespace);
                cancel.cancel();
            }
            Err(e) => {
                error!(error = %e, "Pipeline task aborted; stopping all pipelines");
                failed.push("<aborted>".to_string());
                cancel.cancel();
            }
        }
    }

    if !failed.is_empty() {
        anyhow::bail!("Event watch failed for namespaces: {}", failed.join(", "));
    }
    info!("event-healer stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {
            info!("Received Ctrl+C, shutting down gracefully");
        },
        () = terminate => {
            info!("Received SIGTERM, shutting down gracefully");
        },
    }
}
