use berth_core::{yaml_documents, Node, Pod};
use berth_scheduler::recorder::BroadcastEventSink;
use berth_scheduler::{InMemoryCluster, Policy, SchedulerBuilder, SchedulerConfiguration};
use clap::{Parser, Subcommand, ValueEnum};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

#[derive(Parser)]
#[command(name = "berth", about = "Berth pod placement engine")]
struct Cli {
    /// Log output format
    #[arg(long, global = true, value_enum, default_value = "text", env = "BERTH_LOG_FORMAT")]
    log_format: LogFormat,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Clone, Copy, ValueEnum)]
enum LogFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler against an in-memory cluster seeded from a manifest
    Run {
        /// Scheduler configuration file (YAML or JSON)
        #[arg(long, env = "BERTH_CONFIG")]
        config: Option<PathBuf>,
        /// Multi-document YAML manifest of Nodes and Pods
        #[arg(long, env = "BERTH_CLUSTER")]
        cluster: Option<PathBuf>,
    },
    /// Validate a configuration and print the resolved profiles
    CheckConfig {
        #[arg(long, env = "BERTH_CONFIG")]
        config: Option<PathBuf>,
    },
    /// Validate a legacy policy document and print its plugin mapping
    CheckPolicy {
        /// Policy file (YAML or JSON)
        path: PathBuf,
    },
}

#[tokio::main]
async fn main() -> miette::Result<()> {
    let cli = Cli::parse();

    let filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info"));
    match cli.log_format {
        LogFormat::Text => tracing_subscriber::fmt().with_env_filter(filter).init(),
        LogFormat::Json => tracing_subscriber::fmt().json().with_env_filter(filter).init(),
    }

    match cli.command {
        Commands::Run { config, cluster } => run(config.as_deref(), cluster.as_deref()).await,
        Commands::CheckConfig { config } => check_config(config.as_deref()),
        Commands::CheckPolicy { path } => check_policy(&path),
    }
}

fn load_config(path: Option<&Path>) -> miette::Result<SchedulerConfiguration> {
    match path {
        Some(path) => Ok(SchedulerConfiguration::load(path)?),
        None => Ok(SchedulerConfiguration::default()),
    }
}

/// Nodes and pods from a seed manifest; other kinds are skipped
fn load_manifest(path: &Path) -> miette::Result<(Vec<Node>, Vec<Pod>)> {
    let data = std::fs::read_to_string(path)
        .map_err(|e| miette::miette!("Failed to read manifest '{}': {}", path.display(), e))?;

    let mut nodes = Vec::new();
    let mut pods = Vec::new();
    for document in yaml_documents(&data)? {
        let kind = document
            .get("kind")
            .and_then(|k| k.as_str())
            .unwrap_or_default()
            .to_string();
        match kind.as_str() {
            "Node" => nodes.push(
                serde_json::from_value(document)
                    .map_err(|e| miette::miette!("Invalid Node in manifest: {}", e))?,
            ),
            "Pod" => pods.push(
                serde_json::from_value(document)
                    .map_err(|e| miette::miette!("Invalid Pod in manifest: {}", e))?,
            ),
            other => warn!("Skipping manifest document of kind '{}'", other),
        }
    }
    Ok((nodes, pods))
}

async fn run(config_path: Option<&Path>, manifest: Option<&Path>) -> miette::Result<()> {
    let config = load_config(config_path)?;
    let cleanup_interval = config.cache_cleanup_interval();

    let cluster = Arc::new(InMemoryCluster::default());
    let sink = Arc::new(BroadcastEventSink::default());
    let scheduler = Arc::new(
        SchedulerBuilder::new(cluster.clone(), sink.clone())
            .config(config)
            .build()?,
    );
    info!(
        "Built scheduler with profiles {:?}",
        scheduler.profiles().names()
    );

    let token = CancellationToken::new();

    // 1. Watch sync, subscribed before seeding so no object is missed
    let handlers = scheduler.event_handlers();
    let watch_handle = tokio::spawn(handlers.run(cluster.subscribe(), token.clone()));

    // 2. Assumed pod expiry
    let cleanup_handle = tokio::spawn(
        scheduler
            .cache()
            .clone()
            .run_cleanup(cleanup_interval, token.clone()),
    );

    // 3. Event log
    let mut events = sink.subscribe();
    let events_token = token.clone();
    let events_handle = tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = events_token.cancelled() => return,
                event = events.recv() => match event {
                    Ok(event) => info!(
                        "Event {} {} for {}/{} from {}: {}",
                        event.type_.as_deref().unwrap_or(""),
                        event.reason.as_deref().unwrap_or(""),
                        event.involved_object.namespace.as_deref().unwrap_or(""),
                        event.involved_object.name.as_deref().unwrap_or(""),
                        event.reporting_component.as_deref().unwrap_or(""),
                        event.message.as_deref().unwrap_or(""),
                    ),
                    Err(RecvError::Lagged(skipped)) => warn!("Event log skipped {} events", skipped),
                    Err(RecvError::Closed) => return,
                },
            }
        }
    });

    // 4. Scheduler
    let scheduler_handle = tokio::spawn(scheduler.clone().run(token.clone()));

    if let Some(manifest) = manifest {
        let (nodes, pods) = load_manifest(manifest)?;
        info!(
            "Seeding cluster with {} nodes and {} pods from {}",
            nodes.len(),
            pods.len(),
            manifest.display()
        );
        for node in nodes {
            cluster.add_node(node).await;
        }
        for pod in pods {
            cluster.add_pod(pod).await;
        }
    }

    info!("All components started");

    tokio::signal::ctrl_c()
        .await
        .map_err(|e| miette::miette!("Failed to listen for ctrl-c: {}", e))?;

    info!("Shutting down gracefully...");
    token.cancel();

    let shutdown_timeout = Duration::from_secs(5);
    if tokio::time::timeout(shutdown_timeout, async {
        let _ = tokio::join!(watch_handle, cleanup_handle, events_handle, scheduler_handle);
    })
    .await
    .is_err()
    {
        error!("Components did not stop within {:?}", shutdown_timeout);
    }

    for binding in cluster.bindings().await {
        info!(
            "Bound {}/{} to {}",
            binding.metadata.namespace.as_deref().unwrap_or(""),
            binding.metadata.name.as_deref().unwrap_or(""),
            binding.target.name.as_deref().unwrap_or("")
        );
    }
    info!("Shutdown complete");

    Ok(())
}

fn check_config(path: Option<&Path>) -> miette::Result<()> {
    let config = load_config(path)?;
    let scheduler = SchedulerBuilder::new(
        Arc::new(InMemoryCluster::default()),
        Arc::new(BroadcastEventSink::default()),
    )
    .config(config)
    .build()?;

    for profile in scheduler.profiles().iter() {
        println!("profile {}", profile.name());
        for (point, plugins) in profile.framework().list_plugins() {
            println!("  {}: {}", point, plugins.join(", "));
        }
        for extender in profile.extenders() {
            println!("  extender: {}", extender.name());
        }
    }
    Ok(())
}

fn check_policy(path: &Path) -> miette::Result<()> {
    let policy = Policy::load(path)?;
    println!("filter plugins: {}", policy.to_filter_plugins()?.join(", "));
    for priority in &policy.priorities {
        println!("priority {} (weight {})", priority.name, priority.weight);
    }
    for extender in &policy.extenders {
        println!("extender {}", extender.url_prefix);
    }
    Ok(())
}
