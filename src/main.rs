//! nodelink: keep gRPC clients to long-lived nodes connected
//!
//! For every configured service this binary:
//! - resolves the newest schema descriptor
//! - connects over TLS with the node's secret token
//! - opens the configured streams once the connection has settled
//! - cancels them and disconnects on Ctrl-C

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context};
use clap::{Parser, Subcommand};
use tracing::{error, info, warn};

use nodelink::config::{Config, ServiceConfig, TimingConfig};
use nodelink::schema::{InterfaceLoader, SchemaVersion};
use nodelink::{
    ConfiguredStreams, GrpcTransport, LifecycleState, NodeService, StreamRegistrar, Transport,
};

#[derive(Parser)]
#[command(name = "nodelink")]
#[command(about = "Lifecycle manager for gRPC clients to long-lived nodes")]
struct Cli {
    /// Path to configuration file
    #[arg(short, long, default_value = "nodelink.toml", env = "NODELINK_CONFIG")]
    config: PathBuf,

    /// Only act on this service id
    #[arg(short, long, env = "NODELINK_SERVICE")]
    service: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Connect, open the configured streams and run until Ctrl-C
    Run,
    /// Connect and disconnect once, reporting the outcome
    Check,
    /// Print the schema version and methods each service would use
    Schema,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    let config = Config::load(&cli.config)
        .with_context(|| format!("loading {}", cli.config.display()))?;

    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(config.logging.filter.parse()?),
        )
        .init();

    info!("Config file: {}", cli.config.display());

    let services = select(&config, cli.service.as_deref())?;

    match cli.command {
        Command::Run => run(services, &config.timing).await,
        Command::Check => check(services, &config.timing).await,
        Command::Schema => schema(services),
    }
}

fn select<'a>(config: &'a Config, only: Option<&str>) -> anyhow::Result<Vec<&'a ServiceConfig>> {
    match only {
        Some(id) => match config.service(id) {
            Some(service) => Ok(vec![service]),
            None => bail!("no service {:?} in config", id),
        },
        None if config.services.is_empty() => bail!("no services configured"),
        None => Ok(config.services.iter().collect()),
    }
}

fn node_service(
    config: &ServiceConfig,
    timing: &TimingConfig,
    transport: Arc<dyn Transport>,
) -> NodeService<ConfiguredStreams> {
    NodeService::new(
        config.clone(),
        timing.clone(),
        transport,
        ConfiguredStreams::new(config.streams.clone()),
    )
}

async fn run(services: Vec<&ServiceConfig>, timing: &TimingConfig) -> anyhow::Result<()> {
    let transport: Arc<dyn Transport> = Arc::new(GrpcTransport::new());

    let mut tasks = Vec::new();
    for config in services {
        let service = node_service(config, timing, transport.clone());
        tasks.push(tokio::spawn(async move {
            if let Err(e) = service.connect().await {
                error!(service = %service.id(), error = %e, "Connect failed");
            }
            service
        }));
    }

    let mut attempted = Vec::new();
    for task in futures::future::join_all(tasks).await {
        attempted.push(task?);
    }
    let connected = keep_connected(attempted)?;

    tokio::signal::ctrl_c().await?;
    info!("Shutting down");

    let disconnects = connected
        .iter()
        .filter(|service| service.can(nodelink::Transition::Disconnect))
        .map(|service| async move {
            if let Err(e) = service.disconnect().await {
                error!(service = %service.id(), error = %e, "Disconnect failed");
            }
        });
    futures::future::join_all(disconnects).await;

    Ok(())
}

/// Services that reached `connected`; an error when none did
fn keep_connected<R: StreamRegistrar>(
    services: Vec<NodeService<R>>,
) -> anyhow::Result<Vec<NodeService<R>>> {
    let total = services.len();
    let connected: Vec<_> = services
        .into_iter()
        .filter(|service| service.is_in_state(LifecycleState::Connected))
        .collect();

    if connected.is_empty() {
        bail!("none of {} service(s) connected", total);
    }
    if connected.len() < total {
        warn!(connected = connected.len(), total, "Running with some services disconnected");
    }
    Ok(connected)
}

async fn check(services: Vec<&ServiceConfig>, timing: &TimingConfig) -> anyhow::Result<()> {
    let transport: Arc<dyn Transport> = Arc::new(GrpcTransport::new());
    let mut failed = 0;

    for config in services {
        let service = node_service(config, timing, transport.clone());
        match service.connect().await {
            Ok(()) => {
                let version = service
                    .schema_version()
                    .await
                    .map(|v| v.to_string())
                    .unwrap_or_default();
                service.disconnect().await?;
                println!("{}: ok (schema v{})", config.id, version);
            }
            Err(e) => {
                failed += 1;
                println!("{}: failed: {}", config.id, e);
            }
        }
    }

    if failed > 0 {
        bail!("{} service(s) failed to connect", failed);
    }
    Ok(())
}

fn schema(services: Vec<&ServiceConfig>) -> anyhow::Result<()> {
    for config in services {
        let pinned = config
            .schema_version
            .as_deref()
            .map(str::parse::<SchemaVersion>)
            .transpose()?;
        let factory = InterfaceLoader::new(&config.schema_dir)
            .load(pinned.as_ref(), &config.rpc_service)
            .with_context(|| format!("service {}", config.id))?;

        println!("{}: {} v{}", config.id, factory.service_name(), factory.version());
        for method in factory.methods() {
            println!("  {} ({})", method.name, method.kind.as_str());
        }
    }
    Ok(())
}
