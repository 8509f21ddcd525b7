//! nodeport-registrar - keeps an external registrar in step with NodePort Services

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use nodeport_registrar::cluster::{build_client, ClientSettings, ClusterClient, KubeClusterClient};
use nodeport_registrar::config::{Config, RunArgs};
use nodeport_registrar::controller::{Context, Reconciler};
use nodeport_registrar::dispatch::Dispatcher;
use nodeport_registrar::event::{run_event_source, service_watcher};
use nodeport_registrar::health::{self, HealthState};
use nodeport_registrar::registrar::HttpRegistrar;
use nodeport_registrar::resolver::AddressResolver;
use nodeport_registrar::retry::{retry_with_backoff, RetryConfig};
use nodeport_registrar::telemetry::init_tracing;

/// Attempts to reach the control plane at startup before giving up
const STARTUP_CONNECT_ATTEMPTS: u32 = 10;

/// nodeport-registrar - announces NodePort Services to a load-balancer registrar
#[derive(Parser, Debug)]
#[command(name = "nodeport-registrar", version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    run: RunArgs,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Watch Services and drive the registrar (default mode)
    Run,

    /// Resolve the listener address once and exit
    ///
    /// Connects to the cluster, lists nodes and prints the address that
    /// registrations would carry. Nothing is sent to the registrar.
    Check,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(cli.run.log_json)?;

    let config = Config::try_from(cli.run)?;

    match cli.command {
        Some(Commands::Check) => run_check(config).await,
        Some(Commands::Run) | None => run_controller(config).await,
    }
}

async fn connect(config: &Config) -> anyhow::Result<kube::Client> {
    let settings = ClientSettings {
        kubeconfig: config.kubeconfig.clone(),
        context: config.context.clone(),
        connect_timeout: config.kube_connect_timeout,
        read_timeout: config.kube_read_timeout,
    };
    let retry = RetryConfig::with_max_attempts(STARTUP_CONNECT_ATTEMPTS);
    let client = retry_with_backoff(
        &retry,
        "connect",
        |e: &nodeport_registrar::Error| e.is_retryable(),
        || build_client(&settings),
    )
    .await?;
    Ok(client)
}

async fn run_check(config: Config) -> anyhow::Result<()> {
    let client = connect(&config).await?;
    let cluster = KubeClusterClient::new(client);
    let resolver = AddressResolver::new(config.node_selector.clone(), &config.address_annotation);

    let nodes = cluster.list_nodes().await?;
    let address = resolver.resolve(&nodes)?;
    info!(
        nodes = nodes.len(),
        selector = %config.node_selector,
        address = %address,
        "Listener address resolved"
    );
    println!("{address}");
    Ok(())
}

async fn run_controller(config: Config) -> anyhow::Result<()> {
    info!(
        registrar = %config.registrar_url,
        namespace = config.namespace.as_deref().unwrap_or("*"),
        selector = %config.node_selector,
        workers = config.workers,
        "Starting nodeport-registrar"
    );

    let health_listener = health::bind(config.health_addr).await?;
    let client = connect(&config).await?;

    let health = Arc::new(HealthState::new(config.failure_threshold));
    let registrar = HttpRegistrar::new(&config.registrar_url, config.registrar_timeout)?;
    let ctx = Arc::new(
        Context::builder(
            Arc::new(KubeClusterClient::new(client.clone())),
            Arc::new(registrar),
        )
        .resolver(AddressResolver::new(
            config.node_selector.clone(),
            &config.address_annotation,
        ))
        .retry(config.retry.clone())
        .health(health.clone())
        .build(),
    );

    let dispatcher = Arc::new(Dispatcher::spawn(
        Arc::new(Reconciler::new(ctx)),
        config.workers,
        config.queue_depth,
    ));

    let cancel = CancellationToken::new();
    tokio::spawn(shutdown_on_signal(cancel.clone()));

    let mut health_task = tokio::spawn(health::serve(
        health_listener,
        health.clone(),
        cancel.clone(),
    ));

    let event_source = run_event_source(
        service_watcher(client, config.namespace.as_deref()),
        dispatcher.clone(),
        health,
        cancel.clone(),
    );
    tokio::pin!(event_source);

    let health_done = tokio::select! {
        _ = &mut event_source => None,
        result = &mut health_task => {
            if !cancel.is_cancelled() {
                error!("Health server stopped, shutting down");
                cancel.cancel();
            }
            event_source.await;
            Some(result)
        }
    };

    // Stream ended on its own; stop the health server too
    cancel.cancel();

    info!("Draining in-flight events");
    dispatcher.shutdown(config.shutdown_grace).await;

    let health_result = match health_done {
        Some(result) => result,
        None => health_task.await,
    };
    match health_result {
        Ok(Ok(())) => {}
        Ok(Err(e)) => warn!(error = %e, "Health server exited with error"),
        Err(e) => warn!(error = %e, "Health server task panicked"),
    }

    info!("Shutdown complete");
    Ok(())
}

async fn shutdown_on_signal(cancel: CancellationToken) {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        match signal(SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = tokio::signal::ctrl_c() => info!("Received SIGINT"),
                    _ = term.recv() => info!("Received SIGTERM"),
                }
            }
            Err(e) => {
                error!(error = %e, "Failed to install SIGTERM handler");
                let _ = tokio::signal::ctrl_c().await;
                info!("Received SIGINT");
            }
        }
    }
    #[cfg(not(unix))]
    {
        let _ = tokio::signal::ctrl_c().await;
        info!("Received SIGINT");
    }
    cancel.cancel();
}
