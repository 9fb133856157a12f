use anyhow::{Context, Result};
use std::process::ExitCode;
use std::sync::Arc;
use tokio::signal;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{error, info, instrument, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use disbelieve::config::Environment;
use disbelieve::execution::{PositionSupervisor, TaskContext, TradeApiGateway};
use disbelieve::ingest::{AccountSubscriptions, EventSource, MintDiscovery, RpcLookup, StopSignal};
use disbelieve::transport::PriceFeed;

struct ServiceOrchestrator {
    env: Environment,
    stop: StopSignal,
    tasks: Vec<(&'static str, JoinHandle<()>)>,
}

impl ServiceOrchestrator {
    fn new(env: Environment) -> Self {
        Self {
            env,
            stop: StopSignal::new(),
            tasks: Vec::new(),
        }
    }

    #[instrument(skip(self))]
    fn start_all_services(&mut self) -> Result<()> {
        info!("Starting Disbelieve services");

        let lookup = Arc::new(RpcLookup::new(self.env.http_rpc_url.clone())?);
        let gateway = Arc::new(
            TradeApiGateway::new(
                self.env.trade_api.clone(),
                Arc::clone(&self.env.keypair),
                lookup.rpc_client(),
            )
            .context("Failed to build trade gateway")?,
        );
        let source = EventSource::new(self.env.ws_rpc_url.clone(), self.env.reconnect);
        let feed = PriceFeed::new();
        let (samples_tx, samples_rx) = mpsc::channel(4096);
        let (discovered_tx, discovered_rx) = mpsc::channel(256);

        // Listing log subscription feeding discovery
        let events = source.subscribe_logs(self.env.launch_program, self.stop.clone());
        let discovery = MintDiscovery::new(lookup.clone());
        let stop = self.stop.clone();
        self.tasks.push((
            "discovery",
            tokio::spawn(discovery.run(events, discovered_tx, stop)),
        ));

        // Decoded pool updates into the latest-price feed
        let verbose = self.env.settings.verbose_prices();
        let stop = self.stop.clone();
        self.tasks.push((
            "price consumer",
            tokio::spawn(feed.clone().run_consumer(samples_rx, verbose, stop)),
        ));

        // One position task per discovered token
        let ctx = TaskContext {
            settings: self.env.settings.clone(),
            poll_interval: self.env.poll_interval,
            lookup,
            gateway,
            subscriptions: AccountSubscriptions::new(source),
            feed,
            samples: samples_tx,
        };
        let stop = self.stop.clone();
        self.tasks.push((
            "supervisor",
            tokio::spawn(async move {
                let ledger = PositionSupervisor::new(ctx).run(discovered_rx, stop).await;
                info!(?ledger, "Final position ledger");
            }),
        ));

        info!(services = self.tasks.len(), "All services started");
        Ok(())
    }

    #[instrument(skip(self))]
    async fn shutdown_all(&mut self) {
        info!("Shutting down all services");
        self.stop.stop();

        for (name, task) in self.tasks.drain(..) {
            match task.await {
                Ok(()) => info!(service = name, "Service shut down cleanly"),
                Err(e) => error!(service = name, error = %e, "Service task failed"),
            }
        }
    }
}

fn init_tracing() -> Result<()> {
    std::fs::create_dir_all("logs")?;

    let file_appender = tracing_appender::rolling::daily("logs", "disbelieve.log");
    let (non_blocking_file, guard) = tracing_appender::non_blocking(file_appender);

    let console_layer = tracing_subscriber::fmt::layer()
        .with_target(false)
        .with_level(true)
        .compact();

    let file_layer = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking_file)
        .json()
        .with_current_span(false)
        .with_span_list(true);

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    // Keep the writer alive for the whole process
    std::mem::forget(guard);

    Ok(())
}

#[tokio::main]
async fn main() -> ExitCode {
    if let Err(e) = init_tracing() {
        eprintln!("Failed to initialize logging: {}", e);
        return ExitCode::FAILURE;
    }

    let env = match Environment::load() {
        Ok(env) => env,
        Err(e) => {
            error!("Configuration error: {}", e);
            return ExitCode::FAILURE;
        }
    };

    info!("☆ Disbelieve ☆");
    info!(wallet = %env.wallet(), launch_program = %env.launch_program, "Configuration loaded");

    let mut orchestrator = ServiceOrchestrator::new(env);
    if let Err(e) = orchestrator.start_all_services() {
        error!("Failed to start services: {:#}", e);
        return ExitCode::FAILURE;
    }
    info!("Watching for new listings. Press Ctrl+C to stop");

    match signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => warn!("Failed to listen for shutdown signal: {}", e),
    }

    orchestrator.shutdown_all().await;
    info!("Program stopped by user");
    ExitCode::SUCCESS
}
