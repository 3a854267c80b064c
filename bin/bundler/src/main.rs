//! Bundler binary entry point.

mod cli;

use std::sync::Arc;

use bundler_lib::{
    BundlePipelineBuilder, BundlerClient, BundlerService, ChainClient, Database, OperationStore,
    RelayGateway, ReputationTracker, RpcChainClient, SharedChainClient, SubmissionGateway,
    ValidationPipelineBuilder, launch, spawn_compaction, spawn_decay,
};
use clap::Parser;
use eyre::WrapErr;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::cli::Cli;

#[tokio::main]
async fn main() -> eyre::Result<()> {
    dotenvy::dotenv().ok();

    let cli = Cli::parse();
    cli.log.init_tracing_subscriber()?;
    if let Some(addr) = cli.metrics.init()? {
        info!(target: "bundler", addr = %addr, "Prometheus exporter started");
    }

    let config = cli.config;
    let signer = config.signer()?;
    let entry_points = config.entry_points()?;
    let beneficiary = config.beneficiary_or(signer.address());

    let chain: SharedChainClient = Arc::new(RpcChainClient::new(config.node_url.clone()));
    let node_chain_id = chain.chain_id().await.wrap_err("failed to query node chain id")?;
    let chain_id = config.chain_id.unwrap_or(node_chain_id);

    let gateway = Arc::new(RelayGateway::new(
        Arc::clone(&chain),
        signer.clone(),
        beneficiary,
        config.gateway_config(chain_id),
    )?);
    gateway.verify_chain().await.wrap_err("chain check failed")?;

    let db = Arc::new(
        Database::open(&config.data_directory)
            .wrap_err_with(|| format!("failed to open {}", config.data_directory.display()))?,
    );
    let store = Arc::new(OperationStore::open(Arc::clone(&db), config.store_config(chain_id))?);
    let tracker = Arc::new(ReputationTracker::open(Arc::clone(&db), config.reputation_config())?);

    info!(
        target: "bundler",
        chain_id,
        signer = %signer.address(),
        beneficiary = %beneficiary,
        entry_points = ?entry_points,
        data_directory = %config.data_directory.display(),
        debug = config.debug_mode,
        "Starting bundler"
    );

    let validation = ValidationPipelineBuilder::new(Arc::clone(&store), Arc::clone(&tracker), Arc::clone(&chain))
        .with_config(config.validation_config())
        .build();

    let bundler_config = config.bundler_config();
    let pipeline = BundlePipelineBuilder::new(
        Arc::clone(&store),
        Arc::clone(&tracker),
        Arc::clone(&chain),
        gateway as Arc<dyn SubmissionGateway>,
    )
    .with_config(bundler_config.clone())
    .build();
    let service = Arc::new(BundlerService::new(pipeline, &entry_points, bundler_config));

    let client = BundlerClient::new(
        Arc::new(validation),
        store,
        Arc::clone(&tracker),
        chain,
        config.client_config(chain_id),
    )
    .with_bundler(Arc::clone(&service));

    let cancel = CancellationToken::new();
    let mut tasks = vec![
        spawn_compaction(db, config.compaction_interval(), cancel.clone()),
        spawn_decay(tracker, cancel.clone()),
    ];
    tasks.extend(Arc::clone(&service).spawn(cancel.clone()));

    let (server, addr) = launch(Arc::new(client), config.rpc_addr, config.debug_mode).await?;
    info!(target: "bundler", addr = %addr, "Bundler ready");

    tokio::signal::ctrl_c().await.wrap_err("failed to listen for shutdown signal")?;
    info!(target: "bundler", "Shutting down");

    cancel.cancel();
    if let Err(e) = server.stop() {
        warn!(target: "bundler", error = %e, "RPC server already stopped");
    }
    for task in tasks {
        if let Err(e) = task.await {
            warn!(target: "bundler", error = %e, "Background task failed");
        }
    }
    server.stopped().await;

    info!(target: "bundler", "Bundler stopped");
    Ok(())
}
