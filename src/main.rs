//! Network Defense Service
//!
//! This is the main entry point for the network defense service.
//! It initializes the detection pipeline and starts the web server.

use std::net::SocketAddr;
use std::path::Path;
use std::sync::Arc;

use actix_web::{web, App, HttpServer};
use anyhow::Context;
use dotenv::dotenv;
use log::info;
use metrics_exporter_prometheus::PrometheusBuilder;
use tokio::sync::{mpsc, watch};

use network_defense_service::api::{self, ApiState};
use network_defense_service::config;
use network_defense_service::core::firewall::backend_from_config;
use network_defense_service::core::store::open_store;
use network_defense_service::core::{DefensePipeline, ThreatIntelChain};

#[actix_web::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenv().ok();

    // Initialize logging
    env_logger::init();

    info!("Starting Network Defense Service...");

    // Load configuration
    let config = config::load_config().context("Failed to load configuration")?;
    let config = Arc::new(config);

    if config.metrics.enabled {
        let listen: SocketAddr = config
            .metrics
            .listen
            .parse()
            .with_context(|| format!("Invalid metrics listen address '{}'", config.metrics.listen))?;
        PrometheusBuilder::new()
            .with_http_listener(listen)
            .install()
            .context("Failed to start metrics exporter")?;
        info!("Metrics exposed on {}", listen);
    }

    // Initialize storage and firewall access
    let store = open_store(
        &config.storage.backend,
        Path::new(&config.storage.path),
        &config.redis.url,
        &config.storage.key_prefix,
    )
    .await
    .context("Failed to open block store")?;
    let backend = backend_from_config(&config.firewall)?;
    let threat_intel = ThreatIntelChain::from_config(&config.threat_intel)?;

    // Start the pipeline
    let pipeline = Arc::new(DefensePipeline::new(&config, store, backend, threat_intel)?);
    let (observations_tx, observations_rx) = mpsc::channel(config.pipeline.observation_channel_capacity.max(1));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let handles = pipeline.clone().spawn(observations_rx, shutdown_rx);

    // Create API state
    let state = web::Data::new(ApiState {
        pipeline,
        observations: observations_tx,
        config: config.clone(),
    });

    // Start HTTP server
    HttpServer::new(move || App::new().app_data(state.clone()).configure(api::config))
        .bind((config.server.host.as_str(), config.server.port))?
        .run()
        .await?;

    info!("Shutting down pipeline...");
    let _ = shutdown_tx.send(true);
    futures::future::join_all(handles).await;
    Ok(())
}
