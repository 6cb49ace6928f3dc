mod routes;
mod controllers;
mod services;
mod models;
mod api_docs;
mod shared_state;
mod config;
mod error;
#[cfg(test)]
mod test_support;

use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use axum_server::Handle;
use clap::Parser;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};
use utoipa::OpenApi;

use crate::api_docs::ApiDoc;
use crate::config::Config;
use crate::models::forecast::RefreshTrigger;
use crate::services::coordinator::{CoordinatorSettings, UpdateCoordinator};
use crate::services::forecast_cache::ForecastCache;
use crate::services::forecast_service::ForecastService;
use crate::services::weather_client::OpenMeteoClient;
use crate::shared_state::{AppState, SharedState};

#[cfg(feature = "verbose_log")]
const DEFAULT_LOG_FILTER: &str = "debug";
#[cfg(not(feature = "verbose_log"))]
const DEFAULT_LOG_FILTER: &str = "info";

#[derive(Debug, Parser)]
#[command(version, about = "Multi-array solar production forecast service")]
struct Args {
    /// Path of the JSON configuration file
    #[arg(long, default_value = "config.json")]
    config: PathBuf,
    /// Print the OpenAPI document as JSON and exit
    #[arg(long, default_value_t = false)]
    print_openapi: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();
    if args.print_openapi {
        println!("{}", ApiDoc::openapi().to_pretty_json()?);
        return Ok(());
    }

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    // 1. Load configuration
    let config = Config::load(&args.config)
        .with_context(|| format!("failed to load {}", args.config.display()))?;
    info!(entry_id = %config.entry_id, arrays = config.arrays.len(), "configuration loaded");

    // 2. Ctrl-C cancels everything and drains the HTTP server
    let shutdown = CancellationToken::new();
    let handle = Handle::new();
    tokio::spawn({
        let handle = handle.clone();
        let shutdown = shutdown.clone();
        async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("cannot listen for Ctrl-C: {e}");
                return;
            }
            info!("shutdown requested");
            shutdown.cancel();
            handle.graceful_shutdown(Some(Duration::from_secs(10)));
        }
    });

    // 3. Build the forecast core
    let provider = OpenMeteoClient::new(&config.weather).context("failed to build weather client")?;
    let settings = CoordinatorSettings::from_config(&config).context("invalid location settings")?;
    let coordinator = UpdateCoordinator::new(
        Arc::new(provider),
        ForecastCache::new(),
        settings,
        config.arrays.clone(),
        shutdown.clone(),
    );

    // 4. First refresh, then the scheduler
    match coordinator.refresh_all(RefreshTrigger::Startup).await {
        Ok(summary) if summary.total_failure() => {
            warn!("startup refresh produced no forecast, serving unavailable until the next cycle");
        }
        Ok(_) => {}
        Err(e) => error!("startup refresh did not complete: {e}"),
    }
    let scheduler = coordinator.start(config.update_interval(), shutdown.clone());

    let state = AppState::new(ForecastService::new(Arc::clone(&coordinator), config.entry_id.clone()));

    // 5. MQTT sensor publisher
    let mqtt = tokio::spawn(services::mqtt_service::run_publisher(
        config.mqtt.clone(),
        state.clone(),
        config.update_interval(),
        shutdown.clone(),
    ));

    // 6. HTTP query/command surface
    let addr = SocketAddr::from(([0, 0, 0, 0], config.server.port));
    let app = routes::app(SharedState { app: state, config: Arc::new(config) });

    info!("API server listening on http://{addr}");
    info!("Scalar UI: http://{addr}/scalar");

    axum_server::bind(addr)
        .handle(handle)
        .serve(app.into_make_service())
        .await
        .with_context(|| format!("HTTP server on {addr} failed"))?;

    let _ = scheduler.await;
    let _ = mqtt.await;
    info!("stopped");
    Ok(())
}
