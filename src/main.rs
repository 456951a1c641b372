use std::{process, sync::Arc};

use aula::{
    cache::{CacheConfig, ResponseCache, TagRegistry},
    config,
    error::AppError,
    gateway::{self, GatewayState},
    telemetry,
};
use clap::Parser;
use tracing::{Dispatch, Level, dispatcher, error, info};
use tracing_subscriber::fmt as tracing_fmt;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        report_application_error(&error);
        process::exit(1);
    }
}

fn report_application_error(error: &AppError) {
    if dispatcher::has_been_set() {
        error!(error = %error, "application error");
        return;
    }

    let subscriber = tracing_fmt().with_max_level(Level::ERROR).finish();
    let dispatch = Dispatch::new(subscriber);
    dispatcher::with_default(&dispatch, || {
        error!(error = %error, "application error");
    });
}

async fn run() -> Result<(), AppError> {
    let cli = config::CliArgs::parse();
    let settings = config::load(&cli)
        .map_err(|err| AppError::configuration(format!("failed to load configuration: {err}")))?;

    telemetry::init(&settings.logging)?;

    if settings.gateway.invalidation_secret.is_none() {
        error!("no invalidation secret configured; invalidation requests will be rejected");
    }

    let registry = Arc::new(TagRegistry::new());
    let cache = Arc::new(ResponseCache::new(
        &CacheConfig::from(&settings.cache),
        registry,
    ));

    let state = GatewayState {
        settings: settings.gateway.clone(),
        target: cache,
    };
    let router = gateway::build_router(state);

    let listener = tokio::net::TcpListener::bind(settings.server.listen_addr)
        .await
        .map_err(|err| AppError::server(format!("failed to bind listener: {err}")))?;
    info!(addr = %settings.server.listen_addr, "cache gateway listening");

    axum::serve(listener, router.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await
        .map_err(|err| AppError::server(err.to_string()))?;

    info!("cache gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    if let Err(err) = tokio::signal::ctrl_c().await {
        error!(error = %err, "failed to listen for shutdown signal");
        return;
    }
    info!("shutdown signal received");
}
