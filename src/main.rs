use anyhow::{Context, Result};
use tokio::{net::TcpListener, select, signal};

use std::future::IntoFuture;

mod api;
mod config;
mod db;
mod error;
mod ingest;
mod mqtt;
mod query;

use api::AppState;
use config::Config;
use db::Store;
use ingest::Gateway;
use mqtt::Broker;
use query::QueryService;

fn init_logging() {
    let mut builder = pretty_env_logger::formatted_timed_builder();
    builder.filter_level(log::LevelFilter::Info);
    if let Ok(filters) = std::env::var("RUST_LOG") {
        builder.parse_filters(&filters);
    }
    builder.init();
}

#[tokio::main]
async fn main() -> Result<()> {
    // Config first: it loads `.env`, which may set RUST_LOG.
    let config = Config::from_env().context("invalid configuration")?;
    init_logging();
    log::info!("Starting with {config:?}");

    let store = Store::open(&config.db_path)?;
    store
        .initialize()
        .await
        .context("failed to initialize the measurement table")?;

    let gateway = Gateway::new(store.clone());
    let app = api::router(AppState {
        gateway: gateway.clone(),
        queries: QueryService::new(store),
        development: config.development,
    });

    let listener = TcpListener::bind(config.http_addr)
        .await
        .with_context(|| format!("failed to bind HTTP listener on {}", config.http_addr))?;
    log::info!("HTTP server listening on http://{}", config.http_addr);

    let broker = Broker::bind(config.mqtt_addr, gateway.clone())
        .await
        .with_context(|| format!("failed to bind MQTT broker on {}", config.mqtt_addr))?;
    log::info!("MQTT broker listening on {}", broker.local_addr()?);

    select! {
        served = axum::serve(listener, app).into_future() => served.context("HTTP server failed")?,
        _ = broker.run() => {},
        _ = signal::ctrl_c() => log::info!("Shutting down"),
    }

    log::info!(
        "Discarded {} non-numeric MQTT payloads this run",
        gateway.discarded()
    );
    Ok(())
}
