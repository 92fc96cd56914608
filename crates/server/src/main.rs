mod api;
mod bootstrap;
mod health;

use std::time::Duration;

use anyhow::Result;
use axum::Router;
use frontdesk_core::config::{AppConfig, LoadOptions};
use frontdesk_gateway::spawn_dedup_sweeper;
use tokio::sync::watch;

fn init_logging(config: &AppConfig) {
    use frontdesk_core::config::LogFormat::*;
    use tracing::Level;

    let log_level = config.logging.level.parse::<Level>().unwrap_or(Level::INFO);

    match config.logging.format {
        Compact => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).compact().init();
        }
        Pretty => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).pretty().init();
        }
        Json => {
            tracing_subscriber::fmt().with_target(false).with_max_level(log_level).json().init();
        }
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    run().await
}

pub async fn run() -> Result<()> {
    // Logging must be up before bootstrap so its events are recorded.
    let config = AppConfig::load(LoadOptions::default())?;
    init_logging(&config);

    let app = bootstrap::bootstrap_with_config(config).await?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let api_state = api::ApiState {
        catalog: app.catalog.clone(),
        dispatcher: app.dispatcher.clone(),
        ledger: app.ledger.clone(),
        bus: app.bus.clone(),
        inbound_topic: app.config.gateway.inbound_topic.clone(),
    };
    let routes =
        Router::new().merge(health::router(app.db_pool.clone())).merge(api::router(api_state));
    let server = &app.config.server;
    let address = format!("{}:{}", server.bind_address, server.health_check_port);
    let listener = tokio::net::TcpListener::bind(&address).await?;
    tracing::info!(
        event_name = "system.http.start",
        correlation_id = "bootstrap",
        bind_address = %address,
        "http endpoint started"
    );
    let mut http_shutdown = shutdown_rx.clone();
    let http = tokio::spawn(async move {
        let serve = axum::serve(listener, routes).with_graceful_shutdown(async move {
            let _ = http_shutdown.changed().await;
        });
        if let Err(error) = serve.await {
            tracing::error!(
                event_name = "system.http.error",
                correlation_id = "bootstrap",
                error = %error,
                "http endpoint terminated unexpectedly"
            );
        }
    });

    let sweep_interval = Duration::from_secs(app.config.gateway.dedup_ttl_secs.max(1));
    let sweeper = spawn_dedup_sweeper(app.dedup.clone(), sweep_interval, shutdown_rx.clone());
    let consumer = app.consumer;
    let consumer_rx = shutdown_rx.clone();
    let mut pipeline = tokio::spawn(async move { consumer.run(consumer_rx).await });

    tracing::info!(
        event_name = "system.server.started",
        correlation_id = "bootstrap",
        inbound_topic = %app.config.gateway.inbound_topic,
        outbound_topic = %app.config.gateway.outbound_topic,
        "frontdesk-server started"
    );

    tokio::select! {
        signal = tokio::signal::ctrl_c() => signal?,
        finished = &mut pipeline => {
            tracing::warn!(
                event_name = "system.server.consumer_exited",
                correlation_id = "runtime",
                subscribed = finished.as_ref().map(|report| report.subscribed).unwrap_or(false),
                "gateway consumer stopped before shutdown was requested"
            );
            tokio::signal::ctrl_c().await?;
        }
    }

    tracing::info!(
        event_name = "system.server.stopping",
        correlation_id = "shutdown",
        grace_secs = app.config.server.graceful_shutdown_secs,
        "frontdesk-server stopping"
    );
    let _ = shutdown_tx.send(true);

    let grace = Duration::from_secs(app.config.server.graceful_shutdown_secs);
    let drained = tokio::time::timeout(grace, async {
        if !pipeline.is_finished() {
            let _ = (&mut pipeline).await;
        }
        let _ = sweeper.await;
        let _ = http.await;
    })
    .await;
    if drained.is_err() {
        tracing::warn!(
            event_name = "system.server.shutdown_timeout",
            correlation_id = "shutdown",
            "in-flight work did not finish within the grace period"
        );
    }

    app.db_pool.close().await;
    Ok(())
}
