//! Gateway service entry point.
//!
//! Fans store change notifications out to WebSocket and SSE clients and
//! serves latest-records queries.

use anyhow::Result;
use feed_gateway::{
    create_router, AppState, ChangeRouter, ClientRegistry, Debouncer, FreshnessRanker,
    GatewayConfig, KeyspaceTranslator, RedisUpstream, UpstreamFeed,
};
use metrics_exporter_prometheus::PrometheusBuilder;
use record_store::{redact, RecordStore, RedisRecordStore};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::signal;
use tokio::sync::mpsc;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[tokio::main]
async fn main() -> Result<()> {
    // Load environment variables from .env file
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    info!("Starting Feed Gateway");

    let config = GatewayConfig::from_env()?;

    info!("Configuration:");
    info!("  HTTP_PORT: {}", config.http_port);
    info!("  METRICS_PORT: {}", config.metrics_port);
    info!(
        "  REDIS_URLS: {}",
        config
            .redis_urls
            .iter()
            .map(|u| redact(u))
            .collect::<Vec<_>>()
            .join(", ")
    );
    for class in &config.record_classes {
        info!("  CLASS {}: {}*", class.name, class.key_prefix);
    }
    if let Some(list_key) = &config.feed_list_key {
        info!("  FEED_LIST_KEY: {} (max {})", list_key, config.feed_list_max_len);
    }
    info!("  DEBOUNCE_WINDOW: {:?}", config.debounce_window);

    PrometheusBuilder::new()
        .with_http_listener(([0, 0, 0, 0], config.metrics_port))
        .install()?;
    info!("Prometheus metrics server started on port {}", config.metrics_port);

    let redis = Arc::new(
        RedisRecordStore::new(config.redis_urls.clone())?
            .with_keyspace_events(config.enable_keyspace_events),
    );
    let store: Arc<dyn RecordStore> = redis.clone();

    // Reads stay degraded until the router's reconnect loop gets through.
    match redis.connect().await {
        Ok(endpoint) => {
            info!("Connected to store at {}", endpoint);
            log_inventory(store.as_ref(), &config).await;
        }
        Err(e) => warn!("Store unreachable at start-up: {}", e),
    }

    let debouncer = Arc::new(Debouncer::new(config.debounce_window));
    let translator = Arc::new(KeyspaceTranslator::new(
        config.keyspace_db,
        config.record_classes.clone(),
        debouncer.clone(),
    ));
    let upstream = Arc::new(RedisUpstream::new(redis.clone(), translator.clone()));
    let registry = Arc::new(ClientRegistry::new(upstream.clone()));
    let router = Arc::new(ChangeRouter::new(registry.clone(), translator.clone()));

    // Background tasks, each with its own shutdown channel
    let (router_shutdown_tx, router_shutdown_rx) = mpsc::channel(1);
    let router_handle = tokio::spawn(router.run(
        upstream.clone(),
        config.reconnect.clone(),
        router_shutdown_rx,
    ));

    let (sweeper_shutdown_tx, sweeper_shutdown_rx) = mpsc::channel(1);
    let sweeper_handle = tokio::spawn(
        debouncer.run_sweeper(config.debounce_sweep_interval, sweeper_shutdown_rx),
    );

    let (keepalive_shutdown_tx, keepalive_shutdown_rx) = mpsc::channel(1);
    let keepalive_handle = tokio::spawn(
        registry
            .clone()
            .run_keepalive(config.keepalive_interval, keepalive_shutdown_rx),
    );

    let http_port = config.http_port;
    let state = Arc::new(AppState {
        registry: registry.clone(),
        translator,
        ranker: FreshnessRanker::new(store.clone()),
        store,
        status: upstream.status(),
        config,
    });

    let app = create_router(state);

    let addr = SocketAddr::from(([0, 0, 0, 0], http_port));
    let listener = TcpListener::bind(addr).await?;
    info!("Gateway listening on {}", addr);

    // Open streams only end once their connections are closed, so the
    // registry is emptied before the server waits on them.
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown_signal().await;
            info!("Shutting down background tasks...");
            let _ = router_shutdown_tx.send(()).await;
            let _ = sweeper_shutdown_tx.send(()).await;
            let _ = keepalive_shutdown_tx.send(()).await;
            registry.close_all().await;
        })
        .await?;

    let _ = tokio::join!(router_handle, sweeper_handle, keepalive_handle);

    info!("Gateway stopped");
    Ok(())
}

/// Log how many records each class holds.
async fn log_inventory(store: &dyn RecordStore, config: &GatewayConfig) {
    for class in &config.record_classes {
        match store.keys(&class.key_prefix).await {
            Ok(keys) => info!("Found {} {} records", keys.len(), class.name),
            Err(e) => warn!("Could not count {} records: {}", class.name, e),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => info!("Received Ctrl+C"),
        _ = terminate => info!("Received terminate signal"),
    }
}
