use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use channel_forwarder::api::forwarder_routes;
use channel_forwarder::channels::{TelegramTransport, spawn_update_poller};
use channel_forwarder::config::ForwarderConfig;
use channel_forwarder::pipeline::dedup::spawn_dedup_sweeper;
use channel_forwarder::pipeline::{CancelSignal, DedupWindow, ForwardingOrchestrator};
use channel_forwarder::rules::RuleStore;
use channel_forwarder::store::LibSqlRuleStore;
use channel_forwarder::worker::queue::DEFAULT_QUEUE_CAPACITY;
use channel_forwarder::worker::{ForwardQueue, spawn_forward_worker};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .with_target(false)
        .init();

    let config = ForwarderConfig::from_env()?;
    let bot_token = config.require_bot_token()?.clone();

    eprintln!("📨 Channel Forwarder v{}", env!("CARGO_PKG_VERSION"));
    eprintln!("   REST API: http://0.0.0.0:{}/rules", config.http_port);

    // ── Database ─────────────────────────────────────────────────────────
    let store: Arc<dyn RuleStore> = Arc::new(
        LibSqlRuleStore::new_local(&config.db_path)
            .await
            .with_context(|| format!("Failed to open database at {}", config.db_path.display()))?,
    );
    eprintln!("   Database: {}", config.db_path.display());

    // ── Pipeline ─────────────────────────────────────────────────────────
    let cancel = CancelSignal::new();
    let transport = Arc::new(TelegramTransport::new(bot_token, config.message_cache_size));
    let dedup = DedupWindow::new(config.dedup_window);
    let _sweeper = spawn_dedup_sweeper(dedup.clone(), Duration::from_secs(60), cancel.clone());

    let orchestrator = Arc::new(ForwardingOrchestrator::new(
        Arc::clone(&store),
        transport.clone(),
        dedup,
        config.max_parallel_sends,
    ));

    let (queue, jobs) = ForwardQueue::new(DEFAULT_QUEUE_CAPACITY);
    let worker = spawn_forward_worker(
        orchestrator,
        queue.clone(),
        jobs,
        config.worker_settings(),
        cancel.clone(),
    );
    let poller = spawn_update_poller(transport, queue.clone(), config.poll_timeout, cancel.clone());
    eprintln!(
        "   Workers: {} concurrent jobs, {} sends per rule",
        config.worker_concurrency, config.max_parallel_sends
    );

    // ── REST API ─────────────────────────────────────────────────────────
    let app = forwarder_routes(store, queue)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());
    let listener = tokio::net::TcpListener::bind(("0.0.0.0", config.http_port))
        .await
        .with_context(|| format!("Failed to bind port {}", config.http_port))?;
    tracing::info!(port = config.http_port, "REST server started");

    let shutdown = cancel.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            if let Err(e) = tokio::signal::ctrl_c().await {
                tracing::error!("Failed to listen for ctrl-c: {e}");
            }
            tracing::info!("Shutdown requested");
            shutdown.cancel();
        })
        .await
        .context("REST server failed")?;

    let _ = tokio::time::timeout(Duration::from_secs(10), async {
        let _ = poller.await;
        let _ = worker.await;
    })
    .await;

    tracing::info!("Channel forwarder stopped");
    Ok(())
}
