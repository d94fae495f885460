use std::sync::Arc;
use std::time::Duration;

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use cicd_notifier::config::Config;
use cicd_notifier::db::SqliteDeliveryQueue;
use cicd_notifier::services::{init, DeliveryOptions, NotificationDeliveryService, RateLimiter};
use cicd_notifier::{routes, AppState};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "cicd_notifier=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Load configuration
    dotenvy::dotenv().ok();
    let config = Config::from_env()?;

    tracing::info!("Starting CI/CD notification delivery worker");

    // Initialize database
    let pool = init::init_db(&config).await?;
    let retry_policies = init::load_retry_policies(&pool).await?;

    let queue = SqliteDeliveryQueue::with_processing_timeout(
        pool.clone(),
        config.delivery.processing_timeout(),
    );
    let rate_limiter = RateLimiter::new().with_burst(config.rate_limit.burst_enabled);

    let delivery = NotificationDeliveryService::new(
        Arc::new(queue),
        Arc::new(rate_limiter),
        Arc::new(retry_policies),
    )
    .with_options(DeliveryOptions {
        concurrency: config.delivery.concurrency,
        send_timeout: config.delivery.send_timeout(),
    });

    init::register_channels(&delivery, &config).await;
    let delivery = Arc::new(delivery);

    // Create shutdown notifier for background workers
    let (shutdown_tx, _shutdown_rx) = tokio::sync::broadcast::channel::<()>(1);
    let bg_handles =
        init::spawn_background_workers(delivery.clone(), &config, shutdown_tx.clone());

    let app_state = Arc::new(AppState {
        config: config.clone(),
        delivery,
    });
    let app = routes::build_router(app_state);

    let addr = format!("{}:{}", config.server.host, config.server.port);
    tracing::info!("Operational endpoints listening on {}", addr);

    // Serve until a shutdown signal arrives, then notify the workers and
    // drop the server future so no new connections are accepted.
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    let server_fut = axum::serve(listener, app.into_make_service());

    let shutdown_tx_clone = shutdown_tx.clone();
    let signal_fut = async move {
        wait_for_signal().await;
        tracing::info!("Shutdown signal received, notifying background workers");
        let _ = shutdown_tx_clone.send(());
    };

    tokio::select! {
        res = server_fut => {
            if let Err(e) = res {
                tracing::error!("Server error: {}", e);
            }
        }
        _ = signal_fut => {
            tracing::info!("Signal handler completed; server future dropped to stop accepting new connections");
        }
    }

    // Give in-flight deliveries some time to finish.
    let shutdown_wait = Duration::from_secs(15);
    tracing::info!(
        "Waiting up to {}s for background workers to exit",
        shutdown_wait.as_secs()
    );

    let bg_wait = async {
        for h in bg_handles {
            let _ = h.await;
        }
    };
    if tokio::time::timeout(shutdown_wait, bg_wait).await.is_err() {
        tracing::warn!("Background workers did not exit in time; claimed items will be reclaimed on next start");
    }

    tracing::info!("Shutdown complete");
    Ok(())
}

async fn wait_for_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut term) => {
                tokio::select! {
                    _ = ctrl_c => {},
                    _ = term.recv() => {},
                }
            }
            Err(e) => {
                tracing::warn!("Failed to bind SIGTERM: {}", e);
                ctrl_c.await;
            }
        }
    }

    #[cfg(not(unix))]
    ctrl_c.await;
}
