use std::{net::SocketAddr, sync::Arc};

use tokio::{signal, sync::watch};
use tracing::{error, info, warn};

use clothing_store_api as api;
use api::{
    cache::create_cache,
    message_queue::{create_message_queue, InMemoryMessageQueue, MessageQueue},
    notifications::NotificationWorker,
    services::payment_gateway::{PaymentGateway, PaystackGateway},
    AppState,
};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cfg = api::config::load_config()?;
    api::config::init_tracing(cfg.log_level(), cfg.log_json);

    // Init DB
    let db_pool = api::db::establish_connection_from_app_config(&cfg).await?;
    if cfg.auto_migrate {
        api::db::run_migrations(&db_pool).await?;
    } else {
        info!("Skipping migrations (auto_migrate=false)");
    }
    let db = Arc::new(db_pool);

    // Init cache (carts, sessions, recommendations)
    let cache = create_cache(&cfg.cache_backend, &cfg.redis_url).await?;
    if let Err(e) = cache.ping().await {
        warn!(error = %e, "cache did not answer PING at startup");
    }

    // Init queue (order-paid notifications); the worker's sweep covers anything lost
    let queue: Arc<dyn MessageQueue> = match create_message_queue(
        &cfg.message_queue_backend,
        &cfg.redis_url,
        &cfg.message_queue_namespace,
    )
    .await
    {
        Ok(queue) => queue,
        Err(e) => {
            error!(error = %e, "message queue unavailable, falling back to in-memory");
            Arc::new(InMemoryMessageQueue::new())
        }
    };
    let gateway: Arc<dyn PaymentGateway> = Arc::new(PaystackGateway::new(
        &cfg.paystack_base_url,
        &cfg.paystack_secret_key,
        cfg.payment_timeout(),
    )?);

    let state = Arc::new(AppState::new(
        cfg.clone(),
        db.clone(),
        cache,
        queue.clone(),
        gateway,
    ));

    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let worker = NotificationWorker::new(
        db,
        queue,
        cfg.notification_poll_interval(),
        cfg.notification_sweep_interval(),
    )
    .spawn(shutdown_rx);

    let app = api::build_router(state);

    let addr: SocketAddr = format!("{}:{}", cfg.host, cfg.port).parse()?;
    info!("clothing-store-api listening on {}", addr);
    let listener = tokio::net::TcpListener::bind(addr).await?;

    axum::serve(listener, app.into_make_service())
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    info!("HTTP server stopped; draining background worker");
    let _ = shutdown_tx.send(true);
    if let Err(e) = worker.await {
        error!(error = %e, "notification worker exited abnormally");
    }

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            error!(error = %e, "failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        use tokio::signal::unix::{signal, SignalKind};

        match signal(SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!(error = %e, "failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }
}
