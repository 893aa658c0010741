mod api;
mod config;
mod data;
mod error;
mod exchange;
mod upstream;
mod websocket;
#[cfg(test)]
mod test_support;

use std::time::Duration;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tokio::time::interval;
use log::{info, error};

use crate::api::{ApiState, RestUrls, cors_layer, create_api_router};
use crate::config::{Config, STATS_INTERVAL_SECS};
use crate::data::TopicRegistry;
use crate::exchange::Exchange;
use crate::upstream::wait_for_stop;
use crate::websocket::RelayServer;

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // A missing .env file is fine; the environment and defaults still apply
    let dotenv_result = dotenvy::dotenv();

    // Load configuration
    let config = Config::from_env();

    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(&config.log_level));

    if let Ok(path) = dotenv_result {
        info!("Loaded environment from {}", path.display());
    }

    // Log configuration
    config.log_config();

    // Validate configuration
    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        return Err(e.into());
    }

    let registry = Arc::new(TopicRegistry::new(
        config.endpoints(),
        config.upstream_settings(),
        config.idle_topic_policy,
    ));
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    // One relay listener per exchange
    let mut relay_tasks = Vec::new();
    for exchange in Exchange::ALL {
        let server = RelayServer::bind(
            exchange,
            &config.ws_bind_address(exchange),
            registry.clone(),
            shutdown_rx.clone(),
        )
        .await?;
        info!(
            "🚀 {} WebSocket Server running on ws://{}",
            exchange.name().to_uppercase(),
            server.local_addr()?
        );
        relay_tasks.push(tokio::spawn(server.run()));
    }

    start_stats_task(registry.clone(), shutdown_rx.clone());

    // Start API server
    let api_state = ApiState::new(registry.clone(), RestUrls::default());
    let api_router = create_api_router(api_state)
        .layer(cors_layer(&config.cors_origin)?);

    let api_bind_address = config.api_bind_address();
    let api_listener = TcpListener::bind(&api_bind_address).await?;
    info!("🌐 REST API Server running on http://{}", api_bind_address);

    let mut api_shutdown = shutdown_rx.clone();
    let api_server = tokio::spawn(async move {
        axum::serve(api_listener, api_router)
            .with_graceful_shutdown(async move { wait_for_stop(&mut api_shutdown).await })
            .await
    });

    info!("🎯 Relay servers and HTTP API ready");
    shutdown_signal().await;
    info!("Shutdown signal received, closing listeners and sessions");
    let _ = shutdown_tx.send(true);

    for task in relay_tasks {
        if let Err(e) = task.await {
            error!("Relay server task failed: {:?}", e);
        }
    }

    registry.shutdown().await;

    match api_server.await {
        Ok(Ok(())) => {}
        Ok(Err(e)) => error!("API server stopped with error: {:?}", e),
        Err(e) => error!("API server task failed: {:?}", e),
    }

    info!("Shutdown complete");
    Ok(())
}

// Ctrl-C, or SIGTERM on unix
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for Ctrl-C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}

fn start_stats_task(registry: Arc<TopicRegistry>, mut shutdown: watch::Receiver<bool>) {
    tokio::spawn(async move {
        let mut interval_timer = interval(Duration::from_secs(STATS_INTERVAL_SECS));

        loop {
            tokio::select! {
                _ = interval_timer.tick() => {
                    let (topic_count, subscription_count) = registry.get_stats();
                    if topic_count > 0 || subscription_count > 0 {
                        info!("Stats - Topics: {}, Subscriptions: {}", topic_count, subscription_count);
                    }
                }
                _ = wait_for_stop(&mut shutdown) => break,
            }
        }
    });

    info!("📈 Started stats monitoring task (every {} seconds)", STATS_INTERVAL_SECS);
}
