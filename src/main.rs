mod api;
mod config;
mod data;
mod websocket;

use std::sync::Arc;
use std::time::Duration;
use rust_decimal::Decimal;
use tokio::net::TcpListener;
use tokio::task::JoinHandle;
use tokio::time::interval;
use tokio_util::sync::CancellationToken;
use log::{error, info, warn};
use tower_http::cors::CorsLayer;

use crate::api::{create_api_router, ApiState};
use crate::config::{Config, STATS_INTERVAL_SECS};
use crate::data::{change_feed, price_board, ListenerHandle, LogListener, Notifier};
use crate::websocket::WebSocketHandler;

const DEMO_CLIENT_ID: &str = "client001";
const DEMO_SYMBOLS: [&str; 2] = ["AAPL", "GOOGL"];

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    // Load configuration
    let config = Config::from_env()?;

    // Initialize logger
    env_logger::init_from_env(env_logger::Env::new().default_filter_or(&config.log_level));

    config.log_config();

    if let Err(e) = config.validate() {
        error!("Configuration validation failed: {}", e);
        return Err(e.into());
    }

    let prices = Arc::new(price_board(config.default_price, config.price_schedule(), config.updater_seed));
    let changes = Arc::new(change_feed(config.change_schedule()));

    let price_tasks = prices.start()?;
    let change_tasks = changes.start()?;

    if config.demo_client {
        subscribe_demo_client(&prices).await;
    }

    let stats_cancel = CancellationToken::new();
    let stats_task = start_stats_task(prices.clone(), changes.clone(), stats_cancel.clone());

    // Start API server
    let api_state = ApiState {
        prices: prices.clone(),
        changes: changes.clone(),
    };
    let api_router = create_api_router(api_state)
        .layer(CorsLayer::permissive());

    let api_listener = TcpListener::bind(&config.api_bind_address).await?;
    info!("HTTP API server running at http://{}", config.api_bind_address);
    let api_server = axum::serve(api_listener, api_router);

    // Start WebSocket server
    let ws_listener = TcpListener::bind(&config.bind_address).await?;
    info!("WebSocket server running at ws://{}", config.bind_address);

    let ws_prices = prices.clone();
    let ws_changes = changes.clone();
    let websocket_server = async move {
        loop {
            match ws_listener.accept().await {
                Ok((stream, addr)) => {
                    let handler = WebSocketHandler::new(ws_prices.clone(), ws_changes.clone(), addr.to_string());
                    tokio::spawn(handler.handle_connection(stream));
                }
                Err(e) => {
                    error!("Failed to accept WebSocket connection: {}", e);
                    break;
                }
            }
        }
    };

    tokio::select! {
        result = api_server => {
            error!("API server stopped: {:?}", result);
        }
        _ = websocket_server => {
            error!("WebSocket server stopped");
        }
        result = wait_for_shutdown_signal() => {
            match result {
                Ok(()) => info!("Shutdown signal received"),
                Err(e) => error!("Failed to listen for shutdown signal: {}", e),
            }
        }
    }

    stats_cancel.cancel();
    let _ = stats_task.await;
    price_tasks.stop(config.shutdown_grace).await;
    change_tasks.stop(config.shutdown_grace).await;

    info!("Shutdown complete");
    Ok(())
}

// In-process consumer that logs every price it is sent
async fn subscribe_demo_client(prices: &Notifier<Decimal>) {
    let handle = ListenerHandle::<Decimal>::new(Arc::new(LogListener::new(DEMO_CLIENT_ID)));
    for symbol in DEMO_SYMBOLS {
        let receipt = prices.subscribe(symbol, handle.clone()).await;
        if !receipt.delivered {
            warn!("Demo client missed the initial {} price", symbol);
        }
    }
    info!("Demo client {} subscribed to {:?}", DEMO_CLIENT_ID, DEMO_SYMBOLS);
}

fn start_stats_task(
    prices: Arc<Notifier<Decimal>>,
    changes: Arc<Notifier<String>>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    info!("Started stats monitoring task (every {} seconds)", STATS_INTERVAL_SECS);

    tokio::spawn(async move {
        let mut interval_timer = interval(Duration::from_secs(STATS_INTERVAL_SECS));
        // First tick completes immediately
        interval_timer.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = interval_timer.tick() => {
                    for stats in [prices.get_stats(), changes.get_stats()] {
                        info!(
                            "Stats - {}: keys {}, with listeners {}, registrations {}, deliveries {}, evictions {}",
                            stats.topic,
                            stats.keys,
                            stats.keys_with_listeners,
                            stats.registrations,
                            stats.deliveries,
                            stats.evictions
                        );
                    }
                }
            }
        }
    })
}

#[cfg(unix)]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut sigterm = signal(SignalKind::terminate())?;

    tokio::select! {
        result = tokio::signal::ctrl_c() => result,
        _ = sigterm.recv() => Ok(()),
    }
}

#[cfg(not(unix))]
async fn wait_for_shutdown_signal() -> std::io::Result<()> {
    tokio::signal::ctrl_c().await
}
