use std::sync::Arc;
use tower_http::trace::TraceLayer;
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

mod auth;
mod clock;
mod config;
mod routes;
mod store;
mod sweeper;
mod utils;
mod weather;

use auth::build_verifier;
use clock::{Clock, SystemClock};
use config::Config;
use routes::{create_router, AppState};
use store::WeatherStore;
use weather::openweather::OpenWeatherClient;
use weather::WeatherService;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables from .env file
    dotenv::dotenv().ok();

    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "horizon_weather=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Config::from_env()?;
    let clock: Arc<dyn Clock> = Arc::new(SystemClock);

    // Decided once; there is no switching back to Redis later.
    let backend = store::select_backend(&config).await?;
    let weather_store = WeatherStore::new(backend, config.retention(), clock.clone());
    let kind = weather_store.backend_kind();

    let sweeper = match config.sweep_interval() {
        Some(every) => {
            let sweep_backend = store::open_backend(kind, &config).await?;
            let sweep_store = WeatherStore::new(sweep_backend, config.retention(), clock.clone());
            Some(sweeper::spawn_sweeper(sweep_store, every))
        }
        None => {
            tracing::info!("Expiry sweep disabled");
            None
        }
    };

    let weather_client = OpenWeatherClient::new(config.clone())?;
    let weather = Arc::new(WeatherService::new(
        weather_client,
        weather_store,
        clock,
        config.normalize_timestamps,
    ));
    let verifier = build_verifier(&config)?;

    let bind_addr = config.bind_addr.clone();
    let state = AppState {
        config: Arc::new(config),
        weather,
        verifier,
    };

    let app = create_router(state).layer(TraceLayer::new_for_http());

    let listener = tokio::net::TcpListener::bind(&bind_addr).await?;
    tracing::info!("Server starting on http://{}", bind_addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    if let Some(handle) = sweeper {
        handle.abort();
    }
    tracing::info!("Server stopped");

    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!("Failed to listen for Ctrl-C: {}", e);
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
                tracing::error!("Failed to listen for SIGTERM: {}", e);
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

    tracing::info!("Shutdown signal received");
}
