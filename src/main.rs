use axum::{extract::State, routing::get, Json, Router};
use meridian::config::Config;
use meridian::connectors::{binance, ExchangeFactory, RateLimit, RateLimiter};
use meridian::services::{
    BusConfig, EventBus, KeyManager, SqliteCredentialStore, SqliteOrderStore, UserContextService,
};
use meridian::websocket::{self, ConnectionRegistry, SessionTokens};
use meridian::AppState;
use serde_json::json;
use std::sync::Arc;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

async fn health(State(state): State<AppState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "clients": state.registry.client_count(),
        "authenticated": state.registry.authenticated_count(),
        "tenants": state.contexts.cached_tenants().len(),
        "eventBus": state.bus.is_connected(),
    }))
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        tracing::error!("Failed to listen for shutdown signal: {}", e);
    }
    info!("Shutdown signal received");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load environment variables
    dotenvy::dotenv().ok();

    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "meridian=debug,tower_http=info".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    let config = Arc::new(Config::from_env());
    info!("Starting Meridian server on {}:{}", config.host, config.port);

    let secret = config
        .encryption_key
        .clone()
        .ok_or_else(|| anyhow::anyhow!("ENCRYPTION_KEY must be set"))?;
    let keys = KeyManager::new(&secret)?;

    // Orders, trades and credentials share one SQLite file
    let order_store = Arc::new(SqliteOrderStore::new(&config.database_path)?);
    let credential_store = Arc::new(SqliteCredentialStore::new(&config.database_path, keys)?);

    let bus_config = match config.redis_url {
        Some(ref url) => BusConfig::Redis(url.clone()),
        None => BusConfig::Local,
    };
    let bus = Arc::new(EventBus::new(bus_config));
    bus.initialize().await;

    let limiter = Arc::new(
        RateLimiter::new(RateLimit::default()).with_limit(binance::EXCHANGE_NAME, config.rate_limits.binance()),
    );
    let factory = Arc::new(ExchangeFactory::new(limiter));

    let contexts = Arc::new(UserContextService::new(
        credential_store,
        factory,
        order_store,
        bus.clone(),
        config.context_settings(),
    ));

    let registry = ConnectionRegistry::new();
    let tokens = Arc::new(SessionTokens::default());
    let loaded = tokens.load_static(&config.session_tokens);
    if loaded == 0 {
        warn!("No SESSION_TOKENS configured; WebSocket clients cannot authenticate");
    } else {
        info!("Loaded {} static session token(s)", loaded);
    }
    let _fanout = websocket::forward_bus_to_clients(&bus, registry.clone());

    let state = AppState {
        config: config.clone(),
        contexts: contexts.clone(),
        registry,
        verifier: tokens.clone(),
        bus,
    };

    // Snapshot cycle for every live tenant
    {
        let contexts = contexts.clone();
        let interval = config.snapshot_interval();
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            loop {
                ticker.tick().await;
                let refreshed = contexts.refresh_all().await;
                debug!("Refreshed {} tenant snapshot(s)", refreshed);
            }
        });
    }
    {
        let tokens = tokens.clone();
        tokio::spawn(async move {
            loop {
                tokio::time::sleep(tokio::time::Duration::from_secs(300)).await;
                tokens.cleanup();
            }
        });
    }

    // Build CORS layer
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods(Any)
        .allow_headers(Any);

    let app = Router::new()
        .route("/health", get(health))
        .route("/ws", get(websocket::ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state);

    let addr = format!("{}:{}", config.host, config.port);
    let listener = tokio::net::TcpListener::bind(&addr).await?;
    info!("Meridian server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    contexts.shutdown().await;
    info!("Meridian server stopped");
    Ok(())
}
