use anyhow::Result;
use axum::{
    extract::{FromRef, State},
    http::StatusCode,
    middleware,
    response::Json,
    routing::{get, post},
    Router,
};
use prometheus::TextEncoder;
use serde_json::json;
use std::{net::SocketAddr, sync::Arc, time::Duration};
use tokio::{net::TcpListener, signal};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use tokengate::{
    config::{default_rules, Settings, StoreBackend},
    gateway::{rate_limit_middleware, reset_handler, status_handler, GatewayState},
    identity::IdentityExtractor,
    limiter::{LimiterOptions, RateLimiter},
    metrics::Metrics,
    policy::PolicyResolver,
    redis::ShardedRedisStore,
    store::{MemoryTokenStore, TokenStore},
};

/// How often the rules file is re-read in the background.
const RULES_RELOAD_INTERVAL: Duration = Duration::from_secs(30);

#[derive(Clone)]
struct AppState {
    gateway: GatewayState,
    metrics: Arc<Metrics>,
}

impl FromRef<AppState> for GatewayState {
    fn from_ref(state: &AppState) -> Self {
        state.gateway.clone()
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "tokengate=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    info!("Starting tokengate admission gateway");

    let config_path = std::env::var("TOKENGATE_CONFIG").ok();
    let settings = Settings::load(config_path.as_deref())?;

    let metrics = Arc::new(Metrics::new()?);
    let limiter = create_limiter(&settings, metrics.clone()).await?;
    let gateway = GatewayState::new(limiter, settings.route_rules.clone());
    let state = AppState {
        gateway: gateway.clone(),
        metrics,
    };

    if settings.rules_file.is_some() {
        spawn_rules_reloader(gateway.clone());
    }

    let app = Router::new()
        .route("/", get(root))
        .route("/healthcheck", get(health_check))
        .route("/metrics", get(metrics_handler))
        .route("/ratelimit/status", get(status_handler))
        .route("/ratelimit/reset", post(reset_handler))
        .layer(middleware::from_fn_with_state(
            gateway,
            rate_limit_middleware,
        ))
        .with_state(state);

    let addr: SocketAddr = settings.listen_addr.parse()?;
    let listener = TcpListener::bind(addr).await?;
    info!("HTTP server listening on {}", addr);

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    info!("Service stopped");
    Ok(())
}

async fn create_limiter(settings: &Settings, metrics: Arc<Metrics>) -> Result<Arc<RateLimiter>> {
    let resolver = match &settings.rules_file {
        Some(path) => PolicyResolver::from_file(path)?,
        None => {
            info!("no rules file configured, using built-in default rule");
            PolicyResolver::from_rules(default_rules())?
        }
    };

    let store: Arc<dyn TokenStore> = match settings.store.backend {
        StoreBackend::Memory => {
            info!("using in-memory token store");
            Arc::new(MemoryTokenStore::new())
        }
        StoreBackend::Redis => {
            let shards = if settings.store.shards.is_empty() {
                vec![tokengate::redis::ShardConfig {
                    primary_url: "redis://localhost:6379".to_string(),
                    replica_url: None,
                }]
            } else {
                settings.store.shards.clone()
            };
            let store = ShardedRedisStore::connect(
                &shards,
                &settings.redis_settings(),
                settings.store.key_ttl_secs,
            )
            .await?;
            Arc::new(store)
        }
    };

    let limiter = RateLimiter::new(
        IdentityExtractor::new(&settings.jwt_secret),
        Arc::new(resolver),
        store,
        metrics,
        LimiterOptions {
            key_prefix: settings.store.key_prefix.clone(),
            deny_cache_enabled: settings.deny_cache.enabled,
            deny_cache_size: settings.deny_cache.size,
        },
    );

    Ok(Arc::new(limiter))
}

fn spawn_rules_reloader(gateway: GatewayState) {
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(RULES_RELOAD_INTERVAL);
        interval.tick().await; // first tick fires immediately
        loop {
            interval.tick().await;
            gateway.limiter.reload_rules().await;
        }
    });
}

async fn shutdown_signal() {
    if let Err(e) = signal::ctrl_c().await {
        warn!("failed to listen for shutdown signal: {}", e);
    } else {
        info!("Received Ctrl+C, shutting down");
    }
}

async fn root() -> Json<serde_json::Value> {
    Json(json!({
        "message": "tokengate admission gateway",
        "version": env!("CARGO_PKG_VERSION"),
        "algorithm": "token bucket",
    }))
}

async fn health_check(State(state): State<AppState>) -> Result<Json<serde_json::Value>, StatusCode> {
    match state.gateway.limiter.health_check().await {
        Ok(()) => Ok(Json(json!({
            "status": "healthy",
            "timestamp": chrono::Utc::now().to_rfc3339(),
        }))),
        Err(_) => Err(StatusCode::SERVICE_UNAVAILABLE),
    }
}

async fn metrics_handler(State(state): State<AppState>) -> Result<String, StatusCode> {
    let encoder = TextEncoder::new();
    let metric_families = state.metrics.registry().gather();

    match encoder.encode_to_string(&metric_families) {
        Ok(metrics) => Ok(metrics),
        Err(_) => Err(StatusCode::INTERNAL_SERVER_ERROR),
    }
}
