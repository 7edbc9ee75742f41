mod auth;
mod cache;
mod commit;
mod completion;
mod compressor;
mod context;
mod db;
mod error;
mod extract;
mod handlers;
mod llm;
mod metrics;
mod models;
mod ratelimit;
mod tasks;

use axum::{
    middleware,
    routing::{get, post, put},
    Router,
};
use sqlx::postgres::PgPoolOptions;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::{Any, CorsLayer};
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;

use cache::{CompressionCache, UserCache};
use llm::{LlmClient, UpstreamConfig};
use metrics::Metrics;
use ratelimit::RateLimiter;

/// Memory rows older than this are swept.
const MEMORY_RETENTION_HOURS: i64 = 24;

/// Global application state
#[derive(Clone)]
pub struct AppState {
    pub db: sqlx::Pool<sqlx::Postgres>,
    pub llm: Arc<LlmClient>,
    pub user_cache: Arc<UserCache>,
    pub compression_cache: Arc<CompressionCache>,
    pub rate_limiter: Arc<RateLimiter>,
    pub metrics: Arc<Metrics>,
    pub jwt_secret: String,
}

#[tokio::main]
async fn main() {
    dotenvy::dotenv().ok();

    tracing_subscriber::fmt::init();

    // ============================================================
    // Configuration
    // ============================================================

    let database_url = std::env::var("DATABASE_URL")
        .unwrap_or_else(|_| "postgres://localhost:5432/solace".to_string());
    let llm_base_url = std::env::var("LLM_BASE_URL")
        .unwrap_or_else(|_| "http://localhost:11434".to_string());
    let llm_api_key = std::env::var("LLM_API_KEY").ok();
    let jwt_secret = std::env::var("JWT_SECRET")
        .unwrap_or_else(|_| "solace-dev-secret-change-me".to_string());
    let max_sockets = std::env::var("LLM_MAX_SOCKETS")
        .ok()
        .and_then(|v| v.parse().ok())
        .unwrap_or(20);
    // Development escape hatch only; production leaves verification on.
    let verify_tls = std::env::var("LLM_INSECURE_SKIP_TLS_VERIFY")
        .map(|v| v != "true" && v != "1")
        .unwrap_or(true);
    let bind_addr = std::env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:3000".to_string());

    // ============================================================
    // Initialize Services
    // ============================================================

    tracing::info!("Connecting to Postgres...");
    let db_pool = PgPoolOptions::new()
        .max_connections(20)
        .connect(&database_url)
        .await
        .expect("Failed to connect to Postgres");

    db::init_schema(&db_pool)
        .await
        .expect("Failed to initialize database schema");

    tracing::info!("Connected to Postgres");

    let llm_client = Arc::new(LlmClient::new(UpstreamConfig {
        base_url: llm_base_url,
        api_key: llm_api_key,
        max_sockets,
        verify_tls,
        connect_timeout_secs: 10,
    }));

    let state = AppState {
        db: db_pool.clone(),
        llm: llm_client,
        user_cache: Arc::new(UserCache::default()),
        compression_cache: Arc::new(CompressionCache::default()),
        rate_limiter: Arc::new(RateLimiter::default()),
        metrics: Arc::new(Metrics::default()),
        jwt_secret,
    };

    // ============================================================
    // Background Loops
    // ============================================================

    let task_pool = db_pool.clone();
    tokio::spawn(async move {
        tasks::run_task_loop(task_pool).await;
    });

    let sweep_pool = db_pool.clone();
    tokio::spawn(async move {
        run_memory_sweeper(sweep_pool).await;
    });

    // ============================================================
    // Build Axum Router
    // ============================================================

    // Layers run outermost-last: auth verifies first, then the general
    // window is keyed by the verified user id.
    let protected = Router::new()
        .route("/profile", get(handlers::get_profile))
        .route("/profile", put(handlers::update_profile))
        .route("/completion", post(completion::handle_completion))
        .route("/emotions", post(handlers::log_emotion))
        .route("/emotions", get(handlers::list_emotions))
        .route("/memory", get(handlers::list_memory))
        .route("/run-tasks", get(handlers::run_tasks))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            ratelimit::general_rate_limit,
        ))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            auth::require_auth,
        ));

    let public = Router::new()
        .route("/signup", post(auth::signup))
        .route("/login", post(auth::login))
        .route("/health", get(handlers::health_check))
        .route("/metrics", get(handlers::metrics))
        .route_layer(middleware::from_fn_with_state(
            state.clone(),
            ratelimit::general_rate_limit,
        ))
        .layer(TimeoutLayer::new(Duration::from_secs(10)));

    let app = Router::new()
        .merge(protected)
        .merge(public)
        .layer(TraceLayer::new_for_http())
        .layer(
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any),
        )
        .with_state(state);

    tracing::info!("🌤  Solace core is up");
    tracing::info!("Listening on {}", bind_addr);

    let listener = tokio::net::TcpListener::bind(&bind_addr)
        .await
        .unwrap_or_else(|e| panic!("Failed to bind to {}: {}", bind_addr, e));

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await
    .expect("Server error");
}

/// Purge memory past the retention window, hourly.
async fn run_memory_sweeper(pool: sqlx::Pool<sqlx::Postgres>) {
    tracing::info!("memory sweeper starting");
    loop {
        match db::purge_expired_memory(&pool, MEMORY_RETENTION_HOURS).await {
            Ok(0) => {}
            Ok(purged) => tracing::info!(purged, "swept expired memory"),
            Err(e) => tracing::error!("memory sweep failed: {}", e),
        }
        tokio::time::sleep(Duration::from_secs(3600)).await;
    }
}
