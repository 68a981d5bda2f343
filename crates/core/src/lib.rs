pub mod agents;
pub mod cache;
pub mod cli;
pub mod config;
pub mod dispatcher;
pub mod handlers;
pub mod manifest;
pub mod permissions;
pub mod rate_limit;
pub mod runtime;
pub mod schema;
pub mod sse;
pub mod subscriptions;
pub mod tools;
pub mod validation;

pub use dispatcher::{Dispatcher, DispatcherConfig};

use axum::{
    routing::{get, post},
    Router,
};
use lavs_shared::{LavsError, LavsErrorCode, RpcResponse};
use std::sync::Arc;
use tokio::sync::Notify;

pub struct AppState {
    pub dispatcher: Arc<Dispatcher>,
    pub shutdown: Arc<Notify>,
}

pub enum AppError {
    Lavs(LavsError),
    Internal(anyhow::Error),
}

impl axum::response::IntoResponse for AppError {
    fn into_response(self) -> axum::response::Response {
        let error = match self {
            AppError::Lavs(e) => {
                if e.code == LavsErrorCode::InternalError {
                    tracing::error!("Internal LAVS error: {}", e.message);
                }
                e
            }
            AppError::Internal(e) => {
                // Log full error server-side only; return generic message to client
                tracing::error!("Internal error: {:#}", e);
                LavsError::internal("An internal error occurred")
            }
        };

        let status = axum::http::StatusCode::from_u16(error.http_status())
            .unwrap_or(axum::http::StatusCode::INTERNAL_SERVER_ERROR);
        (status, axum::Json(RpcResponse::failure(&error))).into_response()
    }
}

impl From<LavsError> for AppError {
    fn from(err: LavsError) -> Self {
        AppError::Lavs(err)
    }
}

impl From<anyhow::Error> for AppError {
    fn from(err: anyhow::Error) -> Self {
        AppError::Internal(err)
    }
}

impl From<serde_json::Error> for AppError {
    fn from(err: serde_json::Error) -> Self {
        AppError::Internal(anyhow::anyhow!(err))
    }
}

pub type AppResult<T> = Result<T, AppError>;

/// LAVS routes without CORS, ready to be nested or served.
pub fn build_router(state: Arc<AppState>) -> Router {
    let lavs_routes = Router::new()
        .route("/cache/clear", post(handlers::clear_cache_handler))
        .route("/:agent", get(handlers::manifest_handler))
        .route(
            "/:agent/tools",
            get(handlers::tools_handler).post(handlers::call_tools_endpoint_handler),
        )
        .route("/:agent/:endpoint", post(handlers::call_endpoint_handler))
        .route(
            "/:agent/:endpoint/subscribe",
            get(handlers::subscribe_handler),
        )
        .layer(axum::extract::DefaultBodyLimit::max(1024 * 1024));

    Router::new()
        .nest("/api/lavs", lavs_routes)
        .with_state(state)
}

/// Gateway entry point: serve until Ctrl-C, then close subscriptions and
/// kill running scripts.
pub async fn run_gateway(config: config::AppConfig) -> anyhow::Result<()> {
    use crate::agents::FsAgentDirectory;
    use tower_http::cors::CorsLayer;
    use tracing::info;

    info!("+---------------------------------------+");
    info!("|         LAVS Endpoint Gateway         |");
    info!(
        "|           Version {:<10}          |",
        env!("CARGO_PKG_VERSION")
    );
    info!("+---------------------------------------+");

    info!(
        "📍 Loaded Config: AGENTS_DIR={}, MANIFEST={}, RATE_LIMIT={}/{}s",
        config.agents_dir.display(),
        config.manifest_file,
        config.rate_limit_max,
        config.rate_limit_window_secs
    );
    if !config.agents_dir.is_dir() {
        tracing::warn!(
            "⚠️  Agents directory {} does not exist; every call will fail until it does",
            config.agents_dir.display()
        );
    }

    let dispatcher = Arc::new(Dispatcher::new(
        Arc::new(FsAgentDirectory::new(config.agents_dir.clone())),
        config.dispatcher_config(),
    ));
    dispatcher.subscriptions().start_heartbeat();

    let shutdown = Arc::new(Notify::new());
    let app_state = Arc::new(AppState {
        dispatcher: dispatcher.clone(),
        shutdown: shutdown.clone(),
    });

    let rl_dispatcher = dispatcher.clone();
    let shutdown_clone = shutdown.clone();
    let cleanup_period = std::time::Duration::from_secs(config.rate_limit_cleanup_secs);
    tokio::spawn(async move {
        let mut interval = tokio::time::interval(cleanup_period);
        loop {
            tokio::select! {
                () = shutdown_clone.notified() => {
                    tracing::info!("Rate limiter cleanup shutting down");
                    break;
                }
                _ = interval.tick() => {
                    let removed = rl_dispatcher.cleanup_rate_limits();
                    if removed > 0 {
                        tracing::debug!("Swept {} expired rate-limit window(s)", removed);
                    }
                }
            }
        }
    });

    let signal_shutdown = shutdown.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            signal_shutdown.notify_waiters();
        }
    });

    let app = build_router(app_state).layer(
        CorsLayer::new()
            .allow_origin(config.cors_origins.clone())
            .allow_methods([axum::http::Method::GET, axum::http::Method::POST])
            .allow_headers([axum::http::header::CONTENT_TYPE]),
    );

    let listener =
        tokio::net::TcpListener::bind(format!("{}:{}", config.bind_address, config.port)).await?;
    info!(
        "🚀 LAVS gateway is listening on http://{}:{}",
        config.bind_address, config.port
    );

    let shutdown_dispatcher = dispatcher.clone();
    axum::serve(listener, app)
        .with_graceful_shutdown(async move {
            shutdown.notified().await;
            info!("🛑 Graceful shutdown signal received. Stopping server...");
            // open SSE streams only end once their sinks are closed
            shutdown_dispatcher.shutdown();
        })
        .await?;

    dispatcher.shutdown();
    info!("👋 LAVS gateway stopped");
    Ok(())
}
