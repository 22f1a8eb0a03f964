//! HTTP surface of the gateway.
//!
//! - `POST /api/chat`: one JSON `ChatResult`, or 400 with `ErrorBody`
//! - `POST /api/chat/stream`: event stream of relay frames
//! - `GET /health`: `{"ok":true}`
//!
//! `/api` routes are rate limited per client IP. CORS admits the single
//! configured origin, with credentials.

mod handlers;
pub mod rate_limit;

pub use handlers::ApiError;

use std::future::Future;
use std::net::SocketAddr;
use std::sync::Arc;

use axum::Router;
use axum::extract::DefaultBodyLimit;
use axum::http::{HeaderValue, Method, header};
use axum::middleware;
use axum::routing::{get, post};
use tokio::net::TcpListener;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::config::{Config, ServerCfg, UpstreamCfg};
use crate::error::{CoreResult, RelayError};
use crate::provider::ChatProvider;
use rate_limit::RateLimiter;

/// Shared handler state. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub provider: Arc<dyn ChatProvider>,
    pub upstream: Arc<UpstreamCfg>,
    limiter: Arc<RateLimiter>,
}

impl AppState {
    pub fn new(provider: Arc<dyn ChatProvider>, cfg: &Config) -> Self {
        Self {
            provider,
            upstream: Arc::new(cfg.upstream.clone()),
            limiter: Arc::new(RateLimiter::new(&cfg.server.rate_limit)),
        }
    }
}

fn cors_layer(origin: &str) -> CoreResult<CorsLayer> {
    let origin: HeaderValue = origin
        .parse()
        .map_err(|_| RelayError::Config(format!("invalid cors_origin: {origin:?}")))?;
    Ok(CorsLayer::new()
        .allow_origin(origin)
        .allow_credentials(true)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers([header::CONTENT_TYPE, header::AUTHORIZATION, header::ACCEPT]))
}

/// Assemble the application router.
pub fn router(state: AppState, server: &ServerCfg) -> CoreResult<Router> {
    let api = Router::new()
        .route(handlers::CHAT_ROUTE, post(handlers::chat))
        .route(handlers::STREAM_ROUTE, post(handlers::chat_stream))
        .route_layer(middleware::from_fn_with_state(
            state.limiter.clone(),
            rate_limit::enforce,
        ));

    Ok(Router::new()
        .merge(api)
        .route("/health", get(handlers::health))
        .layer(DefaultBodyLimit::max(server.body_limit_bytes))
        .layer(cors_layer(&server.cors_origin)?)
        .layer(TraceLayer::new_for_http())
        .with_state(state))
}

pub async fn bind(server: &ServerCfg) -> CoreResult<TcpListener> {
    let addr = format!("{}:{}", server.host, server.port);
    let listener = TcpListener::bind(&addr).await?;
    tracing::info!(addr = %listener.local_addr()?, "gateway listening");
    Ok(listener)
}

/// Serve `app` until `shutdown` resolves. Open streams are allowed to finish.
pub async fn serve<F>(listener: TcpListener, app: Router, shutdown: F) -> CoreResult<()>
where
    F: Future<Output = ()> + Send + 'static,
{
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown)
    .await?;
    tracing::info!("gateway stopped");
    Ok(())
}
