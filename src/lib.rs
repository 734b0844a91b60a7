//! Clothing store API library
//!
//! Cart pricing, coupon application, order snapshots and payment-gateway
//! reconciliation for the storefront.
#![forbid(unsafe_code)]
#![deny(rust_2018_idioms)]
#![allow(elided_lifetimes_in_paths)]
#![warn(clippy::all, clippy::perf, clippy::dbg_macro)]

pub mod cache;
pub mod config;
pub mod db;
pub mod entities;
pub mod errors;
pub mod handlers;
pub mod message_queue;
pub mod middleware_helpers;
pub mod migrator;
pub mod notifications;
pub mod services;
pub mod session;
pub mod tracing;
pub mod webhooks;

use axum::{
    extract::State,
    http::{HeaderValue, StatusCode},
    response::Json,
    routing::{get, post},
    Router,
};
use chrono::Utc;
use sea_orm::DatabaseConnection;
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tower_http::{
    compression::CompressionLayer,
    cors::{Any, CorsLayer},
    timeout::TimeoutLayer,
};

use crate::cache::CacheBackend;
use crate::message_queue::MessageQueue;
use crate::middleware_helpers::request_id::request_id_middleware;
use crate::services::payment_gateway::PaymentGateway;
use crate::session::{session_layer, CacheSessionStore};

/// Upper bound for a whole request, including provider calls
const REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

// App state definition
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<DatabaseConnection>,
    pub config: config::AppConfig,
    pub cache: Arc<dyn CacheBackend>,
    pub queue: Arc<dyn MessageQueue>,
    pub services: handlers::AppServices,
}

impl AppState {
    pub fn new(
        config: config::AppConfig,
        db: Arc<DatabaseConnection>,
        cache: Arc<dyn CacheBackend>,
        queue: Arc<dyn MessageQueue>,
        gateway: Arc<dyn PaymentGateway>,
    ) -> Self {
        let services = handlers::AppServices::new(
            db.clone(),
            cache.clone(),
            queue.clone(),
            gateway,
            &config,
        );
        Self {
            db,
            config,
            cache,
            queue,
            services,
        }
    }
}

#[derive(Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: Option<T>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    pub meta: ResponseMeta,
}

#[derive(Serialize)]
pub struct ResponseMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub timestamp: String,
}

impl ResponseMeta {
    fn capture() -> Self {
        Self {
            request_id: crate::tracing::current_request_id().map(|rid| rid.as_str().to_string()),
            timestamp: Utc::now().to_rfc3339(),
        }
    }
}

impl<T> ApiResponse<T> {
    pub fn success(data: T) -> Self {
        Self {
            success: true,
            data: Some(data),
            message: None,
            meta: ResponseMeta::capture(),
        }
    }

    pub fn failure(data: T, message: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Some(data),
            message: Some(message.into()),
            meta: ResponseMeta::capture(),
        }
    }
}

/// Storefront routes, mounted under `/api/v1`
pub fn api_v1_routes(state: &AppState) -> Router<Arc<AppState>> {
    let session = session_layer(
        CacheSessionStore::new(state.cache.clone()),
        state.config.session_ttl_secs,
        state.config.session_cookie_secure,
    );

    Router::new()
        .nest("/cart", handlers::cart::cart_routes().layer(session.clone()))
        .nest(
            "/coupons",
            handlers::coupons::coupon_routes().layer(session.clone()),
        )
        .nest(
            "/orders",
            handlers::orders::order_routes().layer(session.clone()),
        )
        .nest(
            "/payments",
            handlers::payments::payment_routes()
                .layer(session)
                // provider-to-server; no shopper session
                .route(
                    "/webhook",
                    post(handlers::payment_webhooks::payment_webhook),
                ),
        )
}

/// Full application router with the middleware stack
pub fn build_router(state: Arc<AppState>) -> Router {
    let cors = cors_layer(&state.config);

    Router::new()
        .route("/health", get(health_check))
        .route("/status", get(status))
        .nest("/api/v1", api_v1_routes(&state))
        .layer(CompressionLayer::new())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .layer(cors)
        .layer(crate::tracing::configure_http_tracing())
        .layer(axum::middleware::from_fn(request_id_middleware))
        .with_state(state)
}

fn cors_layer(cfg: &config::AppConfig) -> CorsLayer {
    let origins: Vec<HeaderValue> = cfg
        .cors_allowed_origins
        .as_deref()
        .unwrap_or_default()
        .split(',')
        .map(str::trim)
        .filter(|origin| !origin.is_empty())
        .filter_map(|origin| HeaderValue::from_str(origin).ok())
        .collect();

    if !origins.is_empty() {
        CorsLayer::new()
            .allow_origin(origins)
            .allow_methods(Any)
            .allow_headers(Any)
    } else if cfg.should_allow_permissive_cors() {
        CorsLayer::permissive()
    } else {
        ::tracing::warn!("no CORS origins configured; cross-origin requests will be refused");
        CorsLayer::new()
    }
}

async fn health_check(State(state): State<Arc<AppState>>) -> (StatusCode, Json<ApiResponse<Value>>) {
    let db_status = match state.db.ping().await {
        Ok(_) => "healthy",
        Err(_) => "unhealthy",
    };
    let cache_status = match state.cache.ping().await {
        Ok(_) => "healthy",
        Err(_) => "unhealthy",
    };
    let healthy = db_status == "healthy" && cache_status == "healthy";

    let data = json!({
        "status": if healthy { "healthy" } else { "unhealthy" },
        "checks": {
            "database": db_status,
            "cache": cache_status,
        },
    });

    if healthy {
        (StatusCode::OK, Json(ApiResponse::success(data)))
    } else {
        (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(ApiResponse::failure(data, "dependency check failed")),
        )
    }
}

async fn status(State(state): State<Arc<AppState>>) -> Json<ApiResponse<Value>> {
    Json(ApiResponse::success(json!({
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "environment": state.config.environment,
    })))
}
