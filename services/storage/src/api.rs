use crate::config::{ApiConfig, Config, DatabaseEnv, EnvPresence};
use crate::error::{handle_panic, not_configured, ApiError};
use crate::intent::{empty_object, RequestIntent};
use crate::store::{KvStore, StorageKey};
use anyhow::{Context, Result};
use axum::{
    body::{to_bytes, Bytes},
    extract::{Request, State},
    http::{header, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    routing::{any, get},
    Json, Router,
};
use chrono::{SecondsFormat, Utc};
use serde::Serialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tower_http::catch_panic::CatchPanicLayer;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;
use tracing::{debug, info, instrument, warn};

/// Application state shared across handlers
#[derive(Clone)]
pub struct AppState {
    pub store: Option<Arc<dyn KvStore>>,
    pub db_env: Arc<DatabaseEnv>,
    pub service_name: String,
    pub max_body_bytes: usize,
}

impl AppState {
    pub fn new(db_env: DatabaseEnv, store: Option<Arc<dyn KvStore>>, config: &Config) -> Self {
        Self {
            store,
            db_env: Arc::new(db_env),
            service_name: config.service.name.clone(),
            max_body_bytes: config.api.max_body_bytes,
        }
    }

    /// The store, but only while database variables are present
    fn configured_store(&self) -> Option<&dyn KvStore> {
        if self.db_env.has_database_config() {
            self.store.as_deref()
        } else {
            None
        }
    }
}

/// Body of the `diag` response
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct Diagnostics {
    pub has_database_config: bool,
    #[serde(flatten)]
    pub presence: EnvPresence,
    /// Compiler and target the binary was built with, plus the package version
    pub runtime: String,
}

impl Diagnostics {
    fn collect(db_env: &DatabaseEnv) -> Self {
        Self {
            has_database_config: db_env.has_database_config(),
            presence: db_env.presence(),
            runtime: format!(
                "{} ({}-{}) {}/{}",
                env!("RUSTC_VERSION"),
                std::env::consts::ARCH,
                std::env::consts::OS,
                env!("CARGO_PKG_NAME"),
                env!("CARGO_PKG_VERSION"),
            ),
        }
    }
}

/// JSON response that must never be cached
pub fn reply(status: StatusCode, body: Value) -> Response {
    let mut response = (status, Json(body)).into_response();
    response
        .headers_mut()
        .insert(header::CACHE_CONTROL, HeaderValue::from_static("no-store"));
    response
}

/// Create the API router
pub fn create_router(state: AppState, config: &ApiConfig) -> Router {
    let cors = if config.cors_enabled {
        if config.cors_origins.is_empty() {
            CorsLayer::new()
                .allow_origin(Any)
                .allow_methods(Any)
                .allow_headers(Any)
        } else {
            let origins: Vec<_> = config
                .cors_origins
                .iter()
                .filter_map(|o| o.parse().ok())
                .collect();
            CorsLayer::new()
                .allow_origin(origins)
                .allow_methods(Any)
                .allow_headers(Any)
        }
    } else {
        CorsLayer::new()
    };

    Router::new()
        .route("/health", get(health_check))
        .route("/ready", get(readiness_check))
        .route(&config.path, any(handle_storage))
        .layer(CatchPanicLayer::custom(handle_panic))
        .layer(TraceLayer::new_for_http())
        .layer(cors)
        .with_state(state)
}

/// Health check endpoint
async fn health_check(State(state): State<AppState>) -> impl IntoResponse {
    Json(json!({
        "status": "healthy",
        "service": state.service_name,
    }))
}

/// Readiness check endpoint
async fn readiness_check(State(state): State<AppState>) -> impl IntoResponse {
    let Some(store) = state.configured_store() else {
        return (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "database": "not_configured"
            })),
        );
    };

    match store.health_check().await {
        Ok(()) => (
            StatusCode::OK,
            Json(json!({
                "status": "ready",
                "database": "connected"
            })),
        ),
        Err(e) => (
            StatusCode::SERVICE_UNAVAILABLE,
            Json(json!({
                "status": "not_ready",
                "database": "disconnected",
                "error": e.to_string()
            })),
        ),
    }
}

/// The storage endpoint: every method lands here and is dispatched by intent
#[instrument(skip_all, fields(method = %request.method(), intent = tracing::field::Empty))]
async fn handle_storage(
    State(state): State<AppState>,
    request: Request,
) -> Result<Response, ApiError> {
    let (parts, body) = request.into_parts();
    let target = parts.uri.to_string();
    let store = state.configured_store();
    let configured = store.is_some();

    let body = if RequestIntent::needs_body(&parts.method, &target, configured) {
        to_bytes(body, state.max_body_bytes).await?
    } else {
        Bytes::new()
    };

    let intent = RequestIntent::classify(&parts.method, &target, configured, &body);
    tracing::Span::current().record("intent", intent.label());
    metrics::counter!("storage.requests", "intent" => intent.label()).increment(1);

    match intent {
        RequestIntent::Diagnostic => Ok(diagnostic(&state.db_env)),
        RequestIntent::Unconfigured => Ok(not_configured()),
        RequestIntent::MethodNotAllowed => Ok(method_not_allowed()),
        RequestIntent::Load => load_state(store.ok_or(ApiError::NotConfigured)?).await,
        RequestIntent::Ping => ping(store.ok_or(ApiError::NotConfigured)?).await,
        RequestIntent::Save(kv) => save_state(store.ok_or(ApiError::NotConfigured)?, kv).await,
    }
}

fn diagnostic(db_env: &DatabaseEnv) -> Response {
    let diag = Diagnostics::collect(db_env);
    reply(StatusCode::OK, json!({ "ok": true, "diag": diag }))
}

fn method_not_allowed() -> Response {
    let mut response = reply(
        StatusCode::METHOD_NOT_ALLOWED,
        json!({ "ok": false, "error": "method_not_allowed" }),
    );
    response
        .headers_mut()
        .insert(header::ALLOW, HeaderValue::from_static("GET, POST"));
    response
}

async fn load_state(store: &dyn KvStore) -> Result<Response, ApiError> {
    store.ensure_schema().await?;

    let kv = store
        .load(StorageKey::State)
        .await?
        .map(|record| record.value)
        .unwrap_or_else(empty_object);

    Ok(reply(StatusCode::OK, json!({ "ok": true, "kv": kv })))
}

async fn save_state(store: &dyn KvStore, kv: Value) -> Result<Response, ApiError> {
    store.ensure_schema().await?;
    store.upsert(StorageKey::State, &kv).await?;

    debug!("Saved state replaced");
    Ok(reply(StatusCode::OK, json!({ "ok": true })))
}

/// Write a fresh stamp, read it straight back and compare.
///
/// A lagging replica can legitimately fail this, so a mismatch is reported as
/// `{ok:false}` without further detail.
async fn ping(store: &dyn KvStore) -> Result<Response, ApiError> {
    store.ensure_schema().await?;

    let stamp = Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true);
    store
        .upsert(StorageKey::Ping, &json!({ "stamp": stamp }))
        .await?;

    let record = store.load(StorageKey::Ping).await?;
    let read_back = record
        .as_ref()
        .and_then(|r| r.value.get("stamp"))
        .and_then(Value::as_str);

    if read_back == Some(stamp.as_str()) {
        Ok(reply(StatusCode::OK, json!({ "ok": true })))
    } else {
        warn!(written = %stamp, read = ?read_back, "Ping stamp mismatch");
        metrics::counter!("storage.ping.mismatch").increment(1);
        Ok(reply(StatusCode::INTERNAL_SERVER_ERROR, json!({ "ok": false })))
    }
}

/// Start the storage API server
pub async fn start_api_server(
    state: AppState,
    config: &ApiConfig,
    shutdown: impl std::future::Future<Output = ()> + Send + 'static,
) -> Result<()> {
    let router = create_router(state, config);
    let addr = format!("{}:{}", config.host, config.port);

    info!(address = %addr, path = %config.path, "Starting storage API server");

    let listener = tokio::net::TcpListener::bind(&addr)
        .await
        .context("Failed to bind to address")?;

    axum::serve(listener, router)
        .with_graceful_shutdown(shutdown)
        .await
        .context("API server error")?;

    Ok(())
}
