use crate::api::reply;
use crate::store::StoreError;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use serde_json::json;
use std::any::Any;
use thiserror::Error;
use tracing::error;

/// Failures that end a storage request
#[derive(Error, Debug)]
pub enum ApiError {
    #[error("Postgres is not configured")]
    NotConfigured,

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error("Failed to read request body: {0}")]
    Body(#[from] axum::Error),
}

impl ApiError {
    pub fn code(&self) -> Option<String> {
        match self {
            ApiError::Store(err) => err.code(),
            ApiError::NotConfigured | ApiError::Body(_) => None,
        }
    }

    pub fn name(&self) -> &'static str {
        match self {
            ApiError::NotConfigured => "NotConfigured",
            ApiError::Store(err) => err.name(),
            ApiError::Body(_) => "BodyError",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if let ApiError::NotConfigured = self {
            return not_configured();
        }

        error!(error = %self, name = self.name(), code = ?self.code(), "Storage request failed");
        metrics::counter!("storage.errors", "name" => self.name()).increment(1);

        server_error(self.to_string(), self.code(), self.name())
    }
}

/// 503 returned whenever no database variables are present
pub fn not_configured() -> Response {
    reply(
        StatusCode::SERVICE_UNAVAILABLE,
        json!({
            "ok": false,
            "error": "pg_not_configured",
            "message": "Postgres is not configured. Set POSTGRES_URL (or DATABASE_URL) for this deployment.",
        }),
    )
}

fn server_error(message: String, code: Option<String>, name: &str) -> Response {
    let message = if message.is_empty() {
        "server_error".to_string()
    } else {
        message
    };

    reply(
        StatusCode::INTERNAL_SERVER_ERROR,
        json!({
            "ok": false,
            "error": message,
            "details": { "code": code, "name": name },
        }),
    )
}

/// Response for a handler that panicked, in the same shape as other 500s
pub fn handle_panic(err: Box<dyn Any + Send + 'static>) -> Response {
    let message = if let Some(s) = err.downcast_ref::<String>() {
        s.clone()
    } else if let Some(s) = err.downcast_ref::<&str>() {
        s.to_string()
    } else {
        String::new()
    };

    error!(panic = %message, "Storage handler panicked");
    metrics::counter!("storage.errors", "name" => "Panic").increment(1);

    server_error(message, None, "Panic")
}

#[cfg(test)]
mod tests {
    use super::*;
    use axum::body::to_bytes;
    use serde_json::Value;

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn test_store_error_becomes_structured_500() {
        let err = ApiError::from(StoreError::from(sqlx::Error::PoolTimedOut));
        let response = err.into_response();

        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(response.headers()["cache-control"], "no-store");

        let body = body_json(response).await;
        assert_eq!(body["ok"], false);
        assert!(!body["error"].as_str().unwrap().is_empty());
        assert_eq!(body["details"]["name"], "PoolTimedOut");
        assert!(body["details"]["code"].is_null());
    }

    #[tokio::test]
    async fn test_sqlstate_is_reported_in_details() {
        let err = ApiError::from(crate::store::tests::unique_violation());
        assert_eq!(err.code().as_deref(), Some("23505"));

        let body = body_json(err.into_response()).await;
        assert_eq!(body["ok"], false);
        assert_eq!(body["details"]["code"], "23505");
        assert_eq!(body["details"]["name"], "DatabaseError");
        assert!(body["error"].as_str().unwrap().contains("kv_storage_pkey"));
    }

    #[tokio::test]
    async fn test_not_configured_is_503() {
        let response = ApiError::NotConfigured.into_response();
        assert_eq!(response.status(), StatusCode::SERVICE_UNAVAILABLE);

        let body = body_json(response).await;
        assert_eq!(body["ok"], false);
        assert_eq!(body["error"], "pg_not_configured");
        assert!(body["message"].is_string());
    }

    #[tokio::test]
    async fn test_empty_message_falls_back_to_server_error() {
        let response = handle_panic(Box::new(42_u32));
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        let body = body_json(response).await;
        assert_eq!(body["error"], "server_error");
        assert_eq!(body["details"]["name"], "Panic");
    }

    #[tokio::test]
    async fn test_panic_message_is_reported() {
        let response = handle_panic(Box::new("boom"));
        let body = body_json(response).await;
        assert_eq!(body["error"], "boom");
    }
}
