//! Error-sanitizing middleware.
//!
//! Every response carrying an [`InternalErrorDetail`] is logged with its
//! request id, method and path. Outside production the detail is copied into
//! the JSON body; in production clients only see the generic message.

use axum::body::Body;
use axum::{
    Json,
    extract::{Request, State},
    middleware::Next,
    response::{IntoResponse, Response},
};
use tracing::{error, warn};

use crate::AppState;
use crate::error::InternalErrorDetail;
use crate::models::ErrorResponse;

/// Largest error body the middleware will re-read.
const MAX_ERROR_BODY: usize = 64 * 1024;

pub async fn sanitize_errors(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Response {
    let request_id = request
        .headers()
        .get("x-request-id")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("-")
        .to_string();
    let method = request.method().clone();
    let path = request.uri().path().to_string();

    let mut response = next.run(request).await;
    let Some(InternalErrorDetail(detail)) = response.extensions_mut().remove::<InternalErrorDetail>()
    else {
        return response;
    };

    let status = response.status();
    if status.is_server_error() && status.as_u16() != 502 {
        error!(%request_id, %method, %path, %status, detail = %detail, "request failed");
    } else {
        warn!(%request_id, %method, %path, %status, detail = %detail, "upstream call failed");
    }

    if state.config.is_production() {
        return response;
    }

    let (mut parts, body) = response.into_parts();
    let Ok(bytes) = axum::body::to_bytes(body, MAX_ERROR_BODY).await else {
        return Response::from_parts(parts, Body::empty());
    };
    match serde_json::from_slice::<ErrorResponse>(&bytes) {
        Ok(mut payload) => {
            payload.detail = Some(detail);
            parts.headers.remove(axum::http::header::CONTENT_LENGTH);
            let rebuilt = Json(payload).into_response();
            Response::from_parts(parts, rebuilt.into_body())
        }
        Err(_) => Response::from_parts(parts, Body::from(bytes)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::Router;
    use axum::http::StatusCode;
    use axum::routing::get;
    use messagelove_core::auth::memory::MemoryAuthRepository;
    use tower::ServiceExt;

    use crate::config::{ApiConfig, Environment};
    use crate::error::AppError;

    async fn failing() -> Result<&'static str, AppError> {
        Err(AppError::Internal("pool timed out".into()))
    }

    async fn call(environment: Environment) -> serde_json::Value {
        let mut config = ApiConfig::for_testing("secret");
        config.environment = environment;
        let state = AppState::new(config, Arc::new(MemoryAuthRepository::new())).expect("state");
        let app = Router::new()
            .route("/boom", get(failing))
            .layer(axum::middleware::from_fn_with_state(state.clone(), sanitize_errors))
            .with_state(state);
        let response = app
            .oneshot(axum::http::Request::builder().uri("/boom").body(Body::empty()).expect("request"))
            .await
            .expect("response");
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .expect("body");
        serde_json::from_slice(&bytes).expect("json")
    }

    #[tokio::test]
    async fn development_includes_detail() {
        let json = call(Environment::Development).await;
        assert_eq!(json["error"], "internal_error");
        assert_eq!(json["detail"], "pool timed out");
    }

    #[tokio::test]
    async fn production_hides_detail() {
        let json = call(Environment::Production).await;
        assert_eq!(json["message"], "Internal server error");
        assert!(json.get("detail").is_none());
    }
}
