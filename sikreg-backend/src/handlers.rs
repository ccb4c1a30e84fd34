//! HTTP handlers

use std::sync::Arc;

use axum::{Json, extract::State, http::StatusCode, response::IntoResponse};
use tokio::sync::RwLock;

use sikreg_core::Section;
use sikreg_core::protocol::{ErrorBody, LoginResponse, TestCheckRequest, TestCheckResponse};

use crate::state::{BackendState, RegisterError};

pub type SharedState = Arc<RwLock<BackendState>>;

/// Health check endpoint
pub async fn health_handler() -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "service": "sikreg-backend"
    }))
}

/// `/auth.php`: register the section and hand out its stream endpoint
pub async fn auth_handler(
    State(state): State<SharedState>,
    Json(section): Json<Section>,
) -> Result<Json<LoginResponse>, (StatusCode, Json<ErrorBody>)> {
    let mut s = state.write().await;
    match s.register(&section) {
        Ok(resp) => Ok(Json(resp)),
        Err(e) => {
            tracing::warn!(udi = section.udi_or_empty(), "Refused login: {}", e);
            let status = match e {
                RegisterError::InvalidUdi => StatusCode::FORBIDDEN,
                RegisterError::MissingKey => StatusCode::BAD_REQUEST,
            };
            Err((status, Json(ErrorBody::new(e.to_string()))))
        }
    }
}

/// `/check.php`: report whether the section's test stream has been seen
pub async fn check_handler(
    State(state): State<SharedState>,
    Json(req): Json<TestCheckRequest>,
) -> Json<TestCheckResponse> {
    let mut s = state.write().await;
    let resp = s.record_check(&req);
    tracing::debug!(udi = %req.udi, result = %resp.result, "Test check");
    Json(resp)
}
