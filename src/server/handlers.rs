//! Shared application state, response envelopes, and the device-facing
//! handlers.
//!
//! Request bodies use camelCase field names; response rows keep their
//! snake_case column names. Success bodies are `{"success": true, ...}`;
//! error bodies come from the `ServiceError` renderer.

use std::sync::Arc;

use axum::{extract::State, http::HeaderMap, Json};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use crate::errors::{ServiceError, ServiceResult};
use crate::server::admin::ProductResolver;
use crate::server::auth::TokenIssuer;
use crate::server::database::Database;
use crate::server::logging::HealthResponse;
use crate::server::validate::{validate_license, ValidateOutcome, ValidateParams};

/// Shared application state for handlers.
#[derive(Clone)]
pub struct AppState {
    pub db: Arc<Database>,
    pub issuer: Arc<TokenIssuer>,
    pub products: Arc<dyn ProductResolver>,
}

/// Success envelope carrying a data payload.
#[derive(Debug, Serialize)]
pub struct ApiResponse<T> {
    pub success: bool,
    pub data: T,
}

impl<T> ApiResponse<T> {
    pub fn new(data: T) -> Self {
        Self {
            success: true,
            data,
        }
    }
}

/// Success envelope carrying only a human-readable message.
#[derive(Debug, Serialize)]
pub struct MessageResponse {
    pub success: bool,
    pub message: String,
}

impl MessageResponse {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            success: true,
            message: message.into(),
        }
    }
}

/// Best-effort client IP from proxy headers.
pub fn client_ip(headers: &HeaderMap) -> String {
    if let Some(forwarded) = headers.get("x-forwarded-for").and_then(|v| v.to_str().ok()) {
        if let Some(first) = forwarded.split(',').next() {
            let first = first.trim();
            if !first.is_empty() {
                return first.to_string();
            }
        }
    }

    if let Some(real_ip) = headers.get("x-real-ip").and_then(|v| v.to_str().ok()) {
        return real_ip.to_string();
    }

    "unknown".to_string()
}

/// Derive a fallback device id when the client did not supply one.
///
/// Best-effort fingerprint over user-agent, accept-language, and the
/// current time; opaque to the rest of the system and not a security
/// boundary.
pub fn derive_device_id(headers: &HeaderMap) -> String {
    let user_agent = headers
        .get("user-agent")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    let accept_language = headers
        .get("accept-language")
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");

    let mut hasher = Sha256::new();
    hasher.update(
        format!(
            "{user_agent}-{accept_language}-{}",
            Utc::now().timestamp_millis()
        )
        .as_bytes(),
    );
    hex::encode(hasher.finalize())
}

/// Request body for license validation.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ValidateRequest {
    pub license_key: Option<String>,
    pub device_id: Option<String>,
    pub device_info: Option<String>,
}

/// POST /validate - the device-facing validation endpoint.
///
/// Resolves the device identity (caller-supplied or derived) and hands
/// off to the validation engine.
pub async fn validate_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ValidateRequest>,
) -> ServiceResult<Json<ApiResponse<ValidateOutcome>>> {
    let license_key = req
        .license_key
        .as_deref()
        .map(str::trim)
        .filter(|k| !k.is_empty())
        .ok_or_else(|| ServiceError::InvalidInput("license key is required".to_string()))?
        .to_string();

    let device_id = req
        .device_id
        .filter(|d| !d.trim().is_empty())
        .unwrap_or_else(|| derive_device_id(&headers));

    let params = ValidateParams {
        license_key,
        device_id,
        device_info: req.device_info,
        ip: client_ip(&headers),
    };

    let outcome = validate_license(&state.db, &state.issuer, params).await?;
    Ok(Json(ApiResponse::new(outcome)))
}

/// GET /health - service and storage liveness.
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    let connected = state.db.ping().await;
    Json(HealthResponse::healthy(connected, state.db.backend()))
}
