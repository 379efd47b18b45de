//! Administrative operations: create, revoke, renew, unbind, and the
//! paginated listings.
//!
//! All endpoints here require an operator session (the [`Operator`]
//! extractor); none are reachable by device clients. Every state change
//! writes an audit row.

use std::sync::Arc;

use async_trait::async_trait;
use axum::{
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use chrono::{NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::errors::{ServiceError, ServiceResult};
use crate::license_key::generate_unique_license_key;
use crate::server::audit::{self, LogAction, LogOperator, LogResult};
use crate::server::auth::Operator;
use crate::server::database::{
    Activation, ActivationFilter, Database, License, LicenseFilter, LicenseLog, LicenseStatus,
    LogFilter, Product,
};
use crate::server::handlers::{client_ip, ApiResponse, AppState, MessageResponse};

// ============================================================================
// Product resolution
// ============================================================================

/// Find-or-create collaborator for product names.
///
/// License creation calls this instead of branching on product existence
/// inline; a resolution failure degrades to an unassociated license and
/// never blocks the create.
#[async_trait]
pub trait ProductResolver: Send + Sync {
    /// Resolve a product by display name, creating it if absent.
    /// Returns the product id.
    async fn resolve_or_create(&self, name: &str) -> ServiceResult<String>;
}

/// Store-backed [`ProductResolver`].
pub struct StoreProductResolver {
    db: Arc<Database>,
}

impl StoreProductResolver {
    pub fn new(db: Arc<Database>) -> Self {
        Self { db }
    }
}

#[async_trait]
impl ProductResolver for StoreProductResolver {
    async fn resolve_or_create(&self, name: &str) -> ServiceResult<String> {
        if let Some(existing) = self.db.find_product_by_name(name).await? {
            return Ok(existing.id);
        }

        let product = Product::new(name, Some(format!("Product: {name}")));
        match self.db.insert_product(&product).await {
            Ok(()) => Ok(product.id),
            Err(e) => {
                // The unique name constraint may have lost a race with a
                // concurrent create; prefer whichever row won.
                if let Some(existing) = self.db.find_product_by_name(name).await? {
                    Ok(existing.id)
                } else {
                    Err(e)
                }
            }
        }
    }
}

// ============================================================================
// Helpers
// ============================================================================

/// Parse an ISO 8601 datetime string into NaiveDateTime.
fn parse_datetime(s: &str) -> ServiceResult<NaiveDateTime> {
    if let Ok(dt) = chrono::DateTime::parse_from_rfc3339(s) {
        return Ok(dt.naive_utc());
    }

    // Date only: assume end of day.
    if let Ok(date) = chrono::NaiveDate::parse_from_str(s, "%Y-%m-%d") {
        return Ok(date.and_hms_opt(23, 59, 59).unwrap());
    }

    if let Ok(dt) = chrono::NaiveDateTime::parse_from_str(s, "%Y-%m-%dT%H:%M:%S") {
        return Ok(dt);
    }

    Err(ServiceError::InvalidInput(format!(
        "invalid datetime: {s}. Use ISO 8601 (e.g., '2025-12-31T23:59:59Z' or '2025-12-31')"
    )))
}

fn required<'a>(value: Option<&'a str>, field: &str) -> ServiceResult<&'a str> {
    value
        .map(str::trim)
        .filter(|v| !v.is_empty())
        .ok_or_else(|| ServiceError::InvalidInput(format!("{field} is required")))
}

// ============================================================================
// Pagination
// ============================================================================

fn default_page() -> i64 {
    1
}
fn default_limit() -> i64 {
    20
}
fn default_log_limit() -> i64 {
    50
}

/// Pagination block returned by every listing.
#[derive(Debug, Serialize)]
pub struct Pagination {
    pub page: i64,
    pub limit: i64,
    pub total: i64,
    pub pages: i64,
}

impl Pagination {
    fn new(page: i64, limit: i64, total: i64) -> Self {
        Self {
            page,
            limit,
            total,
            pages: (total + limit - 1) / limit,
        }
    }
}

/// Clamp raw query parameters to sane bounds.
fn clamp_page(page: i64, limit: i64) -> (i64, i64, i64) {
    let page = page.max(1);
    let limit = limit.clamp(1, 100);
    (page, limit, (page - 1) * limit)
}

// ============================================================================
// Create
// ============================================================================

/// Request body for creating a license.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateLicenseRequest {
    pub start_time: Option<String>,
    pub end_time: Option<String>,
    pub max_activations: Option<i64>,
    pub note: Option<String>,
    /// Product display name; resolved (or created) on the fly.
    pub product_id: Option<String>,
}

/// POST /licenses/create
pub async fn create_license_handler(
    State(state): State<AppState>,
    _operator: Operator,
    headers: HeaderMap,
    Json(req): Json<CreateLicenseRequest>,
) -> ServiceResult<Json<ApiResponse<License>>> {
    let start_time = parse_datetime(required(req.start_time.as_deref(), "startTime")?)?;
    let end_time = parse_datetime(required(req.end_time.as_deref(), "endTime")?)?;

    if start_time >= end_time {
        return Err(ServiceError::InvalidInput(
            "end time must be later than start time".to_string(),
        ));
    }

    let max_activations = req.max_activations.unwrap_or(1);
    if max_activations < 1 {
        return Err(ServiceError::InvalidInput(
            "maxActivations must be at least 1".to_string(),
        ));
    }

    let db = state.db.clone();
    let license_key = generate_unique_license_key(|key| {
        let db = db.clone();
        async move { db.license_key_exists(&key).await }
    })
    .await?;

    let product_id = match req
        .product_id
        .as_deref()
        .map(str::trim)
        .filter(|name| !name.is_empty())
    {
        Some(name) => match state.products.resolve_or_create(name).await {
            Ok(id) => Some(id),
            Err(e) => {
                // The license is still created, just unassociated.
                warn!("product resolution failed for '{name}': {e}");
                None
            }
        },
        None => None,
    };

    let now = Utc::now().naive_utc();
    let license = License {
        id: Uuid::new_v4().to_string(),
        license_key,
        product_id,
        start_time,
        end_time,
        status: LicenseStatus::Active.as_str().to_string(),
        max_activations,
        note: req.note.filter(|n| !n.trim().is_empty()),
        created_at: now,
        updated_at: now,
    };

    state.db.insert_license(&license).await?;

    audit::record(
        &state.db,
        Some(&license.id),
        LogAction::Create,
        LogResult::Success,
        format!("license created: {}", license.license_key),
        LogOperator::Admin,
        &client_ip(&headers),
    )
    .await;

    info!(license_id = %license.id, "license created");
    Ok(Json(ApiResponse::new(license)))
}

// ============================================================================
// Revoke
// ============================================================================

/// Request body for revoking a license.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RevokeLicenseRequest {
    pub license_id: Option<String>,
    pub reason: Option<String>,
}

/// POST /licenses/revoke
///
/// Revoking is terminal: the status flip is authoritative, and every live
/// activation is unbound in one bulk statement. A cascade failure after
/// the flip leaves the license revoked; stale live rows are reported for
/// operator reconciliation rather than failing the call.
pub async fn revoke_license_handler(
    State(state): State<AppState>,
    _operator: Operator,
    headers: HeaderMap,
    Json(req): Json<RevokeLicenseRequest>,
) -> ServiceResult<Json<MessageResponse>> {
    let license_id = required(req.license_id.as_deref(), "licenseId")?;

    let license = state
        .db
        .get_license(license_id)
        .await?
        .ok_or_else(|| ServiceError::NotFound("license not found".to_string()))?;

    if license.is_revoked() {
        return Err(ServiceError::Conflict(
            "license already revoked".to_string(),
        ));
    }

    if !state.db.mark_revoked(&license.id).await? {
        // Raced another revoke between the read and the flip.
        return Err(ServiceError::Conflict(
            "license already revoked".to_string(),
        ));
    }

    match state.db.unbind_all_for_license(&license.id).await {
        Ok(unbound) => {
            info!(license_id = %license.id, unbound, "license revoked");
        }
        Err(e) => {
            error!(
                license_id = %license.id,
                "revoke cascade failed, live activations may remain: {e}"
            );
        }
    }

    let reason = req.reason.unwrap_or_else(|| "operator action".to_string());
    audit::record(
        &state.db,
        Some(&license.id),
        LogAction::Revoke,
        LogResult::Success,
        format!("license revoked: {reason}"),
        LogOperator::Admin,
        &client_ip(&headers),
    )
    .await;

    Ok(Json(MessageResponse::new("license revoked")))
}

// ============================================================================
// Renew
// ============================================================================

/// Request body for renewing a license.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RenewLicenseRequest {
    pub license_id: Option<String>,
    pub new_end_time: Option<String>,
    pub reason: Option<String>,
}

/// POST /licenses/renew
///
/// Renew only moves the end of the validity window on an active license.
/// It never changes status, so there is no path back to active for an
/// expired or revoked license.
pub async fn renew_license_handler(
    State(state): State<AppState>,
    _operator: Operator,
    headers: HeaderMap,
    Json(req): Json<RenewLicenseRequest>,
) -> ServiceResult<Json<MessageResponse>> {
    let license_id = required(req.license_id.as_deref(), "licenseId")?;
    let new_end_time = parse_datetime(required(req.new_end_time.as_deref(), "newEndTime")?)?;

    if new_end_time <= Utc::now().naive_utc() {
        return Err(ServiceError::InvalidInput(
            "new end time must be in the future".to_string(),
        ));
    }

    let license = state
        .db
        .get_license(license_id)
        .await?
        .ok_or_else(|| ServiceError::NotFound("license not found".to_string()))?;

    if !license.is_active() {
        return Err(ServiceError::Conflict(
            "only active licenses can be renewed".to_string(),
        ));
    }

    if !state.db.update_end_time(&license.id, new_end_time).await? {
        // Status changed between the read and the update.
        return Err(ServiceError::Conflict(
            "only active licenses can be renewed".to_string(),
        ));
    }

    let reason = req.reason.unwrap_or_else(|| "operator action".to_string());
    audit::record(
        &state.db,
        Some(&license.id),
        LogAction::Renew,
        LogResult::Success,
        format!("license renewed until {new_end_time}, reason: {reason}"),
        LogOperator::Admin,
        &client_ip(&headers),
    )
    .await;

    info!(license_id = %license.id, %new_end_time, "license renewed");
    Ok(Json(MessageResponse::new("license renewed")))
}

// ============================================================================
// Unbind
// ============================================================================

/// Request body for unbinding a device.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct UnbindActivationRequest {
    pub license_id: Option<String>,
    pub device_id: Option<String>,
    pub reason: Option<String>,
}

/// POST /activations/unbind
pub async fn unbind_activation_handler(
    State(state): State<AppState>,
    _operator: Operator,
    headers: HeaderMap,
    Json(req): Json<UnbindActivationRequest>,
) -> ServiceResult<Json<MessageResponse>> {
    let license_id = required(req.license_id.as_deref(), "licenseId")?;
    let device_id = required(req.device_id.as_deref(), "deviceId")?;

    if state
        .db
        .find_live_activation(license_id, device_id)
        .await?
        .is_none()
    {
        return Err(ServiceError::NotFound(
            "no live activation for this device".to_string(),
        ));
    }

    if !state.db.unbind_device(license_id, device_id).await? {
        // Unbound by someone else between the read and the update.
        return Err(ServiceError::NotFound(
            "no live activation for this device".to_string(),
        ));
    }

    let reason = req.reason.unwrap_or_else(|| "operator action".to_string());
    audit::record(
        &state.db,
        Some(license_id),
        LogAction::Unbind,
        LogResult::Success,
        format!("device unbound: {device_id}, reason: {reason}"),
        LogOperator::Admin,
        &client_ip(&headers),
    )
    .await;

    info!(license_id, device_id, "device unbound");
    Ok(Json(MessageResponse::new("device unbound")))
}

// ============================================================================
// Listings
// ============================================================================

/// Query parameters for GET /licenses.
#[derive(Debug, Deserialize)]
pub struct LicenseListQuery {
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
    pub status: Option<String>,
    pub product_id: Option<String>,
    pub search: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LicenseListData {
    pub licenses: Vec<License>,
    pub pagination: Pagination,
}

/// GET /licenses
pub async fn list_licenses_handler(
    State(state): State<AppState>,
    _operator: Operator,
    Query(query): Query<LicenseListQuery>,
) -> ServiceResult<Json<ApiResponse<LicenseListData>>> {
    let (page, limit, offset) = clamp_page(query.page, query.limit);

    let filter = LicenseFilter {
        status: query.status.filter(|s| !s.is_empty()),
        product_id: query.product_id.filter(|p| !p.is_empty()),
        search: query.search.filter(|s| !s.is_empty()),
    };

    let (licenses, total) = state.db.list_licenses(&filter, limit, offset).await?;

    Ok(Json(ApiResponse::new(LicenseListData {
        licenses,
        pagination: Pagination::new(page, limit, total),
    })))
}

/// Query parameters for GET /activations.
#[derive(Debug, Deserialize)]
pub struct ActivationListQuery {
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_limit")]
    pub limit: i64,
    pub license_id: Option<String>,
    /// "active" = live only, "unbound" = released only.
    pub status: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct ActivationListData {
    pub activations: Vec<Activation>,
    pub pagination: Pagination,
}

/// GET /activations
pub async fn list_activations_handler(
    State(state): State<AppState>,
    _operator: Operator,
    Query(query): Query<ActivationListQuery>,
) -> ServiceResult<Json<ApiResponse<ActivationListData>>> {
    let (page, limit, offset) = clamp_page(query.page, query.limit);

    let filter = ActivationFilter {
        license_id: query.license_id.filter(|l| !l.is_empty()),
        live: match query.status.as_deref() {
            Some("active") => Some(true),
            Some("unbound") => Some(false),
            _ => None,
        },
    };

    let (activations, total) = state.db.list_activations(&filter, limit, offset).await?;

    Ok(Json(ApiResponse::new(ActivationListData {
        activations,
        pagination: Pagination::new(page, limit, total),
    })))
}

/// Query parameters for GET /logs.
#[derive(Debug, Deserialize)]
pub struct LogListQuery {
    #[serde(default = "default_page")]
    pub page: i64,
    #[serde(default = "default_log_limit")]
    pub limit: i64,
    pub license_id: Option<String>,
    pub action: Option<String>,
    pub result: Option<String>,
    pub operator: Option<String>,
    pub start_date: Option<String>,
    pub end_date: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct LogListData {
    pub logs: Vec<LicenseLog>,
    pub pagination: Pagination,
}

/// GET /logs
pub async fn list_logs_handler(
    State(state): State<AppState>,
    _operator: Operator,
    Query(query): Query<LogListQuery>,
) -> ServiceResult<Json<ApiResponse<LogListData>>> {
    let (page, limit, offset) = clamp_page(query.page, query.limit);

    let start_date = match query.start_date.as_deref().filter(|s| !s.is_empty()) {
        Some(s) => Some(parse_datetime(s)?),
        None => None,
    };
    let end_date = match query.end_date.as_deref().filter(|s| !s.is_empty()) {
        Some(s) => Some(parse_datetime(s)?),
        None => None,
    };

    let filter = LogFilter {
        license_id: query.license_id.filter(|l| !l.is_empty()),
        action: query.action.filter(|a| !a.is_empty()),
        result: query.result.filter(|r| !r.is_empty()),
        operator: query.operator.filter(|o| !o.is_empty()),
        start_date,
        end_date,
    };

    let (logs, total) = state.db.list_logs(&filter, limit, offset).await?;

    Ok(Json(ApiResponse::new(LogListData {
        logs,
        pagination: Pagination::new(page, limit, total),
    })))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_datetime_accepts_rfc3339() {
        let dt = parse_datetime("2025-12-31T23:59:59Z").unwrap();
        assert_eq!(dt.to_string(), "2025-12-31 23:59:59");
    }

    #[test]
    fn parse_datetime_accepts_date_only_as_end_of_day() {
        let dt = parse_datetime("2025-12-31").unwrap();
        assert_eq!(dt.to_string(), "2025-12-31 23:59:59");
    }

    #[test]
    fn parse_datetime_accepts_naive() {
        let dt = parse_datetime("2025-06-15T08:30:00").unwrap();
        assert_eq!(dt.to_string(), "2025-06-15 08:30:00");
    }

    #[test]
    fn parse_datetime_rejects_garbage() {
        assert!(parse_datetime("next tuesday").is_err());
        assert!(parse_datetime("31-12-2025").is_err());
        assert!(parse_datetime("").is_err());
    }

    #[test]
    fn pagination_rounds_page_count_up() {
        assert_eq!(Pagination::new(1, 20, 0).pages, 0);
        assert_eq!(Pagination::new(1, 20, 1).pages, 1);
        assert_eq!(Pagination::new(1, 20, 20).pages, 1);
        assert_eq!(Pagination::new(1, 20, 21).pages, 2);
    }

    #[test]
    fn clamp_page_bounds_inputs() {
        assert_eq!(clamp_page(0, 20), (1, 20, 0));
        assert_eq!(clamp_page(-5, 1000), (1, 100, 0));
        assert_eq!(clamp_page(3, 20), (3, 20, 40));
    }

    #[test]
    fn required_rejects_blank_fields() {
        assert!(required(None, "licenseId").is_err());
        assert!(required(Some("   "), "licenseId").is_err());
        assert_eq!(required(Some(" abc "), "licenseId").unwrap(), "abc");
    }
}
