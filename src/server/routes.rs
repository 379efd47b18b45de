use axum::{
    middleware,
    routing::{get, post},
    Router,
};
use tower::ServiceBuilder;

use crate::server::admin::{
    create_license_handler, list_activations_handler, list_licenses_handler, list_logs_handler,
    renew_license_handler, revoke_license_handler, unbind_activation_handler,
};
use crate::server::auth::{login_handler, logout_handler, verify_session_handler};
use crate::server::handlers::{health_handler, validate_handler, AppState};
use crate::server::logging::request_logging_middleware;

/// Build the application router.
///
/// # Routes
///
/// ## Device-facing
/// - `POST /validate` - Validate a license key and bind the device
///
/// ## Operator endpoints (session cookie required)
/// - `POST /licenses/create` - Create a license
/// - `POST /licenses/revoke` - Revoke a license and unbind its devices
/// - `POST /licenses/renew` - Extend an active license
/// - `POST /activations/unbind` - Unbind a single device
/// - `GET /licenses` - List licenses (paginated, filterable)
/// - `GET /activations` - List activations (paginated, filterable)
/// - `GET /logs` - List audit log entries (paginated, filterable)
///
/// ## Session
/// - `POST /auth/login` - Exchange the operator password for a cookie
/// - `POST /auth/logout` - Clear the session cookie
/// - `GET /auth/verify` - Check the session cookie
///
/// ## Diagnostics
/// - `GET /health` - Service and storage liveness
pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/validate", post(validate_handler))
        .route("/licenses/create", post(create_license_handler))
        .route("/licenses/revoke", post(revoke_license_handler))
        .route("/licenses/renew", post(renew_license_handler))
        .route("/licenses", get(list_licenses_handler))
        .route("/activations/unbind", post(unbind_activation_handler))
        .route("/activations", get(list_activations_handler))
        .route("/logs", get(list_logs_handler))
        .route("/auth/login", post(login_handler))
        .route("/auth/logout", post(logout_handler))
        .route("/auth/verify", get(verify_session_handler))
        .route("/health", get(health_handler))
        .layer(ServiceBuilder::new().layer(middleware::from_fn(request_logging_middleware)))
        .with_state(state)
}
