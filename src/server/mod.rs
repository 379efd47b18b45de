// src/server/mod.rs

//! Server-side components for Keywarden.
//!
//! This module contains:
//! - `database`  → storage abstraction over SQLite/Postgres
//! - `validate`  → the license validation engine
//! - `admin`     → operator operations (create/revoke/renew/unbind, listings)
//! - `auth`      → token issuer + operator session handling
//! - `audit`     → audit log vocabulary and writer
//! - `handlers`  → shared state, envelopes, device-facing handlers
//! - `logging`   → request logging middleware
//! - `routes`    → router builder

pub mod admin;
pub mod audit;
pub mod auth;
pub mod database;
pub mod handlers;
pub mod logging;
pub mod routes;
pub mod validate;

// Convenient re-exports so callers can do `keywarden::server::X`
// instead of digging into submodules.

pub use admin::{
    create_license_handler, list_activations_handler, list_licenses_handler, list_logs_handler,
    renew_license_handler, revoke_license_handler, unbind_activation_handler,
    CreateLicenseRequest, Pagination, ProductResolver, RenewLicenseRequest, RevokeLicenseRequest,
    StoreProductResolver, UnbindActivationRequest,
};
pub use audit::{LogAction, LogOperator, LogResult};
pub use auth::{
    login_handler, logout_handler, verify_session_handler, Claims, LoginRequest, Operator,
    TokenIssuer, ADMIN_COOKIE, ADMIN_SUBJECT,
};
pub use database::{
    Activation, ActivationFilter, Database, License, LicenseFilter, LicenseLog, LicenseStatus,
    LogFilter, Product,
};
pub use handlers::{
    health_handler, validate_handler, ApiResponse, AppState, MessageResponse, ValidateRequest,
};
pub use routes::build_router;
pub use validate::{validate_license, LicenseSummary, ValidateOutcome, ValidateParams};
