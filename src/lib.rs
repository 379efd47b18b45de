//! Keywarden - a license key issuance, validation, and activation server.
//!
//! Keywarden manages licenses (a purchased entitlement identified by an
//! opaque 16-character key, valid over a time window and capped at N
//! concurrent device activations), the activations binding those licenses
//! to devices, and the audit trail of every decision it makes.
//!
//! The HTTP surface has two halves:
//!
//! - a single device-facing endpoint, `POST /validate`, which applies the
//!   activation rules and mints short-lived bearer tokens, and
//! - operator endpoints (create/revoke/renew/unbind plus paginated
//!   listings) behind a cookie-based admin session.
//!
//! # Features
//!
//! - `sqlite` - SQLite storage backend. Enabled by default.
//! - `postgres` - PostgreSQL storage backend.

pub mod config;
pub mod errors;
pub mod license_key;

#[path = "server/mod.rs"]
pub mod server;
