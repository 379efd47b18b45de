//! Audit log writer.
//!
//! Every terminal validation or administrative decision appends one row to
//! `license_logs` through [`record`]. Writes are best-effort: a failed
//! insert is reported to diagnostics but never converts a completed
//! business decision into an error response.

use chrono::Utc;
use tracing::error;
use uuid::Uuid;

use crate::server::database::{Database, LicenseLog};

/// What happened.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogAction {
    Validate,
    Activate,
    Revoke,
    Expire,
    Unbind,
    Create,
    Renew,
}

impl LogAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogAction::Validate => "validate",
            LogAction::Activate => "activate",
            LogAction::Revoke => "revoke",
            LogAction::Expire => "expire",
            LogAction::Unbind => "unbind",
            LogAction::Create => "create",
            LogAction::Renew => "renew",
        }
    }
}

impl std::fmt::Display for LogAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// How it went.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogResult {
    Success,
    Fail,
}

impl LogResult {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogResult::Success => "success",
            LogResult::Fail => "fail",
        }
    }
}

impl std::fmt::Display for LogResult {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Who did it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogOperator {
    Admin,
    Client,
    System,
}

impl LogOperator {
    pub fn as_str(&self) -> &'static str {
        match self {
            LogOperator::Admin => "admin",
            LogOperator::Client => "client",
            LogOperator::System => "system",
        }
    }
}

impl std::fmt::Display for LogOperator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Append an audit log entry.
///
/// `license_id` is `None` only for validation attempts against a key that
/// resolves to no license.
pub async fn record(
    db: &Database,
    license_id: Option<&str>,
    action: LogAction,
    result: LogResult,
    detail: impl Into<String>,
    operator: LogOperator,
    ip: &str,
) {
    let log = LicenseLog {
        id: Uuid::new_v4().to_string(),
        license_id: license_id.map(String::from),
        action: action.as_str().to_string(),
        result: result.as_str().to_string(),
        detail: Some(detail.into()),
        operator: operator.as_str().to_string(),
        ip: ip.to_string(),
        created_at: Utc::now().naive_utc(),
    };

    if let Err(e) = db.insert_log(&log).await {
        error!(
            action = %log.action,
            result = %log.result,
            "failed to write audit log entry: {e}"
        );
    }
}
