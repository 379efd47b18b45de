//! Persistence adapter for licenses, activations, audit logs, and products.
//!
//! All durable state lives here; request handlers are stateless. Every
//! method is a single round trip, and the one check-then-act sequence in
//! the system (activation slot reservation) is pushed into a conditional
//! INSERT so the cap holds without a long-held lock.

use chrono::{NaiveDateTime, Utc};
use serde::Serialize;
use sqlx::{query, query_as, FromRow};
use std::sync::Arc;
use tracing::error;
use uuid::Uuid;

#[cfg(feature = "sqlite")]
use sqlx::SqlitePool;

#[cfg(feature = "postgres")]
use sqlx::PgPool;

use crate::config::get_config;
use crate::errors::{ServiceError, ServiceResult};

/// License lifecycle states.
///
/// Transitions are monotonic: `active -> expired` (system-driven) and
/// `active -> revoked` / `expired -> revoked` (operator-driven). Nothing
/// returns a license to `active`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LicenseStatus {
    Active,
    Expired,
    Revoked,
}

impl LicenseStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            LicenseStatus::Active => "active",
            LicenseStatus::Expired => "expired",
            LicenseStatus::Revoked => "revoked",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(LicenseStatus::Active),
            "expired" => Some(LicenseStatus::Expired),
            "revoked" => Some(LicenseStatus::Revoked),
            _ => None,
        }
    }
}

impl std::fmt::Display for LicenseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// A license row.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct License {
    pub id: String,
    pub license_key: String,
    pub product_id: Option<String>,
    pub start_time: NaiveDateTime,
    pub end_time: NaiveDateTime,
    pub status: String,
    pub max_activations: i64,
    pub note: Option<String>,
    pub created_at: NaiveDateTime,
    pub updated_at: NaiveDateTime,
}

impl License {
    pub fn is_active(&self) -> bool {
        self.status == LicenseStatus::Active.as_str()
    }

    pub fn is_revoked(&self) -> bool {
        self.status == LicenseStatus::Revoked.as_str()
    }
}

/// A device activation row. Live while `unbound_at` is NULL.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Activation {
    pub id: String,
    pub license_id: String,
    pub device_id: String,
    pub device_info: Option<String>,
    pub activated_at: NaiveDateTime,
    pub unbound_at: Option<NaiveDateTime>,
}

impl Activation {
    pub fn new(license_id: &str, device_id: &str, device_info: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            license_id: license_id.to_string(),
            device_id: device_id.to_string(),
            device_info,
            activated_at: Utc::now().naive_utc(),
            unbound_at: None,
        }
    }

    pub fn is_live(&self) -> bool {
        self.unbound_at.is_none()
    }
}

/// An append-only audit log row. Never updated or deleted.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct LicenseLog {
    pub id: String,
    pub license_id: Option<String>,
    pub action: String,
    pub result: String,
    pub detail: Option<String>,
    pub operator: String,
    pub ip: String,
    pub created_at: NaiveDateTime,
}

/// A product row. Weak association target for licenses; absence of a
/// product never blocks license operations.
#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Product {
    pub id: String,
    pub name: String,
    pub description: Option<String>,
    pub created_at: NaiveDateTime,
}

impl Product {
    pub fn new(name: &str, description: Option<String>) -> Self {
        Self {
            id: Uuid::new_v4().to_string(),
            name: name.to_string(),
            description,
            created_at: Utc::now().naive_utc(),
        }
    }
}

/// Filters for the license listing.
#[derive(Debug, Default, Clone)]
pub struct LicenseFilter {
    pub status: Option<String>,
    pub product_id: Option<String>,
    /// Substring match over license_key and note.
    pub search: Option<String>,
}

/// Filters for the activation listing.
#[derive(Debug, Default, Clone)]
pub struct ActivationFilter {
    pub license_id: Option<String>,
    /// `Some(true)` = live only, `Some(false)` = unbound only.
    pub live: Option<bool>,
}

/// Filters for the audit log listing.
#[derive(Debug, Default, Clone)]
pub struct LogFilter {
    pub license_id: Option<String>,
    pub action: Option<String>,
    pub result: Option<String>,
    pub operator: Option<String>,
    pub start_date: Option<NaiveDateTime>,
    pub end_date: Option<NaiveDateTime>,
}

/// One bound value in a dynamically assembled WHERE clause.
#[derive(Debug, Clone)]
enum BindValue {
    Text(String),
    Time(NaiveDateTime),
}

/// Accumulates WHERE conditions with backend-appropriate placeholders
/// (`?` for SQLite, `$n` for Postgres).
#[derive(Debug)]
struct SqlFilter {
    numbered: bool,
    conds: Vec<String>,
    binds: Vec<BindValue>,
}

impl SqlFilter {
    fn new(numbered: bool) -> Self {
        Self {
            numbered,
            conds: Vec::new(),
            binds: Vec::new(),
        }
    }

    fn next_placeholder(&self) -> String {
        if self.numbered {
            format!("${}", self.binds.len() + 1)
        } else {
            "?".to_string()
        }
    }

    /// Add a condition with one placeholder, written as `{}` in the template.
    fn push(&mut self, template: &str, value: BindValue) {
        let ph = self.next_placeholder();
        self.binds.push(value);
        self.conds.push(template.replacen("{}", &ph, 1));
    }

    /// Add a condition with two placeholders.
    fn push2(&mut self, template: &str, first: BindValue, second: BindValue) {
        let ph1 = self.next_placeholder();
        self.binds.push(first);
        let ph2 = self.next_placeholder();
        self.binds.push(second);
        self.conds
            .push(template.replacen("{}", &ph1, 1).replacen("{}", &ph2, 1));
    }

    /// Add a condition with no bound value.
    fn push_raw(&mut self, cond: &str) {
        self.conds.push(cond.to_string());
    }

    fn where_clause(&self) -> String {
        if self.conds.is_empty() {
            String::new()
        } else {
            format!(" WHERE {}", self.conds.join(" AND "))
        }
    }
}

fn license_conditions(filter: &LicenseFilter, numbered: bool) -> SqlFilter {
    let mut f = SqlFilter::new(numbered);
    if let Some(status) = &filter.status {
        f.push("status = {}", BindValue::Text(status.clone()));
    }
    if let Some(product_id) = &filter.product_id {
        f.push("product_id = {}", BindValue::Text(product_id.clone()));
    }
    if let Some(search) = &filter.search {
        let pattern = format!("%{search}%");
        f.push2(
            "(license_key LIKE {} OR note LIKE {})",
            BindValue::Text(pattern.clone()),
            BindValue::Text(pattern),
        );
    }
    f
}

fn activation_conditions(filter: &ActivationFilter, numbered: bool) -> SqlFilter {
    let mut f = SqlFilter::new(numbered);
    if let Some(license_id) = &filter.license_id {
        f.push("license_id = {}", BindValue::Text(license_id.clone()));
    }
    match filter.live {
        Some(true) => f.push_raw("unbound_at IS NULL"),
        Some(false) => f.push_raw("unbound_at IS NOT NULL"),
        None => {}
    }
    f
}

fn log_conditions(filter: &LogFilter, numbered: bool) -> SqlFilter {
    let mut f = SqlFilter::new(numbered);
    if let Some(license_id) = &filter.license_id {
        f.push("license_id = {}", BindValue::Text(license_id.clone()));
    }
    if let Some(action) = &filter.action {
        f.push("action = {}", BindValue::Text(action.clone()));
    }
    if let Some(result) = &filter.result {
        f.push("result = {}", BindValue::Text(result.clone()));
    }
    if let Some(operator) = &filter.operator {
        f.push("operator = {}", BindValue::Text(operator.clone()));
    }
    if let Some(start) = filter.start_date {
        f.push("created_at >= {}", BindValue::Time(start));
    }
    if let Some(end) = filter.end_date {
        f.push("created_at <= {}", BindValue::Time(end));
    }
    f
}

fn storage(context: &str, e: sqlx::Error) -> ServiceError {
    error!("{context} failed: {e}");
    ServiceError::Storage(format!("{context}: {e}"))
}

/// Idempotent schema DDL, valid on both backends.
const SCHEMA: &[&str] = &[
    r#"
    CREATE TABLE IF NOT EXISTS licenses (
        id              TEXT PRIMARY KEY,
        license_key     TEXT NOT NULL UNIQUE,
        product_id      TEXT,
        start_time      TIMESTAMP NOT NULL,
        end_time        TIMESTAMP NOT NULL,
        status          TEXT NOT NULL,
        max_activations BIGINT NOT NULL,
        note            TEXT,
        created_at      TIMESTAMP NOT NULL,
        updated_at      TIMESTAMP NOT NULL
    )
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS activations (
        id           TEXT PRIMARY KEY,
        license_id   TEXT NOT NULL,
        device_id    TEXT NOT NULL,
        device_info  TEXT,
        activated_at TIMESTAMP NOT NULL,
        unbound_at   TIMESTAMP
    )
    "#,
    // At most one live activation per (license, device).
    r#"
    CREATE UNIQUE INDEX IF NOT EXISTS idx_activations_live
        ON activations (license_id, device_id) WHERE unbound_at IS NULL
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_activations_license
        ON activations (license_id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS license_logs (
        id         TEXT PRIMARY KEY,
        license_id TEXT,
        action     TEXT NOT NULL,
        result     TEXT NOT NULL,
        detail     TEXT,
        operator   TEXT NOT NULL,
        ip         TEXT NOT NULL,
        created_at TIMESTAMP NOT NULL
    )
    "#,
    r#"
    CREATE INDEX IF NOT EXISTS idx_license_logs_license
        ON license_logs (license_id)
    "#,
    r#"
    CREATE TABLE IF NOT EXISTS products (
        id          TEXT PRIMARY KEY,
        name        TEXT NOT NULL UNIQUE,
        description TEXT,
        created_at  TIMESTAMP NOT NULL
    )
    "#,
];

/// Unified database abstraction over SQLite and Postgres.
///
/// Available variants depend on enabled features:
/// - `sqlite` feature enables `Database::SQLite`
/// - `postgres` feature enables `Database::Postgres`
#[derive(Debug, Clone)]
pub enum Database {
    #[cfg(feature = "sqlite")]
    SQLite(SqlitePool),
    #[cfg(feature = "postgres")]
    Postgres(PgPool),
}

impl Database {
    /// Initialize the database connection based on configuration.
    pub async fn new() -> ServiceResult<Arc<Self>> {
        let config = get_config()?;
        let db_config = &config.database;

        match db_config.db_type.as_str() {
            #[cfg(feature = "sqlite")]
            "sqlite" => {
                let pool = SqlitePool::connect(&db_config.sqlite_url)
                    .await
                    .map_err(|e| storage("connect to SQLite", e))?;
                Ok(Arc::new(Database::SQLite(pool)))
            }
            #[cfg(not(feature = "sqlite"))]
            "sqlite" => Err(ServiceError::Config(
                "SQLite support not compiled in. Enable the 'sqlite' feature.".to_string(),
            )),
            #[cfg(feature = "postgres")]
            "postgres" => {
                let pool = PgPool::connect(&db_config.postgres_url)
                    .await
                    .map_err(|e| storage("connect to PostgreSQL", e))?;
                Ok(Arc::new(Database::Postgres(pool)))
            }
            #[cfg(not(feature = "postgres"))]
            "postgres" => Err(ServiceError::Config(
                "PostgreSQL support not compiled in. Enable the 'postgres' feature.".to_string(),
            )),
            other => Err(ServiceError::Config(format!(
                "unsupported database type: {other}"
            ))),
        }
    }

    /// Create tables and indexes if they do not exist yet.
    pub async fn init_schema(&self) -> ServiceResult<()> {
        for stmt in SCHEMA {
            match self {
                #[cfg(feature = "sqlite")]
                Database::SQLite(pool) => {
                    query(stmt)
                        .execute(pool)
                        .await
                        .map_err(|e| storage("init schema", e))?;
                }
                #[cfg(feature = "postgres")]
                Database::Postgres(pool) => {
                    query(stmt)
                        .execute(pool)
                        .await
                        .map_err(|e| storage("init schema", e))?;
                }
            }
        }
        Ok(())
    }

    /// Cheap connectivity probe for the health endpoint.
    pub async fn ping(&self) -> bool {
        let result = match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(pool) => query("SELECT 1").execute(pool).await.map(|_| ()),
            #[cfg(feature = "postgres")]
            Database::Postgres(pool) => query("SELECT 1").execute(pool).await.map(|_| ()),
        };
        result.is_ok()
    }

    /// Backend name for diagnostics.
    pub fn backend(&self) -> &'static str {
        match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(_) => "sqlite",
            #[cfg(feature = "postgres")]
            Database::Postgres(_) => "postgres",
        }
    }

    // ========================================================================
    // Licenses
    // ========================================================================

    /// Insert a new license row.
    pub async fn insert_license(&self, license: &License) -> ServiceResult<()> {
        match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(pool) => {
                query(
                    "INSERT INTO licenses (id, license_key, product_id, start_time, end_time, \
                     status, max_activations, note, created_at, updated_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&license.id)
                .bind(&license.license_key)
                .bind(&license.product_id)
                .bind(license.start_time)
                .bind(license.end_time)
                .bind(&license.status)
                .bind(license.max_activations)
                .bind(&license.note)
                .bind(license.created_at)
                .bind(license.updated_at)
                .execute(pool)
                .await
                .map_err(|e| storage("insert license", e))?;
            }
            #[cfg(feature = "postgres")]
            Database::Postgres(pool) => {
                query(
                    "INSERT INTO licenses (id, license_key, product_id, start_time, end_time, \
                     status, max_activations, note, created_at, updated_at) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10)",
                )
                .bind(&license.id)
                .bind(&license.license_key)
                .bind(&license.product_id)
                .bind(license.start_time)
                .bind(license.end_time)
                .bind(&license.status)
                .bind(license.max_activations)
                .bind(&license.note)
                .bind(license.created_at)
                .bind(license.updated_at)
                .execute(pool)
                .await
                .map_err(|e| storage("insert license", e))?;
            }
        }
        Ok(())
    }

    /// Fetch a license by its ID.
    pub async fn get_license(&self, license_id: &str) -> ServiceResult<Option<License>> {
        match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(pool) => {
                query_as::<_, License>("SELECT * FROM licenses WHERE id = ?")
                    .bind(license_id)
                    .fetch_optional(pool)
                    .await
                    .map_err(|e| storage("get license", e))
            }
            #[cfg(feature = "postgres")]
            Database::Postgres(pool) => {
                query_as::<_, License>("SELECT * FROM licenses WHERE id = $1")
                    .bind(license_id)
                    .fetch_optional(pool)
                    .await
                    .map_err(|e| storage("get license", e))
            }
        }
    }

    /// Fetch a license by its key.
    pub async fn get_license_by_key(&self, license_key: &str) -> ServiceResult<Option<License>> {
        match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(pool) => {
                query_as::<_, License>("SELECT * FROM licenses WHERE license_key = ?")
                    .bind(license_key)
                    .fetch_optional(pool)
                    .await
                    .map_err(|e| storage("get license by key", e))
            }
            #[cfg(feature = "postgres")]
            Database::Postgres(pool) => {
                query_as::<_, License>("SELECT * FROM licenses WHERE license_key = $1")
                    .bind(license_key)
                    .fetch_optional(pool)
                    .await
                    .map_err(|e| storage("get license by key", e))
            }
        }
    }

    /// Check whether a license key is already taken.
    pub async fn license_key_exists(&self, license_key: &str) -> ServiceResult<bool> {
        let count: (i64,) = match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(pool) => {
                query_as("SELECT COUNT(*) FROM licenses WHERE license_key = ?")
                    .bind(license_key)
                    .fetch_one(pool)
                    .await
                    .map_err(|e| storage("check license key", e))?
            }
            #[cfg(feature = "postgres")]
            Database::Postgres(pool) => {
                query_as("SELECT COUNT(*) FROM licenses WHERE license_key = $1")
                    .bind(license_key)
                    .fetch_one(pool)
                    .await
                    .map_err(|e| storage("check license key", e))?
            }
        };
        Ok(count.0 > 0)
    }

    /// Transition an active license to expired.
    ///
    /// Guarded on the current status so it cannot resurrect or overwrite a
    /// concurrent revoke. Returns whether a row actually transitioned.
    pub async fn mark_expired(&self, license_id: &str) -> ServiceResult<bool> {
        let now = Utc::now().naive_utc();
        let rows = match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(pool) => {
                query("UPDATE licenses SET status = 'expired', updated_at = ? WHERE id = ? AND status = 'active'")
                    .bind(now)
                    .bind(license_id)
                    .execute(pool)
                    .await
                    .map_err(|e| storage("mark license expired", e))?
                    .rows_affected()
            }
            #[cfg(feature = "postgres")]
            Database::Postgres(pool) => {
                query("UPDATE licenses SET status = 'expired', updated_at = $1 WHERE id = $2 AND status = 'active'")
                    .bind(now)
                    .bind(license_id)
                    .execute(pool)
                    .await
                    .map_err(|e| storage("mark license expired", e))?
                    .rows_affected()
            }
        };
        Ok(rows > 0)
    }

    /// Transition a license to revoked. Revoking is terminal; the guard
    /// makes a repeated revoke a no-op at the storage level.
    pub async fn mark_revoked(&self, license_id: &str) -> ServiceResult<bool> {
        let now = Utc::now().naive_utc();
        let rows = match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(pool) => {
                query("UPDATE licenses SET status = 'revoked', updated_at = ? WHERE id = ? AND status != 'revoked'")
                    .bind(now)
                    .bind(license_id)
                    .execute(pool)
                    .await
                    .map_err(|e| storage("mark license revoked", e))?
                    .rows_affected()
            }
            #[cfg(feature = "postgres")]
            Database::Postgres(pool) => {
                query("UPDATE licenses SET status = 'revoked', updated_at = $1 WHERE id = $2 AND status != 'revoked'")
                    .bind(now)
                    .bind(license_id)
                    .execute(pool)
                    .await
                    .map_err(|e| storage("mark license revoked", e))?
                    .rows_affected()
            }
        };
        Ok(rows > 0)
    }

    /// Move the validity window end of an active license. Never touches
    /// status, so it cannot reactivate an expired or revoked license.
    pub async fn update_end_time(
        &self,
        license_id: &str,
        new_end_time: NaiveDateTime,
    ) -> ServiceResult<bool> {
        let now = Utc::now().naive_utc();
        let rows = match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(pool) => {
                query("UPDATE licenses SET end_time = ?, updated_at = ? WHERE id = ? AND status = 'active'")
                    .bind(new_end_time)
                    .bind(now)
                    .bind(license_id)
                    .execute(pool)
                    .await
                    .map_err(|e| storage("update license end time", e))?
                    .rows_affected()
            }
            #[cfg(feature = "postgres")]
            Database::Postgres(pool) => {
                query("UPDATE licenses SET end_time = $1, updated_at = $2 WHERE id = $3 AND status = 'active'")
                    .bind(new_end_time)
                    .bind(now)
                    .bind(license_id)
                    .execute(pool)
                    .await
                    .map_err(|e| storage("update license end time", e))?
                    .rows_affected()
            }
        };
        Ok(rows > 0)
    }

    /// List licenses matching the filter, newest first.
    /// Returns the page of rows and the total match count.
    pub async fn list_licenses(
        &self,
        filter: &LicenseFilter,
        limit: i64,
        offset: i64,
    ) -> ServiceResult<(Vec<License>, i64)> {
        match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(pool) => {
                let f = license_conditions(filter, false);
                let sql = format!(
                    "SELECT * FROM licenses{} ORDER BY created_at DESC LIMIT {limit} OFFSET {offset}",
                    f.where_clause()
                );
                let mut q = query_as::<_, License>(&sql);
                for b in &f.binds {
                    q = match b {
                        BindValue::Text(s) => q.bind(s.clone()),
                        BindValue::Time(t) => q.bind(*t),
                    };
                }
                let rows = q
                    .fetch_all(pool)
                    .await
                    .map_err(|e| storage("list licenses", e))?;

                let count_sql = format!("SELECT COUNT(*) FROM licenses{}", f.where_clause());
                let mut cq = query_as::<_, (i64,)>(&count_sql);
                for b in &f.binds {
                    cq = match b {
                        BindValue::Text(s) => cq.bind(s.clone()),
                        BindValue::Time(t) => cq.bind(*t),
                    };
                }
                let total = cq
                    .fetch_one(pool)
                    .await
                    .map_err(|e| storage("count licenses", e))?;

                Ok((rows, total.0))
            }
            #[cfg(feature = "postgres")]
            Database::Postgres(pool) => {
                let f = license_conditions(filter, true);
                let sql = format!(
                    "SELECT * FROM licenses{} ORDER BY created_at DESC LIMIT {limit} OFFSET {offset}",
                    f.where_clause()
                );
                let mut q = query_as::<_, License>(&sql);
                for b in &f.binds {
                    q = match b {
                        BindValue::Text(s) => q.bind(s.clone()),
                        BindValue::Time(t) => q.bind(*t),
                    };
                }
                let rows = q
                    .fetch_all(pool)
                    .await
                    .map_err(|e| storage("list licenses", e))?;

                let count_sql = format!("SELECT COUNT(*) FROM licenses{}", f.where_clause());
                let mut cq = query_as::<_, (i64,)>(&count_sql);
                for b in &f.binds {
                    cq = match b {
                        BindValue::Text(s) => cq.bind(s.clone()),
                        BindValue::Time(t) => cq.bind(*t),
                    };
                }
                let total = cq
                    .fetch_one(pool)
                    .await
                    .map_err(|e| storage("count licenses", e))?;

                Ok((rows, total.0))
            }
        }
    }

    // ========================================================================
    // Activations
    // ========================================================================

    /// Fetch the live activation for a (license, device) pair, if any.
    /// The partial unique index guarantees at most one exists.
    pub async fn find_live_activation(
        &self,
        license_id: &str,
        device_id: &str,
    ) -> ServiceResult<Option<Activation>> {
        match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(pool) => query_as::<_, Activation>(
                "SELECT * FROM activations \
                 WHERE license_id = ? AND device_id = ? AND unbound_at IS NULL",
            )
            .bind(license_id)
            .bind(device_id)
            .fetch_optional(pool)
            .await
            .map_err(|e| storage("find live activation", e)),
            #[cfg(feature = "postgres")]
            Database::Postgres(pool) => query_as::<_, Activation>(
                "SELECT * FROM activations \
                 WHERE license_id = $1 AND device_id = $2 AND unbound_at IS NULL",
            )
            .bind(license_id)
            .bind(device_id)
            .fetch_optional(pool)
            .await
            .map_err(|e| storage("find live activation", e)),
        }
    }

    /// Count live activations for a license.
    pub async fn count_live_activations(&self, license_id: &str) -> ServiceResult<i64> {
        let count: (i64,) = match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(pool) => query_as(
                "SELECT COUNT(*) FROM activations WHERE license_id = ? AND unbound_at IS NULL",
            )
            .bind(license_id)
            .fetch_one(pool)
            .await
            .map_err(|e| storage("count live activations", e))?,
            #[cfg(feature = "postgres")]
            Database::Postgres(pool) => query_as(
                "SELECT COUNT(*) FROM activations WHERE license_id = $1 AND unbound_at IS NULL",
            )
            .bind(license_id)
            .fetch_one(pool)
            .await
            .map_err(|e| storage("count live activations", e))?,
        };
        Ok(count.0)
    }

    /// Atomically insert an activation if the license still has a free slot.
    ///
    /// The live-count check happens inside the INSERT statement, so two
    /// concurrent calls cannot both slip under `max_activations`. Returns
    /// `false` when no slot was free, or when the same device raced a
    /// parallel reservation (unique index violation).
    pub async fn try_reserve_activation_slot(
        &self,
        activation: &Activation,
        max_activations: i64,
    ) -> ServiceResult<bool> {
        let result: Result<u64, sqlx::Error> = match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(pool) => {
                query(
                    "INSERT INTO activations (id, license_id, device_id, device_info, activated_at) \
                     SELECT ?, ?, ?, ?, ? \
                     WHERE (SELECT COUNT(*) FROM activations \
                            WHERE license_id = ? AND unbound_at IS NULL) < ?",
                )
                .bind(&activation.id)
                .bind(&activation.license_id)
                .bind(&activation.device_id)
                .bind(&activation.device_info)
                .bind(activation.activated_at)
                .bind(&activation.license_id)
                .bind(max_activations)
                .execute(pool)
                .await
                .map(|r| r.rows_affected())
            }
            #[cfg(feature = "postgres")]
            Database::Postgres(pool) => {
                query(
                    "INSERT INTO activations (id, license_id, device_id, device_info, activated_at) \
                     SELECT $1, $2, $3, $4, $5 \
                     WHERE (SELECT COUNT(*) FROM activations \
                            WHERE license_id = $6 AND unbound_at IS NULL) < $7",
                )
                .bind(&activation.id)
                .bind(&activation.license_id)
                .bind(&activation.device_id)
                .bind(&activation.device_info)
                .bind(activation.activated_at)
                .bind(&activation.license_id)
                .bind(max_activations)
                .execute(pool)
                .await
                .map(|r| r.rows_affected())
            }
        };

        match result {
            Ok(rows) => Ok(rows > 0),
            Err(sqlx::Error::Database(db_err))
                if matches!(db_err.kind(), sqlx::error::ErrorKind::UniqueViolation) =>
            {
                Ok(false)
            }
            Err(e) => Err(storage("reserve activation slot", e)),
        }
    }

    /// Unbind the live activation for a (license, device) pair.
    /// Returns whether a row was unbound.
    pub async fn unbind_device(&self, license_id: &str, device_id: &str) -> ServiceResult<bool> {
        let now = Utc::now().naive_utc();
        let rows = match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(pool) => query(
                "UPDATE activations SET unbound_at = ? \
                 WHERE license_id = ? AND device_id = ? AND unbound_at IS NULL",
            )
            .bind(now)
            .bind(license_id)
            .bind(device_id)
            .execute(pool)
            .await
            .map_err(|e| storage("unbind device", e))?
            .rows_affected(),
            #[cfg(feature = "postgres")]
            Database::Postgres(pool) => query(
                "UPDATE activations SET unbound_at = $1 \
                 WHERE license_id = $2 AND device_id = $3 AND unbound_at IS NULL",
            )
            .bind(now)
            .bind(license_id)
            .bind(device_id)
            .execute(pool)
            .await
            .map_err(|e| storage("unbind device", e))?
            .rows_affected(),
        };
        Ok(rows > 0)
    }

    /// Unbind every live activation of a license in one statement
    /// (the revoke cascade). Returns the number of rows unbound.
    pub async fn unbind_all_for_license(&self, license_id: &str) -> ServiceResult<u64> {
        let now = Utc::now().naive_utc();
        let rows = match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(pool) => query(
                "UPDATE activations SET unbound_at = ? \
                 WHERE license_id = ? AND unbound_at IS NULL",
            )
            .bind(now)
            .bind(license_id)
            .execute(pool)
            .await
            .map_err(|e| storage("unbind all activations", e))?
            .rows_affected(),
            #[cfg(feature = "postgres")]
            Database::Postgres(pool) => query(
                "UPDATE activations SET unbound_at = $1 \
                 WHERE license_id = $2 AND unbound_at IS NULL",
            )
            .bind(now)
            .bind(license_id)
            .execute(pool)
            .await
            .map_err(|e| storage("unbind all activations", e))?
            .rows_affected(),
        };
        Ok(rows)
    }

    /// List activations matching the filter, newest first.
    pub async fn list_activations(
        &self,
        filter: &ActivationFilter,
        limit: i64,
        offset: i64,
    ) -> ServiceResult<(Vec<Activation>, i64)> {
        match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(pool) => {
                let f = activation_conditions(filter, false);
                let sql = format!(
                    "SELECT * FROM activations{} ORDER BY activated_at DESC LIMIT {limit} OFFSET {offset}",
                    f.where_clause()
                );
                let mut q = query_as::<_, Activation>(&sql);
                for b in &f.binds {
                    q = match b {
                        BindValue::Text(s) => q.bind(s.clone()),
                        BindValue::Time(t) => q.bind(*t),
                    };
                }
                let rows = q
                    .fetch_all(pool)
                    .await
                    .map_err(|e| storage("list activations", e))?;

                let count_sql = format!("SELECT COUNT(*) FROM activations{}", f.where_clause());
                let mut cq = query_as::<_, (i64,)>(&count_sql);
                for b in &f.binds {
                    cq = match b {
                        BindValue::Text(s) => cq.bind(s.clone()),
                        BindValue::Time(t) => cq.bind(*t),
                    };
                }
                let total = cq
                    .fetch_one(pool)
                    .await
                    .map_err(|e| storage("count activations", e))?;

                Ok((rows, total.0))
            }
            #[cfg(feature = "postgres")]
            Database::Postgres(pool) => {
                let f = activation_conditions(filter, true);
                let sql = format!(
                    "SELECT * FROM activations{} ORDER BY activated_at DESC LIMIT {limit} OFFSET {offset}",
                    f.where_clause()
                );
                let mut q = query_as::<_, Activation>(&sql);
                for b in &f.binds {
                    q = match b {
                        BindValue::Text(s) => q.bind(s.clone()),
                        BindValue::Time(t) => q.bind(*t),
                    };
                }
                let rows = q
                    .fetch_all(pool)
                    .await
                    .map_err(|e| storage("list activations", e))?;

                let count_sql = format!("SELECT COUNT(*) FROM activations{}", f.where_clause());
                let mut cq = query_as::<_, (i64,)>(&count_sql);
                for b in &f.binds {
                    cq = match b {
                        BindValue::Text(s) => cq.bind(s.clone()),
                        BindValue::Time(t) => cq.bind(*t),
                    };
                }
                let total = cq
                    .fetch_one(pool)
                    .await
                    .map_err(|e| storage("count activations", e))?;

                Ok((rows, total.0))
            }
        }
    }

    // ========================================================================
    // Audit logs
    // ========================================================================

    /// Append an audit log row. Rows are never updated or deleted.
    pub async fn insert_log(&self, log: &LicenseLog) -> ServiceResult<()> {
        match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(pool) => {
                query(
                    "INSERT INTO license_logs (id, license_id, action, result, detail, operator, ip, created_at) \
                     VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
                )
                .bind(&log.id)
                .bind(&log.license_id)
                .bind(&log.action)
                .bind(&log.result)
                .bind(&log.detail)
                .bind(&log.operator)
                .bind(&log.ip)
                .bind(log.created_at)
                .execute(pool)
                .await
                .map_err(|e| storage("insert audit log", e))?;
            }
            #[cfg(feature = "postgres")]
            Database::Postgres(pool) => {
                query(
                    "INSERT INTO license_logs (id, license_id, action, result, detail, operator, ip, created_at) \
                     VALUES ($1, $2, $3, $4, $5, $6, $7, $8)",
                )
                .bind(&log.id)
                .bind(&log.license_id)
                .bind(&log.action)
                .bind(&log.result)
                .bind(&log.detail)
                .bind(&log.operator)
                .bind(&log.ip)
                .bind(log.created_at)
                .execute(pool)
                .await
                .map_err(|e| storage("insert audit log", e))?;
            }
        }
        Ok(())
    }

    /// List audit log rows matching the filter, newest first.
    pub async fn list_logs(
        &self,
        filter: &LogFilter,
        limit: i64,
        offset: i64,
    ) -> ServiceResult<(Vec<LicenseLog>, i64)> {
        match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(pool) => {
                let f = log_conditions(filter, false);
                let sql = format!(
                    "SELECT * FROM license_logs{} ORDER BY created_at DESC LIMIT {limit} OFFSET {offset}",
                    f.where_clause()
                );
                let mut q = query_as::<_, LicenseLog>(&sql);
                for b in &f.binds {
                    q = match b {
                        BindValue::Text(s) => q.bind(s.clone()),
                        BindValue::Time(t) => q.bind(*t),
                    };
                }
                let rows = q
                    .fetch_all(pool)
                    .await
                    .map_err(|e| storage("list audit logs", e))?;

                let count_sql = format!("SELECT COUNT(*) FROM license_logs{}", f.where_clause());
                let mut cq = query_as::<_, (i64,)>(&count_sql);
                for b in &f.binds {
                    cq = match b {
                        BindValue::Text(s) => cq.bind(s.clone()),
                        BindValue::Time(t) => cq.bind(*t),
                    };
                }
                let total = cq
                    .fetch_one(pool)
                    .await
                    .map_err(|e| storage("count audit logs", e))?;

                Ok((rows, total.0))
            }
            #[cfg(feature = "postgres")]
            Database::Postgres(pool) => {
                let f = log_conditions(filter, true);
                let sql = format!(
                    "SELECT * FROM license_logs{} ORDER BY created_at DESC LIMIT {limit} OFFSET {offset}",
                    f.where_clause()
                );
                let mut q = query_as::<_, LicenseLog>(&sql);
                for b in &f.binds {
                    q = match b {
                        BindValue::Text(s) => q.bind(s.clone()),
                        BindValue::Time(t) => q.bind(*t),
                    };
                }
                let rows = q
                    .fetch_all(pool)
                    .await
                    .map_err(|e| storage("list audit logs", e))?;

                let count_sql = format!("SELECT COUNT(*) FROM license_logs{}", f.where_clause());
                let mut cq = query_as::<_, (i64,)>(&count_sql);
                for b in &f.binds {
                    cq = match b {
                        BindValue::Text(s) => cq.bind(s.clone()),
                        BindValue::Time(t) => cq.bind(*t),
                    };
                }
                let total = cq
                    .fetch_one(pool)
                    .await
                    .map_err(|e| storage("count audit logs", e))?;

                Ok((rows, total.0))
            }
        }
    }

    // ========================================================================
    // Products
    // ========================================================================

    /// Look up a product by its display name.
    pub async fn find_product_by_name(&self, name: &str) -> ServiceResult<Option<Product>> {
        match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(pool) => query_as::<_, Product>("SELECT * FROM products WHERE name = ?")
                .bind(name)
                .fetch_optional(pool)
                .await
                .map_err(|e| storage("find product", e)),
            #[cfg(feature = "postgres")]
            Database::Postgres(pool) => {
                query_as::<_, Product>("SELECT * FROM products WHERE name = $1")
                    .bind(name)
                    .fetch_optional(pool)
                    .await
                    .map_err(|e| storage("find product", e))
            }
        }
    }

    /// Insert a product row.
    pub async fn insert_product(&self, product: &Product) -> ServiceResult<()> {
        match self {
            #[cfg(feature = "sqlite")]
            Database::SQLite(pool) => {
                query(
                    "INSERT INTO products (id, name, description, created_at) VALUES (?, ?, ?, ?)",
                )
                .bind(&product.id)
                .bind(&product.name)
                .bind(&product.description)
                .bind(product.created_at)
                .execute(pool)
                .await
                .map_err(|e| storage("insert product", e))?;
            }
            #[cfg(feature = "postgres")]
            Database::Postgres(pool) => {
                query(
                    "INSERT INTO products (id, name, description, created_at) VALUES ($1, $2, $3, $4)",
                )
                .bind(&product.id)
                .bind(&product.name)
                .bind(&product.description)
                .bind(product.created_at)
                .execute(pool)
                .await
                .map_err(|e| storage("insert product", e))?;
            }
        }
        Ok(())
    }
}
