//! The validation engine.
//!
//! Given a license key and a device identity, decides activation
//! eligibility, mutates activation/license state, and mints a device
//! token. Rules are applied strictly in order; every early exit is a
//! terminal result and is audited, except the preliminary format check,
//! which fails before any license context exists.

use chrono::{NaiveDateTime, Utc};
use serde::Serialize;
use tracing::{info, warn};

use crate::errors::{ServiceError, ServiceResult};
use crate::license_key::is_valid_key_format;
use crate::server::audit::{self, LogAction, LogOperator, LogResult};
use crate::server::auth::TokenIssuer;
use crate::server::database::{Activation, Database, License};

/// Resolved inputs for one validation attempt.
#[derive(Debug, Clone)]
pub struct ValidateParams {
    pub license_key: String,
    pub device_id: String,
    pub device_info: Option<String>,
    pub ip: String,
}

/// The license fields a device is allowed to see. Never exposes
/// activation usage internals beyond the configured cap.
#[derive(Debug, Serialize)]
pub struct LicenseSummary {
    pub id: String,
    pub license_key: String,
    pub end_time: NaiveDateTime,
    pub max_activations: i64,
}

impl From<&License> for LicenseSummary {
    fn from(license: &License) -> Self {
        Self {
            id: license.id.clone(),
            license_key: license.license_key.clone(),
            end_time: license.end_time,
            max_activations: license.max_activations,
        }
    }
}

/// Successful validation result.
#[derive(Debug, Serialize)]
pub struct ValidateOutcome {
    pub token: String,
    pub license: LicenseSummary,
    pub device_id: String,
}

/// Run one validation attempt to its terminal result.
pub async fn validate_license(
    db: &Database,
    issuer: &TokenIssuer,
    params: ValidateParams,
) -> ServiceResult<ValidateOutcome> {
    let ValidateParams {
        license_key,
        device_id,
        device_info,
        ip,
    } = params;

    // Format check fails before any lookup; nothing to audit yet.
    if !is_valid_key_format(&license_key) {
        return Err(ServiceError::InvalidInput(
            "invalid license key format".to_string(),
        ));
    }

    let now = Utc::now().naive_utc();

    // 1. Resolve the key.
    let license = match db.get_license_by_key(&license_key).await? {
        Some(license) => license,
        None => {
            audit::record(
                db,
                None,
                LogAction::Validate,
                LogResult::Fail,
                format!("license key not found: {license_key}"),
                LogOperator::Client,
                &ip,
            )
            .await;
            return Err(ServiceError::NotFound("license key not found".to_string()));
        }
    };

    // 2. Only active licenses may proceed.
    if !license.is_active() {
        audit::record(
            db,
            Some(&license.id),
            LogAction::Validate,
            LogResult::Fail,
            format!("license status not active: {}", license.status),
            LogOperator::Client,
            &ip,
        )
        .await;
        return Err(ServiceError::Forbidden(
            "license has been revoked or expired".to_string(),
        ));
    }

    // 3. Lazy expiry: flip the status on first observation past end_time.
    //    The guard keeps a concurrent revoke authoritative, and makes the
    //    expire audit row appear only for the transition that actually
    //    happened; later attempts fail in step 2 and are logged there.
    if license.end_time < now {
        let transitioned = db.mark_expired(&license.id).await?;
        if transitioned {
            audit::record(
                db,
                Some(&license.id),
                LogAction::Expire,
                LogResult::Success,
                "license passed its end time",
                LogOperator::System,
                &ip,
            )
            .await;
            info!(license_id = %license.id, "license transitioned to expired");
        }
        return Err(ServiceError::Forbidden("license has expired".to_string()));
    }

    // 4/5. Already-bound devices skip the cap entirely; everyone else
    //      must win a slot reservation.
    if db
        .find_live_activation(&license.id, &device_id)
        .await?
        .is_none()
    {
        let count = db.count_live_activations(&license.id).await?;
        if count >= license.max_activations {
            audit::record(
                db,
                Some(&license.id),
                LogAction::Validate,
                LogResult::Fail,
                format!(
                    "activation limit reached: {count}/{}",
                    license.max_activations
                ),
                LogOperator::Client,
                &ip,
            )
            .await;
            return Err(ServiceError::Forbidden(
                "activation limit reached".to_string(),
            ));
        }

        let activation = Activation::new(&license.id, &device_id, device_info);
        let reserved = db
            .try_reserve_activation_slot(&activation, license.max_activations)
            .await?;

        if reserved {
            audit::record(
                db,
                Some(&license.id),
                LogAction::Activate,
                LogResult::Success,
                format!("device activated: {device_id}"),
                LogOperator::Client,
                &ip,
            )
            .await;
        } else if db
            .find_live_activation(&license.id, &device_id)
            .await?
            .is_some()
        {
            // Lost the reservation to a concurrent validate of the same
            // device; that call owns the activation, this one just rides it.
            warn!(
                license_id = %license.id,
                device_id = %device_id,
                "activation raced a concurrent validate; reusing the live binding"
            );
        } else {
            // A concurrent validate of another device took the last slot.
            audit::record(
                db,
                Some(&license.id),
                LogAction::Validate,
                LogResult::Fail,
                format!(
                    "activation limit reached: {}/{}",
                    license.max_activations, license.max_activations
                ),
                LogOperator::Client,
                &ip,
            )
            .await;
            return Err(ServiceError::Forbidden(
                "activation limit reached".to_string(),
            ));
        }
    }

    // 6. Mint the device token and record the success.
    let token = issuer.issue_device_token(&license.id, &device_id)?;

    audit::record(
        db,
        Some(&license.id),
        LogAction::Validate,
        LogResult::Success,
        "license validated",
        LogOperator::Client,
        &ip,
    )
    .await;

    Ok(ValidateOutcome {
        license: LicenseSummary::from(&license),
        token,
        device_id,
    })
}
