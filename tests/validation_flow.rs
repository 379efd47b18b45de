//! Engine-level scenarios for the validation state machine, run against
//! an in-memory SQLite store.

use std::sync::Arc;

use chrono::{Duration, Utc};
use sqlx::sqlite::SqlitePoolOptions;
use uuid::Uuid;

use keywarden::config::AuthConfig;
use keywarden::errors::ServiceError;
use keywarden::server::{
    validate_license, Activation, Database, License, LicenseStatus, LogFilter, TokenIssuer,
    ValidateParams,
};

/// Helper: create an in-memory SQLite store with the full schema.
async fn setup_db() -> Arc<Database> {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite connect");

    let db = Arc::new(Database::SQLite(pool));
    db.init_schema().await.expect("schema init");
    db
}

fn test_issuer() -> TokenIssuer {
    TokenIssuer::from_config(&AuthConfig {
        jwt_secret: "flow-test-secret".to_string(),
        ..Default::default()
    })
    .expect("test issuer")
}

/// Helper: insert a license directly. `end_in_hours` may be negative to
/// build an already-past validity window.
async fn insert_license(db: &Database, key: &str, max_activations: i64, end_in_hours: i64) -> License {
    let now = Utc::now().naive_utc();
    let license = License {
        id: Uuid::new_v4().to_string(),
        license_key: key.to_string(),
        product_id: None,
        start_time: now - Duration::hours(48),
        end_time: now + Duration::hours(end_in_hours),
        status: LicenseStatus::Active.as_str().to_string(),
        max_activations,
        note: None,
        created_at: now,
        updated_at: now,
    };
    db.insert_license(&license).await.expect("insert license");
    license
}

fn params(key: &str, device: &str) -> ValidateParams {
    ValidateParams {
        license_key: key.to_string(),
        device_id: device.to_string(),
        device_info: Some("test device".to_string()),
        ip: "203.0.113.9".to_string(),
    }
}

async fn log_count(db: &Database, action: &str, result: Option<&str>) -> i64 {
    let filter = LogFilter {
        action: Some(action.to_string()),
        result: result.map(String::from),
        ..Default::default()
    };
    let (_, total) = db.list_logs(&filter, 100, 0).await.expect("list logs");
    total
}

#[tokio::test]
async fn validate_binds_device_and_issues_verifiable_token() {
    let db = setup_db().await;
    let issuer = test_issuer();
    let license = insert_license(&db, "AAAA1111BBBB2222", 3, 24).await;

    let outcome = validate_license(&db, &issuer, params("AAAA1111BBBB2222", "device-a"))
        .await
        .expect("validate should succeed");

    assert_eq!(outcome.device_id, "device-a");
    assert_eq!(outcome.license.id, license.id);
    assert_eq!(outcome.license.license_key, "AAAA1111BBBB2222");
    assert_eq!(outcome.license.max_activations, 3);

    // The token round-trips through the issuer and carries the right pair.
    let claims = issuer.verify(&outcome.token).expect("token verifies");
    assert_eq!(claims.sub, license.id);
    assert_eq!(claims.dev, "device-a");
    assert!(!claims.is_admin());

    assert_eq!(db.count_live_activations(&license.id).await.unwrap(), 1);
    assert_eq!(log_count(&db, "activate", Some("success")).await, 1);
    assert_eq!(log_count(&db, "validate", Some("success")).await, 1);
}

#[tokio::test]
async fn repeat_validation_reuses_the_live_binding() {
    let db = setup_db().await;
    let issuer = test_issuer();
    let license = insert_license(&db, "CCCC3333DDDD4444", 5, 24).await;

    let first = validate_license(&db, &issuer, params("CCCC3333DDDD4444", "device-a"))
        .await
        .unwrap();
    let second = validate_license(&db, &issuer, params("CCCC3333DDDD4444", "device-a"))
        .await
        .unwrap();

    // No second activation row; both calls still got usable tokens.
    assert_eq!(db.count_live_activations(&license.id).await.unwrap(), 1);
    assert!(issuer.verify(&first.token).is_some());
    assert!(issuer.verify(&second.token).is_some());
    assert_eq!(log_count(&db, "activate", Some("success")).await, 1);
    assert_eq!(log_count(&db, "validate", Some("success")).await, 2);
}

#[tokio::test]
async fn activation_cap_blocks_new_devices_until_unbind() {
    let db = setup_db().await;
    let issuer = test_issuer();
    let license = insert_license(&db, "EEEE5555FFFF6666", 1, 24).await;

    // Device A takes the only slot.
    validate_license(&db, &issuer, params("EEEE5555FFFF6666", "device-a"))
        .await
        .expect("device A activates");

    // Device B is over the cap.
    let err = validate_license(&db, &issuer, params("EEEE5555FFFF6666", "device-b"))
        .await
        .expect_err("device B must be rejected");
    assert!(matches!(err, ServiceError::Forbidden(_)));
    assert_eq!(db.count_live_activations(&license.id).await.unwrap(), 1);

    // Unbinding A frees the slot for B.
    assert!(db.unbind_device(&license.id, "device-a").await.unwrap());
    validate_license(&db, &issuer, params("EEEE5555FFFF6666", "device-b"))
        .await
        .expect("device B activates after unbind");

    assert_eq!(db.count_live_activations(&license.id).await.unwrap(), 1);
    assert!(db
        .find_live_activation(&license.id, "device-b")
        .await
        .unwrap()
        .is_some());
}

#[tokio::test]
async fn expired_license_transitions_once_and_stays_closed() {
    let db = setup_db().await;
    let issuer = test_issuer();
    let license = insert_license(&db, "GGGG7777HHHH8888", 2, -1).await;

    // First attempt observes the passed end time and flips the status.
    let err = validate_license(&db, &issuer, params("GGGG7777HHHH8888", "device-a"))
        .await
        .expect_err("expired license must fail");
    assert!(matches!(err, ServiceError::Forbidden(_)));

    let stored = db.get_license(&license.id).await.unwrap().unwrap();
    assert_eq!(stored.status, "expired");
    assert_eq!(log_count(&db, "expire", Some("success")).await, 1);

    // Later attempts fail on the status check and keep logging failures;
    // the expire transition itself is not repeated.
    for _ in 0..2 {
        let err = validate_license(&db, &issuer, params("GGGG7777HHHH8888", "device-a"))
            .await
            .expect_err("expired license stays closed");
        assert!(matches!(err, ServiceError::Forbidden(_)));
    }
    assert_eq!(log_count(&db, "expire", Some("success")).await, 1);
    assert_eq!(log_count(&db, "validate", Some("fail")).await, 2);

    // No activation was ever created.
    assert_eq!(db.count_live_activations(&license.id).await.unwrap(), 0);

    // And there is no path back: the end-time update is guarded on
    // active status.
    let renewed = db
        .update_end_time(&license.id, Utc::now().naive_utc() + Duration::days(30))
        .await
        .unwrap();
    assert!(!renewed);
}

#[tokio::test]
async fn revoke_cascade_unbinds_every_device() {
    let db = setup_db().await;
    let issuer = test_issuer();
    let license = insert_license(&db, "JJJJ9999KKKK0000", 3, 24).await;

    for device in ["device-a", "device-b", "device-c"] {
        validate_license(&db, &issuer, params("JJJJ9999KKKK0000", device))
            .await
            .expect("activation");
    }
    assert_eq!(db.count_live_activations(&license.id).await.unwrap(), 3);

    // Revoke flips the status once; the second attempt is a no-op.
    assert!(db.mark_revoked(&license.id).await.unwrap());
    assert!(!db.mark_revoked(&license.id).await.unwrap());

    assert_eq!(db.unbind_all_for_license(&license.id).await.unwrap(), 3);
    assert_eq!(db.count_live_activations(&license.id).await.unwrap(), 0);

    let stored = db.get_license(&license.id).await.unwrap().unwrap();
    assert_eq!(stored.status, "revoked");

    // Devices that held the license are shut out.
    let err = validate_license(&db, &issuer, params("JJJJ9999KKKK0000", "device-a"))
        .await
        .expect_err("revoked license must fail");
    assert!(matches!(err, ServiceError::Forbidden(_)));
}

#[tokio::test]
async fn unknown_key_is_logged_without_a_license_id() {
    let db = setup_db().await;
    let issuer = test_issuer();

    // 15 Z's + 1: valid charset and length, no such license.
    let err = validate_license(&db, &issuer, params("ZZZZZZZZZZZZZZZ1", "device-a"))
        .await
        .expect_err("unknown key");
    assert!(matches!(err, ServiceError::NotFound(_)));

    let (logs, total) = db
        .list_logs(&LogFilter::default(), 10, 0)
        .await
        .expect("list logs");
    assert_eq!(total, 1);
    assert_eq!(logs[0].action, "validate");
    assert_eq!(logs[0].result, "fail");
    assert!(logs[0].license_id.is_none());
}

#[tokio::test]
async fn malformed_key_fails_before_any_storage_write() {
    let db = setup_db().await;
    let issuer = test_issuer();

    let err = validate_license(&db, &issuer, params("short", "device-a"))
        .await
        .expect_err("bad format");
    assert!(matches!(err, ServiceError::InvalidInput(_)));

    // The format check happens before license lookup; nothing is logged.
    let (_, total) = db.list_logs(&LogFilter::default(), 10, 0).await.unwrap();
    assert_eq!(total, 0);
}

#[tokio::test]
async fn slot_reservation_is_atomic_at_the_cap() {
    let db = setup_db().await;
    let license = insert_license(&db, "LLLL1111MMMM2222", 2, 24).await;

    let a = Activation::new(&license.id, "device-a", None);
    let b = Activation::new(&license.id, "device-b", None);
    let c = Activation::new(&license.id, "device-c", None);

    assert!(db.try_reserve_activation_slot(&a, 2).await.unwrap());
    assert!(db.try_reserve_activation_slot(&b, 2).await.unwrap());
    // Third device finds no free slot.
    assert!(!db.try_reserve_activation_slot(&c, 2).await.unwrap());

    // Same-device double reservation trips the live-binding index,
    // not the cap, and reports no slot taken.
    let a_again = Activation::new(&license.id, "device-a", None);
    assert!(!db.try_reserve_activation_slot(&a_again, 99).await.unwrap());

    assert_eq!(db.count_live_activations(&license.id).await.unwrap(), 2);
}

#[tokio::test]
async fn unbind_only_touches_the_live_binding() {
    let db = setup_db().await;
    let issuer = test_issuer();
    let license = insert_license(&db, "NNNN3333PPPP4444", 2, 24).await;

    validate_license(&db, &issuer, params("NNNN3333PPPP4444", "device-a"))
        .await
        .unwrap();

    assert!(db.unbind_device(&license.id, "device-a").await.unwrap());
    // Second unbind finds nothing live.
    assert!(!db.unbind_device(&license.id, "device-a").await.unwrap());

    // The unbound row is preserved for history, not deleted.
    let (rows, total) = db
        .list_activations(&keywarden::server::ActivationFilter::default(), 10, 0)
        .await
        .unwrap();
    assert_eq!(total, 1);
    assert!(rows[0].unbound_at.is_some());
}
