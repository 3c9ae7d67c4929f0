//! Admin API integration tests.

mod common;

use axum::http::{HeaderName, HeaderValue, StatusCode};
use common::{TestHarness, SERVICE_API_KEY};
use serde_json::json;

// ============================================================================
// Plans
// ============================================================================

#[tokio::test]
async fn list_plans_returns_seeded_catalog() {
    let harness = TestHarness::new().await;

    let response = harness.admin_get("/v1/admin/plans").await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["version"], 1);

    let plans = body["plans"].as_array().unwrap();
    assert_eq!(plans.len(), 3);
    let one_z = plans.iter().find(|p| p["plan_id"] == "one_z").unwrap();
    assert_eq!(one_z["monthly_credits"], 50_000);
    assert_eq!(one_z["daily_grant"], 1_666);
}

#[tokio::test]
async fn put_plan_bumps_catalog_version() {
    let harness = TestHarness::new().await;

    let response = harness
        .admin_put("/v1/admin/plans/one_max", &json!({"monthly_credits": 500_000}))
        .await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["version"], 2);
    assert_eq!(body["plan"]["plan_id"], "one_max");

    let catalog: serde_json::Value = harness.admin_get("/v1/admin/plans").await.json();
    assert_eq!(catalog["version"], 2);
    assert_eq!(catalog["plans"].as_array().unwrap().len(), 4);
}

#[tokio::test]
async fn put_plan_with_negative_credits_fails() {
    let harness = TestHarness::new().await;

    harness
        .admin_put("/v1/admin/plans/one_z", &json!({"monthly_credits": -1}))
        .await
        .assert_status(StatusCode::BAD_REQUEST);

    let catalog: serde_json::Value = harness.admin_get("/v1/admin/plans").await.json();
    assert_eq!(catalog["version"], 1);
}

// ============================================================================
// Billing status
// ============================================================================

#[tokio::test]
async fn billing_status_not_found_for_unknown_user() {
    let harness = TestHarness::new().await;

    harness
        .admin_get(&format!("/v1/admin/billing/{}", harness.test_user_id))
        .await
        .assert_status_not_found();
}

#[tokio::test]
async fn put_billing_with_grant_funds_user() {
    let harness = TestHarness::new().await;
    let path = format!("/v1/admin/billing/{}", harness.test_user_id);

    let response = harness
        .admin_put(
            &path,
            &json!({"plan_id": "one_t", "status": "trialing", "grant": true}),
        )
        .await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["status"], "trialing");
    assert_eq!(body["entitled"], true);
    assert_eq!(body["grant"]["granted"], true);
    assert_eq!(body["grant"]["balance"], 12_000);
    assert_eq!(harness.balance().await, 12_000);

    let stored: serde_json::Value = harness.admin_get(&path).await.json();
    assert_eq!(stored["plan_id"], "one_t");
    assert_eq!(stored["status"], "trialing");
}

#[tokio::test]
async fn put_billing_without_grant_leaves_balance() {
    let harness = TestHarness::new().await;

    let response = harness
        .admin_put(
            &format!("/v1/admin/billing/{}", harness.test_user_id),
            &json!({"plan_id": "one_z", "status": "cancelled"}),
        )
        .await;

    response.assert_status_ok();
    let body: serde_json::Value = response.json();
    assert_eq!(body["entitled"], false);
    assert!(body.get("grant").is_none());
    assert_eq!(harness.balance().await, 0);
}

#[tokio::test]
async fn put_billing_with_unknown_plan_fails() {
    let harness = TestHarness::new().await;
    let path = format!("/v1/admin/billing/{}", harness.test_user_id);

    harness
        .admin_put(&path, &json!({"plan_id": "no_such_plan", "status": "active"}))
        .await
        .assert_status_not_found();

    harness.admin_get(&path).await.assert_status_not_found();
}

// ============================================================================
// Auth
// ============================================================================

#[tokio::test]
async fn admin_routes_require_admin_code() {
    let harness = TestHarness::new().await;

    harness
        .server
        .get("/v1/admin/plans")
        .await
        .assert_status_unauthorized();

    harness
        .server
        .get("/v1/admin/plans")
        .add_header(
            HeaderName::from_static("x-admin-code"),
            HeaderValue::from_static("wrong-admin-code-0000"),
        )
        .await
        .assert_status_unauthorized();
}

#[tokio::test]
async fn service_key_does_not_grant_admin_access() {
    let harness = TestHarness::new().await;

    harness
        .server
        .put("/v1/admin/plans/free")
        .add_header(
            HeaderName::from_static("x-api-key"),
            HeaderValue::from_static(SERVICE_API_KEY),
        )
        .json(&json!({"monthly_credits": 1_000_000}))
        .await
        .assert_status_unauthorized();
}
