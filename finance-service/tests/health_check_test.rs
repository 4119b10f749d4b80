mod common;

use common::{assert_failure, TestApp};
use serde_json::Value;
use uuid::Uuid;

#[tokio::test]
async fn health_check_reports_database() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };

    let response = app
        .client
        .get(format!("{}/health", app.address))
        .send()
        .await
        .expect("Failed to execute request");
    assert!(response.status().is_success());

    let body: Value = response.json().await.expect("health body");
    assert_eq!(body["status"], "ok");
    assert_eq!(body["database"], "up");
}

#[tokio::test]
async fn callers_without_a_finance_role_are_refused() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };

    let url = format!("{}/api/finance/get_paid_tuition_students", app.address);
    let query = [("finance_year_id", Uuid::new_v4().to_string())];

    let guest = app.client.get(&url).query(&query).send().await.expect("request");
    assert_eq!(guest.status().as_u16(), 200);
    let body: Value = guest.json().await.expect("json");
    assert_failure(&body, "FORBIDDEN");

    let librarian = app
        .client
        .get(&url)
        .header("X-User-ID", "librarian@school.test")
        .header("X-User-Roles", "Librarian, Parent")
        .query(&query)
        .send()
        .await
        .expect("request");
    let body: Value = librarian.json().await.expect("json");
    assert_failure(&body, "FORBIDDEN");
}

#[tokio::test]
async fn unknown_order_is_not_found() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };

    let body = app
        .get(
            "get_order_with_structure",
            &[("order_id", Uuid::new_v4().to_string())],
        )
        .await;
    assert_failure(&body, "NOT_FOUND");
}

#[tokio::test]
async fn malformed_ids_are_field_errors() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };

    let body = app
        .get("get_order_with_structure", &[("order_id", "not-a-uuid".to_string())])
        .await;
    assert_failure(&body, "VALIDATION_ERROR");
    assert!(body["errors"]["order_id"].is_array(), "{body}");
}
