//! Shared harness for database-backed integration tests.
//!
//! Tests run only when `TEST_DATABASE_URL` points at a Postgres database;
//! otherwise [`TestApp::spawn`] returns `None` and the test returns early.
//! Every test works inside its own random finance year, so tests can share
//! one database.

#![allow(dead_code)]

use finance_service::config::{DatabaseConfig, FinanceConfig, FinanceSettings};
use finance_service::startup::Application;
use rust_decimal::Decimal;
use serde_json::{json, Value};
use service_core::config::Config;
use std::str::FromStr;
use uuid::Uuid;

pub const TEST_USER: &str = "bursar@school.test";
pub const TEST_ROLES: &str = "Registrar";

pub struct TestApp {
    pub address: String,
    pub client: reqwest::Client,
}

impl TestApp {
    pub async fn spawn() -> Option<Self> {
        let Ok(database_url) = std::env::var("TEST_DATABASE_URL") else {
            eprintln!("TEST_DATABASE_URL not set; skipping database-backed test");
            return None;
        };

        let config = FinanceConfig {
            common: Config {
                host: "127.0.0.1".to_string(),
                port: 0,
                request_timeout_secs: 30,
            },
            service_name: "finance-service-test".to_string(),
            service_version: "test".to_string(),
            log_level: "warn".to_string(),
            otlp_endpoint: None,
            database: DatabaseConfig {
                url: database_url,
                max_connections: 5,
                min_connections: 0,
            },
            finance: FinanceSettings::default(),
        };

        let app = Application::build(config)
            .await
            .expect("Failed to build test application");
        let address = format!("http://127.0.0.1:{}", app.port());

        tokio::spawn(async move {
            app.run_until_stopped().await.ok();
        });

        let client = reqwest::Client::new();
        for _ in 0..50 {
            if client.get(format!("{}/health", address)).send().await.is_ok() {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        }

        Some(Self { address, client })
    }

    fn url(&self, name: &str) -> String {
        format!("{}/api/finance/{}", self.address, name)
    }

    /// POSTs a JSON body as an admin caller and returns the envelope.
    pub async fn post(&self, name: &str, body: Value) -> Value {
        self.client
            .post(self.url(name))
            .header("X-User-ID", TEST_USER)
            .header("X-User-Roles", TEST_ROLES)
            .json(&body)
            .send()
            .await
            .expect("Failed to send request")
            .json()
            .await
            .expect("Response is not JSON")
    }

    /// GETs with query parameters as an admin caller.
    pub async fn get(&self, name: &str, query: &[(&str, String)]) -> Value {
        self.client
            .get(self.url(name))
            .header("X-User-ID", TEST_USER)
            .header("X-User-Roles", TEST_ROLES)
            .query(query)
            .send()
            .await
            .expect("Failed to send request")
            .json()
            .await
            .expect("Response is not JSON")
    }

    pub async fn import_csv(&self, order_id: &str, csv: &str) -> Value {
        self.client
            .post(self.url("import_student_fee_data"))
            .header("X-User-ID", TEST_USER)
            .header("X-User-Roles", TEST_ROLES)
            .header("Content-Type", "text/csv")
            .query(&[("order_id", order_id)])
            .body(csv.to_string())
            .send()
            .await
            .expect("Failed to send request")
            .json()
            .await
            .expect("Response is not JSON")
    }

    // =========================================================================
    // Fixtures
    // =========================================================================

    pub async fn create_student(&self, year: Uuid, code: &str) -> String {
        let body = self
            .post(
                "create_finance_student",
                json!({
                    "finance_year_id": year.to_string(),
                    "student_code": code,
                    "student_name": format!("Student {code}"),
                    "class_title": "10A",
                }),
            )
            .await;
        assert_success(&body);
        body["data"]["finance_student_id"]
            .as_str()
            .expect("finance_student_id")
            .to_string()
    }

    /// An order with one tuition line `1` and a total line `9 = (1)`, paid
    /// yearly or over two semesters.
    pub async fn create_order(&self, year: Uuid, title: &str, order_type: &str) -> String {
        let body = self
            .post(
                "create_order_with_structure",
                json!({
                    "finance_year_id": year.to_string(),
                    "title": title,
                    "order_type": order_type,
                    "milestones": [
                        {"payment_scheme": "semester", "milestone_number": 1, "title": "Semester 1"},
                        {"payment_scheme": "semester", "milestone_number": 2, "title": "Semester 2"},
                        {"payment_scheme": "yearly", "milestone_number": 1, "title": "Full year"}
                    ],
                    "fee_lines": [
                        {"line_number": "1", "line_type": "item", "title_en": "Tuition", "is_compulsory": true},
                        {"line_number": "9", "line_type": "total", "title_en": "Total", "formula": "(1)"}
                    ]
                }),
            )
            .await;
        assert_success(&body);
        body["data"]["order"]["order_id"]
            .as_str()
            .expect("order_id")
            .to_string()
    }

    pub async fn add_students(&self, order_id: &str, student_ids: &[&str]) -> Value {
        let body = self
            .post(
                "add_students_to_order_v2",
                json!({ "order_id": order_id, "student_ids": student_ids }),
            )
            .await;
        assert_success(&body);
        body
    }

    /// Imports `(code, yearly_1, semester_1, semester_2)` amounts for line 1.
    pub async fn import_amounts(&self, order_id: &str, rows: &[(&str, u64, u64, u64)]) -> Value {
        let mut csv = String::from("Code,Name,Tuition Y1,Tuition S1,Tuition S2,Note\n");
        csv.push_str("student_code,student_name,1_yearly_1,1_semester_1,1_semester_2,note\n");
        for (code, yearly, sem_1, sem_2) in rows {
            csv.push_str(&format!("{code},,{yearly},{sem_1},{sem_2},\n"));
        }
        let body = self.import_csv(order_id, &csv).await;
        assert_success(&body);
        body
    }

    pub async fn order_student(&self, order_id: &str, code: &str) -> Value {
        let body = self
            .get(
                "get_order_students_v2",
                &[("order_id", order_id.to_string()), ("search", code.to_string())],
            )
            .await;
        assert_success(&body);
        body["data"]["students"]
            .as_array()
            .and_then(|s| s.iter().find(|s| s["student_code"] == code))
            .cloned()
            .expect("order student not found")
    }

    /// Creates a student, a tuition order and imports amounts for it.
    /// Returns `(finance_student_id, order_id, order_student_id)`.
    pub async fn enrolled_student(
        &self,
        year: Uuid,
        amounts: (u64, u64, u64),
    ) -> (String, String, String) {
        let code = unique_code();
        let student_id = self.create_student(year, &code).await;
        let order_id = self.create_order(year, "Tuition", "tuition").await;
        self.add_students(&order_id, &[&student_id]).await;
        self.import_amounts(&order_id, &[(&code, amounts.0, amounts.1, amounts.2)])
            .await;
        let order_student_id = self.order_student(&order_id, &code).await["order_student_id"]
            .as_str()
            .expect("order_student_id")
            .to_string();
        (student_id, order_id, order_student_id)
    }
}

pub fn unique_code() -> String {
    format!("S{}", &Uuid::new_v4().simple().to_string()[..8])
}

pub fn assert_success(body: &Value) {
    assert_eq!(body["success"], true, "request failed: {body}");
}

pub fn assert_failure(body: &Value, code: &str) {
    assert_eq!(body["success"], false, "request unexpectedly succeeded: {body}");
    assert_eq!(body["code"], code, "unexpected failure: {body}");
}

/// Reads a decimal serialized as a string.
pub fn amount(value: &Value) -> Decimal {
    match value {
        Value::String(s) => Decimal::from_str(s).expect("decimal string"),
        Value::Number(n) => Decimal::from_str(&n.to_string()).expect("decimal number"),
        other => panic!("not a decimal: {other}"),
    }
}
