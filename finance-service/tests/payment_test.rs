mod common;

use common::{amount, assert_failure, assert_success, unique_code, TestApp};
use rust_decimal_macros::dec;
use serde_json::json;
use uuid::Uuid;

const AMOUNTS: (u64, u64, u64) = (1_000_000, 550_000, 550_000);

#[tokio::test]
async fn semester_payments_settle_the_order() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };
    let (_, _, order_student_id) = app.enrolled_student(Uuid::new_v4(), AMOUNTS).await;

    let first = app
        .post(
            "record_milestone_payment",
            json!({
                "order_student_id": order_student_id,
                "milestone_key": "semester_1",
                "amount": 550000,
                "notes": "Bank transfer"
            }),
        )
        .await;
    assert_success(&first);
    assert_eq!(first["message"], "Payment recorded for semester_1");
    let row = &first["data"]["order_student"];
    assert_eq!(row["payment_status"], "partial");
    assert_eq!(row["payment_scheme_choice"], "semester");
    assert_eq!(row["current_milestone_key"], "semester_2");
    assert_eq!(amount(&row["paid_amount"]), dec!(550000));
    assert_eq!(amount(&row["total_amount"]), dec!(1100000));
    assert!(row["notes"].as_str().unwrap().contains("Bank transfer"));
    assert_eq!(first["data"]["finance_student_updated"], true);

    // Within tolerance the milestone settles at its expected amount.
    let second = app
        .post(
            "record_milestone_payment",
            json!({
                "order_student_id": order_student_id,
                "milestone_key": "semester_2",
                "amount": 549500
            }),
        )
        .await;
    assert_success(&second);
    assert_eq!(amount(&second["data"]["expected_amount"]), dec!(550000));
    assert_eq!(amount(&second["data"]["received_amount"]), dec!(549500));
    let row = &second["data"]["order_student"];
    assert_eq!(row["payment_status"], "paid");
    assert_eq!(amount(&row["paid_amount"]), dec!(1100000));
    assert_eq!(amount(&row["outstanding_amount"]), dec!(0));
    assert!(row["current_milestone_key"].is_null());

    let summary = &second["data"]["finance_student_summary"];
    assert_eq!(summary["payment_status"], "paid");
    assert_eq!(amount(&summary["total_amount"]), dec!(1100000));

    let note = app
        .get(
            "get_debit_note_preview",
            &[("order_student_id", order_student_id)],
        )
        .await;
    assert_success(&note);
    let payments = note["data"]["payments"].as_array().unwrap();
    assert_eq!(payments.len(), 2);
    assert_eq!(payments[0]["kind"], "milestone");
    assert_eq!(payments[0]["milestone_key"], "semester_1");
    assert_eq!(payments[1]["recorded_by"], common::TEST_USER);
    assert_eq!(note["data"]["payment_summary"]["payment_status"], "paid");
}

#[tokio::test]
async fn invalid_payments_are_rejected_without_changes() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };
    let (_, order_id, order_student_id) = app.enrolled_student(Uuid::new_v4(), AMOUNTS).await;

    let mismatch = app
        .post(
            "record_milestone_payment",
            json!({
                "order_student_id": order_student_id,
                "milestone_key": "yearly_1",
                "amount": 900000
            }),
        )
        .await;
    assert_failure(&mismatch, "VALIDATION_ERROR");
    assert!(mismatch["errors"]["amount"].is_array(), "{mismatch}");

    let unsupported = app
        .post(
            "record_milestone_payment",
            json!({
                "order_student_id": order_student_id,
                "milestone_key": "yearly_3",
                "amount": 1000000
            }),
        )
        .await;
    assert_failure(&unsupported, "VALIDATION_ERROR");
    assert!(unsupported["errors"]["milestone_key"].is_array(), "{unsupported}");

    let malformed_key = app
        .post(
            "record_milestone_payment",
            json!({
                "order_student_id": order_student_id,
                "milestone_key": "monthly_1",
                "amount": 1000000
            }),
        )
        .await;
    assert_failure(&malformed_key, "VALIDATION_ERROR");

    let negative = app
        .post(
            "update_order_student_payment",
            json!({ "order_student_id": order_student_id, "paid_amount": -5 }),
        )
        .await;
    assert_failure(&negative, "VALIDATION_ERROR");
    assert!(negative["errors"]["paid_amount"].is_array(), "{negative}");

    let unknown = app
        .post(
            "update_order_student_payment",
            json!({ "order_student_id": Uuid::new_v4().to_string(), "paid_amount": 10 }),
        )
        .await;
    assert_failure(&unknown, "NOT_FOUND");

    let row = app
        .get(
            "get_order_students_v2",
            &[("order_id", order_id), ("payment_status", "unpaid".to_string())],
        )
        .await;
    assert_eq!(row["data"]["total_count"], 1);
    assert_eq!(amount(&row["data"]["students"][0]["paid_amount"]), dec!(0));
}

#[tokio::test]
async fn yearly_payment_and_direct_adjustment() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };
    let (_, _, order_student_id) = app.enrolled_student(Uuid::new_v4(), AMOUNTS).await;

    let yearly = app
        .post(
            "record_milestone_payment",
            json!({
                "order_student_id": order_student_id,
                "milestone_key": "yearly_1",
                "amount": 1000400
            }),
        )
        .await;
    assert_success(&yearly);
    let row = &yearly["data"]["order_student"];
    assert_eq!(row["payment_status"], "paid");
    assert_eq!(row["payment_scheme_choice"], "yearly");
    assert_eq!(amount(&row["paid_amount"]), dec!(1000000));

    // A direct refund to a partial amount.
    let direct = app
        .post(
            "update_order_student_payment",
            json!({
                "order_student_id": order_student_id,
                "paid_amount": "400000",
                "notes": "Partial refund"
            }),
        )
        .await;
    assert_success(&direct);
    let row = &direct["data"]["order_student"];
    assert_eq!(row["payment_status"], "partial");
    assert_eq!(amount(&row["paid_amount"]), dec!(400000));
    assert_eq!(amount(&row["outstanding_amount"]), dec!(600000));
}

#[tokio::test]
async fn direct_payment_leaves_the_semester_scheme() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };
    let (_, _, order_student_id) = app.enrolled_student(Uuid::new_v4(), AMOUNTS).await;

    let semester = app
        .post(
            "record_milestone_payment",
            json!({
                "order_student_id": order_student_id,
                "milestone_key": "semester_1",
                "amount": 550000
            }),
        )
        .await;
    assert_success(&semester);

    let direct = app
        .post(
            "update_order_student_payment",
            json!({ "order_student_id": order_student_id, "paid_amount": 700000 }),
        )
        .await;
    assert_success(&direct);
    let row = &direct["data"]["order_student"];
    assert!(row["payment_scheme_choice"].is_null());
    assert!(row["current_milestone_key"].is_null());
    assert_eq!(amount(&row["semester_1_paid"]), dec!(0));
    assert_eq!(amount(&row["paid_amount"]), dec!(700000));
}

#[tokio::test]
async fn finance_student_summary_spans_all_orders() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };
    let year = Uuid::new_v4();
    let (student_id, _, order_student_id) = app.enrolled_student(year, AMOUNTS).await;

    let bus_order = app.create_order(year, "School bus", "service").await;
    app.add_students(&bus_order, &[&student_id]).await;
    let orders = app
        .get("get_student_orders", &[("finance_student_id", student_id.clone())])
        .await;
    let code = orders["data"]["student"]["student_code"]
        .as_str()
        .unwrap()
        .to_string();
    app.import_amounts(&bus_order, &[(&code, 200_000, 110_000, 110_000)])
        .await;

    let paid = app
        .post(
            "update_order_student_payment",
            json!({ "order_student_id": order_student_id, "paid_amount": 400000 }),
        )
        .await;
    assert_success(&paid);
    let summary = &paid["data"]["finance_student_summary"];
    assert_eq!(amount(&summary["total_amount"]), dec!(1200000));
    assert_eq!(amount(&summary["paid_amount"]), dec!(400000));
    assert_eq!(amount(&summary["outstanding_amount"]), dec!(800000));
    assert_eq!(summary["payment_status"], "partial");

    let orders = app
        .get("get_student_orders", &[("finance_student_id", student_id)])
        .await;
    assert_success(&orders);
    let student = &orders["data"]["student"];
    assert_eq!(amount(&student["total_amount"]), dec!(1200000));
    assert_eq!(amount(&student["paid_amount"]), dec!(400000));
    assert_eq!(student["payment_status"], "partial");

    let items = orders["data"]["orders"].as_array().unwrap();
    assert_eq!(items.len(), 2);
    let bus = items.iter().find(|o| o["order_type"] == "service").unwrap();
    assert_eq!(bus["payment_status"], "unpaid");
    assert_eq!(amount(&bus["outstanding_amount"]), dec!(200000));
}

#[tokio::test]
async fn tuition_payment_flags_other_tuition_orders() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };
    let year = Uuid::new_v4();
    let (student_id, first_order, order_student_id) = app.enrolled_student(year, AMOUNTS).await;

    let second_order = app.create_order(year, "Tuition (transfer class)", "tuition").await;
    app.add_students(&second_order, &[&student_id]).await;
    let orders = app
        .get("get_student_orders", &[("finance_student_id", student_id.clone())])
        .await;
    let code = orders["data"]["student"]["student_code"]
        .as_str()
        .unwrap()
        .to_string();
    let other = app.order_student(&second_order, &code).await;
    let other_id = other["order_student_id"].as_str().unwrap().to_string();

    let paid = app
        .post(
            "record_milestone_payment",
            json!({
                "order_student_id": order_student_id,
                "milestone_key": "semester_1",
                "amount": 550000
            }),
        )
        .await;
    assert_success(&paid);
    let flagged: Vec<&str> = paid["data"]["flagged_order_students"]
        .as_array()
        .unwrap()
        .iter()
        .map(|v| v.as_str().unwrap())
        .collect();
    assert_eq!(flagged, vec![other_id.as_str()]);

    let other = app.order_student(&second_order, &code).await;
    assert_eq!(other["tuition_paid_elsewhere"], true);
    assert_eq!(other["tuition_paid_elsewhere_order"], "Tuition");
    assert_eq!(other["payment_status"], "unpaid");

    // Partial tuition is not yet "paid" for enrollment purposes.
    let listed = app
        .get("get_paid_tuition_students", &[("finance_year_id", year.to_string())])
        .await;
    assert_success(&listed);
    assert_eq!(listed["data"].as_array().unwrap().len(), 0);

    let settled = app
        .post(
            "record_milestone_payment",
            json!({
                "order_student_id": order_student_id,
                "milestone_key": "semester_2",
                "amount": 550000
            }),
        )
        .await;
    assert_success(&settled);

    let listed = app
        .get("get_paid_tuition_students", &[("finance_year_id", year.to_string())])
        .await;
    let students = listed["data"].as_array().unwrap();
    assert_eq!(students.len(), 1);
    assert_eq!(students[0]["finance_student_id"], student_id.as_str());
    assert_eq!(students[0]["paid_order_id"], first_order.as_str());

    let excluded = app
        .get(
            "get_paid_tuition_students",
            &[
                ("finance_year_id", year.to_string()),
                ("exclude_order_id", first_order),
            ],
        )
        .await;
    assert_eq!(excluded["data"].as_array().unwrap().len(), 0);

    // A student with tuition paid elsewhere is skipped on enrollment.
    let third_order = app.create_order(year, "Tuition (late intake)", "tuition").await;
    let enrolled = app.add_students(&third_order, &[&student_id]).await;
    assert_eq!(enrolled["data"]["added_count"], 0);
    assert_eq!(enrolled["data"]["skipped_paid_count"], 1);
}

#[tokio::test]
async fn students_are_unique_per_year_and_code() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };
    let year = Uuid::new_v4();
    let code = unique_code();
    app.create_student(year, &code).await;

    let duplicate = app
        .post(
            "create_finance_student",
            json!({
                "finance_year_id": year.to_string(),
                "student_code": code,
                "student_name": "Someone else"
            }),
        )
        .await;
    assert_failure(&duplicate, "CONFLICT");
}

#[tokio::test]
async fn finance_students_are_listed_with_their_summary() {
    let Some(app) = TestApp::spawn().await else {
        return;
    };
    let year = Uuid::new_v4();
    let (student_id, _, order_student_id) = app.enrolled_student(year, AMOUNTS).await;
    let paid = app
        .post(
            "update_order_student_payment",
            json!({ "order_student_id": order_student_id, "paid_amount": 400000 }),
        )
        .await;
    assert_success(&paid);
    let idle_code = unique_code();
    app.create_student(year, &idle_code).await;

    let all = app
        .get("get_finance_students", &[("finance_year_id", year.to_string())])
        .await;
    assert_success(&all);
    assert_eq!(all["data"]["total_count"], 2);
    let idle = all["data"]["students"]
        .as_array()
        .unwrap()
        .iter()
        .find(|s| s["student_code"] == idle_code.as_str())
        .cloned()
        .unwrap();
    assert_eq!(idle["display_status"], "no_fee");

    let orders = app
        .get("get_student_orders", &[("finance_student_id", student_id)])
        .await;
    let code = orders["data"]["student"]["student_code"]
        .as_str()
        .unwrap()
        .to_string();
    let found = app
        .get(
            "get_finance_students",
            &[("finance_year_id", year.to_string()), ("search", code.to_lowercase())],
        )
        .await;
    assert_success(&found);
    assert_eq!(found["data"]["total_count"], 1);
    let student = &found["data"]["students"][0];
    assert_eq!(amount(&student["total_amount"]), dec!(1000000));
    assert_eq!(amount(&student["paid_amount"]), dec!(400000));
    assert_eq!(student["display_status"], "partial");

    let paged = app
        .get(
            "get_finance_students",
            &[("finance_year_id", year.to_string()), ("page_size", "1".to_string())],
        )
        .await;
    assert_success(&paged);
    assert_eq!(paged["data"]["students"].as_array().unwrap().len(), 1);
    assert_eq!(paged["data"]["total_pages"], 2);

    let malformed = app
        .get("get_finance_students", &[("finance_year_id", "nope".to_string())])
        .await;
    assert_failure(&malformed, "VALIDATION_ERROR");
}
