use super::milestone::MilestoneAmounts;
use super::order_student::PaymentStatus;
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

/// A student's financial identity within one finance year. The amount
/// fields are a cache of the sums over the student's order rows.
#[derive(Debug, Clone, FromRow)]
pub struct FinanceStudent {
    pub finance_student_id: Uuid,
    pub finance_year_id: Uuid,
    pub student_code: String,
    pub student_name: String,
    pub class_title: Option<String>,
    pub total_amount: Decimal,
    pub paid_amount: Decimal,
    pub outstanding_amount: Decimal,
    pub payment_status: String,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl FinanceStudent {
    pub fn parsed_payment_status(&self) -> PaymentStatus {
        PaymentStatus::parse_or_default(&self.payment_status)
    }
}

/// A student holding a fully paid row in some tuition order of a year.
#[derive(Debug, Clone, FromRow)]
pub struct PaidTuitionStudent {
    pub finance_student_id: Uuid,
    pub student_code: String,
    pub student_name: String,
    pub class_title: Option<String>,
    pub order_id: Uuid,
    pub order_title: String,
}

/// One order row of a finance student, joined with its order.
#[derive(Debug, Clone, FromRow)]
pub struct StudentOrderRow {
    pub order_student_id: Uuid,
    pub order_id: Uuid,
    pub order_title: String,
    pub order_type: String,
    pub is_active: bool,
    pub data_status: String,
    pub total_amount: Decimal,
    pub paid_amount: Decimal,
    pub outstanding_amount: Decimal,
    pub payment_status: String,
    pub payment_scheme_choice: Option<String>,
    pub tuition_paid_elsewhere: bool,
    pub tuition_paid_elsewhere_order: Option<String>,
    pub milestone_amounts: Json<MilestoneAmounts>,
}
