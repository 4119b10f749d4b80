use super::milestone::{MilestoneAmounts, MilestoneKey, PaymentScheme};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

/// Stored payment status of an order student. `no_fee` exists only on the
/// read side, see [`crate::engine::aggregator::DisplayStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PaymentStatus {
    Unpaid,
    Partial,
    Paid,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Unpaid => "unpaid",
            Self::Partial => "partial",
            Self::Paid => "paid",
        }
    }

    pub fn parse_or_default(s: &str) -> Self {
        match s {
            "paid" => Self::Paid,
            "partial" => Self::Partial,
            _ => Self::Unpaid,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "unpaid" => Some(Self::Unpaid),
            "partial" => Some(Self::Partial),
            "paid" => Some(Self::Paid),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DataStatus {
    Pending,
    Complete,
}

impl DataStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Complete => "complete",
        }
    }

    pub fn parse_or_default(s: &str) -> Self {
        match s {
            "complete" => Self::Complete,
            _ => Self::Pending,
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "complete" => Some(Self::Complete),
            _ => None,
        }
    }
}

/// One student's enrolment in one order.
#[derive(Debug, Clone, FromRow)]
pub struct OrderStudent {
    pub order_student_id: Uuid,
    pub order_id: Uuid,
    pub finance_student_id: Uuid,
    pub student_code: String,
    pub student_name: String,
    pub class_title: Option<String>,
    pub data_status: String,
    pub total_amount: Decimal,
    pub paid_amount: Decimal,
    pub outstanding_amount: Decimal,
    pub payment_status: String,
    pub payment_scheme_choice: Option<String>,
    pub current_milestone_key: Option<String>,
    pub semester_1_paid: Decimal,
    pub semester_2_paid: Decimal,
    pub milestone_amounts: Json<MilestoneAmounts>,
    pub tuition_paid_elsewhere: bool,
    pub tuition_paid_elsewhere_order: Option<String>,
    pub notes: Option<String>,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl OrderStudent {
    pub fn parsed_payment_status(&self) -> PaymentStatus {
        PaymentStatus::parse_or_default(&self.payment_status)
    }

    pub fn parsed_data_status(&self) -> DataStatus {
        DataStatus::parse_or_default(&self.data_status)
    }

    pub fn scheme_choice(&self) -> Option<PaymentScheme> {
        self.payment_scheme_choice.as_deref().and_then(PaymentScheme::parse)
    }

    pub fn current_milestone(&self) -> Option<MilestoneKey> {
        self.current_milestone_key.as_deref().and_then(|k| k.parse().ok())
    }

    /// Appends a timestamped note line; earlier notes are kept.
    pub fn append_note(&mut self, at: DateTime<Utc>, text: &str) {
        self.notes = append_note(self.notes.as_deref(), at, text);
    }
}

pub fn append_note(existing: Option<&str>, at: DateTime<Utc>, text: &str) -> Option<String> {
    let text = text.trim();
    if text.is_empty() {
        return existing.map(str::to_string);
    }
    let line = format!("[{}] {}", at.format("%Y-%m-%d %H:%M"), text);
    match existing.map(str::trim_end).filter(|e| !e.is_empty()) {
        Some(previous) => Some(format!("{previous}\n{line}")),
        None => Some(line),
    }
}

// ============================================================================
// Payment History
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PaymentKind {
    Direct,
    Milestone,
}

impl PaymentKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Milestone => "milestone",
        }
    }
}

/// Append-only audit row written for every accepted payment.
#[derive(Debug, Clone, FromRow)]
pub struct PaymentRecord {
    pub payment_id: Uuid,
    pub order_student_id: Uuid,
    pub kind: String,
    pub milestone_key: Option<String>,
    pub expected_amount: Option<Decimal>,
    pub received_amount: Decimal,
    pub applied_paid_amount: Decimal,
    pub payment_status: String,
    pub recorded_by: Option<String>,
    pub notes: Option<String>,
    pub created_utc: DateTime<Utc>,
}
