use super::fee_line::OrderFeeLine;
use super::milestone::{Milestone, MilestoneKey};
use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use sqlx::FromRow;
use uuid::Uuid;

pub const DEFAULT_DEBIT_NOTE_FORM: &str = "TUITION_STANDARD";

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OrderType {
    Tuition,
    Service,
    Activity,
    Other,
}

impl OrderType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Tuition => "tuition",
            Self::Service => "service",
            Self::Activity => "activity",
            Self::Other => "other",
        }
    }

    pub fn parse_or_default(s: &str) -> Self {
        Self::parse(s).unwrap_or(Self::Other)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "tuition" => Some(Self::Tuition),
            "service" => Some(Self::Service),
            "activity" => Some(Self::Activity),
            "other" => Some(Self::Other),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OrderStatus {
    Draft,
    StudentsAdded,
    DataImported,
    Published,
    Closed,
}

impl OrderStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::StudentsAdded => "students_added",
            Self::DataImported => "data_imported",
            Self::Published => "published",
            Self::Closed => "closed",
        }
    }

    pub fn parse_or_default(s: &str) -> Self {
        match s {
            "students_added" => Self::StudentsAdded,
            "data_imported" => Self::DataImported,
            "published" => Self::Published,
            "closed" => Self::Closed,
            _ => Self::Draft,
        }
    }

    /// Automatic progression after the order's student statistics change.
    /// Manual states (published, closed) never move on their own.
    pub fn after_refresh(self, total_students: i32, data_completed: i32) -> Self {
        match self {
            Self::Draft if total_students > 0 => Self::StudentsAdded,
            Self::StudentsAdded if total_students > 0 && data_completed >= total_students => {
                Self::DataImported
            }
            other => other,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub struct FinanceOrder {
    pub order_id: Uuid,
    pub finance_year_id: Uuid,
    pub title: String,
    pub order_type: String,
    pub status: String,
    pub is_active: bool,
    pub description: Option<String>,
    pub debit_note_form_code: String,
    pub total_students: i32,
    pub data_completed_count: i32,
    pub total_collected: Decimal,
    pub total_outstanding: Decimal,
    pub collection_rate: Decimal,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl FinanceOrder {
    pub fn parsed_type(&self) -> OrderType {
        OrderType::parse_or_default(&self.order_type)
    }

    pub fn parsed_status(&self) -> OrderStatus {
        OrderStatus::parse_or_default(&self.status)
    }

    pub fn is_tuition(&self) -> bool {
        self.parsed_type() == OrderType::Tuition
    }

    pub fn can_add_students(&self) -> bool {
        self.is_active
            && matches!(
                self.parsed_status(),
                OrderStatus::Draft | OrderStatus::StudentsAdded
            )
    }

    /// Milestones and fee lines may change until fee data is imported.
    pub fn can_edit_structure(&self) -> bool {
        matches!(
            self.parsed_status(),
            OrderStatus::Draft | OrderStatus::StudentsAdded
        )
    }

    pub fn can_import_data(&self) -> bool {
        self.is_active
            && self.total_students > 0
            && matches!(
                self.parsed_status(),
                OrderStatus::StudentsAdded | OrderStatus::DataImported
            )
    }
}

/// Validated input for creating an order and its structure.
#[derive(Debug, Clone)]
pub struct NewOrder {
    pub finance_year_id: Uuid,
    pub title: String,
    pub order_type: OrderType,
    pub is_active: bool,
    pub description: Option<String>,
    pub debit_note_form_code: String,
    pub milestones: Vec<NewMilestone>,
    pub fee_lines: Vec<NewFeeLine>,
}

#[derive(Debug, Clone)]
pub struct NewMilestone {
    pub key: MilestoneKey,
    pub title: String,
    pub deadline_date: Option<chrono::NaiveDate>,
}

#[derive(Debug, Clone)]
pub struct NewFeeLine {
    pub line_number: String,
    pub line_type: super::fee_line::LineType,
    pub title_en: String,
    pub title_vn: Option<String>,
    pub is_compulsory: bool,
    pub is_deduction: bool,
    pub formula: Option<String>,
    pub note: Option<String>,
    pub sort_order: i32,
}

/// Replacement milestones and/or fee lines for an existing order. `None`
/// leaves that part untouched.
#[derive(Debug, Clone)]
pub struct StructureUpdate {
    pub order_id: Uuid,
    pub milestones: Option<Vec<NewMilestone>>,
    pub fee_lines: Option<Vec<NewFeeLine>>,
}

impl From<&Milestone> for NewMilestone {
    fn from(m: &Milestone) -> Self {
        Self {
            key: m.key(),
            title: m.title.clone(),
            deadline_date: m.deadline_date,
        }
    }
}

impl From<&OrderFeeLine> for NewFeeLine {
    fn from(l: &OrderFeeLine) -> Self {
        Self {
            line_number: l.line_number.clone(),
            line_type: l.parsed_type(),
            title_en: l.title_en.clone(),
            title_vn: l.title_vn.clone(),
            is_compulsory: l.is_compulsory,
            is_deduction: l.is_deduction,
            formula: l.formula().map(str::to_string),
            note: l.note.clone(),
            sort_order: l.sort_order,
        }
    }
}

/// An order with its milestones and fee-line definitions.
#[derive(Debug, Clone)]
pub struct OrderStructure {
    pub order: FinanceOrder,
    /// Sorted by milestone key: yearly first, then by number.
    pub milestones: Vec<Milestone>,
    /// Sorted by `sort_order`.
    pub fee_lines: Vec<OrderFeeLine>,
}

impl OrderStructure {
    pub fn new(order: FinanceOrder, mut milestones: Vec<Milestone>, mut fee_lines: Vec<OrderFeeLine>) -> Self {
        milestones.sort_by_key(|m| m.key());
        fee_lines.sort_by_key(|l| l.sort_order);
        Self {
            order,
            milestones,
            fee_lines,
        }
    }

    pub fn milestone_keys(&self) -> Vec<MilestoneKey> {
        self.milestones.iter().map(Milestone::key).collect()
    }

    pub fn has_milestone(&self, key: &MilestoneKey) -> bool {
        self.milestones.iter().any(|m| m.key() == *key)
    }
}
