use super::milestone::MilestoneAmounts;
use chrono::{DateTime, Utc};
use sqlx::types::Json;
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LineType {
    /// Heading row of a debit note; never carries amounts.
    Category,
    Item,
    Subtotal,
    Total,
}

impl LineType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Category => "category",
            Self::Item => "item",
            Self::Subtotal => "subtotal",
            Self::Total => "total",
        }
    }

    pub fn parse_or_default(s: &str) -> Self {
        Self::parse(s).unwrap_or(Self::Item)
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "category" => Some(Self::Category),
            "item" => Some(Self::Item),
            "subtotal" => Some(Self::Subtotal),
            "total" => Some(Self::Total),
            _ => None,
        }
    }

    pub fn accepts_amounts(&self) -> bool {
        !matches!(self, Self::Category)
    }
}

/// Order-level definition of a debit note row.
#[derive(Debug, Clone, FromRow)]
pub struct OrderFeeLine {
    pub fee_line_id: Uuid,
    pub order_id: Uuid,
    pub line_number: String,
    pub line_type: String,
    pub title_en: String,
    pub title_vn: Option<String>,
    pub is_compulsory: bool,
    pub is_deduction: bool,
    pub formula: Option<String>,
    pub note: Option<String>,
    pub sort_order: i32,
    pub created_utc: DateTime<Utc>,
}

impl OrderFeeLine {
    pub fn parsed_type(&self) -> LineType {
        LineType::parse_or_default(&self.line_type)
    }

    pub fn formula(&self) -> Option<&str> {
        self.formula.as_deref().map(str::trim).filter(|f| !f.is_empty())
    }
}

/// Stored amounts of one fee line for one order student.
#[derive(Debug, Clone, FromRow)]
pub struct StudentFeeLine {
    pub order_student_id: Uuid,
    pub line_number: String,
    pub amounts: Json<MilestoneAmounts>,
    pub is_calculated: bool,
    pub updated_utc: DateTime<Utc>,
}

/// A fee line as the formula evaluator and resolver see it: the order's
/// definition joined with one student's amounts, in debit-note order.
#[derive(Debug, Clone, PartialEq)]
pub struct FeeLine {
    pub line_number: String,
    pub line_type: LineType,
    pub is_deduction: bool,
    pub formula: Option<String>,
    pub amounts: MilestoneAmounts,
    pub is_calculated: bool,
}

impl FeeLine {
    pub fn new(line_number: impl Into<String>, line_type: LineType) -> Self {
        Self {
            line_number: line_number.into(),
            line_type,
            is_deduction: false,
            formula: None,
            amounts: MilestoneAmounts::new(),
            is_calculated: false,
        }
    }

    pub fn with_formula(mut self, formula: impl Into<String>) -> Self {
        self.formula = Some(formula.into());
        self
    }

    pub fn with_amounts(mut self, amounts: MilestoneAmounts) -> Self {
        self.amounts = amounts;
        self
    }

    pub fn deduction(mut self) -> Self {
        self.is_deduction = true;
        self
    }

    pub fn has_formula(&self) -> bool {
        self.formula.as_deref().is_some_and(|f| !f.trim().is_empty())
    }

    /// Joins order definitions with a student's stored rows. Definitions with
    /// no stored row start with empty amounts.
    pub fn assemble(definitions: &[OrderFeeLine], stored: &[StudentFeeLine]) -> Vec<FeeLine> {
        definitions
            .iter()
            .map(|def| {
                let row = stored.iter().find(|s| s.line_number == def.line_number);
                FeeLine {
                    line_number: def.line_number.clone(),
                    line_type: def.parsed_type(),
                    is_deduction: def.is_deduction,
                    formula: def.formula().map(str::to_string),
                    amounts: row.map(|r| r.amounts.0.clone()).unwrap_or_default(),
                    is_calculated: row.is_some_and(|r| r.is_calculated),
                }
            })
            .collect()
    }
}
