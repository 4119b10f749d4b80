use super::{parse_id, parse_milestone_key};
use crate::models::{
    LineType, MilestoneKey, NewFeeLine, NewMilestone, NewOrder, OrderType, PaymentScheme,
    StructureUpdate, DEFAULT_DEBIT_NOTE_FORM,
};
use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::{Deserialize, Deserializer};
use service_core::error::AppError;
use uuid::Uuid;
use validator::Validate;

/// Accepts a JSON array, a JSON-encoded array in a string (form posts), or
/// a comma-separated string.
fn string_list<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Vec<String>, D::Error> {
    #[derive(Deserialize)]
    #[serde(untagged)]
    enum ListOrText {
        List(Vec<String>),
        Text(String),
    }

    let items = match ListOrText::deserialize(deserializer)? {
        ListOrText::List(items) => items,
        ListOrText::Text(text) if text.trim_start().starts_with('[') => {
            serde_json::from_str(&text).map_err(serde::de::Error::custom)?
        }
        ListOrText::Text(text) => text.split(',').map(str::to_string).collect(),
    };
    Ok(items
        .into_iter()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
        .collect())
}

// =============================================================================
// Students
// =============================================================================

#[derive(Debug, Deserialize, Validate)]
pub struct CreateFinanceStudentRequest {
    #[validate(length(min = 1, message = "finance_year_id is required"))]
    pub finance_year_id: String,
    #[validate(length(min = 1, max = 64, message = "student_code is required"))]
    pub student_code: String,
    #[validate(length(min = 1, message = "student_name is required"))]
    pub student_name: String,
    pub class_title: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct PaidTuitionQuery {
    #[validate(length(min = 1, message = "finance_year_id is required"))]
    pub finance_year_id: String,
    pub exclude_order_id: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct FinanceStudentsQuery {
    #[validate(length(min = 1, message = "finance_year_id is required"))]
    pub finance_year_id: String,
    pub search: Option<String>,
    #[validate(range(min = 1, message = "page starts at 1"))]
    pub page: Option<i64>,
    #[validate(range(min = 1, max = 500, message = "page_size must be between 1 and 500"))]
    pub page_size: Option<i64>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct StudentOrdersQuery {
    #[validate(length(min = 1, message = "finance_student_id is required"))]
    pub finance_student_id: String,
}

// =============================================================================
// Orders
// =============================================================================

#[derive(Debug, Deserialize)]
pub struct MilestoneInput {
    pub payment_scheme: String,
    pub milestone_number: u32,
    pub title: Option<String>,
    pub deadline_date: Option<NaiveDate>,
}

#[derive(Debug, Deserialize)]
pub struct FeeLineInput {
    pub line_number: String,
    pub line_type: Option<String>,
    pub title_en: String,
    pub title_vn: Option<String>,
    #[serde(default)]
    pub is_compulsory: bool,
    #[serde(default)]
    pub is_deduction: bool,
    pub formula: Option<String>,
    pub note: Option<String>,
    pub sort_order: Option<i32>,
}

fn parse_milestones(inputs: Vec<MilestoneInput>) -> Result<Vec<NewMilestone>, AppError> {
    inputs
        .into_iter()
        .map(|m| {
            let scheme = PaymentScheme::parse(m.payment_scheme.trim()).ok_or_else(|| {
                AppError::field(
                    "milestones",
                    format!("Unknown payment scheme '{}'", m.payment_scheme),
                )
            })?;
            if m.milestone_number == 0 {
                return Err(AppError::field("milestones", "Milestone numbers start at 1"));
            }
            let key = MilestoneKey::new(scheme, m.milestone_number);
            Ok(NewMilestone {
                key,
                title: m.title.filter(|t| !t.trim().is_empty()).unwrap_or_else(|| key.to_string()),
                deadline_date: m.deadline_date,
            })
        })
        .collect()
}

/// Lines without an explicit `sort_order` take their position in the list.
fn parse_fee_lines(inputs: Vec<FeeLineInput>) -> Result<Vec<NewFeeLine>, AppError> {
    inputs
        .into_iter()
        .enumerate()
        .map(|(index, line)| {
            let line_type = match line.line_type.as_deref().map(str::trim) {
                None | Some("") => LineType::Item,
                Some(raw) => LineType::parse(raw).ok_or_else(|| {
                    AppError::field("fee_lines", format!("Unknown line type '{}'", raw))
                })?,
            };
            Ok(NewFeeLine {
                line_number: line.line_number.trim().to_string(),
                line_type,
                title_en: line.title_en,
                title_vn: line.title_vn,
                is_compulsory: line.is_compulsory,
                is_deduction: line.is_deduction,
                formula: line.formula.filter(|f| !f.trim().is_empty()),
                note: line.note,
                sort_order: line.sort_order.unwrap_or(index as i32 + 1),
            })
        })
        .collect()
}

#[derive(Debug, Deserialize, Validate)]
pub struct CreateOrderRequest {
    #[validate(length(min = 1, message = "finance_year_id is required"))]
    pub finance_year_id: String,
    #[validate(length(min = 1, max = 200, message = "title is required"))]
    pub title: String,
    pub order_type: Option<String>,
    pub is_active: Option<bool>,
    pub description: Option<String>,
    pub debit_note_form_code: Option<String>,
    #[serde(default)]
    pub milestones: Vec<MilestoneInput>,
    #[serde(default)]
    pub fee_lines: Vec<FeeLineInput>,
}

impl CreateOrderRequest {
    pub fn into_new_order(self) -> Result<NewOrder, AppError> {
        let finance_year_id = parse_id("finance_year_id", &self.finance_year_id)?;

        let order_type = match self.order_type.as_deref().map(str::trim) {
            None | Some("") => OrderType::Tuition,
            Some(raw) => OrderType::parse(raw)
                .ok_or_else(|| AppError::field("order_type", format!("Unknown order type '{}'", raw)))?,
        };

        let milestones = parse_milestones(self.milestones)?;
        let fee_lines = parse_fee_lines(self.fee_lines)?;

        Ok(NewOrder {
            finance_year_id,
            title: self.title.trim().to_string(),
            order_type,
            is_active: self.is_active.unwrap_or(true),
            description: self.description,
            debit_note_form_code: self
                .debit_note_form_code
                .filter(|c| !c.trim().is_empty())
                .unwrap_or_else(|| DEFAULT_DEBIT_NOTE_FORM.to_string()),
            milestones,
            fee_lines,
        })
    }
}

/// Omitted parts of the structure are left as they are.
#[derive(Debug, Deserialize, Validate)]
pub struct UpdateOrderStructureRequest {
    #[validate(length(min = 1, message = "order_id is required"))]
    pub order_id: String,
    pub milestones: Option<Vec<MilestoneInput>>,
    pub fee_lines: Option<Vec<FeeLineInput>>,
}

impl UpdateOrderStructureRequest {
    pub fn into_update(self) -> Result<StructureUpdate, AppError> {
        Ok(StructureUpdate {
            order_id: parse_id("order_id", &self.order_id)?,
            milestones: self.milestones.map(parse_milestones).transpose()?,
            fee_lines: self.fee_lines.map(parse_fee_lines).transpose()?,
        })
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct OrderIdRequest {
    #[validate(length(min = 1, message = "order_id is required"))]
    pub order_id: String,
}

impl OrderIdRequest {
    pub fn order_id(&self) -> Result<Uuid, AppError> {
        parse_id("order_id", &self.order_id)
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct OrderStudentsQuery {
    #[validate(length(min = 1, message = "order_id is required"))]
    pub order_id: String,
    pub search: Option<String>,
    pub data_status: Option<String>,
    pub payment_status: Option<String>,
    #[validate(range(min = 1, message = "page starts at 1"))]
    pub page: Option<i64>,
    #[validate(range(min = 1, max = 500, message = "page_size must be between 1 and 500"))]
    pub page_size: Option<i64>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct AddStudentsRequest {
    #[validate(length(min = 1, message = "order_id is required"))]
    pub order_id: String,
    #[serde(deserialize_with = "string_list")]
    #[validate(length(min = 1, message = "student_ids must not be empty"))]
    pub student_ids: Vec<String>,
    pub exclude_paid_tuition: Option<bool>,
}

impl AddStudentsRequest {
    pub fn student_ids(&self) -> Result<Vec<Uuid>, AppError> {
        let mut ids = Vec::with_capacity(self.student_ids.len());
        for raw in &self.student_ids {
            let id = parse_id("student_ids", raw)?;
            if !ids.contains(&id) {
                ids.push(id);
            }
        }
        Ok(ids)
    }
}

// =============================================================================
// Payments
// =============================================================================

#[derive(Debug, Deserialize, Validate)]
pub struct UpdatePaymentRequest {
    #[validate(length(min = 1, message = "order_student_id is required"))]
    pub order_student_id: String,
    pub paid_amount: Decimal,
    pub notes: Option<String>,
}

#[derive(Debug, Deserialize, Validate)]
pub struct MilestonePaymentRequest {
    #[validate(length(min = 1, message = "order_student_id is required"))]
    pub order_student_id: String,
    #[validate(length(min = 1, message = "milestone_key is required"))]
    pub milestone_key: String,
    pub amount: Decimal,
    pub notes: Option<String>,
}

impl MilestonePaymentRequest {
    pub fn milestone_key(&self) -> Result<MilestoneKey, AppError> {
        parse_milestone_key(&self.milestone_key)
    }
}

#[derive(Debug, Deserialize, Validate)]
pub struct DebitNoteQuery {
    #[validate(length(min = 1, message = "order_student_id is required"))]
    pub order_student_id: String,
    pub milestone_key: Option<String>,
}

impl DebitNoteQuery {
    pub fn milestone_key(&self) -> Result<Option<MilestoneKey>, AppError> {
        match self.milestone_key.as_deref().map(str::trim) {
            None | Some("") => Ok(None),
            Some(raw) => parse_milestone_key(raw).map(Some),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn student_ids_accept_json_and_comma_lists() {
        let json: AddStudentsRequest = serde_json::from_str(
            r#"{"order_id":"o","student_ids":["a"," b ",""]}"#,
        )
        .unwrap();
        assert_eq!(json.student_ids, vec!["a", "b"]);

        let form: AddStudentsRequest =
            serde_urlencoded::from_str("order_id=o&student_ids=%5B%22x%22%2C%22y%22%5D").unwrap();
        assert_eq!(form.student_ids, vec!["x", "y"]);

        let csv: AddStudentsRequest =
            serde_urlencoded::from_str("order_id=o&student_ids=x,y&exclude_paid_tuition=false").unwrap();
        assert_eq!(csv.student_ids, vec!["x", "y"]);
        assert_eq!(csv.exclude_paid_tuition, Some(false));
    }

    #[test]
    fn duplicate_student_ids_collapse() {
        let id = Uuid::new_v4().to_string();
        let request = AddStudentsRequest {
            order_id: "o".into(),
            student_ids: vec![id.clone(), id],
            exclude_paid_tuition: None,
        };
        assert_eq!(request.student_ids().unwrap().len(), 1);
    }

    #[test]
    fn payment_amount_parses_from_form_string() {
        let request: UpdatePaymentRequest =
            serde_urlencoded::from_str("order_student_id=abc&paid_amount=1500.50").unwrap();
        assert_eq!(request.paid_amount, Decimal::new(150050, 2));
    }

    #[test]
    fn structure_update_parses_only_what_was_sent() {
        let request: UpdateOrderStructureRequest = serde_json::from_value(serde_json::json!({
            "order_id": Uuid::nil().to_string(),
            "fee_lines": [
                {"line_number": "1", "title_en": "Tuition"},
                {"line_number": "2", "line_type": "total", "title_en": "Total", "formula": " "}
            ]
        }))
        .unwrap();

        let update = request.into_update().unwrap();
        assert!(update.milestones.is_none());
        let lines = update.fee_lines.unwrap();
        assert_eq!(lines[1].line_type, LineType::Total);
        assert_eq!(lines[1].formula, None);
        assert_eq!(lines[1].sort_order, 2);

        let bad: UpdateOrderStructureRequest = serde_json::from_value(serde_json::json!({
            "order_id": Uuid::nil().to_string(),
            "milestones": [{"payment_scheme": "monthly", "milestone_number": 1}]
        }))
        .unwrap();
        match bad.into_update().unwrap_err() {
            AppError::FieldError { errors, .. } => assert!(errors.contains_key("milestones")),
            other => panic!("unexpected error: {other:?}"),
        }
    }

    #[test]
    fn order_request_applies_defaults() {
        let request: CreateOrderRequest = serde_json::from_value(serde_json::json!({
            "finance_year_id": Uuid::nil().to_string(),
            "title": " Tuition 2026 ",
            "milestones": [
                {"payment_scheme": "yearly", "milestone_number": 1},
                {"payment_scheme": "semester", "milestone_number": 2, "title": "Semester 2"}
            ],
            "fee_lines": [
                {"line_number": "1", "title_en": "Tuition"},
                {"line_number": "2", "line_type": "total", "title_en": "Total", "formula": "(1)"}
            ]
        }))
        .unwrap();

        let order = request.into_new_order().unwrap();
        assert_eq!(order.title, "Tuition 2026");
        assert_eq!(order.order_type, OrderType::Tuition);
        assert!(order.is_active);
        assert_eq!(order.debit_note_form_code, DEFAULT_DEBIT_NOTE_FORM);
        assert_eq!(order.milestones[0].title, "yearly_1");
        assert_eq!(order.milestones[1].key, MilestoneKey::semester(2));
        assert_eq!(order.fee_lines[0].line_type, LineType::Item);
        assert_eq!(order.fee_lines[1].sort_order, 2);
    }

    #[test]
    fn unknown_scheme_is_a_field_error() {
        let request: CreateOrderRequest = serde_json::from_value(serde_json::json!({
            "finance_year_id": Uuid::nil().to_string(),
            "title": "T",
            "milestones": [{"payment_scheme": "monthly", "milestone_number": 1}]
        }))
        .unwrap();
        let err = request.into_new_order().unwrap_err();
        assert_eq!(err.to_string(), "Unknown payment scheme 'monthly'");
    }
}
