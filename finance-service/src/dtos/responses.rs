use crate::engine::{display_status, DisplayStatus, StudentSummary};
use crate::models::{
    FinanceOrder, FinanceStudent, Milestone, MilestoneAmounts, MilestoneKey, OrderFeeLine,
    OrderStructure, OrderStudent, PaidTuitionStudent, PaymentRecord, PaymentScheme,
};
use crate::services::finance::{
    BatchReport, DebitNoteData, EnrollmentReport, MilestonePaymentOutcome, RowError,
    StudentOrderView, StudentUpdate,
};
use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;

fn total_pages(total_count: i64, page_size: i64) -> i64 {
    if page_size > 0 {
        (total_count + page_size - 1) / page_size
    } else {
        0
    }
}

// =============================================================================
// Students
// =============================================================================

#[derive(Debug, Serialize)]
pub struct FinanceStudentResponse {
    pub finance_student_id: Uuid,
    pub finance_year_id: Uuid,
    pub student_code: String,
    pub student_name: String,
    pub class_title: Option<String>,
    pub total_amount: Decimal,
    pub paid_amount: Decimal,
    pub outstanding_amount: Decimal,
    pub payment_status: String,
    /// `payment_status` with `no_fee` for students who owe nothing.
    pub display_status: DisplayStatus,
    pub updated_utc: DateTime<Utc>,
}

impl From<FinanceStudent> for FinanceStudentResponse {
    fn from(s: FinanceStudent) -> Self {
        Self {
            display_status: display_status(s.total_amount, s.paid_amount),
            finance_student_id: s.finance_student_id,
            finance_year_id: s.finance_year_id,
            student_code: s.student_code,
            student_name: s.student_name,
            class_title: s.class_title,
            total_amount: s.total_amount,
            paid_amount: s.paid_amount,
            outstanding_amount: s.outstanding_amount,
            payment_status: s.payment_status,
            updated_utc: s.updated_utc,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FinanceStudentPage {
    pub students: Vec<FinanceStudentResponse>,
    pub total_count: i64,
    pub page: i64,
    pub page_size: i64,
    pub total_pages: i64,
}

impl FinanceStudentPage {
    pub fn new(students: Vec<FinanceStudent>, total_count: i64, page: i64, page_size: i64) -> Self {
        Self {
            students: students.into_iter().map(FinanceStudentResponse::from).collect(),
            total_count,
            page,
            page_size,
            total_pages: total_pages(total_count, page_size),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PaidTuitionStudentResponse {
    pub finance_student_id: Uuid,
    pub student_code: String,
    pub student_name: String,
    pub class_title: Option<String>,
    pub paid_order_id: Uuid,
    pub paid_order_title: String,
}

impl From<PaidTuitionStudent> for PaidTuitionStudentResponse {
    fn from(s: PaidTuitionStudent) -> Self {
        Self {
            finance_student_id: s.finance_student_id,
            student_code: s.student_code,
            student_name: s.student_name,
            class_title: s.class_title,
            paid_order_id: s.order_id,
            paid_order_title: s.order_title,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StudentOrderItem {
    pub order_student_id: Uuid,
    pub order_id: Uuid,
    pub order_title: String,
    pub order_type: String,
    pub is_active: bool,
    pub data_status: String,
    pub total_amount: Decimal,
    pub paid_amount: Decimal,
    pub outstanding_amount: Decimal,
    pub payment_status: DisplayStatus,
    pub payment_scheme_choice: Option<String>,
    pub tuition_paid_elsewhere: bool,
    pub tuition_paid_elsewhere_order: Option<String>,
    pub milestone_amounts: MilestoneAmounts,
}

impl From<StudentOrderView> for StudentOrderItem {
    fn from(view: StudentOrderView) -> Self {
        let row = view.row;
        Self {
            order_student_id: row.order_student_id,
            order_id: row.order_id,
            order_title: row.order_title,
            order_type: row.order_type,
            is_active: row.is_active,
            data_status: row.data_status,
            total_amount: view.effective_total,
            paid_amount: row.paid_amount,
            outstanding_amount: view.effective_total - row.paid_amount,
            payment_status: view.display_status,
            payment_scheme_choice: row.payment_scheme_choice,
            tuition_paid_elsewhere: row.tuition_paid_elsewhere,
            tuition_paid_elsewhere_order: row.tuition_paid_elsewhere_order,
            milestone_amounts: row.milestone_amounts.0,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StudentOrdersResponse {
    pub student: FinanceStudentResponse,
    pub orders: Vec<StudentOrderItem>,
}

// =============================================================================
// Orders
// =============================================================================

#[derive(Debug, Serialize)]
pub struct OrderStatistics {
    pub total_students: i32,
    pub data_completed_count: i32,
    pub total_collected: Decimal,
    pub total_outstanding: Decimal,
    pub collection_rate: Decimal,
}

#[derive(Debug, Serialize)]
pub struct OrderResponse {
    pub order_id: Uuid,
    pub finance_year_id: Uuid,
    pub title: String,
    pub order_type: String,
    pub status: String,
    pub is_active: bool,
    pub description: Option<String>,
    pub debit_note_form_code: String,
    pub can_add_students: bool,
    pub can_import_data: bool,
    pub statistics: OrderStatistics,
    pub created_utc: DateTime<Utc>,
    pub updated_utc: DateTime<Utc>,
}

impl From<&FinanceOrder> for OrderResponse {
    fn from(o: &FinanceOrder) -> Self {
        Self {
            order_id: o.order_id,
            finance_year_id: o.finance_year_id,
            title: o.title.clone(),
            order_type: o.order_type.clone(),
            status: o.status.clone(),
            is_active: o.is_active,
            description: o.description.clone(),
            debit_note_form_code: o.debit_note_form_code.clone(),
            can_add_students: o.can_add_students(),
            can_import_data: o.can_import_data(),
            statistics: OrderStatistics {
                total_students: o.total_students,
                data_completed_count: o.data_completed_count,
                total_collected: o.total_collected,
                total_outstanding: o.total_outstanding,
                collection_rate: o.collection_rate,
            },
            created_utc: o.created_utc,
            updated_utc: o.updated_utc,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MilestoneResponse {
    pub milestone_key: MilestoneKey,
    pub payment_scheme: PaymentScheme,
    pub milestone_number: u32,
    pub title: String,
    pub deadline_date: Option<NaiveDate>,
}

impl From<&Milestone> for MilestoneResponse {
    fn from(m: &Milestone) -> Self {
        let key = m.key();
        Self {
            milestone_key: key,
            payment_scheme: key.scheme,
            milestone_number: key.number,
            title: m.title.clone(),
            deadline_date: m.deadline_date,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FeeLineResponse {
    pub line_number: String,
    pub line_type: String,
    pub title_en: String,
    pub title_vn: Option<String>,
    pub is_compulsory: bool,
    pub is_deduction: bool,
    pub formula: Option<String>,
    pub note: Option<String>,
    pub sort_order: i32,
}

impl From<&OrderFeeLine> for FeeLineResponse {
    fn from(l: &OrderFeeLine) -> Self {
        Self {
            line_number: l.line_number.clone(),
            line_type: l.line_type.clone(),
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

#[derive(Debug, Serialize)]
pub struct OrderStructureResponse {
    pub order: OrderResponse,
    pub milestones: Vec<MilestoneResponse>,
    pub fee_lines: Vec<FeeLineResponse>,
}

impl From<&OrderStructure> for OrderStructureResponse {
    fn from(s: &OrderStructure) -> Self {
        Self {
            order: OrderResponse::from(&s.order),
            milestones: s.milestones.iter().map(MilestoneResponse::from).collect(),
            fee_lines: s.fee_lines.iter().map(FeeLineResponse::from).collect(),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct OrderStudentResponse {
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
    pub milestone_amounts: MilestoneAmounts,
    pub tuition_paid_elsewhere: bool,
    pub tuition_paid_elsewhere_order: Option<String>,
    pub notes: Option<String>,
    pub updated_utc: DateTime<Utc>,
}

impl From<OrderStudent> for OrderStudentResponse {
    fn from(s: OrderStudent) -> Self {
        Self {
            order_student_id: s.order_student_id,
            order_id: s.order_id,
            finance_student_id: s.finance_student_id,
            student_code: s.student_code,
            student_name: s.student_name,
            class_title: s.class_title,
            data_status: s.data_status,
            total_amount: s.total_amount,
            paid_amount: s.paid_amount,
            outstanding_amount: s.outstanding_amount,
            payment_status: s.payment_status,
            payment_scheme_choice: s.payment_scheme_choice,
            current_milestone_key: s.current_milestone_key,
            semester_1_paid: s.semester_1_paid,
            semester_2_paid: s.semester_2_paid,
            milestone_amounts: s.milestone_amounts.0,
            tuition_paid_elsewhere: s.tuition_paid_elsewhere,
            tuition_paid_elsewhere_order: s.tuition_paid_elsewhere_order,
            notes: s.notes,
            updated_utc: s.updated_utc,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct OrderStudentPage {
    pub students: Vec<OrderStudentResponse>,
    pub total_count: i64,
    pub page: i64,
    pub page_size: i64,
    pub total_pages: i64,
}

impl OrderStudentPage {
    pub fn new(students: Vec<OrderStudent>, total_count: i64, page: i64, page_size: i64) -> Self {
        Self {
            students: students.into_iter().map(OrderStudentResponse::from).collect(),
            total_count,
            page,
            page_size,
            total_pages: total_pages(total_count, page_size),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct EnrollmentResponse {
    pub added_count: usize,
    pub skipped_count: usize,
    pub skipped_paid_count: usize,
    pub error_count: usize,
    pub errors: Vec<RowError>,
    pub order: Option<OrderResponse>,
}

impl From<EnrollmentReport> for EnrollmentResponse {
    fn from(r: EnrollmentReport) -> Self {
        Self {
            added_count: r.added_count,
            skipped_count: r.skipped_count,
            skipped_paid_count: r.skipped_paid_count,
            error_count: r.errors.len(),
            errors: r.errors,
            order: r.order.as_ref().map(OrderResponse::from),
        }
    }
}

/// Response of an import or a recalculation.
#[derive(Debug, Serialize)]
pub struct BatchResponse {
    pub total_rows: usize,
    pub success_count: usize,
    pub error_count: usize,
    pub errors: Vec<RowError>,
    pub formula_warnings: Vec<String>,
    pub cascade_failures: usize,
    pub order: Option<OrderResponse>,
}

impl From<BatchReport> for BatchResponse {
    fn from(r: BatchReport) -> Self {
        Self {
            total_rows: r.total_rows,
            success_count: r.success_count,
            error_count: r.error_count,
            errors: r.errors,
            formula_warnings: r.formula_warnings,
            cascade_failures: r.cascade_failures,
            order: r.order.as_ref().map(OrderResponse::from),
        }
    }
}

#[derive(Debug, Serialize)]
pub struct StructureUpdateResponse {
    pub structure: OrderStructureResponse,
    /// Absent when the order had no students to recalculate.
    pub recalculation: Option<BatchResponse>,
}

#[derive(Debug, Serialize)]
pub struct FeeTemplateResponse {
    pub order_id: Uuid,
    pub file_name: String,
    pub content_type: &'static str,
    pub content: String,
}

// =============================================================================
// Payments
// =============================================================================

#[derive(Debug, Serialize)]
pub struct PaymentResponse {
    pub order_student: OrderStudentResponse,
    pub finance_student_updated: bool,
    pub finance_student_summary: Option<StudentSummary>,
    pub flagged_order_students: Vec<Uuid>,
}

impl From<StudentUpdate> for PaymentResponse {
    fn from(u: StudentUpdate) -> Self {
        Self {
            order_student: OrderStudentResponse::from(u.student),
            finance_student_updated: u.finance_student_updated,
            finance_student_summary: u.summary,
            flagged_order_students: u.flagged_order_students,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MilestonePaymentResponse {
    #[serde(flatten)]
    pub payment: PaymentResponse,
    pub milestone_key: MilestoneKey,
    pub expected_amount: Decimal,
    pub received_amount: Decimal,
}

impl From<MilestonePaymentOutcome> for MilestonePaymentResponse {
    fn from(o: MilestonePaymentOutcome) -> Self {
        Self {
            payment: PaymentResponse::from(o.update),
            milestone_key: o.applied.key,
            expected_amount: o.applied.expected_amount,
            received_amount: o.applied.received_amount,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct PaymentHistoryItem {
    pub payment_id: Uuid,
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

impl From<PaymentRecord> for PaymentHistoryItem {
    fn from(p: PaymentRecord) -> Self {
        Self {
            payment_id: p.payment_id,
            kind: p.kind,
            milestone_key: p.milestone_key,
            expected_amount: p.expected_amount,
            received_amount: p.received_amount,
            applied_paid_amount: p.applied_paid_amount,
            payment_status: p.payment_status,
            recorded_by: p.recorded_by,
            notes: p.notes,
            created_utc: p.created_utc,
        }
    }
}

// =============================================================================
// Debit Note
// =============================================================================

#[derive(Debug, Serialize)]
pub struct DebitNoteMilestone {
    pub milestone_key: MilestoneKey,
    pub title: String,
    pub deadline_date: Option<NaiveDate>,
    pub amount: Decimal,
    pub is_current: bool,
}

#[derive(Debug, Default, Serialize)]
pub struct DebitNoteMilestones {
    pub yearly: Vec<DebitNoteMilestone>,
    pub semester: Vec<DebitNoteMilestone>,
}

#[derive(Debug, Serialize)]
pub struct DebitNoteLine {
    pub line_number: String,
    pub line_type: String,
    pub title_en: String,
    pub title_vn: Option<String>,
    pub is_compulsory: bool,
    pub is_deduction: bool,
    pub is_calculated: bool,
    pub note: Option<String>,
    pub amounts: MilestoneAmounts,
    /// Amount for the selected milestone; `None` for category rows.
    pub selected_amount: Option<Decimal>,
}

#[derive(Debug, Serialize)]
pub struct DebitNoteSummary {
    pub total_amount: Decimal,
    pub paid_amount: Decimal,
    pub outstanding_amount: Decimal,
    pub payment_status: String,
    pub payment_scheme_choice: Option<String>,
    pub current_milestone_key: Option<String>,
    pub semester_1_paid: Decimal,
    pub semester_2_paid: Decimal,
    pub tuition_paid_elsewhere: bool,
    pub tuition_paid_elsewhere_order: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct DebitNotePreview {
    pub order_student_id: Uuid,
    pub order_id: Uuid,
    pub order_title: String,
    pub debit_note_form_code: String,
    pub student_code: String,
    pub student_name: String,
    pub class_title: Option<String>,
    pub selected_milestone: Option<MilestoneKey>,
    pub milestones: DebitNoteMilestones,
    pub fee_lines: Vec<DebitNoteLine>,
    pub payment_summary: DebitNoteSummary,
    pub notes: Option<String>,
    pub payments: Vec<PaymentHistoryItem>,
}

impl From<DebitNoteData> for DebitNotePreview {
    fn from(data: DebitNoteData) -> Self {
        let DebitNoteData {
            student,
            structure,
            lines,
            payments,
            selected_milestone,
        } = data;

        let student_amounts = &student.milestone_amounts.0;
        let mut milestones = DebitNoteMilestones::default();
        for m in &structure.milestones {
            let key = m.key();
            let item = DebitNoteMilestone {
                milestone_key: key,
                title: m.title.clone(),
                deadline_date: m.deadline_date,
                amount: student_amounts.amount_or_zero(&key),
                is_current: selected_milestone == Some(key),
            };
            match key.scheme {
                PaymentScheme::Yearly => milestones.yearly.push(item),
                PaymentScheme::Semester => milestones.semester.push(item),
            }
        }

        let mut stored: HashMap<String, (MilestoneAmounts, bool)> = lines
            .into_iter()
            .map(|l| (l.line_number, (l.amounts.0, l.is_calculated)))
            .collect();
        let fee_lines = structure
            .fee_lines
            .iter()
            .map(|definition| {
                let line_type = definition.parsed_type();
                let (amounts, is_calculated) = stored
                    .remove(&definition.line_number)
                    .unwrap_or_else(|| (MilestoneAmounts::new(), definition.formula().is_some()));
                let selected_amount = match selected_milestone {
                    Some(key) if line_type.accepts_amounts() => Some(amounts.amount_or_zero(&key)),
                    _ => None,
                };
                DebitNoteLine {
                    line_number: definition.line_number.clone(),
                    line_type: line_type.as_str().to_string(),
                    title_en: definition.title_en.clone(),
                    title_vn: definition.title_vn.clone(),
                    is_compulsory: definition.is_compulsory,
                    is_deduction: definition.is_deduction,
                    is_calculated,
                    note: definition.note.clone(),
                    amounts,
                    selected_amount,
                }
            })
            .collect();

        Self {
            order_student_id: student.order_student_id,
            order_id: structure.order.order_id,
            order_title: structure.order.title.clone(),
            debit_note_form_code: structure.order.debit_note_form_code.clone(),
            student_code: student.student_code.clone(),
            student_name: student.student_name.clone(),
            class_title: student.class_title.clone(),
            selected_milestone,
            milestones,
            fee_lines,
            payment_summary: DebitNoteSummary {
                total_amount: student.total_amount,
                paid_amount: student.paid_amount,
                outstanding_amount: student.outstanding_amount,
                payment_status: student.payment_status.clone(),
                payment_scheme_choice: student.payment_scheme_choice.clone(),
                current_milestone_key: student.current_milestone_key.clone(),
                semester_1_paid: student.semester_1_paid,
                semester_2_paid: student.semester_2_paid,
                tuition_paid_elsewhere: student.tuition_paid_elsewhere,
                tuition_paid_elsewhere_order: student.tuition_paid_elsewhere_order.clone(),
            },
            notes: student.notes.clone(),
            payments: payments.into_iter().map(PaymentHistoryItem::from).collect(),
        }
    }
}
