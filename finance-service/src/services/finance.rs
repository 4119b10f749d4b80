//! Finance operations: runs the pure engine inside database transactions.
//!
//! Every order-student mutation locks the owning finance student first and
//! then the order student, so concurrent payments for one student serialize.
//! The finance-student cascade runs in a savepoint; its failure is reported
//! as `finance_student_updated = false` and the mutation still commits.

use crate::config::FinanceSettings;
use crate::engine::{
    apply_direct_payment, apply_milestone_payment, display_status, evaluate_fee_lines,
    flags_other_tuition_orders, resolve, AppliedMilestone, DisplayStatus, Formula, FormulaFailure,
    PaymentError, PaymentState, StudentSummary,
};
use crate::models::{
    FeeLine, FinanceOrder, FinanceStudent, LineType, MilestoneKey, NewFeeLine, NewMilestone,
    NewOrder, OrderStructure, OrderStudent, PaidTuitionStudent, PaymentKind, PaymentRecord,
    StructureUpdate, StudentFeeLine, StudentOrderRow,
};
use crate::services::database::{Database, NewPayment, OrderStudentFilter};
use crate::services::fee_sheet::{self, FeeSheetRow};
use crate::services::metrics;
use chrono::Utc;
use rust_decimal::Decimal;
use service_core::error::AppError;
use service_core::response::FieldErrors;
use sqlx::postgres::PgConnection;
use sqlx::types::Json;
use sqlx::Connection;
use std::collections::HashSet;
use std::sync::Arc;
use tracing::{error, info, instrument, warn};
use uuid::Uuid;

/// Per-row failures reported by batch operations are capped at this many.
pub const MAX_REPORTED_ERRORS: usize = 20;

/// Result of persisting one order-student mutation.
#[derive(Debug, Clone)]
pub struct StudentUpdate {
    pub student: OrderStudent,
    pub finance_student_updated: bool,
    pub summary: Option<StudentSummary>,
    pub flagged_order_students: Vec<Uuid>,
}

#[derive(Debug, Clone)]
pub struct MilestonePaymentOutcome {
    pub update: StudentUpdate,
    pub applied: AppliedMilestone,
}

#[derive(Debug, Clone, serde::Serialize)]
pub struct RowError {
    pub row: Option<usize>,
    pub student_code: Option<String>,
    pub error: String,
}

#[derive(Debug, Clone)]
pub struct EnrollmentReport {
    pub added_count: usize,
    pub skipped_count: usize,
    pub skipped_paid_count: usize,
    pub errors: Vec<RowError>,
    pub order: Option<FinanceOrder>,
}

/// Outcome of an import or a recalculation over many order students.
#[derive(Debug, Clone, Default)]
pub struct BatchReport {
    pub total_rows: usize,
    pub success_count: usize,
    pub error_count: usize,
    pub errors: Vec<RowError>,
    pub formula_warnings: Vec<String>,
    pub cascade_failures: usize,
    pub order: Option<FinanceOrder>,
}

impl BatchReport {
    fn push_error(&mut self, error: RowError) {
        self.error_count += 1;
        if self.errors.len() < MAX_REPORTED_ERRORS {
            self.errors.push(error);
        }
    }

    fn push_warnings(&mut self, failures: &[FormulaFailure], student_code: &str) {
        for failure in failures {
            if self.formula_warnings.len() >= MAX_REPORTED_ERRORS {
                return;
            }
            self.formula_warnings.push(format!("{student_code}: {failure}"));
        }
    }
}

/// One order of a finance student as shown on read paths.
#[derive(Debug, Clone)]
pub struct StudentOrderView {
    pub row: StudentOrderRow,
    pub effective_total: Decimal,
    pub display_status: DisplayStatus,
}

/// Everything a debit note needs for one order student.
#[derive(Debug, Clone)]
pub struct DebitNoteData {
    pub student: OrderStudent,
    pub structure: OrderStructure,
    pub lines: Vec<StudentFeeLine>,
    pub payments: Vec<PaymentRecord>,
    pub selected_milestone: Option<MilestoneKey>,
}

fn payment_error(err: PaymentError) -> AppError {
    AppError::field(err.field(), err.to_string())
}

fn row_error(row: Option<usize>, student_code: Option<&str>, err: &AppError) -> RowError {
    let error = match err {
        AppError::FieldError { message, .. } => message.clone(),
        AppError::BadRequest(e) | AppError::NotFound(e) | AppError::Conflict(e) => e.to_string(),
        other => other.to_string(),
    };
    RowError {
        row,
        student_code: student_code.map(str::to_string),
        error,
    }
}

/// The order as it would look after `update`, for validation.
fn merged_structure(current: &OrderStructure, update: &StructureUpdate) -> NewOrder {
    let order = &current.order;
    NewOrder {
        finance_year_id: order.finance_year_id,
        title: order.title.clone(),
        order_type: order.parsed_type(),
        is_active: order.is_active,
        description: order.description.clone(),
        debit_note_form_code: order.debit_note_form_code.clone(),
        milestones: update
            .milestones
            .clone()
            .unwrap_or_else(|| current.milestones.iter().map(NewMilestone::from).collect()),
        fee_lines: update
            .fee_lines
            .clone()
            .unwrap_or_else(|| current.fee_lines.iter().map(NewFeeLine::from).collect()),
    }
}

/// Definition-time checks for a new order: unique milestones and line
/// numbers, and formulas that parse. References to lines that do not exist
/// are left to the evaluation mode.
pub fn validate_structure(order: &NewOrder) -> Result<(), AppError> {
    let mut errors = FieldErrors::new();
    let mut push = |field: &str, message: String| {
        errors.entry(field.to_string()).or_default().push(message);
    };

    if order.title.trim().is_empty() {
        push("title", "Title is required".into());
    }
    if order.milestones.is_empty() {
        push("milestones", "At least one milestone is required".into());
    }

    let mut keys = HashSet::new();
    for m in &order.milestones {
        if !keys.insert(m.key) {
            push("milestones", format!("Milestone {} is defined more than once", m.key));
        }
    }

    let mut line_numbers = HashSet::new();
    for line in &order.fee_lines {
        let number = line.line_number.trim();
        if number.is_empty() || !number.chars().all(|c| c.is_ascii_alphanumeric() || c == '.' || c == '_') {
            push(
                "fee_lines",
                format!("Line number '{}' may only contain letters, digits, '.' and '_'", line.line_number),
            );
        }
        if !line_numbers.insert(number) {
            push("fee_lines", format!("Line number {} is used more than once", number));
        }
    }

    for line in &order.fee_lines {
        let Some(source) = line.formula.as_deref().map(str::trim).filter(|f| !f.is_empty()) else {
            continue;
        };
        if line.line_type == LineType::Category {
            push("fee_lines", format!("Line {}: category lines cannot have a formula", line.line_number));
            continue;
        }
        if let Err(e) = Formula::parse(source) {
            push("fee_lines", format!("Line {}: {}", line.line_number, e));
        }
    }

    if errors.is_empty() {
        return Ok(());
    }
    let message = errors
        .values()
        .flatten()
        .next()
        .cloned()
        .unwrap_or_else(|| "Invalid order structure".to_string());
    Err(AppError::FieldError { message, errors })
}

pub struct FinanceService {
    db: Arc<Database>,
    settings: FinanceSettings,
}

impl FinanceService {
    pub fn new(db: Arc<Database>, settings: FinanceSettings) -> Self {
        Self { db, settings }
    }

    pub fn settings(&self) -> &FinanceSettings {
        &self.settings
    }

    // =========================================================================
    // Students and Orders
    // =========================================================================

    pub async fn create_finance_student(
        &self,
        finance_year_id: Uuid,
        student_code: &str,
        student_name: &str,
        class_title: Option<&str>,
    ) -> Result<FinanceStudent, AppError> {
        self.db
            .create_finance_student(finance_year_id, student_code.trim(), student_name.trim(), class_title)
            .await
    }

    pub async fn create_order(&self, new_order: &NewOrder) -> Result<OrderStructure, AppError> {
        validate_structure(new_order)?;
        self.db.create_order_with_structure(new_order).await
    }

    /// Replaces milestones and/or fee lines, then recalculates every student
    /// of the order against the new structure. The recalculation report is
    /// `None` when the order has no students.
    #[instrument(skip(self, update), fields(order_id = %update.order_id))]
    pub async fn update_order_structure(
        &self,
        update: &StructureUpdate,
    ) -> Result<(OrderStructure, Option<BatchReport>), AppError> {
        if update.milestones.is_none() && update.fee_lines.is_none() {
            return Err(AppError::field(
                "milestones",
                "Provide milestones or fee_lines to update",
            ));
        }

        let current = self.order_structure(update.order_id).await?;
        if !current.order.can_edit_structure() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "The structure of an order with status {} cannot be changed",
                current.order.status
            )));
        }
        validate_structure(&merged_structure(&current, update))?;

        let structure = self.db.replace_order_structure(update).await?;
        if structure.order.total_students == 0 {
            return Ok((structure, None));
        }

        let report = self.recalculate_order(update.order_id).await?;
        let structure = self.order_structure(update.order_id).await?;
        Ok((structure, Some(report)))
    }

    pub async fn order_structure(&self, order_id: Uuid) -> Result<OrderStructure, AppError> {
        self.db
            .load_order_structure(order_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Order {} not found", order_id)))
    }

    pub async fn order_students(
        &self,
        order_id: Uuid,
        filter: &OrderStudentFilter,
    ) -> Result<(Vec<OrderStudent>, i64), AppError> {
        self.order_structure(order_id).await?;
        self.db.list_order_students(order_id, filter).await
    }

    pub async fn finance_students(
        &self,
        finance_year_id: Uuid,
        search: Option<&str>,
        page: i64,
        page_size: i64,
    ) -> Result<(Vec<FinanceStudent>, i64), AppError> {
        self.db
            .list_finance_students(finance_year_id, search, page, page_size)
            .await
    }

    pub async fn unpaid_students(&self, order_id: Uuid) -> Result<Vec<OrderStudent>, AppError> {
        self.order_structure(order_id).await?;
        self.db.list_unpaid_students(order_id).await
    }

    pub async fn paid_tuition_students(
        &self,
        finance_year_id: Uuid,
        exclude_order_id: Option<Uuid>,
    ) -> Result<Vec<PaidTuitionStudent>, AppError> {
        self.db.list_paid_tuition_students(finance_year_id, exclude_order_id).await
    }

    /// A student's orders with the read-side `no_fee` status. A stored total
    /// of zero falls back to the total line's `yearly_1`, then `semester_1`.
    pub async fn student_orders(
        &self,
        finance_student_id: Uuid,
    ) -> Result<(FinanceStudent, Vec<StudentOrderView>), AppError> {
        let student = self.db.get_finance_student(finance_student_id).await?.ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("Finance student {} not found", finance_student_id))
        })?;

        let mut views = Vec::new();
        for row in self.db.list_student_orders(finance_student_id).await? {
            let mut effective_total = row.total_amount;
            if effective_total.is_zero() {
                if let Some(amounts) = self.db.total_line_amounts(row.order_student_id).await? {
                    effective_total = amounts
                        .get(&MilestoneKey::yearly(1))
                        .or_else(|| amounts.get(&MilestoneKey::semester(1)))
                        .unwrap_or(Decimal::ZERO);
                }
            }
            views.push(StudentOrderView {
                display_status: display_status(effective_total, row.paid_amount),
                effective_total,
                row,
            });
        }

        Ok((student, views))
    }

    // =========================================================================
    // Enrollment
    // =========================================================================

    /// Adds finance students to an order. Students already in the order are
    /// skipped; for tuition orders with `exclude_paid_tuition`, so are
    /// students with a paid row in another tuition order of the same year.
    /// Each student commits on its own.
    #[instrument(skip(self, student_ids), fields(requested = student_ids.len()))]
    pub async fn add_students(
        &self,
        order_id: Uuid,
        student_ids: &[Uuid],
        exclude_paid_tuition: bool,
    ) -> Result<EnrollmentReport, AppError> {
        let structure = self.order_structure(order_id).await?;
        let order = &structure.order;
        if !order.can_add_students() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Students cannot be added to an order with status {}",
                order.status
            )));
        }

        let mut enrolled = self.db.enrolled_student_ids(order_id).await?;
        let paid_elsewhere: HashSet<Uuid> = if order.is_tuition() && exclude_paid_tuition {
            self.db
                .list_paid_tuition_students(order.finance_year_id, Some(order_id))
                .await?
                .into_iter()
                .map(|s| s.finance_student_id)
                .collect()
        } else {
            HashSet::new()
        };

        let mut report = EnrollmentReport {
            added_count: 0,
            skipped_count: 0,
            skipped_paid_count: 0,
            errors: Vec::new(),
            order: None,
        };

        for &finance_student_id in student_ids {
            if enrolled.contains(&finance_student_id) {
                report.skipped_count += 1;
                continue;
            }
            if paid_elsewhere.contains(&finance_student_id) {
                report.skipped_paid_count += 1;
                continue;
            }

            match self.enroll_one(&structure, finance_student_id).await {
                Ok(student) => {
                    enrolled.insert(finance_student_id);
                    report.added_count += 1;
                    info!(order_student_id = %student.order_student_id, student_code = %student.student_code, "Student added to order");
                }
                Err(e) => {
                    warn!(finance_student_id = %finance_student_id, error = %e, "Failed to add student to order");
                    if report.errors.len() < MAX_REPORTED_ERRORS {
                        report.errors.push(row_error(None, Some(&finance_student_id.to_string()), &e));
                    }
                }
            }
        }

        report.order = Some(self.db.refresh_order_statistics(order_id).await?);
        info!(
            order_id = %order_id,
            added = report.added_count,
            skipped = report.skipped_count,
            skipped_paid = report.skipped_paid_count,
            "Enrollment finished"
        );
        Ok(report)
    }

    async fn enroll_one(&self, structure: &OrderStructure, finance_student_id: Uuid) -> Result<OrderStudent, AppError> {
        let student = self.db.get_finance_student(finance_student_id).await?.ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("Finance student {} not found", finance_student_id))
        })?;
        if student.finance_year_id != structure.order.finance_year_id {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Student {} belongs to a different finance year",
                student.student_code
            )));
        }

        let mut tx = self.db.begin().await?;
        let order_student = Database::insert_order_student(&mut tx, structure, &student).await?;
        tx.commit()
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to commit enrollment: {}", e)))?;
        Ok(order_student)
    }

    // =========================================================================
    // Payments
    // =========================================================================

    /// Sets an absolute paid amount on an order student.
    #[instrument(skip(self, notes))]
    pub async fn update_payment(
        &self,
        order_student_id: Uuid,
        paid_amount: Decimal,
        notes: Option<&str>,
        recorded_by: Option<&str>,
    ) -> Result<StudentUpdate, AppError> {
        let mut tx = self.db.begin().await?;
        let (mut student, order) = lock_for_update(&mut tx, order_student_id).await?;

        let mut state = PaymentState::from_student(&student);
        apply_direct_payment(&mut state, paid_amount).map_err(payment_error)?;
        state.apply_to(&mut student);
        if let Some(text) = notes {
            student.append_note(Utc::now(), text);
        }

        Database::insert_payment(
            &mut tx,
            &NewPayment {
                order_student_id,
                kind: PaymentKind::Direct,
                milestone_key: None,
                expected_amount: None,
                received_amount: paid_amount,
                applied_paid_amount: state.paid_amount,
                payment_status: state.payment_status,
                recorded_by,
                notes,
            },
        )
        .await?;

        let update = finish_update(&mut tx, &order, student, true).await?;
        tx.commit()
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to commit payment: {}", e)))?;

        metrics::record_payment(PaymentKind::Direct.as_str(), state.payment_status.as_str());
        info!(
            order_student_id = %order_student_id,
            paid_amount = %state.paid_amount,
            payment_status = state.payment_status.as_str(),
            finance_student_updated = update.finance_student_updated,
            "Payment updated"
        );
        self.refresh_statistics_quietly(order.order_id).await;
        Ok(update)
    }

    /// Records a payment against one milestone of an order student.
    #[instrument(skip(self, notes), fields(milestone_key = %key))]
    pub async fn record_milestone_payment(
        &self,
        order_student_id: Uuid,
        key: MilestoneKey,
        amount: Decimal,
        notes: Option<&str>,
        recorded_by: Option<&str>,
    ) -> Result<MilestonePaymentOutcome, AppError> {
        let mut tx = self.db.begin().await?;
        let (mut student, order) = lock_for_update(&mut tx, order_student_id).await?;

        let mut state = PaymentState::from_student(&student);
        let applied = apply_milestone_payment(
            &mut state,
            &student.milestone_amounts.0,
            key,
            amount,
            self.settings.payment_tolerance,
        )
        .map_err(payment_error)?;
        state.apply_to(&mut student);
        if let Some(text) = notes {
            student.append_note(Utc::now(), text);
        }

        Database::insert_payment(
            &mut tx,
            &NewPayment {
                order_student_id,
                kind: PaymentKind::Milestone,
                milestone_key: Some(key.to_string()),
                expected_amount: Some(applied.expected_amount),
                received_amount: amount,
                applied_paid_amount: state.paid_amount,
                payment_status: state.payment_status,
                recorded_by,
                notes,
            },
        )
        .await?;

        let update = finish_update(&mut tx, &order, student, true).await?;
        tx.commit()
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to commit payment: {}", e)))?;

        metrics::record_payment(PaymentKind::Milestone.as_str(), state.payment_status.as_str());
        info!(
            order_student_id = %order_student_id,
            expected_amount = %applied.expected_amount,
            received_amount = %amount,
            payment_status = state.payment_status.as_str(),
            flagged = update.flagged_order_students.len(),
            "Milestone payment recorded"
        );
        self.refresh_statistics_quietly(order.order_id).await;
        Ok(MilestonePaymentOutcome { update, applied })
    }

    // =========================================================================
    // Import and Recalculation
    // =========================================================================

    /// Imports fee amounts from a CSV sheet. Rows are matched by student
    /// code and committed one by one; failures are reported per row.
    #[instrument(skip(self, file), fields(bytes = file.len()))]
    pub async fn import_fee_data(&self, order_id: Uuid, file: &[u8]) -> Result<BatchReport, AppError> {
        let structure = self.order_structure(order_id).await?;
        if !structure.order.can_import_data() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "Fee data cannot be imported into an order with status {} and {} students",
                structure.order.status,
                structure.order.total_students
            )));
        }
        let sheet = fee_sheet::parse_sheet(file)?;

        let mut report = BatchReport {
            total_rows: sheet.rows.len(),
            ..BatchReport::default()
        };

        for row in &sheet.rows {
            match self.import_row(&structure, row).await {
                Ok((failures, cascaded)) => {
                    report.success_count += 1;
                    report.push_warnings(&failures, &row.student_code);
                    if !cascaded {
                        report.cascade_failures += 1;
                    }
                    metrics::record_import_row("imported");
                }
                Err(e) => {
                    warn!(row = row.row_number, student_code = %row.student_code, error = %e, "Fee data row rejected");
                    metrics::record_import_row("failed");
                    report.push_error(row_error(Some(row.row_number), Some(&row.student_code), &e));
                }
            }
        }

        report.order = Some(self.db.refresh_order_statistics(order_id).await?);
        info!(
            order_id = %order_id,
            total_rows = report.total_rows,
            success_count = report.success_count,
            error_count = report.error_count,
            "Fee data import finished"
        );
        Ok(report)
    }

    async fn import_row(
        &self,
        structure: &OrderStructure,
        row: &FeeSheetRow,
    ) -> Result<(Vec<FormulaFailure>, bool), AppError> {
        let mut tx = self.db.begin().await?;
        let order_student_id =
            Database::find_order_student_by_code(&mut tx, structure.order.order_id, &row.student_code)
                .await?
                .ok_or_else(|| {
                    AppError::NotFound(anyhow::anyhow!(
                        "Student code {} is not in this order",
                        row.student_code
                    ))
                })?;

        let (mut student, order) = lock_for_update(&mut tx, order_student_id).await?;
        let failures = self.recalculate_student(&mut tx, structure, &mut student, Some(row)).await?;
        let update = finish_update(&mut tx, &order, student, false).await?;
        tx.commit()
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to commit import row: {}", e)))?;

        Ok((failures, update.finance_student_updated))
    }

    /// Re-runs formula evaluation and total resolution for every student of
    /// an order.
    #[instrument(skip(self))]
    pub async fn recalculate_order(&self, order_id: Uuid) -> Result<BatchReport, AppError> {
        let structure = self.order_structure(order_id).await?;
        let students = self.db.list_all_order_students(order_id).await?;

        let mut report = BatchReport {
            total_rows: students.len(),
            ..BatchReport::default()
        };

        for listed in &students {
            let result: Result<(Vec<FormulaFailure>, bool), AppError> = async {
                let mut tx = self.db.begin().await?;
                let (mut student, order) = lock_for_update(&mut tx, listed.order_student_id).await?;
                let failures = self.recalculate_student(&mut tx, &structure, &mut student, None).await?;
                let update = finish_update(&mut tx, &order, student, false).await?;
                tx.commit().await.map_err(|e| {
                    AppError::DatabaseError(anyhow::anyhow!("Failed to commit recalculation: {}", e))
                })?;
                Ok((failures, update.finance_student_updated))
            }
            .await;

            match result {
                Ok((failures, cascaded)) => {
                    report.success_count += 1;
                    report.push_warnings(&failures, &listed.student_code);
                    if !cascaded {
                        report.cascade_failures += 1;
                    }
                }
                Err(e) => {
                    warn!(order_student_id = %listed.order_student_id, error = %e, "Recalculation failed");
                    report.push_error(row_error(None, Some(&listed.student_code), &e));
                }
            }
        }

        report.order = Some(self.db.refresh_order_statistics(order_id).await?);
        info!(
            order_id = %order_id,
            updated = report.success_count,
            failed = report.error_count,
            "Order totals recalculated"
        );
        Ok(report)
    }

    /// Applies imported amounts (when given), evaluates formulas, resolves
    /// the total and writes the lines back. The order student row itself is
    /// saved by [`finish_update`].
    async fn recalculate_student(
        &self,
        conn: &mut PgConnection,
        structure: &OrderStructure,
        student: &mut OrderStudent,
        row: Option<&FeeSheetRow>,
    ) -> Result<Vec<FormulaFailure>, AppError> {
        let keys = structure.milestone_keys();
        let stored = Database::list_student_lines(conn, student.order_student_id).await?;
        let mut lines = FeeLine::assemble(&structure.fee_lines, &stored);
        for line in lines.iter_mut().filter(|l| !l.has_formula()) {
            line.amounts.retain_keys(&keys);
        }

        if let Some(row) = row {
            for line in lines
                .iter_mut()
                .filter(|l| !l.has_formula() && l.line_type.accepts_amounts())
            {
                let amounts = row
                    .line_amounts(&line.line_number, &keys)
                    .map_err(|e| AppError::BadRequest(anyhow::anyhow!(e)))?;
                if let Some(amounts) = amounts {
                    line.amounts = amounts;
                    line.is_calculated = false;
                }
            }
            if let Some(note) = &row.note {
                student.notes = Some(note.clone());
            }
        }

        let mode = self.settings.formula_mode;
        let failures = evaluate_fee_lines(&mut lines, &keys, mode).map_err(|failure| {
            metrics::record_formula_failures(mode.as_str(), 1);
            AppError::field("formula", failure.to_string())
        })?;
        if !failures.is_empty() {
            metrics::record_formula_failures(mode.as_str(), failures.len());
            for failure in &failures {
                warn!(
                    order_student_id = %student.order_student_id,
                    line_number = %failure.line_number,
                    milestone_key = ?failure.key.map(|k| k.to_string()),
                    error = %failure.error,
                    "Formula evaluation failed; amount set to 0"
                );
            }
        }

        let resolution = resolve(&lines);
        let mut state = PaymentState::from_student(student);
        state.apply_resolution(&resolution);
        state.apply_to(student);
        student.data_status = resolution.data_status.as_str().to_string();
        student.milestone_amounts = Json(resolution.milestone_amounts);

        Database::save_student_lines(conn, student.order_student_id, &lines).await?;
        Ok(failures)
    }

    // =========================================================================
    // Debit Notes and Templates
    // =========================================================================

    pub async fn debit_note(
        &self,
        order_student_id: Uuid,
        milestone_key: Option<MilestoneKey>,
    ) -> Result<DebitNoteData, AppError> {
        let student = self.db.get_order_student(order_student_id).await?.ok_or_else(|| {
            AppError::NotFound(anyhow::anyhow!("Order student {} not found", order_student_id))
        })?;
        let structure = self.order_structure(student.order_id).await?;

        let selected_milestone = match milestone_key {
            Some(key) if !structure.has_milestone(&key) => {
                return Err(AppError::field(
                    "milestone_key",
                    format!("Milestone {} does not exist in this order", key),
                ));
            }
            Some(key) => Some(key),
            None => structure.milestone_keys().first().copied(),
        };

        let lines = self.db.load_student_lines(order_student_id).await?;
        let payments = self.db.list_payments(order_student_id).await?;

        Ok(DebitNoteData {
            student,
            structure,
            lines,
            payments,
            selected_milestone,
        })
    }

    pub async fn fee_template(&self, order_id: Uuid) -> Result<(OrderStructure, Vec<u8>), AppError> {
        let structure = self.order_structure(order_id).await?;
        let students = self.db.list_all_order_students(order_id).await?;
        let csv = fee_sheet::write_template(&structure, &students)?;
        Ok((structure, csv))
    }

    async fn refresh_statistics_quietly(&self, order_id: Uuid) {
        if let Err(e) = self.db.refresh_order_statistics(order_id).await {
            warn!(order_id = %order_id, error = %e, "Failed to refresh order statistics");
        }
    }
}

// =============================================================================
// Transaction helpers
// =============================================================================

/// Locks the finance student, then the order student, and loads the order.
async fn lock_for_update(
    conn: &mut PgConnection,
    order_student_id: Uuid,
) -> Result<(OrderStudent, FinanceOrder), AppError> {
    let not_found = || AppError::NotFound(anyhow::anyhow!("Order student {} not found", order_student_id));

    let owner = Database::order_student_owner(conn, order_student_id)
        .await?
        .ok_or_else(not_found)?;
    Database::lock_finance_student(conn, owner).await?.ok_or_else(|| {
        AppError::NotFound(anyhow::anyhow!("Finance student {} not found", owner))
    })?;
    let student = Database::lock_order_student(conn, order_student_id)
        .await?
        .ok_or_else(not_found)?;
    let order = Database::get_order(conn, student.order_id)
        .await?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Order {} not found", student.order_id)))?;

    Ok((student, order))
}

/// Saves the order student, flags other tuition orders when `flag_tuition`
/// and the status calls for it, and cascades to the finance student.
async fn finish_update(
    conn: &mut PgConnection,
    order: &FinanceOrder,
    student: OrderStudent,
    flag_tuition: bool,
) -> Result<StudentUpdate, AppError> {
    Database::save_order_student(conn, &student).await?;

    let mut flagged = Vec::new();
    if flag_tuition && flags_other_tuition_orders(order.parsed_type(), student.parsed_payment_status()) {
        flagged = Database::flag_tuition_paid_elsewhere(
            conn,
            student.finance_student_id,
            order.finance_year_id,
            order.order_id,
            &order.title,
        )
        .await?;
        if !flagged.is_empty() {
            info!(
                finance_student_id = %student.finance_student_id,
                flagged = flagged.len(),
                paying_order = %order.title,
                "Other tuition orders flagged as paid elsewhere"
            );
        }
    }

    let summary = cascade_in_savepoint(conn, student.finance_student_id).await;

    Ok(StudentUpdate {
        finance_student_updated: summary.is_some(),
        summary,
        flagged_order_students: flagged,
        student,
    })
}

/// Re-sums the finance student inside a savepoint. A failure rolls back
/// only the savepoint and is reported as `None`.
async fn cascade_in_savepoint(conn: &mut PgConnection, finance_student_id: Uuid) -> Option<StudentSummary> {
    let result: Result<StudentSummary, AppError> = async {
        let mut savepoint = conn
            .begin()
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to open savepoint: {}", e)))?;
        let summary = Database::cascade_finance_student(&mut savepoint, finance_student_id).await?;
        savepoint
            .commit()
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to release savepoint: {}", e)))?;
        Ok(summary)
    }
    .await;

    match result {
        Ok(summary) => {
            metrics::record_cascade("updated");
            Some(summary)
        }
        Err(e) => {
            metrics::record_cascade("failed");
            error!(finance_student_id = %finance_student_id, error = %e, "Finance student cascade failed");
            None
        }
    }
}
