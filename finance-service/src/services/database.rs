//! Database service for finance-service.
//!
//! Pool-level reads and writes are methods on [`Database`]. Statements that
//! must run inside a caller's transaction are associated functions taking
//! `&mut PgConnection` (pass `&mut *tx`).

#![allow(clippy::too_many_arguments)]

use crate::engine::{summarize, StudentSummary};
use crate::models::{
    DataStatus, FeeLine, FinanceOrder, FinanceStudent, Milestone, MilestoneAmounts, NewFeeLine,
    NewMilestone, NewOrder, OrderFeeLine, OrderStructure, OrderStudent, PaidTuitionStudent,
    PaymentKind, PaymentRecord, PaymentStatus, StructureUpdate, StudentFeeLine, StudentOrderRow,
};
use crate::services::metrics::DB_QUERY_DURATION;
use rust_decimal::Decimal;
use service_core::error::AppError;
use sqlx::postgres::{PgConnection, PgPool, PgPoolOptions};
use sqlx::types::Json;
use sqlx::{Postgres, Transaction};
use std::collections::HashSet;
use std::time::Duration;
use tracing::{info, instrument};
use uuid::Uuid;

const ORDER_COLUMNS: &str = "order_id, finance_year_id, title, order_type, status, is_active, \
    description, debit_note_form_code, total_students, data_completed_count, total_collected, \
    total_outstanding, collection_rate, created_utc, updated_utc";

const MILESTONE_COLUMNS: &str =
    "milestone_id, order_id, payment_scheme, milestone_number, title, deadline_date, created_utc";

const FEE_LINE_COLUMNS: &str = "fee_line_id, order_id, line_number, line_type, title_en, title_vn, \
    is_compulsory, is_deduction, formula, note, sort_order, created_utc";

const FINANCE_STUDENT_COLUMNS: &str = "finance_student_id, finance_year_id, student_code, \
    student_name, class_title, total_amount, paid_amount, outstanding_amount, payment_status, \
    created_utc, updated_utc";

const ORDER_STUDENT_COLUMNS: &str = "order_student_id, order_id, finance_student_id, student_code, \
    student_name, class_title, data_status, total_amount, paid_amount, outstanding_amount, \
    payment_status, payment_scheme_choice, current_milestone_key, semester_1_paid, \
    semester_2_paid, milestone_amounts, tuition_paid_elsewhere, tuition_paid_elsewhere_order, \
    notes, created_utc, updated_utc";

const PAYMENT_COLUMNS: &str = "payment_id, order_student_id, kind, milestone_key, expected_amount, \
    received_amount, applied_paid_amount, payment_status, recorded_by, notes, created_utc";

fn db_error(context: &'static str) -> impl FnOnce(sqlx::Error) -> AppError {
    move |e| AppError::DatabaseError(anyhow::anyhow!("{}: {}", context, e))
}

fn is_unique_violation(e: &sqlx::Error) -> bool {
    matches!(e, sqlx::Error::Database(db_err) if db_err.is_unique_violation())
}

/// Filters for the paginated order-student listing.
#[derive(Debug, Clone, Default)]
pub struct OrderStudentFilter {
    pub search: Option<String>,
    pub data_status: Option<DataStatus>,
    pub payment_status: Option<PaymentStatus>,
    pub page: i64,
    pub page_size: i64,
}

/// A payment-history row to insert.
#[derive(Debug, Clone)]
pub struct NewPayment<'a> {
    pub order_student_id: Uuid,
    pub kind: PaymentKind,
    pub milestone_key: Option<String>,
    pub expected_amount: Option<Decimal>,
    pub received_amount: Decimal,
    pub applied_paid_amount: Decimal,
    pub payment_status: PaymentStatus,
    pub recorded_by: Option<&'a str>,
    pub notes: Option<&'a str>,
}

/// Database connection pool wrapper.
#[derive(Clone)]
pub struct Database {
    pool: PgPool,
}

impl Database {
    /// Create a new database connection pool.
    #[instrument(skip(database_url), fields(service = "finance-service"))]
    pub async fn new(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
    ) -> Result<Self, AppError> {
        info!(
            max_connections = max_connections,
            min_connections = min_connections,
            "Connecting to PostgreSQL"
        );

        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(Duration::from_secs(30))
            .idle_timeout(Duration::from_secs(600))
            .connect(database_url)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Failed to connect: {}", e)))?;

        info!("PostgreSQL connection pool established");

        Ok(Self { pool })
    }

    /// Wraps an existing pool, e.g. one built with `connect_lazy`.
    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Get a reference to the connection pool.
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Check database health.
    #[instrument(skip(self))]
    pub async fn health_check(&self) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["health_check"])
            .start_timer();

        sqlx::query("SELECT 1")
            .execute(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Health check failed: {}", e)))?;

        timer.observe_duration();
        Ok(())
    }

    /// Run database migrations.
    #[instrument(skip(self))]
    pub async fn run_migrations(&self) -> Result<(), AppError> {
        info!("Running database migrations");
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .map_err(|e| AppError::DatabaseError(anyhow::anyhow!("Migration failed: {}", e)))?;
        info!("Database migrations completed");
        Ok(())
    }

    pub async fn begin(&self) -> Result<Transaction<'static, Postgres>, AppError> {
        self.pool
            .begin()
            .await
            .map_err(db_error("Failed to begin transaction"))
    }

    // =========================================================================
    // Finance Student Operations
    // =========================================================================

    #[instrument(skip(self), fields(finance_year_id = %finance_year_id, student_code = %student_code))]
    pub async fn create_finance_student(
        &self,
        finance_year_id: Uuid,
        student_code: &str,
        student_name: &str,
        class_title: Option<&str>,
    ) -> Result<FinanceStudent, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_finance_student"])
            .start_timer();

        let sql = format!(
            "INSERT INTO finance_students (finance_student_id, finance_year_id, student_code, student_name, class_title) \
             VALUES ($1, $2, $3, $4, $5) RETURNING {FINANCE_STUDENT_COLUMNS}"
        );
        let student = sqlx::query_as::<_, FinanceStudent>(&sql)
            .bind(Uuid::new_v4())
            .bind(finance_year_id)
            .bind(student_code)
            .bind(student_name)
            .bind(class_title)
            .fetch_one(&self.pool)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    AppError::Conflict(anyhow::anyhow!(
                        "Student {} is already registered for this finance year",
                        student_code
                    ))
                } else {
                    AppError::DatabaseError(anyhow::anyhow!("Failed to create finance student: {}", e))
                }
            })?;

        timer.observe_duration();
        info!(finance_student_id = %student.finance_student_id, "Finance student created");

        Ok(student)
    }

    #[instrument(skip(self))]
    pub async fn get_finance_student(&self, finance_student_id: Uuid) -> Result<Option<FinanceStudent>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_finance_student"])
            .start_timer();

        let sql = format!("SELECT {FINANCE_STUDENT_COLUMNS} FROM finance_students WHERE finance_student_id = $1");
        let student = sqlx::query_as::<_, FinanceStudent>(&sql)
            .bind(finance_student_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("Failed to get finance student"))?;

        timer.observe_duration();
        Ok(student)
    }

    /// Locks a finance student row for the rest of the transaction.
    pub async fn lock_finance_student(
        conn: &mut PgConnection,
        finance_student_id: Uuid,
    ) -> Result<Option<FinanceStudent>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["lock_finance_student"])
            .start_timer();

        let sql = format!(
            "SELECT {FINANCE_STUDENT_COLUMNS} FROM finance_students WHERE finance_student_id = $1 FOR UPDATE"
        );
        let student = sqlx::query_as::<_, FinanceStudent>(&sql)
            .bind(finance_student_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(db_error("Failed to lock finance student"))?;

        timer.observe_duration();
        Ok(student)
    }

    /// Re-sums every order row of a finance student into its summary fields.
    pub async fn cascade_finance_student(
        conn: &mut PgConnection,
        finance_student_id: Uuid,
    ) -> Result<StudentSummary, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["cascade_finance_student"])
            .start_timer();

        let rows: Vec<(Decimal, Decimal)> = sqlx::query_as(
            "SELECT total_amount, paid_amount FROM order_students WHERE finance_student_id = $1",
        )
        .bind(finance_student_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_error("Failed to sum order students"))?;

        let summary = summarize(rows);

        let result = sqlx::query(
            r#"
            UPDATE finance_students
            SET total_amount = $2, paid_amount = $3, outstanding_amount = $4,
                payment_status = $5, updated_utc = NOW()
            WHERE finance_student_id = $1
            "#,
        )
        .bind(finance_student_id)
        .bind(summary.total_amount)
        .bind(summary.paid_amount)
        .bind(summary.outstanding_amount)
        .bind(summary.payment_status.as_str())
        .execute(&mut *conn)
        .await
        .map_err(db_error("Failed to update finance student summary"))?;

        if result.rows_affected() == 0 {
            return Err(AppError::NotFound(anyhow::anyhow!(
                "Finance student {} not found",
                finance_student_id
            )));
        }

        timer.observe_duration();
        Ok(summary)
    }

    /// One page of a finance year's students with their stored summaries,
    /// by name. `search` matches code or name.
    #[instrument(skip(self))]
    pub async fn list_finance_students(
        &self,
        finance_year_id: Uuid,
        search: Option<&str>,
        page: i64,
        page_size: i64,
    ) -> Result<(Vec<FinanceStudent>, i64), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_finance_students"])
            .start_timer();

        let pattern = search
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| format!("%{}%", s));
        let page_size = page_size.clamp(1, 500);
        let offset = (page.max(1) - 1) * page_size;

        const WHERE: &str = "WHERE finance_year_id = $1 \
            AND ($2::TEXT IS NULL OR student_code ILIKE $2 OR student_name ILIKE $2)";

        let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM finance_students {WHERE}"))
            .bind(finance_year_id)
            .bind(&pattern)
            .fetch_one(&self.pool)
            .await
            .map_err(db_error("Failed to count finance students"))?;

        let sql = format!(
            "SELECT {FINANCE_STUDENT_COLUMNS} FROM finance_students {WHERE} \
             ORDER BY student_name, student_code LIMIT $3 OFFSET $4"
        );
        let students = sqlx::query_as::<_, FinanceStudent>(&sql)
            .bind(finance_year_id)
            .bind(&pattern)
            .bind(page_size)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("Failed to list finance students"))?;

        timer.observe_duration();
        Ok((students, total))
    }

    #[instrument(skip(self))]
    pub async fn list_paid_tuition_students(
        &self,
        finance_year_id: Uuid,
        exclude_order_id: Option<Uuid>,
    ) -> Result<Vec<PaidTuitionStudent>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_paid_tuition_students"])
            .start_timer();

        let students = sqlx::query_as::<_, PaidTuitionStudent>(
            r#"
            SELECT DISTINCT ON (fs.finance_student_id)
                fs.finance_student_id, fs.student_code, fs.student_name, fs.class_title,
                o.order_id, o.title AS order_title
            FROM order_students os
            JOIN finance_orders o ON o.order_id = os.order_id
            JOIN finance_students fs ON fs.finance_student_id = os.finance_student_id
            WHERE o.finance_year_id = $1
              AND o.order_type = 'tuition'
              AND os.payment_status = 'paid'
              AND ($2::UUID IS NULL OR o.order_id <> $2)
            ORDER BY fs.finance_student_id, os.updated_utc DESC
            "#,
        )
        .bind(finance_year_id)
        .bind(exclude_order_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list paid tuition students"))?;

        timer.observe_duration();
        Ok(students)
    }

    #[instrument(skip(self))]
    pub async fn list_student_orders(&self, finance_student_id: Uuid) -> Result<Vec<StudentOrderRow>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_student_orders"])
            .start_timer();

        let rows = sqlx::query_as::<_, StudentOrderRow>(
            r#"
            SELECT os.order_student_id, os.order_id, o.title AS order_title, o.order_type, o.is_active,
                   os.data_status, os.total_amount, os.paid_amount, os.outstanding_amount,
                   os.payment_status, os.payment_scheme_choice, os.tuition_paid_elsewhere,
                   os.tuition_paid_elsewhere_order, os.milestone_amounts
            FROM order_students os
            JOIN finance_orders o ON o.order_id = os.order_id
            WHERE os.finance_student_id = $1
            ORDER BY o.created_utc, o.title
            "#,
        )
        .bind(finance_student_id)
        .fetch_all(&self.pool)
        .await
        .map_err(db_error("Failed to list student orders"))?;

        timer.observe_duration();
        Ok(rows)
    }

    // =========================================================================
    // Order Operations
    // =========================================================================

    /// Inserts an order with its milestones and fee lines in one transaction.
    #[instrument(skip(self, new_order), fields(title = %new_order.title))]
    pub async fn create_order_with_structure(&self, new_order: &NewOrder) -> Result<OrderStructure, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["create_order_with_structure"])
            .start_timer();

        let mut tx = self.begin().await?;
        let order_id = Uuid::new_v4();

        let sql = format!(
            "INSERT INTO finance_orders (order_id, finance_year_id, title, order_type, is_active, description, debit_note_form_code) \
             VALUES ($1, $2, $3, $4, $5, $6, $7) RETURNING {ORDER_COLUMNS}"
        );
        let order = sqlx::query_as::<_, FinanceOrder>(&sql)
            .bind(order_id)
            .bind(new_order.finance_year_id)
            .bind(&new_order.title)
            .bind(new_order.order_type.as_str())
            .bind(new_order.is_active)
            .bind(&new_order.description)
            .bind(&new_order.debit_note_form_code)
            .fetch_one(&mut *tx)
            .await
            .map_err(db_error("Failed to create order"))?;

        let milestones = Self::insert_milestones(&mut tx, order_id, &new_order.milestones).await?;
        let fee_lines = Self::insert_fee_lines(&mut tx, order_id, &new_order.fee_lines).await?;

        tx.commit().await.map_err(db_error("Failed to commit order"))?;

        timer.observe_duration();
        info!(
            order_id = %order_id,
            milestone_count = milestones.len(),
            fee_line_count = fee_lines.len(),
            "Order created"
        );

        Ok(OrderStructure::new(order, milestones, fee_lines))
    }

    async fn insert_milestones(
        conn: &mut PgConnection,
        order_id: Uuid,
        new_milestones: &[NewMilestone],
    ) -> Result<Vec<Milestone>, AppError> {
        let sql = format!(
            "INSERT INTO order_milestones (milestone_id, order_id, payment_scheme, milestone_number, title, deadline_date) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING {MILESTONE_COLUMNS}"
        );
        let mut milestones = Vec::with_capacity(new_milestones.len());
        for m in new_milestones {
            let number = i32::try_from(m.key.number).map_err(|_| {
                AppError::field("milestones", format!("Milestone number {} is too large", m.key.number))
            })?;
            let milestone = sqlx::query_as::<_, Milestone>(&sql)
                .bind(Uuid::new_v4())
                .bind(order_id)
                .bind(m.key.scheme.as_str())
                .bind(number)
                .bind(&m.title)
                .bind(m.deadline_date)
                .fetch_one(&mut *conn)
                .await
                .map_err(db_error("Failed to create milestone"))?;
            milestones.push(milestone);
        }
        Ok(milestones)
    }

    async fn insert_fee_lines(
        conn: &mut PgConnection,
        order_id: Uuid,
        new_lines: &[NewFeeLine],
    ) -> Result<Vec<OrderFeeLine>, AppError> {
        let sql = format!(
            "INSERT INTO order_fee_lines (fee_line_id, order_id, line_number, line_type, title_en, title_vn, \
             is_compulsory, is_deduction, formula, note, sort_order) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11) RETURNING {FEE_LINE_COLUMNS}"
        );
        let mut fee_lines = Vec::with_capacity(new_lines.len());
        for line in new_lines {
            let fee_line = sqlx::query_as::<_, OrderFeeLine>(&sql)
                .bind(Uuid::new_v4())
                .bind(order_id)
                .bind(&line.line_number)
                .bind(line.line_type.as_str())
                .bind(&line.title_en)
                .bind(&line.title_vn)
                .bind(line.is_compulsory)
                .bind(line.is_deduction)
                .bind(&line.formula)
                .bind(&line.note)
                .bind(line.sort_order)
                .fetch_one(&mut *conn)
                .await
                .map_err(db_error("Failed to create fee line"))?;
            fee_lines.push(fee_line);
        }
        Ok(fee_lines)
    }

    /// Replaces an order's milestones and/or fee lines in one transaction.
    /// The order row is locked and its status re-checked first. When fee
    /// lines change, every student's line rows follow: removed lines are
    /// dropped, new lines are added empty, and lines that lost their formula
    /// are cleared so stale computed amounts are not read as input.
    #[instrument(skip(self, update), fields(order_id = %update.order_id))]
    pub async fn replace_order_structure(&self, update: &StructureUpdate) -> Result<OrderStructure, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["replace_order_structure"])
            .start_timer();

        let mut tx = self.begin().await?;
        let order_id = update.order_id;

        let sql = format!("SELECT {ORDER_COLUMNS} FROM finance_orders WHERE order_id = $1 FOR UPDATE");
        let order = sqlx::query_as::<_, FinanceOrder>(&sql)
            .bind(order_id)
            .fetch_optional(&mut *tx)
            .await
            .map_err(db_error("Failed to lock order"))?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Order {} not found", order_id)))?;
        if !order.can_edit_structure() {
            return Err(AppError::BadRequest(anyhow::anyhow!(
                "The structure of an order with status {} cannot be changed",
                order.status
            )));
        }

        if let Some(milestones) = &update.milestones {
            sqlx::query("DELETE FROM order_milestones WHERE order_id = $1")
                .bind(order_id)
                .execute(&mut *tx)
                .await
                .map_err(db_error("Failed to delete milestones"))?;
            Self::insert_milestones(&mut tx, order_id, milestones).await?;
        }

        if let Some(fee_lines) = &update.fee_lines {
            sqlx::query("DELETE FROM order_fee_lines WHERE order_id = $1")
                .bind(order_id)
                .execute(&mut *tx)
                .await
                .map_err(db_error("Failed to delete fee lines"))?;
            Self::insert_fee_lines(&mut tx, order_id, fee_lines).await?;

            let line_numbers: Vec<String> = fee_lines.iter().map(|l| l.line_number.clone()).collect();
            let calculated: Vec<bool> = fee_lines
                .iter()
                .map(|l| l.formula.as_deref().is_some_and(|f| !f.trim().is_empty()))
                .collect();

            sqlx::query(
                r#"
                DELETE FROM order_student_lines sl
                USING order_students os
                WHERE sl.order_student_id = os.order_student_id
                  AND os.order_id = $1
                  AND NOT (sl.line_number = ANY($2::TEXT[]))
                "#,
            )
            .bind(order_id)
            .bind(&line_numbers)
            .execute(&mut *tx)
            .await
            .map_err(db_error("Failed to drop removed student lines"))?;

            sqlx::query(
                r#"
                UPDATE order_student_lines sl
                SET amounts = '{}'::jsonb, is_calculated = FALSE, updated_utc = NOW()
                FROM order_students os,
                     UNNEST($2::TEXT[], $3::BOOL[]) AS t(line_number, is_calculated)
                WHERE sl.order_student_id = os.order_student_id
                  AND os.order_id = $1
                  AND sl.line_number = t.line_number
                  AND sl.is_calculated
                  AND NOT t.is_calculated
                "#,
            )
            .bind(order_id)
            .bind(&line_numbers)
            .bind(&calculated)
            .execute(&mut *tx)
            .await
            .map_err(db_error("Failed to reset student lines"))?;

            sqlx::query(
                r#"
                INSERT INTO order_student_lines (order_student_id, line_number, is_calculated)
                SELECT os.order_student_id, t.line_number, t.is_calculated
                FROM order_students os
                CROSS JOIN UNNEST($2::TEXT[], $3::BOOL[]) AS t(line_number, is_calculated)
                WHERE os.order_id = $1
                ON CONFLICT (order_student_id, line_number) DO NOTHING
                "#,
            )
            .bind(order_id)
            .bind(&line_numbers)
            .bind(&calculated)
            .execute(&mut *tx)
            .await
            .map_err(db_error("Failed to add student lines"))?;
        }

        sqlx::query("UPDATE finance_orders SET updated_utc = NOW() WHERE order_id = $1")
            .bind(order_id)
            .execute(&mut *tx)
            .await
            .map_err(db_error("Failed to touch order"))?;

        let structure = Self::get_order_structure(&mut tx, order_id)
            .await?
            .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Order {} not found", order_id)))?;
        tx.commit().await.map_err(db_error("Failed to commit order structure"))?;

        timer.observe_duration();
        info!(
            order_id = %order_id,
            milestones_replaced = update.milestones.is_some(),
            fee_lines_replaced = update.fee_lines.is_some(),
            "Order structure replaced"
        );
        Ok(structure)
    }

    pub async fn get_order(conn: &mut PgConnection, order_id: Uuid) -> Result<Option<FinanceOrder>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_order"])
            .start_timer();

        let sql = format!("SELECT {ORDER_COLUMNS} FROM finance_orders WHERE order_id = $1");
        let order = sqlx::query_as::<_, FinanceOrder>(&sql)
            .bind(order_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(db_error("Failed to get order"))?;

        timer.observe_duration();
        Ok(order)
    }

    pub async fn get_order_structure(
        conn: &mut PgConnection,
        order_id: Uuid,
    ) -> Result<Option<OrderStructure>, AppError> {
        let Some(order) = Self::get_order(conn, order_id).await? else {
            return Ok(None);
        };

        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_order_structure"])
            .start_timer();

        let sql = format!("SELECT {MILESTONE_COLUMNS} FROM order_milestones WHERE order_id = $1");
        let milestones = sqlx::query_as::<_, Milestone>(&sql)
            .bind(order_id)
            .fetch_all(&mut *conn)
            .await
            .map_err(db_error("Failed to load milestones"))?;

        let sql = format!(
            "SELECT {FEE_LINE_COLUMNS} FROM order_fee_lines WHERE order_id = $1 ORDER BY sort_order, line_number"
        );
        let fee_lines = sqlx::query_as::<_, OrderFeeLine>(&sql)
            .bind(order_id)
            .fetch_all(&mut *conn)
            .await
            .map_err(db_error("Failed to load fee lines"))?;

        timer.observe_duration();
        Ok(Some(OrderStructure::new(order, milestones, fee_lines)))
    }

    #[instrument(skip(self))]
    pub async fn load_order_structure(&self, order_id: Uuid) -> Result<Option<OrderStructure>, AppError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(db_error("Failed to acquire connection"))?;
        Self::get_order_structure(&mut conn, order_id).await
    }

    /// Recomputes the order's statistics from its student rows and applies
    /// the automatic status progression.
    #[instrument(skip(self))]
    pub async fn refresh_order_statistics(&self, order_id: Uuid) -> Result<FinanceOrder, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["refresh_order_statistics"])
            .start_timer();

        let mut order = sqlx::query_as::<_, FinanceOrder>(
            r#"
            WITH s AS (
                SELECT COUNT(*)::INT AS total_students,
                       (COUNT(*) FILTER (WHERE data_status = 'complete'))::INT AS completed,
                       COALESCE(SUM(total_amount), 0) AS total,
                       COALESCE(SUM(paid_amount), 0) AS paid,
                       COALESCE(SUM(outstanding_amount), 0) AS outstanding
                FROM order_students
                WHERE order_id = $1
            )
            UPDATE finance_orders o
            SET total_students = s.total_students,
                data_completed_count = s.completed,
                total_collected = s.paid,
                total_outstanding = s.outstanding,
                collection_rate = CASE WHEN s.total > 0 THEN ROUND(s.paid * 100 / s.total, 2) ELSE 0 END,
                updated_utc = NOW()
            FROM s
            WHERE o.order_id = $1
            RETURNING o.*
            "#,
        )
        .bind(order_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to refresh order statistics"))?
        .ok_or_else(|| AppError::NotFound(anyhow::anyhow!("Order {} not found", order_id)))?;

        let current = order.parsed_status();
        let next = current.after_refresh(order.total_students, order.data_completed_count);
        if next != current {
            sqlx::query("UPDATE finance_orders SET status = $2, updated_utc = NOW() WHERE order_id = $1")
                .bind(order_id)
                .bind(next.as_str())
                .execute(&self.pool)
                .await
                .map_err(db_error("Failed to update order status"))?;
            info!(order_id = %order_id, from = current.as_str(), to = next.as_str(), "Order status advanced");
            order.status = next.as_str().to_string();
        }

        timer.observe_duration();
        Ok(order)
    }

    // =========================================================================
    // Order Student Operations
    // =========================================================================

    /// Finance student ids already enrolled in an order.
    #[instrument(skip(self))]
    pub async fn enrolled_student_ids(&self, order_id: Uuid) -> Result<HashSet<Uuid>, AppError> {
        let ids: Vec<Uuid> =
            sqlx::query_scalar("SELECT finance_student_id FROM order_students WHERE order_id = $1")
                .bind(order_id)
                .fetch_all(&self.pool)
                .await
                .map_err(db_error("Failed to list enrolled students"))?;
        Ok(ids.into_iter().collect())
    }

    /// Creates an order student with one empty line per fee-line definition.
    /// Formula lines start out marked calculated.
    pub async fn insert_order_student(
        conn: &mut PgConnection,
        structure: &OrderStructure,
        student: &FinanceStudent,
    ) -> Result<OrderStudent, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_order_student"])
            .start_timer();

        let sql = format!(
            "INSERT INTO order_students (order_student_id, order_id, finance_student_id, student_code, student_name, class_title) \
             VALUES ($1, $2, $3, $4, $5, $6) RETURNING {ORDER_STUDENT_COLUMNS}"
        );
        let order_student = sqlx::query_as::<_, OrderStudent>(&sql)
            .bind(Uuid::new_v4())
            .bind(structure.order.order_id)
            .bind(student.finance_student_id)
            .bind(&student.student_code)
            .bind(&student.student_name)
            .bind(&student.class_title)
            .fetch_one(&mut *conn)
            .await
            .map_err(|e| {
                if is_unique_violation(&e) {
                    AppError::Conflict(anyhow::anyhow!(
                        "Student {} is already in this order",
                        student.student_code
                    ))
                } else {
                    AppError::DatabaseError(anyhow::anyhow!("Failed to create order student: {}", e))
                }
            })?;

        let line_numbers: Vec<String> = structure.fee_lines.iter().map(|l| l.line_number.clone()).collect();
        let calculated: Vec<bool> = structure.fee_lines.iter().map(|l| l.formula().is_some()).collect();
        sqlx::query(
            r#"
            INSERT INTO order_student_lines (order_student_id, line_number, is_calculated)
            SELECT $1, line_number, is_calculated
            FROM UNNEST($2::TEXT[], $3::BOOL[]) AS t(line_number, is_calculated)
            "#,
        )
        .bind(order_student.order_student_id)
        .bind(&line_numbers)
        .bind(&calculated)
        .execute(&mut *conn)
        .await
        .map_err(db_error("Failed to create order student lines"))?;

        timer.observe_duration();
        Ok(order_student)
    }

    #[instrument(skip(self, filter))]
    pub async fn list_order_students(
        &self,
        order_id: Uuid,
        filter: &OrderStudentFilter,
    ) -> Result<(Vec<OrderStudent>, i64), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_order_students"])
            .start_timer();

        let pattern = filter
            .search
            .as_deref()
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(|s| format!("%{}%", s));
        let data_status = filter.data_status.map(|s| s.as_str());
        let payment_status = filter.payment_status.map(|s| s.as_str());
        let page_size = filter.page_size.clamp(1, 500);
        let offset = (filter.page.max(1) - 1) * page_size;

        const WHERE: &str = "WHERE order_id = $1 \
            AND ($2::TEXT IS NULL OR student_code ILIKE $2 OR student_name ILIKE $2) \
            AND ($3::TEXT IS NULL OR data_status = $3) \
            AND ($4::TEXT IS NULL OR payment_status = $4)";

        let total: i64 = sqlx::query_scalar(&format!("SELECT COUNT(*) FROM order_students {WHERE}"))
            .bind(order_id)
            .bind(&pattern)
            .bind(data_status)
            .bind(payment_status)
            .fetch_one(&self.pool)
            .await
            .map_err(db_error("Failed to count order students"))?;

        let sql = format!(
            "SELECT {ORDER_STUDENT_COLUMNS} FROM order_students {WHERE} \
             ORDER BY student_name, student_code LIMIT $5 OFFSET $6"
        );
        let students = sqlx::query_as::<_, OrderStudent>(&sql)
            .bind(order_id)
            .bind(&pattern)
            .bind(data_status)
            .bind(payment_status)
            .bind(page_size)
            .bind(offset)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("Failed to list order students"))?;

        timer.observe_duration();
        Ok((students, total))
    }

    /// Every order student of an order, by student code.
    #[instrument(skip(self))]
    pub async fn list_all_order_students(&self, order_id: Uuid) -> Result<Vec<OrderStudent>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_all_order_students"])
            .start_timer();

        let sql = format!(
            "SELECT {ORDER_STUDENT_COLUMNS} FROM order_students WHERE order_id = $1 ORDER BY student_code"
        );
        let students = sqlx::query_as::<_, OrderStudent>(&sql)
            .bind(order_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("Failed to list order students"))?;

        timer.observe_duration();
        Ok(students)
    }

    /// Students of an order whose fee data is complete but who have not
    /// fully paid, by student code.
    #[instrument(skip(self))]
    pub async fn list_unpaid_students(&self, order_id: Uuid) -> Result<Vec<OrderStudent>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["list_unpaid_students"])
            .start_timer();

        let sql = format!(
            "SELECT {ORDER_STUDENT_COLUMNS} FROM order_students \
             WHERE order_id = $1 AND data_status = 'complete' AND payment_status <> 'paid' \
             ORDER BY student_code"
        );
        let students = sqlx::query_as::<_, OrderStudent>(&sql)
            .bind(order_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("Failed to list unpaid students"))?;

        timer.observe_duration();
        Ok(students)
    }

    #[instrument(skip(self))]
    pub async fn get_order_student(&self, order_student_id: Uuid) -> Result<Option<OrderStudent>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["get_order_student"])
            .start_timer();

        let sql = format!("SELECT {ORDER_STUDENT_COLUMNS} FROM order_students WHERE order_student_id = $1");
        let student = sqlx::query_as::<_, OrderStudent>(&sql)
            .bind(order_student_id)
            .fetch_optional(&self.pool)
            .await
            .map_err(db_error("Failed to get order student"))?;

        timer.observe_duration();
        Ok(student)
    }

    /// Owning finance student of an order student, read without locking so
    /// the finance student can be locked first.
    pub async fn order_student_owner(
        conn: &mut PgConnection,
        order_student_id: Uuid,
    ) -> Result<Option<Uuid>, AppError> {
        sqlx::query_scalar("SELECT finance_student_id FROM order_students WHERE order_student_id = $1")
            .bind(order_student_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(db_error("Failed to get order student owner"))
    }

    pub async fn lock_order_student(
        conn: &mut PgConnection,
        order_student_id: Uuid,
    ) -> Result<Option<OrderStudent>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["lock_order_student"])
            .start_timer();

        let sql = format!(
            "SELECT {ORDER_STUDENT_COLUMNS} FROM order_students WHERE order_student_id = $1 FOR UPDATE"
        );
        let student = sqlx::query_as::<_, OrderStudent>(&sql)
            .bind(order_student_id)
            .fetch_optional(&mut *conn)
            .await
            .map_err(db_error("Failed to lock order student"))?;

        timer.observe_duration();
        Ok(student)
    }

    /// Order student id for a student code within an order.
    pub async fn find_order_student_by_code(
        conn: &mut PgConnection,
        order_id: Uuid,
        student_code: &str,
    ) -> Result<Option<Uuid>, AppError> {
        sqlx::query_scalar(
            "SELECT order_student_id FROM order_students WHERE order_id = $1 AND student_code = $2",
        )
        .bind(order_id)
        .bind(student_code)
        .fetch_optional(&mut *conn)
        .await
        .map_err(db_error("Failed to find order student"))
    }

    /// Writes back every mutable field of an order student.
    pub async fn save_order_student(conn: &mut PgConnection, student: &OrderStudent) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["save_order_student"])
            .start_timer();

        sqlx::query(
            r#"
            UPDATE order_students
            SET data_status = $2, total_amount = $3, paid_amount = $4, outstanding_amount = $5,
                payment_status = $6, payment_scheme_choice = $7, current_milestone_key = $8,
                semester_1_paid = $9, semester_2_paid = $10, milestone_amounts = $11,
                notes = $12, updated_utc = NOW()
            WHERE order_student_id = $1
            "#,
        )
        .bind(student.order_student_id)
        .bind(&student.data_status)
        .bind(student.total_amount)
        .bind(student.paid_amount)
        .bind(student.outstanding_amount)
        .bind(&student.payment_status)
        .bind(&student.payment_scheme_choice)
        .bind(&student.current_milestone_key)
        .bind(student.semester_1_paid)
        .bind(student.semester_2_paid)
        .bind(&student.milestone_amounts)
        .bind(&student.notes)
        .execute(&mut *conn)
        .await
        .map_err(db_error("Failed to save order student"))?;

        timer.observe_duration();
        Ok(())
    }

    pub async fn list_student_lines(
        conn: &mut PgConnection,
        order_student_id: Uuid,
    ) -> Result<Vec<StudentFeeLine>, AppError> {
        sqlx::query_as::<_, StudentFeeLine>(
            r#"
            SELECT order_student_id, line_number, amounts, is_calculated, updated_utc
            FROM order_student_lines
            WHERE order_student_id = $1
            "#,
        )
        .bind(order_student_id)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_error("Failed to load student fee lines"))
    }

    #[instrument(skip(self))]
    pub async fn load_student_lines(&self, order_student_id: Uuid) -> Result<Vec<StudentFeeLine>, AppError> {
        let mut conn = self
            .pool
            .acquire()
            .await
            .map_err(db_error("Failed to acquire connection"))?;
        Self::list_student_lines(&mut conn, order_student_id).await
    }

    /// Upserts the amounts of every line.
    pub async fn save_student_lines(
        conn: &mut PgConnection,
        order_student_id: Uuid,
        lines: &[FeeLine],
    ) -> Result<(), AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["save_student_lines"])
            .start_timer();

        for line in lines {
            sqlx::query(
                r#"
                INSERT INTO order_student_lines (order_student_id, line_number, amounts, is_calculated)
                VALUES ($1, $2, $3, $4)
                ON CONFLICT (order_student_id, line_number)
                DO UPDATE SET amounts = EXCLUDED.amounts, is_calculated = EXCLUDED.is_calculated, updated_utc = NOW()
                "#,
            )
            .bind(order_student_id)
            .bind(&line.line_number)
            .bind(Json(&line.amounts))
            .bind(line.is_calculated)
            .execute(&mut *conn)
            .await
            .map_err(db_error("Failed to save student fee line"))?;
        }

        timer.observe_duration();
        Ok(())
    }

    /// Amounts of the last total line of an order student, if it has one.
    #[instrument(skip(self))]
    pub async fn total_line_amounts(&self, order_student_id: Uuid) -> Result<Option<MilestoneAmounts>, AppError> {
        let amounts: Option<Json<MilestoneAmounts>> = sqlx::query_scalar(
            r#"
            SELECT l.amounts
            FROM order_student_lines l
            JOIN order_students os ON os.order_student_id = l.order_student_id
            JOIN order_fee_lines f ON f.order_id = os.order_id AND f.line_number = l.line_number
            WHERE l.order_student_id = $1 AND f.line_type = 'total'
            ORDER BY f.sort_order DESC
            LIMIT 1
            "#,
        )
        .bind(order_student_id)
        .fetch_optional(&self.pool)
        .await
        .map_err(db_error("Failed to load total line"))?;
        Ok(amounts.map(|a| a.0))
    }

    /// Flags the student's other open tuition rows in the same finance year
    /// as paid elsewhere. Returns the flagged order student ids.
    pub async fn flag_tuition_paid_elsewhere(
        conn: &mut PgConnection,
        finance_student_id: Uuid,
        finance_year_id: Uuid,
        paying_order_id: Uuid,
        paying_order_title: &str,
    ) -> Result<Vec<Uuid>, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["flag_tuition_paid_elsewhere"])
            .start_timer();

        let flagged: Vec<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE order_students os
            SET tuition_paid_elsewhere = TRUE,
                tuition_paid_elsewhere_order = $4,
                updated_utc = NOW()
            FROM finance_orders o
            WHERE o.order_id = os.order_id
              AND os.finance_student_id = $1
              AND o.finance_year_id = $2
              AND o.order_type = 'tuition'
              AND os.order_id <> $3
              AND os.payment_status IN ('unpaid', 'partial')
              AND os.tuition_paid_elsewhere = FALSE
            RETURNING os.order_student_id
            "#,
        )
        .bind(finance_student_id)
        .bind(finance_year_id)
        .bind(paying_order_id)
        .bind(paying_order_title)
        .fetch_all(&mut *conn)
        .await
        .map_err(db_error("Failed to flag tuition paid elsewhere"))?;

        timer.observe_duration();
        Ok(flagged)
    }

    // =========================================================================
    // Payment History
    // =========================================================================

    pub async fn insert_payment(conn: &mut PgConnection, payment: &NewPayment<'_>) -> Result<PaymentRecord, AppError> {
        let timer = DB_QUERY_DURATION
            .with_label_values(&["insert_payment"])
            .start_timer();

        let sql = format!(
            "INSERT INTO order_student_payments (payment_id, order_student_id, kind, milestone_key, expected_amount, \
             received_amount, applied_paid_amount, payment_status, recorded_by, notes) \
             VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10) RETURNING {PAYMENT_COLUMNS}"
        );
        let record = sqlx::query_as::<_, PaymentRecord>(&sql)
            .bind(Uuid::new_v4())
            .bind(payment.order_student_id)
            .bind(payment.kind.as_str())
            .bind(&payment.milestone_key)
            .bind(payment.expected_amount)
            .bind(payment.received_amount)
            .bind(payment.applied_paid_amount)
            .bind(payment.payment_status.as_str())
            .bind(payment.recorded_by)
            .bind(payment.notes)
            .fetch_one(&mut *conn)
            .await
            .map_err(db_error("Failed to record payment history"))?;

        timer.observe_duration();
        Ok(record)
    }

    #[instrument(skip(self))]
    pub async fn list_payments(&self, order_student_id: Uuid) -> Result<Vec<PaymentRecord>, AppError> {
        let sql = format!(
            "SELECT {PAYMENT_COLUMNS} FROM order_student_payments WHERE order_student_id = $1 ORDER BY created_utc"
        );
        sqlx::query_as::<_, PaymentRecord>(&sql)
            .bind(order_student_id)
            .fetch_all(&self.pool)
            .await
            .map_err(db_error("Failed to list payments"))
    }
}
