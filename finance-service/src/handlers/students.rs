use crate::dtos::{
    parse_id, CreateFinanceStudentRequest, FinanceStudentPage, FinanceStudentResponse,
    FinanceStudentsQuery, PaidTuitionQuery, PaidTuitionStudentResponse, StudentOrderItem,
    StudentOrdersQuery, StudentOrdersResponse,
};
use crate::middleware::AdminCaller;
use crate::startup::AppState;
use axum::extract::State;
use service_core::error::AppError;
use service_core::extract::{QueryParams, RequestBody};
use service_core::response::Envelope;
use tracing::{info, instrument};
use validator::Validate;

const DEFAULT_PAGE_SIZE: i64 = 20;

#[instrument(skip(state, caller, request), fields(user_id = %caller.0.user_id))]
pub async fn create_finance_student(
    State(state): State<AppState>,
    caller: AdminCaller,
    RequestBody(request): RequestBody<CreateFinanceStudentRequest>,
) -> Result<Envelope<FinanceStudentResponse>, AppError> {
    request.validate()?;
    let finance_year_id = parse_id("finance_year_id", &request.finance_year_id)?;

    let student = state
        .finance
        .create_finance_student(
            finance_year_id,
            &request.student_code,
            &request.student_name,
            request.class_title.as_deref(),
        )
        .await?;

    info!(
        finance_student_id = %student.finance_student_id,
        student_code = %student.student_code,
        "Finance student created"
    );
    Ok(Envelope::success(
        FinanceStudentResponse::from(student),
        "Finance student created",
    ))
}

/// Students of a finance year with the summaries kept up to date by every
/// order-student write.
#[instrument(skip(state, _caller, query))]
pub async fn get_finance_students(
    State(state): State<AppState>,
    _caller: AdminCaller,
    QueryParams(query): QueryParams<FinanceStudentsQuery>,
) -> Result<Envelope<FinanceStudentPage>, AppError> {
    query.validate()?;
    let finance_year_id = parse_id("finance_year_id", &query.finance_year_id)?;
    let page = query.page.unwrap_or(1);
    let page_size = query.page_size.unwrap_or(DEFAULT_PAGE_SIZE);

    let (students, total_count) = state
        .finance
        .finance_students(finance_year_id, query.search.as_deref(), page, page_size)
        .await?;
    let page = FinanceStudentPage::new(students, total_count, page, page_size);
    let message = format!("Found {} students", page.total_count);
    Ok(Envelope::success(page, message))
}

#[instrument(skip(state, _caller, query))]
pub async fn get_paid_tuition_students(
    State(state): State<AppState>,
    _caller: AdminCaller,
    QueryParams(query): QueryParams<PaidTuitionQuery>,
) -> Result<Envelope<Vec<PaidTuitionStudentResponse>>, AppError> {
    query.validate()?;
    let finance_year_id = parse_id("finance_year_id", &query.finance_year_id)?;
    let exclude_order_id = match query.exclude_order_id.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(parse_id("exclude_order_id", raw)?),
    };

    let students: Vec<PaidTuitionStudentResponse> = state
        .finance
        .paid_tuition_students(finance_year_id, exclude_order_id)
        .await?
        .into_iter()
        .map(PaidTuitionStudentResponse::from)
        .collect();

    let message = format!("Found {} students with paid tuition", students.len());
    Ok(Envelope::success(students, message))
}

#[instrument(skip(state, _caller, query))]
pub async fn get_student_orders(
    State(state): State<AppState>,
    _caller: AdminCaller,
    QueryParams(query): QueryParams<StudentOrdersQuery>,
) -> Result<Envelope<StudentOrdersResponse>, AppError> {
    query.validate()?;
    let finance_student_id = parse_id("finance_student_id", &query.finance_student_id)?;

    let (student, orders) = state.finance.student_orders(finance_student_id).await?;
    Ok(Envelope::success(
        StudentOrdersResponse {
            student: FinanceStudentResponse::from(student),
            orders: orders.into_iter().map(StudentOrderItem::from).collect(),
        },
        "Student orders loaded",
    ))
}
