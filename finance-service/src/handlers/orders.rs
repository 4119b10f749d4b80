use crate::dtos::{
    parse_id, AddStudentsRequest, BatchResponse, CreateOrderRequest, EnrollmentResponse,
    FeeTemplateResponse, OrderIdRequest, OrderStructureResponse, OrderStudentPage,
    OrderStudentResponse, OrderStudentsQuery, StructureUpdateResponse,
    UpdateOrderStructureRequest,
};
use crate::middleware::AdminCaller;
use crate::models::{DataStatus, PaymentStatus};
use crate::services::OrderStudentFilter;
use crate::startup::AppState;
use axum::body::Bytes;
use axum::extract::State;
use service_core::error::AppError;
use service_core::extract::{QueryParams, RequestBody};
use service_core::response::Envelope;
use tracing::{info, instrument};
use validator::Validate;

const DEFAULT_PAGE_SIZE: i64 = 20;

#[instrument(skip(state, caller, request), fields(user_id = %caller.0.user_id))]
pub async fn create_order_with_structure(
    State(state): State<AppState>,
    caller: AdminCaller,
    RequestBody(request): RequestBody<CreateOrderRequest>,
) -> Result<Envelope<OrderStructureResponse>, AppError> {
    request.validate()?;
    let new_order = request.into_new_order()?;

    let structure = state.finance.create_order(&new_order).await?;
    info!(
        order_id = %structure.order.order_id,
        milestones = structure.milestones.len(),
        fee_lines = structure.fee_lines.len(),
        "Order created"
    );
    Ok(Envelope::success(
        OrderStructureResponse::from(&structure),
        "Order created",
    ))
}

#[instrument(skip(state, _caller, query))]
pub async fn get_order_with_structure(
    State(state): State<AppState>,
    _caller: AdminCaller,
    QueryParams(query): QueryParams<OrderIdRequest>,
) -> Result<Envelope<OrderStructureResponse>, AppError> {
    query.validate()?;
    let structure = state.finance.order_structure(query.order_id()?).await?;
    Ok(Envelope::success(
        OrderStructureResponse::from(&structure),
        "Order loaded",
    ))
}

#[instrument(skip(state, caller, request), fields(user_id = %caller.0.user_id))]
pub async fn update_order_structure(
    State(state): State<AppState>,
    caller: AdminCaller,
    RequestBody(request): RequestBody<UpdateOrderStructureRequest>,
) -> Result<Envelope<StructureUpdateResponse>, AppError> {
    request.validate()?;
    let update = request.into_update()?;

    let (structure, report) = state.finance.update_order_structure(&update).await?;
    let message = match &report {
        Some(r) => format!(
            "Order structure updated; {} of {} students recalculated",
            r.success_count, r.total_rows
        ),
        None => "Order structure updated".to_string(),
    };
    info!(
        order_id = %structure.order.order_id,
        milestones = structure.milestones.len(),
        fee_lines = structure.fee_lines.len(),
        "Order structure updated"
    );

    let recalculation = report.map(BatchResponse::from);
    let logs = recalculation.as_ref().map(batch_logs).unwrap_or_default();
    Ok(Envelope::success(
        StructureUpdateResponse {
            structure: OrderStructureResponse::from(&structure),
            recalculation,
        },
        message,
    )
    .with_logs(logs))
}

#[instrument(skip(state, _caller, query))]
pub async fn get_order_students_v2(
    State(state): State<AppState>,
    _caller: AdminCaller,
    QueryParams(query): QueryParams<OrderStudentsQuery>,
) -> Result<Envelope<OrderStudentPage>, AppError> {
    query.validate()?;
    let order_id = parse_id("order_id", &query.order_id)?;

    let data_status = match query.data_status.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(DataStatus::parse(raw).ok_or_else(|| {
            AppError::field("data_status", format!("Unknown data status '{}'", raw))
        })?),
    };
    let payment_status = match query.payment_status.as_deref().map(str::trim) {
        None | Some("") => None,
        Some(raw) => Some(PaymentStatus::parse(raw).ok_or_else(|| {
            AppError::field("payment_status", format!("Unknown payment status '{}'", raw))
        })?),
    };

    let filter = OrderStudentFilter {
        search: query.search.filter(|s| !s.trim().is_empty()),
        data_status,
        payment_status,
        page: query.page.unwrap_or(1),
        page_size: query.page_size.unwrap_or(DEFAULT_PAGE_SIZE),
    };

    let (students, total_count) = state.finance.order_students(order_id, &filter).await?;
    let page = OrderStudentPage::new(students, total_count, filter.page, filter.page_size);
    let message = format!("Found {} students", page.total_count);
    Ok(Envelope::success(page, message))
}

#[instrument(skip(state, caller, request), fields(user_id = %caller.0.user_id))]
pub async fn add_students_to_order_v2(
    State(state): State<AppState>,
    caller: AdminCaller,
    RequestBody(request): RequestBody<AddStudentsRequest>,
) -> Result<Envelope<EnrollmentResponse>, AppError> {
    request.validate()?;
    let order_id = parse_id("order_id", &request.order_id)?;
    let student_ids = request.student_ids()?;

    let report = state
        .finance
        .add_students(order_id, &student_ids, request.exclude_paid_tuition.unwrap_or(true))
        .await?;

    let response = EnrollmentResponse::from(report);
    let mut message = format!("Added {} students", response.added_count);
    if response.skipped_count > 0 {
        message.push_str(&format!(", {} already in the order", response.skipped_count));
    }
    if response.skipped_paid_count > 0 {
        message.push_str(&format!(
            ", {} skipped with tuition paid elsewhere",
            response.skipped_paid_count
        ));
    }
    let logs = response
        .errors
        .iter()
        .map(|e| format!("{}: {}", e.student_code.as_deref().unwrap_or("-"), e.error))
        .collect();
    Ok(Envelope::success(response, message).with_logs(logs))
}

#[instrument(skip(state, _caller, query))]
pub async fn export_order_fee_template(
    State(state): State<AppState>,
    _caller: AdminCaller,
    QueryParams(query): QueryParams<OrderIdRequest>,
) -> Result<Envelope<FeeTemplateResponse>, AppError> {
    query.validate()?;
    let order_id = query.order_id()?;

    let (structure, csv) = state.finance.fee_template(order_id).await?;
    let content = String::from_utf8(csv)
        .map_err(|e| AppError::InternalError(anyhow::anyhow!("Template is not UTF-8: {}", e)))?;

    Ok(Envelope::success(
        FeeTemplateResponse {
            order_id,
            file_name: format!("fee_template_{}.csv", structure.order.order_id),
            content_type: "text/csv",
            content,
        },
        "Template generated",
    ))
}

/// The sheet is the raw request body; the order comes from the query string.
#[instrument(skip(state, caller, query, body), fields(user_id = %caller.0.user_id))]
pub async fn import_student_fee_data(
    State(state): State<AppState>,
    caller: AdminCaller,
    QueryParams(query): QueryParams<OrderIdRequest>,
    body: Bytes,
) -> Result<Envelope<BatchResponse>, AppError> {
    query.validate()?;
    let order_id = query.order_id()?;
    if body.is_empty() {
        return Err(AppError::field("file", "No file uploaded"));
    }

    let report = state.finance.import_fee_data(order_id, &body).await?;
    let response = BatchResponse::from(report);
    let message = format!(
        "Imported {} of {} rows",
        response.success_count, response.total_rows
    );
    let logs = batch_logs(&response);
    Ok(Envelope::success(response, message).with_logs(logs))
}

#[instrument(skip(state, caller, request), fields(user_id = %caller.0.user_id))]
pub async fn recalculate_order_totals(
    State(state): State<AppState>,
    caller: AdminCaller,
    RequestBody(request): RequestBody<OrderIdRequest>,
) -> Result<Envelope<BatchResponse>, AppError> {
    request.validate()?;
    let report = state.finance.recalculate_order(request.order_id()?).await?;
    let response = BatchResponse::from(report);
    let message = format!(
        "Recalculated {} of {} students",
        response.success_count, response.total_rows
    );
    let logs = batch_logs(&response);
    Ok(Envelope::success(response, message).with_logs(logs))
}

fn batch_logs(response: &BatchResponse) -> Vec<String> {
    response
        .errors
        .iter()
        .map(|e| match (e.row, e.student_code.as_deref()) {
            (Some(row), Some(code)) => format!("Row {} ({}): {}", row, code, e.error),
            (None, Some(code)) => format!("{}: {}", code, e.error),
            (Some(row), None) => format!("Row {}: {}", row, e.error),
            (None, None) => e.error.clone(),
        })
        .chain(response.formula_warnings.iter().cloned())
        .collect()
}

/// Students whose fee data is complete and who still owe something.
#[instrument(skip(state, _caller, query))]
pub async fn get_unpaid_students(
    State(state): State<AppState>,
    _caller: AdminCaller,
    QueryParams(query): QueryParams<OrderIdRequest>,
) -> Result<Envelope<Vec<OrderStudentResponse>>, AppError> {
    query.validate()?;
    let students: Vec<OrderStudentResponse> = state
        .finance
        .unpaid_students(query.order_id()?)
        .await?
        .into_iter()
        .map(OrderStudentResponse::from)
        .collect();

    let message = format!("Found {} unpaid students", students.len());
    Ok(Envelope::success(students, message))
}
