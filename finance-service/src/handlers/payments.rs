use crate::dtos::{
    parse_id, DebitNotePreview, DebitNoteQuery, MilestonePaymentRequest, MilestonePaymentResponse,
    PaymentResponse, UpdatePaymentRequest,
};
use crate::middleware::AdminCaller;
use crate::services::metrics;
use crate::startup::AppState;
use axum::extract::State;
use service_core::error::AppError;
use service_core::extract::{QueryParams, RequestBody};
use service_core::response::Envelope;
use tracing::instrument;
use validator::Validate;

fn cascade_logs(updated: bool) -> Vec<String> {
    if updated {
        Vec::new()
    } else {
        vec!["Finance student summary could not be updated; it will be corrected by the next update".to_string()]
    }
}

#[instrument(skip(state, caller, request), fields(user_id = %caller.0.user_id))]
pub async fn update_order_student_payment(
    State(state): State<AppState>,
    caller: AdminCaller,
    RequestBody(request): RequestBody<UpdatePaymentRequest>,
) -> Result<Envelope<PaymentResponse>, AppError> {
    request.validate()?;
    let order_student_id = parse_id("order_student_id", &request.order_student_id)?;

    let update = state
        .finance
        .update_payment(
            order_student_id,
            request.paid_amount,
            request.notes.as_deref(),
            caller.0.recorded_by(),
        )
        .await
        .inspect_err(|e| metrics::record_error(e.code()))?;

    let logs = cascade_logs(update.finance_student_updated);
    Ok(Envelope::success(PaymentResponse::from(update), "Payment updated").with_logs(logs))
}

#[instrument(skip(state, caller, request), fields(user_id = %caller.0.user_id))]
pub async fn record_milestone_payment(
    State(state): State<AppState>,
    caller: AdminCaller,
    RequestBody(request): RequestBody<MilestonePaymentRequest>,
) -> Result<Envelope<MilestonePaymentResponse>, AppError> {
    request.validate()?;
    let order_student_id = parse_id("order_student_id", &request.order_student_id)?;
    let key = request.milestone_key()?;

    let outcome = state
        .finance
        .record_milestone_payment(
            order_student_id,
            key,
            request.amount,
            request.notes.as_deref(),
            caller.0.recorded_by(),
        )
        .await
        .inspect_err(|e| metrics::record_error(e.code()))?;

    let logs = cascade_logs(outcome.update.finance_student_updated);
    let message = format!("Payment recorded for {}", key);
    Ok(Envelope::success(MilestonePaymentResponse::from(outcome), message).with_logs(logs))
}

#[instrument(skip(state, _caller, query))]
pub async fn get_debit_note_preview(
    State(state): State<AppState>,
    _caller: AdminCaller,
    QueryParams(query): QueryParams<DebitNoteQuery>,
) -> Result<Envelope<DebitNotePreview>, AppError> {
    query.validate()?;
    let order_student_id = parse_id("order_student_id", &query.order_student_id)?;

    let data = state
        .finance
        .debit_note(order_student_id, query.milestone_key()?)
        .await?;
    Ok(Envelope::success(DebitNotePreview::from(data), "Debit note preview"))
}
