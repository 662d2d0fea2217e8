use axum::{
    extract::{Multipart, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde_json::{json, Value};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    auth::{require_user, SessionUser},
    authz::{ensure_unit_access, require, Action},
    db::db_pool,
    error::{map_db_error, AppError, AppResult},
    models::{Bill, BillStatus, Unit},
    routes::forms::read_form,
    schemas::{
        clamp_limit_in_range, validate_input, BillPath, BillsQuery, CreateBillInput,
        GenerateBillsInput, OnlinePaymentInput, VerifyPaymentInput,
    },
    services::{
        audit::write_audit_log,
        billing::{create_bill, generate_monthly_bills, BillingPeriod},
        cron::target_period,
        payments::{apply_payment_command, plan_transition, PaymentCommand},
        uploads::{store_upload, UploadCategory},
    },
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route(
            "/v1/bills",
            axum::routing::get(list_bills).post(create_single_bill),
        )
        .route("/v1/bills/generate", axum::routing::post(generate_bills))
        .route("/v1/bills/{bill_id}", axum::routing::get(get_bill))
        .route(
            "/v1/bills/{bill_id}/receipt",
            axum::routing::post(upload_receipt),
        )
        .route("/v1/bills/{bill_id}/verify", axum::routing::post(verify_payment))
        .route(
            "/v1/bills/{bill_id}/manual-payment",
            axum::routing::post(record_manual_payment),
        )
        .route("/v1/bills/{bill_id}/fpx", axum::routing::post(pay_online))
        .route(
            "/v1/bills/{bill_id}/refund",
            axum::routing::post(initiate_refund),
        )
        .route(
            "/v1/bills/{bill_id}/refund/approve",
            axum::routing::post(approve_refund),
        )
}

async fn list_bills(
    State(state): State<AppState>,
    Query(query): Query<BillsQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user = require_user(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let status = match query.status.as_deref().map(str::trim).filter(|s| !s.is_empty()) {
        Some(raw) => Some(
            BillStatus::parse(raw)
                .ok_or_else(|| AppError::BadRequest(format!("Status bil tidak sah: {raw}")))?,
        ),
        None => None,
    };
    let occupant = (!user.role.is_management()).then_some(user.id);

    let bills = sqlx::query_as::<_, Bill>(
        "SELECT b.* FROM bills b
         JOIN units u ON u.id = b.unit_id
         WHERE ($1::bill_status IS NULL OR b.status = $1)
           AND ($2::uuid IS NULL OR b.unit_id = $2)
           AND ($3::smallint IS NULL OR b.month = $3)
           AND ($4::integer IS NULL OR b.year = $4)
           AND ($5::uuid IS NULL OR u.owner_id = $5 OR u.tenant_id = $5)
         ORDER BY b.year DESC, b.month DESC, u.unit_number
         LIMIT $6",
    )
    .bind(status)
    .bind(query.unit_id)
    .bind(query.month)
    .bind(query.year)
    .bind(occupant)
    .bind(clamp_limit_in_range(query.limit, 1, 500))
    .fetch_all(pool)
    .await
    .map_err(map_db_error)?;

    Ok(Json(json!({ "data": bills })))
}

async fn load_bill_with_unit(pool: &PgPool, bill_id: Uuid) -> AppResult<(Bill, Unit)> {
    let bill = sqlx::query_as::<_, Bill>("SELECT * FROM bills WHERE id = $1")
        .bind(bill_id)
        .fetch_optional(pool)
        .await
        .map_err(map_db_error)?
        .ok_or_else(|| AppError::NotFound("Bil tidak dijumpai.".to_string()))?;
    let unit = sqlx::query_as::<_, Unit>("SELECT * FROM units WHERE id = $1")
        .bind(bill.unit_id)
        .fetch_one(pool)
        .await
        .map_err(map_db_error)?;
    Ok((bill, unit))
}

async fn get_bill(
    State(state): State<AppState>,
    Path(path): Path<BillPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user = require_user(&state, &headers).await?;
    let pool = db_pool(&state)?;
    let (bill, unit) = load_bill_with_unit(pool, path.bill_id).await?;
    ensure_unit_access(&user, &unit)?;
    Ok(Json(json!({
        "bill": bill,
        "unit_number": unit.unit_number,
        "is_refunded": bill.is_refunded(),
    })))
}

async fn generate_bills(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: Option<Json<GenerateBillsInput>>,
) -> AppResult<Json<Value>> {
    let user = require_user(&state, &headers).await?;
    require(&user, Action::GenerateBills)?;
    let input = body.map(|Json(input)| input).unwrap_or_default();
    validate_input(&input)?;
    let pool = db_pool(&state)?;

    let period = target_period(Utc::now(), state.config.app_timezone, input.month, input.year)?;
    let report = generate_monthly_bills(pool, &state.notifier, period).await?;

    write_audit_log(
        Some(pool),
        Some(user.id),
        "bills.generated",
        "bills",
        None,
        None,
        Some(json!(report)),
    )
    .await;

    Ok(Json(json!({
        "success": true,
        "count": report.created,
        "skipped": report.skipped,
        "failed": report.failed,
        "month": report.month,
        "year": report.year,
    })))
}

async fn create_single_bill(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateBillInput>,
) -> AppResult<impl IntoResponse> {
    let user = require_user(&state, &headers).await?;
    require(&user, Action::CreateBill)?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    let unit = sqlx::query_as::<_, Unit>("SELECT * FROM units WHERE id = $1 AND deleted_at IS NULL")
        .bind(payload.unit_id)
        .fetch_optional(pool)
        .await
        .map_err(map_db_error)?
        .ok_or_else(|| AppError::NotFound("Unit tidak dijumpai.".to_string()))?;

    let period = BillingPeriod::new(payload.month, payload.year)?;
    let bill = create_bill(pool, &unit, payload.bill_type, period, payload.amount).await?;

    write_audit_log(
        Some(pool),
        Some(user.id),
        "bill.created",
        "bills",
        Some(&bill.id.to_string()),
        None,
        Some(json!({
            "unit_id": unit.id,
            "type": bill.bill_type,
            "amount": bill.amount,
            "period": period.label(),
        })),
    )
    .await;

    Ok((StatusCode::CREATED, Json(bill)))
}

/// Resident or staff uploads a transfer receipt; the bill moves to PAID.
async fn upload_receipt(
    State(state): State<AppState>,
    Path(path): Path<BillPath>,
    headers: HeaderMap,
    multipart: Multipart,
) -> AppResult<Json<Value>> {
    let user = require_user(&state, &headers).await?;
    require(&user, Action::UploadReceipt)?;
    let pool = db_pool(&state)?;
    let (bill, unit) = load_bill_with_unit(pool, path.bill_id).await?;
    ensure_unit_access(&user, &unit)?;

    // Fail fast before writing the file; the command re-checks under lock.
    plan_transition(
        &bill,
        &PaymentCommand::UploadReceipt {
            receipt_url: "pending".to_string(),
        },
    )?;

    let form = read_form(multipart).await?;
    let file = form.require_file()?;
    let receipt_url = store_upload(
        &state.config,
        UploadCategory::Receipts,
        file.content_type.as_deref(),
        &file.bytes,
    )
    .await?;

    run_command(
        &state,
        pool,
        &user,
        bill.id,
        PaymentCommand::UploadReceipt { receipt_url },
    )
    .await
}

async fn verify_payment(
    State(state): State<AppState>,
    Path(path): Path<BillPath>,
    headers: HeaderMap,
    Json(payload): Json<VerifyPaymentInput>,
) -> AppResult<Json<Value>> {
    let user = require_user(&state, &headers).await?;
    require(&user, Action::VerifyPayment)?;
    let pool = db_pool(&state)?;
    run_command(
        &state,
        pool,
        &user,
        path.bill_id,
        PaymentCommand::Verify {
            approve: payload.approve,
        },
    )
    .await
}

/// Multipart: `reference` (required) and an optional receipt `file`.
async fn record_manual_payment(
    State(state): State<AppState>,
    Path(path): Path<BillPath>,
    headers: HeaderMap,
    multipart: Multipart,
) -> AppResult<Json<Value>> {
    let user = require_user(&state, &headers).await?;
    require(&user, Action::RecordManualPayment)?;
    let pool = db_pool(&state)?;

    let form = read_form(multipart).await?;
    let reference = form
        .text("reference")
        .ok_or_else(|| AppError::BadRequest("Nombor rujukan bayaran diperlukan.".to_string()))?
        .to_string();

    let receipt_url = match form.file.as_ref().filter(|file| !file.bytes.is_empty()) {
        Some(file) => Some(
            store_upload(
                &state.config,
                UploadCategory::Receipts,
                file.content_type.as_deref(),
                &file.bytes,
            )
            .await?,
        ),
        None => None,
    };

    run_command(
        &state,
        pool,
        &user,
        path.bill_id,
        PaymentCommand::ManualPayment {
            reference,
            receipt_url,
        },
    )
    .await
}

/// Simulated FPX checkout: the payment is treated as confirmed.
async fn pay_online(
    State(state): State<AppState>,
    Path(path): Path<BillPath>,
    headers: HeaderMap,
    body: Option<Json<OnlinePaymentInput>>,
) -> AppResult<Json<Value>> {
    let user = require_user(&state, &headers).await?;
    require(&user, Action::PayOnline)?;
    let payload = body.map(|Json(payload)| payload).unwrap_or_default();
    validate_input(&payload)?;
    let pool = db_pool(&state)?;
    let (bill, unit) = load_bill_with_unit(pool, path.bill_id).await?;
    ensure_unit_access(&user, &unit)?;

    run_command(
        &state,
        pool,
        &user,
        bill.id,
        PaymentCommand::online(payload.reference.as_deref()),
    )
    .await
}

/// Multipart: optional `reference`, repeated `checklist` items and an optional
/// photo `file`. At least one must be present.
async fn initiate_refund(
    State(state): State<AppState>,
    Path(path): Path<BillPath>,
    headers: HeaderMap,
    multipart: Multipart,
) -> AppResult<Json<Value>> {
    let user = require_user(&state, &headers).await?;
    require(&user, Action::InitiateRefund)?;
    let pool = db_pool(&state)?;

    let form = read_form(multipart).await?;
    let reference = form.text("reference").map(ToOwned::to_owned);
    let checklist = form.texts("checklist");

    let (bill, _) = load_bill_with_unit(pool, path.bill_id).await?;
    let has_photo = form.file.as_ref().is_some_and(|file| !file.bytes.is_empty());
    plan_transition(
        &bill,
        &PaymentCommand::InitiateRefund {
            reference: reference.clone(),
            evidence_url: has_photo.then(|| "pending".to_string()),
            checklist: checklist.clone(),
        },
    )?;

    let evidence_url = match form.file.as_ref().filter(|_| has_photo) {
        Some(file) => Some(
            store_upload(
                &state.config,
                UploadCategory::Refunds,
                file.content_type.as_deref(),
                &file.bytes,
            )
            .await?,
        ),
        None => None,
    };

    run_command(
        &state,
        pool,
        &user,
        bill.id,
        PaymentCommand::InitiateRefund {
            reference,
            evidence_url,
            checklist,
        },
    )
    .await
}

/// Multipart: payout proof `file` (required).
async fn approve_refund(
    State(state): State<AppState>,
    Path(path): Path<BillPath>,
    headers: HeaderMap,
    multipart: Multipart,
) -> AppResult<Json<Value>> {
    let user = require_user(&state, &headers).await?;
    require(&user, Action::ApproveRefund)?;
    let pool = db_pool(&state)?;

    let (bill, _) = load_bill_with_unit(pool, path.bill_id).await?;
    plan_transition(
        &bill,
        &PaymentCommand::ApproveRefund {
            payout_proof_url: "pending".to_string(),
        },
    )?;

    let form = read_form(multipart).await?;
    let file = form.require_file()?;
    let payout_proof_url = store_upload(
        &state.config,
        UploadCategory::Refunds,
        file.content_type.as_deref(),
        &file.bytes,
    )
    .await?;

    run_command(
        &state,
        pool,
        &user,
        bill.id,
        PaymentCommand::ApproveRefund { payout_proof_url },
    )
    .await
}

async fn run_command(
    state: &AppState,
    pool: &PgPool,
    user: &SessionUser,
    bill_id: Uuid,
    command: PaymentCommand,
) -> AppResult<Json<Value>> {
    let outcome = apply_payment_command(pool, &state.notifier, user, bill_id, command).await?;
    Ok(Json(json!({
        "changed": outcome.changed,
        "bill": outcome.bill,
        "income": outcome.income,
        "is_refunded": outcome.bill.is_refunded(),
    })))
}
