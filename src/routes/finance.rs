use axum::{
    extract::{Multipart, Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use rust_decimal::Decimal;
use serde_json::{json, Value};

use crate::{
    auth::require_user,
    authz::{require, Action},
    db::db_pool,
    error::AppResult,
    repository::table_service::{create_row, list_rows},
    routes::forms::read_form,
    schemas::{
        clamp_limit_in_range, remove_nulls, serialize_to_map, validate_input,
        CreateCategoryInput, CreateExpenseInput, ExpenseDecisionInput, ExpensePath, FinanceQuery,
        RecordIncomeInput,
    },
    services::{
        audit::write_audit_log,
        funds::{
            decide_expense, fund_balances, list_expenses, list_income, parse_amount,
            record_income, submit_expense, NewExpense,
        },
        uploads::{store_upload, UploadCategory},
    },
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/v1/finance", axum::routing::get(finance_summary))
        .route(
            "/v1/finance/income",
            axum::routing::get(get_income).post(create_income),
        )
        .route(
            "/v1/finance/expenses",
            axum::routing::get(get_expenses).post(create_expense),
        )
        .route(
            "/v1/finance/expenses/receipt",
            axum::routing::post(upload_expense_receipt),
        )
        .route(
            "/v1/finance/expenses/{expense_id}/decision",
            axum::routing::post(decide),
        )
        .route(
            "/v1/finance/categories",
            axum::routing::get(list_categories).post(create_category),
        )
}

async fn finance_summary(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user = require_user(&state, &headers).await?;
    require(&user, Action::ViewFinanceSummary)?;
    let pool = db_pool(&state)?;

    let funds = fund_balances(pool).await?;
    let total = funds
        .iter()
        .fold(Decimal::ZERO, |sum, fund| sum + fund.balance);
    Ok(Json(json!({ "funds": funds, "total_balance": total })))
}

async fn get_income(
    State(state): State<AppState>,
    Query(query): Query<FinanceQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user = require_user(&state, &headers).await?;
    require(&user, Action::ViewLedger)?;
    let pool = db_pool(&state)?;
    let rows = list_income(pool, query.fund_code, clamp_limit_in_range(query.limit, 1, 500)).await?;
    Ok(Json(json!({ "data": rows })))
}

async fn create_income(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<RecordIncomeInput>,
) -> AppResult<impl IntoResponse> {
    let user = require_user(&state, &headers).await?;
    require(&user, Action::RecordIncome)?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    let amount = parse_amount(payload.amount)?;
    let income_date = payload.income_date.unwrap_or_else(|| {
        Utc::now()
            .with_timezone(&state.config.app_timezone)
            .date_naive()
    });
    let income = record_income(
        pool,
        &user,
        payload.fund_code,
        amount,
        income_date,
        &payload.description,
        payload.unit_id,
    )
    .await?;
    Ok((StatusCode::CREATED, Json(income)))
}

async fn get_expenses(
    State(state): State<AppState>,
    Query(query): Query<FinanceQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user = require_user(&state, &headers).await?;
    require(&user, Action::ViewLedger)?;
    let pool = db_pool(&state)?;
    let rows = list_expenses(pool, query.status, clamp_limit_in_range(query.limit, 1, 500)).await?;
    Ok(Json(json!({ "data": rows })))
}

async fn create_expense(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateExpenseInput>,
) -> AppResult<impl IntoResponse> {
    let user = require_user(&state, &headers).await?;
    require(&user, Action::SubmitExpense)?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    let expense = submit_expense(
        pool,
        &user,
        NewExpense {
            fund_code: payload.fund_code,
            category_id: payload.category_id,
            amount: parse_amount(payload.amount)?,
            description: &payload.description,
            expense_date: payload.expense_date,
            receipt_url: payload.receipt_url.as_deref(),
        },
    )
    .await?;
    Ok((StatusCode::CREATED, Json(expense)))
}

/// Stores a receipt ahead of `POST /v1/finance/expenses`, which takes the
/// returned URL.
async fn upload_expense_receipt(
    State(state): State<AppState>,
    headers: HeaderMap,
    multipart: Multipart,
) -> AppResult<Json<Value>> {
    let user = require_user(&state, &headers).await?;
    require(&user, Action::SubmitExpense)?;

    let form = read_form(multipart).await?;
    let file = form.require_file()?;
    let url = store_upload(
        &state.config,
        UploadCategory::Expenses,
        file.content_type.as_deref(),
        &file.bytes,
    )
    .await?;
    Ok(Json(json!({ "url": url })))
}

async fn decide(
    State(state): State<AppState>,
    Path(path): Path<ExpensePath>,
    headers: HeaderMap,
    Json(payload): Json<ExpenseDecisionInput>,
) -> AppResult<Json<Value>> {
    let user = require_user(&state, &headers).await?;
    require(&user, Action::ApproveExpense)?;
    let pool = db_pool(&state)?;
    let expense = decide_expense(pool, &user, path.expense_id, payload.approve).await?;
    Ok(Json(json!(expense)))
}

async fn list_categories(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user = require_user(&state, &headers).await?;
    require(&user, Action::ViewLedger)?;
    let pool = db_pool(&state)?;
    let rows = list_rows(pool, "expense_categories", None, 500, 0, "name", true).await?;
    Ok(Json(json!({ "data": rows })))
}

async fn create_category(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateCategoryInput>,
) -> AppResult<impl IntoResponse> {
    let user = require_user(&state, &headers).await?;
    require(&user, Action::ApproveExpense)?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    let mut record = remove_nulls(serialize_to_map(&payload));
    record.insert(
        "name".to_string(),
        Value::String(payload.name.trim().to_string()),
    );
    let created = create_row(pool, "expense_categories", &record).await?;
    write_audit_log(
        Some(pool),
        Some(user.id),
        "expense_category.created",
        "expense_categories",
        created.get("id").and_then(Value::as_str),
        None,
        Some(created.clone()),
    )
    .await;
    Ok((StatusCode::CREATED, Json(created)))
}
