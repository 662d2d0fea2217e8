use axum::{
    extract::{Path, Query, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use chrono::Utc;
use serde_json::{json, Map, Value};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    auth::require_user,
    authz::{ensure_unit_access, is_allowed, require, Action},
    db::db_pool,
    error::{map_db_error, AppError, AppResult},
    models::Unit,
    repository::table_service::{create_row, list_rows, update_row},
    schemas::{
        clamp_limit_in_range, remove_nulls, serialize_to_map, validate_input, CreateUnitInput,
        PayManualArrearsInput, UnitPath, UnitsQuery, UpdateUnitInput,
    },
    services::{
        arrears::{arrears_for_units, load_user_units},
        audit::write_audit_log,
        funds::parse_amount,
        payments::pay_manual_arrears,
    },
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/v1/units", axum::routing::get(list_units).post(create_unit))
        .route(
            "/v1/units/{unit_id}",
            axum::routing::get(get_unit)
                .patch(update_unit)
                .delete(delete_unit),
        )
        .route(
            "/v1/units/{unit_id}/pay-manual-arrears",
            axum::routing::post(pay_unit_manual_arrears),
        )
}

async fn list_units(
    State(state): State<AppState>,
    Query(query): Query<UnitsQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user = require_user(&state, &headers).await?;
    let pool = db_pool(&state)?;

    if !is_allowed(Action::ViewAllUnits, user.role) {
        let units = load_user_units(pool, user.id).await?;
        return Ok(Json(json!({ "data": units })));
    }

    let mut filters = Map::new();
    filters.insert("deleted_at__is_null".to_string(), Value::Bool(true));
    if !query.include_inactive {
        filters.insert("is_active".to_string(), Value::Bool(true));
    }
    if let Some(q) = query.q.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
        filters.insert("unit_number__ilike".to_string(), Value::String(q.to_string()));
    }

    let rows = list_rows(
        pool,
        "units",
        Some(&filters),
        clamp_limit_in_range(query.limit, 1, 500),
        0,
        "unit_number",
        true,
    )
    .await?;
    Ok(Json(json!({ "data": rows })))
}

async fn load_unit(pool: &PgPool, unit_id: Uuid) -> AppResult<Unit> {
    sqlx::query_as::<_, Unit>("SELECT * FROM units WHERE id = $1 AND deleted_at IS NULL")
        .bind(unit_id)
        .fetch_optional(pool)
        .await
        .map_err(map_db_error)?
        .ok_or_else(|| AppError::NotFound("Unit tidak dijumpai.".to_string()))
}

async fn get_unit(
    State(state): State<AppState>,
    Path(path): Path<UnitPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user = require_user(&state, &headers).await?;
    let pool = db_pool(&state)?;
    let unit = load_unit(pool, path.unit_id).await?;
    ensure_unit_access(&user, &unit)?;

    let arrears = arrears_for_units(pool, std::slice::from_ref(&unit)).await?;
    Ok(Json(json!({ "unit": unit, "arrears": arrears })))
}

async fn create_unit(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateUnitInput>,
) -> AppResult<impl IntoResponse> {
    let user = require_user(&state, &headers).await?;
    require(&user, Action::ManageUnits)?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    let mut record = remove_nulls(serialize_to_map(&payload));
    if let Some(Value::String(number)) = record.get_mut("unit_number") {
        *number = number.trim().to_uppercase();
    }
    let created = create_row(pool, "units", &record).await?;
    let entity_id = value_str(&created, "id");
    write_audit_log(
        Some(pool),
        Some(user.id),
        "unit.created",
        "units",
        Some(&entity_id),
        None,
        Some(created.clone()),
    )
    .await;
    Ok((StatusCode::CREATED, Json(created)))
}

async fn update_unit(
    State(state): State<AppState>,
    Path(path): Path<UnitPath>,
    headers: HeaderMap,
    Json(payload): Json<UpdateUnitInput>,
) -> AppResult<Json<Value>> {
    let user = require_user(&state, &headers).await?;
    require(&user, Action::ManageUnits)?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;
    let before = load_unit(pool, path.unit_id).await?;

    let mut patch = remove_nulls(serialize_to_map(&payload));
    if payload.clear_tenant {
        patch.insert("tenant_id".to_string(), Value::Null);
    }
    if let Some(Value::String(number)) = patch.get_mut("unit_number") {
        *number = number.trim().to_uppercase();
    }

    let updated = update_row(pool, "units", path.unit_id, &patch).await?;
    write_audit_log(
        Some(pool),
        Some(user.id),
        "unit.updated",
        "units",
        Some(&path.unit_id.to_string()),
        Some(json!(before)),
        Some(updated.clone()),
    )
    .await;
    Ok(Json(updated))
}

/// Units with billing history are never hard-deleted.
async fn delete_unit(
    State(state): State<AppState>,
    Path(path): Path<UnitPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user = require_user(&state, &headers).await?;
    require(&user, Action::ManageUnits)?;
    let pool = db_pool(&state)?;
    let before = load_unit(pool, path.unit_id).await?;

    let mut patch = Map::new();
    patch.insert("is_active".to_string(), Value::Bool(false));
    patch.insert("deleted_at".to_string(), Value::String(Utc::now().to_rfc3339()));
    let deleted = update_row(pool, "units", path.unit_id, &patch).await?;

    write_audit_log(
        Some(pool),
        Some(user.id),
        "unit.deleted",
        "units",
        Some(&path.unit_id.to_string()),
        Some(json!(before)),
        Some(deleted.clone()),
    )
    .await;
    Ok(Json(deleted))
}

async fn pay_unit_manual_arrears(
    State(state): State<AppState>,
    Path(path): Path<UnitPath>,
    headers: HeaderMap,
    Json(payload): Json<PayManualArrearsInput>,
) -> AppResult<Json<Value>> {
    let user = require_user(&state, &headers).await?;
    require(&user, Action::PayManualArrears)?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    let amount = parse_amount(payload.amount)?;
    let today = Utc::now()
        .with_timezone(&state.config.app_timezone)
        .date_naive();
    let payment =
        pay_manual_arrears(pool, &user, path.unit_id, amount, &payload.reference, today).await?;

    Ok(Json(json!({
        "success": true,
        "unit": payment.unit,
        "income": payment.income,
        "remaining": payment.remaining,
    })))
}

fn value_str(row: &Value, key: &str) -> String {
    row.as_object()
        .and_then(|obj| obj.get(key))
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}
