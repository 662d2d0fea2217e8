use axum::{
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use serde_json::{json, Value};

use crate::{
    auth::require_user,
    authz::{require, Action},
    db::db_pool,
    error::AppResult,
    repository::table_service::{count_rows, list_rows},
    schemas::{clamp_limit_in_range, remove_nulls, serialize_to_map, AuditLogsQuery},
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new().route("/v1/audit-logs", axum::routing::get(list_audit_logs))
}

async fn list_audit_logs(
    State(state): State<AppState>,
    Query(query): Query<AuditLogsQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user = require_user(&state, &headers).await?;
    require(&user, Action::ViewAuditLog)?;
    let pool = db_pool(&state)?;

    let filters = remove_nulls(serialize_to_map(&query));
    let total = count_rows(pool, "audit_logs", Some(&filters)).await?;
    let rows = list_rows(
        pool,
        "audit_logs",
        Some(&filters),
        clamp_limit_in_range(query.limit, 1, 200),
        query.offset,
        "created_at",
        false,
    )
    .await?;

    Ok(Json(json!({ "data": rows, "total": total })))
}
