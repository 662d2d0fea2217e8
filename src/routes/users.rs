use axum::{
    extract::{Path, Query, State},
    http::HeaderMap,
    Json,
};
use serde_json::{json, Map, Value};
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    auth::require_user,
    authz::{require, Action},
    db::db_pool,
    error::AppResult,
    repository::table_service::list_rows,
    schemas::{
        clamp_limit_in_range, validate_input, EligibilityOverrideInput, UserPath, UsersQuery,
    },
    services::{
        arrears::arrears_for_user,
        voting::{evaluate_eligibility, load_user, set_eligibility_override},
    },
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/v1/user/me", axum::routing::get(me))
        .route("/v1/users", axum::routing::get(list_users))
        .route("/v1/users/{user_id}", axum::routing::get(get_user))
        .route(
            "/v1/users/{user_id}/voting-eligibility",
            axum::routing::put(override_voting_eligibility),
        )
}

/// Profile, units, arrears and voting eligibility in one payload.
async fn user_profile(pool: &PgPool, user_id: Uuid) -> AppResult<Value> {
    let user = load_user(pool, user_id).await?;
    let (units, arrears) = arrears_for_user(pool, user_id).await?;
    let eligibility = evaluate_eligibility(
        units.len(),
        &arrears,
        user.voting_eligibility_override,
        user.voting_eligibility_reason.as_deref(),
    );
    Ok(json!({
        "user": user,
        "units": units,
        "arrears": arrears,
        "voting": eligibility,
    }))
}

async fn me(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Json<Value>> {
    let user = require_user(&state, &headers).await?;
    let pool = db_pool(&state)?;
    Ok(Json(user_profile(pool, user.id).await?))
}

async fn list_users(
    State(state): State<AppState>,
    Query(query): Query<UsersQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user = require_user(&state, &headers).await?;
    require(&user, Action::ViewUsers)?;
    let pool = db_pool(&state)?;

    let mut filters = Map::new();
    if let Some(role) = query.role {
        filters.insert("role".to_string(), Value::String(role.as_str().to_string()));
    }
    if let Some(q) = query.q.as_deref().map(str::trim).filter(|q| !q.is_empty()) {
        filters.insert("name__ilike".to_string(), Value::String(q.to_string()));
    }

    let rows = list_rows(
        pool,
        "users",
        Some(&filters),
        clamp_limit_in_range(query.limit, 1, 500),
        0,
        "name",
        true,
    )
    .await?;
    Ok(Json(json!({ "data": rows })))
}

async fn get_user(
    State(state): State<AppState>,
    Path(path): Path<UserPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user = require_user(&state, &headers).await?;
    if user.id != path.user_id {
        require(&user, Action::ViewUsers)?;
    }
    let pool = db_pool(&state)?;
    Ok(Json(user_profile(pool, path.user_id).await?))
}

async fn override_voting_eligibility(
    State(state): State<AppState>,
    Path(path): Path<UserPath>,
    headers: HeaderMap,
    Json(payload): Json<EligibilityOverrideInput>,
) -> AppResult<Json<Value>> {
    let user = require_user(&state, &headers).await?;
    require(&user, Action::OverrideVotingEligibility)?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;

    set_eligibility_override(
        pool,
        &user,
        path.user_id,
        payload.eligible,
        payload.reason.as_deref(),
    )
    .await?;
    Ok(Json(user_profile(pool, path.user_id).await?))
}
