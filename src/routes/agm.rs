use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::IntoResponse,
    Json,
};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    auth::require_user,
    authz::{is_allowed, require, Action},
    db::db_pool,
    error::{map_db_error, AppError, AppResult},
    models::{AgmStatus, Vote},
    schemas::{
        validate_input, AgmPath, CastVoteInput, CreateAgmInput, CreateResolutionInput,
        ResolutionPath,
    },
    services::voting::{
        add_resolution, agm_results, cast_vote, change_agm_status, create_agm,
        eligibility_for_user, list_agms, list_resolutions, load_agm,
    },
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/v1/agm", axum::routing::get(get_agms).post(post_agm))
        .route("/v1/agm/eligibility", axum::routing::get(my_eligibility))
        .route("/v1/agm/{agm_id}", axum::routing::get(get_agm))
        .route(
            "/v1/agm/{agm_id}/resolutions",
            axum::routing::post(post_resolution),
        )
        .route("/v1/agm/{agm_id}/activate", axum::routing::post(activate))
        .route("/v1/agm/{agm_id}/close", axum::routing::post(close))
        .route("/v1/agm/{agm_id}/results", axum::routing::get(results))
        .route(
            "/v1/agm/resolutions/{resolution_id}/vote",
            axum::routing::post(vote),
        )
}

async fn get_agms(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Json<Value>> {
    let user = require_user(&state, &headers).await?;
    let pool = db_pool(&state)?;
    let manager = is_allowed(Action::ManageAgm, user.role);

    let agms = list_agms(pool)
        .await?
        .into_iter()
        .filter(|agm| manager || agm.status != AgmStatus::Draft)
        .collect::<Vec<_>>();
    Ok(Json(json!({ "data": agms })))
}

async fn post_agm(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<CreateAgmInput>,
) -> AppResult<impl IntoResponse> {
    let user = require_user(&state, &headers).await?;
    require(&user, Action::ManageAgm)?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;
    let agm = create_agm(pool, &user, &payload.title, payload.meeting_date).await?;
    Ok((StatusCode::CREATED, Json(agm)))
}

async fn my_eligibility(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user = require_user(&state, &headers).await?;
    let pool = db_pool(&state)?;
    let eligibility = eligibility_for_user(pool, user.id).await?;
    Ok(Json(json!(eligibility)))
}

async fn get_agm(
    State(state): State<AppState>,
    Path(path): Path<AgmPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user = require_user(&state, &headers).await?;
    let pool = db_pool(&state)?;
    let agm = load_agm(pool, path.agm_id).await?;
    if agm.status == AgmStatus::Draft && !is_allowed(Action::ManageAgm, user.role) {
        return Err(AppError::NotFound("Mesyuarat agung tidak dijumpai.".to_string()));
    }

    let resolutions = list_resolutions(pool, agm.id).await?;
    let my_votes = sqlx::query_as::<_, Vote>(
        "SELECT v.* FROM votes v
         JOIN agm_resolutions r ON r.id = v.resolution_id
         WHERE r.agm_id = $1 AND v.user_id = $2",
    )
    .bind(agm.id)
    .bind(user.id)
    .fetch_all(pool)
    .await
    .map_err(map_db_error)?;

    Ok(Json(json!({
        "agm": agm,
        "resolutions": resolutions,
        "my_votes": my_votes,
    })))
}

async fn post_resolution(
    State(state): State<AppState>,
    Path(path): Path<AgmPath>,
    headers: HeaderMap,
    Json(payload): Json<CreateResolutionInput>,
) -> AppResult<impl IntoResponse> {
    let user = require_user(&state, &headers).await?;
    require(&user, Action::ManageAgm)?;
    validate_input(&payload)?;
    let pool = db_pool(&state)?;
    let resolution = add_resolution(
        pool,
        &user,
        path.agm_id,
        &payload.title,
        payload.description.as_deref(),
    )
    .await?;
    Ok((StatusCode::CREATED, Json(resolution)))
}

async fn transition(
    state: &AppState,
    headers: &HeaderMap,
    agm_id: Uuid,
    target: AgmStatus,
) -> AppResult<Json<Value>> {
    let user = require_user(state, headers).await?;
    require(&user, Action::ManageAgm)?;
    let pool = db_pool(state)?;
    let agm = change_agm_status(pool, &user, agm_id, target).await?;
    Ok(Json(json!(agm)))
}

async fn activate(
    State(state): State<AppState>,
    Path(path): Path<AgmPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    transition(&state, &headers, path.agm_id, AgmStatus::Active).await
}

async fn close(
    State(state): State<AppState>,
    Path(path): Path<AgmPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    transition(&state, &headers, path.agm_id, AgmStatus::Closed).await
}

/// Committee sees running tallies; everyone else only once the AGM is closed.
async fn results(
    State(state): State<AppState>,
    Path(path): Path<AgmPath>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user = require_user(&state, &headers).await?;
    let pool = db_pool(&state)?;
    let agm = load_agm(pool, path.agm_id).await?;
    if agm.status != AgmStatus::Closed {
        require(&user, Action::ManageAgm)?;
    }
    let tallies = agm_results(pool, agm.id).await?;
    Ok(Json(json!({ "agm": agm, "results": tallies })))
}

async fn vote(
    State(state): State<AppState>,
    Path(path): Path<ResolutionPath>,
    headers: HeaderMap,
    Json(payload): Json<CastVoteInput>,
) -> AppResult<Json<Value>> {
    let user = require_user(&state, &headers).await?;
    require(&user, Action::CastVote)?;
    let pool = db_pool(&state)?;
    let vote = cast_vote(pool, &user, path.resolution_id, payload.choice).await?;
    Ok(Json(json!({ "success": true, "vote": vote })))
}
