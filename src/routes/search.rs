use axum::{
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use serde_json::{json, Map, Value};
use uuid::Uuid;

use crate::{
    auth::require_user,
    authz::{is_allowed, Action},
    db::db_pool,
    error::{map_db_error, AppError, AppResult},
    models::Role,
    repository::table_service::list_rows,
    schemas::{clamp_limit_in_range, SearchQuery},
    services::arrears::load_user_units,
    state::AppState,
};

const MIN_QUERY_CHARS: usize = 2;

pub fn router() -> axum::Router<AppState> {
    axum::Router::new().route("/v1/search", axum::routing::get(search))
}

fn normalize_query(raw: &str) -> AppResult<String> {
    let q = raw.trim();
    if q.chars().count() < MIN_QUERY_CHARS {
        return Err(AppError::BadRequest(format!(
            "Carian memerlukan sekurang-kurangnya {MIN_QUERY_CHARS} aksara."
        )));
    }
    Ok(q.to_string())
}

async fn search(
    State(state): State<AppState>,
    Query(query): Query<SearchQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user = require_user(&state, &headers).await?;
    let q = normalize_query(&query.q)?;
    let pool = db_pool(&state)?;
    let limit = clamp_limit_in_range(query.limit, 1, 50);

    if !is_allowed(Action::ViewAllUnits, user.role) {
        let needle = q.to_lowercase();
        let units = load_user_units(pool, user.id)
            .await?
            .into_iter()
            .filter(|unit| unit.unit_number.to_lowercase().contains(&needle))
            .take(usize::try_from(limit).unwrap_or_default())
            .collect::<Vec<_>>();
        return Ok(Json(json!({ "units": units, "users": [] })));
    }

    let mut filters = Map::new();
    filters.insert("deleted_at__is_null".to_string(), Value::Bool(true));
    filters.insert("unit_number__ilike".to_string(), Value::String(q.clone()));
    let units = list_rows(pool, "units", Some(&filters), limit, 0, "unit_number", true).await?;

    let can_view_users = is_allowed(Action::ViewUsers, user.role);
    let users: Vec<(Uuid, String, Option<String>, Role)> = if can_view_users {
        sqlx::query_as(
            "SELECT id, name, email, role FROM users
             WHERE name ILIKE $1 OR email ILIKE $1
             ORDER BY name
             LIMIT $2",
        )
        .bind(format!("%{q}%"))
        .bind(limit)
        .fetch_all(pool)
        .await
        .map_err(map_db_error)?
    } else {
        Vec::new()
    };
    let users = users
        .into_iter()
        .map(|(id, name, email, role)| {
            json!({ "id": id, "name": name, "email": email, "role": role })
        })
        .collect::<Vec<_>>();

    Ok(Json(json!({ "units": units, "users": users })))
}

#[cfg(test)]
mod tests {
    use super::normalize_query;

    #[test]
    fn short_queries_are_rejected() {
        assert!(normalize_query("").is_err());
        assert!(normalize_query(" a ").is_err());
        assert_eq!(normalize_query(" j-13 ").ok().as_deref(), Some("j-13"));
    }
}
