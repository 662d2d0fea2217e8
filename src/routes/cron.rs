use axum::{
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use chrono::Utc;
use serde_json::{json, Value};

use crate::{
    auth::bearer_token,
    db::db_pool,
    error::{AppError, AppResult},
    schemas::PeriodQuery,
    services::{
        billing::generate_monthly_bills,
        cron::{cron_token_matches, send_payment_reminders, target_period},
    },
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/cron/billing", axum::routing::get(run_billing))
        .route("/cron/reminders", axum::routing::get(run_reminders))
}

fn require_cron_token(state: &AppState, headers: &HeaderMap) -> AppResult<()> {
    let presented = bearer_token(headers);
    if cron_token_matches(state.config.cron_secret.as_deref(), presented.as_deref()) {
        return Ok(());
    }
    tracing::warn!("Rejected cron call with missing or invalid token");
    Err(AppError::Unauthorized("Unauthorized".to_string()))
}

/// Past the token check, a cron job either reports or fails with a 500. Bad
/// period overrides stay client errors.
fn job_failure(error: AppError) -> AppError {
    if error.status_code().is_server_error() {
        tracing::error!(error = %error, "Cron job failed");
        return AppError::Internal(error.to_string());
    }
    error
}

async fn run_billing(
    State(state): State<AppState>,
    Query(query): Query<PeriodQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    require_cron_token(&state, &headers)?;
    let pool = db_pool(&state).map_err(job_failure)?;
    let period = target_period(Utc::now(), state.config.app_timezone, query.month, query.year)?;

    let report = generate_monthly_bills(pool, &state.notifier, period)
        .await
        .map_err(job_failure)?;
    Ok(Json(json!({
        "success": true,
        "count": report.created,
        "skipped": report.skipped,
        "failed": report.failed,
        "month": report.month,
        "year": report.year,
    })))
}

async fn run_reminders(
    State(state): State<AppState>,
    Query(query): Query<PeriodQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    require_cron_token(&state, &headers)?;
    let pool = db_pool(&state).map_err(job_failure)?;
    let period = target_period(Utc::now(), state.config.app_timezone, query.month, query.year)?;

    let report = send_payment_reminders(pool, &state.notifier, period)
        .await
        .map_err(job_failure)?;
    Ok(Json(json!({
        "success": true,
        "sentCount": report.sent_count,
        "totalPending": report.total_pending,
        "month": report.month,
        "year": report.year,
    })))
}

#[cfg(test)]
mod tests {
    use super::job_failure;
    use crate::error::AppError;

    #[test]
    fn server_side_failures_become_internal_errors() {
        let mapped = job_failure(AppError::Dependency("Database operation failed.".into()));
        assert!(matches!(mapped, AppError::Internal(_)));

        let mapped = job_failure(AppError::BadRequest("Bulan tidak sah.".into()));
        assert!(matches!(mapped, AppError::BadRequest(_)));
    }
}
