use axum::{extract::State, http::HeaderMap, Json};
use serde_json::{json, Value};

use crate::{
    auth::require_user,
    authz::{require, Action},
    db::db_pool,
    error::AppResult,
    schemas::BillingRatesInput,
    services::{
        audit::write_audit_log,
        settings::{resolve_billing_rates, save_billing_rates, SaveOutcome},
    },
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new().route(
        "/v1/settings/billing-rates",
        axum::routing::get(get_billing_rates).put(update_billing_rates),
    )
}

async fn get_billing_rates(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user = require_user(&state, &headers).await?;
    require(&user, Action::ViewLedger)?;
    let rates = resolve_billing_rates(state.db_pool.as_ref()).await;
    Ok(Json(json!(rates)))
}

async fn update_billing_rates(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(payload): Json<BillingRatesInput>,
) -> AppResult<Json<Value>> {
    let user = require_user(&state, &headers).await?;
    require(&user, Action::ManageSettings)?;
    let pool = db_pool(&state)?;

    let before = resolve_billing_rates(Some(pool)).await;
    let outcome = save_billing_rates(pool, payload.atas, payload.bawah).await?;
    let after = resolve_billing_rates(Some(pool)).await;

    if outcome == SaveOutcome::Saved {
        write_audit_log(
            Some(pool),
            Some(user.id),
            "settings.billing_rates_updated",
            "system_settings",
            None,
            Some(json!(before)),
            Some(json!(after)),
        )
        .await;
    }

    Ok(Json(json!({
        "success": true,
        "outcome": outcome,
        "rates": after,
    })))
}
