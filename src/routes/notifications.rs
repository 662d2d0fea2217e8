use std::collections::HashMap;

use axum::{
    extract::{Query, State},
    http::HeaderMap,
    Json,
};
use serde_json::{json, Value};
use uuid::Uuid;

use crate::{
    auth::require_user,
    db::db_pool,
    error::{map_db_error, AppResult},
    models::{Bill, BillStatus},
    schemas::{clamp_limit_in_range, NotificationsQuery},
    services::{arrears::format_ringgit, billing::BillingPeriod},
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/v1/notifications", axum::routing::get(list_notifications))
        .route("/v1/notifications/read", axum::routing::post(mark_read))
        .route("/v1/notifications/read-all", axum::routing::post(mark_read))
}

/// Feed entry derived from a bill's current state. There is no read tracking,
/// so every entry is unread.
fn bill_notification(bill: &Bill, unit_number: &str) -> Value {
    let period = BillingPeriod {
        month: u32::try_from(bill.month).unwrap_or_default(),
        year: bill.year,
    }
    .label();
    let amount = format_ringgit(bill.amount);

    let (kind, title, message) = match bill.status {
        BillStatus::Pending => (
            "bill_issued",
            "Bil baharu",
            format!("Bil {period} untuk unit {unit_number} berjumlah {amount}."),
        ),
        BillStatus::Paid => (
            "payment_submitted",
            "Bayaran dihantar",
            format!("Bayaran bil {period} unit {unit_number} sedang disemak."),
        ),
        BillStatus::Approved if bill.is_refunded() => (
            "refund_completed",
            "Deposit dikembalikan",
            format!("Deposit {amount} untuk unit {unit_number} telah dikembalikan."),
        ),
        BillStatus::Approved => (
            "payment_approved",
            "Bayaran diluluskan",
            format!("Bayaran bil {period} unit {unit_number} telah diluluskan."),
        ),
        BillStatus::Rejected => (
            "payment_rejected",
            "Bayaran ditolak",
            format!(
                "Bayaran bil {period} unit {unit_number} ditolak. Sila muat naik semula resit."
            ),
        ),
        BillStatus::RefundProcessing => (
            "refund_processing",
            "Pemulangan deposit diproses",
            format!("Pemulangan deposit {amount} untuk unit {unit_number} sedang diproses."),
        ),
        BillStatus::Refunded => (
            "refund_completed",
            "Deposit dikembalikan",
            format!("Deposit {amount} untuk unit {unit_number} telah dikembalikan."),
        ),
    };

    json!({
        "id": bill.id,
        "kind": kind,
        "title": title,
        "message": message,
        "bill_id": bill.id,
        "created_at": bill.updated_at,
        "read": false,
    })
}

async fn list_notifications(
    State(state): State<AppState>,
    Query(query): Query<NotificationsQuery>,
    headers: HeaderMap,
) -> AppResult<Json<Value>> {
    let user = require_user(&state, &headers).await?;
    let pool = db_pool(&state)?;

    let bills = sqlx::query_as::<_, Bill>(
        "SELECT b.* FROM bills b
         JOIN units u ON u.id = b.unit_id
         WHERE u.owner_id = $1 OR u.tenant_id = $1
         ORDER BY b.updated_at DESC
         LIMIT $2",
    )
    .bind(user.id)
    .bind(clamp_limit_in_range(query.limit, 1, 100))
    .fetch_all(pool)
    .await
    .map_err(map_db_error)?;

    let unit_ids = bills.iter().map(|bill| bill.unit_id).collect::<Vec<_>>();
    let unit_numbers: HashMap<Uuid, String> =
        sqlx::query_as::<_, (Uuid, String)>("SELECT id, unit_number FROM units WHERE id = ANY($1)")
            .bind(&unit_ids)
            .fetch_all(pool)
            .await
            .map_err(map_db_error)?
            .into_iter()
            .collect();

    let data = bills
        .iter()
        .map(|bill| {
            let unit_number = unit_numbers
                .get(&bill.unit_id)
                .map(String::as_str)
                .unwrap_or("-");
            bill_notification(bill, unit_number)
        })
        .collect::<Vec<_>>();
    let unread = data.len();
    Ok(Json(json!({ "data": data, "unread_count": unread })))
}

async fn mark_read(State(state): State<AppState>, headers: HeaderMap) -> AppResult<Json<Value>> {
    require_user(&state, &headers).await?;
    Ok(Json(json!({ "success": true })))
}

#[cfg(test)]
mod tests {
    use uuid::Uuid;

    use super::bill_notification;
    use crate::{
        models::{BillStatus, BillType},
        services::arrears::fixtures::bill,
    };

    #[test]
    fn pending_bill_reads_as_new_bill() {
        let pending = bill(Uuid::new_v4(), 85, 3, 2025, BillStatus::Pending);
        let entry = bill_notification(&pending, "J-13-1");
        assert_eq!(entry["kind"], "bill_issued");
        assert_eq!(
            entry["message"],
            "Bil 03/2025 untuk unit J-13-1 berjumlah RM 85.00."
        );
        assert_eq!(entry["read"], false);
    }

    #[test]
    fn approved_deposit_with_proof_reads_as_refunded() {
        let mut deposit = bill(Uuid::new_v4(), 300, 1, 2025, BillStatus::Approved);
        deposit.bill_type = BillType::Deposit;
        assert_eq!(bill_notification(&deposit, "A-1")["kind"], "payment_approved");

        deposit.refund_proof_url = Some("/uploads/refunds/x.png".to_string());
        assert_eq!(bill_notification(&deposit, "A-1")["kind"], "refund_completed");
    }
}
