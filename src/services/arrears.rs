use std::collections::HashMap;

use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    error::{map_db_error, AppResult},
    models::{Bill, BillStatus, Unit},
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UnitArrears {
    pub unit_id: Uuid,
    pub unit_number: String,
    pub manual: Decimal,
    pub system: Decimal,
    pub pending_bill_count: usize,
    pub total: Decimal,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ArrearsSummary {
    pub manual: Decimal,
    pub system: Decimal,
    pub total: Decimal,
    pub per_unit: Vec<UnitArrears>,
}

impl ArrearsSummary {
    pub fn has_arrears(&self) -> bool {
        self.total > Decimal::ZERO
    }
}

/// Combine legacy (manual) arrears with the sum of PENDING bills per unit.
///
/// Bills for units outside `units`, and bills in any other status, are ignored.
/// `per_unit` keeps the order of `units`.
pub fn compute_arrears(units: &[Unit], bills: &[Bill]) -> ArrearsSummary {
    let mut pending: HashMap<Uuid, (Decimal, usize)> = HashMap::new();
    for bill in bills.iter().filter(|bill| bill.status == BillStatus::Pending) {
        let entry = pending.entry(bill.unit_id).or_insert((Decimal::ZERO, 0));
        entry.0 += bill.amount;
        entry.1 += 1;
    }

    let per_unit = units
        .iter()
        .map(|unit| {
            let (system, count) = pending.get(&unit.id).copied().unwrap_or((Decimal::ZERO, 0));
            UnitArrears {
                unit_id: unit.id,
                unit_number: unit.unit_number.clone(),
                manual: unit.manual_arrears_amount,
                system,
                pending_bill_count: count,
                total: unit.manual_arrears_amount + system,
            }
        })
        .collect::<Vec<_>>();

    let manual = per_unit.iter().map(|row| row.manual).sum::<Decimal>();
    let system = per_unit.iter().map(|row| row.system).sum::<Decimal>();

    ArrearsSummary {
        manual,
        system,
        total: manual + system,
        per_unit,
    }
}

pub fn format_ringgit(amount: Decimal) -> String {
    format!("RM {:.2}", amount.round_dp(2))
}

/// Active units the user owns or rents.
pub async fn load_user_units(pool: &PgPool, user_id: Uuid) -> AppResult<Vec<Unit>> {
    sqlx::query_as::<_, Unit>(
        "SELECT * FROM units
         WHERE (owner_id = $1 OR tenant_id = $1)
           AND is_active = true AND deleted_at IS NULL
         ORDER BY unit_number",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
    .map_err(map_db_error)
}

/// Every unit linked to the user, including deactivated or soft-deleted ones.
async fn load_all_user_units(pool: &PgPool, user_id: Uuid) -> AppResult<Vec<Unit>> {
    sqlx::query_as::<_, Unit>(
        "SELECT * FROM units
         WHERE owner_id = $1 OR tenant_id = $1
         ORDER BY unit_number",
    )
    .bind(user_id)
    .fetch_all(pool)
    .await
    .map_err(map_db_error)
}

/// Active units, plus retired units that still owe something. Removing a unit
/// does not write off its PENDING bills or legacy arrears.
pub fn units_carrying_arrears(units: Vec<Unit>, bills: &[Bill]) -> Vec<Unit> {
    units
        .into_iter()
        .filter(|unit| {
            (unit.is_active && unit.deleted_at.is_none())
                || unit.manual_arrears_amount > Decimal::ZERO
                || bills
                    .iter()
                    .any(|bill| bill.unit_id == unit.id && bill.status == BillStatus::Pending)
        })
        .collect()
}

pub async fn load_pending_bills(pool: &PgPool, unit_ids: &[Uuid]) -> AppResult<Vec<Bill>> {
    if unit_ids.is_empty() {
        return Ok(Vec::new());
    }
    sqlx::query_as::<_, Bill>(
        "SELECT * FROM bills
         WHERE unit_id = ANY($1) AND status = 'PENDING'
         ORDER BY year, month",
    )
    .bind(unit_ids)
    .fetch_all(pool)
    .await
    .map_err(map_db_error)
}

pub async fn arrears_for_units(pool: &PgPool, units: &[Unit]) -> AppResult<ArrearsSummary> {
    let unit_ids = units.iter().map(|unit| unit.id).collect::<Vec<_>>();
    let bills = load_pending_bills(pool, &unit_ids).await?;
    Ok(compute_arrears(units, &bills))
}

pub async fn arrears_for_user(
    pool: &PgPool,
    user_id: Uuid,
) -> AppResult<(Vec<Unit>, ArrearsSummary)> {
    let linked = load_all_user_units(pool, user_id).await?;
    let unit_ids = linked.iter().map(|unit| unit.id).collect::<Vec<_>>();
    let bills = load_pending_bills(pool, &unit_ids).await?;
    let units = units_carrying_arrears(linked, &bills);
    let summary = compute_arrears(&units, &bills);
    Ok((units, summary))
}

#[cfg(test)]
pub(crate) mod fixtures {
    use chrono::Utc;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    use crate::models::{Bill, BillStatus, BillType, Unit, UnitType};

    pub fn unit(number: &str, unit_type: UnitType, manual: i64, adjustment: i64) -> Unit {
        Unit {
            id: Uuid::new_v4(),
            unit_number: number.to_string(),
            unit_type,
            owner_id: None,
            tenant_id: None,
            manual_arrears_amount: Decimal::from(manual),
            monthly_adjustment_amount: Decimal::from(adjustment),
            is_active: true,
            deleted_at: None,
            created_at: Utc::now(),
        }
    }

    pub fn bill(unit_id: Uuid, amount: i64, month: i16, year: i32, status: BillStatus) -> Bill {
        Bill {
            id: Uuid::new_v4(),
            unit_id,
            amount: Decimal::from(amount),
            month,
            year,
            bill_type: BillType::Maintenance,
            status,
            receipt_url: None,
            payment_reference: None,
            payment_method: None,
            refund_reference: None,
            refund_evidence_url: None,
            refund_proof_url: None,
            refund_checklist: None,
            verified_by: None,
            verified_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;
    use uuid::Uuid;

    use super::fixtures::{bill, unit};
    use super::{compute_arrears, format_ringgit, units_carrying_arrears};
    use crate::models::{BillStatus, UnitType};

    #[test]
    fn combines_manual_and_pending_bills() {
        let j13 = unit("J-13-1", UnitType::Bawah, 100, 0);
        let bills = vec![bill(j13.id, 88, 3, 2025, BillStatus::Pending)];

        let summary = compute_arrears(std::slice::from_ref(&j13), &bills);
        assert_eq!(summary.manual, Decimal::from(100));
        assert_eq!(summary.system, Decimal::from(88));
        assert_eq!(summary.total, Decimal::from(188));
        assert_eq!(summary.per_unit[0].pending_bill_count, 1);
        assert_eq!(format_ringgit(summary.total), "RM 188.00");
    }

    #[test]
    fn only_pending_bills_count() {
        let a = unit("A-1-1", UnitType::Atas, 0, 0);
        let bills = vec![
            bill(a.id, 95, 1, 2025, BillStatus::Pending),
            bill(a.id, 95, 2, 2025, BillStatus::Paid),
            bill(a.id, 95, 3, 2025, BillStatus::Approved),
            bill(a.id, 95, 4, 2025, BillStatus::Rejected),
            bill(a.id, 95, 5, 2025, BillStatus::Pending),
        ];
        let summary = compute_arrears(std::slice::from_ref(&a), &bills);
        assert_eq!(summary.system, Decimal::from(190));
        assert_eq!(summary.per_unit[0].pending_bill_count, 2);
    }

    #[test]
    fn sums_across_every_unit_and_ignores_foreign_bills() {
        let a = unit("A-1-1", UnitType::Atas, 50, 0);
        let b = unit("B-2-2", UnitType::Bawah, 0, 0);
        let bills = vec![
            bill(a.id, 95, 1, 2025, BillStatus::Pending),
            bill(b.id, 88, 1, 2025, BillStatus::Pending),
            bill(b.id, 88, 2, 2025, BillStatus::Pending),
            bill(Uuid::new_v4(), 500, 1, 2025, BillStatus::Pending),
        ];

        let summary = compute_arrears(&[a.clone(), b.clone()], &bills);
        assert_eq!(summary.manual, Decimal::from(50));
        assert_eq!(summary.system, Decimal::from(95 + 88 + 88));
        assert_eq!(summary.total, summary.manual + summary.system);
        assert_eq!(summary.per_unit[0].unit_id, a.id);
        assert_eq!(summary.per_unit[1].total, Decimal::from(176));
    }

    #[test]
    fn no_units_means_no_arrears() {
        let summary = compute_arrears(&[], &[]);
        assert_eq!(summary.total, Decimal::ZERO);
        assert!(!summary.has_arrears());
        assert!(summary.per_unit.is_empty());
    }

    #[test]
    fn retired_units_with_pending_bills_still_count() {
        let active = unit("A-1-1", UnitType::Atas, 0, 0);
        let mut retired = unit("B-2-2", UnitType::Bawah, 0, 0);
        retired.is_active = false;
        retired.deleted_at = Some(chrono::Utc::now());
        let mut settled = unit("C-3-3", UnitType::Bawah, 0, 0);
        settled.is_active = false;
        settled.deleted_at = Some(chrono::Utc::now());
        let bills = vec![
            bill(retired.id, 88, 1, 2025, BillStatus::Pending),
            bill(settled.id, 88, 1, 2025, BillStatus::Approved),
        ];

        let units = units_carrying_arrears(vec![active.clone(), retired.clone(), settled], &bills);
        let ids = units.iter().map(|unit| unit.id).collect::<Vec<_>>();
        assert_eq!(ids, vec![active.id, retired.id]);

        let summary = compute_arrears(&units, &bills);
        assert_eq!(summary.system, Decimal::from(88));
        assert!(summary.has_arrears());
    }
}
