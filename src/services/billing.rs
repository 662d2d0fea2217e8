use std::collections::{HashMap, HashSet};

use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    error::{map_db_error, AppError, AppResult},
    models::{Bill, BillType, Unit},
    services::{
        arrears::format_ringgit,
        notifier::{Notifier, Recipient},
        settings::{resolve_billing_rates, BillingRates},
    },
};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BillingPeriod {
    pub month: u32,
    pub year: i32,
}

impl BillingPeriod {
    pub fn new(month: u32, year: i32) -> AppResult<Self> {
        if !(1..=12).contains(&month) {
            return Err(AppError::BadRequest(
                "Bulan mestilah antara 1 hingga 12.".to_string(),
            ));
        }
        if !(2000..=2100).contains(&year) {
            return Err(AppError::BadRequest("Tahun tidak sah.".to_string()));
        }
        Ok(Self { month, year })
    }

    /// First calendar day of the period; income from a bill is dated here.
    pub fn first_day(&self) -> Option<chrono::NaiveDate> {
        chrono::NaiveDate::from_ymd_opt(self.year, self.month, 1)
    }

    pub fn label(&self) -> String {
        format!("{:02}/{}", self.month, self.year)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PlannedBill {
    pub unit_id: Uuid,
    pub unit_number: String,
    pub owner_id: Option<Uuid>,
    pub amount: Decimal,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct GenerationReport {
    pub month: u32,
    pub year: i32,
    pub created: u32,
    /// Units that already had a bill for the period, were inactive, or would
    /// have produced a non-positive amount.
    pub skipped: u32,
    pub failed: u32,
}

pub fn monthly_amount(unit: &Unit, rates: &BillingRates) -> Decimal {
    rates.base_for(unit.unit_type) + unit.monthly_adjustment_amount
}

/// Decide which units need a maintenance bill for the period. Pure: the caller
/// supplies the units that already have one.
pub fn plan_monthly_bills(
    units: &[Unit],
    already_billed: &HashSet<Uuid>,
    rates: &BillingRates,
) -> (Vec<PlannedBill>, u32) {
    let mut planned = Vec::new();
    let mut skipped = 0u32;

    for unit in units {
        if !unit.is_active || unit.deleted_at.is_some() || already_billed.contains(&unit.id) {
            skipped += 1;
            continue;
        }
        let amount = monthly_amount(unit, rates);
        if amount <= Decimal::ZERO {
            tracing::warn!(unit = %unit.unit_number, %amount, "Skipping non-positive monthly bill");
            skipped += 1;
            continue;
        }
        planned.push(PlannedBill {
            unit_id: unit.id,
            unit_number: unit.unit_number.clone(),
            owner_id: unit.owner_id,
            amount,
        });
    }

    (planned, skipped)
}

/// Insert a PENDING bill unless one already exists for (unit, period, type).
/// Returns `None` when the unique key was already taken, so concurrent runs for
/// the same period cannot double-bill.
pub async fn insert_bill_if_absent(
    pool: &PgPool,
    unit_id: Uuid,
    amount: Decimal,
    period: BillingPeriod,
    bill_type: BillType,
) -> Result<Option<Bill>, sqlx::Error> {
    sqlx::query_as::<_, Bill>(
        "INSERT INTO bills (unit_id, amount, month, year, type, status)
         VALUES ($1, $2, $3, $4, $5, 'PENDING')
         ON CONFLICT (unit_id, month, year, type) DO NOTHING
         RETURNING *",
    )
    .bind(unit_id)
    .bind(amount)
    .bind(period.month as i16)
    .bind(period.year)
    .bind(bill_type)
    .fetch_optional(pool)
    .await
}

/// Generate this period's maintenance bills for every active unit.
///
/// "Already billed" means a MAINTENANCE bill exists for the unit and period,
/// matching the unique key on (unit_id, month, year, type); SINKING or DEPOSIT
/// bills for the same month do not block generation.
///
/// Idempotent: a second run for the same period creates nothing. Each unit is
/// processed on its own; a failed insert is logged and counted, and the loop
/// moves on. Owner notifications are queued, never awaited.
pub async fn generate_monthly_bills(
    pool: &PgPool,
    notifier: &Notifier,
    period: BillingPeriod,
) -> AppResult<GenerationReport> {
    let rates = resolve_billing_rates(Some(pool)).await;

    let units = sqlx::query_as::<_, Unit>(
        "SELECT * FROM units
         WHERE is_active = true AND deleted_at IS NULL
         ORDER BY unit_number",
    )
    .fetch_all(pool)
    .await
    .map_err(map_db_error)?;

    let billed: Vec<Uuid> = sqlx::query_scalar(
        "SELECT unit_id FROM bills WHERE month = $1 AND year = $2 AND type = 'MAINTENANCE'",
    )
    .bind(period.month as i16)
    .bind(period.year)
    .fetch_all(pool)
    .await
    .map_err(map_db_error)?;
    let already_billed = billed.into_iter().collect::<HashSet<_>>();

    let (planned, skipped) = plan_monthly_bills(&units, &already_billed, &rates);
    let owners = load_recipients(
        pool,
        &planned.iter().filter_map(|bill| bill.owner_id).collect::<Vec<_>>(),
    )
    .await;

    let mut report = GenerationReport {
        month: period.month,
        year: period.year,
        skipped,
        ..GenerationReport::default()
    };

    for plan in planned {
        match insert_bill_if_absent(pool, plan.unit_id, plan.amount, period, BillType::Maintenance)
            .await
        {
            Ok(Some(bill)) => {
                report.created += 1;
                if let Some(owner) = plan.owner_id.and_then(|id| owners.get(&id)) {
                    notify_bill_issued(notifier, owner, &plan.unit_number, &bill, period);
                }
            }
            Ok(None) => report.skipped += 1,
            Err(error) => {
                tracing::error!(unit = %plan.unit_number, error = %error, "Bill insert failed");
                report.failed += 1;
            }
        }
    }

    tracing::info!(
        month = report.month,
        year = report.year,
        created = report.created,
        skipped = report.skipped,
        failed = report.failed,
        "Monthly bill generation completed"
    );
    Ok(report)
}

/// Create a single bill by hand. Maintenance bills default to the unit's
/// computed monthly amount; other types need an explicit amount.
pub async fn create_bill(
    pool: &PgPool,
    unit: &Unit,
    bill_type: BillType,
    period: BillingPeriod,
    amount: Option<f64>,
) -> AppResult<Bill> {
    let amount = match amount {
        Some(value) => {
            if !value.is_finite() || value <= 0.0 {
                return Err(AppError::BadRequest(
                    "Jumlah bil mestilah nombor positif.".to_string(),
                ));
            }
            Decimal::try_from(value)
                .map(|amount| amount.round_dp(2))
                .map_err(|_| AppError::BadRequest("Jumlah bil tidak sah.".to_string()))?
        }
        None if bill_type == BillType::Maintenance => {
            let rates = resolve_billing_rates(Some(pool)).await;
            let computed = monthly_amount(unit, &rates);
            if computed <= Decimal::ZERO {
                return Err(AppError::BadRequest(format!(
                    "Jumlah bulanan unit {} bukan nilai positif.",
                    unit.unit_number
                )));
            }
            computed
        }
        None => {
            return Err(AppError::BadRequest(
                "Jumlah diperlukan untuk bil jenis ini.".to_string(),
            ))
        }
    };

    insert_bill_if_absent(pool, unit.id, amount, period, bill_type)
        .await
        .map_err(map_db_error)?
        .ok_or_else(|| {
            AppError::Conflict(format!(
                "Bil untuk unit {} bagi {} sudah wujud.",
                unit.unit_number,
                period.label()
            ))
        })
}

pub async fn load_recipients(pool: &PgPool, user_ids: &[Uuid]) -> HashMap<Uuid, Recipient> {
    if user_ids.is_empty() {
        return HashMap::new();
    }
    let rows: Result<Vec<(Uuid, String, Option<String>, Option<String>)>, _> =
        sqlx::query_as("SELECT id, name, email, phone FROM users WHERE id = ANY($1)")
            .bind(user_ids)
            .fetch_all(pool)
            .await;

    match rows {
        Ok(rows) => rows
            .into_iter()
            .map(|(id, name, email, phone)| (id, Recipient { name, email, phone }))
            .collect(),
        Err(error) => {
            tracing::warn!(error = %error, "Could not load notification recipients");
            HashMap::new()
        }
    }
}

fn notify_bill_issued(
    notifier: &Notifier,
    owner: &Recipient,
    unit_number: &str,
    bill: &Bill,
    period: BillingPeriod,
) {
    let subject = format!("Bil penyenggaraan {} - Unit {unit_number}", period.label());
    let body = format!(
        "Salam {},\nBil penyenggaraan bagi unit {unit_number} untuk {} berjumlah {} \
         telah dikeluarkan.\nSila jelaskan bayaran melalui portal penduduk.",
        owner.name,
        period.label(),
        format_ringgit(bill.amount)
    );
    notifier.notify(owner, &subject, &body);
}
