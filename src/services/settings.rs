use std::collections::HashMap;
use std::str::FromStr;

use rust_decimal::Decimal;
use serde::Serialize;
use sqlx::{PgPool, Row};

use crate::{
    error::{map_db_error, AppError, AppResult},
    models::UnitType,
};

pub const KEY_BASE_ATAS: &str = "BASE_MONTHLY_BILL_ATAS";
pub const KEY_BASE_BAWAH: &str = "BASE_MONTHLY_BILL_BAWAH";
pub const KEY_BASE_LEGACY: &str = "BASE_MONTHLY_BILL";

const UNDEFINED_TABLE: &str = "42P01";
const INSUFFICIENT_PRIVILEGE: &str = "42501";

/// Base monthly maintenance rate per unit type.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct BillingRates {
    pub atas: Decimal,
    pub bawah: Decimal,
}

impl BillingRates {
    pub fn defaults() -> Self {
        Self {
            atas: default_for_key(KEY_BASE_ATAS),
            bawah: default_for_key(KEY_BASE_BAWAH),
        }
    }

    pub fn base_for(&self, unit_type: UnitType) -> Decimal {
        match unit_type {
            UnitType::Atas => self.atas,
            UnitType::Bawah => self.bawah,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SaveOutcome {
    Saved,
    /// The settings table is missing or not writable; the write was dropped.
    Skipped,
}

pub fn default_for_key(key: &str) -> Decimal {
    match key {
        KEY_BASE_ATAS => Decimal::from(95),
        KEY_BASE_BAWAH => Decimal::from(88),
        _ => Decimal::from(88),
    }
}

/// Accept only positive amounts. Anything else means "use the default".
pub fn parse_positive_amount(raw: Option<&str>) -> Option<Decimal> {
    raw.map(str::trim)
        .filter(|value| !value.is_empty())
        .and_then(|value| Decimal::from_str(value).ok())
        .filter(|value| *value > Decimal::ZERO)
}

/// Each floor rate falls back to the single legacy rate, then to its default.
pub async fn resolve_billing_rates(pool: Option<&PgPool>) -> BillingRates {
    let stored = load_stored(pool, &[KEY_BASE_ATAS, KEY_BASE_BAWAH, KEY_BASE_LEGACY]).await;
    rates_from_stored(&stored)
}

fn rates_from_stored(stored: &HashMap<String, String>) -> BillingRates {
    let lookup = |key: &str| parse_positive_amount(stored.get(key).map(String::as_str));
    let legacy = lookup(KEY_BASE_LEGACY);
    BillingRates {
        atas: lookup(KEY_BASE_ATAS)
            .or(legacy)
            .unwrap_or_else(|| default_for_key(KEY_BASE_ATAS)),
        bawah: lookup(KEY_BASE_BAWAH)
            .or(legacy)
            .unwrap_or_else(|| default_for_key(KEY_BASE_BAWAH)),
    }
}

async fn load_stored(pool: Option<&PgPool>, keys: &[&str]) -> HashMap<String, String> {
    match pool {
        Some(pool) => fetch_raw(pool, keys).await.unwrap_or_else(|error| {
            tracing::warn!(error = %error, "Reading system settings failed; using defaults");
            HashMap::new()
        }),
        None => HashMap::new(),
    }
}

async fn fetch_raw(pool: &PgPool, keys: &[&str]) -> Result<HashMap<String, String>, sqlx::Error> {
    let keys = keys.iter().map(|key| key.to_string()).collect::<Vec<_>>();
    let rows = sqlx::query("SELECT key, value FROM system_settings WHERE key = ANY($1)")
        .bind(&keys)
        .fetch_all(pool)
        .await?;

    let mut values = HashMap::new();
    for row in rows {
        let key: String = row.try_get("key")?;
        let value: String = row.try_get("value")?;
        values.insert(key, value);
    }
    Ok(values)
}

/// Validate a proposed rate: finite and strictly positive, rounded to sen.
pub fn validate_rate(label: &str, value: f64) -> AppResult<Decimal> {
    if !value.is_finite() || value <= 0.0 {
        return Err(AppError::BadRequest(format!(
            "Kadar {label} mestilah nombor positif."
        )));
    }
    Decimal::try_from(value)
        .map(|amount| amount.round_dp(2))
        .map_err(|_| AppError::BadRequest(format!("Kadar {label} tidak sah.")))
}

/// Persist both rates. Both are validated before anything is written. A missing
/// or read-only settings table downgrades to a logged no-op.
pub async fn save_billing_rates(pool: &PgPool, atas: f64, bawah: f64) -> AppResult<SaveOutcome> {
    let atas = validate_rate("ATAS", atas)?;
    let bawah = validate_rate("BAWAH", bawah)?;

    for (key, value) in [(KEY_BASE_ATAS, atas), (KEY_BASE_BAWAH, bawah)] {
        let result = sqlx::query(
            "INSERT INTO system_settings (key, value, updated_at)
             VALUES ($1, $2, now())
             ON CONFLICT (key)
             DO UPDATE SET value = EXCLUDED.value, updated_at = now()",
        )
        .bind(key)
        .bind(value.to_string())
        .execute(pool)
        .await;

        if let Err(error) = result {
            if is_settings_unavailable(&error) {
                tracing::warn!(
                    error = %error,
                    key,
                    "System settings not writable; keeping defaults"
                );
                return Ok(SaveOutcome::Skipped);
            }
            return Err(map_db_error(error));
        }
    }

    tracing::info!(%atas, %bawah, "Billing rates updated");
    Ok(SaveOutcome::Saved)
}

fn is_settings_unavailable(error: &sqlx::Error) -> bool {
    if let Some(code) = error.as_database_error().and_then(|db_error| db_error.code()) {
        if code == UNDEFINED_TABLE || code == INSUFFICIENT_PRIVILEGE {
            return true;
        }
    }
    message_indicates_unavailable(&error.to_string())
}

fn message_indicates_unavailable(message: &str) -> bool {
    let lowered = message.to_ascii_lowercase();
    lowered.contains("permission denied")
        || (lowered.contains("relation") && lowered.contains("does not exist"))
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;

    use rust_decimal::Decimal;

    use super::{
        default_for_key, message_indicates_unavailable, parse_positive_amount, rates_from_stored,
        resolve_billing_rates, validate_rate, BillingRates, KEY_BASE_ATAS, KEY_BASE_BAWAH,
        KEY_BASE_LEGACY,
    };

    fn stored(entries: &[(&str, &str)]) -> HashMap<String, String> {
        entries
            .iter()
            .map(|(key, value)| (key.to_string(), value.to_string()))
            .collect()
    }
    use crate::models::UnitType;

    #[test]
    fn defaults_per_key() {
        assert_eq!(default_for_key(KEY_BASE_ATAS), Decimal::from(95));
        assert_eq!(default_for_key(KEY_BASE_BAWAH), Decimal::from(88));
        assert_eq!(default_for_key(KEY_BASE_LEGACY), Decimal::from(88));
        assert_eq!(default_for_key("SOMETHING_ELSE"), Decimal::from(88));
    }

    #[test]
    fn rejects_unparseable_and_non_positive_values() {
        assert_eq!(parse_positive_amount(Some("120.50")), Some(Decimal::new(12050, 2)));
        assert_eq!(parse_positive_amount(Some(" 90 ")), Some(Decimal::from(90)));
        assert_eq!(parse_positive_amount(Some("0")), None);
        assert_eq!(parse_positive_amount(Some("-5")), None);
        assert_eq!(parse_positive_amount(Some("NaN")), None);
        assert_eq!(parse_positive_amount(Some("abc")), None);
        assert_eq!(parse_positive_amount(Some("")), None);
        assert_eq!(parse_positive_amount(None), None);
    }

    #[test]
    fn rates_pick_base_by_unit_type() {
        let rates = BillingRates::defaults();
        assert_eq!(rates.base_for(UnitType::Atas), Decimal::from(95));
        assert_eq!(rates.base_for(UnitType::Bawah), Decimal::from(88));
    }

    #[test]
    fn legacy_rate_covers_missing_floor_rates() {
        let rates = rates_from_stored(&stored(&[(KEY_BASE_LEGACY, "120")]));
        assert_eq!(rates.atas, Decimal::from(120));
        assert_eq!(rates.bawah, Decimal::from(120));

        let rates = rates_from_stored(&stored(&[
            (KEY_BASE_ATAS, "100"),
            (KEY_BASE_BAWAH, "0"),
            (KEY_BASE_LEGACY, "120"),
        ]));
        assert_eq!(rates.atas, Decimal::from(100));
        assert_eq!(rates.bawah, Decimal::from(120));

        let rates = rates_from_stored(&stored(&[(KEY_BASE_LEGACY, "abc")]));
        assert_eq!(rates, BillingRates::defaults());
    }

    #[test]
    fn validates_rates_before_writing() {
        assert!(validate_rate("ATAS", f64::NAN).is_err());
        assert!(validate_rate("ATAS", f64::INFINITY).is_err());
        assert!(validate_rate("ATAS", 0.0).is_err());
        assert!(validate_rate("ATAS", -1.0).is_err());
        assert_eq!(validate_rate("ATAS", 99.999).unwrap(), Decimal::new(10000, 2));
    }

    #[test]
    fn recognises_unavailable_table_messages() {
        assert!(message_indicates_unavailable(
            "error returned from database: relation \"system_settings\" does not exist"
        ));
        assert!(message_indicates_unavailable("permission denied for table system_settings"));
        assert!(!message_indicates_unavailable("connection reset by peer"));
    }

    #[tokio::test]
    async fn resolves_defaults_without_a_database() {
        assert_eq!(resolve_billing_rates(None).await, BillingRates::defaults());
    }
}
