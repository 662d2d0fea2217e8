use chrono::{DateTime, Datelike, Utc};
use chrono_tz::Tz;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use serde::Serialize;
use sha2::Sha256;
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    error::{map_db_error, AppResult},
    services::{
        arrears::format_ringgit,
        billing::{load_recipients, BillingPeriod},
        notifier::Notifier,
    },
};

type HmacSha256 = Hmac<Sha256>;

/// Compare a presented cron token against the configured secret in constant
/// time. A missing secret rejects every caller.
pub fn cron_token_matches(secret: Option<&str>, presented: Option<&str>) -> bool {
    let (Some(secret), Some(presented)) = (secret, presented) else {
        return false;
    };
    if secret.is_empty() {
        return false;
    }

    let Ok(mut reference) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    reference.update(secret.as_bytes());
    let expected = reference.finalize().into_bytes();

    let Ok(mut mac) = HmacSha256::new_from_slice(secret.as_bytes()) else {
        return false;
    };
    mac.update(presented.as_bytes());
    mac.verify_slice(&expected).is_ok()
}

/// The period a cron run targets: explicit overrides first, otherwise the
/// current month in the portal's timezone.
pub fn target_period(
    now: DateTime<Utc>,
    timezone: Tz,
    month: Option<u32>,
    year: Option<i32>,
) -> AppResult<BillingPeriod> {
    let local = now.with_timezone(&timezone);
    BillingPeriod::new(month.unwrap_or(local.month()), year.unwrap_or(local.year()))
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct ReminderReport {
    pub sent_count: u32,
    pub total_pending: u32,
    pub month: u32,
    pub year: i32,
}

/// Queue a payment reminder for every PENDING bill in the period. A bill counts
/// as sent when at least one message for its owner made it onto the queue.
pub async fn send_payment_reminders(
    pool: &PgPool,
    notifier: &Notifier,
    period: BillingPeriod,
) -> AppResult<ReminderReport> {
    let pending: Vec<(Uuid, Decimal, String, Option<Uuid>)> = sqlx::query_as(
        "SELECT b.id, b.amount, u.unit_number, u.owner_id
         FROM bills b
         JOIN units u ON u.id = b.unit_id
         WHERE b.month = $1 AND b.year = $2 AND b.status = 'PENDING'
         ORDER BY u.unit_number",
    )
    .bind(period.month as i16)
    .bind(period.year)
    .fetch_all(pool)
    .await
    .map_err(map_db_error)?;

    let owner_ids = pending
        .iter()
        .filter_map(|(_, _, _, owner)| *owner)
        .collect::<Vec<_>>();
    let owners = load_recipients(pool, &owner_ids).await;

    let mut report = ReminderReport {
        month: period.month,
        year: period.year,
        total_pending: u32::try_from(pending.len()).unwrap_or(u32::MAX),
        ..ReminderReport::default()
    };

    for (bill_id, amount, unit_number, owner_id) in &pending {
        let Some(owner) = owner_id.and_then(|id| owners.get(&id)) else {
            tracing::debug!(%bill_id, unit = %unit_number, "No owner contact for reminder");
            continue;
        };
        let subject = format!("Peringatan bayaran {} - Unit {unit_number}", period.label());
        let body = format!(
            "Salam {},\nBil unit {unit_number} untuk {} berjumlah {} masih belum dijelaskan.\n\
             Sila buat bayaran secepat mungkin.",
            owner.name,
            period.label(),
            format_ringgit(*amount)
        );
        if notifier.notify(owner, &subject, &body) > 0 {
            report.sent_count += 1;
        }
    }

    tracing::info!(
        month = report.month,
        year = report.year,
        sent = report.sent_count,
        pending = report.total_pending,
        "Payment reminders queued"
    );
    Ok(report)
}

#[cfg(test)]
mod tests {
    use chrono::{TimeZone, Utc};

    use super::{cron_token_matches, target_period};

    #[test]
    fn token_must_match_configured_secret() {
        assert!(cron_token_matches(Some("s3cret"), Some("s3cret")));
        assert!(!cron_token_matches(Some("s3cret"), Some("s3cre")));
        assert!(!cron_token_matches(Some("s3cret"), Some("S3CRET")));
        assert!(!cron_token_matches(Some("s3cret"), None));
        assert!(!cron_token_matches(None, Some("anything")));
        assert!(!cron_token_matches(Some(""), Some("")));
    }

    #[test]
    fn current_month_follows_portal_timezone() {
        // 16:30 UTC on 31 March is already 1 April in Kuala Lumpur.
        let now = Utc.with_ymd_and_hms(2025, 3, 31, 16, 30, 0).unwrap();
        let period = target_period(now, chrono_tz::Asia::Kuala_Lumpur, None, None).unwrap();
        assert_eq!((period.month, period.year), (4, 2025));

        let utc = target_period(now, chrono_tz::UTC, None, None).unwrap();
        assert_eq!((utc.month, utc.year), (3, 2025));
    }

    #[test]
    fn explicit_period_overrides_clock() {
        let now = Utc.with_ymd_and_hms(2025, 6, 15, 0, 0, 0).unwrap();
        let period =
            target_period(now, chrono_tz::Asia::Kuala_Lumpur, Some(3), Some(2025)).unwrap();
        assert_eq!((period.month, period.year), (3, 2025));
        assert!(target_period(now, chrono_tz::UTC, Some(13), None).is_err());
    }
}
