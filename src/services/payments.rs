use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::{json, Value};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use crate::{
    auth::SessionUser,
    error::{map_db_error, AppError, AppResult},
    models::{Bill, BillStatus, BillType, FundCode, IncomeCollection, Unit},
    services::{
        arrears::format_ringgit,
        audit::write_audit_log,
        billing::{load_recipients, BillingPeriod},
        notifier::Notifier,
    },
};

/// A request to move a bill through its payment lifecycle.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PaymentCommand {
    /// Resident (or staff on their behalf) attaches a transfer receipt.
    UploadReceipt { receipt_url: String },
    /// Management approves or rejects a submitted payment.
    Verify { approve: bool },
    /// Cash or bank-in recorded directly by management.
    ManualPayment {
        reference: String,
        receipt_url: Option<String>,
    },
    /// Confirmed online banking (FPX) payment.
    OnlinePayment { reference: String },
    /// Start returning a deposit. At least one piece of evidence is required.
    InitiateRefund {
        reference: Option<String>,
        evidence_url: Option<String>,
        checklist: Vec<String>,
    },
    /// Close a refund once the payout has been made.
    ApproveRefund { payout_proof_url: String },
}

impl PaymentCommand {
    /// Simulated FPX confirmation. A blank gateway reference gets a generated one.
    pub fn online(reference: Option<&str>) -> Self {
        let reference = reference
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToOwned::to_owned)
            .unwrap_or_else(|| format!("FPX-{}", Uuid::new_v4().simple()));
        PaymentCommand::OnlinePayment { reference }
    }

    pub fn audit_action(&self) -> &'static str {
        match self {
            PaymentCommand::UploadReceipt { .. } => "bill.receipt_uploaded",
            PaymentCommand::Verify { approve: true } => "bill.payment_approved",
            PaymentCommand::Verify { approve: false } => "bill.payment_rejected",
            PaymentCommand::ManualPayment { .. } => "bill.manual_payment",
            PaymentCommand::OnlinePayment { .. } => "bill.online_payment",
            PaymentCommand::InitiateRefund { .. } => "bill.refund_initiated",
            PaymentCommand::ApproveRefund { .. } => "bill.refund_approved",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Transition {
    pub from: BillStatus,
    pub to: BillStatus,
    /// False when the command is an accepted no-op (bill already settled).
    pub changed: bool,
    pub record_income: bool,
}

impl Transition {
    fn advance(from: BillStatus, to: BillStatus, record_income: bool) -> Self {
        Self {
            from,
            to,
            changed: true,
            record_income,
        }
    }

    fn unchanged(status: BillStatus) -> Self {
        Self {
            from: status,
            to: status,
            changed: false,
            record_income: false,
        }
    }
}

fn conflict(message: &str) -> AppError {
    AppError::Conflict(message.to_string())
}

fn required(value: &str, message: &str) -> AppResult<()> {
    if value.trim().is_empty() {
        return Err(AppError::BadRequest(message.to_string()));
    }
    Ok(())
}

/// Decide where a command takes a bill. Pure; all state guards live here.
///
/// Approving income exactly once is enforced twice: here, by refusing to
/// re-approve an APPROVED bill, and in the database by the unique index on
/// `income_collections.bill_id`.
pub fn plan_transition(bill: &Bill, command: &PaymentCommand) -> AppResult<Transition> {
    use BillStatus::*;

    let status = bill.status;
    match command {
        PaymentCommand::UploadReceipt { receipt_url } => {
            required(receipt_url, "Resit pembayaran diperlukan.")?;
            match status {
                Pending | Rejected | Paid => Ok(Transition::advance(status, Paid, false)),
                Approved => Err(conflict("Bil ini telah dijelaskan.")),
                RefundProcessing | Refunded => {
                    Err(conflict("Bil deposit ini sedang atau telah dipulangkan."))
                }
            }
        }
        PaymentCommand::Verify { approve } => match status {
            Pending | Paid if *approve => Ok(Transition::advance(status, Approved, true)),
            Pending | Paid => Ok(Transition::advance(status, Rejected, false)),
            Approved => Ok(Transition::unchanged(status)),
            Rejected => Err(conflict(
                "Bayaran ini telah ditolak. Penduduk perlu memuat naik resit baharu.",
            )),
            RefundProcessing | Refunded => {
                Err(conflict("Bil deposit ini sedang atau telah dipulangkan."))
            }
        },
        PaymentCommand::ManualPayment { reference, .. } => {
            required(reference, "Nombor rujukan bayaran diperlukan.")?;
            match status {
                Pending | Paid | Rejected => Ok(Transition::advance(status, Approved, true)),
                Approved => Ok(Transition::unchanged(status)),
                RefundProcessing | Refunded => {
                    Err(conflict("Bil deposit ini sedang atau telah dipulangkan."))
                }
            }
        }
        PaymentCommand::OnlinePayment { .. } => match status {
            Approved => Ok(Transition::unchanged(status)),
            RefundProcessing | Refunded => {
                Err(conflict("Bil deposit ini sedang atau telah dipulangkan."))
            }
            _ => Ok(Transition::advance(status, Approved, true)),
        },
        PaymentCommand::InitiateRefund {
            reference,
            evidence_url,
            checklist,
        } => {
            if bill.bill_type != BillType::Deposit {
                return Err(AppError::BadRequest(
                    "Hanya bil deposit boleh dipulangkan.".to_string(),
                ));
            }
            if bill.is_refunded() {
                return Err(conflict("Deposit ini telah dipulangkan."));
            }
            if status != Approved {
                return Err(conflict(
                    "Deposit mesti diluluskan sebelum pemulangan dimulakan.",
                ));
            }
            let has_reference = reference.as_deref().is_some_and(|r| !r.trim().is_empty());
            let has_evidence = evidence_url.as_deref().is_some_and(|u| !u.trim().is_empty());
            if !has_reference && !has_evidence && checklist.is_empty() {
                return Err(AppError::BadRequest(
                    "Sertakan rujukan, gambar bukti atau senarai semak pemulangan.".to_string(),
                ));
            }
            Ok(Transition::advance(status, RefundProcessing, false))
        }
        PaymentCommand::ApproveRefund { payout_proof_url } => {
            required(payout_proof_url, "Bukti pembayaran balik diperlukan.")?;
            if status != RefundProcessing {
                return Err(conflict("Tiada pemulangan deposit yang sedang diproses."));
            }
            Ok(Transition::advance(status, Approved, false))
        }
    }
}

/// Columns written alongside the status change. `None` keeps the stored value.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct BillPatch {
    pub receipt_url: Option<String>,
    pub payment_reference: Option<String>,
    pub payment_method: Option<&'static str>,
    pub refund_reference: Option<String>,
    pub refund_evidence_url: Option<String>,
    pub refund_checklist: Option<Value>,
    pub refund_proof_url: Option<String>,
    pub verified_by: Option<Uuid>,
}

pub fn patch_for(command: &PaymentCommand, actor_id: Uuid) -> BillPatch {
    let trimmed = |value: &str| value.trim().to_string();
    let non_blank = |value: &Option<String>| {
        value
            .as_deref()
            .map(str::trim)
            .filter(|value| !value.is_empty())
            .map(ToOwned::to_owned)
    };

    match command {
        PaymentCommand::UploadReceipt { receipt_url } => BillPatch {
            receipt_url: Some(trimmed(receipt_url)),
            payment_method: Some("TRANSFER"),
            ..BillPatch::default()
        },
        PaymentCommand::Verify { .. } => BillPatch {
            verified_by: Some(actor_id),
            ..BillPatch::default()
        },
        PaymentCommand::ManualPayment {
            reference,
            receipt_url,
        } => BillPatch {
            receipt_url: non_blank(receipt_url),
            payment_reference: Some(trimmed(reference)),
            payment_method: Some("MANUAL"),
            verified_by: Some(actor_id),
            ..BillPatch::default()
        },
        PaymentCommand::OnlinePayment { reference } => BillPatch {
            payment_reference: Some(trimmed(reference)),
            payment_method: Some("FPX"),
            ..BillPatch::default()
        },
        PaymentCommand::InitiateRefund {
            reference,
            evidence_url,
            checklist,
        } => BillPatch {
            refund_reference: non_blank(reference),
            refund_evidence_url: non_blank(evidence_url),
            refund_checklist: (!checklist.is_empty()).then(|| json!(checklist)),
            ..BillPatch::default()
        },
        PaymentCommand::ApproveRefund { payout_proof_url } => BillPatch {
            refund_proof_url: Some(trimmed(payout_proof_url)),
            verified_by: Some(actor_id),
            ..BillPatch::default()
        },
    }
}

/// Income row produced by an approval. Dated to the first day of the bill's
/// period so fund reports line up with the billing month.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IncomeDraft {
    pub fund_code: FundCode,
    pub amount: Decimal,
    pub income_date: NaiveDate,
    pub description: String,
}

pub fn income_for(
    bill: &Bill,
    unit_number: &str,
    command: &PaymentCommand,
) -> AppResult<IncomeDraft> {
    let period = BillingPeriod {
        month: u32::try_from(bill.month).unwrap_or_default(),
        year: bill.year,
    };
    let income_date = period
        .first_day()
        .ok_or_else(|| AppError::Internal("Bill has an invalid billing period.".to_string()))?;
    let description = match command {
        PaymentCommand::ManualPayment { reference, .. } => reference.trim().to_string(),
        PaymentCommand::OnlinePayment { reference } => format!("FPX {}", reference.trim()),
        _ => format!("Bayaran bil {} unit {unit_number}", period.label()),
    };
    Ok(IncomeDraft {
        fund_code: bill.bill_type.fund_code(),
        amount: bill.amount,
        income_date,
        description,
    })
}

#[derive(Debug, Clone, Serialize)]
pub struct PaymentOutcome {
    pub changed: bool,
    pub bill: Bill,
    pub income: Option<IncomeCollection>,
}

/// Apply a payment command to a bill inside one transaction.
///
/// The bill row is locked for the duration so two verifiers racing on the same
/// bill serialize; the loser sees APPROVED and gets a no-op. Audit and
/// notifications run after commit and never fail the request.
pub async fn apply_payment_command(
    pool: &PgPool,
    notifier: &Notifier,
    actor: &SessionUser,
    bill_id: Uuid,
    command: PaymentCommand,
) -> AppResult<PaymentOutcome> {
    let mut tx = pool.begin().await.map_err(map_db_error)?;

    let bill = sqlx::query_as::<_, Bill>("SELECT * FROM bills WHERE id = $1 FOR UPDATE")
        .bind(bill_id)
        .fetch_optional(&mut *tx)
        .await
        .map_err(map_db_error)?
        .ok_or_else(|| AppError::NotFound("Bil tidak dijumpai.".to_string()))?;
    let unit = sqlx::query_as::<_, Unit>("SELECT * FROM units WHERE id = $1")
        .bind(bill.unit_id)
        .fetch_one(&mut *tx)
        .await
        .map_err(map_db_error)?;

    let transition = plan_transition(&bill, &command)?;
    if !transition.changed {
        tx.rollback().await.map_err(map_db_error)?;
        return Ok(PaymentOutcome {
            changed: false,
            bill,
            income: None,
        });
    }

    let patch = patch_for(&command, actor.id);
    let updated = update_bill(&mut tx, bill.id, transition.to, &patch).await?;

    let income = if transition.record_income {
        let draft = income_for(&updated, &unit.unit_number, &command)?;
        insert_bill_income(&mut tx, &updated, &draft, actor.id).await?
    } else {
        None
    };

    tx.commit().await.map_err(map_db_error)?;

    tracing::info!(
        bill_id = %updated.id,
        unit = %unit.unit_number,
        from = transition.from.as_str(),
        to = transition.to.as_str(),
        income_recorded = income.is_some(),
        "Bill status changed"
    );

    write_audit_log(
        Some(pool),
        Some(actor.id),
        command.audit_action(),
        "bills",
        Some(&updated.id.to_string()),
        Some(json!({ "status": transition.from.as_str() })),
        Some(json!({
            "status": transition.to.as_str(),
            "income_id": income.as_ref().map(|row| row.id),
        })),
    )
    .await;

    notify_status_change(pool, notifier, &unit, &updated, &command).await;

    Ok(PaymentOutcome {
        changed: true,
        bill: updated,
        income,
    })
}

async fn update_bill(
    conn: &mut PgConnection,
    bill_id: Uuid,
    status: BillStatus,
    patch: &BillPatch,
) -> AppResult<Bill> {
    sqlx::query_as::<_, Bill>(
        "UPDATE bills SET
            status = $2,
            receipt_url = COALESCE($3, receipt_url),
            payment_reference = COALESCE($4, payment_reference),
            payment_method = COALESCE($5, payment_method),
            refund_reference = COALESCE($6, refund_reference),
            refund_evidence_url = COALESCE($7, refund_evidence_url),
            refund_checklist = COALESCE($8, refund_checklist),
            refund_proof_url = COALESCE($9, refund_proof_url),
            verified_by = COALESCE($10, verified_by),
            verified_at = CASE WHEN $10::uuid IS NULL THEN verified_at ELSE now() END,
            updated_at = now()
         WHERE id = $1
         RETURNING *",
    )
    .bind(bill_id)
    .bind(status)
    .bind(patch.receipt_url.as_deref())
    .bind(patch.payment_reference.as_deref())
    .bind(patch.payment_method)
    .bind(patch.refund_reference.as_deref())
    .bind(patch.refund_evidence_url.as_deref())
    .bind(patch.refund_checklist.as_ref())
    .bind(patch.refund_proof_url.as_deref())
    .bind(patch.verified_by)
    .fetch_one(&mut *conn)
    .await
    .map_err(map_db_error)
}

/// `None` when income for this bill already exists.
async fn insert_bill_income(
    conn: &mut PgConnection,
    bill: &Bill,
    draft: &IncomeDraft,
    actor_id: Uuid,
) -> AppResult<Option<IncomeCollection>> {
    let row = sqlx::query_as::<_, IncomeCollection>(
        "INSERT INTO income_collections
            (fund_code, unit_id, bill_id, amount, income_date, description, created_by)
         VALUES ($1, $2, $3, $4, $5, $6, $7)
         ON CONFLICT (bill_id) WHERE bill_id IS NOT NULL DO NOTHING
         RETURNING *",
    )
    .bind(draft.fund_code)
    .bind(bill.unit_id)
    .bind(bill.id)
    .bind(draft.amount)
    .bind(draft.income_date)
    .bind(&draft.description)
    .bind(actor_id)
    .fetch_optional(&mut *conn)
    .await
    .map_err(map_db_error)?;

    if row.is_none() {
        tracing::warn!(bill_id = %bill.id, "Income already recorded for bill; skipping");
    }
    Ok(row)
}

fn status_message(unit: &Unit, bill: &Bill, command: &PaymentCommand) -> Option<(String, String)> {
    let amount = format_ringgit(bill.amount);
    let unit_number = &unit.unit_number;
    let period = format!("{:02}/{}", bill.month, bill.year);
    match (command, bill.status) {
        (PaymentCommand::UploadReceipt { .. }, _) => None,
        (_, BillStatus::Rejected) => Some((
            format!("Bayaran ditolak - Unit {unit_number}"),
            format!(
                "Bayaran {amount} bagi bil {period} unit {unit_number} telah ditolak. \
                 Sila muat naik resit yang sah."
            ),
        )),
        (PaymentCommand::InitiateRefund { .. }, _) => Some((
            format!("Pemulangan deposit - Unit {unit_number}"),
            format!("Pemulangan deposit {amount} bagi unit {unit_number} sedang diproses."),
        )),
        (PaymentCommand::ApproveRefund { .. }, _) => Some((
            format!("Deposit dipulangkan - Unit {unit_number}"),
            format!("Deposit {amount} bagi unit {unit_number} telah dipulangkan."),
        )),
        (_, BillStatus::Approved) => Some((
            format!("Bayaran diterima - Unit {unit_number}"),
            format!(
                "Bayaran {amount} bagi bil {period} unit {unit_number} telah diterima. \
                 Terima kasih."
            ),
        )),
        _ => None,
    }
}

async fn notify_status_change(
    pool: &PgPool,
    notifier: &Notifier,
    unit: &Unit,
    bill: &Bill,
    command: &PaymentCommand,
) {
    let Some((subject, body)) = status_message(unit, bill, command) else {
        return;
    };
    let user_ids = [unit.owner_id, unit.tenant_id]
        .into_iter()
        .flatten()
        .collect::<Vec<_>>();
    let recipients = load_recipients(pool, &user_ids).await;
    for recipient in recipients.values() {
        let greeting = format!("Salam {},\n{body}", recipient.name);
        notifier.notify(recipient, &subject, &greeting);
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ManualArrearsPayment {
    pub unit: Unit,
    pub income: IncomeCollection,
    pub remaining: Decimal,
}

pub fn validate_manual_arrears_payment(outstanding: Decimal, amount: Decimal) -> AppResult<()> {
    if amount <= Decimal::ZERO {
        return Err(AppError::BadRequest(
            "Jumlah bayaran mestilah lebih daripada sifar.".to_string(),
        ));
    }
    if amount > outstanding {
        return Err(AppError::BadRequest(format!(
            "Jumlah melebihi tunggakan manual ({}).",
            format_ringgit(outstanding)
        )));
    }
    Ok(())
}

/// Settle part or all of a unit's legacy arrears. The balance reduction and
/// the maintenance-fund income row commit together or not at all.
pub async fn pay_manual_arrears(
    pool: &PgPool,
    actor: &SessionUser,
    unit_id: Uuid,
    amount: Decimal,
    reference: &str,
    paid_on: NaiveDate,
) -> AppResult<ManualArrearsPayment> {
    required(reference, "Nombor rujukan bayaran diperlukan.")?;
    let mut tx = pool.begin().await.map_err(map_db_error)?;

    let unit = sqlx::query_as::<_, Unit>(
        "SELECT * FROM units WHERE id = $1 AND deleted_at IS NULL FOR UPDATE",
    )
    .bind(unit_id)
    .fetch_optional(&mut *tx)
    .await
    .map_err(map_db_error)?
    .ok_or_else(|| AppError::NotFound("Unit tidak dijumpai.".to_string()))?;

    validate_manual_arrears_payment(unit.manual_arrears_amount, amount)?;

    let updated = sqlx::query_as::<_, Unit>(
        "UPDATE units SET manual_arrears_amount = manual_arrears_amount - $2
         WHERE id = $1
         RETURNING *",
    )
    .bind(unit.id)
    .bind(amount)
    .fetch_one(&mut *tx)
    .await
    .map_err(map_db_error)?;

    let income = sqlx::query_as::<_, IncomeCollection>(
        "INSERT INTO income_collections
            (fund_code, unit_id, amount, income_date, description, created_by)
         VALUES ($1, $2, $3, $4, $5, $6)
         RETURNING *",
    )
    .bind(FundCode::Maintenance)
    .bind(unit.id)
    .bind(amount)
    .bind(paid_on)
    .bind(format!("Bayaran tunggakan manual: {}", reference.trim()))
    .bind(actor.id)
    .fetch_one(&mut *tx)
    .await
    .map_err(map_db_error)?;

    tx.commit().await.map_err(map_db_error)?;

    write_audit_log(
        Some(pool),
        Some(actor.id),
        "unit.manual_arrears_paid",
        "units",
        Some(&unit.id.to_string()),
        Some(json!({ "manual_arrears_amount": unit.manual_arrears_amount })),
        Some(json!({
            "manual_arrears_amount": updated.manual_arrears_amount,
            "income_id": income.id,
        })),
    )
    .await;

    Ok(ManualArrearsPayment {
        remaining: updated.manual_arrears_amount,
        unit: updated,
        income,
    })
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;
    use uuid::Uuid;

    use super::{
        income_for, patch_for, plan_transition, validate_manual_arrears_payment, PaymentCommand,
    };
    use crate::{
        error::AppError,
        models::{Bill, BillStatus, BillType, FundCode},
        services::arrears::fixtures::bill,
    };

    fn bill_with(bill_type: BillType, status: BillStatus) -> Bill {
        let mut row = bill(Uuid::new_v4(), 88, 3, 2025, status);
        row.bill_type = bill_type;
        row
    }

    fn upload() -> PaymentCommand {
        PaymentCommand::UploadReceipt {
            receipt_url: "/uploads/receipts/a.jpg".to_string(),
        }
    }

    fn approve() -> PaymentCommand {
        PaymentCommand::Verify { approve: true }
    }

    #[test]
    fn receipt_upload_marks_bill_paid_without_income() {
        for status in [BillStatus::Pending, BillStatus::Rejected, BillStatus::Paid] {
            let transition = plan_transition(&bill_with(BillType::Maintenance, status), &upload())
                .expect("upload allowed");
            assert_eq!(transition.to, BillStatus::Paid);
            assert!(!transition.record_income);
        }
        let settled = bill_with(BillType::Maintenance, BillStatus::Approved);
        let err = plan_transition(&settled, &upload()).expect_err("approved bills are settled");
        assert!(matches!(err, AppError::Conflict(_)));
    }

    #[test]
    fn approval_records_income_once() {
        let paid = bill_with(BillType::Maintenance, BillStatus::Paid);
        let first = plan_transition(&paid, &approve()).expect("approve");
        assert!(first.changed && first.record_income);
        assert_eq!(first.to, BillStatus::Approved);

        let approved = bill_with(BillType::Maintenance, BillStatus::Approved);
        let second = plan_transition(&approved, &approve()).expect("re-approve is a no-op");
        assert!(!second.changed);
        assert!(!second.record_income);
    }

    #[test]
    fn rejection_never_records_income() {
        let transition = plan_transition(
            &bill_with(BillType::Maintenance, BillStatus::Paid),
            &PaymentCommand::Verify { approve: false },
        )
        .expect("reject");
        assert_eq!(transition.to, BillStatus::Rejected);
        assert!(!transition.record_income);
    }

    #[test]
    fn manual_payment_requires_reference() {
        let pending = bill_with(BillType::Maintenance, BillStatus::Pending);
        let missing = PaymentCommand::ManualPayment {
            reference: "  ".to_string(),
            receipt_url: None,
        };
        assert!(matches!(
            plan_transition(&pending, &missing),
            Err(AppError::BadRequest(_))
        ));

        let ok = PaymentCommand::ManualPayment {
            reference: "CASH-0042".to_string(),
            receipt_url: None,
        };
        let transition = plan_transition(&pending, &ok).expect("manual payment");
        assert!(transition.record_income);
        let draft = income_for(&pending, "J-13-1", &ok).expect("draft");
        assert_eq!(draft.description, "CASH-0042");
    }

    #[test]
    fn online_payment_is_guarded_only_by_approval() {
        let fpx = PaymentCommand::OnlinePayment {
            reference: "FPX123".to_string(),
        };
        for status in [BillStatus::Pending, BillStatus::Paid, BillStatus::Rejected] {
            let transition =
                plan_transition(&bill_with(BillType::Sinking, status), &fpx).expect("fpx");
            assert_eq!(transition.to, BillStatus::Approved);
        }
        let settled = plan_transition(&bill_with(BillType::Sinking, BillStatus::Approved), &fpx)
            .expect("no-op");
        assert!(!settled.changed);
    }

    #[test]
    fn online_payment_without_reference_still_approves() {
        let pending = bill_with(BillType::Maintenance, BillStatus::Pending);
        let blank = PaymentCommand::OnlinePayment {
            reference: String::new(),
        };
        let transition = plan_transition(&pending, &blank).expect("fpx without reference");
        assert_eq!(transition.to, BillStatus::Approved);
        assert!(transition.record_income);

        let generated = PaymentCommand::online(Some("   "));
        let PaymentCommand::OnlinePayment { reference } = &generated else {
            panic!("expected an online payment");
        };
        assert!(reference.starts_with("FPX-"));
        assert!(plan_transition(&pending, &generated).is_ok());

        assert_eq!(
            PaymentCommand::online(Some(" TXN-9 ")),
            PaymentCommand::OnlinePayment {
                reference: "TXN-9".to_string()
            }
        );
    }

    #[test]
    fn approved_income_lands_in_the_bill_fund_on_the_first_of_the_month() {
        let sinking = bill_with(BillType::Sinking, BillStatus::Paid);
        let draft = income_for(&sinking, "A-1-1", &approve()).expect("draft");
        assert_eq!(draft.fund_code, FundCode::Sinking);
        assert_eq!(draft.amount, Decimal::from(88));
        assert_eq!(draft.income_date.to_string(), "2025-03-01");
        assert_eq!(draft.description, "Bayaran bil 03/2025 unit A-1-1");

        let deposit = bill_with(BillType::Deposit, BillStatus::Paid);
        let draft = income_for(&deposit, "A-1-1", &approve()).expect("draft");
        assert_eq!(draft.fund_code, FundCode::Maintenance);
    }

    #[test]
    fn refund_walks_deposit_back_to_approved_with_proof() {
        let mut deposit = bill_with(BillType::Deposit, BillStatus::Approved);
        let initiate = PaymentCommand::InitiateRefund {
            reference: None,
            evidence_url: None,
            checklist: vec!["kunci dipulangkan".to_string()],
        };
        let started = plan_transition(&deposit, &initiate).expect("initiate");
        assert_eq!(started.to, BillStatus::RefundProcessing);
        assert!(!started.record_income);

        deposit.status = BillStatus::RefundProcessing;
        let close = PaymentCommand::ApproveRefund {
            payout_proof_url: "/uploads/refunds/p.pdf".to_string(),
        };
        let finished = plan_transition(&deposit, &close).expect("approve refund");
        assert_eq!(finished.to, BillStatus::Approved);
        assert!(!finished.record_income);

        let patch = patch_for(&close, Uuid::new_v4());
        deposit.status = finished.to;
        deposit.refund_proof_url = patch.refund_proof_url;
        assert!(deposit.is_refunded());
        assert!(matches!(
            plan_transition(&deposit, &initiate),
            Err(AppError::Conflict(_))
        ));
    }

    #[test]
    fn refund_needs_an_approved_deposit_and_evidence() {
        let initiate = PaymentCommand::InitiateRefund {
            reference: Some("TRX-9".to_string()),
            evidence_url: None,
            checklist: Vec::new(),
        };
        assert!(matches!(
            plan_transition(&bill_with(BillType::Maintenance, BillStatus::Approved), &initiate),
            Err(AppError::BadRequest(_))
        ));
        assert!(matches!(
            plan_transition(&bill_with(BillType::Deposit, BillStatus::Pending), &initiate),
            Err(AppError::Conflict(_))
        ));

        let empty = PaymentCommand::InitiateRefund {
            reference: Some(" ".to_string()),
            evidence_url: None,
            checklist: Vec::new(),
        };
        assert!(matches!(
            plan_transition(&bill_with(BillType::Deposit, BillStatus::Approved), &empty),
            Err(AppError::BadRequest(_))
        ));
    }

    #[test]
    fn refund_approval_requires_processing_state() {
        let close = PaymentCommand::ApproveRefund {
            payout_proof_url: "/uploads/refunds/p.pdf".to_string(),
        };
        let approved = bill_with(BillType::Deposit, BillStatus::Approved);
        assert!(plan_transition(&approved, &close).is_err());
    }

    #[test]
    fn manual_arrears_payment_bounds() {
        let outstanding = Decimal::from(100);
        assert!(validate_manual_arrears_payment(outstanding, Decimal::ZERO).is_err());
        assert!(validate_manual_arrears_payment(outstanding, Decimal::from(101)).is_err());
        assert!(validate_manual_arrears_payment(outstanding, Decimal::from(100)).is_ok());
        assert!(validate_manual_arrears_payment(outstanding, Decimal::new(4050, 2)).is_ok());
    }
}
