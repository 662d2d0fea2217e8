use chrono::{DateTime, NaiveDate, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "user_role", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Role {
    SuperAdmin,
    Jmb,
    Staff,
    Finance,
    Owner,
    Tenant,
}

impl Role {
    pub const ALL: [Role; 6] = [
        Role::SuperAdmin,
        Role::Jmb,
        Role::Staff,
        Role::Finance,
        Role::Owner,
        Role::Tenant,
    ];

    pub fn is_management(self) -> bool {
        !matches!(self, Role::Owner | Role::Tenant)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Role::SuperAdmin => "SUPER_ADMIN",
            Role::Jmb => "JMB",
            Role::Staff => "STAFF",
            Role::Finance => "FINANCE",
            Role::Owner => "OWNER",
            Role::Tenant => "TENANT",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "unit_type", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum UnitType {
    /// Upper-floor unit.
    Atas,
    /// Ground-floor unit.
    Bawah,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "bill_type", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BillType {
    Maintenance,
    Sinking,
    Deposit,
}

impl BillType {
    /// Fund credited when a bill of this type is approved. Deposits are held
    /// in the maintenance fund.
    pub fn fund_code(self) -> FundCode {
        match self {
            BillType::Sinking => FundCode::Sinking,
            BillType::Maintenance | BillType::Deposit => FundCode::Maintenance,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "bill_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BillStatus {
    Pending,
    Paid,
    Approved,
    Rejected,
    RefundProcessing,
    /// Present in stored data only; closing a refund returns the bill to
    /// `Approved` with a refund proof attached.
    Refunded,
}

impl BillStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            BillStatus::Pending => "PENDING",
            BillStatus::Paid => "PAID",
            BillStatus::Approved => "APPROVED",
            BillStatus::Rejected => "REJECTED",
            BillStatus::RefundProcessing => "REFUND_PROCESSING",
            BillStatus::Refunded => "REFUNDED",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_ascii_uppercase().as_str() {
            "PENDING" => Some(BillStatus::Pending),
            "PAID" => Some(BillStatus::Paid),
            "APPROVED" => Some(BillStatus::Approved),
            "REJECTED" => Some(BillStatus::Rejected),
            "REFUND_PROCESSING" => Some(BillStatus::RefundProcessing),
            "REFUNDED" => Some(BillStatus::Refunded),
            _ => None,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "fund_code", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum FundCode {
    Maintenance,
    Sinking,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "expense_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ExpenseStatus {
    Pending,
    Approved,
    Rejected,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "agm_status", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum AgmStatus {
    Draft,
    Active,
    Closed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "vote_choice", rename_all = "SCREAMING_SNAKE_CASE")]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum VoteChoice {
    /// Agree.
    Setuju,
    /// Disagree.
    TidakSetuju,
    /// Abstain.
    Berkecuali,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct User {
    pub id: Uuid,
    pub name: String,
    pub email: Option<String>,
    pub phone: Option<String>,
    pub role: Role,
    pub voting_eligibility_override: Option<bool>,
    pub voting_eligibility_reason: Option<String>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Unit {
    pub id: Uuid,
    pub unit_number: String,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub unit_type: UnitType,
    pub owner_id: Option<Uuid>,
    pub tenant_id: Option<Uuid>,
    pub manual_arrears_amount: Decimal,
    pub monthly_adjustment_amount: Decimal,
    pub is_active: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Bill {
    pub id: Uuid,
    pub unit_id: Uuid,
    pub amount: Decimal,
    pub month: i16,
    pub year: i32,
    #[sqlx(rename = "type")]
    #[serde(rename = "type")]
    pub bill_type: BillType,
    pub status: BillStatus,
    pub receipt_url: Option<String>,
    pub payment_reference: Option<String>,
    pub payment_method: Option<String>,
    pub refund_reference: Option<String>,
    pub refund_evidence_url: Option<String>,
    pub refund_proof_url: Option<String>,
    pub refund_checklist: Option<serde_json::Value>,
    pub verified_by: Option<Uuid>,
    pub verified_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Bill {
    /// A deposit whose refund has been paid out. Regular approved bills never
    /// carry a refund proof.
    pub fn is_refunded(&self) -> bool {
        self.status == BillStatus::Refunded
            || (self.bill_type == BillType::Deposit
                && self.status == BillStatus::Approved
                && self.refund_proof_url.is_some())
    }
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct IncomeCollection {
    pub id: Uuid,
    pub fund_code: FundCode,
    pub unit_id: Option<Uuid>,
    pub bill_id: Option<Uuid>,
    pub amount: Decimal,
    pub income_date: NaiveDate,
    pub description: Option<String>,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Expense {
    pub id: Uuid,
    pub fund_code: FundCode,
    pub category_id: Uuid,
    pub amount: Decimal,
    pub description: String,
    pub expense_date: NaiveDate,
    pub status: ExpenseStatus,
    pub receipt_url: Option<String>,
    pub requested_by: Option<Uuid>,
    pub decided_by: Option<Uuid>,
    pub decided_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Agm {
    pub id: Uuid,
    pub title: String,
    pub meeting_date: NaiveDate,
    pub status: AgmStatus,
    pub created_by: Option<Uuid>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct AgmResolution {
    pub id: Uuid,
    pub agm_id: Uuid,
    pub title: String,
    pub description: Option<String>,
    pub position: i32,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, FromRow)]
pub struct Vote {
    pub id: Uuid,
    pub resolution_id: Uuid,
    pub user_id: Uuid,
    pub choice: VoteChoice,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use rust_decimal::Decimal;
    use uuid::Uuid;

    use super::{Bill, BillStatus, BillType, FundCode, Role};

    fn bill(bill_type: BillType, status: BillStatus, refund_proof: Option<&str>) -> Bill {
        Bill {
            id: Uuid::new_v4(),
            unit_id: Uuid::new_v4(),
            amount: Decimal::new(50000, 2),
            month: 1,
            year: 2025,
            bill_type,
            status,
            receipt_url: None,
            payment_reference: None,
            payment_method: None,
            refund_reference: None,
            refund_evidence_url: None,
            refund_proof_url: refund_proof.map(ToOwned::to_owned),
            refund_checklist: None,
            verified_by: None,
            verified_at: None,
            created_at: Utc::now(),
            updated_at: Utc::now(),
        }
    }

    #[test]
    fn refunded_requires_deposit_with_proof() {
        let proof = Some("/uploads/x.pdf");
        assert!(bill(BillType::Deposit, BillStatus::Approved, proof).is_refunded());
        assert!(!bill(BillType::Deposit, BillStatus::Approved, None).is_refunded());
        assert!(!bill(BillType::Maintenance, BillStatus::Approved, proof).is_refunded());
        assert!(!bill(BillType::Deposit, BillStatus::RefundProcessing, proof).is_refunded());
    }

    #[test]
    fn deposits_and_maintenance_share_a_fund() {
        assert_eq!(BillType::Maintenance.fund_code(), FundCode::Maintenance);
        assert_eq!(BillType::Deposit.fund_code(), FundCode::Maintenance);
        assert_eq!(BillType::Sinking.fund_code(), FundCode::Sinking);
    }

    #[test]
    fn parses_status_case_insensitively() {
        assert_eq!(BillStatus::parse("pending"), Some(BillStatus::Pending));
        assert_eq!(
            BillStatus::parse(" refund_processing "),
            Some(BillStatus::RefundProcessing)
        );
        assert_eq!(BillStatus::parse("void"), None);
    }

    #[test]
    fn residents_are_not_management() {
        assert!(Role::Jmb.is_management());
        assert!(Role::Finance.is_management());
        assert!(!Role::Owner.is_management());
        assert!(!Role::Tenant.is_management());
    }
}
