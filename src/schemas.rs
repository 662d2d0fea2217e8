use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use uuid::Uuid;
use validator::Validate;

use crate::{
    error::AppError,
    models::{BillType, ExpenseStatus, FundCode, Role, UnitType, VoteChoice},
};

pub fn validate_input<T: Validate>(input: &T) -> Result<(), AppError> {
    input
        .validate()
        .map_err(|errors| AppError::UnprocessableEntity(format!("Validation failed: {errors}")))
}

pub fn clamp_limit_in_range(limit: i64, minimum: i64, maximum: i64) -> i64 {
    limit.clamp(minimum, maximum)
}

pub fn serialize_to_map<T>(value: &T) -> serde_json::Map<String, serde_json::Value>
where
    T: Serialize,
{
    let json = serde_json::to_value(value)
        .unwrap_or_else(|_| serde_json::Value::Object(serde_json::Map::new()));
    json.as_object().cloned().unwrap_or_default()
}

pub fn remove_nulls(
    mut map: serde_json::Map<String, serde_json::Value>,
) -> serde_json::Map<String, serde_json::Value> {
    map.retain(|_, value| !value.is_null());
    map
}

fn default_limit_20() -> i64 {
    20
}
fn default_limit_50() -> i64 {
    50
}
fn default_limit_100() -> i64 {
    100
}

// Cron and billing

#[derive(Debug, Clone, Default, Deserialize)]
pub struct PeriodQuery {
    pub month: Option<u32>,
    pub year: Option<i32>,
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct GenerateBillsInput {
    #[validate(range(min = 1, max = 12))]
    pub month: Option<u32>,
    #[validate(range(min = 2000, max = 2100))]
    pub year: Option<i32>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateBillInput {
    pub unit_id: Uuid,
    #[validate(range(min = 1, max = 12))]
    pub month: u32,
    #[validate(range(min = 2000, max = 2100))]
    pub year: i32,
    #[serde(rename = "type", default = "default_bill_type")]
    pub bill_type: BillType,
    pub amount: Option<f64>,
}

fn default_bill_type() -> BillType {
    BillType::Maintenance
}

#[derive(Debug, Clone, Deserialize)]
pub struct BillsQuery {
    pub status: Option<String>,
    pub unit_id: Option<Uuid>,
    pub month: Option<i16>,
    pub year: Option<i32>,
    #[serde(default = "default_limit_100")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BillPath {
    pub bill_id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
pub struct VerifyPaymentInput {
    pub approve: bool,
}

#[derive(Debug, Clone, Default, Deserialize, Validate)]
pub struct OnlinePaymentInput {
    #[validate(length(max = 120))]
    pub reference: Option<String>,
}

// Units

#[derive(Debug, Clone, Deserialize)]
pub struct UnitsQuery {
    pub q: Option<String>,
    #[serde(default)]
    pub include_inactive: bool,
    #[serde(default = "default_limit_100")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UnitPath {
    pub unit_id: Uuid,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CreateUnitInput {
    #[validate(length(min = 1, max = 32))]
    pub unit_number: String,
    #[serde(rename = "type")]
    pub unit_type: UnitType,
    pub owner_id: Option<Uuid>,
    pub tenant_id: Option<Uuid>,
    #[validate(range(min = 0.0))]
    pub manual_arrears_amount: Option<f64>,
    pub monthly_adjustment_amount: Option<f64>,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct UpdateUnitInput {
    #[validate(length(min = 1, max = 32))]
    pub unit_number: Option<String>,
    #[serde(rename = "type")]
    pub unit_type: Option<UnitType>,
    pub owner_id: Option<Uuid>,
    pub tenant_id: Option<Uuid>,
    #[validate(range(min = 0.0))]
    pub manual_arrears_amount: Option<f64>,
    pub monthly_adjustment_amount: Option<f64>,
    pub is_active: Option<bool>,
    /// Remove the current tenant.
    #[serde(default, skip_serializing)]
    pub clear_tenant: bool,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct PayManualArrearsInput {
    pub amount: f64,
    #[validate(length(min = 1, max = 120))]
    pub reference: String,
}

// Finance

#[derive(Debug, Clone, Deserialize)]
pub struct FinanceQuery {
    pub fund_code: Option<FundCode>,
    pub status: Option<ExpenseStatus>,
    #[serde(default = "default_limit_50")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct RecordIncomeInput {
    pub fund_code: FundCode,
    pub amount: f64,
    pub income_date: Option<NaiveDate>,
    #[validate(length(min = 1, max = 500))]
    pub description: String,
    pub unit_id: Option<Uuid>,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateExpenseInput {
    pub fund_code: FundCode,
    pub category_id: Uuid,
    pub amount: f64,
    #[validate(length(min = 1, max = 500))]
    pub description: String,
    pub expense_date: NaiveDate,
    pub receipt_url: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExpensePath {
    pub expense_id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ExpenseDecisionInput {
    pub approve: bool,
}

#[derive(Debug, Clone, Deserialize, Serialize, Validate)]
pub struct CreateCategoryInput {
    #[validate(length(min = 1, max = 120))]
    pub name: String,
}

// Settings

#[derive(Debug, Clone, Deserialize)]
pub struct BillingRatesInput {
    pub atas: f64,
    pub bawah: f64,
}

// AGM

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateAgmInput {
    #[validate(length(min = 1, max = 200))]
    pub title: String,
    pub meeting_date: NaiveDate,
}

#[derive(Debug, Clone, Deserialize)]
pub struct AgmPath {
    pub agm_id: Uuid,
}

#[derive(Debug, Clone, Deserialize, Validate)]
pub struct CreateResolutionInput {
    #[validate(length(min = 1, max = 300))]
    pub title: String,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ResolutionPath {
    pub resolution_id: Uuid,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CastVoteInput {
    pub choice: VoteChoice,
}

// Users

#[derive(Debug, Clone, Deserialize)]
pub struct UsersQuery {
    pub role: Option<Role>,
    pub q: Option<String>,
    #[serde(default = "default_limit_100")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct UserPath {
    pub user_id: Uuid,
}

/// `eligible: null` clears the override.
#[derive(Debug, Clone, Deserialize, Validate)]
pub struct EligibilityOverrideInput {
    pub eligible: Option<bool>,
    #[validate(length(max = 500))]
    pub reason: Option<String>,
}

// Misc

#[derive(Debug, Clone, Deserialize)]
pub struct SearchQuery {
    #[serde(default)]
    pub q: String,
    #[serde(default = "default_limit_20")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NotificationsQuery {
    #[serde(default = "default_limit_20")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AuditLogsQuery {
    pub entity_name: Option<String>,
    pub action: Option<String>,
    pub actor_user_id: Option<Uuid>,
    #[serde(default = "default_limit_50", skip_serializing)]
    pub limit: i64,
    #[serde(default, skip_serializing)]
    pub offset: i64,
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::{
        remove_nulls, serialize_to_map, validate_input, AuditLogsQuery, CreateBillInput,
        UpdateUnitInput,
    };
    use crate::models::BillType;

    #[test]
    fn bill_type_defaults_to_maintenance() {
        let input: CreateBillInput = serde_json::from_value(json!({
            "unit_id": "550e8400-e29b-41d4-a716-446655440000",
            "month": 3,
            "year": 2025
        }))
        .expect("valid input");
        assert_eq!(input.bill_type, BillType::Maintenance);
        assert!(validate_input(&input).is_ok());
    }

    #[test]
    fn out_of_range_month_fails_validation() {
        let input: CreateBillInput = serde_json::from_value(json!({
            "unit_id": "550e8400-e29b-41d4-a716-446655440000",
            "month": 13,
            "year": 2025,
            "type": "SINKING",
            "amount": 20.0
        }))
        .expect("parses");
        assert!(validate_input(&input).is_err());
    }

    #[test]
    fn unit_patch_map_drops_unset_fields() {
        let input: UpdateUnitInput = serde_json::from_value(json!({
            "type": "ATAS",
            "monthly_adjustment_amount": 40.0,
            "clear_tenant": true
        }))
        .expect("parses");
        let map = remove_nulls(serialize_to_map(&input));
        assert_eq!(map.get("type"), Some(&json!("ATAS")));
        assert!(map.contains_key("monthly_adjustment_amount"));
        assert!(!map.contains_key("tenant_id"));
        assert!(!map.contains_key("clear_tenant"));
    }

    #[test]
    fn audit_filters_exclude_paging() {
        let query: AuditLogsQuery =
            serde_json::from_value(json!({ "entity_name": "bills", "limit": 10 })).expect("parses");
        let filters = remove_nulls(serialize_to_map(&query));
        assert_eq!(filters.len(), 1);
        assert_eq!(query.limit, 10);
    }
}
