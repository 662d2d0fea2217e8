use chrono::NaiveDate;
use rust_decimal::Decimal;
use serde::Serialize;
use serde_json::json;
use sqlx::PgPool;
use uuid::Uuid;

use crate::{
    auth::SessionUser,
    error::{map_db_error, AppError, AppResult},
    models::{Expense, ExpenseStatus, FundCode, IncomeCollection},
    services::audit::write_audit_log,
};

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FundBalance {
    pub code: FundCode,
    pub name: String,
    pub income: Decimal,
    pub expenses: Decimal,
    pub balance: Decimal,
}

/// Balances are derived on every read: income minus APPROVED expenses.
pub async fn fund_balances(pool: &PgPool) -> AppResult<Vec<FundBalance>> {
    let rows: Vec<(FundCode, String, Decimal, Decimal)> = sqlx::query_as(
        "SELECT f.code, f.name,
                COALESCE((SELECT SUM(i.amount) FROM income_collections i
                          WHERE i.fund_code = f.code), 0) AS income,
                COALESCE((SELECT SUM(e.amount) FROM expenses e
                          WHERE e.fund_code = f.code AND e.status = 'APPROVED'), 0) AS expenses
         FROM funds f
         ORDER BY f.code",
    )
    .fetch_all(pool)
    .await
    .map_err(map_db_error)?;

    Ok(rows
        .into_iter()
        .map(|(code, name, income, expenses)| FundBalance {
            code,
            name,
            income,
            expenses,
            balance: income - expenses,
        })
        .collect())
}

pub fn parse_amount(value: f64) -> AppResult<Decimal> {
    if !value.is_finite() || value <= 0.0 {
        return Err(AppError::BadRequest(
            "Jumlah mestilah nombor positif.".to_string(),
        ));
    }
    Decimal::try_from(value)
        .map(|amount| amount.round_dp(2))
        .map_err(|_| AppError::BadRequest("Jumlah tidak sah.".to_string()))
}

pub async fn list_income(
    pool: &PgPool,
    fund_code: Option<FundCode>,
    limit: i64,
) -> AppResult<Vec<IncomeCollection>> {
    sqlx::query_as::<_, IncomeCollection>(
        "SELECT * FROM income_collections
         WHERE ($1::fund_code IS NULL OR fund_code = $1)
         ORDER BY income_date DESC, created_at DESC
         LIMIT $2",
    )
    .bind(fund_code)
    .bind(limit)
    .fetch_all(pool)
    .await
    .map_err(map_db_error)
}

/// Income not tied to a bill, e.g. hall rental or interest.
pub async fn record_income(
    pool: &PgPool,
    actor: &SessionUser,
    fund_code: FundCode,
    amount: Decimal,
    income_date: NaiveDate,
    description: &str,
    unit_id: Option<Uuid>,
) -> AppResult<IncomeCollection> {
    if description.trim().is_empty() {
        return Err(AppError::BadRequest("Keterangan pendapatan diperlukan.".to_string()));
    }
    let income = sqlx::query_as::<_, IncomeCollection>(
        "INSERT INTO income_collections
            (fund_code, unit_id, amount, income_date, description, created_by)
         VALUES ($1, $2, $3, $4, $5, $6)
         RETURNING *",
    )
    .bind(fund_code)
    .bind(unit_id)
    .bind(amount)
    .bind(income_date)
    .bind(description.trim())
    .bind(actor.id)
    .fetch_one(pool)
    .await
    .map_err(map_db_error)?;

    write_audit_log(
        Some(pool),
        Some(actor.id),
        "income.recorded",
        "income_collections",
        Some(&income.id.to_string()),
        None,
        Some(json!({ "fund_code": fund_code, "amount": amount })),
    )
    .await;
    Ok(income)
}

pub async fn list_expenses(
    pool: &PgPool,
    status: Option<ExpenseStatus>,
    limit: i64,
) -> AppResult<Vec<Expense>> {
    sqlx::query_as::<_, Expense>(
        "SELECT * FROM expenses
         WHERE ($1::expense_status IS NULL OR status = $1)
         ORDER BY expense_date DESC, created_at DESC
         LIMIT $2",
    )
    .bind(status)
    .bind(limit)
    .fetch_all(pool)
    .await
    .map_err(map_db_error)
}

pub struct NewExpense<'a> {
    pub fund_code: FundCode,
    pub category_id: Uuid,
    pub amount: Decimal,
    pub description: &'a str,
    pub expense_date: NaiveDate,
    pub receipt_url: Option<&'a str>,
}

pub async fn submit_expense(
    pool: &PgPool,
    actor: &SessionUser,
    expense: NewExpense<'_>,
) -> AppResult<Expense> {
    if expense.description.trim().is_empty() {
        return Err(AppError::BadRequest("Keterangan perbelanjaan diperlukan.".to_string()));
    }
    let category_exists: bool =
        sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM expense_categories WHERE id = $1)")
            .bind(expense.category_id)
            .fetch_one(pool)
            .await
            .map_err(map_db_error)?;
    if !category_exists {
        return Err(AppError::BadRequest("Kategori perbelanjaan tidak sah.".to_string()));
    }

    let created = sqlx::query_as::<_, Expense>(
        "INSERT INTO expenses
            (fund_code, category_id, amount, description, expense_date, status,
             receipt_url, requested_by)
         VALUES ($1, $2, $3, $4, $5, 'PENDING', $6, $7)
         RETURNING *",
    )
    .bind(expense.fund_code)
    .bind(expense.category_id)
    .bind(expense.amount)
    .bind(expense.description.trim())
    .bind(expense.expense_date)
    .bind(expense.receipt_url)
    .bind(actor.id)
    .fetch_one(pool)
    .await
    .map_err(map_db_error)?;

    write_audit_log(
        Some(pool),
        Some(actor.id),
        "expense.submitted",
        "expenses",
        Some(&created.id.to_string()),
        None,
        Some(json!({ "fund_code": created.fund_code, "amount": created.amount })),
    )
    .await;
    Ok(created)
}

/// Approve or reject a PENDING expense. Decided expenses are final.
pub async fn decide_expense(
    pool: &PgPool,
    actor: &SessionUser,
    expense_id: Uuid,
    approve: bool,
) -> AppResult<Expense> {
    let target = if approve {
        ExpenseStatus::Approved
    } else {
        ExpenseStatus::Rejected
    };

    let updated = sqlx::query_as::<_, Expense>(
        "UPDATE expenses
         SET status = $2, decided_by = $3, decided_at = now()
         WHERE id = $1 AND status = 'PENDING'
         RETURNING *",
    )
    .bind(expense_id)
    .bind(target)
    .bind(actor.id)
    .fetch_optional(pool)
    .await
    .map_err(map_db_error)?;

    let Some(updated) = updated else {
        let exists: bool =
            sqlx::query_scalar("SELECT EXISTS (SELECT 1 FROM expenses WHERE id = $1)")
                .bind(expense_id)
            .fetch_one(pool)
            .await
            .map_err(map_db_error)?;
        return Err(if exists {
            AppError::Conflict("Perbelanjaan ini telah diputuskan.".to_string())
        } else {
            AppError::NotFound("Perbelanjaan tidak dijumpai.".to_string())
        });
    };

    write_audit_log(
        Some(pool),
        Some(actor.id),
        if approve {
            "expense.approved"
        } else {
            "expense.rejected"
        },
        "expenses",
        Some(&expense_id.to_string()),
        Some(json!({ "status": ExpenseStatus::Pending })),
        Some(json!({ "status": updated.status })),
    )
    .await;
    Ok(updated)
}

#[cfg(test)]
mod tests {
    use rust_decimal::Decimal;

    use super::parse_amount;

    #[test]
    fn amounts_must_be_positive_and_are_rounded_to_sen() {
        assert!(parse_amount(0.0).is_err());
        assert!(parse_amount(-5.0).is_err());
        assert!(parse_amount(f64::NAN).is_err());
        assert!(parse_amount(f64::INFINITY).is_err());
        assert_eq!(parse_amount(150.0).ok(), Some(Decimal::from(150)));
        assert_eq!(parse_amount(12.345).ok(), Some(Decimal::new(1234, 2)));
    }
}
