use serde_json::{Map, Value};
use sqlx::{postgres::PgRow, Postgres, QueryBuilder, Row};
use uuid::Uuid;

use crate::error::{map_db_error, AppError};

const ALLOWED_TABLES: &[&str] = &[
    "agm_resolutions",
    "agms",
    "audit_logs",
    "bills",
    "expense_categories",
    "expenses",
    "funds",
    "income_collections",
    "system_settings",
    "units",
    "users",
    "votes",
];

/// List rows as JSON objects. Filter keys are column names, optionally with a
/// `__ilike`, `__in` or `__is_null` suffix; `null` values are ignored.
pub async fn list_rows(
    pool: &sqlx::PgPool,
    table: &str,
    filters: Option<&Map<String, Value>>,
    limit: i64,
    offset: i64,
    order_by: &str,
    ascending: bool,
) -> Result<Vec<Value>, AppError> {
    let table_name = validate_table(table)?;
    let order_name = if order_by.trim().is_empty() {
        "created_at"
    } else {
        validate_identifier(order_by)?
    };

    let mut query = QueryBuilder::<Postgres>::new("SELECT row_to_json(t) AS row FROM ");
    query.push(table_name).push(" t WHERE 1=1");
    if let Some(filter_map) = filters {
        for (key, value) in filter_map {
            push_filter_clause(&mut query, key, value)?;
        }
    }

    query
        .push(" ORDER BY t.")
        .push(order_name)
        .push(if ascending { " ASC" } else { " DESC" })
        .push(" LIMIT ")
        .push_bind(limit.clamp(1, 500))
        .push(" OFFSET ")
        .push_bind(offset.max(0));

    let rows = query.build().fetch_all(pool).await.map_err(map_db_error)?;
    Ok(read_rows(rows))
}

pub async fn count_rows(
    pool: &sqlx::PgPool,
    table: &str,
    filters: Option<&Map<String, Value>>,
) -> Result<i64, AppError> {
    let table_name = validate_table(table)?;

    let mut query = QueryBuilder::<Postgres>::new("SELECT COUNT(*)::bigint AS total FROM ");
    query.push(table_name).push(" t WHERE 1=1");
    if let Some(filter_map) = filters {
        for (key, value) in filter_map {
            push_filter_clause(&mut query, key, value)?;
        }
    }

    let row = query.build().fetch_one(pool).await.map_err(map_db_error)?;
    Ok(row.try_get::<i64, _>("total").unwrap_or(0))
}

/// Insert one row. Column types (uuid, enums, numeric) are resolved by
/// `jsonb_populate_record` against the table definition.
pub async fn create_row(
    pool: &sqlx::PgPool,
    table: &str,
    payload: &Map<String, Value>,
) -> Result<Value, AppError> {
    let table_name = validate_table(table)?;
    if payload.is_empty() {
        return Err(AppError::BadRequest(format!(
            "Could not create {table_name} record."
        )));
    }
    let keys = sorted_keys(payload)?;

    let mut query = QueryBuilder::<Postgres>::new("INSERT INTO ");
    query.push(table_name).push(" (");
    {
        let mut separated = query.separated(", ");
        for key in &keys {
            separated.push(*key);
        }
    }
    query.push(") SELECT ");
    {
        let mut separated = query.separated(", ");
        for key in &keys {
            separated.push("r.");
            separated.push_unseparated(*key);
        }
    }
    query
        .push(" FROM jsonb_populate_record(NULL::")
        .push(table_name)
        .push(", ")
        .push_bind(Value::Object(payload.clone()))
        .push(") r RETURNING row_to_json(")
        .push(table_name)
        .push(".*) AS row");

    let row = query
        .build()
        .fetch_optional(pool)
        .await
        .map_err(map_db_error)?;

    row.and_then(|value| value.try_get::<Option<Value>, _>("row").ok().flatten())
        .ok_or_else(|| AppError::Internal(format!("Could not create {table_name} record.")))
}

pub async fn update_row(
    pool: &sqlx::PgPool,
    table: &str,
    row_id: Uuid,
    payload: &Map<String, Value>,
) -> Result<Value, AppError> {
    let table_name = validate_table(table)?;
    if payload.is_empty() {
        return Err(AppError::BadRequest("No fields to update.".to_string()));
    }
    let keys = sorted_keys(payload)?;

    let mut query = QueryBuilder::<Postgres>::new("UPDATE ");
    query.push(table_name).push(" t SET ");
    {
        let mut separated = query.separated(", ");
        for key in &keys {
            separated.push(*key);
            separated.push_unseparated(" = r.");
            separated.push_unseparated(*key);
        }
    }
    query
        .push(" FROM jsonb_populate_record(NULL::")
        .push(table_name)
        .push(", ")
        .push_bind(Value::Object(payload.clone()))
        .push(") r WHERE t.id = ")
        .push_bind(row_id)
        .push(" RETURNING row_to_json(t) AS row");

    let row = query
        .build()
        .fetch_optional(pool)
        .await
        .map_err(map_db_error)?;

    row.and_then(|value| value.try_get::<Option<Value>, _>("row").ok().flatten())
        .ok_or_else(|| AppError::NotFound(format!("{table_name} record not found.")))
}

fn sorted_keys(payload: &Map<String, Value>) -> Result<Vec<&str>, AppError> {
    let mut keys = payload
        .keys()
        .map(|key| validate_identifier(key))
        .collect::<Result<Vec<_>, _>>()?;
    keys.sort_unstable();
    Ok(keys)
}

fn read_rows(rows: Vec<PgRow>) -> Vec<Value> {
    rows.into_iter()
        .filter_map(|row| row.try_get::<Option<Value>, _>("row").ok().flatten())
        .collect()
}

fn validate_table(table: &str) -> Result<&str, AppError> {
    let normalized = validate_identifier(table)?;
    if ALLOWED_TABLES.contains(&normalized) {
        return Ok(normalized);
    }
    Err(AppError::Forbidden(format!(
        "Table '{normalized}' is not allowed."
    )))
}

fn validate_identifier(identifier: &str) -> Result<&str, AppError> {
    let trimmed = identifier.trim();
    let valid = !trimmed.is_empty()
        && trimmed.chars().all(|character| {
            character.is_ascii_lowercase() || character.is_ascii_digit() || character == '_'
        })
        && !trimmed.starts_with(|first: char| first.is_ascii_digit());
    if !valid {
        return Err(AppError::BadRequest(format!(
            "Invalid identifier '{trimmed}'."
        )));
    }
    Ok(trimmed)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterOperator {
    Eq,
    ILike,
    In,
    IsNull,
}

fn parse_filter_key(filter_key: &str) -> Result<(&str, FilterOperator), AppError> {
    let (column, operator) = match filter_key.rsplit_once("__") {
        Some((column, "ilike")) => (column, FilterOperator::ILike),
        Some((column, "in")) => (column, FilterOperator::In),
        Some((column, "is_null")) => (column, FilterOperator::IsNull),
        _ => (filter_key, FilterOperator::Eq),
    };
    Ok((validate_identifier(column)?, operator))
}

fn is_uuid_column(column: &str) -> bool {
    column == "id" || column.ends_with("_id") || column.ends_with("_by")
}

fn push_filter_clause(
    query: &mut QueryBuilder<Postgres>,
    filter_key: &str,
    value: &Value,
) -> Result<(), AppError> {
    let (column, operator) = parse_filter_key(filter_key)?;

    match operator {
        FilterOperator::IsNull => {
            let should_be_null = !matches!(value, Value::Bool(false));
            query
                .push(" AND t.")
                .push(column)
                .push(if should_be_null { " IS NULL" } else { " IS NOT NULL" });
        }
        FilterOperator::ILike => {
            if let Some(text) = value.as_str().filter(|text| !text.trim().is_empty()) {
                query
                    .push(" AND t.")
                    .push(column)
                    .push("::text ILIKE ")
                    .push_bind(format!("%{}%", text.trim()));
            }
        }
        FilterOperator::In => {
            let Value::Array(items) = value else {
                return Err(AppError::BadRequest(format!(
                    "Filter '{filter_key}' expects an array."
                )));
            };
            let texts = items
                .iter()
                .filter_map(Value::as_str)
                .map(|text| text.trim().to_string())
                .collect::<Vec<_>>();
            if texts.is_empty() {
                return Ok(());
            }
            query
                .push(" AND t.")
                .push(column)
                .push("::text = ANY(")
                .push_bind(texts)
                .push(")");
        }
        FilterOperator::Eq => match value {
            Value::Null => {}
            Value::Bool(flag) => {
                query.push(" AND t.").push(column).push(" = ").push_bind(*flag);
            }
            Value::Number(number) if number.is_i64() => {
                query
                    .push(" AND t.")
                    .push(column)
                    .push(" = ")
                    .push_bind(number.as_i64().unwrap_or_default());
            }
            Value::String(text) if is_uuid_column(column) => {
                let id = Uuid::parse_str(text.trim()).map_err(|_| {
                    AppError::BadRequest(format!("Filter '{filter_key}' must be a UUID."))
                })?;
                query.push(" AND t.").push(column).push(" = ").push_bind(id);
            }
            other => {
                let text = match other {
                    Value::String(text) => text.clone(),
                    _ => other.to_string(),
                };
                query
                    .push(" AND t.")
                    .push(column)
                    .push("::text = ")
                    .push_bind(text);
            }
        },
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Value};
    use sqlx::{Postgres, QueryBuilder};

    use super::{
        parse_filter_key, push_filter_clause, validate_identifier, validate_table, FilterOperator,
    };

    fn where_sql(key: &str, value: Value) -> String {
        let mut query = QueryBuilder::<Postgres>::new("SELECT * FROM units t WHERE 1=1");
        push_filter_clause(&mut query, key, &value).expect("filter accepted");
        query.sql().to_string()
    }

    #[test]
    fn rejects_unknown_tables_and_bad_identifiers() {
        assert!(validate_table("units").is_ok());
        assert!(validate_table("pg_shadow").is_err());
        assert!(validate_identifier("unit_number").is_ok());
        assert!(validate_identifier("1abc").is_err());
        assert!(validate_identifier("name; drop table users").is_err());
        assert!(validate_identifier("  ").is_err());
    }

    #[test]
    fn parses_filter_suffixes() {
        assert_eq!(
            parse_filter_key("unit_number__ilike").ok(),
            Some(("unit_number", FilterOperator::ILike))
        );
        assert_eq!(
            parse_filter_key("deleted_at__is_null").ok(),
            Some(("deleted_at", FilterOperator::IsNull))
        );
        assert_eq!(
            parse_filter_key("status__in").ok(),
            Some(("status", FilterOperator::In))
        );
        assert_eq!(
            parse_filter_key("entity_name").ok(),
            Some(("entity_name", FilterOperator::Eq))
        );
    }

    #[test]
    fn builds_filter_sql() {
        assert_eq!(
            where_sql("deleted_at__is_null", json!(true)),
            "SELECT * FROM units t WHERE 1=1 AND t.deleted_at IS NULL"
        );
        assert_eq!(
            where_sql("unit_number__ilike", json!("J-13")),
            "SELECT * FROM units t WHERE 1=1 AND t.unit_number::text ILIKE $1"
        );
        assert_eq!(
            where_sql("owner_id", json!("550e8400-e29b-41d4-a716-446655440000")),
            "SELECT * FROM units t WHERE 1=1 AND t.owner_id = $1"
        );
        assert_eq!(
            where_sql("type", json!("ATAS")),
            "SELECT * FROM units t WHERE 1=1 AND t.type::text = $1"
        );
        assert_eq!(where_sql("tenant_id", Value::Null), "SELECT * FROM units t WHERE 1=1");
    }

    #[test]
    fn uuid_columns_reject_malformed_ids() {
        let mut query = QueryBuilder::<Postgres>::new("SELECT 1");
        assert!(push_filter_clause(&mut query, "owner_id", &json!("not-a-uuid")).is_err());
    }
}
