use chrono::{DateTime, FixedOffset, NaiveDate};
use serde_json::{Map, Value};
use sqlx::{postgres::PgRow, Postgres, QueryBuilder, Row};

use crate::error::AppError;

const ALLOWED_TABLES: &[&str] = &["lease_contracts", "payments", "rent_changes"];

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

    query.push(" ORDER BY t.").push(order_name);
    if ascending {
        query.push(" ASC");
    } else {
        query.push(" DESC");
    }
    query
        .push(" LIMIT ")
        .push_bind(limit.clamp(1, 5000))
        .push(" OFFSET ")
        .push_bind(offset.max(0));

    let rows = query.build().fetch_all(pool).await.map_err(map_db_error)?;
    Ok(read_rows(rows))
}

pub async fn get_row(
    pool: &sqlx::PgPool,
    table: &str,
    row_id: &str,
) -> Result<Value, AppError> {
    let table_name = validate_table(table)?;

    let mut query = QueryBuilder::<Postgres>::new("SELECT row_to_json(t) AS row FROM ");
    query.push(table_name).push(" t WHERE ");
    push_scalar_filter(
        &mut query,
        "id",
        FilterOperator::Eq,
        &infer_scalar_filter("id", &Value::String(row_id.to_string())),
    );
    query.push(" LIMIT 1");

    let row = query
        .build()
        .fetch_optional(pool)
        .await
        .map_err(map_db_error)?;

    row.and_then(|value| value.try_get::<Option<Value>, _>("row").ok().flatten())
        .ok_or_else(|| AppError::NotFound(format!("{table_name} record not found.")))
}

/// Insert a single record. The schedule generator only batch-inserts, but the
/// store boundary keeps the full primitive set for one-at-a-time callers.
#[allow(dead_code)]
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

    let keys = sorted_valid_keys(payload)?;

    // jsonb_populate_record lets PostgreSQL resolve column types (uuid, date,
    // numeric …) from the table definition.
    let mut query = QueryBuilder::<Postgres>::new("INSERT INTO ");
    query.push(table_name).push(" (");
    push_column_list(&mut query, &keys);
    query.push(") SELECT ");
    push_record_columns(&mut query, &keys);
    query
        .push(" FROM jsonb_populate_record(NULL::")
        .push(table_name)
        .push(", ");
    query.push_bind(Value::Object(payload.clone()));
    query
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

/// Insert many records in a single round trip via jsonb_populate_recordset.
/// All records must share the same key set; returns the number of rows
/// inserted. An empty batch is a no-op.
pub async fn bulk_create_rows(
    pool: &sqlx::PgPool,
    table: &str,
    records: &[Map<String, Value>],
) -> Result<u64, AppError> {
    let table_name = validate_table(table)?;
    let Some(first) = records.first() else {
        return Ok(0);
    };

    let keys = sorted_valid_keys(first)?;
    for record in records {
        if record.len() != keys.len() || !keys.iter().all(|key| record.contains_key(key)) {
            return Err(AppError::BadRequest(format!(
                "Bulk insert into {table_name} requires uniform record keys."
            )));
        }
    }

    let mut query = QueryBuilder::<Postgres>::new("INSERT INTO ");
    query.push(table_name).push(" (");
    push_column_list(&mut query, &keys);
    query.push(") SELECT ");
    push_record_columns(&mut query, &keys);
    query
        .push(" FROM jsonb_populate_recordset(NULL::")
        .push(table_name)
        .push(", ");
    query.push_bind(Value::Array(
        records
            .iter()
            .map(|record| Value::Object(record.clone()))
            .collect(),
    ));
    query.push(") r");

    let result = query.build().execute(pool).await.map_err(map_db_error)?;
    Ok(result.rows_affected())
}

pub async fn update_row(
    pool: &sqlx::PgPool,
    table: &str,
    row_id: &str,
    payload: &Map<String, Value>,
) -> Result<Value, AppError> {
    let table_name = validate_table(table)?;
    if payload.is_empty() {
        return Err(AppError::BadRequest("No fields to update.".to_string()));
    }

    let keys = sorted_valid_keys(payload)?;

    let mut query = QueryBuilder::<Postgres>::new("UPDATE ");
    query.push(table_name).push(" t SET ");
    {
        let mut separated = query.separated(", ");
        for key in &keys {
            separated.push(key.as_str());
            separated.push_unseparated(" = r.");
            separated.push_unseparated(key.as_str());
        }
    }
    query
        .push(" FROM jsonb_populate_record(NULL::")
        .push(table_name)
        .push(", ");
    query.push_bind(Value::Object(payload.clone()));
    query.push(") r WHERE ");
    push_scalar_filter(
        &mut query,
        "id",
        FilterOperator::Eq,
        &infer_scalar_filter("id", &Value::String(row_id.to_string())),
    );
    query.push(" RETURNING row_to_json(t) AS row");

    let row = query
        .build()
        .fetch_optional(pool)
        .await
        .map_err(map_db_error)?;

    row.and_then(|value| value.try_get::<Option<Value>, _>("row").ok().flatten())
        .ok_or_else(|| AppError::NotFound(format!("{table_name} record not found.")))
}

pub async fn delete_row(
    pool: &sqlx::PgPool,
    table: &str,
    row_id: &str,
) -> Result<Value, AppError> {
    let existing = get_row(pool, table, row_id).await?;
    let table_name = validate_table(table)?;

    let mut query = QueryBuilder::<Postgres>::new("DELETE FROM ");
    query.push(table_name).push(" t WHERE ");
    push_scalar_filter(
        &mut query,
        "id",
        FilterOperator::Eq,
        &infer_scalar_filter("id", &Value::String(row_id.to_string())),
    );
    query.build().execute(pool).await.map_err(map_db_error)?;

    Ok(existing)
}

fn read_rows(rows: Vec<PgRow>) -> Vec<Value> {
    rows.into_iter()
        .filter_map(|row| row.try_get::<Option<Value>, _>("row").ok().flatten())
        .collect()
}

fn sorted_valid_keys(payload: &Map<String, Value>) -> Result<Vec<String>, AppError> {
    let mut keys = payload.keys().cloned().collect::<Vec<_>>();
    keys.sort_unstable();
    for key in &keys {
        validate_identifier(key)?;
    }
    Ok(keys)
}

fn push_column_list(query: &mut QueryBuilder<Postgres>, keys: &[String]) {
    let mut separated = query.separated(", ");
    for key in keys {
        separated.push(key.as_str());
    }
}

fn push_record_columns(query: &mut QueryBuilder<Postgres>, keys: &[String]) {
    let mut separated = query.separated(", ");
    for key in keys {
        separated.push("r.");
        separated.push_unseparated(key.as_str());
    }
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
    if trimmed.is_empty() {
        return Err(AppError::BadRequest(
            "Identifier cannot be empty.".to_string(),
        ));
    }
    if !trimmed.chars().all(|character| {
        character.is_ascii_lowercase() || character.is_ascii_digit() || character == '_'
    }) {
        return Err(AppError::BadRequest(format!(
            "Invalid identifier '{trimmed}'."
        )));
    }
    if trimmed
        .chars()
        .next()
        .is_some_and(|first| first.is_ascii_digit())
    {
        return Err(AppError::BadRequest(format!(
            "Invalid identifier '{trimmed}'."
        )));
    }
    Ok(trimmed)
}

#[derive(Debug, Clone)]
enum ScalarFilter {
    Text(String),
    Uuid(uuid::Uuid),
    Bool(bool),
    I64(i64),
    F64(f64),
    Date(NaiveDate),
    Timestamp(DateTime<FixedOffset>),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum FilterOperator {
    Eq,
    Gte,
    Lte,
    IsNull,
}

fn parse_filter_key(filter_key: &str) -> Result<(&str, FilterOperator), AppError> {
    let mut column = filter_key;
    let mut operator = FilterOperator::Eq;

    if let Some((candidate_column, suffix)) = filter_key.rsplit_once("__") {
        operator = match suffix {
            "gte" => FilterOperator::Gte,
            "lte" => FilterOperator::Lte,
            "is_null" => FilterOperator::IsNull,
            "in" => FilterOperator::Eq,
            _ => FilterOperator::Eq,
        };
        if !matches!(operator, FilterOperator::Eq) || suffix == "in" {
            column = candidate_column;
        }
    }

    Ok((validate_identifier(column)?, operator))
}

fn parse_bool_filter_value(value: &Value) -> bool {
    match value {
        Value::Null => true,
        Value::Bool(flag) => *flag,
        Value::Number(number) => {
            number.as_i64().is_some_and(|parsed| parsed != 0)
                || number.as_f64().is_some_and(|parsed| parsed != 0.0)
        }
        Value::String(text) => matches!(
            text.trim().to_ascii_lowercase().as_str(),
            "true" | "t" | "1" | "yes" | "y"
        ),
        _ => false,
    }
}

fn push_filter_clause(
    query: &mut QueryBuilder<Postgres>,
    filter_key: &str,
    value: &Value,
) -> Result<(), AppError> {
    let (column, operator) = parse_filter_key(filter_key)?;

    if matches!(operator, FilterOperator::IsNull) {
        let should_be_null = parse_bool_filter_value(value);
        query.push(" AND t.").push(column);
        if should_be_null {
            query.push(" IS NULL");
        } else {
            query.push(" IS NOT NULL");
        }
        return Ok(());
    }

    match value {
        Value::Null => Ok(()),
        Value::Array(items) => {
            if !matches!(operator, FilterOperator::Eq) {
                return Err(AppError::BadRequest(format!(
                    "Filter '{filter_key}' does not support array values."
                )));
            }
            if items.is_empty() {
                return Ok(());
            }
            query.push(" AND ");
            push_array_filter(query, column, items);
            Ok(())
        }
        _ => {
            query.push(" AND ");
            let filter = infer_scalar_filter(column, value);
            push_scalar_filter(query, column, operator, &filter);
            Ok(())
        }
    }
}

fn push_scalar_filter(
    query: &mut QueryBuilder<Postgres>,
    column: &str,
    operator: FilterOperator,
    value: &ScalarFilter,
) {
    query.push("t.").push(column);
    let sql_operator = match operator {
        FilterOperator::Eq => " = ",
        FilterOperator::Gte => " >= ",
        FilterOperator::Lte => " <= ",
        // handled by push_filter_clause before scalar inference
        FilterOperator::IsNull => " = ",
    };
    match value {
        ScalarFilter::Text(text) => {
            query
                .push("::text")
                .push(sql_operator)
                .push_bind(text.clone());
        }
        ScalarFilter::Uuid(id) => {
            query.push(sql_operator).push_bind(*id);
        }
        ScalarFilter::Bool(flag) => {
            query.push(sql_operator).push_bind(*flag);
        }
        ScalarFilter::I64(number) => {
            query.push(sql_operator).push_bind(*number);
        }
        ScalarFilter::F64(number) => {
            query.push(sql_operator).push_bind(*number);
        }
        ScalarFilter::Date(date) => {
            query.push(sql_operator).push_bind(*date);
        }
        ScalarFilter::Timestamp(timestamp) => {
            query.push(sql_operator).push_bind(timestamp.to_owned());
        }
    }
}

fn push_array_filter(query: &mut QueryBuilder<Postgres>, column: &str, items: &[Value]) {
    query.push("t.").push(column);

    if is_uuid_identifier(column) {
        let parsed = items
            .iter()
            .filter_map(Value::as_str)
            .filter_map(|text| uuid::Uuid::parse_str(text.trim()).ok())
            .collect::<Vec<_>>();
        if parsed.len() == items.len() {
            query.push(" = ANY(").push_bind(parsed).push(")");
            return;
        }
    }

    let texts = items
        .iter()
        .map(|item| match item {
            Value::String(text) => text.clone(),
            other => other.to_string(),
        })
        .collect::<Vec<_>>();
    query.push("::text = ANY(").push_bind(texts).push(")");
}

fn infer_scalar_filter(filter_key: &str, value: &Value) -> ScalarFilter {
    match value {
        Value::Bool(flag) => ScalarFilter::Bool(*flag),
        Value::Number(number) => {
            if let Some(as_i64) = number.as_i64() {
                return ScalarFilter::I64(as_i64);
            }
            if let Some(as_f64) = number.as_f64() {
                return ScalarFilter::F64(as_f64);
            }
            ScalarFilter::Text(number.to_string())
        }
        Value::String(text) => {
            let trimmed = text.trim();
            if is_uuid_identifier(filter_key) {
                if let Ok(parsed) = uuid::Uuid::parse_str(trimmed) {
                    return ScalarFilter::Uuid(parsed);
                }
            }
            if is_timestamp_identifier(filter_key) {
                if let Ok(parsed) = DateTime::parse_from_rfc3339(trimmed) {
                    return ScalarFilter::Timestamp(parsed);
                }
            }
            if is_date_identifier(filter_key) {
                if let Ok(parsed) = NaiveDate::parse_from_str(trimmed, "%Y-%m-%d") {
                    return ScalarFilter::Date(parsed);
                }
            }
            ScalarFilter::Text(text.clone())
        }
        _ => ScalarFilter::Text(value.to_string()),
    }
}

fn is_uuid_identifier(identifier: &str) -> bool {
    let normalized = identifier.trim();
    normalized == "id" || normalized.ends_with("_id")
}

fn is_date_identifier(identifier: &str) -> bool {
    identifier.trim().ends_with("_date")
}

fn is_timestamp_identifier(identifier: &str) -> bool {
    identifier.trim().ends_with("_at")
}

fn map_db_error(error: sqlx::Error) -> AppError {
    let message = error.to_string();
    tracing::error!(db_error = %message, "Database query failed");

    if message.contains("23505")
        || message
            .to_ascii_lowercase()
            .contains("duplicate key value violates unique constraint")
    {
        return AppError::Conflict("Duplicate value violates a unique constraint.".to_string());
    }
    AppError::Dependency("Database operation failed.".to_string())
}

#[cfg(test)]
mod tests {
    use serde_json::{json, Map, Value};
    use sqlx::{Postgres, QueryBuilder};

    use super::{
        parse_filter_key, push_filter_clause, validate_identifier, validate_table, FilterOperator,
    };

    #[test]
    fn only_schedule_tables_are_allowed() {
        assert!(validate_table("payments").is_ok());
        assert!(validate_table("lease_contracts").is_ok());
        assert!(validate_table("rent_changes").is_ok());
        assert!(validate_table("organizations").is_err());
        assert!(validate_table("payments; DROP TABLE payments").is_err());
    }

    #[test]
    fn rejects_bad_identifiers() {
        assert!(validate_identifier("payment_month").is_ok());
        assert!(validate_identifier("").is_err());
        assert!(validate_identifier("1col").is_err());
        assert!(validate_identifier("col name").is_err());
        assert!(validate_identifier("Col").is_err());
    }

    #[test]
    fn parses_filter_suffixes() {
        assert_eq!(
            parse_filter_key("payment_month__gte").unwrap(),
            ("payment_month", FilterOperator::Gte)
        );
        assert_eq!(
            parse_filter_key("end_date__is_null").unwrap(),
            ("end_date", FilterOperator::IsNull)
        );
        assert_eq!(
            parse_filter_key("status__in").unwrap(),
            ("status", FilterOperator::Eq)
        );
        assert_eq!(
            parse_filter_key("status").unwrap(),
            ("status", FilterOperator::Eq)
        );
    }

    #[test]
    fn insert_sql_uses_jsonb_populate_record() {
        let mut payload = Map::new();
        payload.insert("contract_id".to_string(), json!("c-1"));
        payload.insert("payment_month".to_string(), json!("2026-01"));
        payload.insert("payment_type".to_string(), json!("rent"));

        let mut keys = payload.keys().cloned().collect::<Vec<_>>();
        keys.sort_unstable();

        let mut query = QueryBuilder::<Postgres>::new("INSERT INTO payments (");
        super::push_column_list(&mut query, &keys);
        query.push(") SELECT ");
        super::push_record_columns(&mut query, &keys);
        query.push(" FROM jsonb_populate_record(NULL::payments, ");
        query.push_bind(Value::Object(payload));
        query.push(") r");

        let sql = query.sql();
        assert!(
            sql.contains("jsonb_populate_record(NULL::payments"),
            "Expected jsonb_populate_record in SQL but got: {sql}"
        );
        assert!(
            sql.contains("SELECT r.contract_id, r.payment_month, r.payment_type"),
            "Expected r.col references in SQL but got: {sql}"
        );
    }

    #[test]
    fn bulk_insert_sql_uses_recordset() {
        let mut record = Map::new();
        record.insert("contract_id".to_string(), json!("c-1"));
        record.insert("payment_month".to_string(), json!("2026-01"));

        let keys = vec!["contract_id".to_string(), "payment_month".to_string()];

        let mut query = QueryBuilder::<Postgres>::new("INSERT INTO payments (");
        super::push_column_list(&mut query, &keys);
        query.push(") SELECT ");
        super::push_record_columns(&mut query, &keys);
        query.push(" FROM jsonb_populate_recordset(NULL::payments, ");
        query.push_bind(Value::Array(vec![Value::Object(record)]));
        query.push(") r");

        let sql = query.sql();
        assert!(
            sql.contains("jsonb_populate_recordset(NULL::payments"),
            "Expected jsonb_populate_recordset in SQL but got: {sql}"
        );
    }

    #[test]
    fn null_filter_values_are_ignored() {
        let mut query = QueryBuilder::<Postgres>::new("SELECT 1 WHERE 1=1");
        push_filter_clause(&mut query, "status", &Value::Null).unwrap();
        assert_eq!(query.sql(), "SELECT 1 WHERE 1=1");
    }

    #[test]
    fn is_null_filter_renders_without_bind() {
        let mut query = QueryBuilder::<Postgres>::new("SELECT 1 WHERE 1=1");
        push_filter_clause(&mut query, "end_date__is_null", &Value::Bool(true)).unwrap();
        assert!(query.sql().contains("t.end_date IS NULL"));

        let mut query = QueryBuilder::<Postgres>::new("SELECT 1 WHERE 1=1");
        push_filter_clause(&mut query, "end_date__is_null", &Value::Bool(false)).unwrap();
        assert!(query.sql().contains("t.end_date IS NOT NULL"));
    }
}
