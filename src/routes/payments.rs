use axum::{
    extract::{Query, State},
    Json,
};
use serde_json::{json, Map, Value};

use crate::{
    error::{AppError, AppResult},
    repository::table_service::list_rows,
    schemas::{clamp_limit, PaymentsQuery},
    services::payment_schedule::regenerate_all_payments,
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/payments", axum::routing::get(list_payments))
        .route(
            "/payments/regenerate-all",
            axum::routing::post(regenerate_all),
        )
}

async fn list_payments(
    State(state): State<AppState>,
    Query(query): Query<PaymentsQuery>,
) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;

    let mut filters = Map::new();
    if let Some(contract_id) = non_empty_opt(query.contract_id.as_deref()) {
        filters.insert("contract_id".to_string(), Value::String(contract_id));
    }
    if let Some(tenant_id) = non_empty_opt(query.tenant_id.as_deref()) {
        filters.insert("tenant_id".to_string(), Value::String(tenant_id));
    }
    if let Some(status) = non_empty_opt(query.status.as_deref()) {
        filters.insert("status".to_string(), Value::String(status));
    }
    if let Some(payment_type) = non_empty_opt(query.payment_type.as_deref()) {
        filters.insert("payment_type".to_string(), Value::String(payment_type));
    }
    if let Some(payment_month) = non_empty_opt(query.payment_month.as_deref()) {
        filters.insert("payment_month".to_string(), Value::String(payment_month));
    }

    let rows = list_rows(
        pool,
        "payments",
        Some(&filters),
        clamp_limit(query.limit),
        0,
        "payment_month",
        true,
    )
    .await?;

    Ok(Json(json!({ "data": rows })))
}

async fn regenerate_all(State(state): State<AppState>) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;
    let result = regenerate_all_payments(pool, state.config.schedule_horizon_months).await;
    Ok(Json(json!({ "data": result })))
}

fn db_pool(state: &AppState) -> AppResult<&sqlx::PgPool> {
    state
        .db_pool
        .as_ref()
        .ok_or_else(|| AppError::Dependency("Database is not configured. Set DATABASE_URL.".to_string()))
}

fn non_empty_opt(value: Option<&str>) -> Option<String> {
    value
        .map(str::trim)
        .filter(|item| !item.is_empty())
        .map(ToOwned::to_owned)
}
