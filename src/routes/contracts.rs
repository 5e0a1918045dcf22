use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::Utc;
use serde_json::{json, Map, Value};

use crate::{
    error::{AppError, AppResult},
    repository::table_service::{get_row, list_rows},
    schemas::{clamp_limit, validate_input, ContractPath, ContractsQuery, GeneratePaymentsInput},
    services::payment_schedule::{
        calculate_partial_rent, fetch_rent_changes, generate_payments_for_contract,
        is_contract_active, needs_partial_rent_confirmation, regenerate_contract_payments,
        update_future_payments, ContractTerms,
    },
    state::AppState,
};

pub fn router() -> axum::Router<AppState> {
    axum::Router::new()
        .route("/contracts", axum::routing::get(list_contracts))
        .route(
            "/contracts/{contract_id}",
            axum::routing::get(get_contract),
        )
        .route(
            "/contracts/{contract_id}/rent-changes",
            axum::routing::get(list_rent_changes),
        )
        .route(
            "/contracts/{contract_id}/partial-rent",
            axum::routing::get(partial_rent_preview),
        )
        .route(
            "/contracts/{contract_id}/payments/generate",
            axum::routing::post(generate_payments),
        )
        .route(
            "/contracts/{contract_id}/payments/update-future",
            axum::routing::post(update_future),
        )
        .route(
            "/contracts/{contract_id}/payments/regenerate",
            axum::routing::post(regenerate),
        )
}

async fn list_contracts(
    State(state): State<AppState>,
    Query(query): Query<ContractsQuery>,
) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;

    let mut filters = Map::new();
    if let Some(tenant_id) = non_empty_opt(query.tenant_id.as_deref()) {
        filters.insert("tenant_id".to_string(), Value::String(tenant_id));
    }
    if let Some(unit_id) = non_empty_opt(query.unit_id.as_deref()) {
        filters.insert("unit_id".to_string(), Value::String(unit_id));
    }

    let rows = list_rows(
        pool,
        "lease_contracts",
        Some(&filters),
        clamp_limit(query.limit),
        0,
        "start_date",
        true,
    )
    .await?;

    // The active window spans nullable end/termination dates, so it cannot be
    // expressed as exact-equality filters; apply it over the fetched page.
    let data = if query.active_only {
        let today = Utc::now().date_naive();
        rows.into_iter()
            .filter(|row| {
                ContractTerms::from_row(row)
                    .is_some_and(|contract| is_contract_active(&contract, today))
            })
            .collect::<Vec<_>>()
    } else {
        rows
    };

    Ok(Json(json!({ "data": data })))
}

async fn get_contract(
    State(state): State<AppState>,
    Path(path): Path<ContractPath>,
) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;
    let row = get_row(pool, "lease_contracts", &path.contract_id).await?;
    Ok(Json(json!({ "data": row })))
}

async fn list_rent_changes(
    State(state): State<AppState>,
    Path(path): Path<ContractPath>,
) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;
    // 404 for unknown contracts instead of an empty history.
    get_row(pool, "lease_contracts", &path.contract_id).await?;

    let mut filters = Map::new();
    filters.insert(
        "contract_id".to_string(),
        Value::String(path.contract_id.clone()),
    );
    let rows = list_rows(
        pool,
        "rent_changes",
        Some(&filters),
        1000,
        0,
        "effective_date",
        true,
    )
    .await?;
    Ok(Json(json!({ "data": rows })))
}

/// Preview for the caller that owns the confirmation dialog: whether the
/// tenancy starts mid-month, and the pro-rated first-month amount if so.
async fn partial_rent_preview(
    State(state): State<AppState>,
    Path(path): Path<ContractPath>,
) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;
    let contract = load_contract_terms(pool, &path.contract_id).await?;

    let needs_confirmation = needs_partial_rent_confirmation(contract.start_date);
    let amount = needs_confirmation
        .then(|| calculate_partial_rent(contract.total_rent, contract.start_date));

    Ok(Json(json!({
        "needs_confirmation": needs_confirmation,
        "amount": amount
    })))
}

async fn generate_payments(
    State(state): State<AppState>,
    Path(path): Path<ContractPath>,
    Json(input): Json<GeneratePaymentsInput>,
) -> AppResult<Json<Value>> {
    validate_input(&input)?;
    let pool = db_pool(&state)?;

    let contract = load_contract_terms(pool, &path.contract_id).await?;
    let rent_changes = fetch_rent_changes(pool, &contract.id).await?;
    let created = generate_payments_for_contract(
        pool,
        &contract,
        &rent_changes,
        state.config.schedule_horizon_months,
        input.partial_rent_amount,
    )
    .await?;

    Ok(Json(json!({ "created": created })))
}

async fn update_future(
    State(state): State<AppState>,
    Path(path): Path<ContractPath>,
) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;

    let contract = load_contract_terms(pool, &path.contract_id).await?;
    let rent_changes = fetch_rent_changes(pool, &contract.id).await?;
    let updated = update_future_payments(pool, &contract, &rent_changes).await?;

    Ok(Json(json!({ "updated": updated })))
}

async fn regenerate(
    State(state): State<AppState>,
    Path(path): Path<ContractPath>,
) -> AppResult<Json<Value>> {
    let pool = db_pool(&state)?;
    let created = regenerate_contract_payments(
        pool,
        &path.contract_id,
        state.config.schedule_horizon_months,
    )
    .await?;
    Ok(Json(json!({ "created": created })))
}

async fn load_contract_terms(pool: &sqlx::PgPool, contract_id: &str) -> AppResult<ContractTerms> {
    let row = get_row(pool, "lease_contracts", contract_id).await?;
    ContractTerms::from_row(&row).ok_or_else(|| {
        AppError::UnprocessableEntity(format!(
            "Contract {contract_id} is missing required schedule fields."
        ))
    })
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
