use std::collections::HashSet;

use chrono::{Datelike, Months, NaiveDate, Utc};
use serde_json::{Map, Value};
use sqlx::PgPool;
use tracing::{info, warn};

use crate::error::{AppError, AppResult};
use crate::repository::table_service::{
    bulk_create_rows, delete_row, get_row, list_rows, update_row,
};

pub const STATUS_PENDING: &str = "pending";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum PaymentKind {
    Rent,
    Deposit,
}

impl PaymentKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Rent => "rent",
            Self::Deposit => "deposit",
        }
    }
}

/// Lease contract terms as read from the `lease_contracts` table.
#[derive(Debug, Clone)]
pub struct ContractTerms {
    pub id: String,
    pub tenant_id: String,
    pub unit_id: String,
    pub start_date: NaiveDate,
    pub end_date: Option<NaiveDate>,
    pub termination_date: Option<NaiveDate>,
    pub base_rent: f64,
    pub utilities: f64,
    pub heating: f64,
    pub total_rent: f64,
    pub deposit: f64,
    pub deposit_installments: u32,
    pub rent_due_day: Option<u32>,
    pub contract_date: Option<NaiveDate>,
}

impl ContractTerms {
    pub fn from_row(row: &Value) -> Option<Self> {
        let id = val_str(row, "id");
        let start_date = parse_date(&val_str(row, "start_date"))?;
        if id.is_empty() {
            return None;
        }

        let base_rent = val_f64(row, "base_rent");
        let utilities = val_f64(row, "utilities");
        let heating = val_f64(row, "heating");
        let total_rent = row
            .as_object()
            .and_then(|obj| obj.get("total_rent"))
            .and_then(as_f64_lenient)
            .unwrap_or(base_rent + utilities + heating);

        Some(Self {
            id,
            tenant_id: val_str(row, "tenant_id"),
            unit_id: val_str(row, "unit_id"),
            start_date,
            end_date: parse_date(&val_str(row, "end_date")),
            termination_date: parse_date(&val_str(row, "termination_date")),
            base_rent,
            utilities,
            heating,
            total_rent,
            deposit: val_f64(row, "deposit"),
            deposit_installments: val_u32(row, "deposit_installments").max(1),
            rent_due_day: val_u32_opt(row, "rent_due_day").filter(|day| (1..=31).contains(day)),
            contract_date: parse_date(&val_str(row, "contract_date")),
        })
    }

    fn monthly_charges(&self) -> RentCharges {
        RentCharges {
            base_rent: self.base_rent,
            utilities: self.utilities,
            heating: self.heating,
        }
    }
}

/// One row of a contract's rent-change history.
#[derive(Debug, Clone)]
pub struct RentChangeEntry {
    pub effective_date: NaiveDate,
    pub base_rent: f64,
    pub utilities: f64,
    pub heating: f64,
}

impl RentChangeEntry {
    pub fn from_row(row: &Value) -> Option<Self> {
        Some(Self {
            effective_date: parse_date(&val_str(row, "effective_date"))?,
            base_rent: val_f64(row, "base_rent"),
            utilities: val_f64(row, "utilities"),
            heating: val_f64(row, "heating"),
        })
    }

    fn charges(&self) -> RentCharges {
        RentCharges {
            base_rent: self.base_rent,
            utilities: self.utilities,
            heating: self.heating,
        }
    }
}

#[derive(Debug, Clone, Copy)]
struct RentCharges {
    base_rent: f64,
    utilities: f64,
    heating: f64,
}

impl RentCharges {
    fn total(self) -> f64 {
        self.base_rent + self.utilities + self.heating
    }
}

/// A payment row planned for insertion but not yet persisted.
#[derive(Debug, Clone, PartialEq)]
pub struct StagedPayment {
    pub payment_month: String,
    pub payment_date: NaiveDate,
    pub expected_amount: f64,
    pub kind: PaymentKind,
    pub reference: String,
}

impl StagedPayment {
    fn into_record(self, contract: &ContractTerms) -> Map<String, Value> {
        let mut record = Map::new();
        record.insert(
            "contract_id".to_string(),
            Value::String(contract.id.clone()),
        );
        record.insert(
            "tenant_id".to_string(),
            Value::String(contract.tenant_id.clone()),
        );
        record.insert(
            "unit_id".to_string(),
            Value::String(contract.unit_id.clone()),
        );
        record.insert(
            "payment_month".to_string(),
            Value::String(self.payment_month),
        );
        record.insert(
            "payment_date".to_string(),
            Value::String(self.payment_date.to_string()),
        );
        record.insert("expected_amount".to_string(), number(self.expected_amount));
        record.insert("amount".to_string(), number(0.0));
        record.insert(
            "payment_type".to_string(),
            Value::String(self.kind.as_str().to_string()),
        );
        record.insert(
            "status".to_string(),
            Value::String(STATUS_PENDING.to_string()),
        );
        record.insert("reference".to_string(), Value::String(self.reference));
        record
    }
}

/// A pending rent row as read back from the `payments` table.
#[derive(Debug, Clone)]
pub struct PendingPayment {
    pub id: String,
    pub payment_month: String,
    pub payment_date: String,
    pub expected_amount: f64,
}

impl PendingPayment {
    pub fn from_row(row: &Value) -> Option<Self> {
        let id = val_str(row, "id");
        let payment_month = val_str(row, "payment_month");
        if id.is_empty() || payment_month.is_empty() {
            return None;
        }
        Some(Self {
            id,
            payment_month,
            payment_date: val_str(row, "payment_date"),
            expected_amount: val_f64(row, "expected_amount"),
        })
    }
}

/// Field updates for an existing pending rent row.
#[derive(Debug, Clone, PartialEq)]
pub struct PaymentPatch {
    pub id: String,
    pub expected_amount: Option<f64>,
    pub payment_date: Option<String>,
}

/// Aggregate outcome of a batch schedule run.
#[derive(Debug, Clone, Default, serde::Serialize)]
pub struct ScheduleSyncResult {
    pub contracts_processed: u32,
    pub payments_created: u32,
    pub payments_updated: u32,
    pub errors: u32,
}

/// Pro-rated rent for a tenancy starting mid-month: the daily rate times the
/// days remaining in the start month, first day inclusive.
pub fn calculate_partial_rent(total_rent: f64, start_date: NaiveDate) -> f64 {
    let days = days_in_month(start_date.year(), start_date.month()) as f64;
    let remaining = days - start_date.day() as f64 + 1.0;
    total_rent / days * remaining
}

/// True when the tenancy starts after the 1st, i.e. the first month is not a
/// full month and the caller should confirm a pro-rated amount.
pub fn needs_partial_rent_confirmation(start_date: NaiveDate) -> bool {
    start_date.day() > 1
}

/// A contract is active while its tenancy window and termination date (if any)
/// include today.
pub fn is_contract_active(contract: &ContractTerms, today: NaiveDate) -> bool {
    if contract.start_date > today {
        return false;
    }
    if contract.end_date.is_some_and(|end| end < today) {
        return false;
    }
    if contract
        .termination_date
        .is_some_and(|terminated| terminated < today)
    {
        return false;
    }
    true
}

/// Plan the full payment schedule for a contract.
///
/// Walks month-by-month from the first of the start month through the end
/// date (or `today + horizon_months` for open-ended contracts), inclusive of
/// the final month even when the end date falls mid-month. Rows whose
/// `(payment_month, payment_type)` already exists are skipped, which also
/// makes repeated generation runs no-ops.
pub fn build_payment_schedule(
    contract: &ContractTerms,
    rent_changes: &[RentChangeEntry],
    existing: &HashSet<(String, PaymentKind)>,
    today: NaiveDate,
    horizon_months: u32,
    first_month_override: Option<f64>,
) -> Vec<StagedPayment> {
    let mut changes = rent_changes.to_vec();
    changes.sort_by(|a, b| b.effective_date.cmp(&a.effective_date));

    let schedule_end = contract.end_date.unwrap_or_else(|| {
        today
            .checked_add_months(Months::new(horizon_months))
            .unwrap_or(today)
    });

    fn stage(
        staged: &mut Vec<StagedPayment>,
        seen: &mut HashSet<(String, PaymentKind)>,
        payment: StagedPayment,
    ) {
        let key = (payment.payment_month.clone(), payment.kind);
        if seen.insert(key) {
            staged.push(payment);
        }
    }

    let mut staged = Vec::new();
    let mut seen = existing.clone();

    let first_month = month_index(contract.start_date.year(), contract.start_date.month());
    let last_month = month_index(schedule_end.year(), schedule_end.month());

    let mut current = first_month;
    while current <= last_month {
        let (year, month) = month_from_index(current);
        let charges = applicable_charges(contract, &changes, year, month);
        let mut expected = charges.total();
        if current == first_month {
            if let Some(override_amount) = first_month_override {
                expected = override_amount;
            }
        }

        let month_label = month_key(year, month);
        stage(
            &mut staged,
            &mut seen,
            StagedPayment {
                payment_date: rent_due_date(year, month, contract.rent_due_day),
                expected_amount: round_cents(expected),
                kind: PaymentKind::Rent,
                reference: format!("Miete {month_label}"),
                payment_month: month_label,
            },
        );

        current += 1;
    }

    if contract.deposit > 0.0 {
        let installments = contract.deposit_installments.max(1);
        let per_installment = round_cents(contract.deposit / installments as f64);
        let anchor = contract.contract_date.unwrap_or(contract.start_date);

        for index in 0..installments {
            let due = if index == 0 {
                anchor
            } else {
                let (year, month) =
                    month_from_index(month_index(anchor.year(), anchor.month()) + index as i32);
                let day = contract.rent_due_day.unwrap_or(anchor.day());
                clamped_date(year, month, day)
            };

            stage(
                &mut staged,
                &mut seen,
                StagedPayment {
                    payment_month: month_key(due.year(), due.month()),
                    payment_date: due,
                    expected_amount: per_installment,
                    kind: PaymentKind::Deposit,
                    reference: format!("Kaution {}/{installments}", index + 1),
                },
            );
        }
    }

    staged
}

/// Plan amount/due-date corrections for pending rent rows whose month is the
/// current month or later. Past months are left untouched even when the
/// applicable rent has since changed.
pub fn plan_future_updates(
    contract: &ContractTerms,
    rent_changes: &[RentChangeEntry],
    pending: &[PendingPayment],
    today: NaiveDate,
) -> Vec<PaymentPatch> {
    let mut changes = rent_changes.to_vec();
    changes.sort_by(|a, b| b.effective_date.cmp(&a.effective_date));

    let current_month = month_key(today.year(), today.month());
    let mut patches = Vec::new();

    for payment in pending {
        if payment.payment_month < current_month {
            continue;
        }
        let Some((year, month)) = parse_month_key(&payment.payment_month) else {
            continue;
        };

        let expected = round_cents(applicable_charges(contract, &changes, year, month).total());
        let due = rent_due_date(year, month, contract.rent_due_day).to_string();

        let amount_changed = (expected - payment.expected_amount).abs() > 0.005;
        let date_changed = due != payment.payment_date;
        if amount_changed || date_changed {
            patches.push(PaymentPatch {
                id: payment.id.clone(),
                expected_amount: amount_changed.then_some(expected),
                payment_date: date_changed.then_some(due),
            });
        }
    }

    patches
}

/// Create the missing payment rows for one contract. Existing
/// `(payment_month, payment_type)` pairs are snapshotted in a single query
/// beforehand; a concurrent duplicate insert surfaces as `Conflict` from the
/// store's unique index rather than as a silent double row.
pub async fn generate_payments_for_contract(
    pool: &PgPool,
    contract: &ContractTerms,
    rent_changes: &[RentChangeEntry],
    horizon_months: u32,
    first_month_override: Option<f64>,
) -> AppResult<u32> {
    let existing = existing_payment_keys(pool, &contract.id).await?;
    let staged = build_payment_schedule(
        contract,
        rent_changes,
        &existing,
        Utc::now().date_naive(),
        horizon_months,
        first_month_override,
    );

    if staged.is_empty() {
        return Ok(0);
    }

    let records = staged
        .into_iter()
        .map(|payment| payment.into_record(contract))
        .collect::<Vec<_>>();
    let created = bulk_create_rows(pool, "payments", &records).await?;

    info!(
        contract_id = %contract.id,
        created,
        "Payment schedule generated"
    );
    Ok(created as u32)
}

/// Re-align future pending rent rows with the current rent-change history.
pub async fn update_future_payments(
    pool: &PgPool,
    contract: &ContractTerms,
    rent_changes: &[RentChangeEntry],
) -> AppResult<u32> {
    let mut filters = Map::new();
    filters.insert(
        "contract_id".to_string(),
        Value::String(contract.id.clone()),
    );
    filters.insert(
        "status".to_string(),
        Value::String(STATUS_PENDING.to_string()),
    );
    filters.insert(
        "payment_type".to_string(),
        Value::String(PaymentKind::Rent.as_str().to_string()),
    );

    let rows = list_rows(pool, "payments", Some(&filters), 5000, 0, "payment_month", true).await?;
    let pending = rows
        .iter()
        .filter_map(PendingPayment::from_row)
        .collect::<Vec<_>>();

    let patches = plan_future_updates(contract, rent_changes, &pending, Utc::now().date_naive());
    let mut updated = 0u32;

    for patch in patches {
        let mut payload = Map::new();
        if let Some(amount) = patch.expected_amount {
            payload.insert("expected_amount".to_string(), number(amount));
        }
        if let Some(date) = patch.payment_date {
            payload.insert("payment_date".to_string(), Value::String(date));
        }
        update_row(pool, "payments", &patch.id, &payload).await?;
        updated += 1;
    }

    if updated > 0 {
        info!(contract_id = %contract.id, updated, "Future payments re-aligned");
    }
    Ok(updated)
}

/// Drop all pending payments of a contract and rebuild the schedule from
/// scratch. Paid and otherwise settled rows are never touched. A missing
/// contract is an error, like every other failure here.
pub async fn regenerate_contract_payments(
    pool: &PgPool,
    contract_id: &str,
    horizon_months: u32,
) -> AppResult<u32> {
    let row = get_row(pool, "lease_contracts", contract_id).await?;
    let contract = ContractTerms::from_row(&row).ok_or_else(|| {
        AppError::UnprocessableEntity(format!(
            "Contract {contract_id} is missing required schedule fields."
        ))
    })?;

    let rent_changes = fetch_rent_changes(pool, contract_id).await?;

    let mut filters = Map::new();
    filters.insert(
        "contract_id".to_string(),
        Value::String(contract_id.to_string()),
    );
    filters.insert(
        "status".to_string(),
        Value::String(STATUS_PENDING.to_string()),
    );
    let pending = list_rows(pool, "payments", Some(&filters), 5000, 0, "payment_month", true).await?;

    for row in &pending {
        let payment_id = val_str(row, "id");
        if payment_id.is_empty() {
            continue;
        }
        delete_row(pool, "payments", &payment_id).await?;
    }

    generate_payments_for_contract(pool, &contract, &rent_changes, horizon_months, None).await
}

/// Regenerate schedules for every active contract. Per-contract failures are
/// logged and counted; they never abort the rest of the batch.
pub async fn regenerate_all_payments(pool: &PgPool, horizon_months: u32) -> ScheduleSyncResult {
    let mut result = ScheduleSyncResult::default();

    let contracts =
        match list_rows(pool, "lease_contracts", None, 2000, 0, "start_date", true).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Failed to fetch contracts for regeneration: {e}");
                result.errors += 1;
                return result;
            }
        };

    let today = Utc::now().date_naive();

    for row in &contracts {
        let Some(contract) = ContractTerms::from_row(row) else {
            warn!(contract_id = %val_str(row, "id"), "Skipping contract with unusable terms");
            continue;
        };
        if !is_contract_active(&contract, today) {
            continue;
        }

        match regenerate_contract_payments(pool, &contract.id, horizon_months).await {
            Ok(created) => {
                result.contracts_processed += 1;
                result.payments_created += created;
            }
            Err(e) => {
                warn!(contract_id = %contract.id, error = %e, "Contract regeneration failed");
                result.errors += 1;
            }
        }
    }

    info!(
        contracts = result.contracts_processed,
        created = result.payments_created,
        errors = result.errors,
        "Full payment regeneration completed"
    );
    result
}

/// Nightly top-up: extend every active contract's rolling schedule and
/// re-align future pending amounts, without deleting anything.
pub async fn sync_contract_schedules(pool: &PgPool, horizon_months: u32) -> ScheduleSyncResult {
    let mut result = ScheduleSyncResult::default();

    let contracts =
        match list_rows(pool, "lease_contracts", None, 2000, 0, "start_date", true).await {
            Ok(rows) => rows,
            Err(e) => {
                warn!("Failed to fetch contracts for schedule sync: {e}");
                result.errors += 1;
                return result;
            }
        };

    let today = Utc::now().date_naive();

    for row in &contracts {
        let Some(contract) = ContractTerms::from_row(row) else {
            continue;
        };
        if !is_contract_active(&contract, today) {
            continue;
        }

        let rent_changes = match fetch_rent_changes(pool, &contract.id).await {
            Ok(changes) => changes,
            Err(e) => {
                warn!(contract_id = %contract.id, error = %e, "Rent change fetch failed");
                result.errors += 1;
                continue;
            }
        };

        match generate_payments_for_contract(pool, &contract, &rent_changes, horizon_months, None)
            .await
        {
            Ok(created) => result.payments_created += created,
            Err(e) => {
                warn!(contract_id = %contract.id, error = %e, "Schedule top-up failed");
                result.errors += 1;
                continue;
            }
        }

        match update_future_payments(pool, &contract, &rent_changes).await {
            Ok(updated) => result.payments_updated += updated,
            Err(e) => {
                warn!(contract_id = %contract.id, error = %e, "Future payment refresh failed");
                result.errors += 1;
                continue;
            }
        }

        result.contracts_processed += 1;
    }

    result
}

pub async fn fetch_rent_changes(
    pool: &PgPool,
    contract_id: &str,
) -> AppResult<Vec<RentChangeEntry>> {
    let mut filters = Map::new();
    filters.insert(
        "contract_id".to_string(),
        Value::String(contract_id.to_string()),
    );
    let rows = list_rows(
        pool,
        "rent_changes",
        Some(&filters),
        1000,
        0,
        "effective_date",
        false,
    )
    .await?;

    Ok(rows.iter().filter_map(RentChangeEntry::from_row).collect())
}

async fn existing_payment_keys(
    pool: &PgPool,
    contract_id: &str,
) -> AppResult<HashSet<(String, PaymentKind)>> {
    let mut filters = Map::new();
    filters.insert(
        "contract_id".to_string(),
        Value::String(contract_id.to_string()),
    );
    let rows = list_rows(pool, "payments", Some(&filters), 5000, 0, "payment_month", true).await?;

    let mut keys = HashSet::new();
    for row in &rows {
        let month = val_str(row, "payment_month");
        if month.is_empty() {
            continue;
        }
        let kind = match val_str(row, "payment_type").as_str() {
            "rent" => PaymentKind::Rent,
            "deposit" => PaymentKind::Deposit,
            _ => continue,
        };
        keys.insert((month, kind));
    }
    Ok(keys)
}

/// The most recent rent change effective on or before the given month, else
/// the contract's own charges. Changes must be sorted by effective date
/// descending.
fn applicable_charges(
    contract: &ContractTerms,
    changes_desc: &[RentChangeEntry],
    year: i32,
    month: u32,
) -> RentCharges {
    let target = month_index(year, month);
    for change in changes_desc {
        if month_index(change.effective_date.year(), change.effective_date.month()) <= target {
            return change.charges();
        }
    }
    contract.monthly_charges()
}

fn rent_due_date(year: i32, month: u32, rent_due_day: Option<u32>) -> NaiveDate {
    clamped_date(year, month, rent_due_day.unwrap_or(1))
}

/// Day-of-month clamped to the month's length, so day 31 lands on the last
/// day of shorter months.
fn clamped_date(year: i32, month: u32, day: u32) -> NaiveDate {
    let day = day.clamp(1, days_in_month(year, month));
    // Unreachable fallback: day is clamped into the valid range above.
    NaiveDate::from_ymd_opt(year, month, day)
        .unwrap_or_else(|| NaiveDate::from_ymd_opt(year, month, 1).unwrap_or_default())
}

fn days_in_month(year: i32, month: u32) -> u32 {
    let (next_year, next_month) = if month == 12 {
        (year + 1, 1)
    } else {
        (year, month + 1)
    };
    NaiveDate::from_ymd_opt(next_year, next_month, 1)
        .and_then(|first| first.pred_opt())
        .map(|last| last.day())
        .unwrap_or(31)
}

fn month_index(year: i32, month: u32) -> i32 {
    year * 12 + month as i32 - 1
}

fn month_from_index(index: i32) -> (i32, u32) {
    (index.div_euclid(12), (index.rem_euclid(12) + 1) as u32)
}

fn month_key(year: i32, month: u32) -> String {
    format!("{year:04}-{month:02}")
}

fn parse_month_key(key: &str) -> Option<(i32, u32)> {
    let (year, month) = key.split_once('-')?;
    let year = year.parse::<i32>().ok()?;
    let month = month.parse::<u32>().ok()?;
    (1..=12).contains(&month).then_some((year, month))
}

fn parse_date(raw: &str) -> Option<NaiveDate> {
    NaiveDate::parse_from_str(raw, "%Y-%m-%d").ok()
}

fn round_cents(amount: f64) -> f64 {
    (amount * 100.0).round() / 100.0
}

fn number(value: f64) -> Value {
    Value::Number(
        serde_json::Number::from_f64(value).unwrap_or_else(|| serde_json::Number::from(0)),
    )
}

fn val_str(row: &Value, key: &str) -> String {
    row.as_object()
        .and_then(|obj| obj.get(key))
        .and_then(Value::as_str)
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(ToOwned::to_owned)
        .unwrap_or_default()
}

fn as_f64_lenient(value: &Value) -> Option<f64> {
    value
        .as_f64()
        .or_else(|| value.as_str().and_then(|s| s.trim().parse::<f64>().ok()))
}

fn val_f64(row: &Value, key: &str) -> f64 {
    row.as_object()
        .and_then(|obj| obj.get(key))
        .and_then(as_f64_lenient)
        .unwrap_or(0.0)
}

fn val_u32_opt(row: &Value, key: &str) -> Option<u32> {
    row.as_object()
        .and_then(|obj| obj.get(key))
        .and_then(|value| {
            value
                .as_i64()
                .or_else(|| value.as_str().and_then(|s| s.trim().parse::<i64>().ok()))
        })
        .and_then(|parsed| u32::try_from(parsed).ok())
}

fn val_u32(row: &Value, key: &str) -> u32 {
    val_u32_opt(row, key).unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;

    use chrono::NaiveDate;

    use super::{
        build_payment_schedule, calculate_partial_rent, is_contract_active,
        needs_partial_rent_confirmation, plan_future_updates, ContractTerms, PaymentKind,
        PendingPayment, RentChangeEntry,
    };

    fn date(year: i32, month: u32, day: u32) -> NaiveDate {
        NaiveDate::from_ymd_opt(year, month, day).unwrap()
    }

    fn contract() -> ContractTerms {
        ContractTerms {
            id: "c-1".to_string(),
            tenant_id: "t-1".to_string(),
            unit_id: "u-1".to_string(),
            start_date: date(2024, 1, 1),
            end_date: Some(date(2024, 12, 31)),
            termination_date: None,
            base_rent: 800.0,
            utilities: 150.0,
            heating: 50.0,
            total_rent: 1000.0,
            deposit: 0.0,
            deposit_installments: 1,
            rent_due_day: None,
            contract_date: None,
        }
    }

    fn rent_rows(staged: &[super::StagedPayment]) -> Vec<&super::StagedPayment> {
        staged
            .iter()
            .filter(|p| p.kind == PaymentKind::Rent)
            .collect()
    }

    #[test]
    fn partial_rent_is_pro_rated_by_day() {
        // 29-day February, start on the 15th: 15 chargeable days remain.
        let amount = calculate_partial_rent(900.0, date(2024, 2, 15));
        assert!((amount - 900.0 / 29.0 * 15.0).abs() < 1e-9);
        assert!((amount - 465.52).abs() < 0.01);
    }

    #[test]
    fn partial_rent_confirmation_only_for_mid_month_starts() {
        assert!(!needs_partial_rent_confirmation(date(2024, 3, 1)));
        assert!(needs_partial_rent_confirmation(date(2024, 3, 2)));
        assert!(needs_partial_rent_confirmation(date(2024, 3, 31)));
    }

    #[test]
    fn schedules_one_rent_row_per_month_inclusive() {
        let staged = build_payment_schedule(
            &contract(),
            &[],
            &HashSet::new(),
            date(2024, 6, 1),
            24,
            None,
        );
        let rents = rent_rows(&staged);
        assert_eq!(rents.len(), 12);
        assert_eq!(rents[0].payment_month, "2024-01");
        assert_eq!(rents[11].payment_month, "2024-12");
        assert!(rents.iter().all(|p| (p.expected_amount - 1000.0).abs() < 0.005));
        assert!(rents.iter().all(|p| p.reference == format!("Miete {}", p.payment_month)));
    }

    #[test]
    fn final_month_is_included_when_end_date_is_mid_month() {
        let mut terms = contract();
        terms.end_date = Some(date(2024, 6, 15));
        let staged =
            build_payment_schedule(&terms, &[], &HashSet::new(), date(2024, 3, 1), 24, None);
        let rents = rent_rows(&staged);
        assert_eq!(rents.last().unwrap().payment_month, "2024-06");
    }

    #[test]
    fn open_ended_contract_uses_rolling_horizon() {
        let mut terms = contract();
        terms.end_date = None;
        let staged =
            build_payment_schedule(&terms, &[], &HashSet::new(), date(2024, 3, 10), 24, None);
        let rents = rent_rows(&staged);
        // 2024-01 through 2026-03.
        assert_eq!(rents.last().unwrap().payment_month, "2026-03");
        assert_eq!(rents.len(), 27);
    }

    #[test]
    fn rent_change_applies_from_its_month_onward() {
        let changes = vec![RentChangeEntry {
            effective_date: date(2024, 6, 1),
            base_rent: 850.0,
            utilities: 150.0,
            heating: 50.0,
        }];
        let staged = build_payment_schedule(
            &contract(),
            &changes,
            &HashSet::new(),
            date(2024, 1, 1),
            24,
            None,
        );
        let rents = rent_rows(&staged);
        let may = rents.iter().find(|p| p.payment_month == "2024-05").unwrap();
        let june = rents.iter().find(|p| p.payment_month == "2024-06").unwrap();
        let july = rents.iter().find(|p| p.payment_month == "2024-07").unwrap();
        assert!((may.expected_amount - 1000.0).abs() < 0.005);
        assert!((june.expected_amount - 1050.0).abs() < 0.005);
        assert!((july.expected_amount - 1050.0).abs() < 0.005);
    }

    #[test]
    fn mid_month_rent_change_still_covers_its_own_month() {
        let changes = vec![RentChangeEntry {
            effective_date: date(2024, 6, 20),
            base_rent: 900.0,
            utilities: 150.0,
            heating: 50.0,
        }];
        let staged = build_payment_schedule(
            &contract(),
            &changes,
            &HashSet::new(),
            date(2024, 1, 1),
            24,
            None,
        );
        let june = rent_rows(&staged)
            .into_iter()
            .find(|p| p.payment_month == "2024-06")
            .unwrap()
            .clone();
        assert!((june.expected_amount - 1100.0).abs() < 0.005);
    }

    #[test]
    fn most_recent_applicable_change_wins() {
        let changes = vec![
            RentChangeEntry {
                effective_date: date(2024, 3, 1),
                base_rent: 820.0,
                utilities: 150.0,
                heating: 50.0,
            },
            RentChangeEntry {
                effective_date: date(2024, 8, 1),
                base_rent: 870.0,
                utilities: 160.0,
                heating: 50.0,
            },
        ];
        let staged = build_payment_schedule(
            &contract(),
            &changes,
            &HashSet::new(),
            date(2024, 1, 1),
            24,
            None,
        );
        let rents = rent_rows(&staged);
        let april = rents.iter().find(|p| p.payment_month == "2024-04").unwrap();
        let october = rents.iter().find(|p| p.payment_month == "2024-10").unwrap();
        assert!((april.expected_amount - 1020.0).abs() < 0.005);
        assert!((october.expected_amount - 1080.0).abs() < 0.005);
    }

    #[test]
    fn due_day_is_clamped_to_month_length() {
        let mut terms = contract();
        terms.rent_due_day = Some(31);
        let staged =
            build_payment_schedule(&terms, &[], &HashSet::new(), date(2024, 1, 1), 24, None);
        let rents = rent_rows(&staged);
        let february = rents.iter().find(|p| p.payment_month == "2024-02").unwrap();
        let april = rents.iter().find(|p| p.payment_month == "2024-04").unwrap();
        let may = rents.iter().find(|p| p.payment_month == "2024-05").unwrap();
        assert_eq!(february.payment_date, date(2024, 2, 29));
        assert_eq!(april.payment_date, date(2024, 4, 30));
        assert_eq!(may.payment_date, date(2024, 5, 31));
    }

    #[test]
    fn due_date_defaults_to_first_of_month() {
        let staged = build_payment_schedule(
            &contract(),
            &[],
            &HashSet::new(),
            date(2024, 1, 1),
            24,
            None,
        );
        assert_eq!(rent_rows(&staged)[0].payment_date, date(2024, 1, 1));
    }

    #[test]
    fn existing_rows_are_skipped_making_generation_idempotent() {
        let terms = contract();
        let first = build_payment_schedule(&terms, &[], &HashSet::new(), date(2024, 1, 1), 24, None);
        let existing = first
            .iter()
            .map(|p| (p.payment_month.clone(), p.kind))
            .collect::<HashSet<_>>();
        let second = build_payment_schedule(&terms, &[], &existing, date(2024, 1, 1), 24, None);
        assert!(second.is_empty());
    }

    #[test]
    fn partially_existing_schedule_is_topped_up() {
        let terms = contract();
        let mut existing = HashSet::new();
        existing.insert(("2024-01".to_string(), PaymentKind::Rent));
        existing.insert(("2024-02".to_string(), PaymentKind::Rent));
        let staged = build_payment_schedule(&terms, &[], &existing, date(2024, 1, 1), 24, None);
        let rents = rent_rows(&staged);
        assert_eq!(rents.len(), 10);
        assert_eq!(rents[0].payment_month, "2024-03");
    }

    #[test]
    fn deposit_splits_into_equal_installments() {
        let mut terms = contract();
        terms.deposit = 3000.0;
        terms.deposit_installments = 3;
        terms.contract_date = Some(date(2023, 12, 15));
        terms.rent_due_day = Some(5);

        let staged =
            build_payment_schedule(&terms, &[], &HashSet::new(), date(2024, 1, 1), 24, None);
        let deposits = staged
            .iter()
            .filter(|p| p.kind == PaymentKind::Deposit)
            .collect::<Vec<_>>();

        assert_eq!(deposits.len(), 3);
        assert!(deposits.iter().all(|p| (p.expected_amount - 1000.0).abs() < 0.005));
        // First installment keeps the contract date; later ones move to the
        // rent due day of the following months.
        assert_eq!(deposits[0].payment_date, date(2023, 12, 15));
        assert_eq!(deposits[1].payment_date, date(2024, 1, 5));
        assert_eq!(deposits[2].payment_date, date(2024, 2, 5));
        assert_eq!(deposits[0].reference, "Kaution 1/3");
        assert_eq!(deposits[2].reference, "Kaution 3/3");
    }

    #[test]
    fn deposit_anchor_falls_back_to_start_date() {
        let mut terms = contract();
        terms.deposit = 1200.0;
        let staged =
            build_payment_schedule(&terms, &[], &HashSet::new(), date(2024, 1, 1), 24, None);
        let deposit = staged
            .iter()
            .find(|p| p.kind == PaymentKind::Deposit)
            .unwrap();
        assert_eq!(deposit.payment_date, terms.start_date);
        assert!((deposit.expected_amount - 1200.0).abs() < 0.005);
        assert_eq!(deposit.reference, "Kaution 1/1");
    }

    #[test]
    fn first_month_override_replaces_first_rent_amount_only() {
        let mut terms = contract();
        terms.start_date = date(2024, 2, 15);
        let staged = build_payment_schedule(
            &terms,
            &[],
            &HashSet::new(),
            date(2024, 2, 15),
            24,
            Some(465.52),
        );
        let rents = rent_rows(&staged);
        assert_eq!(rents[0].payment_month, "2024-02");
        assert!((rents[0].expected_amount - 465.52).abs() < 0.005);
        assert!((rents[1].expected_amount - 1000.0).abs() < 0.005);
    }

    #[test]
    fn contract_activity_window() {
        let today = date(2024, 6, 1);
        let mut terms = contract();
        assert!(is_contract_active(&terms, today));

        terms.termination_date = Some(date(2024, 5, 31));
        assert!(!is_contract_active(&terms, today));

        terms.termination_date = Some(date(2024, 6, 1));
        assert!(is_contract_active(&terms, today));

        terms.termination_date = None;
        terms.end_date = Some(date(2024, 5, 1));
        assert!(!is_contract_active(&terms, today));

        terms.end_date = None;
        terms.start_date = date(2024, 7, 1);
        assert!(!is_contract_active(&terms, today));
    }

    #[test]
    fn future_updates_skip_past_months() {
        let changes = vec![RentChangeEntry {
            effective_date: date(2024, 1, 1),
            base_rent: 900.0,
            utilities: 150.0,
            heating: 50.0,
        }];
        let pending = vec![
            PendingPayment {
                id: "p-past".to_string(),
                payment_month: "2024-03".to_string(),
                payment_date: "2024-03-01".to_string(),
                expected_amount: 1000.0,
            },
            PendingPayment {
                id: "p-future".to_string(),
                payment_month: "2024-08".to_string(),
                payment_date: "2024-08-01".to_string(),
                expected_amount: 1000.0,
            },
        ];

        let patches = plan_future_updates(&contract(), &changes, &pending, date(2024, 6, 10));
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].id, "p-future");
        assert_eq!(patches[0].expected_amount, Some(1100.0));
        assert_eq!(patches[0].payment_date, None);
    }

    #[test]
    fn current_month_still_counts_as_future() {
        let changes = vec![RentChangeEntry {
            effective_date: date(2024, 6, 1),
            base_rent: 850.0,
            utilities: 150.0,
            heating: 50.0,
        }];
        let pending = vec![PendingPayment {
            id: "p-now".to_string(),
            payment_month: "2024-06".to_string(),
            payment_date: "2024-06-01".to_string(),
            expected_amount: 1000.0,
        }];

        let patches = plan_future_updates(&contract(), &changes, &pending, date(2024, 6, 10));
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].expected_amount, Some(1050.0));
    }

    #[test]
    fn unchanged_rows_produce_no_patches() {
        let pending = vec![PendingPayment {
            id: "p-ok".to_string(),
            payment_month: "2024-08".to_string(),
            payment_date: "2024-08-01".to_string(),
            expected_amount: 1000.0,
        }];
        let patches = plan_future_updates(&contract(), &[], &pending, date(2024, 6, 1));
        assert!(patches.is_empty());
    }

    #[test]
    fn due_day_change_patches_date_only() {
        let mut terms = contract();
        terms.rent_due_day = Some(15);
        let pending = vec![PendingPayment {
            id: "p-date".to_string(),
            payment_month: "2024-08".to_string(),
            payment_date: "2024-08-01".to_string(),
            expected_amount: 1000.0,
        }];
        let patches = plan_future_updates(&terms, &[], &pending, date(2024, 6, 1));
        assert_eq!(patches.len(), 1);
        assert_eq!(patches[0].expected_amount, None);
        assert_eq!(patches[0].payment_date, Some("2024-08-15".to_string()));
    }

    #[test]
    fn parses_contract_terms_from_row() {
        let row = serde_json::json!({
            "id": "c-9",
            "tenant_id": "t-9",
            "unit_id": "u-9",
            "start_date": "2024-04-01",
            "end_date": null,
            "base_rent": 700.0,
            "utilities": "120.50",
            "heating": 40.0,
            "deposit": 2100.0,
            "deposit_installments": 3,
            "rent_due_day": 3,
            "contract_date": "2024-03-20"
        });
        let terms = ContractTerms::from_row(&row).unwrap();
        assert_eq!(terms.start_date, date(2024, 4, 1));
        assert_eq!(terms.end_date, None);
        assert!((terms.utilities - 120.5).abs() < 0.005);
        assert!((terms.total_rent - 860.5).abs() < 0.005);
        assert_eq!(terms.deposit_installments, 3);
        assert_eq!(terms.rent_due_day, Some(3));
        assert_eq!(terms.contract_date, Some(date(2024, 3, 20)));
    }

    #[test]
    fn rejects_rows_without_start_date() {
        let row = serde_json::json!({ "id": "c-9", "tenant_id": "t-9" });
        assert!(ContractTerms::from_row(&row).is_none());
    }

    #[test]
    fn out_of_range_due_day_is_dropped() {
        let row = serde_json::json!({
            "id": "c-9",
            "start_date": "2024-04-01",
            "rent_due_day": 45
        });
        let terms = ContractTerms::from_row(&row).unwrap();
        assert_eq!(terms.rent_due_day, None);
    }
}
