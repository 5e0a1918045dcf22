use std::time::Duration;

use chrono::{Datelike, Timelike, Utc};
use tokio::time::sleep;

use crate::state::AppState;

/// Spawn the background scheduler that keeps payment schedules rolling.
///
/// The nightly job runs in its own `tokio::spawn` so a failure never
/// crashes the scheduler loop.
pub async fn run_background_scheduler(state: AppState) {
    tracing::info!("Background scheduler started");

    let pool = match state.db_pool.as_ref() {
        Some(p) => p.clone(),
        None => {
            tracing::warn!("Scheduler: no database pool configured, exiting");
            return;
        }
    };

    let daily_hour = state.config.scheduler_daily_hour_utc.min(23);
    let horizon_months = state.config.schedule_horizon_months;
    let mut last_daily_run: Option<u32> = None;

    loop {
        sleep(Duration::from_secs(60)).await;

        let now_utc = Utc::now();
        let today = now_utc.date_naive();

        // Once per calendar day, at or after the configured UTC hour.
        let today_ordinal = today.ordinal();
        if last_daily_run == Some(today_ordinal) {
            continue;
        }
        if now_utc.hour() < daily_hour {
            continue;
        }

        last_daily_run = Some(today_ordinal);
        tracing::info!("Scheduler: running daily schedule sync for {today}");

        let pool = pool.clone();
        tokio::spawn(async move {
            let result =
                crate::services::payment_schedule::sync_contract_schedules(&pool, horizon_months)
                    .await;
            tracing::info!(
                contracts = result.contracts_processed,
                created = result.payments_created,
                updated = result.payments_updated,
                errors = result.errors,
                "Scheduler: daily schedule sync completed"
            );
        });
    }
}
