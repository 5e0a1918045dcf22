use axum::{routing::get, Router};

use crate::state::AppState;

pub mod contracts;
pub mod health;
pub mod payments;

pub fn v1_router() -> Router<AppState> {
    Router::new()
        .route("/health", get(health::health))
        .merge(contracts::router())
        .merge(payments::router())
}
