use serde::Deserialize;
use validator::Validate;

use crate::error::AppError;

pub fn validate_input<T: Validate>(input: &T) -> Result<(), AppError> {
    input
        .validate()
        .map_err(|errors| AppError::UnprocessableEntity(format!("Validation failed: {errors}")))
}

fn default_limit_100() -> i64 {
    100
}
fn default_limit_500() -> i64 {
    500
}
fn default_false() -> bool {
    false
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct ContractsQuery {
    pub tenant_id: Option<String>,
    pub unit_id: Option<String>,
    /// When true, only contracts whose tenancy window includes today.
    #[serde(default = "default_false")]
    pub active_only: bool,
    #[serde(default = "default_limit_100")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct PaymentsQuery {
    pub contract_id: Option<String>,
    pub tenant_id: Option<String>,
    pub status: Option<String>,
    pub payment_type: Option<String>,
    pub payment_month: Option<String>,
    #[serde(default = "default_limit_500")]
    pub limit: i64,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize)]
pub struct ContractPath {
    pub contract_id: String,
}

#[derive(Debug, Clone, Deserialize, serde::Serialize, Validate)]
pub struct GeneratePaymentsInput {
    /// Caller-confirmed pro-rated amount for a mid-month tenancy start.
    /// Replaces the first scheduled rent row's expected amount.
    #[validate(range(min = 0.0))]
    pub partial_rent_amount: Option<f64>,
}

pub fn clamp_limit(limit: i64) -> i64 {
    limit.clamp(1, 1000)
}

#[cfg(test)]
mod tests {
    use super::clamp_limit;

    #[test]
    fn clamps_limits() {
        assert_eq!(clamp_limit(0), 1);
        assert_eq!(clamp_limit(-5), 1);
        assert_eq!(clamp_limit(200), 200);
        assert_eq!(clamp_limit(10_000), 1000);
    }
}
