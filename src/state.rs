use sqlx::PgPool;

use crate::config::AppConfig;
use crate::db::build_pool;

#[derive(Clone)]
pub struct AppState {
    pub config: AppConfig,
    pub db_pool: Option<PgPool>,
}

impl AppState {
    pub fn build(config: AppConfig) -> Result<Self, Box<dyn std::error::Error>> {
        let db_pool = match config.database_url.as_deref() {
            Some(url) => Some(build_pool(url, &config)?),
            None => {
                tracing::warn!("DATABASE_URL is not set — store-backed endpoints will fail");
                None
            }
        };
        Ok(Self { config, db_pool })
    }
}
