//! Application state

use std::sync::Arc;

use sqlx::PgPool;

use quotapay_payments::QuotaService;
use quotapay_shared::Config;

use crate::auth::JwtManager;

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub pool: PgPool,
    pub quota: Arc<QuotaService>,
    pub jwt: JwtManager,
}

impl AppState {
    pub fn new(pool: PgPool, config: &Config, quota: Arc<QuotaService>) -> Self {
        Self {
            pool,
            quota,
            jwt: JwtManager::new(&config.jwt_secret),
        }
    }
}
