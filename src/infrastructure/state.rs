use std::sync::Arc;

use crate::infrastructure::{config::Config, db::PgPool, xero::XeroClient};

#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub pool: PgPool,
    pub xero: XeroClient,
}

impl AppState {
    pub fn new(config: Arc<Config>, pool: PgPool) -> anyhow::Result<Self> {
        let xero = XeroClient::new(config.xero.clone(), config.xero_request_timeout())?;
        Ok(Self { config, pool, xero })
    }
}
