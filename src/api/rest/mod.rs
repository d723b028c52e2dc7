use axum::{routing::get, Router};

use crate::api::rest::xero::router as xero_router;

pub mod health;
pub mod xero;

pub fn router() -> Router {
    Router::new()
        .route("/health", get(health::healthcheck))
        .merge(xero_router())
}
