use axum::{
    http::{HeaderValue, StatusCode},
    Json, Router,
};
use tower_http::{
    cors::{Any, CorsLayer},
    trace::TraceLayer,
};
use tracing::warn;

use self::rest::router as rest_router;
use crate::infrastructure::config::Config;

pub mod rest;

pub fn build_router(config: &Config) -> Router {
    Router::new()
        .nest("/api", rest_router())
        .fallback(not_found)
        .layer(TraceLayer::new_for_http())
        .layer(cors_layer(&config.app.cors_origins))
}

pub async fn not_found() -> (StatusCode, Json<serde_json::Value>) {
    (
        StatusCode::NOT_FOUND,
        Json(serde_json::json!({"error": "not_found"})),
    )
}

/// Restricts CORS to the configured origins; an empty list keeps the
/// permissive default for local development.
fn cors_layer(origins: &[String]) -> CorsLayer {
    let parsed = parse_origins(origins);
    if parsed.is_empty() {
        CorsLayer::permissive()
    } else {
        CorsLayer::new()
            .allow_origin(parsed)
            .allow_methods(Any)
            .allow_headers(Any)
    }
}

fn parse_origins(origins: &[String]) -> Vec<HeaderValue> {
    origins
        .iter()
        .filter_map(|origin| match origin.parse::<HeaderValue>() {
            Ok(value) => Some(value),
            Err(_) => {
                warn!(origin = %origin, "ignoring unparseable CORS origin");
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn configured_origins_parse_into_header_values() {
        let origins = vec![
            "https://portal.example.com".to_string(),
            "http://localhost:3000".to_string(),
        ];

        let parsed = parse_origins(&origins);

        assert_eq!(parsed.len(), 2);
        assert_eq!(parsed[0], "https://portal.example.com");
    }

    #[test]
    fn unparseable_origins_are_dropped() {
        let origins = vec!["https://ok.example.com".to_string(), "bad\norigin".to_string()];

        let parsed = parse_origins(&origins);

        assert_eq!(parsed.len(), 1);
    }
}
