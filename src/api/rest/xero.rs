use std::sync::Arc;

use axum::{
    extract::{Extension, RawQuery},
    http::{header, StatusCode},
    response::Html,
    routing::{get, post},
    Json, Router,
};
use tracing::{error, info};

use crate::{
    infrastructure::state::AppState,
    services::{
        errors::ServiceError,
        invoicing::{CreateInvoiceRequest, InvoiceService},
        tokens::TokenService,
    },
};

pub fn router() -> Router {
    Router::new()
        .route("/xero/authorize", get(authorize))
        .route("/auth/xero/callback", get(callback))
        .route("/xero/status", get(status))
        .route("/xero/create-invoice", post(create_invoice))
}

async fn authorize(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<(StatusCode, [(header::HeaderName, String); 1]), (StatusCode, Json<serde_json::Value>)>
{
    let service = TokenService::new(state);
    let url = service.authorize_url().map_err(to_response)?;
    Ok((StatusCode::FOUND, [(header::LOCATION, url)]))
}

/// The consent flow runs in a popup, so the callback always answers with a
/// small HTML page that notifies the opener via postMessage and closes
/// itself.
async fn callback(
    Extension(state): Extension<Arc<AppState>>,
    RawQuery(query): RawQuery,
) -> Html<String> {
    let callback_url = format!(
        "{}?{}",
        state.config.xero.redirect_uri,
        query.unwrap_or_default()
    );

    let service = TokenService::new(state);
    match service.complete_authorization(&callback_url).await {
        Ok(record) => {
            info!(tenant_id = %record.tenant_id, "Xero authorization callback completed");
            Html(success_page())
        }
        Err(err) => {
            error!(error = %err, "Xero authorization callback failed");
            Html(failure_page(&err.to_string()))
        }
    }
}

async fn status(
    Extension(state): Extension<Arc<AppState>>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    let service = TokenService::new(state);
    let status = service.status().await.map_err(to_response)?;
    Ok(Json(serde_json::json!(status)))
}

async fn create_invoice(
    Extension(state): Extension<Arc<AppState>>,
    Json(payload): Json<CreateInvoiceRequest>,
) -> Result<Json<serde_json::Value>, (StatusCode, Json<serde_json::Value>)> {
    let service = InvoiceService::new(state);
    let outcome = service.create_invoice(payload).await.map_err(to_response)?;
    let message = if outcome.is_update {
        "Invoice updated successfully in Xero"
    } else {
        "Invoice created successfully in Xero"
    };
    Ok(Json(serde_json::json!({
        "success": true,
        "message": message,
        "data": outcome,
    })))
}

fn to_response(err: ServiceError) -> (StatusCode, Json<serde_json::Value>) {
    (err.status_code(), Json(err.body()))
}

fn success_page() -> String {
    r#"<!DOCTYPE html>
<html>
  <head>
    <title>Xero Connected</title>
    <style>
      body { font-family: -apple-system, 'Segoe UI', Roboto, sans-serif; display: flex; justify-content: center; align-items: center; height: 100vh; margin: 0; background: linear-gradient(135deg, #667eea 0%, #764ba2 100%); color: white; }
      .container { text-align: center; padding: 2rem; background: rgba(255, 255, 255, 0.1); border-radius: 10px; }
      h1 { margin: 0 0 0.5rem 0; }
      p { margin: 0; opacity: 0.9; }
    </style>
  </head>
  <body>
    <div class="container">
      <h1>Successfully Connected</h1>
      <p>Xero has been authorized. This window will close automatically...</p>
    </div>
    <script>
      if (window.opener) {
        window.opener.postMessage('xero_authorized', '*');
      }
      setTimeout(() => { window.close(); }, 1500);
    </script>
  </body>
</html>
"#
    .to_string()
}

fn failure_page(message: &str) -> String {
    let safe = escape_html(message);
    format!(
        r#"<!DOCTYPE html>
<html>
  <head>
    <title>Xero Authorization Failed</title>
    <style>
      body {{ font-family: -apple-system, 'Segoe UI', Roboto, sans-serif; display: flex; justify-content: center; align-items: center; height: 100vh; margin: 0; background: linear-gradient(135deg, #f093fb 0%, #f5576c 100%); color: white; }}
      .container {{ text-align: center; padding: 2rem; background: rgba(255, 255, 255, 0.1); border-radius: 10px; max-width: 400px; }}
      h1 {{ margin: 0 0 0.5rem 0; }}
      p {{ margin: 0.5rem 0; opacity: 0.9; font-size: 0.9rem; }}
    </style>
  </head>
  <body>
    <div class="container">
      <h1>Authorization Failed</h1>
      <p>{safe}</p>
      <p>This window will close automatically...</p>
    </div>
    <script>
      if (window.opener) {{
        window.opener.postMessage({{ type: 'xero_auth_failed', message: '{safe}' }}, '*');
      }}
      setTimeout(() => {{ window.close(); }}, 3000);
    </script>
  </body>
</html>
"#
    )
}

fn escape_html(raw: &str) -> String {
    raw.chars()
        .map(|c| match c {
            '&' => "&amp;".to_string(),
            '<' => "&lt;".to_string(),
            '>' => "&gt;".to_string(),
            '"' => "&quot;".to_string(),
            '\'' => "&#39;".to_string(),
            other => other.to_string(),
        })
        .collect()
}
