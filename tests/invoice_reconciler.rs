use std::sync::Arc;

use anyhow::Result;
use axum::{
    body::{to_bytes, Body},
    http::{header, Request, StatusCode},
    Extension, Router,
};
use brokerage_portal::{
    api,
    infrastructure::{
        config::{AppConfig, Config, DatabaseConfig, XeroConfig},
        state::AppState,
    },
};
use chrono::{Duration, NaiveDate, Utc};
use serde_json::Value;
use serial_test::serial;
use sqlx::PgPool;
use tower::ServiceExt;
use uuid::Uuid;
use wiremock::{
    matchers::{method, path},
    Mock, MockServer, ResponseTemplate,
};

#[path = "test_harness.rs"]
mod test_harness;

use test_harness::run_test;

const CONTACT_ID: &str = "3ff6d40c-af9a-40a3-89ce-3c1556a25591";

#[tokio::test]
#[serial]
async fn creates_invoice_and_links_contract() -> Result<()> {
    run_test(run_create_happy_path).await
}

#[tokio::test]
#[serial]
async fn linked_draft_invoice_is_updated_in_place() -> Result<()> {
    run_test(run_update_existing).await
}

#[tokio::test]
#[serial]
async fn locked_invoice_is_refused_with_guidance() -> Result<()> {
    run_test(run_locked_invoice).await
}

#[tokio::test]
#[serial]
async fn stale_invoice_link_is_cleared_and_recreated() -> Result<()> {
    run_test(run_stale_link_recovery).await
}

#[tokio::test]
#[serial]
async fn batch_with_mixed_recipients_is_rejected() -> Result<()> {
    run_test(run_mixed_recipients).await
}

#[tokio::test]
#[serial]
async fn zero_amount_invoice_is_rejected() -> Result<()> {
    run_test(run_zero_amount).await
}

#[tokio::test]
#[serial]
async fn missing_recipient_email_is_rejected() -> Result<()> {
    run_test(run_incomplete_recipient).await
}

#[tokio::test]
#[serial]
async fn create_invoice_without_connection_returns_unauthorized() -> Result<()> {
    run_test(run_not_connected).await
}

#[tokio::test]
#[serial]
async fn unknown_contract_returns_not_found() -> Result<()> {
    run_test(run_unknown_contract).await
}

async fn run_create_happy_path(pool: PgPool) -> Result<()> {
    let server = MockServer::start().await;
    mock_settings(&server).await;
    mock_contact_search(&server, Value::Array(vec![])).await;
    Mock::given(method("PUT"))
        .and(path("/api.xro/2.0/Contacts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "Contacts": [{ "ContactID": CONTACT_ID, "Name": "Acme Grain" }]
        })))
        .expect(1)
        .mount(&server)
        .await;
    let invoice_id = Uuid::new_v4().to_string();
    mock_invoice_upsert(&server, &invoice_id, "INV-0042").await;

    let (app, _state) = build_app(pool.clone(), server.uri()).await?;
    seed_token(&pool).await?;
    let buyer_id = seed_buyer(&pool, "Acme Grain", Some("buyer@acme.test")).await?;
    let seller_id = seed_seller(&pool, "Farm Co", Some("sales@farm.test")).await?;
    let (contract_id, _) =
        seed_contract(&pool, buyer_id, seller_id, "Buyer", 310.5, None).await?;

    let response = post_create_invoice(
        app,
        serde_json::json!({ "contractId": contract_id }),
    )
    .await?;

    assert_eq!(response.0, StatusCode::OK);
    let body = response.1;
    assert_eq!(body["success"], Value::Bool(true));
    assert_eq!(
        body["message"],
        Value::String("Invoice created successfully in Xero".to_string())
    );
    assert_eq!(body["data"]["invoiceId"], Value::String(invoice_id.clone()));
    assert_eq!(body["data"]["invoiceNumber"], Value::String("INV-0042".to_string()));
    assert_eq!(body["data"]["isUpdate"], Value::Bool(false));
    assert!(body["data"]["xeroUrl"]
        .as_str()
        .unwrap_or_default()
        .contains(&invoice_id));

    let (linked, status): (Option<String>, String) = sqlx::query_as(
        "SELECT xero_invoice_id, status FROM contracts WHERE id=$1",
    )
    .bind(contract_id)
    .fetch_one(&pool)
    .await?;
    assert_eq!(linked.as_deref(), Some(invoice_id.as_str()));
    assert_eq!(status, "Invoiced");

    Ok(())
}

async fn run_update_existing(pool: PgPool) -> Result<()> {
    let existing_id = Uuid::new_v4().to_string();
    let server = MockServer::start().await;
    mock_contact_search(
        &server,
        serde_json::json!([{ "ContactID": CONTACT_ID, "Name": "Acme Grain" }]),
    )
    .await;
    Mock::given(method("GET"))
        .and(path(format!("/api.xro/2.0/Invoices/{existing_id}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "Invoices": [{ "InvoiceID": existing_id, "Status": "DRAFT" }]
        })))
        .mount(&server)
        .await;
    mock_invoice_upsert(&server, &existing_id, "INV-0042").await;

    let (app, _state) = build_app(pool.clone(), server.uri()).await?;
    seed_token(&pool).await?;
    let buyer_id = seed_buyer(&pool, "Acme Grain", Some("buyer@acme.test")).await?;
    let seller_id = seed_seller(&pool, "Farm Co", None).await?;
    let (contract_id, _) = seed_contract(
        &pool,
        buyer_id,
        seller_id,
        "Buyer",
        310.5,
        Some(&existing_id),
    )
    .await?;

    let response = post_create_invoice(
        app,
        serde_json::json!({ "contractIds": [contract_id] }),
    )
    .await?;

    assert_eq!(response.0, StatusCode::OK);
    assert_eq!(response.1["data"]["isUpdate"], Value::Bool(true));
    assert_eq!(
        response.1["message"],
        Value::String("Invoice updated successfully in Xero".to_string())
    );
    assert_eq!(
        response.1["data"]["invoiceId"],
        Value::String(existing_id)
    );

    Ok(())
}

async fn run_locked_invoice(pool: PgPool) -> Result<()> {
    let existing_id = Uuid::new_v4().to_string();
    let server = MockServer::start().await;
    mock_contact_search(
        &server,
        serde_json::json!([{ "ContactID": CONTACT_ID, "Name": "Acme Grain" }]),
    )
    .await;
    Mock::given(method("GET"))
        .and(path(format!("/api.xro/2.0/Invoices/{existing_id}")))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "Invoices": [{ "InvoiceID": existing_id, "Status": "AUTHORISED" }]
        })))
        .mount(&server)
        .await;

    let (app, _state) = build_app(pool.clone(), server.uri()).await?;
    seed_token(&pool).await?;
    let buyer_id = seed_buyer(&pool, "Acme Grain", Some("buyer@acme.test")).await?;
    let seller_id = seed_seller(&pool, "Farm Co", None).await?;
    let (contract_id, _) = seed_contract(
        &pool,
        buyer_id,
        seller_id,
        "Buyer",
        310.5,
        Some(&existing_id),
    )
    .await?;

    let response = post_create_invoice(
        app,
        serde_json::json!({ "contractId": contract_id }),
    )
    .await?;

    assert_eq!(response.0, StatusCode::BAD_REQUEST);
    assert_eq!(response.1["data"]["status"], Value::String("AUTHORISED".to_string()));
    assert_eq!(
        response.1["data"]["invoiceId"],
        Value::String(existing_id.clone())
    );

    // The refusal must not disturb the stored linkage.
    let (linked,): (Option<String>,) =
        sqlx::query_as("SELECT xero_invoice_id FROM contracts WHERE id=$1")
            .bind(contract_id)
            .fetch_one(&pool)
            .await?;
    assert_eq!(linked.as_deref(), Some(existing_id.as_str()));

    Ok(())
}

async fn run_stale_link_recovery(pool: PgPool) -> Result<()> {
    // No mock for the stale invoice id, so the lookup sees a 404.
    let server = MockServer::start().await;
    mock_contact_search(
        &server,
        serde_json::json!([{ "ContactID": CONTACT_ID, "Name": "Acme Grain" }]),
    )
    .await;
    let fresh_id = Uuid::new_v4().to_string();
    mock_invoice_upsert(&server, &fresh_id, "INV-0099").await;

    let (app, _state) = build_app(pool.clone(), server.uri()).await?;
    seed_token(&pool).await?;
    let buyer_id = seed_buyer(&pool, "Acme Grain", Some("buyer@acme.test")).await?;
    let seller_id = seed_seller(&pool, "Farm Co", None).await?;
    let (contract_id, _) = seed_contract(
        &pool,
        buyer_id,
        seller_id,
        "Buyer",
        310.5,
        Some("00000000-dead-beef-0000-000000000000"),
    )
    .await?;

    let response = post_create_invoice(
        app,
        serde_json::json!({ "contractId": contract_id }),
    )
    .await?;

    assert_eq!(response.0, StatusCode::OK);
    assert_eq!(response.1["data"]["isUpdate"], Value::Bool(false));

    let (linked,): (Option<String>,) =
        sqlx::query_as("SELECT xero_invoice_id FROM contracts WHERE id=$1")
            .bind(contract_id)
            .fetch_one(&pool)
            .await?;
    assert_eq!(linked.as_deref(), Some(fresh_id.as_str()));

    Ok(())
}

async fn run_mixed_recipients(pool: PgPool) -> Result<()> {
    let server = MockServer::start().await;
    let (app, _state) = build_app(pool.clone(), server.uri()).await?;

    let buyer_a = seed_buyer(&pool, "Acme Grain", Some("buyer@acme.test")).await?;
    let buyer_b = seed_buyer(&pool, "Other Mills", Some("other@mills.test")).await?;
    let seller_id = seed_seller(&pool, "Farm Co", None).await?;
    let (contract_a, _) = seed_contract(&pool, buyer_a, seller_id, "Buyer", 310.5, None).await?;
    let (contract_b, _) = seed_contract(&pool, buyer_b, seller_id, "Buyer", 250.0, None).await?;

    let response = post_create_invoice(
        app,
        serde_json::json!({ "contractIds": [contract_a, contract_b] }),
    )
    .await?;

    assert_eq!(response.0, StatusCode::BAD_REQUEST);
    assert!(response.1["message"]
        .as_str()
        .unwrap_or_default()
        .contains("same recipient"));

    Ok(())
}

async fn run_zero_amount(pool: PgPool) -> Result<()> {
    // The recipient is unknown to the provider; the zero-amount guard must
    // fire before the resolver can create a contact for it.
    let server = MockServer::start().await;
    mock_contact_search(&server, Value::Array(vec![])).await;
    Mock::given(method("PUT"))
        .and(path("/api.xro/2.0/Contacts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "Contacts": [{ "ContactID": CONTACT_ID, "Name": "Acme Grain" }]
        })))
        .expect(0)
        .mount(&server)
        .await;

    let (app, _state) = build_app(pool.clone(), server.uri()).await?;
    seed_token(&pool).await?;
    let buyer_id = seed_buyer(&pool, "Acme Grain", Some("buyer@acme.test")).await?;
    let seller_id = seed_seller(&pool, "Farm Co", None).await?;
    let (contract_id, _) = seed_contract(&pool, buyer_id, seller_id, "Buyer", 0.0, None).await?;

    let response = post_create_invoice(
        app,
        serde_json::json!({ "contractId": contract_id }),
    )
    .await?;

    assert_eq!(response.0, StatusCode::BAD_REQUEST);
    assert!(response.1["message"]
        .as_str()
        .unwrap_or_default()
        .contains("cannot be zero"));

    Ok(())
}

async fn run_incomplete_recipient(pool: PgPool) -> Result<()> {
    let server = MockServer::start().await;
    let (app, _state) = build_app(pool.clone(), server.uri()).await?;

    let buyer_id = seed_buyer(&pool, "Acme Grain", None).await?;
    let seller_id = seed_seller(&pool, "Farm Co", None).await?;
    let (contract_id, _) = seed_contract(&pool, buyer_id, seller_id, "Buyer", 310.5, None).await?;

    let response = post_create_invoice(
        app,
        serde_json::json!({ "contractId": contract_id }),
    )
    .await?;

    assert_eq!(response.0, StatusCode::BAD_REQUEST);
    assert!(response.1["message"]
        .as_str()
        .unwrap_or_default()
        .contains("Buyer information is incomplete"));

    Ok(())
}

async fn run_not_connected(pool: PgPool) -> Result<()> {
    let server = MockServer::start().await;
    let (app, _state) = build_app(pool.clone(), server.uri()).await?;
    sqlx::query("DELETE FROM xero_tokens")
        .execute(&pool)
        .await?;

    let buyer_id = seed_buyer(&pool, "Acme Grain", Some("buyer@acme.test")).await?;
    let seller_id = seed_seller(&pool, "Farm Co", None).await?;
    let (contract_id, _) = seed_contract(&pool, buyer_id, seller_id, "Buyer", 310.5, None).await?;

    let response = post_create_invoice(
        app,
        serde_json::json!({ "contractId": contract_id }),
    )
    .await?;

    assert_eq!(response.0, StatusCode::UNAUTHORIZED);
    assert_eq!(response.1["requiresReconnection"], Value::Bool(false));

    Ok(())
}

async fn run_unknown_contract(pool: PgPool) -> Result<()> {
    let server = MockServer::start().await;
    let (app, _state) = build_app(pool.clone(), server.uri()).await?;

    let response = post_create_invoice(
        app,
        serde_json::json!({ "contractId": Uuid::new_v4() }),
    )
    .await?;

    assert_eq!(response.0, StatusCode::NOT_FOUND);

    Ok(())
}

async fn build_app(pool: PgPool, mock_base: String) -> Result<(Router, Arc<AppState>)> {
    let config = Arc::new(Config {
        app: AppConfig::default(),
        database: DatabaseConfig {
            url: "postgres://integration".to_string(),
            max_connections: 5,
        },
        xero: XeroConfig {
            client_id: "integration-client".to_string(),
            client_secret: "integration-secret".to_string(),
            identity_base_url: mock_base.clone(),
            api_base_url: mock_base,
            request_timeout_seconds: 5,
            ..XeroConfig::default()
        },
    });

    let state = Arc::new(AppState::new(Arc::clone(&config), pool)?);
    let app = api::build_router(config.as_ref()).layer(Extension(Arc::clone(&state)));
    Ok((app, state))
}

async fn post_create_invoice(app: Router, payload: Value) -> Result<(StatusCode, Value)> {
    let response = app
        .oneshot(
            Request::builder()
                .method("POST")
                .uri("/api/xero/create-invoice")
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(payload.to_string()))?,
        )
        .await?;

    let status = response.status();
    let body: Value = serde_json::from_slice(&to_bytes(response.into_body(), usize::MAX).await?)?;
    Ok((status, body))
}

async fn mock_settings(server: &MockServer) {
    Mock::given(method("GET"))
        .and(path("/api.xro/2.0/TaxRates"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "TaxRates": [
                { "Name": "GST on Expenses", "TaxType": "INPUT" },
                { "Name": "GST on Income", "TaxType": "OUTPUT" }
            ]
        })))
        .mount(server)
        .await;
    Mock::given(method("GET"))
        .and(path("/api.xro/2.0/Accounts"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "Accounts": [
                { "Code": "090", "Name": "Business Bank Account", "Type": "BANK" },
                { "Code": "200", "Name": "Sales", "Type": "REVENUE" }
            ]
        })))
        .mount(server)
        .await;
}

async fn mock_contact_search(server: &MockServer, contacts: Value) {
    Mock::given(method("GET"))
        .and(path("/api.xro/2.0/Contacts"))
        .respond_with(
            ResponseTemplate::new(200)
                .set_body_json(serde_json::json!({ "Contacts": contacts })),
        )
        .mount(server)
        .await;
}

async fn mock_invoice_upsert(server: &MockServer, invoice_id: &str, invoice_number: &str) {
    Mock::given(method("POST"))
        .and(path("/api.xro/2.0/Invoices"))
        .respond_with(ResponseTemplate::new(200).set_body_json(serde_json::json!({
            "Invoices": [{
                "InvoiceID": invoice_id,
                "InvoiceNumber": invoice_number,
                "Status": "DRAFT",
                "Total": 310.5,
                "TotalTax": 31.05,
                "AmountDue": 341.55
            }]
        })))
        .mount(server)
        .await;
}

async fn seed_token(pool: &PgPool) -> Result<()> {
    sqlx::query("DELETE FROM xero_tokens").execute(pool).await?;
    sqlx::query(
        "INSERT INTO xero_tokens (id, access_token, refresh_token, expires_at, tenant_id, tenant_name, id_token, updated_at)
         VALUES ($1,$2,$3,$4,$5,$6,$7,$8)",
    )
    .bind(Uuid::new_v4())
    .bind("valid-access")
    .bind("valid-refresh")
    .bind(Utc::now() + Duration::seconds(3_600))
    .bind("tenant-1")
    .bind("Integration Tenant")
    .bind::<Option<String>>(None)
    .bind(Utc::now())
    .execute(pool)
    .await?;
    Ok(())
}

async fn seed_buyer(pool: &PgPool, name: &str, email: Option<&str>) -> Result<Uuid> {
    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO buyers (id, name, email) VALUES ($1,$2,$3)")
        .bind(id)
        .bind(name)
        .bind(email)
        .execute(pool)
        .await?;
    Ok(id)
}

async fn seed_seller(pool: &PgPool, legal_name: &str, email: Option<&str>) -> Result<Uuid> {
    let id = Uuid::new_v4();
    sqlx::query("INSERT INTO sellers (id, legal_name, email) VALUES ($1,$2,$3)")
        .bind(id)
        .bind(legal_name)
        .bind(email)
        .execute(pool)
        .await?;
    Ok(id)
}

async fn seed_contract(
    pool: &PgPool,
    buyer_id: Uuid,
    seller_id: Uuid,
    payable_by: &str,
    price_ex_gst: f64,
    linked_invoice: Option<&str>,
) -> Result<(Uuid, String)> {
    let id = Uuid::new_v4();
    let number = format!("CT-{}", &id.simple().to_string()[..8]);
    sqlx::query(
        "INSERT INTO contracts (id, contract_number, contract_date, buyer_id, seller_id,
                                commodity, grade, tonnes, price_ex_gst, brokerage_rate,
                                brokerage_payable_by, xero_invoice_id, status)
         VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13)",
    )
    .bind(id)
    .bind(&number)
    .bind(NaiveDate::from_ymd_opt(2025, 11, 1).unwrap_or_default())
    .bind(buyer_id)
    .bind(seller_id)
    .bind("Wheat")
    .bind("APW1")
    .bind(100.0)
    .bind(price_ex_gst)
    .bind(1.0)
    .bind(payable_by)
    .bind(linked_invoice)
    .bind("Complete")
    .execute(pool)
    .await?;
    Ok((id, number))
}
