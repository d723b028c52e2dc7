use std::time::Duration;

use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use url::Url;

use super::config::XeroConfig;

/// HTTP client for the Xero identity and accounting APIs.
///
/// The client itself is stateless: the access token and tenant id are
/// threaded into every accounting call rather than held as client state,
/// so concurrent requests can never observe each other's credentials.
#[derive(Clone)]
pub struct XeroClient {
    http: reqwest::Client,
    config: XeroConfig,
}

#[derive(Debug, Error)]
pub enum ProviderError {
    /// The provider rejected our credentials. Callers must treat this as
    /// "re-run the OAuth flow", never as retryable.
    #[error("provider rejected credentials: {0}")]
    Auth(String),
    /// Timeout or connection failure; the whole operation may be retried.
    #[error("provider unreachable: {0}")]
    Transient(String),
    /// Any other remote failure, with the most specific message the
    /// provider's nested error envelope offered.
    #[error("provider error ({status}): {message}")]
    Remote { status: u16, message: String },
    #[error("failed to decode provider response: {0}")]
    Decode(String),
    #[error("invalid provider URL: {0}")]
    Url(String),
}

impl ProviderError {
    pub fn is_auth(&self) -> bool {
        matches!(self, ProviderError::Auth(_))
    }
}

/// Credentials for one accounting API call.
#[derive(Debug, Clone)]
pub struct ApiCredentials {
    pub access_token: String,
    pub tenant_id: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TokenResponse {
    pub access_token: String,
    pub refresh_token: String,
    #[serde(default)]
    pub expires_in: Option<i64>,
    #[serde(default)]
    pub id_token: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Connection {
    #[serde(rename = "tenantId")]
    pub tenant_id: String,
    #[serde(rename = "tenantName", default)]
    pub tenant_name: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct TaxRate {
    #[serde(rename = "Name", default)]
    pub name: Option<String>,
    #[serde(rename = "TaxType", default)]
    pub tax_type: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Account {
    #[serde(rename = "Code", default)]
    pub code: Option<String>,
    #[serde(rename = "Name", default)]
    pub name: Option<String>,
    #[serde(rename = "Type", default)]
    pub account_type: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ContactPerson {
    #[serde(rename = "FirstName")]
    pub first_name: String,
    #[serde(rename = "LastName")]
    pub last_name: String,
    #[serde(rename = "EmailAddress")]
    pub email_address: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApiContact {
    #[serde(rename = "ContactID", default, skip_serializing_if = "Option::is_none")]
    pub contact_id: Option<String>,
    #[serde(rename = "Name")]
    pub name: String,
    #[serde(rename = "EmailAddress", default)]
    pub email_address: Option<String>,
    #[serde(
        rename = "ContactPersons",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub contact_persons: Option<Vec<ContactPerson>>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ContactRef {
    #[serde(rename = "ContactID")]
    pub contact_id: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct ApiLineItem {
    #[serde(rename = "Description")]
    pub description: String,
    #[serde(rename = "Quantity")]
    pub quantity: f64,
    #[serde(rename = "UnitAmount")]
    pub unit_amount: f64,
    #[serde(rename = "AccountCode")]
    pub account_code: String,
    #[serde(rename = "TaxType")]
    pub tax_type: String,
}

/// Outbound invoice payload for the create/update call. Supplying
/// `invoice_id` makes the call an in-place update of that invoice.
#[derive(Debug, Clone, Serialize)]
pub struct InvoiceUpsert {
    #[serde(rename = "Type")]
    pub invoice_type: String,
    #[serde(rename = "InvoiceID", skip_serializing_if = "Option::is_none")]
    pub invoice_id: Option<String>,
    #[serde(rename = "Contact")]
    pub contact: ContactRef,
    #[serde(rename = "Date")]
    pub date: String,
    #[serde(rename = "DueDate")]
    pub due_date: String,
    #[serde(rename = "Reference")]
    pub reference: String,
    #[serde(rename = "Status")]
    pub status: String,
    #[serde(rename = "LineAmountTypes")]
    pub line_amount_types: String,
    #[serde(rename = "LineItems")]
    pub line_items: Vec<ApiLineItem>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiInvoice {
    #[serde(rename = "InvoiceID", default)]
    pub invoice_id: Option<String>,
    #[serde(rename = "InvoiceNumber", default)]
    pub invoice_number: Option<String>,
    #[serde(rename = "Status", default)]
    pub status: Option<String>,
    #[serde(rename = "Total", default)]
    pub total: Option<f64>,
    #[serde(rename = "TotalTax", default)]
    pub total_tax: Option<f64>,
    #[serde(rename = "AmountDue", default)]
    pub amount_due: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct ContactsEnvelope {
    #[serde(rename = "Contacts", default)]
    contacts: Vec<ApiContact>,
}

#[derive(Debug, Deserialize)]
struct TaxRatesEnvelope {
    #[serde(rename = "TaxRates", default)]
    tax_rates: Vec<TaxRate>,
}

#[derive(Debug, Deserialize)]
struct AccountsEnvelope {
    #[serde(rename = "Accounts", default)]
    accounts: Vec<Account>,
}

#[derive(Debug, Deserialize)]
struct InvoicesEnvelope {
    #[serde(rename = "Invoices", default)]
    invoices: Vec<ApiInvoice>,
}

#[derive(Debug, Serialize)]
struct ContactsUpload {
    #[serde(rename = "Contacts")]
    contacts: Vec<ApiContact>,
}

#[derive(Debug, Serialize)]
struct InvoicesUpload {
    #[serde(rename = "Invoices")]
    invoices: Vec<InvoiceUpsert>,
}

/// Nested validation envelope Xero wraps most accounting errors in.
#[derive(Debug, Deserialize)]
struct RemoteErrorEnvelope {
    #[serde(rename = "Message", default)]
    message: Option<String>,
    #[serde(rename = "Elements", default)]
    elements: Vec<RemoteErrorElement>,
}

#[derive(Debug, Deserialize)]
struct RemoteErrorElement {
    #[serde(rename = "ValidationErrors", default)]
    validation_errors: Vec<RemoteValidationError>,
}

#[derive(Debug, Deserialize)]
struct RemoteValidationError {
    #[serde(rename = "Message", default)]
    message: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OAuthErrorBody {
    #[serde(default)]
    error: Option<String>,
    #[serde(default)]
    error_description: Option<String>,
}

impl XeroClient {
    pub fn new(config: XeroConfig, timeout: Duration) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder().timeout(timeout).build()?;
        Ok(Self { http, config })
    }

    /// Provider consent URL for the authorization-code flow. Pure URL
    /// construction, no I/O.
    pub fn consent_url(&self) -> Result<String, ProviderError> {
        let mut url = Url::parse(&self.config.identity_base_url)
            .and_then(|u| u.join("/connect/authorize"))
            .map_err(|err| ProviderError::Url(err.to_string()))?;
        url.query_pairs_mut()
            .append_pair("response_type", "code")
            .append_pair("client_id", &self.config.client_id)
            .append_pair("redirect_uri", &self.config.redirect_uri)
            .append_pair("scope", &self.config.scopes.join(" "));
        Ok(url.to_string())
    }

    pub async fn exchange_code(&self, code: &str) -> Result<TokenResponse, ProviderError> {
        let params = [
            ("grant_type", "authorization_code"),
            ("code", code),
            ("redirect_uri", &self.config.redirect_uri),
        ];
        self.token_request(&params).await
    }

    pub async fn refresh_token(&self, refresh_token: &str) -> Result<TokenResponse, ProviderError> {
        let params = [
            ("grant_type", "refresh_token"),
            ("refresh_token", refresh_token),
        ];
        self.token_request(&params).await
    }

    async fn token_request(&self, params: &[(&str, &str)]) -> Result<TokenResponse, ProviderError> {
        let url = format!("{}/connect/token", self.config.identity_base_url);
        let response = self
            .http
            .post(&url)
            .basic_auth(&self.config.client_id, Some(&self.config.client_secret))
            .form(params)
            .send()
            .await
            .map_err(map_transport_error)?;

        let status = response.status();
        let body = response.text().await.map_err(map_transport_error)?;

        if status.is_success() {
            serde_json::from_str(&body).map_err(|err| ProviderError::Decode(err.to_string()))
        } else {
            Err(map_token_error(status, &body))
        }
    }

    /// Tenants the authorized user granted access to, most recent first.
    pub async fn connections(&self, access_token: &str) -> Result<Vec<Connection>, ProviderError> {
        let url = format!("{}/connections", self.config.api_base_url);
        let response = self
            .http
            .get(&url)
            .bearer_auth(access_token)
            .send()
            .await
            .map_err(map_transport_error)?;
        self.decode_json(response).await
    }

    pub async fn tax_rates(&self, creds: &ApiCredentials) -> Result<Vec<TaxRate>, ProviderError> {
        let response = self
            .accounting_get(creds, "TaxRates", &[])
            .await?;
        let envelope: TaxRatesEnvelope = self.decode_json(response).await?;
        Ok(envelope.tax_rates)
    }

    pub async fn accounts(&self, creds: &ApiCredentials) -> Result<Vec<Account>, ProviderError> {
        let response = self.accounting_get(creds, "Accounts", &[]).await?;
        let envelope: AccountsEnvelope = self.decode_json(response).await?;
        Ok(envelope.accounts)
    }

    pub async fn find_contact_by_email(
        &self,
        creds: &ApiCredentials,
        email: &str,
    ) -> Result<Option<ApiContact>, ProviderError> {
        let filter = format!("EmailAddress==\"{}\"", email);
        let response = self
            .accounting_get(creds, "Contacts", &[("where", filter.as_str())])
            .await?;
        let envelope: ContactsEnvelope = self.decode_json(response).await?;
        Ok(envelope.contacts.into_iter().next())
    }

    pub async fn create_contact(
        &self,
        creds: &ApiCredentials,
        contact: ApiContact,
    ) -> Result<ApiContact, ProviderError> {
        let url = self.accounting_url("Contacts", &[("summarizeErrors", "false")])?;
        let response = self
            .http
            .put(url)
            .bearer_auth(&creds.access_token)
            .header("xero-tenant-id", &creds.tenant_id)
            .json(&ContactsUpload {
                contacts: vec![contact],
            })
            .send()
            .await
            .map_err(map_transport_error)?;
        let envelope: ContactsEnvelope = self.decode_json(response).await?;
        envelope.contacts.into_iter().next().ok_or_else(|| {
            ProviderError::Decode("no contact returned from contact creation".into())
        })
    }

    pub async fn get_invoice(
        &self,
        creds: &ApiCredentials,
        invoice_id: &str,
    ) -> Result<ApiInvoice, ProviderError> {
        let path = format!("Invoices/{}", invoice_id);
        let response = self.accounting_get(creds, &path, &[]).await?;
        let envelope: InvoicesEnvelope = self.decode_json(response).await?;
        envelope
            .invoices
            .into_iter()
            .next()
            .ok_or(ProviderError::Remote {
                status: 404,
                message: format!("invoice {} not found", invoice_id),
            })
    }

    /// Create-or-update call: the provider updates in place when the payload
    /// carries an InvoiceID it recognizes, and allocates a new invoice
    /// otherwise.
    pub async fn upsert_invoice(
        &self,
        creds: &ApiCredentials,
        invoice: InvoiceUpsert,
    ) -> Result<ApiInvoice, ProviderError> {
        let url = self.accounting_url("Invoices", &[("summarizeErrors", "false")])?;
        let response = self
            .http
            .post(url)
            .bearer_auth(&creds.access_token)
            .header("xero-tenant-id", &creds.tenant_id)
            .json(&InvoicesUpload {
                invoices: vec![invoice],
            })
            .send()
            .await
            .map_err(map_transport_error)?;
        let envelope: InvoicesEnvelope = self.decode_json(response).await?;
        envelope.invoices.into_iter().next().ok_or_else(|| {
            ProviderError::Decode("no invoice returned from invoice submission".into())
        })
    }

    fn accounting_url(
        &self,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<Url, ProviderError> {
        let mut url = Url::parse(&format!(
            "{}/api.xro/2.0/{}",
            self.config.api_base_url, path
        ))
        .map_err(|err| ProviderError::Url(err.to_string()))?;
        for (key, value) in query {
            url.query_pairs_mut().append_pair(key, value);
        }
        Ok(url)
    }

    async fn accounting_get(
        &self,
        creds: &ApiCredentials,
        path: &str,
        query: &[(&str, &str)],
    ) -> Result<reqwest::Response, ProviderError> {
        let url = self.accounting_url(path, query)?;
        self.http
            .get(url)
            .bearer_auth(&creds.access_token)
            .header("xero-tenant-id", &creds.tenant_id)
            .header(reqwest::header::ACCEPT, "application/json")
            .send()
            .await
            .map_err(map_transport_error)
    }

    async fn decode_json<T: serde::de::DeserializeOwned>(
        &self,
        response: reqwest::Response,
    ) -> Result<T, ProviderError> {
        let status = response.status();
        let body = response.text().await.map_err(map_transport_error)?;

        if status.is_success() {
            serde_json::from_str(&body).map_err(|err| ProviderError::Decode(err.to_string()))
        } else {
            Err(map_remote_error(status, &body))
        }
    }
}

fn map_transport_error(err: reqwest::Error) -> ProviderError {
    if err.is_timeout() || err.is_connect() {
        ProviderError::Transient(err.to_string())
    } else {
        ProviderError::Remote {
            status: err.status().map(|s| s.as_u16()).unwrap_or(0),
            message: err.to_string(),
        }
    }
}

fn map_remote_error(status: StatusCode, body: &str) -> ProviderError {
    let message = extract_remote_message(body)
        .unwrap_or_else(|| format!("request failed with status {}", status));

    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        ProviderError::Auth(message)
    } else {
        ProviderError::Remote {
            status: status.as_u16(),
            message,
        }
    }
}

fn map_token_error(status: StatusCode, body: &str) -> ProviderError {
    if status == StatusCode::UNAUTHORIZED || status == StatusCode::FORBIDDEN {
        return ProviderError::Auth(format!("token endpoint refused request: {}", body));
    }

    if let Ok(oauth) = serde_json::from_str::<OAuthErrorBody>(body) {
        if let Some(code) = oauth.error {
            let description = oauth.error_description.unwrap_or_else(|| code.clone());
            // invalid_grant means the refresh token itself was rejected;
            // only re-authorization can recover.
            if code.contains("invalid_grant")
                || code.contains("invalid_token")
                || code.contains("unauthorized")
            {
                return ProviderError::Auth(description);
            }
            return ProviderError::Remote {
                status: status.as_u16(),
                message: description,
            };
        }
    }

    ProviderError::Remote {
        status: status.as_u16(),
        message: format!("token request failed with status {}", status),
    }
}

/// Pulls the most specific message out of the provider's nested
/// validation-error envelope, falling back to the top-level message.
fn extract_remote_message(body: &str) -> Option<String> {
    let envelope = serde_json::from_str::<RemoteErrorEnvelope>(body).ok()?;
    envelope
        .elements
        .iter()
        .flat_map(|element| element.validation_errors.iter())
        .find_map(|validation| validation.message.clone())
        .or(envelope.message)
}
