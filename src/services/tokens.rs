use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::{info, warn};
use url::Url;
use uuid::Uuid;

use crate::{
    domain::models::TokenRecord,
    infrastructure::{state::AppState, xero::ApiCredentials},
};

use super::errors::ServiceError;

/// Refresh this many seconds before the stored expiry so a token cannot
/// lapse mid-request against the accounting API.
pub const REFRESH_BUFFER_SECONDS: i64 = 300;

/// Lifetime assumed when the provider omits expires_in from a token grant.
const DEFAULT_TOKEN_LIFETIME_SECONDS: i64 = 1800;

/// `true` once `now` is inside the buffer window before `expires_at`.
pub fn is_expiring_soon(expires_at: DateTime<Utc>, now: DateTime<Utc>, buffer_seconds: i64) -> bool {
    now >= expires_at - Duration::seconds(buffer_seconds)
}

#[derive(Debug, Clone, Serialize)]
pub struct ConnectionStatus {
    pub connected: bool,
    #[serde(rename = "tenantName", skip_serializing_if = "Option::is_none")]
    pub tenant_name: Option<String>,
    #[serde(rename = "connectedAt", skip_serializing_if = "Option::is_none")]
    pub connected_at: Option<DateTime<Utc>>,
    #[serde(rename = "requiresReconnection")]
    pub requires_reconnection: bool,
}

/// Token lifecycle: exactly one connected Xero organisation at a time, the
/// most recently updated credential row wins, refresh mutates that row in
/// place.
pub struct TokenService {
    pub state: Arc<AppState>,
}

impl TokenService {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    pub fn authorize_url(&self) -> Result<String, ServiceError> {
        Ok(self.state.xero.consent_url()?)
    }

    /// The authoritative credential row, or NotConnected when the OAuth flow
    /// has never completed.
    pub async fn current_token(&self) -> Result<TokenRecord, ServiceError> {
        let record = sqlx::query(
            "SELECT id, access_token, refresh_token, expires_at, tenant_id, tenant_name, id_token, updated_at
             FROM xero_tokens ORDER BY updated_at DESC LIMIT 1",
        )
        .map(map_token)
        .fetch_optional(&self.state.pool)
        .await?;

        record.ok_or(ServiceError::NotConnected)
    }

    /// Valid credentials for one accounting call, transparently refreshing
    /// when the stored token is inside the expiry buffer.
    pub async fn ensure_access(&self) -> Result<ApiCredentials, ServiceError> {
        let record = self.current_token().await?.validated()?;

        let record = if is_expiring_soon(record.expires_at, Utc::now(), REFRESH_BUFFER_SECONDS) {
            self.refresh(&record).await?
        } else {
            record
        };

        Ok(ApiCredentials {
            access_token: record.access_token,
            tenant_id: record.tenant_id,
        })
    }

    /// Exchanges the stored refresh token for a new pair and persists it
    /// into the same row. A rejected refresh token surfaces as
    /// RequiresReconnection and is never retried here.
    pub async fn refresh(&self, record: &TokenRecord) -> Result<TokenRecord, ServiceError> {
        let response = self.state.xero.refresh_token(&record.refresh_token).await?;

        let now = Utc::now();
        let expires_at = now
            + Duration::seconds(
                response
                    .expires_in
                    .unwrap_or(DEFAULT_TOKEN_LIFETIME_SECONDS),
            );

        let updated = sqlx::query(
            "UPDATE xero_tokens SET access_token=$1, refresh_token=$2, expires_at=$3, updated_at=$4
             WHERE id=$5
             RETURNING id, access_token, refresh_token, expires_at, tenant_id, tenant_name, id_token, updated_at",
        )
        .bind(&response.access_token)
        .bind(&response.refresh_token)
        .bind(expires_at)
        .bind(now)
        .bind(record.id)
        .map(map_token)
        .fetch_one(&self.state.pool)
        .await?;

        info!(tenant_id = %updated.tenant_id, expires_at = %updated.expires_at, "refreshed Xero access token");
        Ok(updated)
    }

    /// Completes the authorization-code flow: exchanges the code embedded in
    /// the callback URL, picks the first connected tenant, wipes prior
    /// credential rows and stores the new set.
    pub async fn complete_authorization(
        &self,
        callback_url: &str,
    ) -> Result<TokenRecord, ServiceError> {
        let url = Url::parse(callback_url)
            .map_err(|err| ServiceError::AuthorizationFailed(err.to_string()))?;

        if let Some((_, message)) = url.query_pairs().find(|(key, _)| key == "error") {
            return Err(ServiceError::AuthorizationFailed(message.into_owned()));
        }

        let code = url
            .query_pairs()
            .find(|(key, _)| key == "code")
            .map(|(_, value)| value.into_owned())
            .filter(|code| !code.is_empty())
            .ok_or_else(|| {
                ServiceError::AuthorizationFailed("no authorization code in callback".to_string())
            })?;

        let tokens = self
            .state
            .xero
            .exchange_code(&code)
            .await
            .map_err(|err| ServiceError::AuthorizationFailed(err.to_string()))?;

        if tokens.access_token.is_empty() || tokens.refresh_token.is_empty() {
            return Err(ServiceError::AuthorizationFailed(
                "provider returned no usable tokens".to_string(),
            ));
        }

        let connections = self
            .state
            .xero
            .connections(&tokens.access_token)
            .await
            .map_err(|err| ServiceError::AuthorizationFailed(err.to_string()))?;

        let tenant = connections.into_iter().next().ok_or_else(|| {
            ServiceError::AuthorizationFailed("no Xero organisations found".to_string())
        })?;

        let now = Utc::now();
        let expires_at = now
            + Duration::seconds(
                tokens
                    .expires_in
                    .unwrap_or(DEFAULT_TOKEN_LIFETIME_SECONDS),
            );

        let mut tx = self.state.pool.begin().await?;
        sqlx::query("DELETE FROM xero_tokens")
            .execute(&mut *tx)
            .await?;
        let record = sqlx::query(
            "INSERT INTO xero_tokens (id, access_token, refresh_token, expires_at, tenant_id, tenant_name, id_token, updated_at)
             VALUES ($1,$2,$3,$4,$5,$6,$7,$8)
             RETURNING id, access_token, refresh_token, expires_at, tenant_id, tenant_name, id_token, updated_at",
        )
        .bind(Uuid::new_v4())
        .bind(&tokens.access_token)
        .bind(&tokens.refresh_token)
        .bind(expires_at)
        .bind(&tenant.tenant_id)
        .bind(&tenant.tenant_name)
        .bind(&tokens.id_token)
        .bind(now)
        .map(map_token)
        .fetch_one(&mut *tx)
        .await?;
        tx.commit().await?;

        info!(
            tenant_id = %record.tenant_id,
            tenant_name = record.tenant_name.as_deref().unwrap_or(""),
            "Xero organisation connected"
        );
        Ok(record)
    }

    pub async fn status(&self) -> Result<ConnectionStatus, ServiceError> {
        match self.current_token().await {
            Ok(record) => {
                let requires_reconnection = record.clone().validated().is_err();
                if requires_reconnection {
                    warn!(tenant_id = %record.tenant_id, "stored Xero token record is incomplete");
                }
                Ok(ConnectionStatus {
                    connected: true,
                    tenant_name: record.tenant_name,
                    connected_at: Some(record.updated_at),
                    requires_reconnection,
                })
            }
            Err(ServiceError::NotConnected) => Ok(ConnectionStatus {
                connected: false,
                tenant_name: None,
                connected_at: None,
                requires_reconnection: false,
            }),
            Err(other) => Err(other),
        }
    }
}

trait ValidatedToken: Sized {
    fn validated(self) -> Result<Self, ServiceError>;
}

impl ValidatedToken for TokenRecord {
    fn validated(self) -> Result<Self, ServiceError> {
        if self.access_token.trim().is_empty()
            || self.refresh_token.trim().is_empty()
            || self.tenant_id.trim().is_empty()
        {
            return Err(ServiceError::RequiresReconnection(
                "stored token record is missing required fields".to_string(),
            ));
        }
        Ok(self)
    }
}

fn map_token(row: PgRow) -> TokenRecord {
    TokenRecord {
        id: row.get("id"),
        access_token: row.get("access_token"),
        refresh_token: row.get("refresh_token"),
        expires_at: row.get("expires_at"),
        tenant_id: row.get("tenant_id"),
        tenant_name: row.get("tenant_name"),
        id_token: row.get("id_token"),
        updated_at: row.get("updated_at"),
    }
}
