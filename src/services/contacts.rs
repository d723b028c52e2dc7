use std::sync::Arc;

use tracing::{info, warn};
use uuid::Uuid;

use crate::{
    domain::models::InvoiceRecipient,
    infrastructure::{
        state::AppState,
        xero::{ApiContact, ApiCredentials, ContactPerson},
    },
};

use super::errors::ServiceError;

/// Maps a local buyer or seller to exactly one provider contact id,
/// preferring reuse by email over creating a duplicate.
pub struct ContactService {
    pub state: Arc<AppState>,
}

impl ContactService {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    pub async fn resolve(
        &self,
        creds: &ApiCredentials,
        recipient: &InvoiceRecipient,
    ) -> Result<String, ServiceError> {
        let email = recipient.email.trim().to_lowercase();
        let name = recipient.name.trim().to_string();

        if email.is_empty() || name.is_empty() {
            return Err(ServiceError::Validation(
                "recipient name and email are required".to_string(),
            ));
        }

        // Reuse is by email only: a stale display name on the provider side
        // is not updated in place.
        match self.state.xero.find_contact_by_email(creds, &email).await {
            Ok(Some(existing)) => {
                if let Some(id) = existing.contact_id.as_deref().filter(|id| is_uuid(id)) {
                    info!(contact_id = %id, email = %email, "reusing existing Xero contact");
                    return Ok(id.to_string());
                }
            }
            Ok(None) => {}
            Err(err) if err.is_auth() => return Err(err.into()),
            Err(err) => {
                // Treated as not-found: a duplicate contact is preferred
                // over failing the whole invoice run.
                warn!(error = %err, email = %email, "contact search failed, falling through to create");
            }
        }

        let (first_name, last_name) = split_name(&name);
        let created = self
            .state
            .xero
            .create_contact(
                creds,
                ApiContact {
                    contact_id: None,
                    name: name.clone(),
                    email_address: Some(email.clone()),
                    contact_persons: Some(vec![ContactPerson {
                        first_name,
                        last_name,
                        email_address: email.clone(),
                    }]),
                },
            )
            .await
            .map_err(|err| match ServiceError::from(err) {
                ServiceError::Validation(message) => ServiceError::Validation(format!(
                    "failed to create Xero contact: {}",
                    message
                )),
                other => other,
            })?;

        let contact_id = created.contact_id.unwrap_or_default();
        if !is_uuid(&contact_id) {
            return Err(ServiceError::Validation(format!(
                "Xero returned a malformed contact id: {:?}",
                contact_id
            )));
        }

        info!(contact_id = %contact_id, email = %email, "created Xero contact");
        Ok(contact_id)
    }
}

fn is_uuid(value: &str) -> bool {
    Uuid::parse_str(value).is_ok()
}

/// First whitespace token becomes the first name, the remainder the last
/// name, matching how the provider models contact persons.
fn split_name(name: &str) -> (String, String) {
    let mut parts = name.split_whitespace();
    let first = parts.next().unwrap_or(name).to_string();
    let rest = parts.collect::<Vec<_>>().join(" ");
    (first, rest)
}
