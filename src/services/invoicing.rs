use std::sync::Arc;

use chrono::{Duration, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::postgres::PgRow;
use sqlx::Row;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::{
    domain::{
        billing,
        models::{Buyer, Contract, ContractWithParties, InvoiceRecipient, InvoiceStatus, Seller},
    },
    infrastructure::{
        state::AppState,
        xero::{ApiCredentials, ApiLineItem, ContactRef, InvoiceUpsert, ProviderError},
    },
};

use super::{contacts::ContactService, errors::ServiceError, tokens::TokenService};

const FALLBACK_TAX_TYPE: &str = "NONE";
const FALLBACK_REVENUE_ACCOUNT: &str = "200";

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateInvoiceRequest {
    #[serde(default)]
    pub contract_id: Option<Uuid>,
    #[serde(default)]
    pub contract_ids: Vec<Uuid>,
    #[serde(default)]
    pub invoice_date: Option<NaiveDate>,
    #[serde(default)]
    pub due_date: Option<NaiveDate>,
    #[serde(default)]
    pub reference: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl CreateInvoiceRequest {
    pub fn contract_ids(&self) -> Vec<Uuid> {
        let mut ids: Vec<Uuid> = self.contract_id.into_iter().collect();
        for id in &self.contract_ids {
            if !ids.contains(id) {
                ids.push(*id);
            }
        }
        ids
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct InvoiceOutcome {
    pub invoice_id: String,
    pub invoice_number: Option<String>,
    pub xero_url: String,
    pub total: Option<f64>,
    pub total_tax: Option<f64>,
    pub amount_due: Option<f64>,
    pub status: Option<String>,
    pub is_update: bool,
    pub contract_numbers: Vec<String>,
}

/// Orchestrates one invoice-creation request: credentials, contact, line
/// items, then an update-or-create against the provider, and finally the
/// linkage write-back onto the local contracts.
pub struct InvoiceService {
    pub state: Arc<AppState>,
}

impl InvoiceService {
    pub fn new(state: Arc<AppState>) -> Self {
        Self { state }
    }

    pub async fn create_invoice(
        &self,
        request: CreateInvoiceRequest,
    ) -> Result<InvoiceOutcome, ServiceError> {
        let ids = request.contract_ids();
        if ids.is_empty() {
            return Err(ServiceError::Validation(
                "Contract ID is required".to_string(),
            ));
        }

        let contracts = self.fetch_contracts(&ids).await?;
        if contracts.is_empty() {
            return Err(ServiceError::NotFound);
        }

        // Local validation happens before any provider call is spent.
        let recipient = select_recipient(&contracts)?;

        let tokens = TokenService::new(Arc::clone(&self.state));
        let creds = tokens.ensure_access().await?;

        let (tax_type, account_code) = tokio::join!(
            self.default_tax_type(&creds),
            self.default_revenue_account(&creds)
        );
        let (tax_type, account_code) = (tax_type?, account_code?);

        // The billable total is a function of local contract data alone, so
        // the zero guard must fire before any mutating provider call such as
        // contact creation.
        let built = billing::build_for_contracts(&contracts, &tax_type, &account_code);
        if built.total == 0.0 {
            return Err(ServiceError::Validation(
                "Invoice amount cannot be zero. Please check contract pricing.".to_string(),
            ));
        }
        debug!(
            total = built.total,
            brokerage = built.brokerage_total,
            degraded = built.degraded,
            "built invoice line items"
        );

        let contact_id = ContactService::new(Arc::clone(&self.state))
            .resolve(&creds, &recipient)
            .await?;

        let existing_id = match shared_linked_invoice(&contracts) {
            Some(existing) => self.check_existing_invoice(&creds, &ids, &existing).await?,
            None => None,
        };
        let is_update = existing_id.is_some();

        let contract_numbers: Vec<String> = contracts
            .iter()
            .map(|c| c.contract.contract_number.clone())
            .collect();

        let invoice_date = request.invoice_date.unwrap_or_else(|| Utc::now().date_naive());
        let due_date = request.due_date.unwrap_or(invoice_date + Duration::days(30));
        let reference = request
            .reference
            .clone()
            .filter(|r| !r.trim().is_empty())
            .unwrap_or_else(|| format!("Contract {}", contract_numbers[0]));
        if let Some(notes) = request.notes.as_deref().filter(|n| !n.trim().is_empty()) {
            // The provider has no notes field on invoice creation; recorded
            // here so the request detail is not silently dropped.
            debug!(notes = %notes, "invoice notes supplied with request");
        }

        let payload = InvoiceUpsert {
            invoice_type: "ACCREC".to_string(),
            invoice_id: existing_id.clone(),
            contact: ContactRef {
                contact_id: contact_id.clone(),
            },
            date: invoice_date.to_string(),
            due_date: due_date.to_string(),
            reference,
            status: "DRAFT".to_string(),
            line_amount_types: "Exclusive".to_string(),
            line_items: built
                .items
                .iter()
                .map(|item| ApiLineItem {
                    description: item.description.clone(),
                    quantity: item.quantity,
                    unit_amount: item.unit_amount,
                    account_code: item.account_code.clone(),
                    tax_type: item.tax_type.clone(),
                })
                .collect(),
        };

        let submitted = self.state.xero.upsert_invoice(&creds, payload).await?;
        let invoice_id = submitted
            .invoice_id
            .clone()
            .filter(|id| !id.is_empty())
            .ok_or_else(|| {
                ServiceError::Internal("no invoice returned from Xero".to_string())
            })?;

        self.persist_linkage(&ids, &invoice_id, submitted.invoice_number.as_deref())
            .await?;

        info!(
            invoice_id = %invoice_id,
            is_update,
            contracts = contract_numbers.len(),
            "invoice submitted to Xero"
        );

        Ok(InvoiceOutcome {
            xero_url: invoice_view_url(&invoice_id),
            invoice_id,
            invoice_number: submitted.invoice_number,
            total: submitted.total,
            total_tax: submitted.total_tax,
            amount_due: submitted.amount_due,
            status: submitted.status,
            is_update,
            contract_numbers,
        })
    }

    /// Decides whether the shared stored invoice id can be updated in
    /// place. Locked invoices are refused outright; a stale id is cleared
    /// from the contracts so a fresh invoice is created instead.
    async fn check_existing_invoice(
        &self,
        creds: &ApiCredentials,
        ids: &[Uuid],
        existing_id: &str,
    ) -> Result<Option<String>, ServiceError> {
        match self.state.xero.get_invoice(creds, existing_id).await {
            Ok(invoice) => {
                let status = invoice
                    .status
                    .as_deref()
                    .unwrap_or("DRAFT")
                    .parse::<InvoiceStatus>()
                    .unwrap_or(InvoiceStatus::Draft);
                if status.is_locked() {
                    return Err(ServiceError::InvoiceLocked {
                        invoice_id: existing_id.to_string(),
                        status: status.as_str().to_string(),
                        url: invoice_view_url(existing_id),
                    });
                }
                Ok(Some(existing_id.to_string()))
            }
            Err(ProviderError::Remote { status: 404, .. }) => {
                warn!(invoice_id = %existing_id, "linked invoice no longer exists, clearing stale linkage");
                self.clear_linkage(ids).await?;
                Ok(None)
            }
            Err(other) => Err(other.into()),
        }
    }

    async fn fetch_contracts(&self, ids: &[Uuid]) -> Result<Vec<ContractWithParties>, ServiceError> {
        let rows = sqlx::query(
            r#"
            SELECT c.id, c.contract_number, c.contract_date, c.buyer_id, c.seller_id, c.commodity,
                   c.grade, c.season, c.tonnes, c.price_ex_gst, c.brokerage_rate,
                   c.brokerage_payable_by, c.delivery_destination, c.delivery_option, c.notes,
                   c.xero_invoice_id, c.xero_invoice_number, c.status, c.is_deleted, c.deleted_at,
                   c.created_at, c.updated_at,
                   b.id AS b_id, b.name AS b_name, b.abn AS b_abn, b.email AS b_email,
                   b.account_number AS b_account_number, b.office_address AS b_office_address,
                   b.phone_number AS b_phone_number, b.is_deleted AS b_is_deleted,
                   b.deleted_at AS b_deleted_at, b.created_at AS b_created_at,
                   s.id AS s_id, s.legal_name AS s_legal_name, s.abn AS s_abn, s.email AS s_email,
                   s.account_number AS s_account_number, s.address AS s_address,
                   s.main_ngr AS s_main_ngr, s.phone_number AS s_phone_number,
                   s.is_deleted AS s_is_deleted, s.deleted_at AS s_deleted_at,
                   s.created_at AS s_created_at
            FROM contracts c
            LEFT JOIN buyers b ON b.id = c.buyer_id
            LEFT JOIN sellers s ON s.id = c.seller_id
            WHERE c.id = ANY($1) AND c.is_deleted = FALSE
            "#,
        )
        .bind(ids)
        .map(map_contract_with_parties)
        .fetch_all(&self.state.pool)
        .await?;
        Ok(rows)
    }

    async fn persist_linkage(
        &self,
        ids: &[Uuid],
        invoice_id: &str,
        invoice_number: Option<&str>,
    ) -> Result<(), ServiceError> {
        sqlx::query(
            "UPDATE contracts
             SET xero_invoice_id=$1, xero_invoice_number=$2, status='Invoiced', updated_at=$3
             WHERE id = ANY($4)",
        )
        .bind(invoice_id)
        .bind(invoice_number)
        .bind(Utc::now())
        .bind(ids)
        .execute(&self.state.pool)
        .await?;
        Ok(())
    }

    async fn clear_linkage(&self, ids: &[Uuid]) -> Result<(), ServiceError> {
        sqlx::query(
            "UPDATE contracts
             SET xero_invoice_id=NULL, xero_invoice_number=NULL, updated_at=$1
             WHERE id = ANY($2)",
        )
        .bind(Utc::now())
        .bind(ids)
        .execute(&self.state.pool)
        .await?;
        Ok(())
    }

    /// "GST on Income" by name, else the OUTPUT tax type, else the first
    /// rate. Lookup failures fall back to a sentinel the provider
    /// back-fills; auth failures still surface as reconnection.
    async fn default_tax_type(&self, creds: &ApiCredentials) -> Result<String, ServiceError> {
        match self.state.xero.tax_rates(creds).await {
            Ok(rates) => Ok(rates
                .iter()
                .find(|rate| rate.name.as_deref() == Some("GST on Income"))
                .or_else(|| rates.iter().find(|rate| rate.tax_type.as_deref() == Some("OUTPUT")))
                .or_else(|| rates.first())
                .and_then(|rate| rate.tax_type.clone())
                .unwrap_or_else(|| FALLBACK_TAX_TYPE.to_string())),
            Err(err) if err.is_auth() => Err(err.into()),
            Err(err) => {
                warn!(error = %err, "failed to fetch tax rates, using fallback tax type");
                Ok(FALLBACK_TAX_TYPE.to_string())
            }
        }
    }

    /// First revenue account with a code, else an account named like
    /// "sales", else the first account.
    async fn default_revenue_account(&self, creds: &ApiCredentials) -> Result<String, ServiceError> {
        match self.state.xero.accounts(creds).await {
            Ok(accounts) => Ok(accounts
                .iter()
                .find(|acc| acc.account_type.as_deref() == Some("REVENUE") && acc.code.is_some())
                .or_else(|| {
                    accounts.iter().find(|acc| {
                        acc.name
                            .as_deref()
                            .map(|name| name.to_lowercase().contains("sales"))
                            .unwrap_or(false)
                    })
                })
                .or_else(|| accounts.first())
                .and_then(|acc| acc.code.clone())
                .unwrap_or_else(|| FALLBACK_REVENUE_ACCOUNT.to_string())),
            Err(err) if err.is_auth() => Err(err.into()),
            Err(err) => {
                warn!(error = %err, "failed to fetch accounts, using fallback revenue account");
                Ok(FALLBACK_REVENUE_ACCOUNT.to_string())
            }
        }
    }
}

pub fn invoice_view_url(invoice_id: &str) -> String {
    format!(
        "https://go.xero.com/AccountsReceivable/View.aspx?InvoiceID={}",
        invoice_id
    )
}

/// Recipient for the whole batch: routed by the first contract's
/// brokerage-payable-by value, then validated for completeness and
/// consistency across the batch.
pub fn select_recipient(
    contracts: &[ContractWithParties],
) -> Result<InvoiceRecipient, ServiceError> {
    let first = match contracts.first() {
        Some(first) => first,
        None => return Err(ServiceError::NotFound),
    };

    let party = if first.contract.routes_to_seller() {
        "Seller"
    } else {
        "Buyer"
    };

    let recipient = first.recipient().ok_or_else(|| incomplete(party))?;
    if recipient.email.trim().is_empty() || recipient.name.trim().is_empty() {
        return Err(incomplete(party));
    }

    let first_email = recipient.email.trim().to_lowercase();
    for other in &contracts[1..] {
        let other_email = other
            .recipient()
            .map(|r| r.email.trim().to_lowercase())
            .unwrap_or_default();
        if other_email != first_email {
            return Err(ServiceError::Validation(
                "All contracts in one invoice must share the same recipient".to_string(),
            ));
        }
    }

    Ok(recipient)
}

fn incomplete(party: &str) -> ServiceError {
    ServiceError::Validation(format!(
        "{} information is incomplete. Name and email are required.",
        party
    ))
}

/// Some(id) when every contract in the batch is linked to the same external
/// invoice; any unlinked or divergent contract means a fresh invoice.
pub fn shared_linked_invoice(contracts: &[ContractWithParties]) -> Option<String> {
    let mut shared: Option<&str> = None;
    for contract in contracts {
        let id = contract.contract.linked_invoice_id()?;
        match shared {
            None => shared = Some(id),
            Some(existing) if existing == id => {}
            Some(_) => return None,
        }
    }
    shared.map(|id| id.to_string())
}

fn map_contract_with_parties(row: PgRow) -> ContractWithParties {
    let contract = Contract {
        id: row.get("id"),
        contract_number: row.get("contract_number"),
        contract_date: row.get("contract_date"),
        buyer_id: row.get("buyer_id"),
        seller_id: row.get("seller_id"),
        commodity: row.get("commodity"),
        grade: row.get("grade"),
        season: row.get("season"),
        tonnes: row.get("tonnes"),
        price_ex_gst: row.get("price_ex_gst"),
        brokerage_rate: row.get("brokerage_rate"),
        brokerage_payable_by: row.get("brokerage_payable_by"),
        delivery_destination: row.get("delivery_destination"),
        delivery_option: row.get("delivery_option"),
        notes: row.get("notes"),
        xero_invoice_id: row.get("xero_invoice_id"),
        xero_invoice_number: row.get("xero_invoice_number"),
        status: row.get("status"),
        is_deleted: row.get("is_deleted"),
        deleted_at: row.get("deleted_at"),
        created_at: row.get("created_at"),
        updated_at: row.get("updated_at"),
    };

    let buyer = row
        .get::<Option<Uuid>, _>("b_id")
        .map(|buyer_id| Buyer {
            id: buyer_id,
            name: row.get("b_name"),
            abn: row.get("b_abn"),
            email: row.get("b_email"),
            account_number: row.get("b_account_number"),
            office_address: row.get("b_office_address"),
            phone_number: row.get("b_phone_number"),
            is_deleted: row.get("b_is_deleted"),
            deleted_at: row.get("b_deleted_at"),
            created_at: row.get("b_created_at"),
        });

    let seller = row
        .get::<Option<Uuid>, _>("s_id")
        .map(|seller_id| Seller {
            id: seller_id,
            legal_name: row.get("s_legal_name"),
            abn: row.get("s_abn"),
            email: row.get("s_email"),
            account_number: row.get("s_account_number"),
            address: row.get("s_address"),
            main_ngr: row.get("s_main_ngr"),
            phone_number: row.get("s_phone_number"),
            is_deleted: row.get("s_is_deleted"),
            deleted_at: row.get("s_deleted_at"),
            created_at: row.get("s_created_at"),
        });

    ContractWithParties {
        contract,
        buyer,
        seller,
    }
}
