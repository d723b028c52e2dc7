use std::str::FromStr;

use chrono::{DateTime, NaiveDate, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// One stored OAuth credential set for the connected Xero organisation.
/// The most recently updated row is authoritative; the callback flow wipes
/// prior rows before inserting a new one.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct TokenRecord {
    pub id: Uuid,
    pub access_token: String,
    pub refresh_token: String,
    pub expires_at: DateTime<Utc>,
    pub tenant_id: String,
    pub tenant_name: Option<String>,
    pub id_token: Option<String>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Buyer {
    pub id: Uuid,
    pub name: String,
    pub abn: Option<String>,
    pub email: Option<String>,
    pub account_number: Option<String>,
    pub office_address: Option<String>,
    pub phone_number: Option<String>,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Seller {
    pub id: Uuid,
    pub legal_name: String,
    pub abn: Option<String>,
    pub email: Option<String>,
    pub account_number: Option<String>,
    pub address: Option<String>,
    pub main_ngr: Option<String>,
    pub phone_number: Option<String>,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum ContractStatus {
    Draft,
    Incomplete,
    Complete,
    Invoiced,
}

impl ContractStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContractStatus::Draft => "Draft",
            ContractStatus::Incomplete => "Incomplete",
            ContractStatus::Complete => "Complete",
            ContractStatus::Invoiced => "Invoiced",
        }
    }
}

impl FromStr for ContractStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "draft" => Ok(ContractStatus::Draft),
            "incomplete" => Ok(ContractStatus::Incomplete),
            "complete" => Ok(ContractStatus::Complete),
            "invoiced" => Ok(ContractStatus::Invoiced),
            other => Err(format!("unsupported contract status: {}", other)),
        }
    }
}

/// Which party the brokerage fee is charged to. The spellings match the
/// values captured when the contract is entered.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum BrokeragePayableBy {
    Buyer,
    Seller,
    BuyerAndSeller,
    SellerAndBuyer,
    NoBrokeragePayable,
}

impl BrokeragePayableBy {
    pub fn as_str(&self) -> &'static str {
        match self {
            BrokeragePayableBy::Buyer => "Buyer",
            BrokeragePayableBy::Seller => "Seller",
            BrokeragePayableBy::BuyerAndSeller => "Buyer & Seller",
            BrokeragePayableBy::SellerAndBuyer => "Seller & Buyer",
            BrokeragePayableBy::NoBrokeragePayable => "No Brokerage Payable",
        }
    }

    /// Split spellings halve the computed brokerage figure.
    pub fn is_split(&self) -> bool {
        matches!(
            self,
            BrokeragePayableBy::BuyerAndSeller | BrokeragePayableBy::SellerAndBuyer
        )
    }
}

impl FromStr for BrokeragePayableBy {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_lowercase().as_str() {
            "buyer" => Ok(BrokeragePayableBy::Buyer),
            "seller" => Ok(BrokeragePayableBy::Seller),
            "buyer & seller" => Ok(BrokeragePayableBy::BuyerAndSeller),
            "seller & buyer" => Ok(BrokeragePayableBy::SellerAndBuyer),
            "no brokerage payable" => Ok(BrokeragePayableBy::NoBrokeragePayable),
            other => Err(format!("unsupported brokerage payable value: {}", other)),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Contract {
    pub id: Uuid,
    pub contract_number: String,
    pub contract_date: NaiveDate,
    pub buyer_id: Option<Uuid>,
    pub seller_id: Option<Uuid>,
    pub commodity: Option<String>,
    pub grade: Option<String>,
    pub season: Option<String>,
    pub tonnes: f64,
    pub price_ex_gst: f64,
    pub brokerage_rate: f64,
    pub brokerage_payable_by: String,
    pub delivery_destination: Option<String>,
    pub delivery_option: Option<String>,
    pub notes: Option<String>,
    pub xero_invoice_id: Option<String>,
    pub xero_invoice_number: Option<String>,
    pub status: String,
    pub is_deleted: bool,
    pub deleted_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Contract {
    pub fn brokerage_payable_by(&self) -> BrokeragePayableBy {
        self.brokerage_payable_by
            .parse()
            .unwrap_or(BrokeragePayableBy::Buyer)
    }

    /// Invoice recipient routing: any stored spelling mentioning the seller
    /// sends the invoice to the seller, everything else to the buyer. The
    /// match is on the raw column value so legacy spellings outside the
    /// known set still route correctly.
    pub fn routes_to_seller(&self) -> bool {
        self.brokerage_payable_by
            .to_ascii_lowercase()
            .contains("seller")
    }

    /// A contract is linked once a non-empty external invoice id is stored.
    pub fn linked_invoice_id(&self) -> Option<&str> {
        self.xero_invoice_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
    }
}

/// A contract joined with the parties it references, as the invoicing flow
/// consumes it.
#[derive(Debug, Clone)]
pub struct ContractWithParties {
    pub contract: Contract,
    pub buyer: Option<Buyer>,
    pub seller: Option<Seller>,
}

/// The party an invoice is addressed to, projected from the buyer or seller
/// record depending on who the brokerage is payable by.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InvoiceRecipient {
    pub name: String,
    pub email: String,
}

impl ContractWithParties {
    pub fn recipient(&self) -> Option<InvoiceRecipient> {
        if self.contract.routes_to_seller() {
            self.seller.as_ref().map(|seller| InvoiceRecipient {
                name: seller.legal_name.clone(),
                email: seller.email.clone().unwrap_or_default(),
            })
        } else {
            self.buyer.as_ref().map(|buyer| InvoiceRecipient {
                name: buyer.name.clone(),
                email: buyer.email.clone().unwrap_or_default(),
            })
        }
    }
}

/// Invoice status mirrored from the external system. Draft and Submitted
/// invoices can still be replaced in place; the rest are locked.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub enum InvoiceStatus {
    Draft,
    Submitted,
    Authorised,
    Paid,
    Voided,
}

impl InvoiceStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            InvoiceStatus::Draft => "DRAFT",
            InvoiceStatus::Submitted => "SUBMITTED",
            InvoiceStatus::Authorised => "AUTHORISED",
            InvoiceStatus::Paid => "PAID",
            InvoiceStatus::Voided => "VOIDED",
        }
    }

    pub fn is_locked(&self) -> bool {
        matches!(
            self,
            InvoiceStatus::Authorised | InvoiceStatus::Paid | InvoiceStatus::Voided
        )
    }
}

impl FromStr for InvoiceStatus {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim().to_ascii_uppercase().as_str() {
            "DRAFT" => Ok(InvoiceStatus::Draft),
            "SUBMITTED" => Ok(InvoiceStatus::Submitted),
            "AUTHORISED" => Ok(InvoiceStatus::Authorised),
            "PAID" => Ok(InvoiceStatus::Paid),
            "VOIDED" => Ok(InvoiceStatus::Voided),
            other => Err(format!("unsupported invoice status: {}", other)),
        }
    }
}
