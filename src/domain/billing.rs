use tracing::warn;

use super::models::ContractWithParties;

/// One billable row submitted to the accounting provider.
#[derive(Debug, Clone, PartialEq)]
pub struct LineItem {
    pub description: String,
    pub quantity: f64,
    pub unit_amount: f64,
    pub tax_type: String,
    pub account_code: String,
}

/// Result of building line items for a set of contracts. `degraded` marks
/// that at least one contract could not be billed and was replaced by a
/// zero-amount sentinel row; the zero-total guard downstream refuses to
/// submit such an invoice.
#[derive(Debug, Clone)]
pub struct BuiltLines {
    pub items: Vec<LineItem>,
    pub total: f64,
    pub brokerage_total: f64,
    pub degraded: bool,
}

/// Brokerage earned on one contract: price × tonnes × rate%, halved when the
/// fee is split between the parties. Informational only — the billed unit
/// amount is the contract's ex-GST price, not this figure.
pub fn brokerage_amount(contract: &ContractWithParties) -> f64 {
    let c = &contract.contract;
    let total = c.price_ex_gst * c.tonnes * c.brokerage_rate / 100.0;
    if c.brokerage_payable_by().is_split() {
        total / 2.0
    } else {
        total
    }
}

/// Builds the single line item for one contract. A contract whose pricing
/// cannot produce a billable row yields a zero-amount "Brokerage Fee"
/// sentinel instead of an error, so callers always receive a usable list.
pub fn build_line_item(
    contract: &ContractWithParties,
    tax_type: &str,
    account_code: &str,
) -> (LineItem, bool) {
    let c = &contract.contract;

    if !c.price_ex_gst.is_finite() || c.price_ex_gst < 0.0 || !c.tonnes.is_finite() {
        warn!(
            contract_number = %c.contract_number,
            price_ex_gst = c.price_ex_gst,
            tonnes = c.tonnes,
            "contract pricing unusable, emitting zero-amount sentinel line"
        );
        return (
            LineItem {
                description: format!("Contract {} - Brokerage Fee", c.contract_number),
                quantity: 1.0,
                unit_amount: 0.0,
                tax_type: tax_type.to_string(),
                account_code: account_code.to_string(),
            },
            true,
        );
    }

    let seller_name = contract
        .seller
        .as_ref()
        .map(|s| s.legal_name.as_str())
        .unwrap_or("Unknown");
    let buyer_name = contract
        .buyer
        .as_ref()
        .map(|b| b.name.as_str())
        .unwrap_or("Unknown");

    let mut parts = vec![
        format!("Contract: {}", c.contract_number),
        format!("{}mt {}", c.tonnes, c.grade.as_deref().unwrap_or("")),
        format!("Seller: {}", seller_name),
        format!("Buyer: {}", buyer_name),
    ];
    if let Some(destination) = c.delivery_destination.as_deref().filter(|s| !s.is_empty()) {
        parts.push(format!("Destination: {}", destination));
    }
    if let Some(option) = c.delivery_option.as_deref().filter(|s| !s.is_empty()) {
        parts.push(format!("Delivery: {}", option));
    }
    if let Some(notes) = c.notes.as_deref().filter(|s| !s.is_empty()) {
        parts.push(format!("Notes: {}", notes));
    }

    (
        LineItem {
            description: parts.join(" | "),
            // quantity stays 1: the amount is already aggregated into the
            // unit amount, the provider derives GST from the tax type.
            quantity: 1.0,
            unit_amount: c.price_ex_gst,
            tax_type: tax_type.to_string(),
            account_code: account_code.to_string(),
        },
        false,
    )
}

/// Builds line items for a batch of contracts sharing one recipient and sums
/// the billable total.
pub fn build_for_contracts(
    contracts: &[ContractWithParties],
    tax_type: &str,
    account_code: &str,
) -> BuiltLines {
    let mut items = Vec::with_capacity(contracts.len());
    let mut degraded = false;
    let mut brokerage_total = 0.0;

    for contract in contracts {
        let (item, item_degraded) = build_line_item(contract, tax_type, account_code);
        degraded |= item_degraded;
        brokerage_total += brokerage_amount(contract);
        items.push(item);
    }

    let total = items
        .iter()
        .map(|item| item.quantity * item.unit_amount)
        .sum();

    BuiltLines {
        items,
        total,
        brokerage_total,
        degraded,
    }
}
