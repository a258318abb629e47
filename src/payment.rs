//! Local payment records.
//!
//! Every charge is recorded locally before the gateway is contacted, so a
//! crash or timeout mid-purchase always leaves a row the sweep job can
//! resolve against the gateway later.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Supported payment gateways.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Gateway {
    /// Card-on-file gateway with server-side confirmation events.
    CardA,
    /// Redirect-based gateway; the tenant completes payment off-site.
    RedirectB,
    /// Wallet gateway with client-side tokens.
    WalletC,
}

impl Gateway {
    /// Convert to string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::CardA => "card_a",
            Self::RedirectB => "redirect_b",
            Self::WalletC => "wallet_c",
        }
    }
}

impl std::fmt::Display for Gateway {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// What a payment was for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentConcept {
    /// Initial subscription or renewal.
    Subscription,
    /// Prorated plan upgrade.
    Upgrade,
    /// Add-on purchase.
    AddOn,
    /// Anything else (manual adjustments, one-off charges).
    Other,
}

/// Lifecycle of a payment record.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentState {
    /// Created locally; gateway not yet confirmed.
    Pending,
    /// Gateway acknowledged but not settled.
    Processing,
    /// Settled successfully.
    Completed,
    /// Declined or abandoned.
    Failed,
    /// Settled then refunded.
    Refunded,
}

impl PaymentState {
    /// Terminal states are never revisited by reconciliation.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Completed | Self::Failed | Self::Refunded)
    }
}

/// A single charge against a tenant.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Payment {
    pub id: Uuid,
    pub gateway: Gateway,
    /// Merchant reference sent to the gateway; events correlate on this.
    pub external_transaction_id: String,
    pub concept: PaymentConcept,
    pub amount: Decimal,
    pub currency: String,
    pub state: PaymentState,
    pub company_id: String,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Set once an invoice has been generated for a completed payment.
    pub invoice_ref: Option<String>,
}

impl Payment {
    /// Create a pending payment record.
    #[must_use]
    pub fn new(
        gateway: Gateway,
        company_id: &str,
        concept: PaymentConcept,
        amount: Decimal,
        currency: &str,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            gateway,
            external_transaction_id: Uuid::new_v4().to_string(),
            concept,
            amount,
            currency: currency.to_string(),
            state: PaymentState::Pending,
            company_id: company_id.to_string(),
            created_at: now,
            updated_at: now,
            invoice_ref: None,
        }
    }

    /// Move to a new state, bumping `updated_at`.
    pub fn transition(&mut self, state: PaymentState) {
        self.state = state;
        self.updated_at = Utc::now();
    }
}
