//! Licenseward - a multi-tenant licensing and subscription-billing engine
//!
//! Licenseward owns the commercial state of a SaaS product: which plan each
//! tenant company is on, which add-ons they bought, how much of their quotas
//! they have used, and how payments flowing through external gateways map
//! back onto entitlements.
//!
//! # Features
//!
//! - **Catalog**: plans and add-ons with quota limits and feature modules
//! - **Licenses**: per-tenant state machine with a full audit trail
//! - **Proration**: mid-cycle charges with fixed 30/365-day cycles
//! - **Limits**: quota enforcement with warning thresholds
//! - **Gateways**: pluggable adapters with HMAC-verified event handling
//! - **Reconciliation**: idempotent, atomic payment-to-entitlement commits
//! - **Jobs**: counter resets, trial expiry, renewals, usage reconciliation
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use licenseward::{
//!     Catalog, EngineConfig, LimitKey, PurchaseManager, SubscriptionType,
//! };
//! use licenseward::gateway::AdapterRegistry;
//! use licenseward::storage::memory::InMemoryEngineStore;
//! use rust_decimal_macros::dec;
//!
//! #[tokio::main]
//! async fn main() {
//!     licenseward::init_tracing();
//!
//!     let catalog = Catalog::builder()
//!         .plan("basic")
//!             .monthly_price(dec!(29))
//!             .limit(LimitKey::Users, 5)
//!             .done()
//!         .build();
//!
//!     let store = Arc::new(InMemoryEngineStore::new());
//!     let manager = PurchaseManager::new(
//!         store,
//!         catalog,
//!         AdapterRegistry::new(),
//!         EngineConfig::default(),
//!     );
//!
//!     manager
//!         .signup_trial("acme", "basic", SubscriptionType::Monthly, 14)
//!         .await
//!         .unwrap();
//! }
//! ```

pub mod catalog;
pub mod config;
mod error;
pub mod external;
pub mod gateway;
pub mod jobs;
pub mod license;
pub mod limiter;
pub mod payment;
pub mod proration;
pub mod purchase;
pub mod reconcile;
pub mod storage;
pub mod summary;

// Re-exports for the public API
pub use catalog::{AddOn, Catalog, CatalogBuilder, LimitKey, ModuleSet, Plan, UNLIMITED};
pub use config::{EngineConfig, EngineConfigBuilder};
pub use error::{LicensingError, Result};
pub use external::{Company, CompanyDirectory, InvoiceGenerator, InvoiceRef, Notifier, UsageSource};
pub use gateway::{GatewayAdapter, PaymentEvent, PaymentOutcome};
pub use license::{AddOnGrant, AuditAction, AuditEntry, License, LicenseState};
pub use limiter::{LimitCheck, UsageLimiter};
pub use payment::{Gateway, Payment, PaymentConcept, PaymentState};
pub use proration::{IvaBreakdown, SubscriptionType};
pub use purchase::{PlanChangeOutcome, PurchaseManager};
pub use reconcile::{ReconcileOutcome, ReconciliationCoordinator};
pub use storage::{EngineStore, LicenseStore, PaymentStore};
pub use summary::{BillingStatement, BillingSummary};

use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

/// Initialize tracing/logging with sensible defaults
///
/// This should be called early in your application, typically in main().
///
/// # Environment Variables
///
/// - `RUST_LOG`: Set log level (e.g., "info", "debug", "licenseward=debug")
/// - `LICENSEWARD_LOG_JSON`: Set to "true" for JSON formatted logs
pub fn init_tracing() {
    let env_filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let json_logs = std::env::var("LICENSEWARD_LOG_JSON")
        .map(|v| v.parse::<bool>().unwrap_or(false))
        .unwrap_or(false);

    if json_logs {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer().json())
            .init();
    } else {
        tracing_subscriber::registry()
            .with(env_filter)
            .with(tracing_subscriber::fmt::layer())
            .init();
    }
}
