//! Collaborator interfaces owned by the host application.
//!
//! The engine never renders invoices, sends email or counts tenant rows
//! itself; it calls these traits and the host wires in real implementations.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::catalog::LimitKey;
use crate::error::Result;

/// Company master data, as the host application knows it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Company {
    pub id: String,
    pub name: String,
    pub tax_id: String,
    pub billing_address: String,
    pub email: String,
}

/// Lookup of company master data.
#[async_trait]
pub trait CompanyDirectory: Send + Sync {
    async fn get_company(&self, company_id: &str) -> Result<Option<Company>>;
}

/// Authoritative counts of tenant resources, for usage reconciliation.
#[async_trait]
pub trait UsageSource: Send + Sync {
    /// Count the live resources behind a usage counter (active users,
    /// open projects, ...).
    async fn count_active_resources(&self, company_id: &str, key: LimitKey) -> Result<i64>;
}

/// Reference to a generated invoice.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InvoiceRef {
    pub id: String,
    pub payment_id: Uuid,
}

/// Invoice rendering, owned by the host.
#[async_trait]
pub trait InvoiceGenerator: Send + Sync {
    async fn generate_invoice(&self, company_id: &str, payment_id: Uuid) -> Result<InvoiceRef>;
}

/// Tenant-facing notifications, owned by the host.
#[async_trait]
pub trait Notifier: Send + Sync {
    async fn send_invoice_email(&self, company_id: &str, invoice: &InvoiceRef) -> Result<()>;

    async fn send_payment_confirmation(&self, company_id: &str, payment_id: Uuid) -> Result<()>;
}

/// Invoice generator that records nothing. Suitable until the host wires in
/// a real renderer.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpInvoiceGenerator;

#[async_trait]
impl InvoiceGenerator for NoOpInvoiceGenerator {
    async fn generate_invoice(&self, _company_id: &str, payment_id: Uuid) -> Result<InvoiceRef> {
        Ok(InvoiceRef {
            id: format!("noop-{payment_id}"),
            payment_id,
        })
    }
}

/// Notifier that drops everything.
#[derive(Debug, Clone, Copy, Default)]
pub struct NoOpNotifier;

#[async_trait]
impl Notifier for NoOpNotifier {
    async fn send_invoice_email(&self, _company_id: &str, _invoice: &InvoiceRef) -> Result<()> {
        Ok(())
    }

    async fn send_payment_confirmation(&self, _company_id: &str, _payment_id: Uuid) -> Result<()> {
        Ok(())
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod test {
    //! Recording collaborators for tests.

    use std::collections::HashMap;
    use std::sync::Mutex;

    use super::*;

    /// [`CompanyDirectory`] over a fixed map.
    #[derive(Debug, Default)]
    pub struct StaticDirectory {
        companies: HashMap<String, Company>,
    }

    impl StaticDirectory {
        #[must_use]
        pub fn with(companies: Vec<Company>) -> Self {
            Self {
                companies: companies.into_iter().map(|c| (c.id.clone(), c)).collect(),
            }
        }
    }

    #[async_trait]
    impl CompanyDirectory for StaticDirectory {
        async fn get_company(&self, company_id: &str) -> Result<Option<Company>> {
            Ok(self.companies.get(company_id).cloned())
        }
    }

    /// [`UsageSource`] over scripted counts.
    #[derive(Debug, Default)]
    pub struct StaticUsageSource {
        counts: Mutex<HashMap<(String, LimitKey), i64>>,
    }

    impl StaticUsageSource {
        pub fn set_count(&self, company_id: &str, key: LimitKey, count: i64) {
            self.counts
                .lock()
                .unwrap()
                .insert((company_id.to_string(), key), count);
        }
    }

    #[async_trait]
    impl UsageSource for StaticUsageSource {
        async fn count_active_resources(&self, company_id: &str, key: LimitKey) -> Result<i64> {
            Ok(self
                .counts
                .lock()
                .unwrap()
                .get(&(company_id.to_string(), key))
                .copied()
                .unwrap_or(0))
        }
    }

    /// [`InvoiceGenerator`] that records every call.
    #[derive(Debug, Default)]
    pub struct RecordingInvoiceGenerator {
        pub generated: Mutex<Vec<InvoiceRef>>,
        pub fail: Mutex<bool>,
    }

    impl RecordingInvoiceGenerator {
        /// Make every subsequent call fail.
        pub fn fail_all(&self) {
            *self.fail.lock().unwrap() = true;
        }
    }

    #[async_trait]
    impl InvoiceGenerator for RecordingInvoiceGenerator {
        async fn generate_invoice(
            &self,
            _company_id: &str,
            payment_id: Uuid,
        ) -> Result<InvoiceRef> {
            if *self.fail.lock().unwrap() {
                return Err(crate::error::LicensingError::Internal(
                    "invoice renderer down".to_string(),
                ));
            }
            let invoice = InvoiceRef {
                id: format!("INV-{}", self.generated.lock().unwrap().len() + 1),
                payment_id,
            };
            self.generated.lock().unwrap().push(invoice.clone());
            Ok(invoice)
        }
    }

    /// [`Notifier`] that records every call.
    #[derive(Debug, Default)]
    pub struct RecordingNotifier {
        pub invoice_emails: Mutex<Vec<(String, String)>>,
        pub confirmations: Mutex<Vec<(String, Uuid)>>,
    }

    #[async_trait]
    impl Notifier for RecordingNotifier {
        async fn send_invoice_email(&self, company_id: &str, invoice: &InvoiceRef) -> Result<()> {
            self.invoice_emails
                .lock()
                .unwrap()
                .push((company_id.to_string(), invoice.id.clone()));
            Ok(())
        }

        async fn send_payment_confirmation(
            &self,
            company_id: &str,
            payment_id: Uuid,
        ) -> Result<()> {
            self.confirmations
                .lock()
                .unwrap()
                .push((company_id.to_string(), payment_id));
            Ok(())
        }
    }
}
