//! Persistence traits for licenses and payments.
//!
//! Implementations must honor two properties the engine depends on:
//! usage increments are atomic read-modify-write operations, and
//! `commit_reconciliation` persists a payment and its license together or
//! not at all.

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::catalog::LimitKey;
use crate::error::Result;
use crate::license::License;
use crate::payment::{Gateway, Payment, PaymentState};

/// License persistence with optimistic concurrency.
#[async_trait]
pub trait LicenseStore: Send + Sync {
    /// Fetch a tenant's license.
    async fn get_license(&self, company_id: &str) -> Result<Option<License>>;

    /// Insert a new license.
    async fn create_license(&self, license: &License) -> Result<()>;

    /// Unconditional save. Prefer [`Self::compare_and_save_license`] for any
    /// write that races with reconciliation.
    async fn save_license(&self, license: &License) -> Result<()>;

    /// Save only if the stored version still matches `expected_version`.
    /// Returns false on a version mismatch.
    async fn compare_and_save_license(
        &self,
        license: &License,
        expected_version: u64,
    ) -> Result<bool>;

    /// Atomically add `amount` to a usage counter and return the new value.
    async fn increment_usage(&self, company_id: &str, key: LimitKey, amount: i64) -> Result<i64>;

    /// Overwrite a usage counter (counter resets, external reconciliation).
    async fn set_usage(&self, company_id: &str, key: LimitKey, value: i64) -> Result<()>;

    /// All licenses, for scheduled jobs.
    async fn list_licenses(&self) -> Result<Vec<License>>;
}

/// Payment persistence.
#[async_trait]
pub trait PaymentStore: Send + Sync {
    async fn create_payment(&self, payment: &Payment) -> Result<()>;

    async fn save_payment(&self, payment: &Payment) -> Result<()>;

    async fn get_payment(&self, id: uuid::Uuid) -> Result<Option<Payment>>;

    /// Look up by the merchant reference events correlate on.
    async fn get_payment_by_external(
        &self,
        gateway: Gateway,
        external_transaction_id: &str,
    ) -> Result<Option<Payment>>;

    /// Pending payments created before `older_than`, for the sweep job.
    async fn list_pending_payments(&self, older_than: DateTime<Utc>) -> Result<Vec<Payment>>;
}

/// Combined store with an atomic payment-plus-license commit.
#[async_trait]
pub trait EngineStore: LicenseStore + PaymentStore {
    /// Persist the payment and the license as one unit, conditional on the
    /// license version. Returns false (persisting neither) on a version
    /// mismatch.
    async fn commit_reconciliation(
        &self,
        payment: &Payment,
        license: &License,
        expected_license_version: u64,
    ) -> Result<bool>;
}

pub mod memory {
    //! In-memory store for tests, demos and single-process deployments.

    use std::collections::HashMap;
    use std::sync::Arc;

    use tokio::sync::RwLock;

    use super::*;
    use crate::error::LicensingError;

    #[derive(Debug, Default)]
    struct Inner {
        licenses: HashMap<String, License>,
        payments: HashMap<uuid::Uuid, Payment>,
    }

    /// [`EngineStore`] backed by process memory.
    ///
    /// Clones share state. Version counters are bumped on every license
    /// write, matching what a database trigger or `UPDATE ... WHERE version`
    /// clause would do.
    #[derive(Debug, Clone, Default)]
    pub struct InMemoryEngineStore {
        inner: Arc<RwLock<Inner>>,
    }

    impl InMemoryEngineStore {
        #[must_use]
        pub fn new() -> Self {
            Self::default()
        }
    }

    #[async_trait]
    impl LicenseStore for InMemoryEngineStore {
        async fn get_license(&self, company_id: &str) -> Result<Option<License>> {
            Ok(self.inner.read().await.licenses.get(company_id).cloned())
        }

        async fn create_license(&self, license: &License) -> Result<()> {
            let mut inner = self.inner.write().await;
            if inner.licenses.contains_key(&license.company_id) {
                return Err(LicensingError::Storage(format!(
                    "license already exists for company {}",
                    license.company_id
                )));
            }
            let mut stored = license.clone();
            stored.version = 1;
            inner.licenses.insert(stored.company_id.clone(), stored);
            Ok(())
        }

        async fn save_license(&self, license: &License) -> Result<()> {
            let mut inner = self.inner.write().await;
            let mut stored = license.clone();
            stored.version = license.version + 1;
            inner.licenses.insert(stored.company_id.clone(), stored);
            Ok(())
        }

        async fn compare_and_save_license(
            &self,
            license: &License,
            expected_version: u64,
        ) -> Result<bool> {
            let mut inner = self.inner.write().await;
            match inner.licenses.get(&license.company_id) {
                Some(current) if current.version != expected_version => Ok(false),
                Some(_) => {
                    let mut stored = license.clone();
                    stored.version = expected_version + 1;
                    inner.licenses.insert(stored.company_id.clone(), stored);
                    Ok(true)
                }
                None => Err(LicensingError::LicenseNotFound {
                    company_id: license.company_id.clone(),
                }),
            }
        }

        async fn increment_usage(
            &self,
            company_id: &str,
            key: LimitKey,
            amount: i64,
        ) -> Result<i64> {
            let mut inner = self.inner.write().await;
            let license = inner.licenses.get_mut(company_id).ok_or_else(|| {
                LicensingError::LicenseNotFound {
                    company_id: company_id.to_string(),
                }
            })?;
            let counter = license.usage.entry(key).or_insert(0);
            *counter += amount;
            let value = *counter;
            license.version += 1;
            Ok(value)
        }

        async fn set_usage(&self, company_id: &str, key: LimitKey, value: i64) -> Result<()> {
            let mut inner = self.inner.write().await;
            let license = inner.licenses.get_mut(company_id).ok_or_else(|| {
                LicensingError::LicenseNotFound {
                    company_id: company_id.to_string(),
                }
            })?;
            license.usage.insert(key, value);
            license.version += 1;
            Ok(())
        }

        async fn list_licenses(&self) -> Result<Vec<License>> {
            Ok(self.inner.read().await.licenses.values().cloned().collect())
        }
    }

    #[async_trait]
    impl PaymentStore for InMemoryEngineStore {
        async fn create_payment(&self, payment: &Payment) -> Result<()> {
            let mut inner = self.inner.write().await;
            if inner.payments.contains_key(&payment.id) {
                return Err(LicensingError::Storage(format!(
                    "payment {} already exists",
                    payment.id
                )));
            }
            inner.payments.insert(payment.id, payment.clone());
            Ok(())
        }

        async fn save_payment(&self, payment: &Payment) -> Result<()> {
            self.inner
                .write()
                .await
                .payments
                .insert(payment.id, payment.clone());
            Ok(())
        }

        async fn get_payment(&self, id: uuid::Uuid) -> Result<Option<Payment>> {
            Ok(self.inner.read().await.payments.get(&id).cloned())
        }

        async fn get_payment_by_external(
            &self,
            gateway: Gateway,
            external_transaction_id: &str,
        ) -> Result<Option<Payment>> {
            Ok(self
                .inner
                .read()
                .await
                .payments
                .values()
                .find(|p| {
                    p.gateway == gateway && p.external_transaction_id == external_transaction_id
                })
                .cloned())
        }

        async fn list_pending_payments(&self, older_than: DateTime<Utc>) -> Result<Vec<Payment>> {
            Ok(self
                .inner
                .read()
                .await
                .payments
                .values()
                .filter(|p| p.state == PaymentState::Pending && p.created_at < older_than)
                .cloned()
                .collect())
        }
    }

    #[async_trait]
    impl EngineStore for InMemoryEngineStore {
        async fn commit_reconciliation(
            &self,
            payment: &Payment,
            license: &License,
            expected_license_version: u64,
        ) -> Result<bool> {
            let mut inner = self.inner.write().await;
            match inner.licenses.get(&license.company_id) {
                Some(current) if current.version != expected_license_version => Ok(false),
                Some(_) => {
                    let mut stored = license.clone();
                    stored.version = expected_license_version + 1;
                    inner.licenses.insert(stored.company_id.clone(), stored);
                    inner.payments.insert(payment.id, payment.clone());
                    Ok(true)
                }
                None => Err(LicensingError::LicenseNotFound {
                    company_id: license.company_id.clone(),
                }),
            }
        }
    }

}
