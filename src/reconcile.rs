//! Gateway event reconciliation.
//!
//! Gateways report payment outcomes asynchronously, out of order and often
//! more than once. The coordinator verifies each event's signature, matches
//! it to a local payment, and commits the payment and the license in one
//! conditional store operation so entitlements can never drift from money.
//!
//! Side effects that follow a confirmation (invoice, email) are best-effort:
//! a failed invoice render never rolls back a settled payment.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::catalog::Catalog;
use crate::config::EngineConfig;
use crate::error::{LicensingError, Result};
use crate::external::{InvoiceGenerator, Notifier};
use crate::gateway::{AdapterRegistry, PaymentEvent, PaymentOutcome};
use crate::license::{AddOnGrant, AuditAction};
use crate::payment::{Gateway, Payment, PaymentState};
use crate::storage::EngineStore;

/// How an event was handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// First delivery: state was advanced.
    Processed,
    /// Duplicate or stale delivery: nothing changed.
    AlreadyProcessed,
    /// No local payment matches the event's reference.
    UnknownPayment,
}

/// Applies gateway payment events to local payments and licenses.
pub struct ReconciliationCoordinator<S, I, N> {
    store: Arc<S>,
    catalog: Catalog,
    adapters: AdapterRegistry,
    invoices: Arc<I>,
    notifier: Arc<N>,
    config: EngineConfig,
}

impl<S, I, N> ReconciliationCoordinator<S, I, N>
where
    S: EngineStore,
    I: InvoiceGenerator,
    N: Notifier,
{
    #[must_use]
    pub fn new(
        store: Arc<S>,
        catalog: Catalog,
        adapters: AdapterRegistry,
        invoices: Arc<I>,
        notifier: Arc<N>,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            catalog,
            adapters,
            invoices,
            notifier,
            config,
        }
    }

    /// Handle a raw gateway notification.
    ///
    /// Rejects the event before any side effect when the signature does not
    /// verify.
    pub async fn on_payment_event(
        &self,
        gateway: Gateway,
        payload: &[u8],
        signature: &str,
    ) -> Result<ReconcileOutcome> {
        let adapter = self.adapters.get(gateway)?;
        if !adapter.verify_event_signature(payload, signature)? {
            tracing::warn!(gateway = %gateway, "rejected event with invalid signature");
            return Err(LicensingError::InvalidSignature {
                gateway: gateway.to_string(),
            });
        }
        let event = adapter.parse_event(payload)?;
        self.apply_event(&event).await
    }

    /// Apply a verified event.
    pub async fn apply_event(&self, event: &PaymentEvent) -> Result<ReconcileOutcome> {
        let payment = match self
            .store
            .get_payment_by_external(event.gateway, &event.external_transaction_id)
            .await?
        {
            Some(payment) => payment,
            None => {
                // Could be a replay from an old system or a misrouted event.
                // Logged loudly, acknowledged so the gateway stops retrying.
                tracing::error!(
                    gateway = %event.gateway,
                    external_transaction_id = %event.external_transaction_id,
                    outcome = event.outcome.as_str(),
                    "event references no local payment"
                );
                return Ok(ReconcileOutcome::UnknownPayment);
            }
        };

        let target_state = match event.outcome {
            PaymentOutcome::Confirmed => PaymentState::Completed,
            PaymentOutcome::Failed => PaymentState::Failed,
            PaymentOutcome::Refunded => PaymentState::Refunded,
        };
        if payment.state == target_state {
            tracing::debug!(payment_id = %payment.id, "duplicate event ignored");
            return Ok(ReconcileOutcome::AlreadyProcessed);
        }
        // A payment that already failed or was refunded never un-settles.
        if event.outcome == PaymentOutcome::Confirmed && payment.state.is_terminal() {
            tracing::warn!(
                payment_id = %payment.id,
                state = ?payment.state,
                "confirmation for a payment already settled otherwise"
            );
            return Ok(ReconcileOutcome::AlreadyProcessed);
        }

        match event.outcome {
            PaymentOutcome::Confirmed => self.confirm(payment).await,
            PaymentOutcome::Failed => self.fail(payment).await,
            PaymentOutcome::Refunded => self.refund(payment).await,
        }
    }

    /// Query the gateway for payments stuck in `Pending` and resolve the
    /// decided ones. Run periodically.
    pub async fn sweep_unresolved_payments(&self) -> Result<u32> {
        let cutoff = Utc::now()
            - chrono::Duration::from_std(self.config.sweep_min_age)
                .unwrap_or_else(|_| chrono::Duration::minutes(15));
        let pending = self.store.list_pending_payments(cutoff).await?;
        let mut resolved = 0;
        for payment in pending {
            let adapter = match self.adapters.get(payment.gateway) {
                Ok(adapter) => adapter,
                Err(err) => {
                    tracing::error!(payment_id = %payment.id, error = %err, "sweep skipped payment");
                    continue;
                }
            };
            let outcome = match adapter
                .query_payment(&payment.external_transaction_id)
                .await
            {
                Ok(Some(outcome)) => outcome,
                Ok(None) => continue,
                Err(err) => {
                    tracing::warn!(payment_id = %payment.id, error = %err, "sweep query failed");
                    continue;
                }
            };
            let event = PaymentEvent {
                gateway: payment.gateway,
                external_transaction_id: payment.external_transaction_id.clone(),
                outcome,
                raw: serde_json::Value::Null,
            };
            if self.apply_event(&event).await? == ReconcileOutcome::Processed {
                resolved += 1;
            }
        }
        Ok(resolved)
    }

    /// Confirmed payment: apply staged changes and settle, atomically.
    async fn confirm(&self, mut payment: Payment) -> Result<ReconcileOutcome> {
        let now = Utc::now();
        for attempt in 0..self.config.max_retries {
            let mut license = self
                .store
                .get_license(&payment.company_id)
                .await?
                .ok_or_else(|| LicensingError::LicenseNotFound {
                    company_id: payment.company_id.clone(),
                })?;
            let expected_version = license.version;

            let grants = self.resolve_pending_grants(&license, now);
            license.confirm_pending(grants, now);
            payment.transition(PaymentState::Completed);

            if self
                .store
                .commit_reconciliation(&payment, &license, expected_version)
                .await?
            {
                tracing::info!(
                    payment_id = %payment.id,
                    company_id = %payment.company_id,
                    amount = %payment.amount,
                    "payment confirmed and license updated"
                );
                self.post_confirmation(&payment).await;
                return Ok(ReconcileOutcome::Processed);
            }
            tracing::debug!(
                payment_id = %payment.id,
                attempt,
                "reconciliation commit conflicted"
            );
            tokio::time::sleep(self.config.retry_backoff * (attempt + 1)).await;
        }
        Err(LicensingError::RetryLimitExceeded {
            operation: "confirm_payment".to_string(),
        })
    }

    /// Failed payment: settle the payment, audit the failure, keep staged
    /// changes so the tenant can retry with another method.
    async fn fail(&self, mut payment: Payment) -> Result<ReconcileOutcome> {
        let now = Utc::now();
        for attempt in 0..self.config.max_retries {
            let mut license = self
                .store
                .get_license(&payment.company_id)
                .await?
                .ok_or_else(|| LicensingError::LicenseNotFound {
                    company_id: payment.company_id.clone(),
                })?;
            let expected_version = license.version;

            license.audit(
                AuditAction::PaymentFailed,
                format!("payment={} amount={}", payment.id, payment.amount),
                now,
            );
            payment.transition(PaymentState::Failed);

            if self
                .store
                .commit_reconciliation(&payment, &license, expected_version)
                .await?
            {
                tracing::warn!(
                    payment_id = %payment.id,
                    company_id = %payment.company_id,
                    "payment failed"
                );
                return Ok(ReconcileOutcome::Processed);
            }
            tokio::time::sleep(self.config.retry_backoff * (attempt + 1)).await;
        }
        Err(LicensingError::RetryLimitExceeded {
            operation: "fail_payment".to_string(),
        })
    }

    /// Refund: settle the payment record. Entitlements already granted are
    /// not reverted; revocation is an explicit administrative action.
    async fn refund(&self, mut payment: Payment) -> Result<ReconcileOutcome> {
        payment.transition(PaymentState::Refunded);
        self.store.save_payment(&payment).await?;
        tracing::info!(payment_id = %payment.id, "payment refunded");
        Ok(ReconcileOutcome::Processed)
    }

    /// Build grants for staged add-on slugs, skipping anything already
    /// active and anything the catalog no longer knows.
    fn resolve_pending_grants(
        &self,
        license: &crate::license::License,
        now: DateTime<Utc>,
    ) -> Vec<AddOnGrant> {
        license
            .pending_addon_slugs
            .iter()
            .filter(|slug| !license.has_active_addon(slug))
            .filter_map(|slug| {
                let addon = self.catalog.addon(slug);
                if addon.is_none() {
                    tracing::error!(slug, "staged add-on vanished from catalog");
                }
                addon
            })
            .map(|addon| AddOnGrant {
                addon_id: addon.id.clone(),
                slug: addon.slug.clone(),
                quantity: 1,
                monthly_price: addon.monthly_price,
                active: true,
                activated_at: now,
                cancel_at_renewal: false,
                cancelled_at: None,
            })
            .collect()
    }

    /// Invoice and notify after a confirmed payment. Never fails the
    /// reconciliation.
    async fn post_confirmation(&self, payment: &Payment) {
        match self
            .invoices
            .generate_invoice(&payment.company_id, payment.id)
            .await
        {
            Ok(invoice) => {
                let mut updated = payment.clone();
                updated.invoice_ref = Some(invoice.id.clone());
                if let Err(err) = self.store.save_payment(&updated).await {
                    tracing::error!(payment_id = %payment.id, error = %err, "failed to attach invoice ref");
                }
                if let Err(err) = self
                    .notifier
                    .send_invoice_email(&payment.company_id, &invoice)
                    .await
                {
                    tracing::error!(payment_id = %payment.id, error = %err, "invoice email failed");
                }
            }
            Err(err) => {
                tracing::error!(payment_id = %payment.id, error = %err, "invoice generation failed");
            }
        }
        if let Err(err) = self
            .notifier
            .send_payment_confirmation(&payment.company_id, payment.id)
            .await
        {
            tracing::error!(payment_id = %payment.id, error = %err, "payment confirmation failed");
        }
    }
}
