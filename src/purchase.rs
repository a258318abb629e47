//! Purchase orchestration.
//!
//! Money movement and entitlement changes are deliberately decoupled: every
//! purchase records a local pending payment, asks the gateway to charge, and
//! stages the change on the license. Entitlements are only applied when the
//! gateway confirms the payment (see [`crate::reconcile`]).

use std::collections::HashMap;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use uuid::Uuid;

use crate::catalog::Catalog;
use crate::config::EngineConfig;
use crate::error::{LicensingError, Result};
use crate::gateway::{AdapterRegistry, PurchaseRequest};
use crate::license::{GatewaySubscriptionRef, License};
use crate::payment::{Gateway, Payment, PaymentConcept, PaymentState};
use crate::proration::{apply_iva, cycle_days, days_remaining, prorate, SubscriptionType};
use crate::storage::EngineStore;

/// What a plan change request resolved to.
#[derive(Debug, Clone, PartialEq)]
pub enum PlanChangeOutcome {
    /// Price increase: a charge was initiated and the change is staged
    /// until the gateway confirms it.
    UpgradeInitiated {
        payment_id: Uuid,
        /// Total charged, VAT included.
        amount: Decimal,
        redirect_or_client_token: String,
    },
    /// Price decrease: no charge, applied at the next renewal.
    DowngradeScheduled { effective_at: DateTime<Utc> },
}

/// Orchestrates signups, plan changes, add-on purchases and cancellations.
pub struct PurchaseManager<S> {
    store: Arc<S>,
    catalog: Catalog,
    adapters: AdapterRegistry,
    config: EngineConfig,
}

impl<S: EngineStore> PurchaseManager<S> {
    #[must_use]
    pub fn new(
        store: Arc<S>,
        catalog: Catalog,
        adapters: AdapterRegistry,
        config: EngineConfig,
    ) -> Self {
        Self {
            store,
            catalog,
            adapters,
            config,
        }
    }

    /// Start a trial license on a plan.
    pub async fn signup_trial(
        &self,
        company_id: &str,
        plan_slug: &str,
        subscription_type: SubscriptionType,
        trial_days: i64,
    ) -> Result<License> {
        let plan = self
            .catalog
            .plan(plan_slug)
            .ok_or_else(|| LicensingError::PlanNotFound {
                plan_id: plan_slug.to_string(),
            })?;
        let license =
            License::new_trial(company_id, &plan.id, subscription_type, trial_days, Utc::now());
        self.store.create_license(&license).await?;
        tracing::info!(company_id, plan = plan_slug, trial_days, "trial license created");
        Ok(license)
    }

    /// Change a tenant's plan.
    ///
    /// Upgrades charge the prorated price difference for the rest of the
    /// current cycle (VAT on top) and take effect when the payment confirms.
    /// Downgrades are free and take effect at the next renewal.
    pub async fn change_plan(
        &self,
        company_id: &str,
        new_plan_slug: &str,
        gateway: Gateway,
    ) -> Result<PlanChangeOutcome> {
        let now = Utc::now();
        let license = self.load_current(company_id, now).await?;
        let current_plan = self
            .catalog
            .resolve_plan(&license.plan_id)
            .ok_or_else(|| LicensingError::PlanNotFound {
                plan_id: license.plan_id.clone(),
            })?;
        let new_plan = self
            .catalog
            .plan(new_plan_slug)
            .ok_or_else(|| LicensingError::PlanNotFound {
                plan_id: new_plan_slug.to_string(),
            })?;
        if new_plan.id == license.plan_id {
            return Err(LicensingError::PlanUnchanged {
                plan_id: new_plan_slug.to_string(),
            });
        }

        let subscription_type = license.subscription_type;
        let new_price = new_plan.price(subscription_type);
        let current_price = current_plan.price(subscription_type);

        if !license.is_trial && new_price <= current_price {
            let effective_at = license.renewal_date;
            self.with_license_retry(company_id, "schedule_downgrade", |license| {
                license.schedule_downgrade(&new_plan.id, now)
            })
            .await?;
            tracing::info!(
                company_id,
                plan = new_plan_slug,
                effective = %effective_at.date_naive(),
                "downgrade scheduled"
            );
            return Ok(PlanChangeOutcome::DowngradeScheduled { effective_at });
        }

        // Trials have no paid cycle to credit, so they pay the full price.
        let cycle = cycle_days(subscription_type);
        let base = if license.is_trial {
            new_price
        } else {
            prorate(
                new_price - current_price,
                days_remaining(license.renewal_date, now),
                cycle,
            )
        };
        let breakdown = apply_iva(base, self.config.iva_rate);

        // Dry-run the staging so conflicts surface before money moves; the
        // license itself is only mutated once the gateway accepted the charge.
        license.clone().set_pending_plan(&new_plan.id)?;

        let mut payment = Payment::new(
            gateway,
            company_id,
            PaymentConcept::Upgrade,
            breakdown.total,
            "EUR",
        );
        self.store.create_payment(&payment).await?;

        match self
            .initiate(gateway, &payment, &license, "plan upgrade")
            .await
        {
            Ok(initiated) => {
                self.with_license_retry(company_id, "stage_upgrade", |license| {
                    license.set_pending_plan(&new_plan.id)?;
                    if let Some(subscription_id) = &initiated.gateway_subscription_id {
                        license.gateway_ref = Some(GatewaySubscriptionRef {
                            gateway,
                            external_id: subscription_id.clone(),
                        });
                    }
                    Ok(())
                })
                .await?;
                tracing::info!(
                    company_id,
                    plan = new_plan_slug,
                    payment_id = %payment.id,
                    amount = %breakdown.total,
                    "upgrade initiated"
                );
                Ok(PlanChangeOutcome::UpgradeInitiated {
                    payment_id: payment.id,
                    amount: breakdown.total,
                    redirect_or_client_token: initiated.redirect_or_client_token,
                })
            }
            Err(err) => {
                // On a timeout the payment stays pending for the sweep; the
                // license was never touched.
                if !matches!(err, LicensingError::GatewayTimeout { .. }) {
                    payment.transition(PaymentState::Failed);
                    self.store.save_payment(&payment).await?;
                }
                Err(err)
            }
        }
    }

    /// Purchase add-ons. Grants activate when the payment confirms.
    pub async fn purchase_addons(
        &self,
        company_id: &str,
        slugs: &[String],
        gateway: Gateway,
    ) -> Result<(Uuid, Decimal, String)> {
        let now = Utc::now();
        let license = self.load_current(company_id, now).await?;

        let mut base = Decimal::ZERO;
        for slug in slugs {
            let addon = self
                .catalog
                .addon(slug)
                .ok_or_else(|| LicensingError::AddOnNotFound { slug: slug.clone() })?;
            let price = addon.price(license.subscription_type);
            base += prorate(
                price,
                days_remaining(license.renewal_date, now),
                cycle_days(license.subscription_type),
            );
        }
        let breakdown = apply_iva(base, self.config.iva_rate);

        // Dry-run before charging; stage for real only after the gateway
        // accepted the charge.
        license.clone().set_pending_addons(slugs)?;

        let mut payment = Payment::new(
            gateway,
            company_id,
            PaymentConcept::AddOn,
            breakdown.total,
            "EUR",
        );
        self.store.create_payment(&payment).await?;

        match self.initiate(gateway, &payment, &license, "add-on purchase").await {
            Ok(initiated) => {
                self.with_license_retry(company_id, "stage_addons", |license| {
                    license.set_pending_addons(slugs)
                })
                .await?;
                tracing::info!(
                    company_id,
                    addons = slugs.join(","),
                    payment_id = %payment.id,
                    amount = %breakdown.total,
                    "add-on purchase initiated"
                );
                Ok((payment.id, breakdown.total, initiated.redirect_or_client_token))
            }
            Err(err) => {
                if !matches!(err, LicensingError::GatewayTimeout { .. }) {
                    payment.transition(PaymentState::Failed);
                    self.store.save_payment(&payment).await?;
                }
                Err(err)
            }
        }
    }

    /// Cancel a license, immediately or at the end of the paid period.
    pub async fn cancel(&self, company_id: &str, immediate: bool) -> Result<()> {
        let now = Utc::now();
        let license = self
            .with_license_retry(company_id, "cancel", |license| license.cancel(immediate, now))
            .await?;
        if let Some(gateway_ref) = &license.gateway_ref {
            let adapter = self.adapters.get(gateway_ref.gateway)?;
            // Local state is canonical; a gateway hiccup here is retried by
            // operators, not surfaced to the tenant.
            if let Err(err) = adapter.cancel_subscription(&gateway_ref.external_id).await {
                tracing::error!(
                    company_id,
                    gateway = %gateway_ref.gateway,
                    error = %err,
                    "failed to cancel gateway subscription"
                );
            }
        }
        Ok(())
    }

    /// Toggle auto-renewal, mirroring the flag to the gateway when the
    /// subscription is gateway-managed.
    pub async fn set_auto_renew(&self, company_id: &str, enabled: bool) -> Result<()> {
        let license = self
            .with_license_retry(company_id, "set_auto_renew", |license| {
                license.set_auto_renew(enabled)
            })
            .await?;
        if let Some(gateway_ref) = &license.gateway_ref {
            let adapter = self.adapters.get(gateway_ref.gateway)?;
            if let Err(err) = adapter
                .toggle_auto_renew(&gateway_ref.external_id, enabled)
                .await
            {
                tracing::error!(
                    company_id,
                    gateway = %gateway_ref.gateway,
                    error = %err,
                    "failed to toggle gateway auto-renew"
                );
            }
        }
        Ok(())
    }

    /// Cancel an add-on, immediately or at the next renewal.
    pub async fn cancel_addon(
        &self,
        company_id: &str,
        slug: &str,
        at_renewal: bool,
    ) -> Result<()> {
        let now = Utc::now();
        self.with_license_retry(company_id, "cancel_addon", |license| {
            license.cancel_addon(slug, at_renewal, now)
        })
        .await?;
        Ok(())
    }

    /// Load a license, lazily expiring an overdue trial.
    async fn load_current(&self, company_id: &str, now: DateTime<Utc>) -> Result<License> {
        let mut license = self
            .store
            .get_license(company_id)
            .await?
            .ok_or_else(|| LicensingError::LicenseNotFound {
                company_id: company_id.to_string(),
            })?;
        if license.expire_if_trial_over(now) {
            let version = license.version;
            // Best-effort persist; the expiry is re-derived on every load.
            let _ = self.store.compare_and_save_license(&license, version).await?;
        }
        if license.is_terminal() {
            return Err(LicensingError::LicenseCancelled {
                company_id: company_id.to_string(),
            });
        }
        Ok(license)
    }

    /// Initiate a gateway charge under the configured timeout.
    async fn initiate(
        &self,
        gateway: Gateway,
        payment: &Payment,
        license: &License,
        operation: &str,
    ) -> Result<crate::gateway::InitiatedPurchase> {
        let adapter = self.adapters.get(gateway)?;
        let mut metadata = HashMap::new();
        metadata.insert("company_id".to_string(), license.company_id.clone());
        let request = PurchaseRequest {
            company_id: license.company_id.clone(),
            external_transaction_id: payment.external_transaction_id.clone(),
            amount: payment.amount,
            currency: payment.currency.clone(),
            concept: payment.concept,
            metadata,
        };
        match tokio::time::timeout(
            self.config.gateway_timeout,
            adapter.initiate_purchase(&request),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => {
                // The payment stays pending; the sweep job resolves it.
                tracing::error!(
                    company_id = %license.company_id,
                    gateway = %gateway,
                    operation,
                    "gateway call timed out"
                );
                Err(LicensingError::GatewayTimeout {
                    gateway: gateway.to_string(),
                    operation: operation.to_string(),
                })
            }
        }
    }

    /// Load-mutate-save with optimistic retry.
    async fn with_license_retry<F>(
        &self,
        company_id: &str,
        operation: &str,
        mutate: F,
    ) -> Result<License>
    where
        F: Fn(&mut License) -> Result<()>,
    {
        for attempt in 0..self.config.max_retries {
            let mut license = self
                .store
                .get_license(company_id)
                .await?
                .ok_or_else(|| LicensingError::LicenseNotFound {
                    company_id: company_id.to_string(),
                })?;
            let expected_version = license.version;
            mutate(&mut license)?;
            if self
                .store
                .compare_and_save_license(&license, expected_version)
                .await?
            {
                return Ok(license);
            }
            tracing::debug!(company_id, operation, attempt, "optimistic save conflicted");
            tokio::time::sleep(self.config.retry_backoff * (attempt + 1)).await;
        }
        Err(LicensingError::RetryLimitExceeded {
            operation: operation.to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::catalog::LimitKey;
    use crate::gateway::test::MockGatewayAdapter;
    use crate::storage::memory::InMemoryEngineStore;
    use crate::storage::{LicenseStore, PaymentStore};
    use rust_decimal_macros::dec;
    use std::time::Duration;

    fn catalog() -> Catalog {
        Catalog::builder()
            .plan("basic")
            .monthly_price(dec!(29))
            .annual_price(dec!(290))
            .limit(LimitKey::Users, 5)
            .done()
            .plan("pro")
            .monthly_price(dec!(79))
            .annual_price(dec!(790))
            .limit(LimitKey::Users, 20)
            .done()
            .addon("reports")
            .monthly_price(dec!(10))
            .done()
            .build()
    }

    fn manager(
        store: Arc<InMemoryEngineStore>,
        adapter: Arc<MockGatewayAdapter>,
    ) -> PurchaseManager<InMemoryEngineStore> {
        let config = EngineConfig::builder()
            .gateway_timeout(Duration::from_millis(100))
            .retry_backoff(Duration::from_millis(1))
            .build();
        PurchaseManager::new(
            store,
            catalog(),
            AdapterRegistry::new().register(adapter),
            config,
        )
    }

    #[tokio::test]
    async fn test_signup_trial() {
        let store = Arc::new(InMemoryEngineStore::new());
        let adapter = Arc::new(MockGatewayAdapter::new(Gateway::CardA));
        let manager = manager(store.clone(), adapter);

        let license = manager
            .signup_trial("acme", "basic", SubscriptionType::Monthly, 14)
            .await
            .unwrap();
        assert!(license.is_trial);
        assert!(store.get_license("acme").await.unwrap().is_some());

        assert!(manager
            .signup_trial("acme", "missing", SubscriptionType::Monthly, 14)
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_upgrade_charges_but_does_not_apply_plan() {
        let store = Arc::new(InMemoryEngineStore::new());
        let adapter = Arc::new(MockGatewayAdapter::new(Gateway::CardA));
        let manager = manager(store.clone(), adapter.clone());
        manager
            .signup_trial("acme", "basic", SubscriptionType::Monthly, 14)
            .await
            .unwrap();

        let outcome = manager
            .change_plan("acme", "pro", Gateway::CardA)
            .await
            .unwrap();
        let (payment_id, amount) = match outcome {
            PlanChangeOutcome::UpgradeInitiated {
                payment_id, amount, ..
            } => (payment_id, amount),
            other => panic!("expected upgrade, got {other:?}"),
        };
        // Trial upgrade: full pro price plus 21% VAT.
        assert_eq!(amount, dec!(95.59));

        let license = store.get_license("acme").await.unwrap().unwrap();
        assert!(license.pending_plan_id.is_some());
        assert!(license.is_trial);

        let payment = store.get_payment(payment_id).await.unwrap().unwrap();
        assert_eq!(payment.state, PaymentState::Pending);
        assert_eq!(adapter.initiated().len(), 1);
        assert_eq!(
            adapter.initiated()[0].external_transaction_id,
            payment.external_transaction_id
        );
    }

    #[tokio::test]
    async fn test_downgrade_is_scheduled_not_charged() {
        let store = Arc::new(InMemoryEngineStore::new());
        let adapter = Arc::new(MockGatewayAdapter::new(Gateway::CardA));
        let manager = manager(store.clone(), adapter.clone());

        // Paid license referencing the plan by slug; resolution falls back
        // to the slug when the id is unknown.
        let mut license =
            License::new_trial("acme", "pro", SubscriptionType::Monthly, 14, Utc::now());
        license.confirm_pending(Vec::new(), Utc::now());
        store.create_license(&license).await.unwrap();

        let outcome = manager
            .change_plan("acme", "basic", Gateway::CardA)
            .await
            .unwrap();
        assert!(matches!(outcome, PlanChangeOutcome::DowngradeScheduled { .. }));
        assert!(adapter.initiated().is_empty());

        let stored = store.get_license("acme").await.unwrap().unwrap();
        assert!(stored.scheduled_plan_id.is_some());
    }

    #[tokio::test]
    async fn test_gateway_failure_marks_payment_failed_and_license_untouched() {
        let store = Arc::new(InMemoryEngineStore::new());
        let adapter = Arc::new(MockGatewayAdapter::new(Gateway::CardA));
        let manager = manager(store.clone(), adapter.clone());
        manager
            .signup_trial("acme", "basic", SubscriptionType::Monthly, 14)
            .await
            .unwrap();

        adapter.fail_next_initiation();
        let err = manager
            .change_plan("acme", "pro", Gateway::CardA)
            .await
            .unwrap_err();
        assert!(matches!(err, LicensingError::GatewayApi { .. }));

        let license = store.get_license("acme").await.unwrap().unwrap();
        assert!(license.pending_plan_id.is_none());
        let pending = store
            .list_pending_payments(Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert!(pending.is_empty());
    }

    #[tokio::test]
    async fn test_gateway_timeout_leaves_payment_pending_for_sweep() {
        let store = Arc::new(InMemoryEngineStore::new());
        let adapter = Arc::new(MockGatewayAdapter::new(Gateway::CardA));
        let manager = manager(store.clone(), adapter.clone());
        manager
            .signup_trial("acme", "basic", SubscriptionType::Monthly, 14)
            .await
            .unwrap();

        adapter.hang_next_initiation();
        let err = manager
            .change_plan("acme", "pro", Gateway::CardA)
            .await
            .unwrap_err();
        assert!(matches!(err, LicensingError::GatewayTimeout { .. }));

        let pending = store
            .list_pending_payments(Utc::now() + chrono::Duration::hours(1))
            .await
            .unwrap();
        assert_eq!(pending.len(), 1);
        // The license was never touched.
        let license = store.get_license("acme").await.unwrap().unwrap();
        assert!(license.pending_plan_id.is_none());
    }

    #[tokio::test]
    async fn test_addon_purchase_stages_slugs() {
        let store = Arc::new(InMemoryEngineStore::new());
        let adapter = Arc::new(MockGatewayAdapter::new(Gateway::WalletC));
        let manager = manager(store.clone(), adapter.clone());
        manager
            .signup_trial("acme", "basic", SubscriptionType::Monthly, 14)
            .await
            .unwrap();

        let (_, amount, _) = manager
            .purchase_addons("acme", &["reports".to_string()], Gateway::WalletC)
            .await
            .unwrap();
        // 14 trial days remaining of a 30-day cycle: 10 * 14/30 = 4.67, +21% VAT.
        assert_eq!(amount, dec!(5.65));

        let license = store.get_license("acme").await.unwrap().unwrap();
        assert!(license.pending_addon_slugs.contains("reports"));
        assert!(!license.has_active_addon("reports"));
    }

    #[tokio::test]
    async fn test_cancel_propagates_to_gateway_subscription() {
        let store = Arc::new(InMemoryEngineStore::new());
        let adapter = Arc::new(MockGatewayAdapter::new(Gateway::CardA));
        let manager = manager(store.clone(), adapter.clone());
        let mut license =
            License::new_trial("acme", "basic", SubscriptionType::Monthly, 14, Utc::now());
        license.gateway_ref = Some(GatewaySubscriptionRef {
            gateway: Gateway::CardA,
            external_id: "sub-42".to_string(),
        });
        store.create_license(&license).await.unwrap();

        manager.cancel("acme", true).await.unwrap();
        let stored = store.get_license("acme").await.unwrap().unwrap();
        assert_eq!(stored.state, crate::license::LicenseState::Cancelled);
        assert_eq!(adapter.cancelled_subscriptions(), vec!["sub-42".to_string()]);
    }

    #[tokio::test]
    async fn test_set_auto_renew_mirrors_to_gateway() {
        let store = Arc::new(InMemoryEngineStore::new());
        let adapter = Arc::new(MockGatewayAdapter::new(Gateway::CardA));
        let manager = manager(store.clone(), adapter.clone());
        let mut license =
            License::new_trial("acme", "basic", SubscriptionType::Monthly, 14, Utc::now());
        license.gateway_ref = Some(GatewaySubscriptionRef {
            gateway: Gateway::CardA,
            external_id: "sub-42".to_string(),
        });
        store.create_license(&license).await.unwrap();

        manager.set_auto_renew("acme", false).await.unwrap();
        assert!(!store.get_license("acme").await.unwrap().unwrap().auto_renew);
        assert_eq!(adapter.auto_renew_calls(), vec![("sub-42".to_string(), false)]);
    }

    #[tokio::test]
    async fn test_trial_expires_lazily_on_purchase_path() {
        let store = Arc::new(InMemoryEngineStore::new());
        let adapter = Arc::new(MockGatewayAdapter::new(Gateway::CardA));
        let manager = manager(store.clone(), adapter);
        let mut license =
            License::new_trial("acme", "basic", SubscriptionType::Monthly, 14, Utc::now());
        license.trial_ends_at = Some(Utc::now() - chrono::Duration::days(1));
        store.create_license(&license).await.unwrap();

        let err = manager
            .change_plan("acme", "pro", Gateway::CardA)
            .await
            .unwrap_err();
        assert!(matches!(err, LicensingError::LicenseCancelled { .. }));

        let stored = store.get_license("acme").await.unwrap().unwrap();
        assert_eq!(stored.state, crate::license::LicenseState::Expired);
    }
}
