//! Scheduled maintenance jobs.
//!
//! Each job is a plain async method; the host schedules them (cron, a timer
//! task, a worker pool). All of them are safe to re-run: counter resets are
//! absolute writes, expiries and renewals only touch licenses that are due.

use std::sync::Arc;

use chrono::{DateTime, Utc};

use crate::catalog::LimitKey;
use crate::config::EngineConfig;
use crate::error::Result;
use crate::external::UsageSource;
use crate::storage::EngineStore;

/// Periodic housekeeping over all licenses.
pub struct ScheduledJobs<S> {
    store: Arc<S>,
    config: EngineConfig,
}

impl<S: EngineStore> ScheduledJobs<S> {
    #[must_use]
    pub fn new(store: Arc<S>, config: EngineConfig) -> Self {
        Self { store, config }
    }

    /// Zero every monthly counter. Run on the first of the month.
    pub async fn reset_monthly_counters(&self) -> Result<u32> {
        self.reset_counters(|key| key.resets_monthly()).await
    }

    /// Zero every daily counter. Run at midnight.
    pub async fn reset_daily_counters(&self) -> Result<u32> {
        self.reset_counters(|key| key.resets_daily()).await
    }

    async fn reset_counters(&self, applies: impl Fn(LimitKey) -> bool) -> Result<u32> {
        let mut reset = 0;
        for license in self.store.list_licenses().await? {
            for key in LimitKey::ALL {
                if applies(key) && license.usage_of(key) != 0 {
                    self.store.set_usage(&license.company_id, key, 0).await?;
                    reset += 1;
                }
            }
        }
        tracing::info!(counters = reset, "usage counters reset");
        Ok(reset)
    }

    /// Persist the expiry of trials past their end date.
    ///
    /// Expiry is also derived lazily on every load; this job just keeps the
    /// stored state and audit trail in line for reporting.
    pub async fn expire_overdue_trials(&self, now: DateTime<Utc>) -> Result<u32> {
        let mut expired = 0;
        for license in self.store.list_licenses().await? {
            if !license.is_trial_expired(now) {
                continue;
            }
            let mut license = license;
            let expected_version = license.version;
            if license.expire_if_trial_over(now)
                && self
                    .store
                    .compare_and_save_license(&license, expected_version)
                    .await?
            {
                expired += 1;
            }
            // A conflict means someone else just touched the license; the
            // next run or the next lazy load picks it up.
        }
        if expired > 0 {
            tracing::info!(expired, "overdue trials expired");
        }
        Ok(expired)
    }

    /// Roll licenses past their renewal date into the next cycle.
    ///
    /// Licenses with auto-renew disabled are cancelled instead of renewed.
    pub async fn process_renewals(&self, now: DateTime<Utc>) -> Result<u32> {
        let mut processed = 0;
        for license in self.store.list_licenses().await? {
            if license.is_terminal() || license.is_trial || license.renewal_date > now {
                continue;
            }
            let mut license = license;
            let expected_version = license.version;
            let result = if license.auto_renew || license.cancel_at_renewal {
                license.renew(now)
            } else {
                license.cancel(true, now)
            };
            if let Err(err) = result {
                tracing::error!(
                    company_id = %license.company_id,
                    error = %err,
                    "renewal skipped"
                );
                continue;
            }
            if self
                .store
                .compare_and_save_license(&license, expected_version)
                .await?
            {
                processed += 1;
            }
        }
        if processed > 0 {
            tracing::info!(processed, "renewals processed");
        }
        Ok(processed)
    }

    /// Overwrite a usage counter from the authoritative resource count.
    ///
    /// Covers drift from missed increments (crashes, direct data fixes).
    pub async fn reconcile_usage<U: UsageSource>(
        &self,
        source: &U,
        company_id: &str,
        key: LimitKey,
    ) -> Result<i64> {
        let actual = source.count_active_resources(company_id, key).await?;
        self.store.set_usage(company_id, key, actual).await?;
        tracing::debug!(company_id, key = %key, actual, "usage reconciled");
        Ok(actual)
    }

    /// Sweep threshold for unresolved payments, exposed for hosts that wire
    /// the sweep and the jobs from one config.
    #[must_use]
    pub fn sweep_min_age(&self) -> std::time::Duration {
        self.config.sweep_min_age
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::external::test::StaticUsageSource;
    use crate::license::{License, LicenseState};
    use crate::proration::SubscriptionType;
    use crate::storage::memory::InMemoryEngineStore;
    use crate::storage::LicenseStore;

    fn jobs(store: Arc<InMemoryEngineStore>) -> ScheduledJobs<InMemoryEngineStore> {
        ScheduledJobs::new(store, EngineConfig::default())
    }

    #[tokio::test]
    async fn test_counter_resets_are_scoped_by_cadence() {
        let store = Arc::new(InMemoryEngineStore::new());
        let license =
            License::new_trial("acme", "basic", SubscriptionType::Monthly, 14, Utc::now());
        store.create_license(&license).await.unwrap();
        store
            .set_usage("acme", LimitKey::MonthlyInvoices, 42)
            .await
            .unwrap();
        store
            .set_usage("acme", LimitKey::DailyApiCalls, 99)
            .await
            .unwrap();
        store.set_usage("acme", LimitKey::Users, 3).await.unwrap();

        let jobs = jobs(store.clone());
        assert_eq!(jobs.reset_daily_counters().await.unwrap(), 1);
        let stored = store.get_license("acme").await.unwrap().unwrap();
        assert_eq!(stored.usage_of(LimitKey::DailyApiCalls), 0);
        assert_eq!(stored.usage_of(LimitKey::MonthlyInvoices), 42);

        assert_eq!(jobs.reset_monthly_counters().await.unwrap(), 1);
        let stored = store.get_license("acme").await.unwrap().unwrap();
        assert_eq!(stored.usage_of(LimitKey::MonthlyInvoices), 0);
        // Lifetime counters are never reset by jobs.
        assert_eq!(stored.usage_of(LimitKey::Users), 3);
    }

    #[tokio::test]
    async fn test_expire_overdue_trials() {
        let store = Arc::new(InMemoryEngineStore::new());
        let now = Utc::now();
        let mut overdue =
            License::new_trial("late", "basic", SubscriptionType::Monthly, 14, now);
        overdue.trial_ends_at = Some(now - chrono::Duration::days(2));
        store.create_license(&overdue).await.unwrap();
        let current = License::new_trial("fresh", "basic", SubscriptionType::Monthly, 14, now);
        store.create_license(&current).await.unwrap();

        let jobs = jobs(store.clone());
        assert_eq!(jobs.expire_overdue_trials(now).await.unwrap(), 1);
        assert_eq!(
            store.get_license("late").await.unwrap().unwrap().state,
            LicenseState::Expired
        );
        assert_eq!(
            store.get_license("fresh").await.unwrap().unwrap().state,
            LicenseState::Trial
        );
        // Re-running changes nothing.
        assert_eq!(jobs.expire_overdue_trials(now).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn test_renewals_cancel_when_auto_renew_is_off() {
        let store = Arc::new(InMemoryEngineStore::new());
        let now = Utc::now();

        let mut renewing =
            License::new_trial("renews", "basic", SubscriptionType::Monthly, 14, now);
        renewing.confirm_pending(Vec::new(), now);
        renewing.renewal_date = now - chrono::Duration::days(1);
        store.create_license(&renewing).await.unwrap();

        let mut lapsing =
            License::new_trial("lapses", "basic", SubscriptionType::Monthly, 14, now);
        lapsing.confirm_pending(Vec::new(), now);
        lapsing.renewal_date = now - chrono::Duration::days(1);
        lapsing.auto_renew = false;
        store.create_license(&lapsing).await.unwrap();

        let jobs = jobs(store.clone());
        assert_eq!(jobs.process_renewals(now).await.unwrap(), 2);

        let renewed = store.get_license("renews").await.unwrap().unwrap();
        assert_eq!(renewed.state, LicenseState::Active);
        assert!(renewed.renewal_date > now);
        assert_eq!(
            renewed.history.last().unwrap().action.as_str(),
            "AUTO_RENOVACION"
        );

        let lapsed = store.get_license("lapses").await.unwrap().unwrap();
        assert_eq!(lapsed.state, LicenseState::Cancelled);
    }

    #[tokio::test]
    async fn test_scheduled_cancellation_applies_at_renewal() {
        let store = Arc::new(InMemoryEngineStore::new());
        let now = Utc::now();
        let mut license =
            License::new_trial("acme", "basic", SubscriptionType::Monthly, 14, now);
        license.confirm_pending(Vec::new(), now);
        license.cancel(false, now).unwrap();
        license.renewal_date = now - chrono::Duration::days(1);
        store.create_license(&license).await.unwrap();

        let jobs = jobs(store.clone());
        assert_eq!(jobs.process_renewals(now).await.unwrap(), 1);
        assert_eq!(
            store.get_license("acme").await.unwrap().unwrap().state,
            LicenseState::Cancelled
        );
    }

    #[tokio::test]
    async fn test_reconcile_usage_overwrites_counter() {
        let store = Arc::new(InMemoryEngineStore::new());
        let license =
            License::new_trial("acme", "basic", SubscriptionType::Monthly, 14, Utc::now());
        store.create_license(&license).await.unwrap();
        store.set_usage("acme", LimitKey::Users, 10).await.unwrap();

        let source = StaticUsageSource::default();
        source.set_count("acme", LimitKey::Users, 4);

        let jobs = jobs(store.clone());
        assert_eq!(
            jobs.reconcile_usage(&source, "acme", LimitKey::Users)
                .await
                .unwrap(),
            4
        );
        assert_eq!(
            store
                .get_license("acme")
                .await
                .unwrap()
                .unwrap()
                .usage_of(LimitKey::Users),
            4
        );
    }
}
