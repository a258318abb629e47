//! Usage limit enforcement.
//!
//! The effective limit for a key is the plan's base limit plus every active
//! add-on grant's extra, scaled by grant quantity. A plan-level limit of
//! [`UNLIMITED`](crate::catalog::UNLIMITED) disables the key entirely;
//! add-on extras are only ever additive.

use std::sync::Arc;

use crate::catalog::{Catalog, LimitKey, Plan, UNLIMITED};
use crate::config::EngineConfig;
use crate::error::{LicensingError, Result};
use crate::license::License;
use crate::storage::LicenseStore;

/// Result of checking one usage counter against its effective limit.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimitCheck {
    /// Whether one more unit may be consumed.
    pub allowed: bool,
    pub used: i64,
    /// Effective limit; [`UNLIMITED`] when the plan disables the key.
    pub limit: i64,
    /// Percentage of the limit consumed, 0 for unlimited keys.
    pub percent: f64,
    /// True when usage has crossed the warning threshold but is still allowed.
    pub warning: bool,
}

/// Compute the effective limit for a key.
#[must_use]
pub fn effective_limit(plan: &Plan, license: &License, catalog: &Catalog, key: LimitKey) -> i64 {
    let base = plan.limit(key);
    if base == UNLIMITED {
        return UNLIMITED;
    }
    let extra: i64 = license
        .active_addons()
        .filter_map(|grant| {
            catalog
                .addon(&grant.slug)
                .map(|addon| addon.extra_limit(key) * i64::from(grant.quantity))
        })
        .sum();
    base + extra
}

/// Evaluate a counter against a limit.
#[must_use]
pub fn check_limit(used: i64, limit: i64, warn_threshold: f64) -> LimitCheck {
    if limit == UNLIMITED {
        return LimitCheck {
            allowed: true,
            used,
            limit,
            percent: 0.0,
            warning: false,
        };
    }
    let percent = if limit <= 0 {
        100.0
    } else {
        (used as f64 / limit as f64) * 100.0
    };
    let allowed = used < limit;
    LimitCheck {
        allowed,
        used,
        limit,
        percent,
        warning: allowed && percent >= warn_threshold * 100.0,
    }
}

/// Enforces usage limits against stored licenses.
#[derive(Debug, Clone)]
pub struct UsageLimiter<S> {
    store: Arc<S>,
    catalog: Catalog,
    warn_threshold: f64,
}

impl<S: LicenseStore> UsageLimiter<S> {
    #[must_use]
    pub fn new(store: Arc<S>, catalog: Catalog, config: &EngineConfig) -> Self {
        Self {
            store,
            catalog,
            warn_threshold: config.warn_threshold,
        }
    }

    /// Check the current standing of a counter without consuming anything.
    pub async fn check(&self, company_id: &str, key: LimitKey) -> Result<LimitCheck> {
        let license = self
            .store
            .get_license(company_id)
            .await?
            .ok_or_else(|| LicensingError::LicenseNotFound {
                company_id: company_id.to_string(),
            })?;
        let plan = self
            .catalog
            .resolve_plan(&license.plan_id)
            .ok_or_else(|| LicensingError::PlanNotFound {
                plan_id: license.plan_id.clone(),
            })?;
        let limit = effective_limit(&plan, &license, &self.catalog, key);
        Ok(check_limit(license.usage_of(key), limit, self.warn_threshold))
    }

    /// Fail with `LimitExceeded` if no more units may be consumed.
    ///
    /// Emits a warning once usage crosses the warning threshold.
    pub async fn enforce(&self, company_id: &str, key: LimitKey) -> Result<LimitCheck> {
        let check = self.check(company_id, key).await?;
        if !check.allowed {
            return Err(LicensingError::LimitExceeded {
                key,
                used: check.used,
                limit: check.limit,
                percent: check.percent,
            });
        }
        if check.warning {
            tracing::warn!(
                company_id,
                key = %key,
                used = check.used,
                limit = check.limit,
                percent = check.percent,
                "usage approaching limit"
            );
        }
        Ok(check)
    }

    /// Atomically consume units of a counter. Returns the new value.
    pub async fn increment(&self, company_id: &str, key: LimitKey, amount: i64) -> Result<i64> {
        self.store.increment_usage(company_id, key, amount).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::license::AddOnGrant;
    use crate::proration::SubscriptionType;
    use crate::storage::memory::InMemoryEngineStore;
    use chrono::Utc;
    use rust_decimal_macros::dec;

    fn catalog() -> Catalog {
        Catalog::builder()
            .plan("basic")
            .monthly_price(dec!(29))
            .limit(LimitKey::Users, 5)
            .limit(LimitKey::PosTerminals, 1)
            .done()
            .plan("pro")
            .monthly_price(dec!(79))
            .limit(LimitKey::Users, UNLIMITED)
            .done()
            .addon("extra-terminals")
            .monthly_price(dec!(9))
            .extra_limit(LimitKey::PosTerminals, 2)
            .done()
            .build()
    }

    fn license_on(plan: &str) -> License {
        License::new_trial("acme", plan, SubscriptionType::Monthly, 14, Utc::now())
    }

    #[test]
    fn test_effective_limit_adds_addon_extras_scaled_by_quantity() {
        let catalog = catalog();
        let plan = catalog.plan("basic").unwrap();
        let mut license = license_on("basic");
        license
            .grant_addon(
                AddOnGrant {
                    addon_id: "a1".to_string(),
                    slug: "extra-terminals".to_string(),
                    quantity: 3,
                    monthly_price: dec!(9),
                    active: true,
                    activated_at: Utc::now(),
                    cancel_at_renewal: false,
                    cancelled_at: None,
                },
                Utc::now(),
            )
            .unwrap();
        assert_eq!(
            effective_limit(&plan, &license, &catalog, LimitKey::PosTerminals),
            1 + 3 * 2
        );
        // Inactive grants contribute nothing.
        license
            .cancel_addon("extra-terminals", false, Utc::now())
            .unwrap();
        assert_eq!(
            effective_limit(&plan, &license, &catalog, LimitKey::PosTerminals),
            1
        );
    }

    #[test]
    fn test_plan_unlimited_wins() {
        let catalog = catalog();
        let plan = catalog.plan("pro").unwrap();
        let license = license_on("pro");
        assert_eq!(
            effective_limit(&plan, &license, &catalog, LimitKey::Users),
            UNLIMITED
        );
    }

    #[test]
    fn test_check_limit_thresholds() {
        // Below the warning threshold.
        let check = check_limit(3, 5, 0.70);
        assert!(check.allowed);
        assert!(!check.warning);

        // At 80% of 5: warn but allow.
        let check = check_limit(4, 5, 0.70);
        assert!(check.allowed);
        assert!(check.warning);
        assert_eq!(check.percent, 80.0);

        // At the limit: blocked, no warning flag.
        let check = check_limit(5, 5, 0.70);
        assert!(!check.allowed);
        assert!(!check.warning);
        assert_eq!(check.percent, 100.0);
    }

    #[test]
    fn test_check_limit_unlimited_and_zero() {
        let check = check_limit(1_000_000, UNLIMITED, 0.70);
        assert!(check.allowed);
        assert_eq!(check.percent, 0.0);

        // Missing limit key counts as zero: always blocked.
        let check = check_limit(0, 0, 0.70);
        assert!(!check.allowed);
        assert_eq!(check.percent, 100.0);
    }

    #[tokio::test]
    async fn test_enforce_blocks_at_limit() {
        let store = Arc::new(InMemoryEngineStore::new());
        store.create_license(&license_on("basic")).await.unwrap();
        let limiter = UsageLimiter::new(store.clone(), catalog(), &EngineConfig::default());

        for _ in 0..5 {
            limiter.enforce("acme", LimitKey::Users).await.unwrap();
            limiter.increment("acme", LimitKey::Users, 1).await.unwrap();
        }
        let err = limiter.enforce("acme", LimitKey::Users).await.unwrap_err();
        assert_eq!(
            err,
            LicensingError::LimitExceeded {
                key: LimitKey::Users,
                used: 5,
                limit: 5,
                percent: 100.0,
            }
        );
    }
}
