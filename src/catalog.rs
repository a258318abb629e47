//! Plan and add-on catalog.
//!
//! Purchasable tiers and add-ons are reference data: seeded at startup or
//! edited administratively, never mutated by tenant actions. The catalog is
//! read-mostly; lookups return cloned snapshots so readers never observe a
//! half-applied administrative edit.
//!
//! # Example
//!
//! ```rust,ignore
//! use licenseward::catalog::{Catalog, LimitKey};
//! use rust_decimal_macros::dec;
//!
//! let catalog = Catalog::builder()
//!     .plan("basic")
//!         .monthly_price(dec!(29))
//!         .annual_price(dec!(290))
//!         .limit(LimitKey::Users, 5)
//!         .limit(LimitKey::MonthlyInvoices, 100)
//!         .module("invoicing")
//!         .done()
//!     .addon("extra-terminals")
//!         .recurring(true)
//!         .monthly_price(dec!(9))
//!         .extra_limit(LimitKey::PosTerminals, 2)
//!         .done()
//!     .build();
//! ```

use std::collections::{HashMap, HashSet};
use std::sync::{Arc, RwLock};

use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::proration::SubscriptionType;

/// Sentinel limit value meaning "unlimited".
///
/// Only meaningful on a plan's own limits; add-on extras are additive and a
/// `-1` there does not grant unlimited usage.
pub const UNLIMITED: i64 = -1;

/// Closed set of quota keys.
///
/// A fixed enumeration instead of stringly-typed maps, so a typo in a limit
/// key is a compile error rather than a silently-unlimited quota.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LimitKey {
    /// Seats for tenant users.
    Users,
    /// Active point-of-sale terminals.
    PosTerminals,
    /// Open projects.
    Projects,
    /// Open work orders.
    WorkOrders,
    /// Invoices issued in the current month.
    MonthlyInvoices,
    /// API calls made today.
    DailyApiCalls,
    /// Document storage in megabytes.
    StorageMb,
}

impl LimitKey {
    /// Every key, for iteration by the counter-reset jobs.
    pub const ALL: [LimitKey; 7] = [
        LimitKey::Users,
        LimitKey::PosTerminals,
        LimitKey::Projects,
        LimitKey::WorkOrders,
        LimitKey::MonthlyInvoices,
        LimitKey::DailyApiCalls,
        LimitKey::StorageMb,
    ];

    /// Convert to string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Users => "users",
            Self::PosTerminals => "pos_terminals",
            Self::Projects => "projects",
            Self::WorkOrders => "work_orders",
            Self::MonthlyInvoices => "monthly_invoices",
            Self::DailyApiCalls => "daily_api_calls",
            Self::StorageMb => "storage_mb",
        }
    }

    /// Counters reset by the monthly scheduled job.
    #[must_use]
    pub fn resets_monthly(&self) -> bool {
        matches!(self, Self::MonthlyInvoices)
    }

    /// Counters reset by the daily scheduled job.
    #[must_use]
    pub fn resets_daily(&self) -> bool {
        matches!(self, Self::DailyApiCalls)
    }
}

impl std::fmt::Display for LimitKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Feature modules included with a plan or add-on.
///
/// The wildcard entry `"*"` grants every module.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModuleSet(HashSet<String>);

impl ModuleSet {
    /// Empty set: no modules included.
    #[must_use]
    pub fn none() -> Self {
        Self::default()
    }

    /// Wildcard set: every module included.
    #[must_use]
    pub fn all() -> Self {
        let mut set = HashSet::new();
        set.insert("*".to_string());
        Self(set)
    }

    /// Build from explicit module names.
    #[must_use]
    pub fn named<I, S>(modules: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self(modules.into_iter().map(Into::into).collect())
    }

    /// Check whether a module is included.
    #[must_use]
    pub fn includes(&self, module: &str) -> bool {
        self.0.contains("*") || self.0.contains(module)
    }

    fn insert(&mut self, module: impl Into<String>) {
        self.0.insert(module.into());
    }
}

/// A purchasable subscription tier.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plan {
    pub id: String,
    /// Unique, human-readable identifier (e.g. "basic", "pro").
    pub slug: String,
    pub name: String,
    pub monthly_price: Decimal,
    pub annual_price: Decimal,
    /// Base quotas. [`UNLIMITED`] means no limit; a missing key means zero.
    pub limits: HashMap<LimitKey, i64>,
    pub modules: ModuleSet,
    pub active: bool,
    pub sort_order: i32,
}

impl Plan {
    /// Declared limit for a key; missing keys count as zero.
    #[must_use]
    pub fn limit(&self, key: LimitKey) -> i64 {
        self.limits.get(&key).copied().unwrap_or(0)
    }

    /// Price at the given cycle granularity.
    #[must_use]
    pub fn price(&self, subscription_type: SubscriptionType) -> Decimal {
        match subscription_type {
            SubscriptionType::Monthly => self.monthly_price,
            SubscriptionType::Annual => self.annual_price,
        }
    }

    /// Check whether this plan includes a feature module.
    #[must_use]
    pub fn includes_module(&self, module: &str) -> bool {
        self.modules.includes(module)
    }
}

/// A purchasable quota/module increment.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddOn {
    pub id: String,
    pub slug: String,
    pub name: String,
    /// Recurring add-ons renew with the subscription; one-shot add-ons do not.
    pub recurring: bool,
    pub monthly_price: Decimal,
    pub annual_price: Decimal,
    /// Additive quota extras. Never interpreted as unlimited.
    pub extra_limits: HashMap<LimitKey, i64>,
    pub modules: ModuleSet,
    pub active: bool,
    pub sort_order: i32,
}

impl AddOn {
    /// Extra quota contributed for a key; missing keys count as zero.
    #[must_use]
    pub fn extra_limit(&self, key: LimitKey) -> i64 {
        self.extra_limits.get(&key).copied().unwrap_or(0)
    }

    /// Price at the given cycle granularity.
    #[must_use]
    pub fn price(&self, subscription_type: SubscriptionType) -> Decimal {
        match subscription_type {
            SubscriptionType::Monthly => self.monthly_price,
            SubscriptionType::Annual => self.annual_price,
        }
    }
}

#[derive(Debug, Default)]
struct CatalogInner {
    plans: HashMap<String, Plan>,
    addons: HashMap<String, AddOn>,
}

/// Thread-safe plan/add-on catalog.
///
/// Clones share the same underlying data; administrative edits are visible to
/// all holders on their next lookup.
#[derive(Debug, Clone, Default)]
pub struct Catalog {
    inner: Arc<RwLock<CatalogInner>>,
}

impl Catalog {
    /// Create an empty catalog.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Create a builder for seeding the catalog.
    #[must_use]
    pub fn builder() -> CatalogBuilder {
        CatalogBuilder::default()
    }

    /// Get a plan snapshot by slug.
    #[must_use]
    pub fn plan(&self, slug: &str) -> Option<Plan> {
        self.inner.read().unwrap().plans.get(slug).cloned()
    }

    /// Get a plan snapshot by id.
    #[must_use]
    pub fn plan_by_id(&self, id: &str) -> Option<Plan> {
        self.inner
            .read()
            .unwrap()
            .plans
            .values()
            .find(|p| p.id == id)
            .cloned()
    }

    /// Resolve a plan reference, trying id first and falling back to slug.
    ///
    /// Licenses normally reference plans by id, but the fallback keeps
    /// billing summaries working across catalog reseeds that regenerate ids.
    #[must_use]
    pub fn resolve_plan(&self, plan_ref: &str) -> Option<Plan> {
        self.plan_by_id(plan_ref).or_else(|| self.plan(plan_ref))
    }

    /// Get an add-on snapshot by slug.
    #[must_use]
    pub fn addon(&self, slug: &str) -> Option<AddOn> {
        self.inner.read().unwrap().addons.get(slug).cloned()
    }

    /// All active plans, ordered by sort order.
    #[must_use]
    pub fn list_plans(&self) -> Vec<Plan> {
        let inner = self.inner.read().unwrap();
        let mut plans: Vec<Plan> = inner.plans.values().filter(|p| p.active).cloned().collect();
        plans.sort_by_key(|p| p.sort_order);
        plans
    }

    /// All active add-ons, ordered by sort order.
    #[must_use]
    pub fn list_addons(&self) -> Vec<AddOn> {
        let inner = self.inner.read().unwrap();
        let mut addons: Vec<AddOn> = inner.addons.values().filter(|a| a.active).cloned().collect();
        addons.sort_by_key(|a| a.sort_order);
        addons
    }

    /// Administrative edit: insert or replace a plan.
    pub fn upsert_plan(&self, plan: Plan) {
        self.inner
            .write()
            .unwrap()
            .plans
            .insert(plan.slug.clone(), plan);
    }

    /// Administrative edit: insert or replace an add-on.
    pub fn upsert_addon(&self, addon: AddOn) {
        self.inner
            .write()
            .unwrap()
            .addons
            .insert(addon.slug.clone(), addon);
    }

    /// Administrative edit: activate or retire a plan.
    pub fn set_plan_active(&self, slug: &str, active: bool) {
        if let Some(plan) = self.inner.write().unwrap().plans.get_mut(slug) {
            plan.active = active;
        }
    }
}

/// Builder for seeding a catalog.
#[derive(Debug, Default)]
pub struct CatalogBuilder {
    plans: Vec<Plan>,
    addons: Vec<AddOn>,
}

impl CatalogBuilder {
    /// Start defining a plan.
    #[must_use]
    pub fn plan(self, slug: &str) -> PlanBuilder {
        PlanBuilder {
            parent: self,
            plan: Plan {
                id: Uuid::new_v4().to_string(),
                slug: slug.to_string(),
                name: slug.to_string(),
                monthly_price: Decimal::ZERO,
                annual_price: Decimal::ZERO,
                limits: HashMap::new(),
                modules: ModuleSet::none(),
                active: true,
                sort_order: 0,
            },
        }
    }

    /// Start defining an add-on.
    #[must_use]
    pub fn addon(self, slug: &str) -> AddOnBuilder {
        AddOnBuilder {
            parent: self,
            addon: AddOn {
                id: Uuid::new_v4().to_string(),
                slug: slug.to_string(),
                name: slug.to_string(),
                recurring: false,
                monthly_price: Decimal::ZERO,
                annual_price: Decimal::ZERO,
                extra_limits: HashMap::new(),
                modules: ModuleSet::none(),
                active: true,
                sort_order: 0,
            },
        }
    }

    /// Build the catalog.
    #[must_use]
    pub fn build(self) -> Catalog {
        let catalog = Catalog::new();
        {
            let mut inner = catalog.inner.write().unwrap();
            for plan in self.plans {
                inner.plans.insert(plan.slug.clone(), plan);
            }
            for addon in self.addons {
                inner.addons.insert(addon.slug.clone(), addon);
            }
        }
        catalog
    }
}

/// Builder for a single plan.
#[derive(Debug)]
pub struct PlanBuilder {
    parent: CatalogBuilder,
    plan: Plan,
}

impl PlanBuilder {
    #[must_use]
    pub fn name(mut self, name: &str) -> Self {
        self.plan.name = name.to_string();
        self
    }

    #[must_use]
    pub fn monthly_price(mut self, price: Decimal) -> Self {
        self.plan.monthly_price = price;
        self
    }

    #[must_use]
    pub fn annual_price(mut self, price: Decimal) -> Self {
        self.plan.annual_price = price;
        self
    }

    /// Declare a quota. Use [`UNLIMITED`] for no limit.
    #[must_use]
    pub fn limit(mut self, key: LimitKey, value: i64) -> Self {
        self.plan.limits.insert(key, value);
        self
    }

    #[must_use]
    pub fn module(mut self, module: &str) -> Self {
        self.plan.modules.insert(module);
        self
    }

    /// Include every feature module (wildcard).
    #[must_use]
    pub fn all_modules(mut self) -> Self {
        self.plan.modules = ModuleSet::all();
        self
    }

    #[must_use]
    pub fn sort_order(mut self, order: i32) -> Self {
        self.plan.sort_order = order;
        self
    }

    /// Finish this plan and return to the catalog builder.
    #[must_use]
    pub fn done(mut self) -> CatalogBuilder {
        self.parent.plans.push(self.plan);
        self.parent
    }
}

/// Builder for a single add-on.
#[derive(Debug)]
pub struct AddOnBuilder {
    parent: CatalogBuilder,
    addon: AddOn,
}

impl AddOnBuilder {
    #[must_use]
    pub fn name(mut self, name: &str) -> Self {
        self.addon.name = name.to_string();
        self
    }

    #[must_use]
    pub fn recurring(mut self, recurring: bool) -> Self {
        self.addon.recurring = recurring;
        self
    }

    #[must_use]
    pub fn monthly_price(mut self, price: Decimal) -> Self {
        self.addon.monthly_price = price;
        self
    }

    #[must_use]
    pub fn annual_price(mut self, price: Decimal) -> Self {
        self.addon.annual_price = price;
        self
    }

    #[must_use]
    pub fn extra_limit(mut self, key: LimitKey, value: i64) -> Self {
        self.addon.extra_limits.insert(key, value);
        self
    }

    #[must_use]
    pub fn module(mut self, module: &str) -> Self {
        self.addon.modules.insert(module);
        self
    }

    #[must_use]
    pub fn sort_order(mut self, order: i32) -> Self {
        self.addon.sort_order = order;
        self
    }

    /// Finish this add-on and return to the catalog builder.
    #[must_use]
    pub fn done(mut self) -> CatalogBuilder {
        self.parent.addons.push(self.addon);
        self.parent
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn seed() -> Catalog {
        Catalog::builder()
            .plan("basic")
            .monthly_price(dec!(29))
            .annual_price(dec!(290))
            .limit(LimitKey::Users, 5)
            .limit(LimitKey::MonthlyInvoices, 100)
            .module("invoicing")
            .sort_order(1)
            .done()
            .plan("pro")
            .monthly_price(dec!(79))
            .annual_price(dec!(790))
            .limit(LimitKey::Users, UNLIMITED)
            .limit(LimitKey::MonthlyInvoices, 1000)
            .all_modules()
            .sort_order(2)
            .done()
            .addon("extra-terminals")
            .recurring(true)
            .monthly_price(dec!(9))
            .annual_price(dec!(90))
            .extra_limit(LimitKey::PosTerminals, 2)
            .done()
            .build()
    }

    #[test]
    fn test_plan_lookup_by_slug_and_id() {
        let catalog = seed();
        let basic = catalog.plan("basic").unwrap();
        assert_eq!(basic.monthly_price, dec!(29));
        assert_eq!(catalog.plan_by_id(&basic.id).unwrap().slug, "basic");
        assert_eq!(catalog.resolve_plan(&basic.id).unwrap().slug, "basic");
        assert_eq!(catalog.resolve_plan("basic").unwrap().slug, "basic");
        assert!(catalog.resolve_plan("missing").is_none());
    }

    #[test]
    fn test_missing_limit_key_counts_as_zero() {
        let catalog = seed();
        let basic = catalog.plan("basic").unwrap();
        assert_eq!(basic.limit(LimitKey::PosTerminals), 0);
        assert_eq!(basic.limit(LimitKey::Users), 5);
    }

    #[test]
    fn test_module_wildcard() {
        let catalog = seed();
        let basic = catalog.plan("basic").unwrap();
        let pro = catalog.plan("pro").unwrap();
        assert!(basic.includes_module("invoicing"));
        assert!(!basic.includes_module("scheduling"));
        assert!(pro.includes_module("scheduling"));
        assert!(pro.includes_module("anything"));
    }

    #[test]
    fn test_list_plans_sorted_and_active_only() {
        let catalog = seed();
        catalog.set_plan_active("pro", false);
        let plans = catalog.list_plans();
        assert_eq!(plans.len(), 1);
        assert_eq!(plans[0].slug, "basic");
    }

    #[test]
    fn test_administrative_edit_visible_to_clones() {
        let catalog = seed();
        let view = catalog.clone();
        let mut basic = catalog.plan("basic").unwrap();
        basic.monthly_price = dec!(35);
        catalog.upsert_plan(basic);
        assert_eq!(view.plan("basic").unwrap().monthly_price, dec!(35));
    }

    #[test]
    fn test_limit_key_reset_classes() {
        assert!(LimitKey::MonthlyInvoices.resets_monthly());
        assert!(!LimitKey::MonthlyInvoices.resets_daily());
        assert!(LimitKey::DailyApiCalls.resets_daily());
        assert!(!LimitKey::Users.resets_monthly());
    }
}
