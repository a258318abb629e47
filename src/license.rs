//! The license aggregate.
//!
//! One [`License`] per tenant company. The aggregate owns the subscription
//! state machine, the add-on grants, the usage counters and the audit trail,
//! and is persisted as a whole with an optimistic version counter.
//!
//! Audit actions keep the exact Spanish action strings the historical data
//! was written with; downstream reporting queries match on them literally.

use std::collections::{BTreeSet, HashMap};

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::catalog::LimitKey;
use crate::error::{LicensingError, Result};
use crate::payment::Gateway;
use crate::proration::{cycle_days, SubscriptionType};

/// License lifecycle states.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LicenseState {
    /// Evaluation period; full access until `trial_ends_at`.
    Trial,
    /// Paid and current.
    Active,
    /// Temporarily blocked (payment problems, administrative hold).
    Suspended,
    /// Terminated by the tenant or by a missed renewal.
    Cancelled,
    /// Trial ended without conversion.
    Expired,
}

impl LicenseState {
    /// Convert to string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trial => "trial",
            Self::Active => "active",
            Self::Suspended => "suspended",
            Self::Cancelled => "cancelled",
            Self::Expired => "expired",
        }
    }
}

impl std::fmt::Display for LicenseState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Audit trail actions.
///
/// The wire strings are frozen; reporting matches on them literally.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum AuditAction {
    LicenseCreated,
    TrialExpired,
    PlanChanged,
    PlanChangeScheduled,
    AddOnsActivated,
    AddOnCancelled,
    PaymentFailed,
    Cancelled,
    CancellationScheduled,
    Renewed,
    AutoRenewed,
}

impl AuditAction {
    /// Convert to the frozen audit string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::LicenseCreated => "LICENCIA_CREADA",
            Self::TrialExpired => "TRIAL_EXPIRED",
            Self::PlanChanged => "CAMBIO_PLAN",
            Self::PlanChangeScheduled => "CAMBIO_PLAN_PROGRAMADO",
            Self::AddOnsActivated => "ACTIVACION_ADDONS",
            Self::AddOnCancelled => "ADDON_CANCELADO",
            Self::PaymentFailed => "PAGO_FALLIDO",
            Self::Cancelled => "CANCELACION",
            Self::CancellationScheduled => "CANCELACION_PROGRAMADA",
            Self::Renewed => "RENOVACION",
            Self::AutoRenewed => "AUTO_RENOVACION",
        }
    }
}

impl std::fmt::Display for AuditAction {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One line in a license's audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub timestamp: DateTime<Utc>,
    pub action: AuditAction,
    pub detail: String,
}

/// An add-on attached to a license.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddOnGrant {
    pub addon_id: String,
    pub slug: String,
    pub quantity: u32,
    pub monthly_price: Decimal,
    pub active: bool,
    pub activated_at: DateTime<Utc>,
    /// Deactivated at the next renewal instead of immediately.
    pub cancel_at_renewal: bool,
    pub cancelled_at: Option<DateTime<Utc>>,
}

/// Link to a recurring subscription managed by a gateway.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GatewaySubscriptionRef {
    pub gateway: Gateway,
    pub external_id: String,
}

/// Per-tenant license aggregate.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct License {
    pub id: Uuid,
    pub company_id: String,
    /// Catalog plan reference (id, with slug fallback on resolution).
    pub plan_id: String,
    pub subscription_type: SubscriptionType,
    pub state: LicenseState,
    pub is_trial: bool,
    pub trial_started_at: Option<DateTime<Utc>>,
    pub trial_ends_at: Option<DateTime<Utc>>,
    pub renewal_date: DateTime<Utc>,
    pub auto_renew: bool,
    pub cancellation_date: Option<DateTime<Utc>>,
    /// Set by a scheduled cancellation; applied at the next renewal.
    pub cancel_at_renewal: bool,
    /// Upgrade awaiting payment confirmation.
    pub pending_plan_id: Option<String>,
    /// Downgrade applied at the next renewal.
    pub scheduled_plan_id: Option<String>,
    /// Add-on purchases awaiting payment confirmation.
    pub pending_addon_slugs: BTreeSet<String>,
    pub addons: Vec<AddOnGrant>,
    pub gateway_ref: Option<GatewaySubscriptionRef>,
    pub usage: HashMap<LimitKey, i64>,
    pub history: Vec<AuditEntry>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    /// Optimistic concurrency counter, bumped by the store on every save.
    pub version: u64,
}

impl License {
    /// Create a trial license on the given plan.
    #[must_use]
    pub fn new_trial(
        company_id: &str,
        plan_id: &str,
        subscription_type: SubscriptionType,
        trial_days: i64,
        now: DateTime<Utc>,
    ) -> Self {
        let trial_end = now + chrono::Duration::days(trial_days);
        let mut license = Self {
            id: Uuid::new_v4(),
            company_id: company_id.to_string(),
            plan_id: plan_id.to_string(),
            subscription_type,
            state: LicenseState::Trial,
            is_trial: true,
            trial_started_at: Some(now),
            trial_ends_at: Some(trial_end),
            renewal_date: trial_end,
            auto_renew: true,
            cancellation_date: None,
            cancel_at_renewal: false,
            pending_plan_id: None,
            scheduled_plan_id: None,
            pending_addon_slugs: BTreeSet::new(),
            addons: Vec::new(),
            gateway_ref: None,
            usage: HashMap::new(),
            history: Vec::new(),
            created_at: now,
            updated_at: now,
            version: 0,
        };
        license.audit(
            AuditAction::LicenseCreated,
            format!("plan={plan_id} trial_days={trial_days}"),
            now,
        );
        license
    }

    /// Append an audit entry.
    pub fn audit(&mut self, action: AuditAction, detail: String, now: DateTime<Utc>) {
        self.history.push(AuditEntry {
            timestamp: now,
            action,
            detail,
        });
        self.updated_at = now;
    }

    /// Whether the license is in a terminal state.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        matches!(self.state, LicenseState::Cancelled | LicenseState::Expired)
    }

    /// Trial licenses past their end date are expired even before the
    /// persisted state catches up.
    #[must_use]
    pub fn is_trial_expired(&self, now: DateTime<Utc>) -> bool {
        self.state == LicenseState::Trial
            && self
                .trial_ends_at
                .map(|end| end <= now)
                .unwrap_or(false)
    }

    /// Lazily flip an overdue trial to `Expired`. Returns true if it did.
    pub fn expire_if_trial_over(&mut self, now: DateTime<Utc>) -> bool {
        if self.is_trial_expired(now) {
            self.state = LicenseState::Expired;
            self.audit(AuditAction::TrialExpired, String::new(), now);
            true
        } else {
            false
        }
    }

    /// Whether the tenant currently has access.
    #[must_use]
    pub fn is_active(&self, now: DateTime<Utc>) -> bool {
        match self.state {
            LicenseState::Active => true,
            LicenseState::Trial => !self.is_trial_expired(now),
            _ => false,
        }
    }

    /// Current usage for a key, zero when never incremented.
    #[must_use]
    pub fn usage_of(&self, key: LimitKey) -> i64 {
        self.usage.get(&key).copied().unwrap_or(0)
    }

    /// Grants currently contributing entitlements.
    pub fn active_addons(&self) -> impl Iterator<Item = &AddOnGrant> {
        self.addons.iter().filter(|g| g.active)
    }

    /// Whether an add-on slug is currently active on this license.
    #[must_use]
    pub fn has_active_addon(&self, slug: &str) -> bool {
        self.active_addons().any(|g| g.slug == slug)
    }

    /// Stage an upgrade; the plan is not applied until payment confirms.
    pub fn set_pending_plan(&mut self, plan_id: &str) -> Result<()> {
        if self.is_terminal() {
            return Err(LicensingError::LicenseCancelled {
                company_id: self.company_id.clone(),
            });
        }
        if self.pending_plan_id.is_some() {
            return Err(LicensingError::PendingChangeExists { kind: "plan" });
        }
        if self.plan_id == plan_id {
            return Err(LicensingError::PlanUnchanged {
                plan_id: plan_id.to_string(),
            });
        }
        self.pending_plan_id = Some(plan_id.to_string());
        Ok(())
    }

    /// Stage add-on purchases; grants are not created until payment confirms.
    pub fn set_pending_addons(&mut self, slugs: &[String]) -> Result<()> {
        if self.is_terminal() {
            return Err(LicensingError::LicenseCancelled {
                company_id: self.company_id.clone(),
            });
        }
        if !self.pending_addon_slugs.is_empty() {
            return Err(LicensingError::PendingChangeExists { kind: "add-on" });
        }
        for slug in slugs {
            if self.has_active_addon(slug) {
                return Err(LicensingError::AddOnAlreadyActive { slug: slug.clone() });
            }
        }
        self.pending_addon_slugs = slugs.iter().cloned().collect();
        Ok(())
    }

    /// Schedule a downgrade for the next renewal.
    pub fn schedule_downgrade(&mut self, plan_id: &str, now: DateTime<Utc>) -> Result<()> {
        if self.is_terminal() {
            return Err(LicensingError::LicenseCancelled {
                company_id: self.company_id.clone(),
            });
        }
        if self.scheduled_plan_id.is_some() {
            return Err(LicensingError::PendingChangeExists { kind: "plan" });
        }
        if self.plan_id == plan_id {
            return Err(LicensingError::PlanUnchanged {
                plan_id: plan_id.to_string(),
            });
        }
        self.scheduled_plan_id = Some(plan_id.to_string());
        self.audit(
            AuditAction::PlanChangeScheduled,
            format!("plan={plan_id} effective={}", self.renewal_date.date_naive()),
            now,
        );
        Ok(())
    }

    /// Apply a paid plan change immediately and start a fresh cycle.
    pub fn commit_plan_change(&mut self, plan_id: &str, now: DateTime<Utc>) {
        let previous = std::mem::replace(&mut self.plan_id, plan_id.to_string());
        self.is_trial = false;
        self.state = LicenseState::Active;
        self.renewal_date = now + chrono::Duration::days(cycle_days(self.subscription_type));
        self.audit(
            AuditAction::PlanChanged,
            format!("from={previous} to={plan_id}"),
            now,
        );
    }

    /// Confirm all staged changes after a successful payment.
    ///
    /// Applies the pending plan (if any), attaches the resolved add-on
    /// grants with a single audit entry listing every activated slug, and
    /// converts a trial to a paid license.
    pub fn confirm_pending(&mut self, grants: Vec<AddOnGrant>, now: DateTime<Utc>) {
        if let Some(plan_id) = self.pending_plan_id.take() {
            self.commit_plan_change(&plan_id, now);
        }
        if !grants.is_empty() {
            let slugs: Vec<&str> = grants.iter().map(|g| g.slug.as_str()).collect();
            self.audit(AuditAction::AddOnsActivated, slugs.join(","), now);
            self.addons.extend(grants);
        }
        self.pending_addon_slugs.clear();
        if !self.is_terminal() {
            self.is_trial = false;
            self.state = LicenseState::Active;
        }
        self.updated_at = now;
    }

    /// Attach a grant directly, bypassing the pending stage.
    ///
    /// Used for administrative grants that carry no payment.
    pub fn grant_addon(&mut self, grant: AddOnGrant, now: DateTime<Utc>) -> Result<()> {
        if self.has_active_addon(&grant.slug) {
            return Err(LicensingError::AddOnAlreadyActive { slug: grant.slug });
        }
        self.audit(AuditAction::AddOnsActivated, grant.slug.clone(), now);
        self.addons.push(grant);
        Ok(())
    }

    /// Cancel the license, immediately or at the next renewal.
    pub fn cancel(&mut self, immediate: bool, now: DateTime<Utc>) -> Result<()> {
        if self.is_terminal() {
            return Err(LicensingError::LicenseCancelled {
                company_id: self.company_id.clone(),
            });
        }
        if immediate {
            self.state = LicenseState::Cancelled;
            self.auto_renew = false;
            self.cancellation_date = Some(now);
            self.audit(AuditAction::Cancelled, String::new(), now);
        } else {
            self.cancel_at_renewal = true;
            self.auto_renew = false;
            self.audit(
                AuditAction::CancellationScheduled,
                format!("effective={}", self.renewal_date.date_naive()),
                now,
            );
        }
        Ok(())
    }

    /// Toggle auto-renewal.
    pub fn set_auto_renew(&mut self, enabled: bool) -> Result<()> {
        if self.is_terminal() {
            return Err(LicensingError::LicenseCancelled {
                company_id: self.company_id.clone(),
            });
        }
        self.auto_renew = enabled;
        Ok(())
    }

    /// Cancel an add-on, immediately or at the next renewal.
    pub fn cancel_addon(&mut self, slug: &str, at_renewal: bool, now: DateTime<Utc>) -> Result<()> {
        let grant = self
            .addons
            .iter_mut()
            .find(|g| g.active && g.slug == slug)
            .ok_or_else(|| LicensingError::AddOnNotActive {
                slug: slug.to_string(),
            })?;
        if at_renewal {
            grant.cancel_at_renewal = true;
        } else {
            grant.active = false;
            grant.cancelled_at = Some(now);
        }
        self.audit(AuditAction::AddOnCancelled, slug.to_string(), now);
        Ok(())
    }

    /// Roll the license into the next billing cycle.
    ///
    /// Applies a scheduled cancellation or downgrade first, deactivates
    /// grants marked to end at renewal, and advances the renewal date by
    /// one full cycle.
    pub fn renew(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.is_terminal() {
            return Err(LicensingError::LicenseCancelled {
                company_id: self.company_id.clone(),
            });
        }
        if self.cancel_at_renewal {
            self.cancel_at_renewal = false;
            self.state = LicenseState::Cancelled;
            self.cancellation_date = Some(now);
            self.audit(AuditAction::Cancelled, "scheduled".to_string(), now);
            return Ok(());
        }
        if let Some(plan_id) = self.scheduled_plan_id.take() {
            let previous = std::mem::replace(&mut self.plan_id, plan_id.clone());
            self.audit(
                AuditAction::PlanChanged,
                format!("from={previous} to={plan_id} scheduled"),
                now,
            );
        }
        for grant in &mut self.addons {
            if grant.active && grant.cancel_at_renewal {
                grant.active = false;
                grant.cancelled_at = Some(now);
            }
        }
        self.renewal_date = now + chrono::Duration::days(cycle_days(self.subscription_type));
        let action = if self.auto_renew {
            AuditAction::AutoRenewed
        } else {
            AuditAction::Renewed
        };
        self.audit(action, format!("until={}", self.renewal_date.date_naive()), now);
        Ok(())
    }

    /// Suspend an active license.
    pub fn suspend(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.state != LicenseState::Active {
            return Err(LicensingError::InvalidTransition {
                from: self.state,
                to: LicenseState::Suspended,
            });
        }
        self.state = LicenseState::Suspended;
        self.updated_at = now;
        Ok(())
    }

    /// Resume a suspended license.
    pub fn resume(&mut self, now: DateTime<Utc>) -> Result<()> {
        if self.state != LicenseState::Suspended {
            return Err(LicensingError::InvalidTransition {
                from: self.state,
                to: LicenseState::Active,
            });
        }
        self.state = LicenseState::Active;
        self.updated_at = now;
        Ok(())
    }
}
