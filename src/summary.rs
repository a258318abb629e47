//! Billing summary projection.
//!
//! Read-only views of what a tenant pays, assembled from the license and
//! the catalog. Nothing here mutates state.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

use crate::catalog::Catalog;
use crate::error::{LicensingError, Result};
use crate::external::{Company, CompanyDirectory};
use crate::license::{License, LicenseState};
use crate::proration::{apply_iva, round2, IvaBreakdown, SubscriptionType};
use crate::storage::LicenseStore;

/// One active add-on line in a summary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AddOnLine {
    pub slug: String,
    pub quantity: u32,
    pub monthly_price: Decimal,
}

/// What a tenant currently pays and when the next charge lands.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingSummary {
    pub company_id: String,
    pub plan_id: String,
    pub plan_name: String,
    pub subscription_type: SubscriptionType,
    pub state: LicenseState,
    /// Plan price at the license's cycle granularity, before VAT.
    pub base_price: Decimal,
    pub addons: Vec<AddOnLine>,
    /// What a month costs including add-ons, annual plans divided by 12.
    pub monthly_equivalent: Decimal,
    /// VAT applied to the full cycle price plus monthly add-ons.
    pub totals: IvaBreakdown,
    pub renewal_date: DateTime<Utc>,
    pub auto_renew: bool,
}

impl BillingSummary {
    /// Project a summary from a license.
    pub fn project(license: &License, catalog: &Catalog, iva_rate: Decimal) -> Result<Self> {
        let plan = catalog
            .resolve_plan(&license.plan_id)
            .ok_or_else(|| LicensingError::PlanNotFound {
                plan_id: license.plan_id.clone(),
            })?;

        let base_price = plan.price(license.subscription_type);
        let addons: Vec<AddOnLine> = license
            .active_addons()
            .map(|grant| AddOnLine {
                slug: grant.slug.clone(),
                quantity: grant.quantity,
                monthly_price: grant.monthly_price,
            })
            .collect();
        let addons_monthly: Decimal = addons
            .iter()
            .map(|line| line.monthly_price * Decimal::from(line.quantity))
            .sum();

        let plan_monthly = match license.subscription_type {
            SubscriptionType::Monthly => base_price,
            SubscriptionType::Annual => round2(base_price / Decimal::from(12)),
        };
        let monthly_equivalent = round2(plan_monthly + addons_monthly);
        let totals = apply_iva(base_price + addons_monthly, iva_rate);

        Ok(Self {
            company_id: license.company_id.clone(),
            plan_id: plan.id,
            plan_name: plan.name,
            subscription_type: license.subscription_type,
            state: license.state,
            base_price,
            addons,
            monthly_equivalent,
            totals,
            renewal_date: license.renewal_date,
            auto_renew: license.auto_renew,
        })
    }
}

/// A billing summary joined with company master data, ready for rendering.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BillingStatement {
    pub company: Company,
    pub summary: BillingSummary,
}

impl BillingStatement {
    /// Assemble a statement for a tenant.
    pub async fn assemble<S, D>(
        store: &S,
        directory: &D,
        catalog: &Catalog,
        company_id: &str,
        iva_rate: Decimal,
    ) -> Result<Self>
    where
        S: LicenseStore,
        D: CompanyDirectory,
    {
        let license = store
            .get_license(company_id)
            .await?
            .ok_or_else(|| LicensingError::LicenseNotFound {
                company_id: company_id.to_string(),
            })?;
        let company = directory
            .get_company(company_id)
            .await?
            .ok_or_else(|| LicensingError::Internal(format!(
                "company {company_id} has a license but no directory entry"
            )))?;
        let summary = BillingSummary::project(&license, catalog, iva_rate)?;
        Ok(Self { company, summary })
    }
}
