//! Proration calculator.
//!
//! Pure functions, no I/O. All monetary rounding in the engine goes through
//! [`round2`] (half-up to two decimal places); mixing rounding strategies
//! across components makes UI totals and gateway charges diverge by a cent.

use chrono::{DateTime, Utc};
use rust_decimal::{Decimal, RoundingStrategy};
use rust_decimal_macros::dec;
use serde::{Deserialize, Serialize};

/// Billing cycle granularity for a subscription.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionType {
    /// Billed monthly.
    Monthly,
    /// Billed annually.
    Annual,
}

impl SubscriptionType {
    /// Convert to string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Monthly => "monthly",
            Self::Annual => "annual",
        }
    }
}

impl std::fmt::Display for SubscriptionType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Cycle length in days.
///
/// Fixed 30/365-day constants rather than calendar-accurate months/years.
/// This matches the billing behavior existing tenants were charged under
/// and must not be changed without an explicit product decision.
#[must_use]
pub fn cycle_days(subscription_type: SubscriptionType) -> i64 {
    match subscription_type {
        SubscriptionType::Monthly => 30,
        SubscriptionType::Annual => 365,
    }
}

/// Whole days remaining until the renewal date, floored at zero.
///
/// Both instants are normalized to midnight before subtracting, so a renewal
/// later today counts as zero days remaining.
#[must_use]
pub fn days_remaining(renewal_date: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    (renewal_date.date_naive() - now.date_naive()).num_days().max(0)
}

/// Round to two decimal places, half-up.
#[must_use]
pub fn round2(value: Decimal) -> Decimal {
    value.round_dp_with_strategy(2, RoundingStrategy::MidpointAwayFromZero)
}

/// Partial-cycle charge for a purchase made mid-cycle.
///
/// Returns the full price unchanged when the purchase happens at the very
/// start of a cycle (`days_remaining >= cycle_days`), and also within the
/// first 10% of the cycle, so tenants are never billed a trivial partial
/// amount right after a renewal.
#[must_use]
pub fn prorate(full_price: Decimal, days_remaining: i64, cycle_days: i64) -> Decimal {
    if cycle_days <= 0 || days_remaining >= cycle_days {
        return full_price;
    }
    // Cycle-skip: days_remaining >= 0.9 * cycle_days, kept in integer math.
    if days_remaining * 10 >= cycle_days * 9 {
        return full_price;
    }
    round2(full_price / Decimal::from(cycle_days) * Decimal::from(days_remaining))
}

/// Default Spanish VAT rate applied to all charges.
#[must_use]
pub fn default_iva_rate() -> Decimal {
    dec!(0.21)
}

/// A subtotal with its VAT line and grand total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct IvaBreakdown {
    pub subtotal: Decimal,
    pub iva: Decimal,
    pub total: Decimal,
}

/// Apply VAT to a subtotal, rounding each line half-up to the cent.
#[must_use]
pub fn apply_iva(subtotal: Decimal, rate: Decimal) -> IvaBreakdown {
    let subtotal = round2(subtotal);
    let iva = round2(subtotal * rate);
    IvaBreakdown {
        subtotal,
        iva,
        total: round2(subtotal + iva),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    #[test]
    fn test_cycle_days() {
        assert_eq!(cycle_days(SubscriptionType::Monthly), 30);
        assert_eq!(cycle_days(SubscriptionType::Annual), 365);
    }

    #[test]
    fn test_days_remaining_normalizes_to_midnight() {
        let renewal = Utc.with_ymd_and_hms(2026, 3, 15, 3, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 5, 22, 30, 0).unwrap();
        assert_eq!(days_remaining(renewal, now), 10);
    }

    #[test]
    fn test_days_remaining_floors_at_zero() {
        let renewal = Utc.with_ymd_and_hms(2026, 3, 1, 0, 0, 0).unwrap();
        let now = Utc.with_ymd_and_hms(2026, 3, 9, 12, 0, 0).unwrap();
        assert_eq!(days_remaining(renewal, now), 0);
    }

    #[test]
    fn test_prorate_full_cycle_returns_price_unchanged() {
        // No rounding drift at the boundary.
        let price = dec!(19.99);
        assert_eq!(prorate(price, 30, 30), price);
        assert_eq!(prorate(price, 45, 30), price);
    }

    #[test]
    fn test_prorate_zero_days_is_zero() {
        assert_eq!(prorate(dec!(19.99), 0, 30), dec!(0.00));
    }

    #[test]
    fn test_prorate_cycle_skip_first_tenth() {
        // 29 of 30 days remaining: within the first 10% of the cycle.
        assert_eq!(prorate(dec!(20), 29, 30), dec!(20));
        assert_eq!(prorate(dec!(100), 350, 365), dec!(100));
        // 27 days is exactly 0.9 * 30: still full price.
        assert_eq!(prorate(dec!(20), 27, 30), dec!(20));
        // 26 days prorates.
        assert_eq!(prorate(dec!(30), 26, 30), dec!(26.00));
    }

    #[test]
    fn test_prorate_mid_cycle_rounds_half_up() {
        // 20 / 30 * 10 = 6.666... -> 6.67
        assert_eq!(prorate(dec!(20), 10, 30), dec!(6.67));
        // 10 / 30 * 10 = 3.333... -> 3.33
        assert_eq!(prorate(dec!(10), 10, 30), dec!(3.33));
        // Exact midpoint rounds away from zero: 1 / 30 * 15 = 0.5 -> 0.50
        assert_eq!(prorate(dec!(1), 15, 30), dec!(0.50));
    }

    #[test]
    fn test_apply_iva_default_rate() {
        let b = apply_iva(dec!(100), default_iva_rate());
        assert_eq!(b.subtotal, dec!(100.00));
        assert_eq!(b.iva, dec!(21.00));
        assert_eq!(b.total, dec!(121.00));
    }

    #[test]
    fn test_apply_iva_rounds_each_line() {
        let b = apply_iva(dec!(6.67), default_iva_rate());
        assert_eq!(b.iva, dec!(1.40));
        assert_eq!(b.total, dec!(8.07));
    }
}
