//! Engine configuration.

use std::time::Duration;

use rust_decimal::Decimal;

use crate::proration::default_iva_rate;

/// Tunable knobs for the licensing engine.
///
/// The defaults match production behavior; tests typically shrink the retry
/// backoff and gateway timeout.
#[derive(Debug, Clone)]
pub struct EngineConfig {
    /// Fraction of a quota at which a warning is emitted (0.0..1.0).
    pub warn_threshold: f64,
    /// VAT rate applied to every charge.
    pub iva_rate: Decimal,
    /// Attempts for optimistic-concurrency retry loops.
    pub max_retries: u32,
    /// Base delay between retry attempts, scaled linearly per attempt.
    pub retry_backoff: Duration,
    /// Upper bound on any single gateway call.
    pub gateway_timeout: Duration,
    /// Minimum age before the sweep job queries a pending payment.
    pub sweep_min_age: Duration,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            warn_threshold: 0.70,
            iva_rate: default_iva_rate(),
            max_retries: 3,
            retry_backoff: Duration::from_millis(50),
            gateway_timeout: Duration::from_secs(10),
            sweep_min_age: Duration::from_secs(15 * 60),
        }
    }
}

impl EngineConfig {
    /// Create a builder with default values.
    #[must_use]
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }
}

/// Builder for [`EngineConfig`].
#[derive(Debug, Default)]
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn warn_threshold(mut self, threshold: f64) -> Self {
        self.config.warn_threshold = threshold;
        self
    }

    #[must_use]
    pub fn iva_rate(mut self, rate: Decimal) -> Self {
        self.config.iva_rate = rate;
        self
    }

    #[must_use]
    pub fn max_retries(mut self, retries: u32) -> Self {
        self.config.max_retries = retries;
        self
    }

    #[must_use]
    pub fn retry_backoff(mut self, backoff: Duration) -> Self {
        self.config.retry_backoff = backoff;
        self
    }

    #[must_use]
    pub fn gateway_timeout(mut self, timeout: Duration) -> Self {
        self.config.gateway_timeout = timeout;
        self
    }

    #[must_use]
    pub fn sweep_min_age(mut self, age: Duration) -> Self {
        self.config.sweep_min_age = age;
        self
    }

    #[must_use]
    pub fn build(self) -> EngineConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.warn_threshold, 0.70);
        assert_eq!(config.iva_rate, dec!(0.21));
        assert_eq!(config.max_retries, 3);
    }

    #[test]
    fn test_builder_overrides() {
        let config = EngineConfig::builder()
            .warn_threshold(0.80)
            .max_retries(5)
            .gateway_timeout(Duration::from_secs(2))
            .build();
        assert_eq!(config.warn_threshold, 0.80);
        assert_eq!(config.max_retries, 5);
        assert_eq!(config.gateway_timeout, Duration::from_secs(2));
        assert_eq!(config.iva_rate, dec!(0.21));
    }
}
