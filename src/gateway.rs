//! Payment gateway adapters.
//!
//! Each gateway integration implements [`GatewayAdapter`]; the engine only
//! ever talks to the trait. Signature verification uses HMAC-SHA256 with a
//! constant-time comparison so verification time does not leak how much of
//! a forged signature matched.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use hmac::{Hmac, Mac};
use rust_decimal::Decimal;
use secrecy::{ExposeSecret, SecretString};
use serde::{Deserialize, Serialize};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{LicensingError, Result};
use crate::payment::{Gateway, PaymentConcept};

type HmacSha256 = Hmac<Sha256>;

/// Final verdict a gateway reports for a payment.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PaymentOutcome {
    Confirmed,
    Failed,
    Refunded,
}

impl PaymentOutcome {
    /// Convert to string.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
            Self::Refunded => "refunded",
        }
    }

    /// Parse a gateway outcome string.
    #[must_use]
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "confirmed" => Some(Self::Confirmed),
            "failed" => Some(Self::Failed),
            "refunded" => Some(Self::Refunded),
            _ => None,
        }
    }
}

/// A parsed, signature-verified gateway notification.
#[derive(Debug, Clone)]
pub struct PaymentEvent {
    pub gateway: Gateway,
    /// The merchant reference the payment was initiated with.
    pub external_transaction_id: String,
    pub outcome: PaymentOutcome,
    /// Original payload, kept for audit and debugging.
    pub raw: serde_json::Value,
}

/// Parameters for initiating a charge.
#[derive(Debug, Clone)]
pub struct PurchaseRequest {
    pub company_id: String,
    /// Merchant reference; the gateway echoes it back in events.
    pub external_transaction_id: String,
    pub amount: Decimal,
    pub currency: String,
    pub concept: PaymentConcept,
    pub metadata: HashMap<String, String>,
}

/// Gateway response to an initiated charge.
#[derive(Debug, Clone)]
pub struct InitiatedPurchase {
    /// Redirect URL or client token, depending on the gateway's flow.
    pub redirect_or_client_token: String,
    /// Set when the gateway opened a recurring subscription.
    pub gateway_subscription_id: Option<String>,
}

/// One payment gateway integration.
#[async_trait]
pub trait GatewayAdapter: Send + Sync {
    /// Which gateway this adapter talks to.
    fn gateway(&self) -> Gateway;

    /// Start a charge. The actual settlement arrives later as an event.
    async fn initiate_purchase(&self, request: &PurchaseRequest) -> Result<InitiatedPurchase>;

    /// Verify an event's signature against the shared secret.
    fn verify_event_signature(&self, payload: &[u8], signature: &str) -> Result<bool>;

    /// Parse a verified payload into a [`PaymentEvent`].
    fn parse_event(&self, payload: &[u8]) -> Result<PaymentEvent>;

    /// Ask the gateway for the current outcome of a payment, if decided.
    async fn query_payment(
        &self,
        external_transaction_id: &str,
    ) -> Result<Option<PaymentOutcome>>;

    /// Enable or disable auto-renewal on a gateway-managed subscription.
    async fn toggle_auto_renew(&self, gateway_subscription_id: &str, enabled: bool) -> Result<()>;

    /// Cancel a gateway-managed subscription.
    async fn cancel_subscription(&self, gateway_subscription_id: &str) -> Result<()>;
}

/// Registry of adapters keyed by gateway.
#[derive(Clone, Default)]
pub struct AdapterRegistry {
    adapters: HashMap<Gateway, Arc<dyn GatewayAdapter>>,
}

impl AdapterRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register an adapter, replacing any previous one for its gateway.
    #[must_use]
    pub fn register(mut self, adapter: Arc<dyn GatewayAdapter>) -> Self {
        self.adapters.insert(adapter.gateway(), adapter);
        self
    }

    /// Look up the adapter for a gateway.
    pub fn get(&self, gateway: Gateway) -> Result<Arc<dyn GatewayAdapter>> {
        self.adapters
            .get(&gateway)
            .cloned()
            .ok_or_else(|| LicensingError::AdapterNotRegistered {
                gateway: gateway.to_string(),
            })
    }
}

impl std::fmt::Debug for AdapterRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("AdapterRegistry")
            .field("gateways", &self.adapters.keys().collect::<Vec<_>>())
            .finish()
    }
}

/// Shared-secret HMAC-SHA256 signature verification.
///
/// Most gateway adapters delegate their `verify_event_signature` here.
#[derive(Clone)]
pub struct HmacSignatureVerifier {
    secret: SecretString,
}

impl HmacSignatureVerifier {
    #[must_use]
    pub fn new(secret: impl Into<String>) -> Self {
        Self {
            secret: SecretString::new(secret.into()),
        }
    }

    /// Compute the hex-encoded HMAC-SHA256 of a payload.
    pub fn compute(&self, payload: &[u8]) -> Result<String> {
        let mut mac = HmacSha256::new_from_slice(self.secret.expose_secret().as_bytes())
            .map_err(|e| LicensingError::Internal(format!("invalid HMAC key: {e}")))?;
        mac.update(payload);
        Ok(hex::encode(mac.finalize().into_bytes()))
    }

    /// Verify a hex-encoded signature in constant time.
    pub fn verify(&self, payload: &[u8], signature: &str) -> Result<bool> {
        let expected = self.compute(payload)?;
        Ok(expected.as_bytes().ct_eq(signature.as_bytes()).into())
    }
}

impl std::fmt::Debug for HmacSignatureVerifier {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HmacSignatureVerifier").finish_non_exhaustive()
    }
}

#[cfg(any(test, feature = "test-support"))]
pub mod test {
    //! Scriptable gateway adapter for tests.

    use std::sync::Mutex;

    use super::*;

    #[derive(Debug, Default)]
    struct MockState {
        initiated: Vec<PurchaseRequest>,
        fail_next_initiation: bool,
        hang_next_initiation: bool,
        query_results: HashMap<String, PaymentOutcome>,
        signature_valid: bool,
        auto_renew_calls: Vec<(String, bool)>,
        cancelled_subscriptions: Vec<String>,
        subscription_id: Option<String>,
    }

    /// [`GatewayAdapter`] whose behavior is scripted per test.
    #[derive(Debug)]
    pub struct MockGatewayAdapter {
        gateway: Gateway,
        state: Mutex<MockState>,
    }

    impl MockGatewayAdapter {
        #[must_use]
        pub fn new(gateway: Gateway) -> Self {
            Self {
                gateway,
                state: Mutex::new(MockState {
                    signature_valid: true,
                    ..MockState::default()
                }),
            }
        }

        /// Make the next `initiate_purchase` return a non-retryable error.
        pub fn fail_next_initiation(&self) {
            self.state.lock().unwrap().fail_next_initiation = true;
        }

        /// Make the next `initiate_purchase` sleep past any sane timeout.
        pub fn hang_next_initiation(&self) {
            self.state.lock().unwrap().hang_next_initiation = true;
        }

        /// Script the outcome `query_payment` reports for a reference.
        pub fn set_query_result(&self, external_transaction_id: &str, outcome: PaymentOutcome) {
            self.state
                .lock()
                .unwrap()
                .query_results
                .insert(external_transaction_id.to_string(), outcome);
        }

        /// Control whether signatures verify.
        pub fn set_signature_valid(&self, valid: bool) {
            self.state.lock().unwrap().signature_valid = valid;
        }

        /// Have initiations report a gateway-managed subscription id.
        pub fn set_subscription_id(&self, id: &str) {
            self.state.lock().unwrap().subscription_id = Some(id.to_string());
        }

        /// Requests passed to `initiate_purchase` so far.
        #[must_use]
        pub fn initiated(&self) -> Vec<PurchaseRequest> {
            self.state.lock().unwrap().initiated.clone()
        }

        /// `toggle_auto_renew` calls recorded so far.
        #[must_use]
        pub fn auto_renew_calls(&self) -> Vec<(String, bool)> {
            self.state.lock().unwrap().auto_renew_calls.clone()
        }

        /// Subscription ids passed to `cancel_subscription` so far.
        #[must_use]
        pub fn cancelled_subscriptions(&self) -> Vec<String> {
            self.state.lock().unwrap().cancelled_subscriptions.clone()
        }

        /// Build a signed-looking event payload in the mock's wire format.
        #[must_use]
        pub fn event_payload(external_transaction_id: &str, outcome: PaymentOutcome) -> Vec<u8> {
            serde_json::json!({
                "transaction_id": external_transaction_id,
                "outcome": outcome.as_str(),
            })
            .to_string()
            .into_bytes()
        }
    }

    #[async_trait]
    impl GatewayAdapter for MockGatewayAdapter {
        fn gateway(&self) -> Gateway {
            self.gateway
        }

        async fn initiate_purchase(&self, request: &PurchaseRequest) -> Result<InitiatedPurchase> {
            let (fail, hang, subscription_id) = {
                let mut state = self.state.lock().unwrap();
                state.initiated.push(request.clone());
                (
                    std::mem::take(&mut state.fail_next_initiation),
                    std::mem::take(&mut state.hang_next_initiation),
                    state.subscription_id.clone(),
                )
            };
            if hang {
                tokio::time::sleep(std::time::Duration::from_secs(3600)).await;
            }
            if fail {
                return Err(LicensingError::GatewayApi {
                    gateway: self.gateway.to_string(),
                    operation: "initiate_purchase".to_string(),
                    message: "scripted failure".to_string(),
                    retryable: false,
                });
            }
            Ok(InitiatedPurchase {
                redirect_or_client_token: format!(
                    "https://pay.example/{}",
                    request.external_transaction_id
                ),
                gateway_subscription_id: subscription_id,
            })
        }

        fn verify_event_signature(&self, _payload: &[u8], _signature: &str) -> Result<bool> {
            Ok(self.state.lock().unwrap().signature_valid)
        }

        fn parse_event(&self, payload: &[u8]) -> Result<PaymentEvent> {
            let value: serde_json::Value =
                serde_json::from_slice(payload).map_err(|e| LicensingError::InvalidEventPayload {
                    gateway: self.gateway.to_string(),
                    message: e.to_string(),
                })?;
            let transaction_id = value
                .get("transaction_id")
                .and_then(|v| v.as_str())
                .ok_or_else(|| LicensingError::InvalidEventPayload {
                    gateway: self.gateway.to_string(),
                    message: "missing transaction_id".to_string(),
                })?;
            let outcome = value
                .get("outcome")
                .and_then(|v| v.as_str())
                .and_then(PaymentOutcome::parse)
                .ok_or_else(|| LicensingError::InvalidEventPayload {
                    gateway: self.gateway.to_string(),
                    message: "missing or unknown outcome".to_string(),
                })?;
            Ok(PaymentEvent {
                gateway: self.gateway,
                external_transaction_id: transaction_id.to_string(),
                outcome,
                raw: value,
            })
        }

        async fn query_payment(
            &self,
            external_transaction_id: &str,
        ) -> Result<Option<PaymentOutcome>> {
            Ok(self
                .state
                .lock()
                .unwrap()
                .query_results
                .get(external_transaction_id)
                .copied())
        }

        async fn toggle_auto_renew(
            &self,
            gateway_subscription_id: &str,
            enabled: bool,
        ) -> Result<()> {
            self.state
                .lock()
                .unwrap()
                .auto_renew_calls
                .push((gateway_subscription_id.to_string(), enabled));
            Ok(())
        }

        async fn cancel_subscription(&self, gateway_subscription_id: &str) -> Result<()> {
            self.state
                .lock()
                .unwrap()
                .cancelled_subscriptions
                .push(gateway_subscription_id.to_string());
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_hmac_verify_accepts_own_signature() {
        let verifier = HmacSignatureVerifier::new("topsecret");
        let payload = br#"{"transaction_id":"tx-1","outcome":"confirmed"}"#;
        let signature = verifier.compute(payload).unwrap();
        assert!(verifier.verify(payload, &signature).unwrap());
    }

    #[test]
    fn test_hmac_verify_rejects_tampered_payload() {
        let verifier = HmacSignatureVerifier::new("topsecret");
        let signature = verifier.compute(b"original").unwrap();
        assert!(!verifier.verify(b"tampered", &signature).unwrap());
        assert!(!verifier.verify(b"original", "deadbeef").unwrap());
    }

    #[test]
    fn test_registry_lookup() {
        let registry = AdapterRegistry::new()
            .register(Arc::new(test::MockGatewayAdapter::new(Gateway::CardA)));
        assert!(registry.get(Gateway::CardA).is_ok());
        assert_eq!(
            registry.get(Gateway::WalletC).err(),
            Some(LicensingError::AdapterNotRegistered {
                gateway: "wallet_c".to_string()
            })
        );
    }

    #[test]
    fn test_outcome_parse() {
        assert_eq!(PaymentOutcome::parse("confirmed"), Some(PaymentOutcome::Confirmed));
        assert_eq!(PaymentOutcome::parse("failed"), Some(PaymentOutcome::Failed));
        assert_eq!(PaymentOutcome::parse("refunded"), Some(PaymentOutcome::Refunded));
        assert_eq!(PaymentOutcome::parse("unknown"), None);
    }
}
