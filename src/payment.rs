// =============================================================================
// PAYMENT MODULE
// =============================================================================
// Interface to the external payment processor.
//
// The core only ever takes a hold for the full original price at
// reservation time (authorize), charges a smaller-or-equal amount at
// settlement (capture), or releases the hold on cancellation. All three
// calls carry an idempotency key so a retried request cannot move money
// twice, and every call runs under a bounded timeout: a timeout is a
// failure, never a success.
// =============================================================================

use std::fmt;
use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};

// =============================================================================
// DECLINE TAXONOMY
// =============================================================================
/// Why the processor refused an authorization.
///
/// Card-level declines are worth prompting the user for a different
/// payment method; `ProcessingError` and `Requires3ds` are not.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeclineReason {
    InsufficientFunds,
    GenericDecline,
    StolenCard,
    LostCard,
    ExpiredCard,
    IncorrectCvc,
    ProcessingError,
    Requires3ds,
}

impl DeclineReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeclineReason::InsufficientFunds => "insufficient_funds",
            DeclineReason::GenericDecline => "generic_decline",
            DeclineReason::StolenCard => "stolen_card",
            DeclineReason::LostCard => "lost_card",
            DeclineReason::ExpiredCard => "expired_card",
            DeclineReason::IncorrectCvc => "incorrect_cvc",
            DeclineReason::ProcessingError => "processing_error",
            DeclineReason::Requires3ds => "requires_3ds",
        }
    }

    /// Whether the client should prompt for a different payment method.
    pub fn prompt_new_method(&self) -> bool {
        !matches!(
            self,
            DeclineReason::ProcessingError | DeclineReason::Requires3ds
        )
    }
}

impl fmt::Display for DeclineReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

// =============================================================================
// GATEWAY ERRORS
// =============================================================================
/// Failure modes of a gateway call, before mapping into AppError.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GatewayError {
    /// The processor answered and said no
    Declined(DeclineReason),

    /// The bounded timeout elapsed; treated exactly like a failure
    Timeout,

    /// Transport-level failure (connection refused, 5xx, bad body)
    Unavailable(String),
}

impl fmt::Display for GatewayError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GatewayError::Declined(reason) => write!(f, "declined: {}", reason),
            GatewayError::Timeout => write!(f, "timed out"),
            GatewayError::Unavailable(msg) => write!(f, "unavailable: {}", msg),
        }
    }
}

/// Run a gateway call under a hard deadline.
pub async fn with_timeout<T, F>(limit: Duration, fut: F) -> Result<T, GatewayError>
where
    F: Future<Output = Result<T, GatewayError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(GatewayError::Timeout),
    }
}

// =============================================================================
// GATEWAY TRAIT
// =============================================================================
/// The three processor operations the core consumes. All must be
/// idempotent under retry with the same idempotency key; implementation
/// details (retries, reconciliation) are the processor's concern.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    /// Place a hold for `amount` against the given payment method.
    /// Returns the processor's hold reference.
    async fn authorize(
        &self,
        amount: Decimal,
        payment_method_ref: &str,
        idempotency_key: &str,
    ) -> Result<String, GatewayError>;

    /// Charge `amount` against an existing hold. `amount` must not
    /// exceed the amount the hold was taken for.
    async fn capture(
        &self,
        hold_id: &str,
        amount: Decimal,
        idempotency_key: &str,
    ) -> Result<(), GatewayError>;

    /// Release a hold without charging it.
    async fn release(&self, hold_id: &str, idempotency_key: &str) -> Result<(), GatewayError>;
}

// =============================================================================
// HTTP GATEWAY CLIENT
// =============================================================================

#[derive(Debug, Deserialize)]
struct AuthorizeResponse {
    hold_id: Option<String>,
    decline_reason: Option<DeclineReason>,
}

#[derive(Debug, Serialize)]
struct AuthorizeBody<'a> {
    amount: Decimal,
    payment_method: &'a str,
}

#[derive(Debug, Serialize)]
struct CaptureBody {
    amount: Decimal,
}

/// reqwest-backed client for the processor's REST API.
#[derive(Clone)]
pub struct HttpPaymentGateway {
    client: reqwest::Client,
    base_url: String,
}

impl HttpPaymentGateway {
    /// `timeout` bounds every request end-to-end; the per-call
    /// `with_timeout` wrapper at the call sites is the hard backstop.
    pub fn new(base_url: impl Into<String>, timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .connect_timeout(timeout)
            .build()?;
        Ok(Self {
            client,
            base_url: base_url.into(),
        })
    }

    fn map_transport_err(err: reqwest::Error) -> GatewayError {
        if err.is_timeout() {
            GatewayError::Timeout
        } else {
            GatewayError::Unavailable(err.to_string())
        }
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn authorize(
        &self,
        amount: Decimal,
        payment_method_ref: &str,
        idempotency_key: &str,
    ) -> Result<String, GatewayError> {
        let response = self
            .client
            .post(format!("{}/v1/holds", self.base_url))
            .header("Idempotency-Key", idempotency_key)
            .json(&AuthorizeBody {
                amount,
                payment_method: payment_method_ref,
            })
            .send()
            .await
            .map_err(Self::map_transport_err)?;

        let status = response.status();
        let body: AuthorizeResponse = response
            .json()
            .await
            .map_err(|e| GatewayError::Unavailable(e.to_string()))?;

        if status.is_success() {
            body.hold_id
                .ok_or_else(|| GatewayError::Unavailable("missing hold_id".to_string()))
        } else {
            Err(GatewayError::Declined(
                body.decline_reason.unwrap_or(DeclineReason::ProcessingError),
            ))
        }
    }

    async fn capture(
        &self,
        hold_id: &str,
        amount: Decimal,
        idempotency_key: &str,
    ) -> Result<(), GatewayError> {
        let response = self
            .client
            .post(format!("{}/v1/holds/{}/capture", self.base_url, hold_id))
            .header("Idempotency-Key", idempotency_key)
            .json(&CaptureBody { amount })
            .send()
            .await
            .map_err(Self::map_transport_err)?;

        if response.status().is_success() {
            Ok(())
        } else {
            let detail = response.text().await.unwrap_or_default();
            Err(GatewayError::Unavailable(format!(
                "capture rejected: {}",
                detail
            )))
        }
    }

    async fn release(&self, hold_id: &str, idempotency_key: &str) -> Result<(), GatewayError> {
        let response = self
            .client
            .post(format!("{}/v1/holds/{}/release", self.base_url, hold_id))
            .header("Idempotency-Key", idempotency_key)
            .send()
            .await
            .map_err(Self::map_transport_err)?;

        if response.status().is_success() {
            Ok(())
        } else {
            Err(GatewayError::Unavailable("release rejected".to_string()))
        }
    }
}

// =============================================================================
// TEST GATEWAY
// =============================================================================
// An in-memory gateway for unit tests: scripted declines, per-hold
// capture failures, optional artificial delay, and call counters so
// tests can assert idempotency (no second capture on re-settlement).
#[cfg(test)]
pub mod testing {
    use super::*;
    use std::collections::HashSet;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    #[derive(Default)]
    pub struct MockGateway {
        /// Every authorize is declined with this reason when set
        pub decline_with: Mutex<Option<DeclineReason>>,
        /// Captures against these hold ids fail
        pub fail_capture_holds: Mutex<HashSet<String>>,
        /// Artificial latency before answering, for timeout tests
        pub call_delay: Mutex<Option<Duration>>,

        pub authorize_calls: AtomicUsize,
        pub capture_calls: AtomicUsize,
        pub release_calls: AtomicUsize,
        next_hold: AtomicUsize,
    }

    impl MockGateway {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn declining(reason: DeclineReason) -> Self {
            let gw = Self::default();
            *gw.decline_with.lock().unwrap() = Some(reason);
            gw
        }

        pub fn fail_capture_for(&self, hold_id: &str) {
            self.fail_capture_holds
                .lock()
                .unwrap()
                .insert(hold_id.to_string());
        }

        pub fn set_delay(&self, delay: Duration) {
            *self.call_delay.lock().unwrap() = Some(delay);
        }

        async fn maybe_delay(&self) {
            let delay = *self.call_delay.lock().unwrap();
            if let Some(d) = delay {
                tokio::time::sleep(d).await;
            }
        }
    }

    #[async_trait]
    impl PaymentGateway for MockGateway {
        async fn authorize(
            &self,
            _amount: Decimal,
            _payment_method_ref: &str,
            _idempotency_key: &str,
        ) -> Result<String, GatewayError> {
            self.authorize_calls.fetch_add(1, Ordering::SeqCst);
            self.maybe_delay().await;

            if let Some(reason) = *self.decline_with.lock().unwrap() {
                return Err(GatewayError::Declined(reason));
            }
            let n = self.next_hold.fetch_add(1, Ordering::SeqCst);
            Ok(format!("hold-{}", n))
        }

        async fn capture(
            &self,
            hold_id: &str,
            _amount: Decimal,
            _idempotency_key: &str,
        ) -> Result<(), GatewayError> {
            self.capture_calls.fetch_add(1, Ordering::SeqCst);
            self.maybe_delay().await;

            if self.fail_capture_holds.lock().unwrap().contains(hold_id) {
                return Err(GatewayError::Unavailable(
                    "capture rejected by processor".to_string(),
                ));
            }
            Ok(())
        }

        async fn release(&self, _hold_id: &str, _idempotency_key: &str) -> Result<(), GatewayError> {
            self.release_calls.fetch_add(1, Ordering::SeqCst);
            self.maybe_delay().await;
            Ok(())
        }
    }
}

#[cfg(test)]
mod tests {
    use super::testing::MockGateway;
    use super::*;
    use rust_decimal_macros::dec;

    #[test]
    fn card_declines_prompt_for_new_method() {
        assert!(DeclineReason::InsufficientFunds.prompt_new_method());
        assert!(DeclineReason::ExpiredCard.prompt_new_method());
        assert!(DeclineReason::StolenCard.prompt_new_method());
        assert!(!DeclineReason::ProcessingError.prompt_new_method());
        assert!(!DeclineReason::Requires3ds.prompt_new_method());
    }

    #[tokio::test]
    async fn slow_gateway_call_times_out_as_failure() {
        let gw = MockGateway::new();
        gw.set_delay(Duration::from_millis(200));

        let result = with_timeout(
            Duration::from_millis(20),
            gw.authorize(dec!(100), "pm_1", "key-1"),
        )
        .await;

        assert_eq!(result, Err(GatewayError::Timeout));
    }

    #[tokio::test]
    async fn mock_gateway_hands_out_distinct_holds() {
        let gw = MockGateway::new();
        let a = gw.authorize(dec!(10), "pm_1", "k1").await.unwrap();
        let b = gw.authorize(dec!(20), "pm_1", "k2").await.unwrap();
        assert_ne!(a, b);
    }
}
