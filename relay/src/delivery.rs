//! Signed webhook delivery.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use metrics::counter;
use tracing::{debug, info, warn};

use crate::event::DeliveryOutcome;
use crate::http::{HttpClient, HttpRequest};
use crate::signing;

pub const DEFAULT_DELIVERY_TIMEOUT: Duration = Duration::from_secs(30);
pub const DEFAULT_SIGNATURE_HEADER: &str = "Stripe-Signature";

/// Error recorded when delivery is switched off.
pub const DELIVERY_DISABLED: &str = "Delivery disabled";

/// Process-wide delivery on/off switch. Clones share state.
///
/// Consulted by the ingestion gateway, the delivery client and the reference
/// receiver. Starts from configuration and is not persisted.
#[derive(Debug, Clone)]
pub struct DeliverySwitch(Arc<AtomicBool>);

impl DeliverySwitch {
    pub fn new(enabled: bool) -> Self {
        Self(Arc::new(AtomicBool::new(enabled)))
    }

    pub fn enable(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn disable(&self) {
        self.0.store(false, Ordering::SeqCst);
    }

    pub fn set(&self, enabled: bool) {
        self.0.store(enabled, Ordering::SeqCst);
    }

    pub fn is_enabled(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }
}

impl Default for DeliverySwitch {
    fn default() -> Self {
        Self::new(true)
    }
}

/// Signs payloads and POSTs them to tenant endpoints.
#[derive(Clone)]
pub struct DeliveryClient {
    http: Arc<dyn HttpClient>,
    switch: DeliverySwitch,
    timeout: Duration,
    signature_header: String,
}

impl DeliveryClient {
    pub fn new(http: Arc<dyn HttpClient>, switch: DeliverySwitch) -> Self {
        Self {
            http,
            switch,
            timeout: DEFAULT_DELIVERY_TIMEOUT,
            signature_header: DEFAULT_SIGNATURE_HEADER.to_string(),
        }
    }

    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = timeout;
        self
    }

    pub fn with_signature_header(mut self, header: impl Into<String>) -> Self {
        self.signature_header = header.into();
        self
    }

    pub fn signature_header(&self) -> &str {
        &self.signature_header
    }

    /// Deliver `payload` to `target_url`, signed with `secret`.
    ///
    /// Never fails: every problem becomes a failed outcome with its reason.
    #[tracing::instrument(skip(self, payload, secret), fields(target_url = %target_url))]
    pub async fn deliver(&self, target_url: &str, payload: &serde_json::Value, secret: &str) -> DeliveryOutcome {
        let outcome = self.attempt(target_url, payload, secret).await;
        counter!("relay_deliveries_total", "outcome" => outcome.label()).increment(1);
        outcome
    }

    async fn attempt(&self, target_url: &str, payload: &serde_json::Value, secret: &str) -> DeliveryOutcome {
        if !self.switch.is_enabled() {
            debug!("Delivery disabled, skipping POST");
            return DeliveryOutcome::failed(None, DELIVERY_DISABLED);
        }

        // The signed bytes and the sent bytes must be identical
        let body = match serde_json::to_vec(payload) {
            Ok(body) => body,
            Err(e) => return DeliveryOutcome::failed(None, format!("Unexpected error: {e}")),
        };
        let signature = signing::sign_now(secret, &body);

        let request = HttpRequest {
            url: target_url.to_string(),
            headers: vec![(self.signature_header.clone(), signature)],
            body,
            timeout: self.timeout,
        };

        match self.http.post(request).await {
            Ok(response) if (200..300).contains(&response.status) => {
                info!(status = response.status, "Webhook delivered");
                DeliveryOutcome::delivered(response.status)
            }
            Ok(response) => {
                warn!(status = response.status, "Webhook endpoint returned non-2xx");
                DeliveryOutcome::failed(Some(response.status), format!("HTTP {}", response.status))
            }
            Err(e) => {
                warn!(error = %e, "Webhook delivery failed");
                DeliveryOutcome::failed(None, e.to_string())
            }
        }
    }
}
