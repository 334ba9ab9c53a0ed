//! Payment provider boundary
//!
//! Providers differ in payload shape, status vocabulary, and signing scheme.
//! Everything provider-specific is normalized here into small internal types
//! so the reconciler stays provider-agnostic.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::error::{PaymentError, PaymentResult};

/// Outbound request to create a hosted payment page.
#[derive(Debug, Clone, Serialize)]
pub struct CreatePaymentRequest {
    pub name: String,
    pub email: String,
    /// Integer amount in the smallest currency unit.
    pub amount: i64,
    pub mobile: String,
    /// Signed return URL the buyer is redirected to after paying.
    #[serde(rename = "redirectUrl")]
    pub redirect_url: String,
    /// Human-readable description. Embeds the invoice number so the webhook
    /// fallback extraction can recover it.
    pub description: String,
}

/// Successful create-payment response.
#[derive(Debug, Clone)]
pub struct HostedPayment {
    /// Hosted payment page the buyer is sent to.
    pub payment_url: String,
    /// Provider-assigned reference id, when returned synchronously.
    pub reference: Option<String>,
}

/// Status reported by the provider's query endpoint.
///
/// The poll path only distinguishes settled from not-yet-settled: anything
/// the provider reports short of success is `Pending` and the caller retries
/// later. A poll response never marks an intent failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProviderStatus {
    Success,
    Pending,
}

/// Normalized completion signal extracted from a webhook payload.
///
/// One small adapter per provider produces this at the boundary; the
/// reconciler never sees raw provider JSON.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CompletionEvent {
    pub invoice_number: String,
    /// True for a settled payment, false for a terminal failure
    /// (expired/cancelled). Non-terminal notifications never produce an
    /// event at all.
    pub success: bool,
}

/// Client for one payment provider backend.
#[async_trait]
pub trait PaymentProvider: Send + Sync {
    /// Provider name recorded on the intent row.
    fn name(&self) -> &str;

    /// Request a hosted payment link.
    async fn create_payment(
        &self,
        request: &CreatePaymentRequest,
    ) -> PaymentResult<HostedPayment>;

    /// Query the provider's status endpoint for an invoice (pull path).
    async fn query_status(&self, invoice_number: &str) -> PaymentResult<ProviderStatus>;

    /// Parse a webhook body into a normalized completion event.
    ///
    /// `Ok(None)` means a well-formed but non-terminal notification that
    /// should be acknowledged and ignored.
    fn parse_webhook(&self, body: &str) -> PaymentResult<Option<CompletionEvent>>;
}

/// Token prefix used when recovering an invoice number from free text.
pub const INVOICE_PREFIX: &str = "INV-";

/// Status strings treated as settled across supported providers.
const SUCCESS_STATUSES: &[&str] = &["SUCCESS", "PAID", "SETTLED", "SETTLEMENT", "CAPTURE"];

/// Status strings treated as terminally failed.
const FAILED_STATUSES: &[&str] = &["FAILED", "FAILURE", "EXPIRED", "EXPIRE", "CANCELLED", "DENY"];

/// Parse the common `{event, data: {...}}` webhook envelope.
///
/// The invoice number is resolved in order of preference: the explicit
/// external-reference field, then a prefix-token match against the free-text
/// description. The description fallback is a known-fragile heuristic kept
/// because not every provider echoes a structured reference; its use is
/// logged so silent mismatches surface in ops.
pub fn parse_envelope(body: &str) -> PaymentResult<Option<CompletionEvent>> {
    let value: serde_json::Value = serde_json::from_str(body)
        .map_err(|e| PaymentError::InvalidRequest(format!("malformed webhook body: {}", e)))?;

    let data = value
        .get("data")
        .ok_or_else(|| PaymentError::InvalidRequest("webhook missing data object".to_string()))?;

    let status = data
        .get("status")
        .or_else(|| data.get("transaction_status"))
        .and_then(|s| s.as_str())
        .map(|s| s.to_ascii_uppercase())
        .ok_or_else(|| {
            PaymentError::InvalidRequest("webhook missing status field".to_string())
        })?;

    let success = if SUCCESS_STATUSES.contains(&status.as_str()) {
        true
    } else if FAILED_STATUSES.contains(&status.as_str()) {
        false
    } else {
        // Non-terminal notification (e.g. payment created) - acknowledge
        // without acting on it.
        tracing::debug!(status = %status, "Ignoring non-terminal webhook status");
        return Ok(None);
    };

    let invoice_number = extract_invoice_number(data).ok_or_else(|| {
        PaymentError::InvalidRequest("webhook carries no resolvable invoice number".to_string())
    })?;

    Ok(Some(CompletionEvent {
        invoice_number,
        success,
    }))
}

fn extract_invoice_number(data: &serde_json::Value) -> Option<String> {
    // Preferred: explicit reference fields.
    for field in ["external_reference", "invoice_number", "external_id", "order_id"] {
        if let Some(reference) = data.get(field).and_then(|v| v.as_str()) {
            if reference.starts_with(INVOICE_PREFIX) {
                return Some(reference.to_string());
            }
        }
    }

    // Fallback: pattern-match the prefix token out of the description.
    let description = data.get("description").and_then(|v| v.as_str())?;
    let token = find_invoice_token(description)?;
    tracing::warn!(
        invoice_number = %token,
        "Resolved invoice number from webhook description text, not a structured field"
    );
    Some(token)
}

/// Scan free text for an `INV-` token: the prefix followed by the longest
/// run of `[A-Za-z0-9-]` characters.
fn find_invoice_token(text: &str) -> Option<String> {
    let start = text.find(INVOICE_PREFIX)?;
    let candidate: String = text[start..]
        .chars()
        .take_while(|c| c.is_ascii_alphanumeric() || *c == '-')
        .collect();
    if candidate.len() > INVOICE_PREFIX.len() {
        Some(candidate)
    } else {
        None
    }
}
