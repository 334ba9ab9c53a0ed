//! HTTP payment gateway client
//!
//! Reqwest-based `PaymentProvider` implementation for gateways that use the
//! header-signed request scheme: an HMAC-SHA256 over a canonical string of
//! client id, request id, timestamp, request path, and (for bodies) a SHA-256
//! digest. All outbound calls carry an explicit timeout and surface
//! `Timeout` instead of hanging.

use async_trait::async_trait;
use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use hmac::{Hmac, Mac};
use sha2::{Digest, Sha256};
use std::time::Duration;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{PaymentError, PaymentResult};
use crate::provider::{
    parse_envelope, CompletionEvent, CreatePaymentRequest, HostedPayment, PaymentProvider,
    ProviderStatus,
};

type HmacSha256 = Hmac<Sha256>;

const DEFAULT_TIMEOUT_SECS: u64 = 5;
const CHECKOUT_PATH: &str = "/checkout/v1/payment";
const STATUS_PATH_PREFIX: &str = "/orders/v1/status";

/// Gateway credentials and endpoints.
#[derive(Debug, Clone)]
pub struct GatewayConfig {
    /// Provider name recorded on intents (e.g. "doku", "midtrans").
    pub provider_name: String,
    pub base_url: String,
    pub client_id: String,
    pub secret_key: String,
    /// Per-call deadline for provider HTTP requests.
    pub timeout: Duration,
}

impl GatewayConfig {
    /// Load gateway credentials from the environment. Secrets are supplied
    /// as opaque configuration values, never hard-coded.
    pub fn from_env() -> PaymentResult<Self> {
        let require = |key: &str| {
            std::env::var(key)
                .map_err(|_| PaymentError::Config(format!("{} must be set", key)))
        };

        let timeout_secs = std::env::var("GATEWAY_TIMEOUT_SECS")
            .ok()
            .and_then(|v| v.parse().ok())
            .unwrap_or(DEFAULT_TIMEOUT_SECS);

        Ok(Self {
            provider_name: std::env::var("GATEWAY_PROVIDER_NAME")
                .unwrap_or_else(|_| "gateway".to_string()),
            base_url: require("GATEWAY_BASE_URL")?,
            client_id: require("GATEWAY_CLIENT_ID")?,
            secret_key: require("GATEWAY_SECRET_KEY")?,
            timeout: Duration::from_secs(timeout_secs),
        })
    }
}

/// HTTP gateway client.
pub struct HttpGateway {
    config: GatewayConfig,
    client: reqwest::Client,
}

impl HttpGateway {
    pub fn new(config: GatewayConfig) -> PaymentResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| PaymentError::Config(format!("failed to build http client: {}", e)))?;
        Ok(Self { config, client })
    }

    fn signed_headers(&self, path: &str, body: Option<&str>) -> Vec<(&'static str, String)> {
        let request_id = Uuid::new_v4().to_string();
        let timestamp = OffsetDateTime::now_utc()
            .replace_nanosecond(0)
            .unwrap_or_else(|_| OffsetDateTime::now_utc())
            .format(&Rfc3339)
            .unwrap_or_default();

        let signature = sign_request(
            &self.config.secret_key,
            &self.config.client_id,
            &request_id,
            &timestamp,
            path,
            body,
        );

        vec![
            ("Client-Id", self.config.client_id.clone()),
            ("Request-Id", request_id),
            ("Request-Timestamp", timestamp),
            ("Signature", signature),
        ]
    }

    async fn read_json(response: reqwest::Response) -> PaymentResult<serde_json::Value> {
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(PaymentError::ProviderUnavailable(format!(
                "gateway returned {}: {}",
                status,
                body.chars().take(200).collect::<String>()
            )));
        }
        response
            .json()
            .await
            .map_err(|e| PaymentError::ProviderUnavailable(format!("unparseable response: {}", e)))
    }
}

/// Build the `Signature` header value over the canonical request string.
///
/// Canonical form (newline-joined, `Digest` only when a body is present):
/// `Client-Id:{id}`, `Request-Id:{rid}`, `Request-Timestamp:{ts}`,
/// `Request-Target:{path}`, `Digest:{base64(sha256(body))}`.
pub fn sign_request(
    secret_key: &str,
    client_id: &str,
    request_id: &str,
    timestamp: &str,
    path: &str,
    body: Option<&str>,
) -> String {
    let mut canonical = format!(
        "Client-Id:{}\nRequest-Id:{}\nRequest-Timestamp:{}\nRequest-Target:{}",
        client_id, request_id, timestamp, path
    );
    if let Some(body) = body {
        let digest = BASE64.encode(Sha256::digest(body.as_bytes()));
        canonical.push_str(&format!("\nDigest:{}", digest));
    }

    let mut mac = match HmacSha256::new_from_slice(secret_key.as_bytes()) {
        Ok(mac) => mac,
        Err(_) => return String::new(),
    };
    mac.update(canonical.as_bytes());
    format!("HMACSHA256={}", BASE64.encode(mac.finalize().into_bytes()))
}

/// First string value found at any of the candidate JSON pointer paths.
fn extract_str(value: &serde_json::Value, pointers: &[&str]) -> Option<String> {
    pointers
        .iter()
        .find_map(|p| value.pointer(p).and_then(|v| v.as_str()))
        .map(String::from)
}

#[async_trait]
impl PaymentProvider for HttpGateway {
    fn name(&self) -> &str {
        &self.config.provider_name
    }

    async fn create_payment(
        &self,
        request: &CreatePaymentRequest,
    ) -> PaymentResult<HostedPayment> {
        let body = serde_json::to_string(request)
            .map_err(|e| PaymentError::Internal(format!("serialize payment request: {}", e)))?;
        let url = format!("{}{}", self.config.base_url, CHECKOUT_PATH);

        let mut builder = self
            .client
            .post(&url)
            .header("Content-Type", "application/json")
            .body(body.clone());
        for (name, value) in self.signed_headers(CHECKOUT_PATH, Some(&body)) {
            builder = builder.header(name, value);
        }

        let value = Self::read_json(builder.send().await?).await?;

        // Gateways disagree on nesting; accept the shapes we have seen.
        let payment_url = extract_str(&value, &["/payment/url", "/payment_url", "/checkout_url"])
            .ok_or_else(|| {
                PaymentError::ProviderUnavailable(
                    "gateway response carries no payment url".to_string(),
                )
            })?;
        let reference = extract_str(&value, &["/order/reference", "/reference", "/transaction_id"]);

        tracing::info!(
            provider = %self.config.provider_name,
            has_reference = reference.is_some(),
            "Hosted payment link created"
        );

        Ok(HostedPayment {
            payment_url,
            reference,
        })
    }

    async fn query_status(&self, invoice_number: &str) -> PaymentResult<ProviderStatus> {
        let path = format!("{}/{}", STATUS_PATH_PREFIX, invoice_number);
        let url = format!("{}{}", self.config.base_url, path);

        let mut builder = self.client.get(&url);
        for (name, value) in self.signed_headers(&path, None) {
            builder = builder.header(name, value);
        }

        let value = Self::read_json(builder.send().await?).await?;

        let status = extract_str(&value, &["/transaction/status", "/status"])
            .ok_or_else(|| {
                PaymentError::ProviderUnavailable(
                    "gateway status response carries no status field".to_string(),
                )
            })?
            .to_ascii_uppercase();

        Ok(match status.as_str() {
            "SUCCESS" | "PAID" | "SETTLED" | "SETTLEMENT" | "CAPTURE" => ProviderStatus::Success,
            // Everything short of settled is pending to the poll path; it
            // never marks an intent failed from a transient answer.
            _ => ProviderStatus::Pending,
        })
    }

    fn parse_webhook(&self, body: &str) -> PaymentResult<Option<CompletionEvent>> {
        parse_envelope(body)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_gateway(base_url: &str) -> HttpGateway {
        HttpGateway::new(GatewayConfig {
            provider_name: "testpay".to_string(),
            base_url: base_url.to_string(),
            client_id: "CLIENT-123".to_string(),
            secret_key: "gateway-secret".to_string(),
            timeout: Duration::from_secs(2),
        })
        .unwrap()
    }

    #[test]
    fn canonical_signature_is_deterministic() {
        let a = sign_request("sk", "cid", "rid", "2024-01-01T00:00:00Z", "/orders/v1/status/INV-1", None);
        let b = sign_request("sk", "cid", "rid", "2024-01-01T00:00:00Z", "/orders/v1/status/INV-1", None);
        assert_eq!(a, b);
        assert!(a.starts_with("HMACSHA256="));
    }

    #[test]
    fn body_digest_changes_signature() {
        let without = sign_request("sk", "cid", "rid", "ts", "/checkout/v1/payment", None);
        let with = sign_request("sk", "cid", "rid", "ts", "/checkout/v1/payment", Some("{}"));
        assert_ne!(without, with);
    }

    #[tokio::test]
    async fn create_payment_extracts_url_and_reference() {
        let mut server = mockito::Server::new_async().await;
        let mock = server
            .mock("POST", "/checkout/v1/payment")
            .match_header("Client-Id", "CLIENT-123")
            .with_status(200)
            .with_body(r#"{"payment":{"url":"https://pay.example/x"},"order":{"reference":"REF-9"}}"#)
            .create_async()
            .await;

        let gateway = test_gateway(&server.url());
        let hosted = gateway
            .create_payment(&CreatePaymentRequest {
                name: "Budi".to_string(),
                email: "budi@example.com".to_string(),
                amount: 350_000,
                mobile: "0812000".to_string(),
                redirect_url: "https://app.example/return".to_string(),
                description: "Quota top-up INV-1-X".to_string(),
            })
            .await
            .unwrap();

        mock.assert_async().await;
        assert_eq!(hosted.payment_url, "https://pay.example/x");
        assert_eq!(hosted.reference.as_deref(), Some("REF-9"));
    }

    #[tokio::test]
    async fn missing_payment_url_is_provider_unavailable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("POST", "/checkout/v1/payment")
            .with_status(200)
            .with_body(r#"{"order":{"reference":"REF-9"}}"#)
            .create_async()
            .await;

        let gateway = test_gateway(&server.url());
        let err = gateway
            .create_payment(&CreatePaymentRequest {
                name: "Budi".to_string(),
                email: "budi@example.com".to_string(),
                amount: 100_000,
                mobile: String::new(),
                redirect_url: "https://app.example/return".to_string(),
                description: "Quota top-up".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::ProviderUnavailable(_)));
    }

    #[tokio::test]
    async fn status_query_maps_settled_and_pending() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/orders/v1/status/INV-1-A")
            .with_status(200)
            .with_body(r#"{"transaction":{"status":"SETTLED"}}"#)
            .create_async()
            .await;
        server
            .mock("GET", "/orders/v1/status/INV-1-B")
            .with_status(200)
            .with_body(r#"{"transaction":{"status":"AUTHORIZING"}}"#)
            .create_async()
            .await;

        let gateway = test_gateway(&server.url());
        assert_eq!(
            gateway.query_status("INV-1-A").await.unwrap(),
            ProviderStatus::Success
        );
        assert_eq!(
            gateway.query_status("INV-1-B").await.unwrap(),
            ProviderStatus::Pending
        );
    }

    #[tokio::test]
    async fn gateway_5xx_is_provider_unavailable() {
        let mut server = mockito::Server::new_async().await;
        server
            .mock("GET", "/orders/v1/status/INV-1-C")
            .with_status(503)
            .with_body("upstream down")
            .create_async()
            .await;

        let gateway = test_gateway(&server.url());
        let err = gateway.query_status("INV-1-C").await.unwrap_err();
        assert!(matches!(err, PaymentError::ProviderUnavailable(_)));
        assert!(err.is_retryable());
    }
}
