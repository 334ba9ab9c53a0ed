//! Payment intent creation
//!
//! Turns a purchase request into a hosted payment page: generates the
//! invoice number, builds the signed return URL, asks the provider for a
//! payment link, and persists the pending intent row. No ledger effect
//! happens here - crediting is the reconciler's job.

use std::sync::Arc;

use rand::distr::Alphanumeric;
use rand::Rng;
use serde::Serialize;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{PaymentError, PaymentResult};
use crate::model::{IntentStatus, PaymentIntent};
use crate::packages;
use crate::provider::{CreatePaymentRequest, PaymentProvider, INVOICE_PREFIX};
use crate::signer::Signer;
use crate::store::QuotaStore;

/// Buyer contact details passed through to the provider's hosted page.
#[derive(Debug, Clone)]
pub struct Buyer {
    pub name: String,
    pub email: String,
    pub mobile: String,
}

/// Result of creating a payment intent.
#[derive(Debug, Clone, Serialize)]
pub struct CreatedIntent {
    pub invoice_number: String,
    pub payment_url: String,
}

/// Service that creates payment intents.
pub struct IntentManager {
    store: Arc<dyn QuotaStore>,
    provider: Arc<dyn PaymentProvider>,
    signer: Signer,
    /// Base URL of the client-facing status page the buyer returns to.
    return_url_base: String,
}

impl IntentManager {
    pub fn new(
        store: Arc<dyn QuotaStore>,
        provider: Arc<dyn PaymentProvider>,
        signer: Signer,
        return_url_base: String,
    ) -> Self {
        Self {
            store,
            provider,
            signer,
            return_url_base,
        }
    }

    /// Create a pending payment intent and return the hosted payment link.
    pub async fn create_intent(
        &self,
        user_id: Uuid,
        buyer: &Buyer,
        package_code: &str,
        amount: i64,
    ) -> PaymentResult<CreatedIntent> {
        if amount <= 0 {
            return Err(PaymentError::InvalidRequest(format!(
                "amount must be positive, got {}",
                amount
            )));
        }
        let package = packages::find(package_code).ok_or_else(|| {
            PaymentError::InvalidRequest(format!("unknown package code: {}", package_code))
        })?;

        let invoice_number = generate_invoice_number();
        let timestamp = OffsetDateTime::now_utc().unix_timestamp();
        let signature = self.signer.sign(&invoice_number, timestamp);
        let redirect_url = format!(
            "{}?invoice_number={}&timestamp={}&signature={}",
            self.return_url_base, invoice_number, timestamp, signature
        );

        // The invoice number rides in the description so the webhook
        // fallback extraction can recover it when the provider drops the
        // structured reference.
        let description = format!(
            "Quota package {} ({} units) {}",
            package.code, package.units, invoice_number
        );

        let hosted = self
            .provider
            .create_payment(&CreatePaymentRequest {
                name: buyer.name.clone(),
                email: buyer.email.clone(),
                amount,
                mobile: buyer.mobile.clone(),
                redirect_url,
                description,
            })
            .await?;

        let intent = PaymentIntent {
            invoice_number: invoice_number.clone(),
            user_id,
            package_code: package_code.to_string(),
            amount,
            status: IntentStatus::Pending,
            provider: self.provider.name().to_string(),
            provider_reference: hosted.reference.clone(),
            created_at: OffsetDateTime::now_utc(),
            paid_at: None,
        };
        self.store.insert_intent(&intent).await?;

        tracing::info!(
            user_id = %user_id,
            invoice_number = %invoice_number,
            package_code = %package_code,
            amount = amount,
            provider = %intent.provider,
            "Payment intent created"
        );

        Ok(CreatedIntent {
            invoice_number,
            payment_url: hosted.payment_url,
        })
    }
}

/// Globally unique, caller-generated invoice number: unix seconds plus a
/// random alphanumeric suffix, under the well-known prefix token.
fn generate_invoice_number() -> String {
    let suffix: String = rand::rng()
        .sample_iter(&Alphanumeric)
        .take(6)
        .map(char::from)
        .collect();
    format!(
        "{}{}-{}",
        INVOICE_PREFIX,
        OffsetDateTime::now_utc().unix_timestamp(),
        suffix.to_ascii_uppercase()
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn invoice_numbers_carry_prefix_and_differ() {
        let a = generate_invoice_number();
        let b = generate_invoice_number();
        assert!(a.starts_with(INVOICE_PREFIX));
        assert!(b.starts_with(INVOICE_PREFIX));
        assert_ne!(a, b);
    }
}
