// Payments crate clippy configuration
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Quotapay Payments Module
//!
//! The payment and quota reconciliation engine: payment intent creation,
//! exactly-once crediting of the quota ledger from racing completion
//! signals (webhook push and status poll), and quota spending against
//! report unlocks.
//!
//! ## Features
//!
//! - **Payment Intents**: Create hosted payment links with signed return URLs
//! - **Reconciliation**: Webhook and poll channels race safely via a
//!   conditional status transition; duplicate signals credit exactly once
//! - **Quota Ledger**: Append-only source of truth; balance is a pure sum
//! - **Quota Gate**: Debit-with-compensation report unlocking
//! - **Repair Passes**: Missing-credit and cached-balance reconciliation

pub mod error;
pub mod gate;
pub mod gateway;
pub mod intent;
pub mod model;
pub mod packages;
pub mod provider;
pub mod reconciler;
pub mod signer;
pub mod store;

#[cfg(test)]
mod edge_case_tests;

// Error
pub use error::{PaymentError, PaymentResult};

// Model
pub use model::{EntryKind, IntentStatus, LedgerEntry, NewLedgerEntry, PaymentIntent};

// Signer
pub use signer::Signer;

// Packages
pub use packages::QuotaPackage;

// Provider boundary
pub use gateway::{GatewayConfig, HttpGateway};
pub use provider::{
    CompletionEvent, CreatePaymentRequest, HostedPayment, PaymentProvider, ProviderStatus,
};

// Services
pub use gate::QuotaGate;
pub use intent::{Buyer, CreatedIntent, IntentManager};
pub use reconciler::{PollPolicy, ReconcileOutcome, Reconciler};

// Stores
pub use store::{
    MemoryQuotaStore, MemoryReportStore, PgQuotaStore, PgReportStore, QuotaStore, ReportStore,
};

use std::sync::Arc;
use std::time::Duration;

use sqlx::PgPool;

/// Main quota service that combines intent creation, reconciliation, and
/// quota spending over one store and one provider client.
pub struct QuotaService {
    pub intents: IntentManager,
    pub reconciler: Reconciler,
    pub gate: QuotaGate,
    pub signer: Signer,
    pub poll_policy: PollPolicy,
}

impl QuotaService {
    /// Wire the service from explicit parts. Tests and ephemeral deployments
    /// pass the in-memory stores here.
    pub fn new(
        store: Arc<dyn QuotaStore>,
        reports: Arc<dyn ReportStore>,
        provider: Arc<dyn PaymentProvider>,
        signer: Signer,
        return_url_base: String,
        poll_policy: PollPolicy,
    ) -> Self {
        Self {
            intents: IntentManager::new(
                store.clone(),
                provider.clone(),
                signer.clone(),
                return_url_base,
            ),
            reconciler: Reconciler::new(store.clone(), provider),
            gate: QuotaGate::new(store, reports),
            signer,
            poll_policy,
        }
    }

    /// Create the production service from environment variables, backed by
    /// Postgres stores and the HTTP gateway client.
    pub fn from_env(pool: PgPool) -> PaymentResult<Self> {
        let signing_secret = std::env::var("QUOTA_SIGNING_SECRET")
            .map_err(|_| PaymentError::Config("QUOTA_SIGNING_SECRET must be set".to_string()))?;
        let return_url_base = std::env::var("PAYMENT_RETURN_URL")
            .map_err(|_| PaymentError::Config("PAYMENT_RETURN_URL must be set".to_string()))?;

        let poll_policy = PollPolicy {
            max_attempts: std::env::var("POLL_MAX_ATTEMPTS")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(PollPolicy::default().max_attempts),
            interval: std::env::var("POLL_INTERVAL_MS")
                .ok()
                .and_then(|v| v.parse().ok())
                .map(Duration::from_millis)
                .unwrap_or(PollPolicy::default().interval),
        };

        let gateway = HttpGateway::new(GatewayConfig::from_env()?)?;
        let store: Arc<dyn QuotaStore> = Arc::new(PgQuotaStore::new(pool.clone()));
        let reports: Arc<dyn ReportStore> = Arc::new(PgReportStore::new(pool));

        Ok(Self::new(
            store,
            reports,
            Arc::new(gateway),
            Signer::new(&signing_secret),
            return_url_base,
            poll_policy,
        ))
    }
}
