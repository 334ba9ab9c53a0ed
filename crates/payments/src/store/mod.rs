//! Persistence seam for payment intents, the quota ledger, and report
//! unlock flags
//!
//! Production uses the Postgres implementations; the in-memory variants back
//! the edge-case test suites and ephemeral deployments, the same way the
//! shared rate limiter ships an in-memory mode.

mod memory;
mod postgres;

pub use memory::{MemoryQuotaStore, MemoryReportStore};
pub use postgres::{PgQuotaStore, PgReportStore};

use async_trait::async_trait;
use uuid::Uuid;

use crate::error::PaymentResult;
use crate::model::{LedgerEntry, NewLedgerEntry, PaymentIntent};

/// Storage for payment intents and the quota ledger.
///
/// Implementations must make `claim_success` atomic: of any number of
/// concurrent callers for one invoice, exactly one observes `true`. That
/// compare-and-swap is what turns two racing completion channels into at
/// most one ledger credit.
#[async_trait]
pub trait QuotaStore: Send + Sync {
    /// Persist a new pending intent. The invoice number must be unique.
    async fn insert_intent(&self, intent: &PaymentIntent) -> PaymentResult<()>;

    /// Load an intent by invoice number.
    async fn intent(&self, invoice_number: &str) -> PaymentResult<Option<PaymentIntent>>;

    /// Transition pending -> success if and only if the intent is still
    /// pending. Returns `true` for the single winning caller, `false` when
    /// another channel already completed the transition.
    async fn claim_success(&self, invoice_number: &str) -> PaymentResult<bool>;

    /// Transition pending -> failed under the same conditional-update rule.
    async fn mark_failed(&self, invoice_number: &str) -> PaymentResult<bool>;

    /// Append one immutable ledger entry.
    async fn append_entry(&self, entry: &NewLedgerEntry) -> PaymentResult<()>;

    /// Current balance: sum of the user's ledger entry amounts.
    async fn balance(&self, user_id: Uuid) -> PaymentResult<i64>;

    /// All ledger entries for a user, oldest first.
    async fn entries(&self, user_id: Uuid) -> PaymentResult<Vec<LedgerEntry>>;

    /// Whether a purchase entry referencing this invoice already exists.
    async fn has_purchase_entry(&self, invoice_number: &str) -> PaymentResult<bool>;

    /// Success-status intents with no matching purchase entry. Input to the
    /// repair pass that re-inserts credits lost to a partial failure between
    /// the status CAS and the ledger append.
    async fn credited_intents_missing_entry(&self) -> PaymentResult<Vec<PaymentIntent>>;

    /// Recompute the cached balance column from the ledger. The cache is
    /// display-only; the ledger stays the source of truth.
    async fn refresh_cached_balance(&self, user_id: Uuid) -> PaymentResult<i64>;

    /// Users whose cached balance diverges from the ledger sum.
    async fn users_with_divergent_cache(&self) -> PaymentResult<Vec<Uuid>>;
}

/// Unlock-flag boundary to the external report store.
///
/// The flag transitions false -> true exactly once per successful quota
/// debit; the Quota Gate owns the ordering and compensation around it.
#[async_trait]
pub trait ReportStore: Send + Sync {
    /// Whether the report is already unlocked. `NotFound` for unknown
    /// report/user pairs.
    async fn is_unlocked(&self, user_id: Uuid, report_id: Uuid) -> PaymentResult<bool>;

    /// Flip the unlock flag false -> true under the same conditional-update
    /// rule as `claim_success`: of any number of concurrent callers, exactly
    /// one observes `true`. `false` means another caller already unlocked
    /// the report; `NotFound` for unknown report/user pairs.
    async fn set_unlocked(&self, user_id: Uuid, report_id: Uuid) -> PaymentResult<bool>;
}
