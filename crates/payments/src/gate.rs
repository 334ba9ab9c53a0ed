//! Quota gate: spend one quota unit to unlock one report
//!
//! Debit-then-flip with compensation: the usage debit is appended first,
//! then the report's unlock flag is flipped. If the flip fails, an
//! equal-and-opposite usage entry restores the balance - the original debit
//! row is never deleted or mutated (append-only law).

use std::sync::Arc;

use uuid::Uuid;

use crate::error::{PaymentError, PaymentResult};
use crate::model::NewLedgerEntry;
use crate::store::{QuotaStore, ReportStore};

/// Service that spends quota units against report unlocks.
pub struct QuotaGate {
    store: Arc<dyn QuotaStore>,
    reports: Arc<dyn ReportStore>,
}

impl QuotaGate {
    pub fn new(store: Arc<dyn QuotaStore>, reports: Arc<dyn ReportStore>) -> Self {
        Self { store, reports }
    }

    /// Spend exactly one quota unit to unlock exactly one report.
    ///
    /// Idempotent: an already-unlocked report returns success without a
    /// second debit. `InsufficientQuota` when the ledger balance is below
    /// one; the balance read is the ledger sum, never the cached column.
    pub async fn unlock_report(&self, user_id: Uuid, report_id: Uuid) -> PaymentResult<()> {
        if self.reports.is_unlocked(user_id, report_id).await? {
            tracing::info!(
                user_id = %user_id,
                report_id = %report_id,
                "Report already unlocked; no debit"
            );
            return Ok(());
        }

        let balance = self.store.balance(user_id).await?;
        if balance < 1 {
            return Err(PaymentError::InsufficientQuota { balance });
        }

        self.store
            .append_entry(&NewLedgerEntry::usage(user_id, -1, report_id))
            .await?;

        // Conditional flip: exactly one of N racing debits wins it. The
        // losers refund their debit so one unlock never costs two units.
        match self.reports.set_unlocked(user_id, report_id).await {
            Ok(true) => {}
            Ok(false) => {
                tracing::warn!(
                    user_id = %user_id,
                    report_id = %report_id,
                    "Concurrent unlock already flipped this report; refunding debit"
                );
                self.refund_debit(user_id, report_id).await;
                return Ok(());
            }
            Err(unlock_err) => {
                tracing::warn!(
                    user_id = %user_id,
                    report_id = %report_id,
                    error = %unlock_err,
                    "Unlock flip failed after debit; appending compensating credit"
                );
                self.refund_debit(user_id, report_id).await;
                return Err(unlock_err);
            }
        }

        self.refresh_cache(user_id).await;

        tracing::info!(
            user_id = %user_id,
            report_id = %report_id,
            "Quota unit spent, report unlocked"
        );
        Ok(())
    }

    /// Append the compensating +1 for a debit whose unlock did not land.
    /// The debit row itself is never deleted or mutated.
    async fn refund_debit(&self, user_id: Uuid, report_id: Uuid) {
        if let Err(comp_err) = self
            .store
            .append_entry(&NewLedgerEntry::usage(user_id, 1, report_id))
            .await
        {
            // A debited-but-unused unit must never be left silently;
            // this needs operator attention.
            tracing::error!(
                user_id = %user_id,
                report_id = %report_id,
                compensation_error = %comp_err,
                "RECONCILIATION NEEDED: debit recorded without an unlock \
                 and the compensating credit could not be appended"
            );
        } else {
            self.refresh_cache(user_id).await;
        }
    }

    async fn refresh_cache(&self, user_id: Uuid) {
        if let Err(e) = self.store.refresh_cached_balance(user_id).await {
            tracing::warn!(
                user_id = %user_id,
                error = %e,
                "Failed to refresh cached quota balance"
            );
        }
    }
}
