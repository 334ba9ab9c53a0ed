//! Payment reconciliation state machine
//!
//! Converts completion signals into exactly one ledger credit per invoice.
//! Two independent channels race here: the provider's webhook push and the
//! client-driven status poll. Neither channel knows about the other; the
//! conditional status update on the intent row picks at most one winner, so
//! duplicate, reordered, or simultaneous signals all collapse into a single
//! credit.

use std::sync::Arc;
use std::time::Duration;

use tokio_retry::strategy::FixedInterval;
use tokio_retry::RetryIf;
use uuid::Uuid;

use crate::error::{PaymentError, PaymentResult};
use crate::model::{IntentStatus, NewLedgerEntry, PaymentIntent};
use crate::packages;
use crate::provider::{PaymentProvider, ProviderStatus};
use crate::store::QuotaStore;

/// Retry policy for the caller-driven poll loop.
///
/// Kept as explicit configuration so the loop is testable independent of
/// any UI framework driving it.
#[derive(Debug, Clone, Copy)]
pub struct PollPolicy {
    pub max_attempts: u32,
    pub interval: Duration,
}

impl Default for PollPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 10,
            interval: Duration::from_secs(3),
        }
    }
}

/// Outcome of processing one completion signal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// This signal won the transition and credited the ledger.
    Credited { units: i64 },
    /// The intent was already terminal-success; idempotent success, no new
    /// ledger entry. Not an error.
    AlreadyProcessed,
    /// Provider has not settled the payment yet; the caller retries later.
    StillPending,
    /// The intent is terminally failed.
    Failed,
    /// Well-formed but non-terminal notification; acknowledged and skipped.
    Ignored,
}

impl ReconcileOutcome {
    /// Whether the payment is settled from the caller's point of view.
    pub fn is_settled(&self) -> bool {
        matches!(
            self,
            ReconcileOutcome::Credited { .. } | ReconcileOutcome::AlreadyProcessed
        )
    }
}

/// The reconciler service.
pub struct Reconciler {
    store: Arc<dyn QuotaStore>,
    provider: Arc<dyn PaymentProvider>,
}

impl Reconciler {
    pub fn new(store: Arc<dyn QuotaStore>, provider: Arc<dyn PaymentProvider>) -> Self {
        Self { store, provider }
    }

    /// Push path: process a provider webhook body.
    ///
    /// Errors propagate to the HTTP layer, which answers non-2xx so the
    /// provider's own retry mechanism redelivers; combined with the
    /// conditional transition this makes redelivery harmless.
    pub async fn handle_webhook(&self, body: &str) -> PaymentResult<ReconcileOutcome> {
        let event = match self.provider.parse_webhook(body)? {
            Some(event) => event,
            None => return Ok(ReconcileOutcome::Ignored),
        };

        let intent = self
            .store
            .intent(&event.invoice_number)
            .await?
            .ok_or_else(|| {
                // The invoice must have been created before any completion
                // signal can reference it. Log loudly, do not retry.
                tracing::error!(
                    invoice_number = %event.invoice_number,
                    "Webhook references an unknown invoice"
                );
                PaymentError::NotFound(format!(
                    "unknown invoice: {}",
                    event.invoice_number
                ))
            })?;

        if intent.status == IntentStatus::Success {
            tracing::info!(
                invoice_number = %intent.invoice_number,
                "Webhook redelivery for an already-credited invoice"
            );
            return Ok(ReconcileOutcome::AlreadyProcessed);
        }

        if event.success {
            self.credit(&intent).await
        } else {
            self.fail(&intent).await
        }
    }

    /// Pull path: one status check for an invoice.
    ///
    /// Checks the local intent first; only a still-pending intent triggers a
    /// provider status query. A provider answer short of success reports
    /// `StillPending` - this path never marks an intent failed from a
    /// transient response.
    pub async fn poll(&self, invoice_number: &str) -> PaymentResult<ReconcileOutcome> {
        let intent = self.store.intent(invoice_number).await?.ok_or_else(|| {
            PaymentError::NotFound(format!("unknown invoice: {}", invoice_number))
        })?;

        match intent.status {
            IntentStatus::Success => return Ok(ReconcileOutcome::AlreadyProcessed),
            IntentStatus::Failed => return Ok(ReconcileOutcome::Failed),
            IntentStatus::Pending => {}
        }

        // Transient provider errors get a couple of quick in-call retries;
        // the outer bounded loop handles the longer horizon.
        let strategy = FixedInterval::from_millis(500).take(2);
        let status = RetryIf::spawn(
            strategy,
            || self.provider.query_status(invoice_number),
            |err: &PaymentError| err.is_retryable(),
        )
        .await?;

        match status {
            ProviderStatus::Success => self.credit(&intent).await,
            ProviderStatus::Pending => Ok(ReconcileOutcome::StillPending),
        }
    }

    /// Bounded fixed-interval poll loop.
    ///
    /// Abandoning the loop has no side effects: the intent stays pending and
    /// is safely resumable by a later poll or by the webhook. Exhausting the
    /// attempts yields `StillPending`, never a false `Failed` - the webhook
    /// may still arrive afterwards.
    pub async fn poll_until_complete(
        &self,
        invoice_number: &str,
        policy: PollPolicy,
    ) -> PaymentResult<ReconcileOutcome> {
        for attempt in 1..=policy.max_attempts.max(1) {
            let outcome = self.poll(invoice_number).await?;
            if outcome != ReconcileOutcome::StillPending {
                return Ok(outcome);
            }
            if attempt < policy.max_attempts {
                tokio::time::sleep(policy.interval).await;
            }
        }
        Ok(ReconcileOutcome::StillPending)
    }

    /// Credit procedure, shared by both paths.
    ///
    /// Ordering is the linchpin: first the conditional pending -> success
    /// transition (at most one winner), then the single ledger append. The
    /// loser returns idempotent success without touching the ledger.
    async fn credit(&self, intent: &PaymentIntent) -> PaymentResult<ReconcileOutcome> {
        let units = packages::units_for(&intent.package_code)?;

        if !self.store.claim_success(&intent.invoice_number).await? {
            // Lost the race: some other signal already made the intent
            // terminal. Report the state that actually won.
            return match self.store.intent(&intent.invoice_number).await? {
                Some(current) if current.status == IntentStatus::Failed => {
                    tracing::error!(
                        invoice_number = %intent.invoice_number,
                        "Success signal for an invoice already marked failed"
                    );
                    Ok(ReconcileOutcome::Failed)
                }
                _ => {
                    tracing::info!(
                        invoice_number = %intent.invoice_number,
                        "Another completion signal already claimed this invoice"
                    );
                    Ok(ReconcileOutcome::AlreadyProcessed)
                }
            };
        }

        // If this append fails after the claim succeeded, the webhook
        // handler's non-2xx answer triggers redelivery, and the repair pass
        // backstops the case where no redelivery arrives.
        self.store
            .append_entry(&NewLedgerEntry::purchase(
                intent.user_id,
                units,
                &intent.invoice_number,
            ))
            .await?;
        self.refresh_cache(intent.user_id).await;

        tracing::info!(
            user_id = %intent.user_id,
            invoice_number = %intent.invoice_number,
            package_code = %intent.package_code,
            units = units,
            "Payment credited to quota ledger"
        );

        Ok(ReconcileOutcome::Credited { units })
    }

    async fn fail(&self, intent: &PaymentIntent) -> PaymentResult<ReconcileOutcome> {
        if self.store.mark_failed(&intent.invoice_number).await? {
            tracing::warn!(
                invoice_number = %intent.invoice_number,
                "Payment intent marked failed by provider notification"
            );
            return Ok(ReconcileOutcome::Failed);
        }

        // Lost the race against another signal; report whatever terminal
        // state won.
        match self.store.intent(&intent.invoice_number).await? {
            Some(current) if current.status == IntentStatus::Success => {
                tracing::warn!(
                    invoice_number = %intent.invoice_number,
                    "Failure notification for an invoice already credited; keeping success"
                );
                Ok(ReconcileOutcome::AlreadyProcessed)
            }
            _ => Ok(ReconcileOutcome::Failed),
        }
    }

    /// Fail-safe repair pass, not part of the hot path.
    ///
    /// Finds success-status intents whose purchase entry is missing (the
    /// claim succeeded but the append did not) and inserts the missing
    /// entry. Returns how many credits were repaired.
    pub async fn repair_missing_credits(&self) -> PaymentResult<u32> {
        let orphans = self.store.credited_intents_missing_entry().await?;
        let mut repaired = 0u32;

        for intent in orphans {
            let units = match packages::units_for(&intent.package_code) {
                Ok(units) => units,
                Err(e) => {
                    tracing::error!(
                        invoice_number = %intent.invoice_number,
                        package_code = %intent.package_code,
                        error = %e,
                        "Cannot repair credit for unknown package code"
                    );
                    continue;
                }
            };

            if let Err(e) = self
                .store
                .append_entry(&NewLedgerEntry::purchase(
                    intent.user_id,
                    units,
                    &intent.invoice_number,
                ))
                .await
            {
                tracing::error!(
                    invoice_number = %intent.invoice_number,
                    error = %e,
                    "Failed to repair missing ledger credit"
                );
                continue;
            }

            self.refresh_cache(intent.user_id).await;
            tracing::warn!(
                user_id = %intent.user_id,
                invoice_number = %intent.invoice_number,
                units = units,
                "Repaired missing ledger credit for credited intent"
            );
            repaired += 1;
        }

        Ok(repaired)
    }

    /// Cached balance refresh is best-effort: the ledger remains the source
    /// of truth whether or not the cache write lands.
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
