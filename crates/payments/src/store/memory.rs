//! In-memory implementations of the quota and report stores
//!
//! Used by the edge-case test suites and by ephemeral deployments without a
//! database. The intent map mutex is held across the check-and-set in
//! `claim_success`, which gives the same at-most-one-winner guarantee as the
//! Postgres conditional update.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use time::OffsetDateTime;
use tokio::sync::Mutex;
use uuid::Uuid;

use crate::error::{PaymentError, PaymentResult};
use crate::model::{EntryKind, IntentStatus, LedgerEntry, NewLedgerEntry, PaymentIntent};

use super::{QuotaStore, ReportStore};

/// In-memory intent and ledger store.
#[derive(Default)]
pub struct MemoryQuotaStore {
    intents: Mutex<HashMap<String, PaymentIntent>>,
    ledger: Mutex<Vec<LedgerEntry>>,
    cached_balances: Mutex<HashMap<Uuid, i64>>,
}

impl MemoryQuotaStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Cached balance value, for tests asserting cache repair.
    pub async fn cached_balance(&self, user_id: Uuid) -> Option<i64> {
        self.cached_balances.lock().await.get(&user_id).copied()
    }

    /// Overwrite the cached balance, simulating cache drift.
    pub async fn poison_cached_balance(&self, user_id: Uuid, value: i64) {
        self.cached_balances.lock().await.insert(user_id, value);
    }
}

#[async_trait]
impl QuotaStore for MemoryQuotaStore {
    async fn insert_intent(&self, intent: &PaymentIntent) -> PaymentResult<()> {
        let mut intents = self.intents.lock().await;
        if intents.contains_key(&intent.invoice_number) {
            return Err(PaymentError::Database(format!(
                "duplicate invoice number: {}",
                intent.invoice_number
            )));
        }
        intents.insert(intent.invoice_number.clone(), intent.clone());
        Ok(())
    }

    async fn intent(&self, invoice_number: &str) -> PaymentResult<Option<PaymentIntent>> {
        Ok(self.intents.lock().await.get(invoice_number).cloned())
    }

    async fn claim_success(&self, invoice_number: &str) -> PaymentResult<bool> {
        let mut intents = self.intents.lock().await;
        match intents.get_mut(invoice_number) {
            Some(intent) if intent.status == IntentStatus::Pending => {
                intent.status = IntentStatus::Success;
                intent.paid_at = Some(OffsetDateTime::now_utc());
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Ok(false),
        }
    }

    async fn mark_failed(&self, invoice_number: &str) -> PaymentResult<bool> {
        let mut intents = self.intents.lock().await;
        match intents.get_mut(invoice_number) {
            Some(intent) if intent.status == IntentStatus::Pending => {
                intent.status = IntentStatus::Failed;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn append_entry(&self, entry: &NewLedgerEntry) -> PaymentResult<()> {
        self.ledger.lock().await.push(LedgerEntry {
            id: Uuid::new_v4(),
            user_id: entry.user_id,
            amount: entry.amount,
            kind: entry.kind,
            reference: entry.reference.clone(),
            created_at: OffsetDateTime::now_utc(),
        });
        Ok(())
    }

    async fn balance(&self, user_id: Uuid) -> PaymentResult<i64> {
        Ok(self
            .ledger
            .lock()
            .await
            .iter()
            .filter(|e| e.user_id == user_id)
            .map(|e| e.amount)
            .sum())
    }

    async fn entries(&self, user_id: Uuid) -> PaymentResult<Vec<LedgerEntry>> {
        Ok(self
            .ledger
            .lock()
            .await
            .iter()
            .filter(|e| e.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn has_purchase_entry(&self, invoice_number: &str) -> PaymentResult<bool> {
        Ok(self.ledger.lock().await.iter().any(|e| {
            e.kind == EntryKind::Purchase && e.reference.as_deref() == Some(invoice_number)
        }))
    }

    async fn credited_intents_missing_entry(&self) -> PaymentResult<Vec<PaymentIntent>> {
        let intents = self.intents.lock().await;
        let ledger = self.ledger.lock().await;
        Ok(intents
            .values()
            .filter(|i| i.status == IntentStatus::Success)
            .filter(|i| {
                !ledger.iter().any(|e| {
                    e.kind == EntryKind::Purchase
                        && e.reference.as_deref() == Some(i.invoice_number.as_str())
                })
            })
            .cloned()
            .collect())
    }

    async fn refresh_cached_balance(&self, user_id: Uuid) -> PaymentResult<i64> {
        let balance = self.balance(user_id).await?;
        self.cached_balances.lock().await.insert(user_id, balance);
        Ok(balance)
    }

    async fn users_with_divergent_cache(&self) -> PaymentResult<Vec<Uuid>> {
        let cached = self.cached_balances.lock().await.clone();
        let mut divergent = Vec::new();
        for (user_id, cached_balance) in cached {
            if self.balance(user_id).await? != cached_balance {
                divergent.push(user_id);
            }
        }
        Ok(divergent)
    }
}

/// In-memory report unlock flags with injectable unlock failure.
#[derive(Default)]
pub struct MemoryReportStore {
    reports: Mutex<HashMap<(Uuid, Uuid), bool>>,
    fail_next_unlock: AtomicBool,
}

impl MemoryReportStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a locked report owned by a user.
    pub async fn add_report(&self, user_id: Uuid, report_id: Uuid) {
        self.reports.lock().await.insert((user_id, report_id), false);
    }

    /// Make the next `set_unlocked` call fail, simulating a report-store
    /// fault after the debit has already been recorded.
    pub fn fail_next_unlock(&self) {
        self.fail_next_unlock.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl ReportStore for MemoryReportStore {
    async fn is_unlocked(&self, user_id: Uuid, report_id: Uuid) -> PaymentResult<bool> {
        self.reports
            .lock()
            .await
            .get(&(user_id, report_id))
            .copied()
            .ok_or_else(|| PaymentError::NotFound(format!("report {} not found", report_id)))
    }

    async fn set_unlocked(&self, user_id: Uuid, report_id: Uuid) -> PaymentResult<bool> {
        if self.fail_next_unlock.swap(false, Ordering::SeqCst) {
            return Err(PaymentError::Database(
                "simulated report store failure".to_string(),
            ));
        }
        // Lock held across the check-and-set, matching the conditional
        // update in the Postgres store.
        let mut reports = self.reports.lock().await;
        match reports.get_mut(&(user_id, report_id)) {
            Some(unlocked) if !*unlocked => {
                *unlocked = true;
                Ok(true)
            }
            Some(_) => Ok(false),
            None => Err(PaymentError::NotFound(format!(
                "report {} not found",
                report_id
            ))),
        }
    }
}
