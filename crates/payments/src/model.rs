//! Core data model: payment intents and quota ledger entries

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{PaymentError, PaymentResult};

/// Lifecycle state of a payment intent.
///
/// Transitions only pending -> success or pending -> failed; once terminal
/// the row is immutable except for audit metadata. The conditional update
/// that performs the transition is the single serialization point for all
/// completion signals racing on one invoice.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum IntentStatus {
    Pending,
    Success,
    Failed,
}

impl IntentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            IntentStatus::Pending => "pending",
            IntentStatus::Success => "success",
            IntentStatus::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> PaymentResult<Self> {
        match s {
            "pending" => Ok(IntentStatus::Pending),
            "success" => Ok(IntentStatus::Success),
            "failed" => Ok(IntentStatus::Failed),
            other => Err(PaymentError::Internal(format!(
                "unknown intent status in store: {}",
                other
            ))),
        }
    }
}

impl std::fmt::Display for IntentStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// A payment intent row.
///
/// The invoice number is caller-generated, globally unique, and acts as the
/// idempotency key across the webhook and poll channels. Rows are append-only
/// audit records and are never deleted.
#[derive(Debug, Clone, Serialize)]
pub struct PaymentIntent {
    pub invoice_number: String,
    pub user_id: Uuid,
    pub package_code: String,
    /// Requested amount in the smallest currency unit.
    pub amount: i64,
    pub status: IntentStatus,
    pub provider: String,
    /// Provider-assigned reference, null until the provider responds.
    pub provider_reference: Option<String>,
    pub created_at: OffsetDateTime,
    pub paid_at: Option<OffsetDateTime>,
}

/// Kind of a ledger entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntryKind {
    /// Credit from a completed purchase (positive amount).
    Purchase,
    /// Debit from a report unlock, or its compensating credit.
    Usage,
}

impl EntryKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            EntryKind::Purchase => "purchase",
            EntryKind::Usage => "usage",
        }
    }

    pub fn parse(s: &str) -> PaymentResult<Self> {
        match s {
            "purchase" => Ok(EntryKind::Purchase),
            "usage" => Ok(EntryKind::Usage),
            other => Err(PaymentError::Internal(format!(
                "unknown ledger entry kind in store: {}",
                other
            ))),
        }
    }
}

/// An immutable quota ledger entry.
///
/// The ledger is the source of truth for balances: balance(user) is the sum
/// of that user's entry amounts. Entries are never mutated or deleted; a
/// mistaken debit is undone by appending an equal-and-opposite entry.
#[derive(Debug, Clone, Serialize)]
pub struct LedgerEntry {
    pub id: Uuid,
    pub user_id: Uuid,
    /// Signed: positive = credit, negative = debit.
    pub amount: i64,
    pub kind: EntryKind,
    /// Invoice number for purchases, report id for usage.
    pub reference: Option<String>,
    pub created_at: OffsetDateTime,
}

/// A ledger entry about to be appended.
#[derive(Debug, Clone)]
pub struct NewLedgerEntry {
    pub user_id: Uuid,
    pub amount: i64,
    pub kind: EntryKind,
    pub reference: Option<String>,
}

impl NewLedgerEntry {
    pub fn purchase(user_id: Uuid, units: i64, invoice_number: &str) -> Self {
        Self {
            user_id,
            amount: units,
            kind: EntryKind::Purchase,
            reference: Some(invoice_number.to_string()),
        }
    }

    pub fn usage(user_id: Uuid, amount: i64, report_id: Uuid) -> Self {
        Self {
            user_id,
            amount,
            kind: EntryKind::Usage,
            reference: Some(report_id.to_string()),
        }
    }
}
