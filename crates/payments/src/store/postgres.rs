//! Postgres implementations of the quota and report stores

use async_trait::async_trait;
use sqlx::PgPool;
use time::OffsetDateTime;
use uuid::Uuid;

use crate::error::{PaymentError, PaymentResult};
use crate::model::{EntryKind, IntentStatus, LedgerEntry, NewLedgerEntry, PaymentIntent};

use super::{QuotaStore, ReportStore};

/// Database row type for payment intents
#[derive(Debug, sqlx::FromRow)]
struct IntentRow {
    invoice_number: String,
    user_id: Uuid,
    package_code: String,
    amount: i64,
    status: String,
    provider: String,
    provider_reference: Option<String>,
    created_at: OffsetDateTime,
    paid_at: Option<OffsetDateTime>,
}

impl IntentRow {
    fn into_intent(self) -> PaymentResult<PaymentIntent> {
        Ok(PaymentIntent {
            status: IntentStatus::parse(&self.status)?,
            invoice_number: self.invoice_number,
            user_id: self.user_id,
            package_code: self.package_code,
            amount: self.amount,
            provider: self.provider,
            provider_reference: self.provider_reference,
            created_at: self.created_at,
            paid_at: self.paid_at,
        })
    }
}

/// Database row type for ledger entries
#[derive(Debug, sqlx::FromRow)]
struct EntryRow {
    id: Uuid,
    user_id: Uuid,
    amount: i64,
    kind: String,
    reference: Option<String>,
    created_at: OffsetDateTime,
}

impl EntryRow {
    fn into_entry(self) -> PaymentResult<LedgerEntry> {
        Ok(LedgerEntry {
            kind: EntryKind::parse(&self.kind)?,
            id: self.id,
            user_id: self.user_id,
            amount: self.amount,
            reference: self.reference,
            created_at: self.created_at,
        })
    }
}

/// Postgres-backed intent and ledger store.
#[derive(Clone)]
pub struct PgQuotaStore {
    pool: PgPool,
}

impl PgQuotaStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl QuotaStore for PgQuotaStore {
    async fn insert_intent(&self, intent: &PaymentIntent) -> PaymentResult<()> {
        sqlx::query(
            r#"
            INSERT INTO payment_intents
                (invoice_number, user_id, package_code, amount, status,
                 provider, provider_reference, created_at, paid_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(&intent.invoice_number)
        .bind(intent.user_id)
        .bind(&intent.package_code)
        .bind(intent.amount)
        .bind(intent.status.as_str())
        .bind(&intent.provider)
        .bind(intent.provider_reference.as_ref())
        .bind(intent.created_at)
        .bind(intent.paid_at)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn intent(&self, invoice_number: &str) -> PaymentResult<Option<PaymentIntent>> {
        let row: Option<IntentRow> = sqlx::query_as(
            r#"
            SELECT invoice_number, user_id, package_code, amount, status,
                   provider, provider_reference, created_at, paid_at
            FROM payment_intents
            WHERE invoice_number = $1
            "#,
        )
        .bind(invoice_number)
        .fetch_optional(&self.pool)
        .await?;

        row.map(IntentRow::into_intent).transpose()
    }

    async fn claim_success(&self, invoice_number: &str) -> PaymentResult<bool> {
        // Conditional update is the serialization point: of N racing
        // completion signals, exactly one affects a row here.
        let result = sqlx::query(
            r#"
            UPDATE payment_intents
            SET status = 'success', paid_at = NOW()
            WHERE invoice_number = $1 AND status = 'pending'
            "#,
        )
        .bind(invoice_number)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn mark_failed(&self, invoice_number: &str) -> PaymentResult<bool> {
        let result = sqlx::query(
            r#"
            UPDATE payment_intents
            SET status = 'failed'
            WHERE invoice_number = $1 AND status = 'pending'
            "#,
        )
        .bind(invoice_number)
        .execute(&self.pool)
        .await?;

        Ok(result.rows_affected() == 1)
    }

    async fn append_entry(&self, entry: &NewLedgerEntry) -> PaymentResult<()> {
        sqlx::query(
            r#"
            INSERT INTO quota_ledger (id, user_id, amount, kind, reference, created_at)
            VALUES ($1, $2, $3, $4, $5, NOW())
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(entry.user_id)
        .bind(entry.amount)
        .bind(entry.kind.as_str())
        .bind(entry.reference.as_ref())
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn balance(&self, user_id: Uuid) -> PaymentResult<i64> {
        let (balance,): (i64,) = sqlx::query_as(
            "SELECT COALESCE(SUM(amount), 0)::BIGINT FROM quota_ledger WHERE user_id = $1",
        )
        .bind(user_id)
        .fetch_one(&self.pool)
        .await?;
        Ok(balance)
    }

    async fn entries(&self, user_id: Uuid) -> PaymentResult<Vec<LedgerEntry>> {
        let rows: Vec<EntryRow> = sqlx::query_as(
            r#"
            SELECT id, user_id, amount, kind, reference, created_at
            FROM quota_ledger
            WHERE user_id = $1
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(EntryRow::into_entry).collect()
    }

    async fn has_purchase_entry(&self, invoice_number: &str) -> PaymentResult<bool> {
        let (exists,): (bool,) = sqlx::query_as(
            r#"
            SELECT EXISTS (
                SELECT 1 FROM quota_ledger
                WHERE kind = 'purchase' AND reference = $1
            )
            "#,
        )
        .bind(invoice_number)
        .fetch_one(&self.pool)
        .await?;
        Ok(exists)
    }

    async fn credited_intents_missing_entry(&self) -> PaymentResult<Vec<PaymentIntent>> {
        let rows: Vec<IntentRow> = sqlx::query_as(
            r#"
            SELECT pi.invoice_number, pi.user_id, pi.package_code, pi.amount, pi.status,
                   pi.provider, pi.provider_reference, pi.created_at, pi.paid_at
            FROM payment_intents pi
            WHERE pi.status = 'success'
              AND NOT EXISTS (
                  SELECT 1 FROM quota_ledger l
                  WHERE l.kind = 'purchase' AND l.reference = pi.invoice_number
              )
            ORDER BY pi.paid_at ASC NULLS LAST
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter().map(IntentRow::into_intent).collect()
    }

    async fn refresh_cached_balance(&self, user_id: Uuid) -> PaymentResult<i64> {
        let row: Option<(i64,)> = sqlx::query_as(
            r#"
            UPDATE users
            SET quota_balance = (
                SELECT COALESCE(SUM(amount), 0)::BIGINT
                FROM quota_ledger
                WHERE user_id = $1
            )
            WHERE id = $1
            RETURNING quota_balance
            "#,
        )
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(balance,)| balance)
            .ok_or_else(|| PaymentError::NotFound(format!("user {} not found", user_id)))
    }

    async fn users_with_divergent_cache(&self) -> PaymentResult<Vec<Uuid>> {
        let rows: Vec<(Uuid,)> = sqlx::query_as(
            r#"
            SELECT u.id
            FROM users u
            LEFT JOIN quota_ledger l ON l.user_id = u.id
            GROUP BY u.id, u.quota_balance
            HAVING u.quota_balance <> COALESCE(SUM(l.amount), 0)
            "#,
        )
        .fetch_all(&self.pool)
        .await?;

        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

/// Postgres-backed report unlock flags.
#[derive(Clone)]
pub struct PgReportStore {
    pool: PgPool,
}

impl PgReportStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

#[async_trait]
impl ReportStore for PgReportStore {
    async fn is_unlocked(&self, user_id: Uuid, report_id: Uuid) -> PaymentResult<bool> {
        let row: Option<(bool,)> = sqlx::query_as(
            "SELECT is_unlocked FROM reports WHERE id = $1 AND user_id = $2",
        )
        .bind(report_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        row.map(|(unlocked,)| unlocked)
            .ok_or_else(|| PaymentError::NotFound(format!("report {} not found", report_id)))
    }

    async fn set_unlocked(&self, user_id: Uuid, report_id: Uuid) -> PaymentResult<bool> {
        // Conditional flip: of N racing callers, exactly one affects a row.
        let result = sqlx::query(
            r#"
            UPDATE reports
            SET is_unlocked = TRUE, unlocked_at = NOW()
            WHERE id = $1 AND user_id = $2 AND is_unlocked = FALSE
            "#,
        )
        .bind(report_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 1 {
            return Ok(true);
        }

        // Zero rows: already unlocked, or the report does not exist.
        let row: Option<(bool,)> = sqlx::query_as(
            "SELECT is_unlocked FROM reports WHERE id = $1 AND user_id = $2",
        )
        .bind(report_id)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        match row {
            Some(_) => Ok(false),
            None => Err(PaymentError::NotFound(format!(
                "report {} not found",
                report_id
            ))),
        }
    }
}
