// Test file - these are expected patterns in test code
#![allow(clippy::unwrap_used)]
#![allow(clippy::expect_used)]

//! Edge Case Tests for the Payment & Quota Reconciliation Engine
//!
//! Exercises the boundary conditions and race conditions in:
//! - Reconciliation (exactly-once credit, racing channels, redelivery)
//! - Poll path (pending handling, bounded retries, transient errors)
//! - Quota gate (insufficient quota, idempotence, compensation)
//! - Repair passes (missing credits, cached-balance divergence)

mod support {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::{Arc, Mutex};

    use async_trait::async_trait;
    use uuid::Uuid;

    use crate::error::{PaymentError, PaymentResult};
    use crate::intent::Buyer;
    use crate::provider::{
        parse_envelope, CompletionEvent, CreatePaymentRequest, HostedPayment, PaymentProvider,
        ProviderStatus,
    };
    use crate::reconciler::PollPolicy;
    use crate::signer::Signer;
    use crate::store::{MemoryQuotaStore, MemoryReportStore};
    use crate::QuotaService;

    /// Scriptable in-process provider double.
    pub struct MockProvider {
        status: Mutex<ProviderStatus>,
        pub create_calls: AtomicU32,
        pub status_calls: AtomicU32,
        /// Number of upcoming status queries that fail transiently.
        transient_failures: AtomicU32,
    }

    impl MockProvider {
        pub fn new() -> Self {
            Self {
                status: Mutex::new(ProviderStatus::Pending),
                create_calls: AtomicU32::new(0),
                status_calls: AtomicU32::new(0),
                transient_failures: AtomicU32::new(0),
            }
        }

        pub fn set_status(&self, status: ProviderStatus) {
            *self.status.lock().unwrap() = status;
        }

        pub fn fail_next_status_queries(&self, count: u32) {
            self.transient_failures.store(count, Ordering::SeqCst);
        }
    }

    #[async_trait]
    impl PaymentProvider for MockProvider {
        fn name(&self) -> &str {
            "mockpay"
        }

        async fn create_payment(
            &self,
            request: &CreatePaymentRequest,
        ) -> PaymentResult<HostedPayment> {
            self.create_calls.fetch_add(1, Ordering::SeqCst);
            assert!(request.amount > 0);
            Ok(HostedPayment {
                payment_url: "https://pay.mock/checkout/abc".to_string(),
                reference: Some("MOCK-REF-1".to_string()),
            })
        }

        async fn query_status(&self, _invoice_number: &str) -> PaymentResult<ProviderStatus> {
            self.status_calls.fetch_add(1, Ordering::SeqCst);
            let remaining = self.transient_failures.load(Ordering::SeqCst);
            if remaining > 0 {
                self.transient_failures.store(remaining - 1, Ordering::SeqCst);
                return Err(PaymentError::ProviderUnavailable(
                    "simulated gateway outage".to_string(),
                ));
            }
            Ok(*self.status.lock().unwrap())
        }

        fn parse_webhook(&self, body: &str) -> PaymentResult<Option<CompletionEvent>> {
            parse_envelope(body)
        }
    }

    pub struct Harness {
        pub store: Arc<MemoryQuotaStore>,
        pub reports: Arc<MemoryReportStore>,
        pub provider: Arc<MockProvider>,
        pub service: QuotaService,
        pub user: Uuid,
    }

    pub fn harness() -> Harness {
        let store = Arc::new(MemoryQuotaStore::new());
        let reports = Arc::new(MemoryReportStore::new());
        let provider = Arc::new(MockProvider::new());
        let service = QuotaService::new(
            store.clone(),
            reports.clone(),
            provider.clone(),
            Signer::new("edge-case-secret"),
            "https://app.test/payment/status".to_string(),
            PollPolicy {
                max_attempts: 3,
                interval: std::time::Duration::from_millis(1),
            },
        );
        Harness {
            store,
            reports,
            provider,
            service,
            user: Uuid::new_v4(),
        }
    }

    pub fn buyer() -> Buyer {
        Buyer {
            name: "Budi Santoso".to_string(),
            email: "budi@example.com".to_string(),
            mobile: "081234567890".to_string(),
        }
    }

    pub fn success_webhook(invoice_number: &str) -> String {
        format!(
            r#"{{"event":"payment.updated","data":{{"external_reference":"{}","status":"PAID"}}}}"#,
            invoice_number
        )
    }

    pub fn failure_webhook(invoice_number: &str) -> String {
        format!(
            r#"{{"event":"payment.updated","data":{{"external_reference":"{}","status":"EXPIRED"}}}}"#,
            invoice_number
        )
    }
}

mod reconciler_tests {
    use std::sync::Arc;

    use tokio::sync::Barrier;

    use super::support::*;
    use crate::error::PaymentError;
    use crate::model::{EntryKind, IntentStatus};
    use crate::provider::ProviderStatus;
    use crate::reconciler::{PollPolicy, ReconcileOutcome};
    use crate::store::QuotaStore;

    #[tokio::test]
    async fn five_quota_webhook_credits_five_units_once() {
        let h = harness();
        let created = h
            .service
            .intents
            .create_intent(h.user, &buyer(), "5_quota", 350_000)
            .await
            .unwrap();

        let outcome = h
            .service
            .reconciler
            .handle_webhook(&success_webhook(&created.invoice_number))
            .await
            .unwrap();

        assert_eq!(outcome, ReconcileOutcome::Credited { units: 5 });
        assert_eq!(h.store.balance(h.user).await.unwrap(), 5);

        let entries = h.store.entries(h.user).await.unwrap();
        assert_eq!(entries.len(), 1);
        assert_eq!(entries[0].kind, EntryKind::Purchase);
        assert_eq!(entries[0].amount, 5);
        assert_eq!(
            entries[0].reference.as_deref(),
            Some(created.invoice_number.as_str())
        );

        let intent = h
            .store
            .intent(&created.invoice_number)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(intent.status, IntentStatus::Success);
        assert!(intent.paid_at.is_some());
    }

    #[tokio::test]
    async fn webhook_redelivery_is_idempotent() {
        let h = harness();
        let created = h
            .service
            .intents
            .create_intent(h.user, &buyer(), "3_quota", 250_000)
            .await
            .unwrap();
        let body = success_webhook(&created.invoice_number);

        assert_eq!(
            h.service.reconciler.handle_webhook(&body).await.unwrap(),
            ReconcileOutcome::Credited { units: 3 }
        );
        for _ in 0..5 {
            assert_eq!(
                h.service.reconciler.handle_webhook(&body).await.unwrap(),
                ReconcileOutcome::AlreadyProcessed
            );
        }

        assert_eq!(h.store.balance(h.user).await.unwrap(), 3);
        assert_eq!(h.store.entries(h.user).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn concurrent_webhook_and_poll_credit_exactly_once() {
        let h = harness();
        let created = h
            .service
            .intents
            .create_intent(h.user, &buyer(), "5_quota", 350_000)
            .await
            .unwrap();
        h.provider.set_status(ProviderStatus::Success);

        let reconciler = Arc::new(h.service.reconciler);
        let barrier = Arc::new(Barrier::new(8));
        let mut handles = vec![];

        for i in 0..8 {
            let reconciler = Arc::clone(&reconciler);
            let barrier = Arc::clone(&barrier);
            let invoice = created.invoice_number.clone();
            let body = success_webhook(&invoice);

            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                if i % 2 == 0 {
                    reconciler.handle_webhook(&body).await
                } else {
                    reconciler.poll(&invoice).await
                }
            }));
        }

        let mut credited = 0;
        let mut settled = 0;
        for handle in handles {
            let outcome = handle.await.unwrap().unwrap();
            assert!(outcome.is_settled(), "unexpected outcome: {:?}", outcome);
            settled += 1;
            if matches!(outcome, ReconcileOutcome::Credited { .. }) {
                credited += 1;
            }
        }

        assert_eq!(settled, 8);
        assert_eq!(credited, 1, "exactly one signal wins the transition");
        assert_eq!(h.store.balance(h.user).await.unwrap(), 5, "5, not 10");
        assert_eq!(h.store.entries(h.user).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn poll_reports_still_pending_without_failing_the_intent() {
        let h = harness();
        let created = h
            .service
            .intents
            .create_intent(h.user, &buyer(), "1_quota", 100_000)
            .await
            .unwrap();

        // Provider still shows pending.
        assert_eq!(
            h.service.reconciler.poll(&created.invoice_number).await.unwrap(),
            ReconcileOutcome::StillPending
        );
        let intent = h
            .store
            .intent(&created.invoice_number)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(intent.status, IntentStatus::Pending);
        assert_eq!(h.store.balance(h.user).await.unwrap(), 0);

        // Provider settles; the next poll credits.
        h.provider.set_status(ProviderStatus::Success);
        assert_eq!(
            h.service.reconciler.poll(&created.invoice_number).await.unwrap(),
            ReconcileOutcome::Credited { units: 1 }
        );
    }

    #[tokio::test]
    async fn poll_after_success_skips_the_provider() {
        let h = harness();
        let created = h
            .service
            .intents
            .create_intent(h.user, &buyer(), "1_quota", 100_000)
            .await
            .unwrap();
        h.provider.set_status(ProviderStatus::Success);

        h.service.reconciler.poll(&created.invoice_number).await.unwrap();
        let calls_after_credit = h
            .provider
            .status_calls
            .load(std::sync::atomic::Ordering::SeqCst);

        assert_eq!(
            h.service.reconciler.poll(&created.invoice_number).await.unwrap(),
            ReconcileOutcome::AlreadyProcessed
        );
        assert_eq!(
            h.provider
                .status_calls
                .load(std::sync::atomic::Ordering::SeqCst),
            calls_after_credit,
            "local success answers without a provider call"
        );
    }

    #[tokio::test]
    async fn poll_until_complete_exhausts_to_still_pending() {
        let h = harness();
        let created = h
            .service
            .intents
            .create_intent(h.user, &buyer(), "1_quota", 100_000)
            .await
            .unwrap();

        let outcome = h
            .service
            .reconciler
            .poll_until_complete(
                &created.invoice_number,
                PollPolicy {
                    max_attempts: 3,
                    interval: std::time::Duration::from_millis(1),
                },
            )
            .await
            .unwrap();

        // Exhaustion is "check back later", never a false failure.
        assert_eq!(outcome, ReconcileOutcome::StillPending);
        assert_eq!(
            h.provider
                .status_calls
                .load(std::sync::atomic::Ordering::SeqCst),
            3
        );
        assert_eq!(
            h.store
                .intent(&created.invoice_number)
                .await
                .unwrap()
                .unwrap()
                .status,
            IntentStatus::Pending
        );
    }

    #[tokio::test]
    async fn poll_retries_transient_provider_errors() {
        let h = harness();
        let created = h
            .service
            .intents
            .create_intent(h.user, &buyer(), "3_quota", 250_000)
            .await
            .unwrap();
        h.provider.set_status(ProviderStatus::Success);
        h.provider.fail_next_status_queries(2);

        assert_eq!(
            h.service.reconciler.poll(&created.invoice_number).await.unwrap(),
            ReconcileOutcome::Credited { units: 3 }
        );
    }

    #[tokio::test]
    async fn webhook_for_unknown_invoice_is_not_found() {
        let h = harness();
        let err = h
            .service
            .reconciler
            .handle_webhook(&success_webhook("INV-1700000000-GHOST1"))
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::NotFound(_)));
    }

    #[tokio::test]
    async fn failure_webhook_marks_intent_failed_and_success_cannot_revive_it() {
        let h = harness();
        let created = h
            .service
            .intents
            .create_intent(h.user, &buyer(), "1_quota", 100_000)
            .await
            .unwrap();

        assert_eq!(
            h.service
                .reconciler
                .handle_webhook(&failure_webhook(&created.invoice_number))
                .await
                .unwrap(),
            ReconcileOutcome::Failed
        );
        // Terminal states are immutable: a late success signal does not
        // credit a failed intent.
        assert_eq!(
            h.service
                .reconciler
                .handle_webhook(&success_webhook(&created.invoice_number))
                .await
                .unwrap(),
            ReconcileOutcome::Failed
        );
        assert_eq!(h.store.balance(h.user).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn failure_webhook_after_success_keeps_the_credit() {
        let h = harness();
        let created = h
            .service
            .intents
            .create_intent(h.user, &buyer(), "1_quota", 100_000)
            .await
            .unwrap();

        h.service
            .reconciler
            .handle_webhook(&success_webhook(&created.invoice_number))
            .await
            .unwrap();
        assert_eq!(
            h.service
                .reconciler
                .handle_webhook(&failure_webhook(&created.invoice_number))
                .await
                .unwrap(),
            ReconcileOutcome::AlreadyProcessed
        );
        assert_eq!(h.store.balance(h.user).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn non_terminal_webhook_is_ignored() {
        let h = harness();
        let created = h
            .service
            .intents
            .create_intent(h.user, &buyer(), "1_quota", 100_000)
            .await
            .unwrap();

        let body = format!(
            r#"{{"event":"payment.created","data":{{"external_reference":"{}","status":"PENDING"}}}}"#,
            created.invoice_number
        );
        assert_eq!(
            h.service.reconciler.handle_webhook(&body).await.unwrap(),
            ReconcileOutcome::Ignored
        );
        assert_eq!(h.store.balance(h.user).await.unwrap(), 0);
    }
}

mod intent_tests {
    use super::support::*;
    use crate::error::PaymentError;
    use crate::model::IntentStatus;
    use crate::store::QuotaStore;

    #[tokio::test]
    async fn create_intent_persists_pending_row_with_provider_reference() {
        let h = harness();
        let created = h
            .service
            .intents
            .create_intent(h.user, &buyer(), "5_quota", 350_000)
            .await
            .unwrap();

        assert_eq!(created.payment_url, "https://pay.mock/checkout/abc");
        assert!(created.invoice_number.starts_with("INV-"));

        let intent = h
            .store
            .intent(&created.invoice_number)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(intent.status, IntentStatus::Pending);
        assert_eq!(intent.provider, "mockpay");
        assert_eq!(intent.provider_reference.as_deref(), Some("MOCK-REF-1"));
        assert_eq!(intent.amount, 350_000);
        assert!(intent.paid_at.is_none());

        // No ledger effect at creation time.
        assert_eq!(h.store.balance(h.user).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn non_positive_amount_is_rejected() {
        let h = harness();
        let err = h
            .service
            .intents
            .create_intent(h.user, &buyer(), "5_quota", 0)
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::InvalidRequest(_)));
        assert_eq!(
            h.provider
                .create_calls
                .load(std::sync::atomic::Ordering::SeqCst),
            0
        );
    }

    #[tokio::test]
    async fn unknown_package_is_rejected() {
        let h = harness();
        let err = h
            .service
            .intents
            .create_intent(h.user, &buyer(), "42_quota", 100_000)
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::InvalidRequest(_)));
    }

    #[tokio::test]
    async fn description_embedded_invoice_number_survives_webhook_fallback() {
        let h = harness();
        let created = h
            .service
            .intents
            .create_intent(h.user, &buyer(), "1_quota", 100_000)
            .await
            .unwrap();

        // The description-embedded invoice number round-trips through the
        // webhook fallback path.
        let body = format!(
            r#"{{"event":"payment.updated","data":{{"status":"PAID","description":"Quota package 1_quota (1 units) {}"}}}}"#,
            created.invoice_number
        );
        let outcome = h.service.reconciler.handle_webhook(&body).await.unwrap();
        assert!(outcome.is_settled());
    }
}

mod gate_tests {
    use uuid::Uuid;

    use super::support::*;
    use crate::error::PaymentError;
    use crate::model::{EntryKind, NewLedgerEntry};
    use crate::store::{QuotaStore, ReportStore};

    #[tokio::test]
    async fn unlock_with_zero_balance_changes_nothing() {
        let h = harness();
        let report = Uuid::new_v4();
        h.reports.add_report(h.user, report).await;

        let err = h.service.gate.unlock_report(h.user, report).await.unwrap_err();
        assert!(matches!(err, PaymentError::InsufficientQuota { balance: 0 }));
        assert_eq!(h.store.balance(h.user).await.unwrap(), 0);
        assert!(!h.reports.is_unlocked(h.user, report).await.unwrap());
        assert!(h.store.entries(h.user).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn unlock_debits_one_unit_and_flips_the_flag() {
        let h = harness();
        let report = Uuid::new_v4();
        h.reports.add_report(h.user, report).await;
        h.store
            .append_entry(&NewLedgerEntry::purchase(h.user, 3, "INV-1-SEED01"))
            .await
            .unwrap();

        h.service.gate.unlock_report(h.user, report).await.unwrap();

        assert_eq!(h.store.balance(h.user).await.unwrap(), 2);
        assert!(h.reports.is_unlocked(h.user, report).await.unwrap());

        let entries = h.store.entries(h.user).await.unwrap();
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[1].kind, EntryKind::Usage);
        assert_eq!(entries[1].amount, -1);
        assert_eq!(entries[1].reference.as_deref(), Some(report.to_string().as_str()));
    }

    #[tokio::test]
    async fn unlock_is_idempotent_for_unlocked_reports() {
        let h = harness();
        let report = Uuid::new_v4();
        h.reports.add_report(h.user, report).await;
        h.store
            .append_entry(&NewLedgerEntry::purchase(h.user, 1, "INV-1-SEED02"))
            .await
            .unwrap();

        h.service.gate.unlock_report(h.user, report).await.unwrap();
        h.service.gate.unlock_report(h.user, report).await.unwrap();

        assert_eq!(h.store.balance(h.user).await.unwrap(), 0, "single debit");
        assert_eq!(h.store.entries(h.user).await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn failed_unlock_flip_compensates_the_debit() {
        let h = harness();
        let report = Uuid::new_v4();
        h.reports.add_report(h.user, report).await;
        h.store
            .append_entry(&NewLedgerEntry::purchase(h.user, 1, "INV-1-SEED03"))
            .await
            .unwrap();
        h.reports.fail_next_unlock();

        let err = h.service.gate.unlock_report(h.user, report).await.unwrap_err();
        assert!(matches!(err, PaymentError::Database(_)));

        // Balance restored by an appended +1, never by deleting the debit.
        assert_eq!(h.store.balance(h.user).await.unwrap(), 1);
        assert!(!h.reports.is_unlocked(h.user, report).await.unwrap());

        let entries = h.store.entries(h.user).await.unwrap();
        assert_eq!(entries.len(), 3);
        assert_eq!(entries[1].amount, -1);
        assert_eq!(entries[2].amount, 1);
        assert_eq!(entries[1].reference, entries[2].reference);

        // The restored unit is spendable again.
        h.service.gate.unlock_report(h.user, report).await.unwrap();
        assert_eq!(h.store.balance(h.user).await.unwrap(), 0);
        assert!(h.reports.is_unlocked(h.user, report).await.unwrap());
    }

    #[tokio::test]
    async fn unlock_unknown_report_is_not_found() {
        let h = harness();
        let err = h
            .service
            .gate
            .unlock_report(h.user, Uuid::new_v4())
            .await
            .unwrap_err();
        assert!(matches!(err, PaymentError::NotFound(_)));
    }

    #[tokio::test]
    async fn unlock_flip_has_a_single_winner() {
        use crate::store::MemoryReportStore;

        let reports = MemoryReportStore::new();
        let user = Uuid::new_v4();
        let report = Uuid::new_v4();
        reports.add_report(user, report).await;

        assert!(reports.set_unlocked(user, report).await.unwrap());
        assert!(!reports.set_unlocked(user, report).await.unwrap());
        assert!(reports.is_unlocked(user, report).await.unwrap());
    }

    #[tokio::test]
    async fn concurrent_unlocks_cost_exactly_one_unit() {
        use std::sync::Arc;
        use std::time::Duration;

        use async_trait::async_trait;
        use tokio::sync::Barrier;

        use crate::error::PaymentResult;
        use crate::gate::QuotaGate;
        use crate::store::{MemoryQuotaStore, MemoryReportStore};

        // Report store that yields between the idempotence read and the
        // flip, widening the window the conditional update must close.
        struct SlowReports(Arc<MemoryReportStore>);

        #[async_trait]
        impl ReportStore for SlowReports {
            async fn is_unlocked(&self, user_id: Uuid, report_id: Uuid) -> PaymentResult<bool> {
                let unlocked = self.0.is_unlocked(user_id, report_id).await?;
                tokio::time::sleep(Duration::from_millis(25)).await;
                Ok(unlocked)
            }

            async fn set_unlocked(&self, user_id: Uuid, report_id: Uuid) -> PaymentResult<bool> {
                self.0.set_unlocked(user_id, report_id).await
            }
        }

        let store = Arc::new(MemoryQuotaStore::new());
        let reports = Arc::new(MemoryReportStore::new());
        let user = Uuid::new_v4();
        let report = Uuid::new_v4();
        reports.add_report(user, report).await;
        store
            .append_entry(&NewLedgerEntry::purchase(user, 2, "INV-1-SEED04"))
            .await
            .unwrap();

        let gate = Arc::new(QuotaGate::new(
            store.clone(),
            Arc::new(SlowReports(reports.clone())),
        ));
        let barrier = Arc::new(Barrier::new(2));
        let mut handles = vec![];
        for _ in 0..2 {
            let gate = Arc::clone(&gate);
            let barrier = Arc::clone(&barrier);
            handles.push(tokio::spawn(async move {
                barrier.wait().await;
                gate.unlock_report(user, report).await
            }));
        }
        for handle in handles {
            handle.await.unwrap().unwrap();
        }

        assert!(reports.is_unlocked(user, report).await.unwrap());
        assert_eq!(
            store.balance(user).await.unwrap(),
            1,
            "one report unlock must cost exactly one unit"
        );

        // The losing debit is refunded by an appended credit, never by
        // deleting the debit row.
        let entries = store.entries(user).await.unwrap();
        let debits = entries.iter().filter(|e| e.amount == -1).count();
        let refunds = entries
            .iter()
            .filter(|e| e.amount == 1 && e.kind == EntryKind::Usage)
            .count();
        assert_eq!(debits, refunds + 1);
    }
}

mod repair_tests {
    use time::OffsetDateTime;
    use uuid::Uuid;

    use super::support::*;
    use crate::model::{IntentStatus, PaymentIntent};
    use crate::store::QuotaStore;

    fn pending_intent(user: Uuid, invoice_number: &str, package_code: &str) -> PaymentIntent {
        PaymentIntent {
            invoice_number: invoice_number.to_string(),
            user_id: user,
            package_code: package_code.to_string(),
            amount: 350_000,
            status: IntentStatus::Pending,
            provider: "mockpay".to_string(),
            provider_reference: None,
            created_at: OffsetDateTime::now_utc(),
            paid_at: None,
        }
    }

    #[tokio::test]
    async fn repair_inserts_missing_credit_exactly_once() {
        let h = harness();

        // Simulate the partial failure: CAS landed, ledger append did not.
        h.store
            .insert_intent(&pending_intent(h.user, "INV-1-ORPHAN", "5_quota"))
            .await
            .unwrap();
        assert!(h.store.claim_success("INV-1-ORPHAN").await.unwrap());
        assert_eq!(h.store.balance(h.user).await.unwrap(), 0);

        assert_eq!(h.service.reconciler.repair_missing_credits().await.unwrap(), 1);
        assert_eq!(h.store.balance(h.user).await.unwrap(), 5);
        assert!(h.store.has_purchase_entry("INV-1-ORPHAN").await.unwrap());

        // Second pass finds nothing.
        assert_eq!(h.service.reconciler.repair_missing_credits().await.unwrap(), 0);
        assert_eq!(h.store.balance(h.user).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn repair_skips_healthy_and_pending_intents() {
        let h = harness();
        let created = h
            .service
            .intents
            .create_intent(h.user, &buyer(), "3_quota", 250_000)
            .await
            .unwrap();
        h.service
            .reconciler
            .handle_webhook(&success_webhook(&created.invoice_number))
            .await
            .unwrap();
        h.store
            .insert_intent(&pending_intent(h.user, "INV-1-WAITING", "1_quota"))
            .await
            .unwrap();

        assert_eq!(h.service.reconciler.repair_missing_credits().await.unwrap(), 0);
        assert_eq!(h.store.balance(h.user).await.unwrap(), 3);
    }

    #[tokio::test]
    async fn cached_balance_divergence_is_detected_and_repaired() {
        let h = harness();
        let created = h
            .service
            .intents
            .create_intent(h.user, &buyer(), "5_quota", 350_000)
            .await
            .unwrap();
        h.service
            .reconciler
            .handle_webhook(&success_webhook(&created.invoice_number))
            .await
            .unwrap();
        assert_eq!(h.store.cached_balance(h.user).await, Some(5));

        // Drift the cache the way a lost concurrent increment would.
        h.store.poison_cached_balance(h.user, 9).await;
        assert_eq!(
            h.store.users_with_divergent_cache().await.unwrap(),
            vec![h.user]
        );

        assert_eq!(h.store.refresh_cached_balance(h.user).await.unwrap(), 5);
        assert!(h.store.users_with_divergent_cache().await.unwrap().is_empty());
        // The ledger was never touched by the repair.
        assert_eq!(h.store.balance(h.user).await.unwrap(), 5);
    }

    #[tokio::test]
    async fn balance_always_equals_entry_sum_through_mixed_traffic() {
        let h = harness();
        let report_a = Uuid::new_v4();
        let report_b = Uuid::new_v4();
        h.reports.add_report(h.user, report_a).await;
        h.reports.add_report(h.user, report_b).await;

        let created = h
            .service
            .intents
            .create_intent(h.user, &buyer(), "3_quota", 250_000)
            .await
            .unwrap();
        h.service
            .reconciler
            .handle_webhook(&success_webhook(&created.invoice_number))
            .await
            .unwrap();

        h.service.gate.unlock_report(h.user, report_a).await.unwrap();
        h.reports.fail_next_unlock();
        let _ = h.service.gate.unlock_report(h.user, report_b).await;
        h.service.gate.unlock_report(h.user, report_b).await.unwrap();

        let entries = h.store.entries(h.user).await.unwrap();
        let sum: i64 = entries.iter().map(|e| e.amount).sum();
        assert_eq!(h.store.balance(h.user).await.unwrap(), sum);
        assert_eq!(sum, 1, "3 credited, 2 spent, 1 compensated cycle");
        assert_eq!(h.store.cached_balance(h.user).await, Some(1));
    }
}
