use std::collections::HashSet;
use std::sync::{Arc, Mutex};

use ads_engine::advertising::models::{
    ClickRecord, GrantBalance, NewCreditGrant, NewImpression, NewSubscription,
};
use ads_engine::advertising::state::add_one_month;
use ads_engine::advertising::store::TransitionWrite;
use ads_engine::advertising::{
    renewal_payment_id, AdvertisingImpression, AdvertisingPayment, AdvertisingStore,
    AdvertisingSubscription, BillingOrchestrator, ChargeOutcome, ChargeRequest, CreditLedger,
    CreditOnlyGateway, CreditReason, CreditTransaction, CronJob, CronRunError,
    MemoryAdvertisingStore, PackageType, PaymentGateway, PaymentMethod, PaymentStatus,
    StoredPaymentMethod, SubscriptionEvent, SubscriptionStateMachine, SubscriptionStatus,
    TransitionOutcome,
};
use ads_engine::AdvertisingConfig;
use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use uuid::Uuid;

// key: billing-job-tests -> cron job scenarios on the in-memory store

/// Sellers in `with_method` have a card; charges for `declining` are refused and charges
/// for `broken` fail like a gateway outage. Every attempt is recorded.
#[derive(Default)]
struct ScriptedGateway {
    with_method: HashSet<Uuid>,
    declining: HashSet<Uuid>,
    broken: HashSet<Uuid>,
    charges: Mutex<Vec<ChargeRequest>>,
}

impl ScriptedGateway {
    fn charged(&self) -> Vec<ChargeRequest> {
        self.charges.lock().unwrap().clone()
    }
}

#[async_trait]
impl PaymentGateway for ScriptedGateway {
    async fn stored_method(&self, seller_id: Uuid) -> Result<Option<StoredPaymentMethod>> {
        Ok(self
            .with_method
            .contains(&seller_id)
            .then(|| StoredPaymentMethod {
                billing_key: format!("bk_{seller_id}"),
                label: None,
            }))
    }

    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeOutcome> {
        self.charges.lock().unwrap().push(request.clone());
        if self.broken.contains(&request.seller_id) {
            return Err(anyhow!("gateway timed out"));
        }
        if self.declining.contains(&request.seller_id) {
            return Ok(ChargeOutcome::Declined {
                reason: "insufficient funds".into(),
            });
        }
        Ok(ChargeOutcome::Approved {
            transaction_ref: format!("tx_{}", request.order_id),
        })
    }
}

fn now() -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 3, 0, 0).unwrap()
}

fn active(seller_id: Uuid, period_end: DateTime<Utc>, price: i64) -> AdvertisingSubscription {
    let start = period_end - Duration::days(30);
    AdvertisingSubscription {
        id: Uuid::new_v4(),
        listing_id: Uuid::new_v4(),
        seller_id,
        status: SubscriptionStatus::Active,
        package_type: PackageType::Standard,
        monthly_price: price,
        total_impressions: 0,
        total_clicks: 0,
        current_period_start: Some(start),
        current_period_end: Some(period_end),
        created_at: start,
        updated_at: start,
    }
}

fn orchestrator(
    store: &Arc<MemoryAdvertisingStore>,
    gateway: Arc<dyn PaymentGateway>,
) -> BillingOrchestrator {
    BillingOrchestrator::new(store.clone(), gateway, &AdvertisingConfig::default())
}

#[tokio::test]
async fn renews_due_subscription_with_card() {
    let store = Arc::new(MemoryAdvertisingStore::new());
    let seller = Uuid::new_v4();
    let period_end = now() - Duration::hours(1);
    let subscription = active(seller, period_end, 55_000);
    store.put_subscription(subscription.clone()).unwrap();

    let gateway = Arc::new(ScriptedGateway {
        with_method: HashSet::from([seller]),
        ..Default::default()
    });
    let report = orchestrator(&store, gateway.clone())
        .monthly_billing(now())
        .await
        .unwrap();
    assert_eq!((report.selected, report.succeeded), (1, 1));
    assert!(report.failures.is_empty());

    let renewed = store.subscription(subscription.id).await.unwrap().unwrap();
    assert_eq!(renewed.status, SubscriptionStatus::Active);
    assert_eq!(renewed.current_period_start, Some(period_end));
    assert_eq!(renewed.current_period_end, Some(add_one_month(period_end)));

    let payments = store.payments_for(subscription.id).await.unwrap();
    assert_eq!(payments.len(), 1);
    let payment = &payments[0];
    assert_eq!(payment.status, PaymentStatus::Paid);
    assert_eq!(payment.payment_method, PaymentMethod::Card);
    assert_eq!((payment.supply_amount, payment.vat_amount), (50_000, 5_000));
    assert_eq!(
        payment.transaction_ref.as_deref(),
        Some(format!("tx_{}", payment.id).as_str())
    );

    let charged = gateway.charged();
    assert_eq!(charged.len(), 1);
    assert_eq!(charged[0].amount, 55_000);
    assert_eq!(charged[0].order_id, payment.id);
}

#[tokio::test]
async fn not_yet_due_subscription_is_untouched() {
    let store = Arc::new(MemoryAdvertisingStore::new());
    let seller = Uuid::new_v4();
    let subscription = active(seller, now() + Duration::days(3), 30_000);
    store.put_subscription(subscription.clone()).unwrap();

    let report = orchestrator(&store, Arc::new(CreditOnlyGateway))
        .monthly_billing(now())
        .await
        .unwrap();
    assert_eq!(report.selected, 0);

    let unchanged = store.subscription(subscription.id).await.unwrap().unwrap();
    assert_eq!(unchanged, subscription);
    assert!(store.payments_for(subscription.id).await.unwrap().is_empty());
}

#[tokio::test]
async fn second_run_does_not_bill_again() {
    let store = Arc::new(MemoryAdvertisingStore::new());
    let seller = Uuid::new_v4();
    let subscription = active(seller, now() - Duration::minutes(5), 30_000);
    store.put_subscription(subscription.clone()).unwrap();
    let gateway = Arc::new(ScriptedGateway {
        with_method: HashSet::from([seller]),
        ..Default::default()
    });
    let jobs = orchestrator(&store, gateway.clone());

    jobs.monthly_billing(now()).await.unwrap();
    let again = jobs.monthly_billing(now()).await.unwrap();
    assert_eq!(again.selected, 0);
    assert_eq!(gateway.charged().len(), 1);
    assert_eq!(store.payments_for(subscription.id).await.unwrap().len(), 1);
}

#[tokio::test]
async fn credit_alone_pays_without_payment_method() {
    let store = Arc::new(MemoryAdvertisingStore::new());
    let seller = Uuid::new_v4();
    let subscription = active(seller, now() - Duration::hours(2), 50_000);
    store.put_subscription(subscription.clone()).unwrap();
    let ledger = CreditLedger::new(store.clone());
    ledger
        .grant(seller, 80_000, CreditReason::Grant, None, now() - Duration::days(10))
        .await
        .unwrap();

    let report = orchestrator(&store, Arc::new(CreditOnlyGateway))
        .monthly_billing(now())
        .await
        .unwrap();
    assert_eq!(report.succeeded, 1);

    let renewed = store.subscription(subscription.id).await.unwrap().unwrap();
    assert_eq!(renewed.status, SubscriptionStatus::Active);
    let payment = &store.payments_for(subscription.id).await.unwrap()[0];
    assert_eq!(payment.payment_method, PaymentMethod::Credit);
    assert_eq!(payment.credit_applied, 50_000);
    assert_eq!(ledger.balance(seller).await.unwrap(), 30_000);

    let consumed: Vec<_> = ledger
        .history(seller)
        .await
        .unwrap()
        .into_iter()
        .filter(|entry| entry.reason == CreditReason::AdvertisingPayment)
        .collect();
    assert_eq!(consumed.len(), 1);
    assert_eq!(consumed[0].amount, -50_000);
    assert_eq!(consumed[0].payment_ref, Some(payment.id));
}

#[tokio::test]
async fn missing_payment_method_expires_subscription() {
    let store = Arc::new(MemoryAdvertisingStore::new());
    let seller = Uuid::new_v4();
    let subscription = active(seller, now() - Duration::hours(2), 30_000);
    store.put_subscription(subscription.clone()).unwrap();

    let report = orchestrator(&store, Arc::new(CreditOnlyGateway))
        .monthly_billing(now())
        .await
        .unwrap();
    assert_eq!(report.succeeded, 1);
    assert!(report.failures.is_empty());

    let expired = store.subscription(subscription.id).await.unwrap().unwrap();
    assert_eq!(expired.status, SubscriptionStatus::Expired);
    assert_eq!(expired.current_period_end, subscription.current_period_end);
    assert!(store
        .active_subscription_for_listing(subscription.listing_id)
        .await
        .unwrap()
        .is_none());

    let payment = &store.payments_for(subscription.id).await.unwrap()[0];
    assert_eq!(payment.status, PaymentStatus::Failed);
    assert_eq!(
        payment.failure_reason.as_deref(),
        Some("insufficient credit and no stored payment method")
    );
}

#[tokio::test]
async fn declined_charge_restores_partial_credit() {
    let store = Arc::new(MemoryAdvertisingStore::new());
    let seller = Uuid::new_v4();
    let subscription = active(seller, now() - Duration::hours(2), 50_000);
    store.put_subscription(subscription.clone()).unwrap();
    let ledger = CreditLedger::new(store.clone());
    ledger
        .grant(seller, 20_000, CreditReason::Promotion, None, now() - Duration::days(1))
        .await
        .unwrap();

    let gateway = Arc::new(ScriptedGateway {
        with_method: HashSet::from([seller]),
        declining: HashSet::from([seller]),
        ..Default::default()
    });
    orchestrator(&store, gateway.clone())
        .monthly_billing(now())
        .await
        .unwrap();

    assert_eq!(gateway.charged()[0].amount, 30_000);
    let expired = store.subscription(subscription.id).await.unwrap().unwrap();
    assert_eq!(expired.status, SubscriptionStatus::Expired);
    let payment = &store.payments_for(subscription.id).await.unwrap()[0];
    assert_eq!(payment.status, PaymentStatus::Failed);
    assert_eq!(payment.credit_applied, 0);
    assert_eq!(
        payment.failure_reason.as_deref(),
        Some("charge declined: insufficient funds")
    );
    assert_eq!(ledger.balance(seller).await.unwrap(), 20_000);
}

#[tokio::test]
async fn failing_row_does_not_stop_the_batch() {
    let store = Arc::new(MemoryAdvertisingStore::new());
    let sellers = [Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4()];
    let subscriptions: Vec<_> = sellers
        .iter()
        .enumerate()
        .map(|(index, seller)| {
            active(*seller, now() - Duration::hours(3 - index as i64), 30_000)
        })
        .collect();
    for subscription in &subscriptions {
        store.put_subscription(subscription.clone()).unwrap();
    }

    let gateway = Arc::new(ScriptedGateway {
        with_method: sellers.iter().copied().collect(),
        broken: HashSet::from([sellers[1]]),
        ..Default::default()
    });
    let report = orchestrator(&store, gateway)
        .monthly_billing(now())
        .await
        .unwrap();

    assert_eq!(report.selected, 3);
    assert_eq!(report.succeeded, 2);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].id, subscriptions[1].id);
    assert!(report.failures[0].error.contains("gateway timed out"));

    for (index, original) in subscriptions.iter().enumerate() {
        let current = store.subscription(original.id).await.unwrap().unwrap();
        assert_eq!(current.status, SubscriptionStatus::Active);
        if index == 1 {
            assert_eq!(current.current_period_end, original.current_period_end);
            assert!(store.payments_for(original.id).await.unwrap().is_empty());
        } else {
            assert_eq!(
                current.current_period_end,
                original.current_period_end.map(add_one_month)
            );
        }
    }
}

#[tokio::test]
async fn gateway_outage_puts_credit_back() {
    let store = Arc::new(MemoryAdvertisingStore::new());
    let seller = Uuid::new_v4();
    let subscription = active(seller, now() - Duration::hours(2), 50_000);
    store.put_subscription(subscription.clone()).unwrap();
    let ledger = CreditLedger::new(store.clone());
    ledger
        .grant(seller, 10_000, CreditReason::Grant, None, now() - Duration::days(1))
        .await
        .unwrap();

    let gateway = Arc::new(ScriptedGateway {
        with_method: HashSet::from([seller]),
        broken: HashSet::from([seller]),
        ..Default::default()
    });
    let report = orchestrator(&store, gateway)
        .monthly_billing(now())
        .await
        .unwrap();

    assert_eq!(report.failures.len(), 1);
    assert_eq!(ledger.balance(seller).await.unwrap(), 10_000);
    let untouched = store.subscription(subscription.id).await.unwrap().unwrap();
    assert_eq!(untouched.status, SubscriptionStatus::Active);
}

async fn pending_bank_transfer(
    store: &Arc<MemoryAdvertisingStore>,
    selected_at: DateTime<Utc>,
) -> AdvertisingSubscription {
    let (subscription, _) = store
        .insert_subscription(
            NewSubscription {
                listing_id: Uuid::new_v4(),
                seller_id: Uuid::new_v4(),
                package_type: PackageType::Basic,
                monthly_price: 30_000,
            },
            selected_at,
        )
        .await
        .unwrap()
        .unwrap();
    let machine = SubscriptionStateMachine::new(store.clone());
    let outcome = machine
        .transition(
            subscription.id,
            SubscriptionEvent::BankTransferSelected {
                depositor_name: "Kim Minji".into(),
                depositor_bank: Some("Kookmin".into()),
                window: Duration::hours(72),
            },
            selected_at,
        )
        .await
        .unwrap();
    assert!(outcome.is_applied());
    outcome.subscription().cloned().unwrap()
}

#[tokio::test]
async fn lapsed_bank_transfer_is_cancelled_once() {
    let store = Arc::new(MemoryAdvertisingStore::new());
    let selected_at = now() - Duration::hours(80);
    let subscription = pending_bank_transfer(&store, selected_at).await;
    let jobs = orchestrator(&store, Arc::new(CreditOnlyGateway));

    let report = jobs.expire_bank_transfers(now()).await.unwrap();
    assert_eq!((report.selected, report.succeeded), (1, 1));

    let cancelled = store.subscription(subscription.id).await.unwrap().unwrap();
    assert_eq!(cancelled.status, SubscriptionStatus::Cancelled);
    let payments = store.payments_for(subscription.id).await.unwrap();
    assert!(payments
        .iter()
        .all(|payment| payment.status == PaymentStatus::Expired));
    assert!(store.pending_payment(subscription.id).await.unwrap().is_none());

    let replay = jobs.expire_bank_transfers(now()).await.unwrap();
    assert_eq!(replay.selected, 0);
    assert_eq!(
        store.subscription(subscription.id).await.unwrap().unwrap(),
        cancelled
    );
}

#[tokio::test]
async fn bank_transfer_inside_window_is_left_alone() {
    let store = Arc::new(MemoryAdvertisingStore::new());
    let subscription = pending_bank_transfer(&store, now() - Duration::hours(10)).await;

    let report = orchestrator(&store, Arc::new(CreditOnlyGateway))
        .expire_bank_transfers(now())
        .await
        .unwrap();
    assert_eq!(report.selected, 0);
    let still = store.subscription(subscription.id).await.unwrap().unwrap();
    assert_eq!(still.status, SubscriptionStatus::PendingBankTransfer);
}

#[tokio::test]
async fn deposit_after_window_is_rejected() {
    let store = Arc::new(MemoryAdvertisingStore::new());
    let subscription = pending_bank_transfer(&store, now() - Duration::hours(73)).await;
    let machine = SubscriptionStateMachine::new(store.clone());

    let outcome = machine
        .transition(
            subscription.id,
            SubscriptionEvent::DepositConfirmed {
                transaction_ref: None,
            },
            now(),
        )
        .await
        .unwrap();
    assert!(matches!(outcome, TransitionOutcome::Rejected { .. }));
    let still = store.subscription(subscription.id).await.unwrap().unwrap();
    assert_eq!(still.status, SubscriptionStatus::PendingBankTransfer);
}

#[tokio::test]
async fn deposit_inside_window_activates_for_a_month() {
    let store = Arc::new(MemoryAdvertisingStore::new());
    let subscription = pending_bank_transfer(&store, now() - Duration::hours(5)).await;
    let machine = SubscriptionStateMachine::new(store.clone());

    let outcome = machine
        .transition(
            subscription.id,
            SubscriptionEvent::DepositConfirmed {
                transaction_ref: Some("deposit-77".into()),
            },
            now(),
        )
        .await
        .unwrap();
    let activated = outcome.subscription().cloned().unwrap();
    assert_eq!(activated.status, SubscriptionStatus::Active);
    assert_eq!(activated.current_period_start, Some(now()));
    assert_eq!(activated.current_period_end, Some(add_one_month(now())));
    assert!(store.pending_payment(subscription.id).await.unwrap().is_none());
}

#[tokio::test]
async fn expired_credit_loses_only_what_was_left() {
    let store = Arc::new(MemoryAdvertisingStore::new());
    let ledger = CreditLedger::new(store.clone());
    let seller = Uuid::new_v4();
    let granted_at = now() - Duration::days(40);
    ledger
        .grant(
            seller,
            100_000,
            CreditReason::Grant,
            Some(Duration::days(30)),
            granted_at,
        )
        .await
        .unwrap();
    let draw = ledger
        .consume(seller, 30_000, Uuid::new_v4(), granted_at + Duration::days(5))
        .await
        .unwrap();
    assert_eq!(draw.drawn(), 30_000);

    let jobs = orchestrator(&store, Arc::new(CreditOnlyGateway));
    let before = ledger.history(seller).await.unwrap().len();
    let report = jobs.expire_credits(now()).await.unwrap();
    assert_eq!((report.selected, report.succeeded), (1, 1));

    let history = ledger.history(seller).await.unwrap();
    assert_eq!(history.len(), before + 1);
    let expiry = history.last().unwrap();
    assert_eq!(expiry.reason, CreditReason::Expired);
    assert_eq!(expiry.amount, -70_000);
    assert_eq!(expiry.balance_after, 0);
    assert_eq!(ledger.balance(seller).await.unwrap(), 0);

    let replay = jobs.expire_credits(now()).await.unwrap();
    assert_eq!(replay.selected, 0);
    assert_eq!(ledger.history(seller).await.unwrap().len(), before + 1);
}

#[tokio::test]
async fn held_lease_blocks_the_same_job_only() {
    let store = Arc::new(MemoryAdvertisingStore::new());
    let jobs = orchestrator(&store, Arc::new(CreditOnlyGateway));
    assert!(store
        .try_acquire_job_lease("advertising:monthly-billing", now(), Duration::minutes(15))
        .await
        .unwrap()
        .is_some());

    let blocked = jobs.run(CronJob::MonthlyBilling, now()).await;
    assert!(matches!(blocked, Err(CronRunError::AlreadyRunning)));
    let all = jobs.run(CronJob::All, now()).await;
    assert!(matches!(all, Err(CronRunError::AlreadyRunning)));

    let other = jobs.run(CronJob::ExpireCredits, now()).await.unwrap();
    assert_eq!(other.len(), 1);
    assert_eq!(other[0].job, CronJob::ExpireCredits);

    // a lapsed lease no longer blocks
    let later = now() + Duration::minutes(16);
    assert!(jobs.run(CronJob::MonthlyBilling, later).await.is_ok());
}

#[tokio::test]
async fn all_runs_every_job_and_releases_leases() {
    let store = Arc::new(MemoryAdvertisingStore::new());
    let jobs = orchestrator(&store, Arc::new(CreditOnlyGateway));

    let reports = jobs.run(CronJob::All, now()).await.unwrap();
    let names: Vec<_> = reports.iter().map(|report| report.job).collect();
    assert_eq!(
        names,
        vec![
            CronJob::MonthlyBilling,
            CronJob::ExpireBankTransfers,
            CronJob::ExpireCredits
        ]
    );
    assert!(jobs.run(CronJob::All, now()).await.is_ok());
}

#[tokio::test]
async fn stale_holder_cannot_release_a_taken_over_lease() {
    let store = Arc::new(MemoryAdvertisingStore::new());
    let jobs = orchestrator(&store, Arc::new(CreditOnlyGateway));
    let ttl = Duration::seconds(900);

    let stalled = store
        .try_acquire_job_lease("advertising:monthly-billing", now(), ttl)
        .await
        .unwrap()
        .expect("free lease is taken");
    let takeover_at = now() + Duration::seconds(901);
    let current = store
        .try_acquire_job_lease("advertising:monthly-billing", takeover_at, ttl)
        .await
        .unwrap()
        .expect("lapsed lease is taken over");
    assert_ne!(stalled, current);

    // The stalled run finishing late must not free the lease for a third run.
    store
        .release_job_lease("advertising:monthly-billing", stalled)
        .await
        .unwrap();
    let third = jobs
        .run(CronJob::MonthlyBilling, takeover_at + Duration::seconds(1))
        .await;
    assert!(matches!(third, Err(CronRunError::AlreadyRunning)));

    store
        .release_job_lease("advertising:monthly-billing", current)
        .await
        .unwrap();
    assert!(jobs
        .run(CronJob::MonthlyBilling, takeover_at + Duration::seconds(2))
        .await
        .is_ok());
}

#[tokio::test]
async fn retried_renewal_reuses_the_order_id() {
    let store = Arc::new(MemoryAdvertisingStore::new());
    let seller = Uuid::new_v4();
    let subscription = active(seller, now() - Duration::hours(2), 30_000);
    store.put_subscription(subscription.clone()).unwrap();

    let outage = Arc::new(ScriptedGateway {
        with_method: HashSet::from([seller]),
        broken: HashSet::from([seller]),
        ..Default::default()
    });
    let report = orchestrator(&store, outage.clone())
        .monthly_billing(now())
        .await
        .unwrap();
    assert_eq!(report.failures.len(), 1);

    let recovered = Arc::new(ScriptedGateway {
        with_method: HashSet::from([seller]),
        ..Default::default()
    });
    let first_try = outage.charged()[0].order_id;
    assert_eq!(first_try, renewal_payment_id(&subscription));
    let report = orchestrator(&store, recovered.clone())
        .monthly_billing(now() + Duration::minutes(10))
        .await
        .unwrap();
    assert_eq!(report.succeeded, 1);

    let charged = recovered.charged();
    assert_eq!(charged.len(), 1);
    assert_eq!(charged[0].order_id, first_try);
    let payment = &store.payments_for(subscription.id).await.unwrap()[0];
    assert_eq!(payment.id, first_try);
}

/// Delegates to the in-memory store but refuses every subscription transition, either by
/// reporting a guard mismatch or by failing the write.
struct RefusingStore {
    inner: Arc<MemoryAdvertisingStore>,
    fail_writes: bool,
}

#[async_trait]
impl AdvertisingStore for RefusingStore {
    async fn insert_subscription(
        &self,
        new: NewSubscription,
        at: DateTime<Utc>,
    ) -> Result<Option<(AdvertisingSubscription, AdvertisingPayment)>> {
        self.inner.insert_subscription(new, at).await
    }
    async fn subscription(&self, id: Uuid) -> Result<Option<AdvertisingSubscription>> {
        self.inner.subscription(id).await
    }
    async fn active_subscription_for_listing(
        &self,
        listing_id: Uuid,
    ) -> Result<Option<AdvertisingSubscription>> {
        self.inner.active_subscription_for_listing(listing_id).await
    }
    async fn list_seller_subscriptions(
        &self,
        seller_id: Uuid,
    ) -> Result<Vec<AdvertisingSubscription>> {
        self.inner.list_seller_subscriptions(seller_id).await
    }
    async fn due_subscriptions(&self, now: DateTime<Utc>) -> Result<Vec<AdvertisingSubscription>> {
        self.inner.due_subscriptions(now).await
    }
    async fn record_impression(&self, new: NewImpression) -> Result<(AdvertisingImpression, i64)> {
        self.inner.record_impression(new).await
    }
    async fn record_click(&self, subscription_id: Uuid, at: DateTime<Utc>) -> Result<ClickRecord> {
        self.inner.record_click(subscription_id, at).await
    }
    async fn apply_transition(
        &self,
        _write: TransitionWrite,
    ) -> Result<Option<AdvertisingSubscription>> {
        if self.fail_writes {
            Err(anyhow!("connection reset"))
        } else {
            Ok(None)
        }
    }
    async fn payment(&self, id: Uuid) -> Result<Option<AdvertisingPayment>> {
        self.inner.payment(id).await
    }
    async fn pending_payment(&self, subscription_id: Uuid) -> Result<Option<AdvertisingPayment>> {
        self.inner.pending_payment(subscription_id).await
    }
    async fn payments_for(&self, subscription_id: Uuid) -> Result<Vec<AdvertisingPayment>> {
        self.inner.payments_for(subscription_id).await
    }
    async fn resolve_payment(
        &self,
        id: Uuid,
        to: PaymentStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<AdvertisingPayment>> {
        self.inner.resolve_payment(id, to, at).await
    }
    async fn expired_bank_transfers(&self, now: DateTime<Utc>) -> Result<Vec<AdvertisingPayment>> {
        self.inner.expired_bank_transfers(now).await
    }
    async fn grant_credit(
        &self,
        grant: NewCreditGrant,
        at: DateTime<Utc>,
    ) -> Result<CreditTransaction> {
        self.inner.grant_credit(grant, at).await
    }
    async fn credit_balance(&self, seller_id: Uuid) -> Result<i64> {
        self.inner.credit_balance(seller_id).await
    }
    async fn credit_history(&self, seller_id: Uuid) -> Result<Vec<CreditTransaction>> {
        self.inner.credit_history(seller_id).await
    }
    async fn open_grants(&self, seller_id: Uuid, now: DateTime<Utc>) -> Result<Vec<GrantBalance>> {
        self.inner.open_grants(seller_id, now).await
    }
    async fn consume_credit(
        &self,
        seller_id: Uuid,
        max_amount: i64,
        payment_ref: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Vec<CreditTransaction>> {
        self.inner
            .consume_credit(seller_id, max_amount, payment_ref, at)
            .await
    }
    async fn restore_credit(
        &self,
        consumed: &[CreditTransaction],
        at: DateTime<Utc>,
    ) -> Result<Vec<CreditTransaction>> {
        self.inner.restore_credit(consumed, at).await
    }
    async fn expired_grants(&self, now: DateTime<Utc>) -> Result<Vec<GrantBalance>> {
        self.inner.expired_grants(now).await
    }
    async fn expire_grant(
        &self,
        grant_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<CreditTransaction>> {
        self.inner.expire_grant(grant_id, at).await
    }
    async fn try_acquire_job_lease(
        &self,
        job: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Option<Uuid>> {
        self.inner.try_acquire_job_lease(job, now, ttl).await
    }
    async fn release_job_lease(&self, job: &str, holder: Uuid) -> Result<()> {
        self.inner.release_job_lease(job, holder).await
    }
}

async fn approved_charge_not_recorded(fail_writes: bool) -> String {
    let inner = Arc::new(MemoryAdvertisingStore::new());
    let seller = Uuid::new_v4();
    let subscription = active(seller, now() - Duration::hours(2), 50_000);
    inner.put_subscription(subscription.clone()).unwrap();
    let ledger = CreditLedger::new(inner.clone());
    ledger
        .grant(seller, 20_000, CreditReason::Grant, None, now() - Duration::days(1))
        .await
        .unwrap();

    let gateway = Arc::new(ScriptedGateway {
        with_method: HashSet::from([seller]),
        ..Default::default()
    });
    let store = Arc::new(RefusingStore {
        inner: inner.clone(),
        fail_writes,
    });
    let report = BillingOrchestrator::new(store, gateway.clone(), &AdvertisingConfig::default())
        .monthly_billing(now())
        .await
        .unwrap();

    assert_eq!(report.succeeded, 0);
    assert_eq!(report.failures.len(), 1);
    assert_eq!(report.failures[0].id, subscription.id);
    let charged = gateway.charged();
    assert_eq!(charged.len(), 1);
    assert_eq!(charged[0].amount, 30_000);

    let error = report.failures[0].error.clone();
    assert!(error.contains(&format!("tx_{}", charged[0].order_id)));
    assert!(error.contains(&charged[0].order_id.to_string()));

    assert_eq!(ledger.balance(seller).await.unwrap(), 20_000);
    assert_eq!(
        inner.subscription(subscription.id).await.unwrap().unwrap(),
        subscription
    );
    assert!(inner.payments_for(subscription.id).await.unwrap().is_empty());
    error
}

#[tokio::test]
async fn approved_charge_with_rejected_renewal_is_reported() {
    let error = approved_charge_not_recorded(false).await;
    assert!(error.contains("renewal was rejected"));
}

#[tokio::test]
async fn approved_charge_with_failed_renewal_write_is_reported() {
    let error = approved_charge_not_recorded(true).await;
    assert!(error.contains("renewal was not recorded"));
    assert!(error.contains("connection reset"));
}
