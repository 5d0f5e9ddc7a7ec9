use std::sync::Arc;

use ads_engine::advertising::models::{NewImpression, NewSubscription};
use ads_engine::advertising::{
    AdvertisingStore, CreditLedger, CreditReason, ListingDirectory, PackageType, PaymentStatus,
    PgAdvertisingStore, PgListingDirectory, SubscriptionEvent, SubscriptionStateMachine,
    SubscriptionStatus, TransitionOutcome,
};
use chrono::{Duration, Utc};
use sqlx::PgPool;
use uuid::Uuid;

async fn seeded_listing(pool: &PgPool) -> (Uuid, Uuid) {
    let listing_id = Uuid::new_v4();
    let seller_id = Uuid::new_v4();
    sqlx::query("INSERT INTO listings (id, seller_id) VALUES ($1, $2)")
        .bind(listing_id)
        .bind(seller_id)
        .execute(pool)
        .await
        .unwrap();
    (listing_id, seller_id)
}

// key: advertising-pg-tests -> checkout, activation and counters against Postgres
#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn checkout_activation_and_counters(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let (listing_id, seller_id) = seeded_listing(&pool).await;

    let directory = PgListingDirectory::new(pool.clone());
    assert_eq!(directory.listing_owner(listing_id).await.unwrap(), Some(seller_id));
    assert_eq!(directory.listing_owner(Uuid::new_v4()).await.unwrap(), None);

    let store: Arc<dyn AdvertisingStore> = Arc::new(PgAdvertisingStore::new(pool.clone()));
    let now = Utc::now();
    let new = NewSubscription {
        listing_id,
        seller_id,
        package_type: PackageType::Standard,
        monthly_price: 50_000,
    };
    let (subscription, payment) = store
        .insert_subscription(new.clone(), now)
        .await
        .unwrap()
        .expect("first checkout is accepted");
    assert_eq!(subscription.status, SubscriptionStatus::PendingPayment);
    assert_eq!(payment.status, PaymentStatus::Pending);
    assert_eq!(payment.supply_amount + payment.vat_amount, 50_000);
    assert!(store.insert_subscription(new, now).await.unwrap().is_none());

    let machine = SubscriptionStateMachine::new(store.clone());
    let outcome = machine
        .transition(
            subscription.id,
            SubscriptionEvent::PaymentConfirmed {
                transaction_ref: Some("pg-tx-1".into()),
            },
            now,
        )
        .await
        .unwrap();
    assert!(matches!(outcome, TransitionOutcome::Applied { .. }));
    let settled = store.payment(payment.id).await.unwrap().unwrap();
    assert_eq!(settled.status, PaymentStatus::Paid);
    assert_eq!(settled.transaction_ref.as_deref(), Some("pg-tx-1"));

    let active = store
        .active_subscription_for_listing(listing_id)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(active.id, subscription.id);

    let mut counts = Vec::new();
    for page_number in 1..=4 {
        let (_, count) = store
            .record_impression(NewImpression {
                subscription_id: subscription.id,
                listing_id,
                category_id: Uuid::new_v4(),
                position: Some(0),
                page_number,
            })
            .await
            .unwrap();
        counts.push(count);
    }
    assert_eq!(counts, vec![1, 2, 3, 4]);

    let click = store.record_click(subscription.id, Utc::now()).await.unwrap();
    assert!(click.impression_id.is_some());
    assert_eq!(click.total_clicks, 1);
    assert_eq!(click.total_impressions, 4);

    let rejected = machine
        .transition(
            subscription.id,
            SubscriptionEvent::PaymentConfirmed {
                transaction_ref: None,
            },
            Utc::now(),
        )
        .await
        .unwrap();
    assert!(matches!(rejected, TransitionOutcome::Rejected { .. }));
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn credit_draw_restore_and_expiry(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store: Arc<dyn AdvertisingStore> = Arc::new(PgAdvertisingStore::new(pool.clone()));
    let ledger = CreditLedger::new(store.clone());
    let seller = Uuid::new_v4();
    let now = Utc::now();

    let short = ledger
        .grant(seller, 20_000, CreditReason::Promotion, Some(Duration::days(2)), now)
        .await
        .unwrap();
    ledger
        .grant(seller, 50_000, CreditReason::Grant, Some(Duration::days(60)), now)
        .await
        .unwrap();
    assert_eq!(ledger.balance(seller).await.unwrap(), 70_000);

    let draw = ledger
        .consume(seller, 30_000, Uuid::new_v4(), now)
        .await
        .unwrap();
    assert_eq!(draw.drawn(), 30_000);
    assert_eq!(draw.entries[0].grant_id, Some(short.id));
    assert_eq!(ledger.balance(seller).await.unwrap(), 40_000);

    ledger.restore(&draw, now).await.unwrap();
    assert_eq!(ledger.balance(seller).await.unwrap(), 70_000);

    let later = now + Duration::days(3);
    let expired = store.expired_grants(later).await.unwrap();
    assert_eq!(expired.len(), 1);
    assert_eq!(expired[0].remaining, 20_000);
    let entry = ledger
        .expire_grant(short.id, later)
        .await
        .unwrap()
        .unwrap();
    assert_eq!(entry.amount, -20_000);
    assert!(ledger.expire_grant(short.id, later).await.unwrap().is_none());
    assert_eq!(ledger.balance(seller).await.unwrap(), 50_000);
}

#[sqlx::test]
#[ignore = "requires DATABASE_URL with Postgres server"]
async fn job_lease_is_exclusive_until_released(pool: PgPool) {
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    let store = PgAdvertisingStore::new(pool);
    let now = Utc::now();
    let ttl = Duration::minutes(15);

    let first = store
        .try_acquire_job_lease("advertising:monthly-billing", now, ttl)
        .await
        .unwrap()
        .expect("free lease is taken");
    assert!(store
        .try_acquire_job_lease("advertising:monthly-billing", now, ttl)
        .await
        .unwrap()
        .is_none());
    let second = store
        .try_acquire_job_lease("advertising:monthly-billing", now + Duration::minutes(16), ttl)
        .await
        .unwrap()
        .expect("lapsed lease is taken over");
    assert_ne!(first, second);

    // The first holder lost the lease; its release must not free the takeover.
    store
        .release_job_lease("advertising:monthly-billing", first)
        .await
        .unwrap();
    assert!(store
        .try_acquire_job_lease("advertising:monthly-billing", now + Duration::minutes(17), ttl)
        .await
        .unwrap()
        .is_none());

    store
        .release_job_lease("advertising:monthly-billing", second)
        .await
        .unwrap();
    assert!(store
        .try_acquire_job_lease("advertising:monthly-billing", now, ttl)
        .await
        .unwrap()
        .is_some());
}
