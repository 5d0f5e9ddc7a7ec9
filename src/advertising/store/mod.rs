//! Storage boundary for the advertising engine.
//!
//! Every counter bump, ledger append and status change happens inside one call on this
//! trait, so implementations can make each of them atomic. Callers never read a counter,
//! add to it and write it back.

pub mod memory;
pub mod postgres;

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use super::models::{
    AdvertisingImpression, AdvertisingPayment, AdvertisingSubscription, ClickRecord,
    CreditTransaction, GrantBalance, NewCreditGrant, NewImpression, NewPayment, NewSubscription,
    PaymentStatus, SubscriptionStatus,
};

pub use memory::MemoryAdvertisingStore;
pub use postgres::PgAdvertisingStore;

/// key: advertising-transition-write -> conditional status change
///
/// Applied only while the subscription is still in `from` (and, when set, still ends its
/// period at `expected_period_end`). Everything in the write lands together or not at all.
#[derive(Clone, Debug)]
pub struct TransitionWrite {
    pub subscription_id: Uuid,
    pub from: SubscriptionStatus,
    pub to: SubscriptionStatus,
    pub expected_period_end: Option<DateTime<Utc>>,
    pub period: Option<(DateTime<Utc>, DateTime<Utc>)>,
    pub payment: Option<PaymentWrite>,
    pub at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub enum PaymentWrite {
    /// Insert a new payment row for the subscription.
    Insert(NewPayment),
    /// Resolve one specific payment; it must still be `pending`.
    Settle {
        payment_id: Uuid,
        to: PaymentStatus,
        transaction_ref: Option<String>,
    },
    /// Resolve the subscription's pending payment if there is one.
    ClosePending { to: PaymentStatus },
    /// Close any pending payment, then insert a new one.
    ReplacePending {
        close_as: PaymentStatus,
        insert: NewPayment,
    },
}

#[async_trait]
pub trait AdvertisingStore: Send + Sync {
    /// Creates the subscription in `pending_payment` together with its pending card payment.
    /// `None` if the listing already has a pending or active subscription.
    async fn insert_subscription(
        &self,
        new: NewSubscription,
        at: DateTime<Utc>,
    ) -> Result<Option<(AdvertisingSubscription, AdvertisingPayment)>>;
    async fn subscription(&self, id: Uuid) -> Result<Option<AdvertisingSubscription>>;
    async fn active_subscription_for_listing(
        &self,
        listing_id: Uuid,
    ) -> Result<Option<AdvertisingSubscription>>;
    /// Newest subscription for the listing that is pending or active.
    async fn list_seller_subscriptions(
        &self,
        seller_id: Uuid,
    ) -> Result<Vec<AdvertisingSubscription>>;
    /// Active subscriptions whose period ended at or before `now`.
    async fn due_subscriptions(&self, now: DateTime<Utc>) -> Result<Vec<AdvertisingSubscription>>;

    /// Inserts the impression and bumps `total_impressions` by one, returning the new total.
    async fn record_impression(&self, new: NewImpression) -> Result<(AdvertisingImpression, i64)>;
    /// Marks the newest unclicked impression (if any) and bumps `total_clicks` by one.
    async fn record_click(&self, subscription_id: Uuid, at: DateTime<Utc>) -> Result<ClickRecord>;

    /// Returns `None` when the guard did not match and nothing was written.
    async fn apply_transition(
        &self,
        write: TransitionWrite,
    ) -> Result<Option<AdvertisingSubscription>>;

    async fn payment(&self, id: Uuid) -> Result<Option<AdvertisingPayment>>;
    async fn pending_payment(&self, subscription_id: Uuid) -> Result<Option<AdvertisingPayment>>;
    async fn payments_for(&self, subscription_id: Uuid) -> Result<Vec<AdvertisingPayment>>;
    /// Pending -> `to`. `None` if the payment was no longer pending.
    async fn resolve_payment(
        &self,
        id: Uuid,
        to: PaymentStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<AdvertisingPayment>>;
    /// Pending bank-transfer payments whose `expires_at` is at or before `now`.
    async fn expired_bank_transfers(&self, now: DateTime<Utc>) -> Result<Vec<AdvertisingPayment>>;

    async fn grant_credit(&self, grant: NewCreditGrant, at: DateTime<Utc>)
        -> Result<CreditTransaction>;
    /// Sum of every ledger amount for the seller.
    async fn credit_balance(&self, seller_id: Uuid) -> Result<i64>;
    async fn credit_history(&self, seller_id: Uuid) -> Result<Vec<CreditTransaction>>;
    /// Unexpired grants with something left, in draw order.
    async fn open_grants(&self, seller_id: Uuid, now: DateTime<Utc>) -> Result<Vec<GrantBalance>>;
    /// Draws up to `max_amount` from open grants. One row per grant touched; empty if nothing
    /// could be drawn.
    async fn consume_credit(
        &self,
        seller_id: Uuid,
        max_amount: i64,
        payment_ref: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Vec<CreditTransaction>>;
    /// Appends a positive `refund` row for every consumption row given.
    async fn restore_credit(
        &self,
        consumed: &[CreditTransaction],
        at: DateTime<Utc>,
    ) -> Result<Vec<CreditTransaction>>;
    /// Grants whose `expires_at` is at or before `now` and that still have something left.
    async fn expired_grants(&self, now: DateTime<Utc>) -> Result<Vec<GrantBalance>>;
    /// Writes `-remaining` for the grant. `None` if nothing was left.
    async fn expire_grant(
        &self,
        grant_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<CreditTransaction>>;

    /// Takes the named lease unless someone else holds an unexpired one. Returns the
    /// holder token the lease was taken under.
    async fn try_acquire_job_lease(
        &self,
        job: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Option<Uuid>>;
    /// Drops the lease only while `holder` still owns it; a lease that lapsed and was
    /// taken over by another run is left alone.
    async fn release_job_lease(&self, job: &str, holder: Uuid) -> Result<()>;
}
