use std::collections::HashMap;
use std::sync::{Mutex, MutexGuard};

use anyhow::{anyhow, bail, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use uuid::Uuid;

use super::{AdvertisingStore, PaymentWrite, TransitionWrite};
use crate::advertising::directory::ListingDirectory;
use crate::advertising::ledger::{allocate, draw_order};
use crate::advertising::models::{
    AdvertisingImpression, AdvertisingPayment, AdvertisingSubscription, ClickRecord,
    CreditReason, CreditTransaction, GrantBalance, NewCreditGrant, NewImpression, NewPayment,
    NewSubscription, PaymentMethod, PaymentStatus, SubscriptionStatus,
};

/// key: advertising-memory-store -> single-process store
///
/// Every operation runs under one mutex, which is what makes counter bumps and ledger
/// appends atomic here. Also serves as a listing directory so a whole engine can run
/// without Postgres.
#[derive(Default)]
pub struct MemoryAdvertisingStore {
    state: Mutex<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    subscriptions: HashMap<Uuid, AdvertisingSubscription>,
    payments: Vec<AdvertisingPayment>,
    impressions: Vec<AdvertisingImpression>,
    credits: Vec<CreditTransaction>,
    leases: HashMap<String, (Uuid, DateTime<Utc>)>,
    listings: HashMap<Uuid, Uuid>,
}

impl MemoryAdvertisingStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> Result<MutexGuard<'_, MemoryState>> {
        self.state
            .lock()
            .map_err(|_| anyhow!("memory advertising store poisoned"))
    }

    pub fn register_listing(&self, listing_id: Uuid, seller_id: Uuid) -> Result<()> {
        self.lock()?.listings.insert(listing_id, seller_id);
        Ok(())
    }

    /// Inserts or replaces a subscription row as-is.
    pub fn put_subscription(&self, subscription: AdvertisingSubscription) -> Result<()> {
        self.lock()?
            .subscriptions
            .insert(subscription.id, subscription);
        Ok(())
    }

    pub fn put_payment(&self, payment: AdvertisingPayment) -> Result<()> {
        let mut state = self.lock()?;
        if payment.status == PaymentStatus::Pending
            && state.has_pending_payment(payment.subscription_id)
        {
            bail!("subscription already has a pending payment");
        }
        state.payments.push(payment);
        Ok(())
    }

    pub fn impressions_for(&self, subscription_id: Uuid) -> Result<Vec<AdvertisingImpression>> {
        Ok(self
            .lock()?
            .impressions
            .iter()
            .filter(|impression| impression.subscription_id == subscription_id)
            .cloned()
            .collect())
    }
}

impl MemoryState {
    fn has_pending_payment(&self, subscription_id: Uuid) -> bool {
        self.payments.iter().any(|payment| {
            payment.subscription_id == subscription_id && payment.status == PaymentStatus::Pending
        })
    }

    fn insert_payment(&mut self, new: NewPayment, at: DateTime<Utc>) -> Result<()> {
        if new.status == PaymentStatus::Pending && self.has_pending_payment(new.subscription_id) {
            bail!("subscription already has a pending payment");
        }
        self.payments.push(new.into_payment(at));
        Ok(())
    }

    fn close_pending(&mut self, subscription_id: Uuid, to: PaymentStatus, at: DateTime<Utc>) {
        for payment in self.payments.iter_mut() {
            if payment.subscription_id == subscription_id && payment.status == PaymentStatus::Pending
            {
                payment.status = to;
                payment.resolved_at = Some(at);
            }
        }
    }

    fn balance(&self, seller_id: Uuid) -> i64 {
        self.credits
            .iter()
            .filter(|entry| entry.seller_id == seller_id)
            .map(|entry| entry.amount)
            .sum()
    }

    fn grant_balances(&self) -> Vec<GrantBalance> {
        self.credits
            .iter()
            .filter(|entry| entry.grant_id.is_none() && entry.amount > 0)
            .map(|grant| {
                let drawn: i64 = self
                    .credits
                    .iter()
                    .filter(|entry| entry.grant_id == Some(grant.id))
                    .map(|entry| entry.amount)
                    .sum();
                GrantBalance {
                    grant_id: grant.id,
                    seller_id: grant.seller_id,
                    granted: grant.amount,
                    remaining: grant.amount + drawn,
                    expires_at: grant.expires_at,
                    created_at: grant.created_at,
                }
            })
            .collect()
    }

    fn append_credit(
        &mut self,
        seller_id: Uuid,
        grant_id: Option<Uuid>,
        amount: i64,
        reason: CreditReason,
        payment_ref: Option<Uuid>,
        expires_at: Option<DateTime<Utc>>,
        at: DateTime<Utc>,
    ) -> CreditTransaction {
        let entry = CreditTransaction {
            id: Uuid::new_v4(),
            seller_id,
            grant_id,
            amount,
            balance_after: self.balance(seller_id) + amount,
            reason,
            payment_ref,
            expires_at,
            created_at: at,
        };
        self.credits.push(entry.clone());
        entry
    }
}

#[async_trait]
impl AdvertisingStore for MemoryAdvertisingStore {
    async fn insert_subscription(
        &self,
        new: NewSubscription,
        at: DateTime<Utc>,
    ) -> Result<Option<(AdvertisingSubscription, AdvertisingPayment)>> {
        let mut state = self.lock()?;
        let taken = state
            .subscriptions
            .values()
            .any(|s| s.listing_id == new.listing_id && !s.status.is_terminal());
        if taken {
            return Ok(None);
        }

        let subscription = AdvertisingSubscription {
            id: Uuid::new_v4(),
            listing_id: new.listing_id,
            seller_id: new.seller_id,
            status: SubscriptionStatus::PendingPayment,
            package_type: new.package_type,
            monthly_price: new.monthly_price,
            total_impressions: 0,
            total_clicks: 0,
            current_period_start: None,
            current_period_end: None,
            created_at: at,
            updated_at: at,
        };
        let payment = NewPayment::new(
            subscription.id,
            subscription.monthly_price,
            PaymentMethod::Card,
            PaymentStatus::Pending,
        )
        .into_payment(at);
        state
            .subscriptions
            .insert(subscription.id, subscription.clone());
        state.payments.push(payment.clone());
        Ok(Some((subscription, payment)))
    }

    async fn subscription(&self, id: Uuid) -> Result<Option<AdvertisingSubscription>> {
        Ok(self.lock()?.subscriptions.get(&id).cloned())
    }

    async fn active_subscription_for_listing(
        &self,
        listing_id: Uuid,
    ) -> Result<Option<AdvertisingSubscription>> {
        Ok(self
            .lock()?
            .subscriptions
            .values()
            .find(|s| s.listing_id == listing_id && s.status == SubscriptionStatus::Active)
            .cloned())
    }

    async fn list_seller_subscriptions(
        &self,
        seller_id: Uuid,
    ) -> Result<Vec<AdvertisingSubscription>> {
        let mut rows: Vec<_> = self
            .lock()?
            .subscriptions
            .values()
            .filter(|s| s.seller_id == seller_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn due_subscriptions(&self, now: DateTime<Utc>) -> Result<Vec<AdvertisingSubscription>> {
        let mut rows: Vec<_> = self
            .lock()?
            .subscriptions
            .values()
            .filter(|s| s.is_due(now))
            .cloned()
            .collect();
        rows.sort_by_key(|s| s.current_period_end);
        Ok(rows)
    }

    async fn record_impression(&self, new: NewImpression) -> Result<(AdvertisingImpression, i64)> {
        let mut state = self.lock()?;
        let subscription = state
            .subscriptions
            .get_mut(&new.subscription_id)
            .ok_or_else(|| anyhow!("subscription {} not found", new.subscription_id))?;
        subscription.total_impressions += 1;
        let total = subscription.total_impressions;
        let impression = AdvertisingImpression {
            id: Uuid::new_v4(),
            subscription_id: new.subscription_id,
            listing_id: new.listing_id,
            category_id: new.category_id,
            position: new.position,
            page_number: new.page_number,
            clicked: false,
            clicked_at: None,
            created_at: Utc::now(),
        };
        state.impressions.push(impression.clone());
        Ok((impression, total))
    }

    async fn record_click(&self, subscription_id: Uuid, at: DateTime<Utc>) -> Result<ClickRecord> {
        let mut state = self.lock()?;
        if !state.subscriptions.contains_key(&subscription_id) {
            bail!("subscription {subscription_id} not found");
        }
        let impression_id = state
            .impressions
            .iter_mut()
            .rev()
            .find(|impression| impression.subscription_id == subscription_id && !impression.clicked)
            .map(|impression| {
                impression.clicked = true;
                impression.clicked_at = Some(at);
                impression.id
            });
        let subscription = state
            .subscriptions
            .get_mut(&subscription_id)
            .ok_or_else(|| anyhow!("subscription {subscription_id} not found"))?;
        subscription.total_clicks += 1;
        Ok(ClickRecord {
            impression_id,
            total_clicks: subscription.total_clicks,
            total_impressions: subscription.total_impressions,
        })
    }

    async fn apply_transition(
        &self,
        write: TransitionWrite,
    ) -> Result<Option<AdvertisingSubscription>> {
        let mut state = self.lock()?;
        let Some(current) = state.subscriptions.get(&write.subscription_id) else {
            return Ok(None);
        };
        if current.status != write.from {
            return Ok(None);
        }
        if let Some(expected) = write.expected_period_end {
            if current.current_period_end != Some(expected) {
                return Ok(None);
            }
        }

        match &write.payment {
            Some(PaymentWrite::Settle { payment_id, .. }) => {
                let settleable = state.payments.iter().any(|payment| {
                    payment.id == *payment_id
                        && payment.subscription_id == write.subscription_id
                        && payment.status == PaymentStatus::Pending
                });
                if !settleable {
                    return Ok(None);
                }
            }
            Some(PaymentWrite::Insert(new)) => {
                if new.status == PaymentStatus::Pending
                    && state.has_pending_payment(write.subscription_id)
                {
                    bail!("subscription already has a pending payment");
                }
            }
            _ => {}
        }

        match write.payment {
            Some(PaymentWrite::Insert(new)) => state.insert_payment(new, write.at)?,
            Some(PaymentWrite::Settle {
                payment_id,
                to,
                transaction_ref,
            }) => {
                if let Some(payment) = state.payments.iter_mut().find(|p| p.id == payment_id) {
                    payment.status = to;
                    payment.resolved_at = Some(write.at);
                    if transaction_ref.is_some() {
                        payment.transaction_ref = transaction_ref;
                    }
                }
            }
            Some(PaymentWrite::ClosePending { to }) => {
                state.close_pending(write.subscription_id, to, write.at)
            }
            Some(PaymentWrite::ReplacePending { close_as, insert }) => {
                state.close_pending(write.subscription_id, close_as, write.at);
                state.insert_payment(insert, write.at)?;
            }
            None => {}
        }

        let subscription = state
            .subscriptions
            .get_mut(&write.subscription_id)
            .ok_or_else(|| anyhow!("subscription {} vanished", write.subscription_id))?;
        subscription.status = write.to;
        if let Some((start, end)) = write.period {
            subscription.current_period_start = Some(start);
            subscription.current_period_end = Some(end);
        }
        subscription.updated_at = write.at;
        Ok(Some(subscription.clone()))
    }

    async fn payment(&self, id: Uuid) -> Result<Option<AdvertisingPayment>> {
        Ok(self.lock()?.payments.iter().find(|p| p.id == id).cloned())
    }

    async fn pending_payment(&self, subscription_id: Uuid) -> Result<Option<AdvertisingPayment>> {
        Ok(self
            .lock()?
            .payments
            .iter()
            .find(|p| p.subscription_id == subscription_id && p.status == PaymentStatus::Pending)
            .cloned())
    }

    async fn payments_for(&self, subscription_id: Uuid) -> Result<Vec<AdvertisingPayment>> {
        let mut rows: Vec<_> = self
            .lock()?
            .payments
            .iter()
            .filter(|p| p.subscription_id == subscription_id)
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(rows)
    }

    async fn resolve_payment(
        &self,
        id: Uuid,
        to: PaymentStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<AdvertisingPayment>> {
        let mut state = self.lock()?;
        let Some(payment) = state
            .payments
            .iter_mut()
            .find(|p| p.id == id && p.status == PaymentStatus::Pending)
        else {
            return Ok(None);
        };
        payment.status = to;
        payment.resolved_at = Some(at);
        Ok(Some(payment.clone()))
    }

    async fn expired_bank_transfers(&self, now: DateTime<Utc>) -> Result<Vec<AdvertisingPayment>> {
        Ok(self
            .lock()?
            .payments
            .iter()
            .filter(|p| {
                p.status == PaymentStatus::Pending
                    && p.payment_method == PaymentMethod::BankTransfer
                    && p.expires_at.map(|at| at <= now).unwrap_or(false)
            })
            .cloned()
            .collect())
    }

    async fn grant_credit(
        &self,
        grant: NewCreditGrant,
        at: DateTime<Utc>,
    ) -> Result<CreditTransaction> {
        let mut state = self.lock()?;
        Ok(state.append_credit(
            grant.seller_id,
            None,
            grant.amount,
            grant.reason,
            None,
            grant.expires_at,
            at,
        ))
    }

    async fn credit_balance(&self, seller_id: Uuid) -> Result<i64> {
        Ok(self.lock()?.balance(seller_id))
    }

    async fn credit_history(&self, seller_id: Uuid) -> Result<Vec<CreditTransaction>> {
        Ok(self
            .lock()?
            .credits
            .iter()
            .filter(|entry| entry.seller_id == seller_id)
            .cloned()
            .collect())
    }

    async fn open_grants(&self, seller_id: Uuid, now: DateTime<Utc>) -> Result<Vec<GrantBalance>> {
        let mut grants: Vec<_> = self
            .lock()?
            .grant_balances()
            .into_iter()
            .filter(|g| g.seller_id == seller_id && g.remaining > 0)
            .filter(|g| g.expires_at.map(|at| at > now).unwrap_or(true))
            .collect();
        grants.sort_by(draw_order);
        Ok(grants)
    }

    async fn consume_credit(
        &self,
        seller_id: Uuid,
        max_amount: i64,
        payment_ref: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Vec<CreditTransaction>> {
        let mut state = self.lock()?;
        let grants: Vec<_> = state
            .grant_balances()
            .into_iter()
            .filter(|g| g.seller_id == seller_id)
            .collect();
        let entries = allocate(&grants, max_amount, at)
            .into_iter()
            .map(|(grant_id, take)| {
                state.append_credit(
                    seller_id,
                    Some(grant_id),
                    -take,
                    CreditReason::AdvertisingPayment,
                    Some(payment_ref),
                    None,
                    at,
                )
            })
            .collect();
        Ok(entries)
    }

    async fn restore_credit(
        &self,
        consumed: &[CreditTransaction],
        at: DateTime<Utc>,
    ) -> Result<Vec<CreditTransaction>> {
        let mut state = self.lock()?;
        let entries = consumed
            .iter()
            .filter(|entry| entry.amount < 0)
            .map(|entry| {
                state.append_credit(
                    entry.seller_id,
                    entry.grant_id,
                    -entry.amount,
                    CreditReason::Refund,
                    entry.payment_ref,
                    None,
                    at,
                )
            })
            .collect();
        Ok(entries)
    }

    async fn expired_grants(&self, now: DateTime<Utc>) -> Result<Vec<GrantBalance>> {
        Ok(self
            .lock()?
            .grant_balances()
            .into_iter()
            .filter(|g| g.remaining > 0 && g.expires_at.map(|at| at <= now).unwrap_or(false))
            .collect())
    }

    async fn expire_grant(
        &self,
        grant_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<CreditTransaction>> {
        let mut state = self.lock()?;
        let Some(grant) = state
            .grant_balances()
            .into_iter()
            .find(|g| g.grant_id == grant_id)
        else {
            return Ok(None);
        };
        if grant.remaining <= 0 {
            return Ok(None);
        }
        Ok(Some(state.append_credit(
            grant.seller_id,
            Some(grant.grant_id),
            -grant.remaining,
            CreditReason::Expired,
            None,
            None,
            at,
        )))
    }

    async fn try_acquire_job_lease(
        &self,
        job: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Option<Uuid>> {
        let mut state = self.lock()?;
        if let Some((_, until)) = state.leases.get(job) {
            if *until > now {
                return Ok(None);
            }
        }
        let holder = Uuid::new_v4();
        state.leases.insert(job.to_string(), (holder, now + ttl));
        Ok(Some(holder))
    }

    async fn release_job_lease(&self, job: &str, holder: Uuid) -> Result<()> {
        let mut state = self.lock()?;
        if matches!(state.leases.get(job), Some((owner, _)) if *owner == holder) {
            state.leases.remove(job);
        }
        Ok(())
    }
}

#[async_trait]
impl ListingDirectory for MemoryAdvertisingStore {
    async fn listing_owner(&self, listing_id: Uuid) -> Result<Option<Uuid>> {
        Ok(self.lock()?.listings.get(&listing_id).copied())
    }
}
