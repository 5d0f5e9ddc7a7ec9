use std::cmp::Ordering;
use std::sync::Arc;

use anyhow::{bail, Result};
use chrono::{DateTime, Duration, Utc};
use tracing::{debug, info};
use uuid::Uuid;

use super::models::{CreditReason, CreditTransaction, GrantBalance, NewCreditGrant};
use super::store::AdvertisingStore;

/// key: credit-ledger -> prepaid balance movements
#[derive(Clone)]
pub struct CreditLedger {
    store: Arc<dyn AdvertisingStore>,
}

/// Credit drawn for one charge attempt, kept so it can be put back if the charge fails.
#[derive(Clone, Debug, Default)]
pub struct CreditDraw {
    pub entries: Vec<CreditTransaction>,
}

impl CreditDraw {
    pub fn drawn(&self) -> i64 {
        self.entries.iter().map(|entry| -entry.amount).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl CreditLedger {
    pub fn new(store: Arc<dyn AdvertisingStore>) -> Self {
        Self { store }
    }

    pub async fn grant(
        &self,
        seller_id: Uuid,
        amount: i64,
        reason: CreditReason,
        valid_for: Option<Duration>,
        now: DateTime<Utc>,
    ) -> Result<CreditTransaction> {
        if amount <= 0 {
            bail!("credit grant amount must be positive");
        }
        if !reason.is_grant() {
            bail!("`{}` is not a grant reason", reason.as_str());
        }
        let expires_at = valid_for.and_then(|window| now.checked_add_signed(window));
        let entry = self
            .store
            .grant_credit(
                NewCreditGrant {
                    seller_id,
                    amount,
                    reason,
                    expires_at,
                },
                now,
            )
            .await?;
        info!(
            seller = %seller_id,
            grant = %entry.id,
            amount,
            balance_after = entry.balance_after,
            "credit granted"
        );
        Ok(entry)
    }

    pub async fn balance(&self, seller_id: Uuid) -> Result<i64> {
        self.store.credit_balance(seller_id).await
    }

    /// What a charge made right now could draw.
    pub async fn spendable(&self, seller_id: Uuid, now: DateTime<Utc>) -> Result<i64> {
        let grants = self.store.open_grants(seller_id, now).await?;
        Ok(grants.iter().map(|grant| grant.remaining).sum())
    }

    pub async fn history(&self, seller_id: Uuid) -> Result<Vec<CreditTransaction>> {
        self.store.credit_history(seller_id).await
    }

    /// Draws up to `amount`, never more than what the seller has left.
    pub async fn consume(
        &self,
        seller_id: Uuid,
        amount: i64,
        payment_ref: Uuid,
        now: DateTime<Utc>,
    ) -> Result<CreditDraw> {
        if amount <= 0 {
            return Ok(CreditDraw::default());
        }
        let entries = self
            .store
            .consume_credit(seller_id, amount, payment_ref, now)
            .await?;
        let draw = CreditDraw { entries };
        debug!(
            seller = %seller_id,
            payment = %payment_ref,
            requested = amount,
            drawn = draw.drawn(),
            "credit drawn"
        );
        Ok(draw)
    }

    pub async fn restore(&self, draw: &CreditDraw, now: DateTime<Utc>) -> Result<()> {
        if draw.is_empty() {
            return Ok(());
        }
        let restored = self.store.restore_credit(&draw.entries, now).await?;
        info!(
            entries = restored.len(),
            amount = draw.drawn(),
            "credit restored after failed charge"
        );
        Ok(())
    }

    pub async fn expire_grant(
        &self,
        grant_id: Uuid,
        now: DateTime<Utc>,
    ) -> Result<Option<CreditTransaction>> {
        self.store.expire_grant(grant_id, now).await
    }
}

/// Draw order: soonest expiry first, grants without expiry last, then oldest first.
pub fn draw_order(a: &GrantBalance, b: &GrantBalance) -> Ordering {
    match (a.expires_at, b.expires_at) {
        (Some(left), Some(right)) => left.cmp(&right),
        (Some(_), None) => Ordering::Less,
        (None, Some(_)) => Ordering::Greater,
        (None, None) => Ordering::Equal,
    }
    .then(a.created_at.cmp(&b.created_at))
}

/// Splits `amount` across open grants in draw order. Never takes more than a grant has
/// left, so the total drawn is capped at the sum of `remaining`.
pub fn allocate(grants: &[GrantBalance], amount: i64, now: DateTime<Utc>) -> Vec<(Uuid, i64)> {
    let mut open: Vec<&GrantBalance> = grants
        .iter()
        .filter(|grant| grant.remaining > 0)
        .filter(|grant| grant.expires_at.map(|at| at > now).unwrap_or(true))
        .collect();
    open.sort_by(|a, b| draw_order(a, b));

    let mut left = amount.max(0);
    let mut takes = Vec::new();
    for grant in open {
        if left == 0 {
            break;
        }
        let take = grant.remaining.min(left);
        takes.push((grant.grant_id, take));
        left -= take;
    }
    takes
}
