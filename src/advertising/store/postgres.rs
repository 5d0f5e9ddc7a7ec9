use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use sqlx::{PgConnection, PgPool};
use uuid::Uuid;

use super::{AdvertisingStore, PaymentWrite, TransitionWrite};
use crate::advertising::ledger::allocate;
use crate::advertising::models::{
    AdvertisingImpression, AdvertisingPayment, AdvertisingSubscription, ClickRecord, CreditReason,
    CreditRow, CreditTransaction, GrantBalance, ImpressionRow, NewCreditGrant, NewImpression,
    NewPayment, NewSubscription, PaymentMethod, PaymentRow, PaymentStatus, SubscriptionRow,
    SubscriptionStatus,
};

/// Per-grant remaining amounts. `SUM(bigint)` is numeric in Postgres, hence the casts.
const GRANT_BALANCES: &str = r#"
    SELECT
        g.id AS grant_id,
        g.seller_id,
        g.amount AS granted,
        (g.amount + COALESCE(
            (SELECT SUM(c.amount) FROM credit_transactions c WHERE c.grant_id = g.id),
            0
        ))::BIGINT AS remaining,
        g.expires_at,
        g.created_at
    FROM credit_transactions g
    WHERE g.grant_id IS NULL AND g.amount > 0
"#;

/// key: advertising-pg-store -> postgres storage boundary
#[derive(Clone)]
pub struct PgAdvertisingStore {
    pool: PgPool,
}

impl PgAdvertisingStore {
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }
}

async fn insert_payment(
    conn: &mut PgConnection,
    new: NewPayment,
    at: DateTime<Utc>,
) -> Result<AdvertisingPayment> {
    let payment = new.into_payment(at);
    sqlx::query(
        r#"
        INSERT INTO advertising_payments (
            id, subscription_id, amount, supply_amount, vat_amount, credit_applied,
            payment_method, status, depositor_name, depositor_bank, failure_reason,
            transaction_ref, expires_at, resolved_at, created_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12, $13, $14, $15)
        "#,
    )
    .bind(payment.id)
    .bind(payment.subscription_id)
    .bind(payment.amount)
    .bind(payment.supply_amount)
    .bind(payment.vat_amount)
    .bind(payment.credit_applied)
    .bind(payment.payment_method.as_str())
    .bind(payment.status.as_str())
    .bind(&payment.depositor_name)
    .bind(&payment.depositor_bank)
    .bind(&payment.failure_reason)
    .bind(&payment.transaction_ref)
    .bind(payment.expires_at)
    .bind(payment.resolved_at)
    .bind(payment.created_at)
    .execute(&mut *conn)
    .await?;
    Ok(payment)
}

async fn close_pending(
    conn: &mut PgConnection,
    subscription_id: Uuid,
    to: PaymentStatus,
    at: DateTime<Utc>,
) -> Result<()> {
    sqlx::query(
        "UPDATE advertising_payments SET status = $2, resolved_at = $3 WHERE subscription_id = $1 AND status = 'pending'",
    )
    .bind(subscription_id)
    .bind(to.as_str())
    .bind(at)
    .execute(&mut *conn)
    .await?;
    Ok(())
}

/// Serialises every ledger write for one seller until the transaction ends.
async fn lock_seller(conn: &mut PgConnection, seller_id: Uuid) -> Result<()> {
    sqlx::query("SELECT pg_advisory_xact_lock(hashtext($1::text))")
        .bind(seller_id)
        .execute(&mut *conn)
        .await?;
    Ok(())
}

async fn seller_balance(conn: &mut PgConnection, seller_id: Uuid) -> Result<i64> {
    let balance: i64 = sqlx::query_scalar(
        "SELECT COALESCE(SUM(amount), 0)::BIGINT FROM credit_transactions WHERE seller_id = $1",
    )
    .bind(seller_id)
    .fetch_one(&mut *conn)
    .await?;
    Ok(balance)
}

#[allow(clippy::too_many_arguments)]
async fn append_credit(
    conn: &mut PgConnection,
    seller_id: Uuid,
    grant_id: Option<Uuid>,
    amount: i64,
    reason: CreditReason,
    payment_ref: Option<Uuid>,
    expires_at: Option<DateTime<Utc>>,
    at: DateTime<Utc>,
) -> Result<CreditTransaction> {
    let balance_after = seller_balance(conn, seller_id).await? + amount;
    let row = sqlx::query_as::<_, CreditRow>(
        r#"
        INSERT INTO credit_transactions (
            id, seller_id, grant_id, amount, balance_after, reason, payment_ref, expires_at, created_at
        ) VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
        RETURNING *
        "#,
    )
    .bind(Uuid::new_v4())
    .bind(seller_id)
    .bind(grant_id)
    .bind(amount)
    .bind(balance_after)
    .bind(reason.as_str())
    .bind(payment_ref)
    .bind(expires_at)
    .bind(at)
    .fetch_one(&mut *conn)
    .await?;
    CreditTransaction::try_from(row)
}

fn subscriptions(rows: Vec<SubscriptionRow>) -> Result<Vec<AdvertisingSubscription>> {
    rows.into_iter().map(AdvertisingSubscription::try_from).collect()
}

fn payments(rows: Vec<PaymentRow>) -> Result<Vec<AdvertisingPayment>> {
    rows.into_iter().map(AdvertisingPayment::try_from).collect()
}

#[async_trait]
impl AdvertisingStore for PgAdvertisingStore {
    async fn insert_subscription(
        &self,
        new: NewSubscription,
        at: DateTime<Utc>,
    ) -> Result<Option<(AdvertisingSubscription, AdvertisingPayment)>> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            INSERT INTO advertising_subscriptions (
                id, listing_id, seller_id, status, package_type, monthly_price, created_at, updated_at
            ) VALUES ($1, $2, $3, $4, $5, $6, $7, $7)
            ON CONFLICT (listing_id)
                WHERE status IN ('pending_payment', 'pending_bank_transfer', 'active')
                DO NOTHING
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new.listing_id)
        .bind(new.seller_id)
        .bind(SubscriptionStatus::PendingPayment.as_str())
        .bind(new.package_type.as_str())
        .bind(new.monthly_price)
        .bind(at)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };
        let subscription = AdvertisingSubscription::try_from(row)?;
        let payment = insert_payment(
            &mut tx,
            NewPayment::new(
                subscription.id,
                subscription.monthly_price,
                PaymentMethod::Card,
                PaymentStatus::Pending,
            ),
            at,
        )
        .await?;
        tx.commit().await?;
        Ok(Some((subscription, payment)))
    }

    async fn subscription(&self, id: Uuid) -> Result<Option<AdvertisingSubscription>> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            "SELECT * FROM advertising_subscriptions WHERE id = $1",
        )
        .bind(id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(AdvertisingSubscription::try_from).transpose()
    }

    async fn active_subscription_for_listing(
        &self,
        listing_id: Uuid,
    ) -> Result<Option<AdvertisingSubscription>> {
        let row = sqlx::query_as::<_, SubscriptionRow>(
            "SELECT * FROM advertising_subscriptions WHERE listing_id = $1 AND status = 'active' LIMIT 1",
        )
        .bind(listing_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(AdvertisingSubscription::try_from).transpose()
    }

    async fn list_seller_subscriptions(
        &self,
        seller_id: Uuid,
    ) -> Result<Vec<AdvertisingSubscription>> {
        let rows = sqlx::query_as::<_, SubscriptionRow>(
            "SELECT * FROM advertising_subscriptions WHERE seller_id = $1 ORDER BY created_at DESC",
        )
        .bind(seller_id)
        .fetch_all(&self.pool)
        .await?;
        subscriptions(rows)
    }

    async fn due_subscriptions(&self, now: DateTime<Utc>) -> Result<Vec<AdvertisingSubscription>> {
        let rows = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            SELECT * FROM advertising_subscriptions
            WHERE status = 'active' AND current_period_end <= $1
            ORDER BY current_period_end ASC
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        subscriptions(rows)
    }

    async fn record_impression(&self, new: NewImpression) -> Result<(AdvertisingImpression, i64)> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, ImpressionRow>(
            r#"
            INSERT INTO advertising_impressions (
                id, subscription_id, listing_id, category_id, position, page_number
            ) VALUES ($1, $2, $3, $4, $5, $6)
            RETURNING *
            "#,
        )
        .bind(Uuid::new_v4())
        .bind(new.subscription_id)
        .bind(new.listing_id)
        .bind(new.category_id)
        .bind(new.position)
        .bind(new.page_number)
        .fetch_one(&mut *tx)
        .await?;

        let total: i64 = sqlx::query_scalar(
            r#"
            UPDATE advertising_subscriptions
            SET total_impressions = total_impressions + 1, updated_at = NOW()
            WHERE id = $1
            RETURNING total_impressions
            "#,
        )
        .bind(new.subscription_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok((row.into(), total))
    }

    async fn record_click(&self, subscription_id: Uuid, at: DateTime<Utc>) -> Result<ClickRecord> {
        let mut tx = self.pool.begin().await?;
        let impression_id: Option<Uuid> = sqlx::query_scalar(
            r#"
            UPDATE advertising_impressions
            SET clicked = TRUE, clicked_at = $2
            WHERE id = (
                SELECT id FROM advertising_impressions
                WHERE subscription_id = $1 AND clicked = FALSE
                ORDER BY created_at DESC
                LIMIT 1
                FOR UPDATE SKIP LOCKED
            )
            RETURNING id
            "#,
        )
        .bind(subscription_id)
        .bind(at)
        .fetch_optional(&mut *tx)
        .await?;

        let (total_clicks, total_impressions): (i64, i64) = sqlx::query_as(
            r#"
            UPDATE advertising_subscriptions
            SET total_clicks = total_clicks + 1, updated_at = NOW()
            WHERE id = $1
            RETURNING total_clicks, total_impressions
            "#,
        )
        .bind(subscription_id)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(ClickRecord {
            impression_id,
            total_clicks,
            total_impressions,
        })
    }

    async fn apply_transition(
        &self,
        write: TransitionWrite,
    ) -> Result<Option<AdvertisingSubscription>> {
        let mut tx = self.pool.begin().await?;
        let row = sqlx::query_as::<_, SubscriptionRow>(
            r#"
            UPDATE advertising_subscriptions
            SET status = $2,
                current_period_start = COALESCE($4, current_period_start),
                current_period_end = COALESCE($5, current_period_end),
                updated_at = $6
            WHERE id = $1
              AND status = $3
              AND ($7::timestamptz IS NULL OR current_period_end = $7)
            RETURNING *
            "#,
        )
        .bind(write.subscription_id)
        .bind(write.to.as_str())
        .bind(write.from.as_str())
        .bind(write.period.map(|(start, _)| start))
        .bind(write.period.map(|(_, end)| end))
        .bind(write.at)
        .bind(write.expected_period_end)
        .fetch_optional(&mut *tx)
        .await?;

        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(None);
        };

        match write.payment {
            Some(PaymentWrite::Insert(new)) => {
                insert_payment(&mut tx, new, write.at).await?;
            }
            Some(PaymentWrite::Settle {
                payment_id,
                to,
                transaction_ref,
            }) => {
                let settled: Option<Uuid> = sqlx::query_scalar(
                    r#"
                    UPDATE advertising_payments
                    SET status = $3,
                        transaction_ref = COALESCE($4, transaction_ref),
                        resolved_at = $5
                    WHERE id = $1 AND subscription_id = $2 AND status = 'pending'
                    RETURNING id
                    "#,
                )
                .bind(payment_id)
                .bind(write.subscription_id)
                .bind(to.as_str())
                .bind(transaction_ref)
                .bind(write.at)
                .fetch_optional(&mut *tx)
                .await?;
                if settled.is_none() {
                    tx.rollback().await?;
                    return Ok(None);
                }
            }
            Some(PaymentWrite::ClosePending { to }) => {
                close_pending(&mut tx, write.subscription_id, to, write.at).await?;
            }
            Some(PaymentWrite::ReplacePending { close_as, insert }) => {
                close_pending(&mut tx, write.subscription_id, close_as, write.at).await?;
                insert_payment(&mut tx, insert, write.at).await?;
            }
            None => {}
        }

        tx.commit().await?;
        Ok(Some(AdvertisingSubscription::try_from(row)?))
    }

    async fn payment(&self, id: Uuid) -> Result<Option<AdvertisingPayment>> {
        let row =
            sqlx::query_as::<_, PaymentRow>("SELECT * FROM advertising_payments WHERE id = $1")
                .bind(id)
                .fetch_optional(&self.pool)
                .await?;
        row.map(AdvertisingPayment::try_from).transpose()
    }

    async fn pending_payment(&self, subscription_id: Uuid) -> Result<Option<AdvertisingPayment>> {
        let row = sqlx::query_as::<_, PaymentRow>(
            "SELECT * FROM advertising_payments WHERE subscription_id = $1 AND status = 'pending'",
        )
        .bind(subscription_id)
        .fetch_optional(&self.pool)
        .await?;
        row.map(AdvertisingPayment::try_from).transpose()
    }

    async fn payments_for(&self, subscription_id: Uuid) -> Result<Vec<AdvertisingPayment>> {
        let rows = sqlx::query_as::<_, PaymentRow>(
            "SELECT * FROM advertising_payments WHERE subscription_id = $1 ORDER BY created_at DESC",
        )
        .bind(subscription_id)
        .fetch_all(&self.pool)
        .await?;
        payments(rows)
    }

    async fn resolve_payment(
        &self,
        id: Uuid,
        to: PaymentStatus,
        at: DateTime<Utc>,
    ) -> Result<Option<AdvertisingPayment>> {
        let row = sqlx::query_as::<_, PaymentRow>(
            r#"
            UPDATE advertising_payments
            SET status = $2, resolved_at = $3
            WHERE id = $1 AND status = 'pending'
            RETURNING *
            "#,
        )
        .bind(id)
        .bind(to.as_str())
        .bind(at)
        .fetch_optional(&self.pool)
        .await?;
        row.map(AdvertisingPayment::try_from).transpose()
    }

    async fn expired_bank_transfers(&self, now: DateTime<Utc>) -> Result<Vec<AdvertisingPayment>> {
        let rows = sqlx::query_as::<_, PaymentRow>(
            r#"
            SELECT * FROM advertising_payments
            WHERE status = 'pending'
              AND payment_method = 'bank_transfer'
              AND expires_at <= $1
            ORDER BY expires_at ASC
            "#,
        )
        .bind(now)
        .fetch_all(&self.pool)
        .await?;
        payments(rows)
    }

    async fn grant_credit(
        &self,
        grant: NewCreditGrant,
        at: DateTime<Utc>,
    ) -> Result<CreditTransaction> {
        let mut tx = self.pool.begin().await?;
        lock_seller(&mut tx, grant.seller_id).await?;
        let entry = append_credit(
            &mut tx,
            grant.seller_id,
            None,
            grant.amount,
            grant.reason,
            None,
            grant.expires_at,
            at,
        )
        .await?;
        tx.commit().await?;
        Ok(entry)
    }

    async fn credit_balance(&self, seller_id: Uuid) -> Result<i64> {
        let mut conn = self.pool.acquire().await?;
        seller_balance(&mut conn, seller_id).await
    }

    async fn credit_history(&self, seller_id: Uuid) -> Result<Vec<CreditTransaction>> {
        let rows = sqlx::query_as::<_, CreditRow>(
            "SELECT * FROM credit_transactions WHERE seller_id = $1 ORDER BY created_at ASC",
        )
        .bind(seller_id)
        .fetch_all(&self.pool)
        .await?;
        rows.into_iter().map(CreditTransaction::try_from).collect()
    }

    async fn open_grants(&self, seller_id: Uuid, now: DateTime<Utc>) -> Result<Vec<GrantBalance>> {
        let query = format!(
            r#"
            SELECT * FROM ({GRANT_BALANCES}) grants
            WHERE seller_id = $1
              AND remaining > 0
              AND (expires_at IS NULL OR expires_at > $2)
            ORDER BY expires_at ASC NULLS LAST, created_at ASC
            "#
        );
        let grants = sqlx::query_as::<_, GrantBalance>(&query)
            .bind(seller_id)
            .bind(now)
            .fetch_all(&self.pool)
            .await?;
        Ok(grants)
    }

    async fn consume_credit(
        &self,
        seller_id: Uuid,
        max_amount: i64,
        payment_ref: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Vec<CreditTransaction>> {
        let mut tx = self.pool.begin().await?;
        lock_seller(&mut tx, seller_id).await?;

        let query = format!("SELECT * FROM ({GRANT_BALANCES}) grants WHERE seller_id = $1");
        let grants = sqlx::query_as::<_, GrantBalance>(&query)
            .bind(seller_id)
            .fetch_all(&mut *tx)
            .await?;

        let mut entries = Vec::new();
        for (grant_id, take) in allocate(&grants, max_amount, at) {
            let entry = append_credit(
                &mut tx,
                seller_id,
                Some(grant_id),
                -take,
                CreditReason::AdvertisingPayment,
                Some(payment_ref),
                None,
                at,
            )
            .await?;
            entries.push(entry);
        }

        tx.commit().await?;
        Ok(entries)
    }

    async fn restore_credit(
        &self,
        consumed: &[CreditTransaction],
        at: DateTime<Utc>,
    ) -> Result<Vec<CreditTransaction>> {
        let mut tx = self.pool.begin().await?;
        let mut restored = Vec::new();
        for entry in consumed.iter().filter(|entry| entry.amount < 0) {
            lock_seller(&mut tx, entry.seller_id).await?;
            let refund = append_credit(
                &mut tx,
                entry.seller_id,
                entry.grant_id,
                -entry.amount,
                CreditReason::Refund,
                entry.payment_ref,
                None,
                at,
            )
            .await?;
            restored.push(refund);
        }
        tx.commit().await?;
        Ok(restored)
    }

    async fn expired_grants(&self, now: DateTime<Utc>) -> Result<Vec<GrantBalance>> {
        let query = format!(
            r#"
            SELECT * FROM ({GRANT_BALANCES}) grants
            WHERE remaining > 0 AND expires_at IS NOT NULL AND expires_at <= $1
            ORDER BY expires_at ASC
            "#
        );
        let grants = sqlx::query_as::<_, GrantBalance>(&query)
            .bind(now)
            .fetch_all(&self.pool)
            .await?;
        Ok(grants)
    }

    async fn expire_grant(
        &self,
        grant_id: Uuid,
        at: DateTime<Utc>,
    ) -> Result<Option<CreditTransaction>> {
        let mut tx = self.pool.begin().await?;
        let seller_id: Option<Uuid> = sqlx::query_scalar(
            "SELECT seller_id FROM credit_transactions WHERE id = $1 AND grant_id IS NULL",
        )
        .bind(grant_id)
        .fetch_optional(&mut *tx)
        .await?;
        let seller_id = seller_id.ok_or_else(|| anyhow!("credit grant {grant_id} not found"))?;
        lock_seller(&mut tx, seller_id).await?;

        let query = format!("SELECT * FROM ({GRANT_BALANCES}) grants WHERE grant_id = $1");
        let grant = sqlx::query_as::<_, GrantBalance>(&query)
            .bind(grant_id)
            .fetch_optional(&mut *tx)
            .await?;
        let Some(grant) = grant.filter(|grant| grant.remaining > 0) else {
            tx.rollback().await?;
            return Ok(None);
        };

        let entry = append_credit(
            &mut tx,
            seller_id,
            Some(grant_id),
            -grant.remaining,
            CreditReason::Expired,
            None,
            None,
            at,
        )
        .await?;
        tx.commit().await?;
        Ok(Some(entry))
    }

    async fn try_acquire_job_lease(
        &self,
        job: &str,
        now: DateTime<Utc>,
        ttl: Duration,
    ) -> Result<Option<Uuid>> {
        let holder: Option<Uuid> = sqlx::query_scalar(
            r#"
            INSERT INTO advertising_job_leases (job, holder, locked_until, acquired_at)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (job) DO UPDATE
            SET holder = EXCLUDED.holder,
                locked_until = EXCLUDED.locked_until,
                acquired_at = EXCLUDED.acquired_at
            WHERE advertising_job_leases.locked_until <= $4
            RETURNING holder
            "#,
        )
        .bind(job)
        .bind(Uuid::new_v4())
        .bind(now + ttl)
        .bind(now)
        .fetch_optional(&self.pool)
        .await?;
        Ok(holder)
    }

    async fn release_job_lease(&self, job: &str, holder: Uuid) -> Result<()> {
        sqlx::query("DELETE FROM advertising_job_leases WHERE job = $1 AND holder = $2")
            .bind(job)
            .bind(holder)
            .execute(&self.pool)
            .await?;
        Ok(())
    }
}
