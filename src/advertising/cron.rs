use std::fmt;
use std::sync::Arc;

use anyhow::{anyhow, Result};
use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::{error, info, warn};
use uuid::Uuid;

use crate::config::AdvertisingConfig;

use super::gateway::{ChargeOutcome, ChargeRequest, PaymentGateway};
use super::ledger::{CreditDraw, CreditLedger};
use super::models::{
    AdvertisingPayment, AdvertisingSubscription, GrantBalance, NewPayment, PaymentMethod,
    PaymentStatus,
};
use super::state::{SubscriptionEvent, SubscriptionStateMachine, TransitionOutcome};
use super::store::AdvertisingStore;

/// key: advertising-cron-job -> externally triggered batch jobs
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "kebab-case")]
pub enum CronJob {
    MonthlyBilling,
    ExpireBankTransfers,
    ExpireCredits,
    All,
}

impl CronJob {
    const CONCRETE: [CronJob; 3] = [
        CronJob::MonthlyBilling,
        CronJob::ExpireBankTransfers,
        CronJob::ExpireCredits,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            CronJob::MonthlyBilling => "monthly-billing",
            CronJob::ExpireBankTransfers => "expire-bank-transfers",
            CronJob::ExpireCredits => "expire-credits",
            CronJob::All => "all",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "monthly-billing" => Some(Self::MonthlyBilling),
            "expire-bank-transfers" => Some(Self::ExpireBankTransfers),
            "expire-credits" => Some(Self::ExpireCredits),
            "all" => Some(Self::All),
            _ => None,
        }
    }

    /// The concrete jobs this name runs, in execution order.
    pub fn expand(&self) -> Vec<CronJob> {
        match self {
            CronJob::All => Self::CONCRETE.to_vec(),
            job => vec![*job],
        }
    }

    fn lease_name(&self) -> String {
        format!("advertising:{}", self.as_str())
    }
}

impl fmt::Display for CronJob {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Business reasons a renewal could not be paid. These expire the subscription; they are
/// not job failures.
#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum BillingFailure {
    #[error("insufficient credit and no stored payment method")]
    NoPaymentMethod,
    #[error("charge declined: {0}")]
    Declined(String),
}

#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct RowFailure {
    pub id: Uuid,
    pub error: String,
}

/// key: advertising-job-report -> per-run summary returned to the trigger
#[derive(Clone, Debug, Serialize, PartialEq, Eq)]
pub struct JobReport {
    pub job: CronJob,
    pub selected: usize,
    pub succeeded: usize,
    pub skipped: usize,
    pub failures: Vec<RowFailure>,
}

impl JobReport {
    fn new(job: CronJob, selected: usize) -> Self {
        Self {
            job,
            selected,
            succeeded: 0,
            skipped: 0,
            failures: Vec::new(),
        }
    }

    fn record(&mut self, id: Uuid, outcome: Result<RowOutcome>) {
        match outcome {
            Ok(RowOutcome::Done) => self.succeeded += 1,
            Ok(RowOutcome::Skipped) => self.skipped += 1,
            Err(err) => {
                let message = format!("{err:#}");
                error!(job = %self.job, row = %id, error = %message, "advertising job row failed");
                self.failures.push(RowFailure { id, error: message });
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum CronRunError {
    #[error("job already running")]
    AlreadyRunning,
    #[error(transparent)]
    Failed(#[from] anyhow::Error),
}

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
enum RowOutcome {
    Done,
    Skipped,
}

enum Settlement {
    Covered { transaction_ref: Option<String> },
    Failed(BillingFailure),
}

/// key: billing-cron-orchestrator -> monthly billing and expiry sweeps
///
/// Takes no credentials: the trigger is authenticated before a job is ever started.
#[derive(Clone)]
pub struct BillingOrchestrator {
    store: Arc<dyn AdvertisingStore>,
    gateway: Arc<dyn PaymentGateway>,
    ledger: CreditLedger,
    machine: SubscriptionStateMachine,
    lease_ttl: Duration,
}

impl BillingOrchestrator {
    pub fn new(
        store: Arc<dyn AdvertisingStore>,
        gateway: Arc<dyn PaymentGateway>,
        config: &AdvertisingConfig,
    ) -> Self {
        Self {
            ledger: CreditLedger::new(store.clone()),
            machine: SubscriptionStateMachine::new(store.clone()),
            store,
            gateway,
            lease_ttl: Duration::seconds(config.job_lease_secs),
        }
    }

    /// Runs `job` (every concrete job for `all`) under its lease. Row failures end up in the
    /// reports; only failing to take a lease or to select a due set fails the run.
    pub async fn run(
        &self,
        job: CronJob,
        now: DateTime<Utc>,
    ) -> std::result::Result<Vec<JobReport>, CronRunError> {
        let jobs = job.expand();
        let mut held = Vec::with_capacity(jobs.len());
        for concrete in &jobs {
            match self
                .store
                .try_acquire_job_lease(&concrete.lease_name(), now, self.lease_ttl)
                .await
            {
                Ok(Some(holder)) => held.push((*concrete, holder)),
                Ok(None) => {
                    warn!(job = %concrete, "advertising job lease held elsewhere");
                    self.release(&held).await;
                    return Err(CronRunError::AlreadyRunning);
                }
                Err(err) => {
                    self.release(&held).await;
                    return Err(err.into());
                }
            }
        }

        let mut reports = Vec::with_capacity(held.len());
        let mut first_error = None;
        for (concrete, _) in &held {
            match self.run_job(*concrete, now).await {
                Ok(report) => {
                    info!(
                        job = %report.job,
                        selected = report.selected,
                        succeeded = report.succeeded,
                        skipped = report.skipped,
                        failed = report.failures.len(),
                        "advertising job finished"
                    );
                    reports.push(report);
                }
                Err(err) => {
                    error!(job = %concrete, ?err, "advertising job failed");
                    first_error.get_or_insert(err);
                }
            }
        }
        self.release(&held).await;

        match first_error {
            Some(err) => Err(err.into()),
            None => Ok(reports),
        }
    }

    async fn run_job(&self, job: CronJob, now: DateTime<Utc>) -> Result<JobReport> {
        match job {
            CronJob::MonthlyBilling => self.monthly_billing(now).await,
            CronJob::ExpireBankTransfers => self.expire_bank_transfers(now).await,
            CronJob::ExpireCredits => self.expire_credits(now).await,
            CronJob::All => Err(anyhow!("`all` is not a concrete job")),
        }
    }

    async fn release(&self, held: &[(CronJob, Uuid)]) {
        for (job, holder) in held {
            if let Err(err) = self.store.release_job_lease(&job.lease_name(), *holder).await {
                warn!(job = %job, ?err, "failed to release advertising job lease");
            }
        }
    }

    pub async fn monthly_billing(&self, now: DateTime<Utc>) -> Result<JobReport> {
        let due = self.store.due_subscriptions(now).await?;
        let mut report = JobReport::new(CronJob::MonthlyBilling, due.len());
        for subscription in due {
            let outcome = self.bill_subscription(&subscription, now).await;
            report.record(subscription.id, outcome);
        }
        Ok(report)
    }

    async fn bill_subscription(
        &self,
        subscription: &AdvertisingSubscription,
        now: DateTime<Utc>,
    ) -> Result<RowOutcome> {
        let price = subscription.monthly_price;
        let mut payment = NewPayment::new(
            subscription.id,
            price,
            PaymentMethod::Credit,
            PaymentStatus::Paid,
        );
        payment.id = renewal_payment_id(subscription);

        let draw = self
            .ledger
            .consume(subscription.seller_id, price, payment.id, now)
            .await?;
        let remainder = price - draw.drawn();

        let settlement = if remainder > 0 {
            match self.charge_remainder(subscription, payment.id, remainder).await {
                Ok(settlement) => settlement,
                Err(err) => {
                    self.put_back(&draw, now).await;
                    return Err(err.context("payment gateway error"));
                }
            }
        } else {
            Settlement::Covered {
                transaction_ref: None,
            }
        };

        if remainder > 0 {
            payment.payment_method = PaymentMethod::Card;
        }

        let event = match settlement {
            Settlement::Covered { transaction_ref } => {
                payment.credit_applied = draw.drawn();
                payment.transaction_ref = transaction_ref;
                SubscriptionEvent::Renewed {
                    payment: payment.clone(),
                }
            }
            Settlement::Failed(failure) => {
                self.ledger.restore(&draw, now).await?;
                info!(
                    subscription = %subscription.id,
                    seller = %subscription.seller_id,
                    reason = %failure,
                    "monthly renewal not paid"
                );
                payment.status = PaymentStatus::Failed;
                payment.failure_reason = Some(failure.to_string());
                SubscriptionEvent::RenewalFailed {
                    payment: payment.clone(),
                }
            }
        };
        let renewed = matches!(event, SubscriptionEvent::Renewed { .. });

        match self.machine.transition(subscription.id, event, now).await {
            Ok(TransitionOutcome::Applied { .. }) => Ok(RowOutcome::Done),
            Ok(TransitionOutcome::Rejected { reason, .. }) => {
                if renewed {
                    self.put_back(&draw, now).await;
                }
                match (renewed, payment.transaction_ref) {
                    (true, Some(transaction_ref)) => Err(anyhow!(
                        "charge {transaction_ref} approved for payment {} but renewal was rejected: {reason}",
                        payment.id
                    )),
                    _ => Ok(RowOutcome::Skipped),
                }
            }
            Err(err) => {
                if renewed {
                    self.put_back(&draw, now).await;
                }
                match (renewed, payment.transaction_ref) {
                    (true, Some(transaction_ref)) => Err(err.context(format!(
                        "charge {transaction_ref} approved for payment {} but renewal was not recorded",
                        payment.id
                    ))),
                    _ => Err(err),
                }
            }
        }
    }

    async fn charge_remainder(
        &self,
        subscription: &AdvertisingSubscription,
        payment_id: Uuid,
        amount: i64,
    ) -> Result<Settlement> {
        let Some(method) = self.gateway.stored_method(subscription.seller_id).await? else {
            return Ok(Settlement::Failed(BillingFailure::NoPaymentMethod));
        };
        let request = ChargeRequest {
            seller_id: subscription.seller_id,
            subscription_id: subscription.id,
            order_id: payment_id,
            amount,
            billing_key: method.billing_key,
            order_name: format!("{} advertising renewal", subscription.package_type.as_str()),
        };
        Ok(match self.gateway.charge(&request).await? {
            ChargeOutcome::Approved { transaction_ref } => Settlement::Covered {
                transaction_ref: Some(transaction_ref),
            },
            ChargeOutcome::Declined { reason } => {
                Settlement::Failed(BillingFailure::Declined(reason))
            }
        })
    }

    /// Best effort: a draw that cannot be put back is logged for manual reconciliation.
    async fn put_back(&self, draw: &CreditDraw, now: DateTime<Utc>) {
        if let Err(err) = self.ledger.restore(draw, now).await {
            error!(
                ?err,
                drawn = draw.drawn(),
                "failed to restore credit drawn for a renewal"
            );
        }
    }

    pub async fn expire_bank_transfers(&self, now: DateTime<Utc>) -> Result<JobReport> {
        let due = self.store.expired_bank_transfers(now).await?;
        let mut report = JobReport::new(CronJob::ExpireBankTransfers, due.len());
        for payment in due {
            let outcome = self.expire_bank_transfer(&payment, now).await;
            report.record(payment.id, outcome);
        }
        Ok(report)
    }

    async fn expire_bank_transfer(
        &self,
        payment: &AdvertisingPayment,
        now: DateTime<Utc>,
    ) -> Result<RowOutcome> {
        let outcome = self
            .machine
            .transition(
                payment.subscription_id,
                SubscriptionEvent::BankTransferExpired {
                    payment_id: payment.id,
                },
                now,
            )
            .await?;
        if outcome.is_applied() {
            return Ok(RowOutcome::Done);
        }

        // Subscription already left pending_bank_transfer; only the payment is stale.
        match self
            .store
            .resolve_payment(payment.id, PaymentStatus::Expired, now)
            .await?
        {
            Some(_) => Ok(RowOutcome::Done),
            None => Ok(RowOutcome::Skipped),
        }
    }

    pub async fn expire_credits(&self, now: DateTime<Utc>) -> Result<JobReport> {
        let due = self.store.expired_grants(now).await?;
        let mut report = JobReport::new(CronJob::ExpireCredits, due.len());
        for grant in due {
            let outcome = self.expire_grant(&grant, now).await;
            report.record(grant.grant_id, outcome);
        }
        Ok(report)
    }

    async fn expire_grant(&self, grant: &GrantBalance, now: DateTime<Utc>) -> Result<RowOutcome> {
        match self.ledger.expire_grant(grant.grant_id, now).await? {
            Some(entry) => {
                info!(
                    seller = %grant.seller_id,
                    grant = %grant.grant_id,
                    amount = entry.amount,
                    balance_after = entry.balance_after,
                    "credit grant expired"
                );
                Ok(RowOutcome::Done)
            }
            None => Ok(RowOutcome::Skipped),
        }
    }
}

/// Payment id (and gateway order id) for renewing the period that ends at
/// `current_period_end`. Stays the same across retries of that period, so the gateway
/// can deduplicate a charge whose outcome was lost.
pub fn renewal_payment_id(subscription: &AdvertisingSubscription) -> Uuid {
    let period_end = subscription
        .current_period_end
        .map(|end| end.timestamp_millis())
        .unwrap_or_default();
    Uuid::new_v5(&subscription.id, format!("renewal:{period_end}").as_bytes())
}
