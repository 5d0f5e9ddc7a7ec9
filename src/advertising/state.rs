use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Duration, Months, Utc};
use tracing::{info, warn};
use uuid::Uuid;

use super::models::{
    AdvertisingSubscription, NewPayment, PaymentMethod, PaymentStatus, SubscriptionStatus,
};
use super::store::{AdvertisingStore, PaymentWrite, TransitionWrite};

/// key: subscription-events -> inputs to the subscription state machine
#[derive(Clone, Debug)]
pub enum SubscriptionEvent {
    /// Card/wallet payment for the initial purchase cleared.
    PaymentConfirmed { transaction_ref: Option<String> },
    /// Seller switched the pending purchase to an offline bank transfer.
    BankTransferSelected {
        depositor_name: String,
        depositor_bank: Option<String>,
        window: Duration,
    },
    /// Admin saw the deposit arrive.
    DepositConfirmed { transaction_ref: Option<String> },
    /// The bank-transfer payment lapsed without a deposit.
    BankTransferExpired { payment_id: Uuid },
    /// Monthly charge succeeded.
    Renewed { payment: NewPayment },
    /// Monthly charge failed.
    RenewalFailed { payment: NewPayment },
    /// Explicit seller or admin cancellation.
    Cancelled,
}

impl SubscriptionEvent {
    pub fn name(&self) -> &'static str {
        match self {
            SubscriptionEvent::PaymentConfirmed { .. } => "payment_confirmed",
            SubscriptionEvent::BankTransferSelected { .. } => "bank_transfer_selected",
            SubscriptionEvent::DepositConfirmed { .. } => "deposit_confirmed",
            SubscriptionEvent::BankTransferExpired { .. } => "bank_transfer_expired",
            SubscriptionEvent::Renewed { .. } => "renewed",
            SubscriptionEvent::RenewalFailed { .. } => "renewal_failed",
            SubscriptionEvent::Cancelled => "cancelled",
        }
    }
}

/// The transition table. `None` means the event is not valid from `from`.
pub fn next_status(from: SubscriptionStatus, event: &SubscriptionEvent) -> Option<SubscriptionStatus> {
    use SubscriptionEvent as E;
    use SubscriptionStatus as S;

    match (from, event) {
        (S::PendingPayment, E::PaymentConfirmed { .. }) => Some(S::Active),
        (S::PendingPayment, E::BankTransferSelected { .. }) => Some(S::PendingBankTransfer),
        (S::PendingBankTransfer, E::DepositConfirmed { .. }) => Some(S::Active),
        (S::PendingBankTransfer, E::BankTransferExpired { .. }) => Some(S::Cancelled),
        (S::Active, E::Renewed { .. }) => Some(S::Active),
        (S::Active, E::RenewalFailed { .. }) => Some(S::Expired),
        (S::PendingPayment | S::PendingBankTransfer | S::Active, E::Cancelled) => {
            Some(S::Cancelled)
        }
        _ => None,
    }
}

/// One calendar month after `start`, clamped to the end of shorter months.
pub fn add_one_month(start: DateTime<Utc>) -> DateTime<Utc> {
    start.checked_add_months(Months::new(1)).unwrap_or(start)
}

#[derive(Clone, Debug)]
pub enum TransitionOutcome {
    Applied {
        subscription: AdvertisingSubscription,
        from: SubscriptionStatus,
    },
    Rejected {
        subscription_id: Uuid,
        current: Option<SubscriptionStatus>,
        event: &'static str,
        reason: String,
    },
}

impl TransitionOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, TransitionOutcome::Applied { .. })
    }

    pub fn subscription(&self) -> Option<&AdvertisingSubscription> {
        match self {
            TransitionOutcome::Applied { subscription, .. } => Some(subscription),
            TransitionOutcome::Rejected { .. } => None,
        }
    }
}

/// key: subscription-state-machine -> owns every status change
#[derive(Clone)]
pub struct SubscriptionStateMachine {
    store: Arc<dyn AdvertisingStore>,
}

impl SubscriptionStateMachine {
    pub fn new(store: Arc<dyn AdvertisingStore>) -> Self {
        Self { store }
    }

    /// Applies `event` if the subscription is in a state that accepts it. Invalid events,
    /// and events that lose a race with another writer, come back as `Rejected` with
    /// nothing written.
    pub async fn transition(
        &self,
        subscription_id: Uuid,
        event: SubscriptionEvent,
        now: DateTime<Utc>,
    ) -> Result<TransitionOutcome> {
        let event_name = event.name();
        let Some(subscription) = self.store.subscription(subscription_id).await? else {
            return Ok(self.reject(subscription_id, None, event_name, "subscription not found"));
        };
        let from = subscription.status;

        let Some(to) = next_status(from, &event) else {
            return Ok(self.reject(
                subscription_id,
                Some(from),
                event_name,
                format!("event not valid from {from}"),
            ));
        };

        let mut write = TransitionWrite {
            subscription_id,
            from,
            to,
            expected_period_end: None,
            period: None,
            payment: None,
            at: now,
        };

        match event {
            SubscriptionEvent::PaymentConfirmed { transaction_ref } => {
                let Some(pending) = self.store.pending_payment(subscription_id).await? else {
                    return Ok(self.reject(
                        subscription_id,
                        Some(from),
                        event_name,
                        "no pending payment to confirm",
                    ));
                };
                write.period = Some((now, add_one_month(now)));
                write.payment = Some(PaymentWrite::Settle {
                    payment_id: pending.id,
                    to: PaymentStatus::Paid,
                    transaction_ref,
                });
            }
            SubscriptionEvent::BankTransferSelected {
                depositor_name,
                depositor_bank,
                window,
            } => {
                let mut insert = NewPayment::new(
                    subscription_id,
                    subscription.monthly_price,
                    PaymentMethod::BankTransfer,
                    PaymentStatus::Pending,
                );
                insert.depositor_name = Some(depositor_name);
                insert.depositor_bank = depositor_bank;
                insert.expires_at = Some(now + window);
                write.payment = Some(PaymentWrite::ReplacePending {
                    close_as: PaymentStatus::Expired,
                    insert,
                });
            }
            SubscriptionEvent::DepositConfirmed { transaction_ref } => {
                let pending = self.store.pending_payment(subscription_id).await?;
                let Some(pending) = pending
                    .filter(|payment| payment.payment_method == PaymentMethod::BankTransfer)
                else {
                    return Ok(self.reject(
                        subscription_id,
                        Some(from),
                        event_name,
                        "no pending bank transfer",
                    ));
                };
                if pending.expires_at.map(|at| at <= now).unwrap_or(false) {
                    return Ok(self.reject(
                        subscription_id,
                        Some(from),
                        event_name,
                        "bank transfer window has passed",
                    ));
                }
                write.period = Some((now, add_one_month(now)));
                write.payment = Some(PaymentWrite::Settle {
                    payment_id: pending.id,
                    to: PaymentStatus::Paid,
                    transaction_ref,
                });
            }
            SubscriptionEvent::BankTransferExpired { payment_id } => {
                write.payment = Some(PaymentWrite::Settle {
                    payment_id,
                    to: PaymentStatus::Expired,
                    transaction_ref: None,
                });
            }
            SubscriptionEvent::Renewed { payment } => {
                let Some(period_end) = subscription.current_period_end else {
                    return Ok(self.reject(
                        subscription_id,
                        Some(from),
                        event_name,
                        "active subscription has no period",
                    ));
                };
                write.expected_period_end = Some(period_end);
                write.period = Some((period_end, add_one_month(period_end)));
                write.payment = Some(PaymentWrite::Insert(payment));
            }
            SubscriptionEvent::RenewalFailed { payment } => {
                write.expected_period_end = subscription.current_period_end;
                write.payment = Some(PaymentWrite::Insert(payment));
            }
            SubscriptionEvent::Cancelled => {
                write.payment = Some(PaymentWrite::ClosePending {
                    to: PaymentStatus::Expired,
                });
            }
        }

        match self.store.apply_transition(write).await? {
            Some(updated) => {
                info!(
                    subscription = %subscription_id,
                    event = event_name,
                    from = %from,
                    to = %updated.status,
                    "subscription transitioned"
                );
                Ok(TransitionOutcome::Applied {
                    subscription: updated,
                    from,
                })
            }
            None => Ok(self.reject(
                subscription_id,
                Some(from),
                event_name,
                "subscription changed concurrently",
            )),
        }
    }

    fn reject(
        &self,
        subscription_id: Uuid,
        current: Option<SubscriptionStatus>,
        event: &'static str,
        reason: impl Into<String>,
    ) -> TransitionOutcome {
        let reason = reason.into();
        warn!(
            subscription = %subscription_id,
            current = ?current,
            event,
            %reason,
            "subscription transition rejected"
        );
        TransitionOutcome::Rejected {
            subscription_id,
            current,
            event,
            reason,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn renewal() -> SubscriptionEvent {
        SubscriptionEvent::Renewed {
            payment: NewPayment::new(Uuid::nil(), 1, PaymentMethod::Card, PaymentStatus::Paid),
        }
    }

    #[test]
    fn terminal_states_accept_nothing() {
        for status in [SubscriptionStatus::Cancelled, SubscriptionStatus::Expired] {
            assert_eq!(next_status(status, &SubscriptionEvent::Cancelled), None);
            assert_eq!(next_status(status, &renewal()), None);
            assert_eq!(
                next_status(
                    status,
                    &SubscriptionEvent::PaymentConfirmed {
                        transaction_ref: None
                    }
                ),
                None
            );
        }
    }

    #[test]
    fn bank_transfer_path() {
        let selected = SubscriptionEvent::BankTransferSelected {
            depositor_name: "Kim".into(),
            depositor_bank: None,
            window: Duration::hours(72),
        };
        assert_eq!(
            next_status(SubscriptionStatus::PendingPayment, &selected),
            Some(SubscriptionStatus::PendingBankTransfer)
        );
        assert_eq!(
            next_status(
                SubscriptionStatus::PendingBankTransfer,
                &SubscriptionEvent::BankTransferExpired {
                    payment_id: Uuid::nil()
                }
            ),
            Some(SubscriptionStatus::Cancelled)
        );
        assert_eq!(next_status(SubscriptionStatus::Active, &selected), None);
    }

    #[test]
    fn renewal_only_from_active() {
        assert_eq!(
            next_status(SubscriptionStatus::Active, &renewal()),
            Some(SubscriptionStatus::Active)
        );
        assert_eq!(next_status(SubscriptionStatus::PendingPayment, &renewal()), None);
    }

    #[test]
    fn month_is_calendar_month() {
        let start = Utc.with_ymd_and_hms(2024, 1, 31, 9, 0, 0).unwrap();
        assert_eq!(
            add_one_month(start),
            Utc.with_ymd_and_hms(2024, 2, 29, 9, 0, 0).unwrap()
        );
        let start = Utc.with_ymd_and_hms(2024, 3, 15, 0, 0, 0).unwrap();
        assert_eq!(
            add_one_month(start),
            Utc.with_ymd_and_hms(2024, 4, 15, 0, 0, 0).unwrap()
        );
    }
}
