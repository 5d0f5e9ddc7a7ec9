use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;
use uuid::Uuid;

/// key: advertising-subscription-status
#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    PendingPayment,
    PendingBankTransfer,
    Active,
    Cancelled,
    Expired,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::PendingPayment => "pending_payment",
            SubscriptionStatus::PendingBankTransfer => "pending_bank_transfer",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending_payment" => Some(Self::PendingPayment),
            "pending_bank_transfer" => Some(Self::PendingBankTransfer),
            "active" => Some(Self::Active),
            "cancelled" => Some(Self::Cancelled),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    /// No automated transition leaves a terminal status.
    pub fn is_terminal(&self) -> bool {
        matches!(self, SubscriptionStatus::Cancelled | SubscriptionStatus::Expired)
    }
}

impl fmt::Display for SubscriptionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum PackageType {
    Basic,
    Standard,
    Premium,
}

impl PackageType {
    pub fn as_str(&self) -> &'static str {
        match self {
            PackageType::Basic => "basic",
            PackageType::Standard => "standard",
            PackageType::Premium => "premium",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "basic" => Some(Self::Basic),
            "standard" => Some(Self::Standard),
            "premium" => Some(Self::Premium),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentStatus {
    Pending,
    Paid,
    Failed,
    Expired,
}

impl PaymentStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentStatus::Pending => "pending",
            PaymentStatus::Paid => "paid",
            PaymentStatus::Failed => "failed",
            PaymentStatus::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "pending" => Some(Self::Pending),
            "paid" => Some(Self::Paid),
            "failed" => Some(Self::Failed),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum PaymentMethod {
    Card,
    BankTransfer,
    Credit,
}

impl PaymentMethod {
    pub fn as_str(&self) -> &'static str {
        match self {
            PaymentMethod::Card => "card",
            PaymentMethod::BankTransfer => "bank_transfer",
            PaymentMethod::Credit => "credit",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "card" => Some(Self::Card),
            "bank_transfer" => Some(Self::BankTransfer),
            "credit" => Some(Self::Credit),
            _ => None,
        }
    }
}

/// key: advertising-subscription-model -> one seller's slot for one listing
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AdvertisingSubscription {
    pub id: Uuid,
    pub listing_id: Uuid,
    pub seller_id: Uuid,
    pub status: SubscriptionStatus,
    pub package_type: PackageType,
    pub monthly_price: i64,
    pub total_impressions: i64,
    pub total_clicks: i64,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl AdvertisingSubscription {
    pub fn is_due(&self, now: DateTime<Utc>) -> bool {
        self.status == SubscriptionStatus::Active
            && self
                .current_period_end
                .map(|end| end <= now)
                .unwrap_or(false)
    }

    pub fn click_through_rate(&self) -> f64 {
        click_through_rate(self.total_clicks, self.total_impressions)
    }
}

#[derive(Clone, Debug)]
pub struct NewSubscription {
    pub listing_id: Uuid,
    pub seller_id: Uuid,
    pub package_type: PackageType,
    pub monthly_price: i64,
}

/// key: advertising-payment-model -> one billing attempt
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AdvertisingPayment {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub amount: i64,
    pub supply_amount: i64,
    pub vat_amount: i64,
    pub credit_applied: i64,
    pub payment_method: PaymentMethod,
    pub status: PaymentStatus,
    pub depositor_name: Option<String>,
    pub depositor_bank: Option<String>,
    pub failure_reason: Option<String>,
    pub transaction_ref: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct NewPayment {
    /// Chosen up front so credit draws and gateway charges can reference the row.
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub amount: i64,
    pub credit_applied: i64,
    pub payment_method: PaymentMethod,
    pub status: PaymentStatus,
    pub depositor_name: Option<String>,
    pub depositor_bank: Option<String>,
    pub failure_reason: Option<String>,
    pub transaction_ref: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
}

impl NewPayment {
    pub fn new(
        subscription_id: Uuid,
        amount: i64,
        payment_method: PaymentMethod,
        status: PaymentStatus,
    ) -> Self {
        Self {
            id: Uuid::new_v4(),
            subscription_id,
            amount,
            credit_applied: 0,
            payment_method,
            status,
            depositor_name: None,
            depositor_bank: None,
            failure_reason: None,
            transaction_ref: None,
            expires_at: None,
        }
    }

    pub fn into_payment(self, now: DateTime<Utc>) -> AdvertisingPayment {
        let (supply_amount, vat_amount) = split_vat(self.amount);
        let resolved_at = match self.status {
            PaymentStatus::Pending => None,
            _ => Some(now),
        };
        AdvertisingPayment {
            id: self.id,
            subscription_id: self.subscription_id,
            amount: self.amount,
            supply_amount,
            vat_amount,
            credit_applied: self.credit_applied,
            payment_method: self.payment_method,
            status: self.status,
            depositor_name: self.depositor_name,
            depositor_bank: self.depositor_bank,
            failure_reason: self.failure_reason,
            transaction_ref: self.transaction_ref,
            expires_at: self.expires_at,
            resolved_at,
            created_at: now,
        }
    }
}

/// key: advertising-impression-model -> one recorded exposure
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct AdvertisingImpression {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub listing_id: Uuid,
    pub category_id: Uuid,
    pub position: Option<i32>,
    pub page_number: i32,
    pub clicked: bool,
    pub clicked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct NewImpression {
    pub subscription_id: Uuid,
    pub listing_id: Uuid,
    pub category_id: Uuid,
    pub position: Option<i32>,
    pub page_number: i32,
}

/// Counter values read back from the same statement that bumped them.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct ClickRecord {
    pub impression_id: Option<Uuid>,
    pub total_clicks: i64,
    pub total_impressions: i64,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum CreditReason {
    Grant,
    Promotion,
    Compensation,
    AdvertisingPayment,
    Refund,
    Expired,
}

impl CreditReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            CreditReason::Grant => "grant",
            CreditReason::Promotion => "promotion",
            CreditReason::Compensation => "compensation",
            CreditReason::AdvertisingPayment => "advertising_payment",
            CreditReason::Refund => "refund",
            CreditReason::Expired => "expired",
        }
    }

    pub fn parse(value: &str) -> Option<Self> {
        match value {
            "grant" => Some(Self::Grant),
            "promotion" => Some(Self::Promotion),
            "compensation" => Some(Self::Compensation),
            "advertising_payment" => Some(Self::AdvertisingPayment),
            "refund" => Some(Self::Refund),
            "expired" => Some(Self::Expired),
            _ => None,
        }
    }

    pub fn is_grant(&self) -> bool {
        matches!(
            self,
            CreditReason::Grant | CreditReason::Promotion | CreditReason::Compensation
        )
    }
}

/// key: credit-ledger-entry -> append-only balance movement
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct CreditTransaction {
    pub id: Uuid,
    pub seller_id: Uuid,
    /// Grant this row draws from; `None` on the grant row itself.
    pub grant_id: Option<Uuid>,
    pub amount: i64,
    pub balance_after: i64,
    pub reason: CreditReason,
    pub payment_ref: Option<Uuid>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Clone, Debug)]
pub struct NewCreditGrant {
    pub seller_id: Uuid,
    pub amount: i64,
    pub reason: CreditReason,
    pub expires_at: Option<DateTime<Utc>>,
}

/// A grant together with what is left of it after every row referencing it.
#[derive(Clone, Debug, Serialize, PartialEq, Eq, FromRow)]
pub struct GrantBalance {
    pub grant_id: Uuid,
    pub seller_id: Uuid,
    pub granted: i64,
    pub remaining: i64,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct SubscriptionRow {
    pub id: Uuid,
    pub listing_id: Uuid,
    pub seller_id: Uuid,
    pub status: String,
    pub package_type: String,
    pub monthly_price: i64,
    pub total_impressions: i64,
    pub total_clicks: i64,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl TryFrom<SubscriptionRow> for AdvertisingSubscription {
    type Error = anyhow::Error;

    fn try_from(row: SubscriptionRow) -> Result<Self, Self::Error> {
        let status = SubscriptionStatus::parse(&row.status)
            .ok_or_else(|| anyhow::anyhow!("unknown subscription status `{}`", row.status))?;
        let package_type = PackageType::parse(&row.package_type)
            .ok_or_else(|| anyhow::anyhow!("unknown package type `{}`", row.package_type))?;
        Ok(AdvertisingSubscription {
            id: row.id,
            listing_id: row.listing_id,
            seller_id: row.seller_id,
            status,
            package_type,
            monthly_price: row.monthly_price,
            total_impressions: row.total_impressions,
            total_clicks: row.total_clicks,
            current_period_start: row.current_period_start,
            current_period_end: row.current_period_end,
            created_at: row.created_at,
            updated_at: row.updated_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct PaymentRow {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub amount: i64,
    pub supply_amount: i64,
    pub vat_amount: i64,
    pub credit_applied: i64,
    pub payment_method: String,
    pub status: String,
    pub depositor_name: Option<String>,
    pub depositor_bank: Option<String>,
    pub failure_reason: Option<String>,
    pub transaction_ref: Option<String>,
    pub expires_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<PaymentRow> for AdvertisingPayment {
    type Error = anyhow::Error;

    fn try_from(row: PaymentRow) -> Result<Self, Self::Error> {
        let payment_method = PaymentMethod::parse(&row.payment_method)
            .ok_or_else(|| anyhow::anyhow!("unknown payment method `{}`", row.payment_method))?;
        let status = PaymentStatus::parse(&row.status)
            .ok_or_else(|| anyhow::anyhow!("unknown payment status `{}`", row.status))?;
        Ok(AdvertisingPayment {
            id: row.id,
            subscription_id: row.subscription_id,
            amount: row.amount,
            supply_amount: row.supply_amount,
            vat_amount: row.vat_amount,
            credit_applied: row.credit_applied,
            payment_method,
            status,
            depositor_name: row.depositor_name,
            depositor_bank: row.depositor_bank,
            failure_reason: row.failure_reason,
            transaction_ref: row.transaction_ref,
            expires_at: row.expires_at,
            resolved_at: row.resolved_at,
            created_at: row.created_at,
        })
    }
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct ImpressionRow {
    pub id: Uuid,
    pub subscription_id: Uuid,
    pub listing_id: Uuid,
    pub category_id: Uuid,
    pub position: Option<i32>,
    pub page_number: i32,
    pub clicked: bool,
    pub clicked_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<ImpressionRow> for AdvertisingImpression {
    fn from(row: ImpressionRow) -> Self {
        AdvertisingImpression {
            id: row.id,
            subscription_id: row.subscription_id,
            listing_id: row.listing_id,
            category_id: row.category_id,
            position: row.position,
            page_number: row.page_number,
            clicked: row.clicked,
            clicked_at: row.clicked_at,
            created_at: row.created_at,
        }
    }
}

#[derive(Debug, Clone, FromRow)]
pub(crate) struct CreditRow {
    pub id: Uuid,
    pub seller_id: Uuid,
    pub grant_id: Option<Uuid>,
    pub amount: i64,
    pub balance_after: i64,
    pub reason: String,
    pub payment_ref: Option<Uuid>,
    pub expires_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl TryFrom<CreditRow> for CreditTransaction {
    type Error = anyhow::Error;

    fn try_from(row: CreditRow) -> Result<Self, Self::Error> {
        let reason = CreditReason::parse(&row.reason)
            .ok_or_else(|| anyhow::anyhow!("unknown credit reason `{}`", row.reason))?;
        Ok(CreditTransaction {
            id: row.id,
            seller_id: row.seller_id,
            grant_id: row.grant_id,
            amount: row.amount,
            balance_after: row.balance_after,
            reason,
            payment_ref: row.payment_ref,
            expires_at: row.expires_at,
            created_at: row.created_at,
        })
    }
}

/// Splits a VAT-inclusive amount into supply and 10% VAT. The parts always sum to `amount`.
pub fn split_vat(amount: i64) -> (i64, i64) {
    let supply = (amount * 10 + 5) / 11;
    (supply, amount - supply)
}

/// Clicks over impressions as a percentage, rounded to two decimals. Zero impressions yield 0.
pub fn click_through_rate(clicks: i64, impressions: i64) -> f64 {
    if impressions <= 0 {
        return 0.0;
    }
    let ratio = clicks as f64 / impressions as f64 * 100.0;
    (ratio * 100.0).round() / 100.0
}
