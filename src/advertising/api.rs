use axum::{
    extract::{rejection::JsonRejection, Extension, Path, Query},
    http::StatusCode,
    Json,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::extractor::AuthUser;

use super::models::{
    AdvertisingPayment, AdvertisingSubscription, CreditReason, CreditTransaction, NewSubscription,
    PackageType, SubscriptionStatus,
};
use super::state::{SubscriptionEvent, TransitionOutcome};
use super::tracker::{ClickRequest, ImpressionRequest, TrackOutcome};
use super::AdvertisingContext;

fn json_body<T>(payload: Result<Json<T>, JsonRejection>) -> AppResult<T> {
    payload
        .map(|Json(body)| body)
        .map_err(|rejection| AppError::BadRequest(rejection.body_text()))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ImpressionPayload {
    pub listing_id: Option<Uuid>,
    pub category_id: Option<Uuid>,
    pub position: Option<i32>,
    pub page: Option<i32>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackImpressionResponse {
    pub success: bool,
    pub tracked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub impression_count: Option<i64>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ClickPayload {
    pub listing_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct TrackClickResponse {
    pub success: bool,
    pub tracked: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub click_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub impression_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub ctr: Option<f64>,
}

/// key: ad-tracking-api -> called by ad-serving on every render
pub async fn track_impression(
    Extension(ctx): Extension<AdvertisingContext>,
    payload: Result<Json<ImpressionPayload>, JsonRejection>,
) -> AppResult<Json<TrackImpressionResponse>> {
    let payload = json_body(payload)?;
    let outcome = ctx
        .tracker
        .record_impression(ImpressionRequest {
            listing_id: payload.listing_id,
            category_id: payload.category_id,
            position: payload.position,
            page: payload.page,
        })
        .await?;

    match outcome {
        TrackOutcome::Tracked(tracked) => Ok(Json(TrackImpressionResponse {
            success: true,
            tracked: true,
            impression_count: Some(tracked.impression_count),
        })),
        TrackOutcome::NotAdvertised => Ok(Json(TrackImpressionResponse {
            success: true,
            tracked: false,
            impression_count: None,
        })),
        TrackOutcome::Invalid(err) => Err(AppError::BadRequest(err.to_string())),
    }
}

pub async fn track_click(
    Extension(ctx): Extension<AdvertisingContext>,
    payload: Result<Json<ClickPayload>, JsonRejection>,
) -> AppResult<Json<TrackClickResponse>> {
    let payload = json_body(payload)?;
    let outcome = ctx
        .tracker
        .record_click(
            ClickRequest {
                listing_id: payload.listing_id,
            },
            Utc::now(),
        )
        .await?;

    match outcome {
        TrackOutcome::Tracked(tracked) => Ok(Json(TrackClickResponse {
            success: true,
            tracked: true,
            click_count: Some(tracked.click_count),
            impression_count: Some(tracked.impression_count),
            ctr: Some(tracked.ctr),
        })),
        TrackOutcome::NotAdvertised => Ok(Json(TrackClickResponse {
            success: true,
            tracked: false,
            click_count: None,
            impression_count: None,
            ctr: None,
        })),
        TrackOutcome::Invalid(err) => Err(AppError::BadRequest(err.to_string())),
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreateSubscriptionRequest {
    pub listing_id: Uuid,
    pub package_type: String,
}

#[derive(Debug, Serialize)]
pub struct CheckoutResponse {
    pub subscription: AdvertisingSubscription,
    pub payment: AdvertisingPayment,
}

/// key: advertising-checkout -> seller buys a slot for one listing
pub async fn create_subscription(
    Extension(ctx): Extension<AdvertisingContext>,
    user: AuthUser,
    payload: Result<Json<CreateSubscriptionRequest>, JsonRejection>,
) -> AppResult<(StatusCode, Json<CheckoutResponse>)> {
    let payload = json_body(payload)?;
    let package_type = PackageType::parse(&payload.package_type).ok_or_else(|| {
        AppError::BadRequest(format!("unknown package type `{}`", payload.package_type))
    })?;

    let owner = ctx
        .directory
        .listing_owner(payload.listing_id)
        .await?
        .ok_or(AppError::NotFound)?;
    if owner != user.user_id {
        return Err(AppError::Forbidden);
    }

    let monthly_price = ctx.config.package_prices.price_for(package_type);
    let created = ctx
        .store
        .insert_subscription(
            NewSubscription {
                listing_id: payload.listing_id,
                seller_id: owner,
                package_type,
                monthly_price,
            },
            Utc::now(),
        )
        .await?;
    let Some((subscription, payment)) = created else {
        return Err(AppError::Conflict(
            "listing already has an open advertising subscription".into(),
        ));
    };

    info!(
        subscription = %subscription.id,
        listing = %subscription.listing_id,
        seller = %owner,
        package = package_type.as_str(),
        monthly_price,
        "advertising subscription created"
    );
    Ok((
        StatusCode::CREATED,
        Json(CheckoutResponse {
            subscription,
            payment,
        }),
    ))
}

pub async fn list_subscriptions(
    Extension(ctx): Extension<AdvertisingContext>,
    user: AuthUser,
) -> AppResult<Json<Vec<AdvertisingSubscription>>> {
    let subscriptions = ctx.store.list_seller_subscriptions(user.user_id).await?;
    Ok(Json(subscriptions))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BankTransferRequest {
    pub depositor_name: String,
    #[serde(default)]
    pub depositor_bank: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ConfirmRequest {
    #[serde(default)]
    pub transaction_ref: Option<String>,
}

#[derive(Debug, Serialize)]
pub struct TransitionResponse {
    pub subscription: AdvertisingSubscription,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub payment: Option<AdvertisingPayment>,
}

async fn subscription_for(
    ctx: &AdvertisingContext,
    user: &AuthUser,
    id: Uuid,
) -> AppResult<AdvertisingSubscription> {
    let subscription = ctx.store.subscription(id).await?.ok_or(AppError::NotFound)?;
    if !user.may_act_for(subscription.seller_id) {
        return Err(AppError::Forbidden);
    }
    Ok(subscription)
}

fn require_admin(user: &AuthUser) -> AppResult<()> {
    if user.is_admin() {
        Ok(())
    } else {
        Err(AppError::Forbidden)
    }
}

fn applied(outcome: TransitionOutcome) -> AppResult<AdvertisingSubscription> {
    match outcome {
        TransitionOutcome::Applied { subscription, .. } => Ok(subscription),
        TransitionOutcome::Rejected { reason, .. } => Err(AppError::Conflict(reason)),
    }
}

pub async fn select_bank_transfer(
    Extension(ctx): Extension<AdvertisingContext>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    payload: Result<Json<BankTransferRequest>, JsonRejection>,
) -> AppResult<Json<TransitionResponse>> {
    let payload = json_body(payload)?;
    let depositor_name = payload.depositor_name.trim().to_string();
    if depositor_name.is_empty() {
        return Err(AppError::BadRequest("`depositorName` is required".into()));
    }
    subscription_for(&ctx, &user, id).await?;

    let event = SubscriptionEvent::BankTransferSelected {
        depositor_name,
        depositor_bank: payload
            .depositor_bank
            .map(|bank| bank.trim().to_string())
            .filter(|bank| !bank.is_empty()),
        window: Duration::hours(ctx.config.bank_transfer_window_hours),
    };
    let subscription = applied(ctx.machine.transition(id, event, Utc::now()).await?)?;
    let payment = ctx.store.pending_payment(id).await?;
    Ok(Json(TransitionResponse {
        subscription,
        payment,
    }))
}

/// Admin or payment callback: the initial card payment cleared.
pub async fn confirm_payment(
    Extension(ctx): Extension<AdvertisingContext>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    payload: Option<Json<ConfirmRequest>>,
) -> AppResult<Json<TransitionResponse>> {
    require_admin(&user)?;
    let payload = payload.map(|Json(body)| body).unwrap_or_default();
    let event = SubscriptionEvent::PaymentConfirmed {
        transaction_ref: payload.transaction_ref,
    };
    let subscription = applied(ctx.machine.transition(id, event, Utc::now()).await?)?;
    Ok(Json(TransitionResponse {
        subscription,
        payment: None,
    }))
}

pub async fn confirm_deposit(
    Extension(ctx): Extension<AdvertisingContext>,
    user: AuthUser,
    Path(id): Path<Uuid>,
    payload: Option<Json<ConfirmRequest>>,
) -> AppResult<Json<TransitionResponse>> {
    require_admin(&user)?;
    let payload = payload.map(|Json(body)| body).unwrap_or_default();
    let event = SubscriptionEvent::DepositConfirmed {
        transaction_ref: payload.transaction_ref,
    };
    let subscription = applied(ctx.machine.transition(id, event, Utc::now()).await?)?;
    Ok(Json(TransitionResponse {
        subscription,
        payment: None,
    }))
}

pub async fn cancel_subscription(
    Extension(ctx): Extension<AdvertisingContext>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<TransitionResponse>> {
    subscription_for(&ctx, &user, id).await?;
    let outcome = ctx
        .machine
        .transition(id, SubscriptionEvent::Cancelled, Utc::now())
        .await?;
    let subscription = applied(outcome)?;
    info!(subscription = %id, by = %user.user_id, "advertising subscription cancelled");
    Ok(Json(TransitionResponse {
        subscription,
        payment: None,
    }))
}

#[derive(Debug, Serialize)]
pub struct SubscriptionStats {
    pub subscription_id: Uuid,
    pub status: SubscriptionStatus,
    pub impressions: i64,
    pub clicks: i64,
    pub ctr: f64,
    pub current_period_start: Option<DateTime<Utc>>,
    pub current_period_end: Option<DateTime<Utc>>,
}

pub async fn subscription_stats(
    Extension(ctx): Extension<AdvertisingContext>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<SubscriptionStats>> {
    let subscription = subscription_for(&ctx, &user, id).await?;
    Ok(Json(SubscriptionStats {
        subscription_id: subscription.id,
        status: subscription.status,
        impressions: subscription.total_impressions,
        clicks: subscription.total_clicks,
        ctr: subscription.click_through_rate(),
        current_period_start: subscription.current_period_start,
        current_period_end: subscription.current_period_end,
    }))
}

pub async fn list_payments(
    Extension(ctx): Extension<AdvertisingContext>,
    user: AuthUser,
    Path(id): Path<Uuid>,
) -> AppResult<Json<Vec<AdvertisingPayment>>> {
    subscription_for(&ctx, &user, id).await?;
    Ok(Json(ctx.store.payments_for(id).await?))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct GrantCreditRequest {
    pub seller_id: Uuid,
    pub amount: i64,
    #[serde(default)]
    pub valid_days: Option<i64>,
    #[serde(default)]
    pub reason: Option<String>,
}

/// key: credit-api -> admin grants prepaid advertising credit
pub async fn grant_credit(
    Extension(ctx): Extension<AdvertisingContext>,
    user: AuthUser,
    payload: Result<Json<GrantCreditRequest>, JsonRejection>,
) -> AppResult<(StatusCode, Json<CreditTransaction>)> {
    require_admin(&user)?;
    let payload = json_body(payload)?;
    if payload.amount <= 0 {
        return Err(AppError::BadRequest("`amount` must be positive".into()));
    }
    let reason = match payload.reason.as_deref() {
        None => CreditReason::Grant,
        Some(raw) => CreditReason::parse(raw)
            .filter(CreditReason::is_grant)
            .ok_or_else(|| AppError::BadRequest(format!("`{raw}` is not a grant reason")))?,
    };
    let valid_days = payload.valid_days.unwrap_or(ctx.config.credit_validity_days);
    if valid_days <= 0 {
        return Err(AppError::BadRequest("`validDays` must be positive".into()));
    }

    let entry = ctx
        .ledger
        .grant(
            payload.seller_id,
            payload.amount,
            reason,
            Some(Duration::days(valid_days)),
            Utc::now(),
        )
        .await?;
    Ok((StatusCode::CREATED, Json(entry)))
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditQuery {
    pub seller_id: Option<Uuid>,
}

#[derive(Debug, Serialize)]
pub struct CreditSummary {
    pub seller_id: Uuid,
    pub balance: i64,
    /// Balance minus grants that have lapsed but not been swept yet.
    pub spendable: i64,
    pub history: Vec<CreditTransaction>,
}

pub async fn credit_summary(
    Extension(ctx): Extension<AdvertisingContext>,
    user: AuthUser,
    Query(query): Query<CreditQuery>,
) -> AppResult<Json<CreditSummary>> {
    let seller_id = query.seller_id.unwrap_or(user.user_id);
    if !user.may_act_for(seller_id) {
        return Err(AppError::Forbidden);
    }
    Ok(Json(CreditSummary {
        seller_id,
        balance: ctx.ledger.balance(seller_id).await?,
        spendable: ctx.ledger.spendable(seller_id, Utc::now()).await?,
        history: ctx.ledger.history(seller_id).await?,
    }))
}
