use std::sync::Arc;

use anyhow::Result;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

use super::models::{click_through_rate, NewImpression};
use super::store::AdvertisingStore;

/// key: ad-tracking-outcome
/// `NotAdvertised` is a normal outcome: listings without an active slot are shown all the time.
#[derive(Clone, Debug, PartialEq)]
pub enum TrackOutcome<T> {
    Tracked(T),
    NotAdvertised,
    Invalid(TrackingValidationError),
}

#[derive(Clone, Debug, Error, PartialEq, Eq)]
pub enum TrackingValidationError {
    #[error("`{0}` is required")]
    MissingField(&'static str),
    #[error("`{field}` must be at least {min}")]
    OutOfRange { field: &'static str, min: i32 },
}

#[derive(Clone, Debug, Default)]
pub struct ImpressionRequest {
    pub listing_id: Option<Uuid>,
    pub category_id: Option<Uuid>,
    pub position: Option<i32>,
    pub page: Option<i32>,
}

#[derive(Clone, Debug, Default)]
pub struct ClickRequest {
    pub listing_id: Option<Uuid>,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct ImpressionTracked {
    pub subscription_id: Uuid,
    pub impression_id: Uuid,
    pub impression_count: i64,
}

#[derive(Clone, Debug, Serialize, PartialEq)]
pub struct ClickTracked {
    pub subscription_id: Uuid,
    /// The impression the click was matched to; clicks still count without one.
    pub impression_id: Option<Uuid>,
    pub click_count: i64,
    pub impression_count: i64,
    pub ctr: f64,
}

/// key: ad-tracker -> impression and click measurement
#[derive(Clone)]
pub struct AdTracker {
    store: Arc<dyn AdvertisingStore>,
}

impl AdTracker {
    pub fn new(store: Arc<dyn AdvertisingStore>) -> Self {
        Self { store }
    }

    pub async fn record_impression(
        &self,
        request: ImpressionRequest,
    ) -> Result<TrackOutcome<ImpressionTracked>> {
        let Some(listing_id) = request.listing_id else {
            return Ok(TrackOutcome::Invalid(TrackingValidationError::MissingField(
                "listingId",
            )));
        };
        let Some(category_id) = request.category_id else {
            return Ok(TrackOutcome::Invalid(TrackingValidationError::MissingField(
                "categoryId",
            )));
        };
        if let Some(position) = request.position {
            if position < 0 {
                return Ok(TrackOutcome::Invalid(TrackingValidationError::OutOfRange {
                    field: "position",
                    min: 0,
                }));
            }
        }
        let page_number = request.page.unwrap_or(1);
        if page_number < 1 {
            return Ok(TrackOutcome::Invalid(TrackingValidationError::OutOfRange {
                field: "page",
                min: 1,
            }));
        }

        let Some(subscription) = self.store.active_subscription_for_listing(listing_id).await?
        else {
            return Ok(TrackOutcome::NotAdvertised);
        };

        let (impression, impression_count) = self
            .store
            .record_impression(NewImpression {
                subscription_id: subscription.id,
                listing_id,
                category_id,
                position: request.position,
                page_number,
            })
            .await?;

        debug!(
            subscription = %subscription.id,
            listing = %listing_id,
            impression_count,
            "impression tracked"
        );
        Ok(TrackOutcome::Tracked(ImpressionTracked {
            subscription_id: subscription.id,
            impression_id: impression.id,
            impression_count,
        }))
    }

    pub async fn record_click(
        &self,
        request: ClickRequest,
        now: DateTime<Utc>,
    ) -> Result<TrackOutcome<ClickTracked>> {
        let Some(listing_id) = request.listing_id else {
            return Ok(TrackOutcome::Invalid(TrackingValidationError::MissingField(
                "listingId",
            )));
        };

        let Some(subscription) = self.store.active_subscription_for_listing(listing_id).await?
        else {
            return Ok(TrackOutcome::NotAdvertised);
        };

        let record = self.store.record_click(subscription.id, now).await?;
        if record.impression_id.is_none() {
            debug!(
                subscription = %subscription.id,
                listing = %listing_id,
                "click counted without a matching impression"
            );
        }

        Ok(TrackOutcome::Tracked(ClickTracked {
            subscription_id: subscription.id,
            impression_id: record.impression_id,
            click_count: record.total_clicks,
            impression_count: record.total_impressions,
            ctr: click_through_rate(record.total_clicks, record.total_impressions),
        }))
    }
}
