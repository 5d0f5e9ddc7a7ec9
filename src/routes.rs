use axum::{
    routing::{get, post},
    Router,
};

use crate::advertising::{api, cron_api};

pub async fn root() -> &'static str {
    "Advertising Engine API"
}

pub fn api_routes() -> Router {
    Router::new()
        .route("/", get(root))
        .route("/track/impression", post(api::track_impression))
        .route("/track/click", post(api::track_click))
        .route("/cron/advertising", get(cron_api::run_cron))
        .route(
            "/api/advertising/subscriptions",
            get(api::list_subscriptions).post(api::create_subscription),
        )
        .route(
            "/api/advertising/subscriptions/:id/bank-transfer",
            post(api::select_bank_transfer),
        )
        .route(
            "/api/advertising/subscriptions/:id/confirm-payment",
            post(api::confirm_payment),
        )
        .route(
            "/api/advertising/subscriptions/:id/confirm-deposit",
            post(api::confirm_deposit),
        )
        .route(
            "/api/advertising/subscriptions/:id/cancel",
            post(api::cancel_subscription),
        )
        .route(
            "/api/advertising/subscriptions/:id/stats",
            get(api::subscription_stats),
        )
        .route(
            "/api/advertising/subscriptions/:id/payments",
            get(api::list_payments),
        )
        .route(
            "/api/advertising/credits",
            get(api::credit_summary).post(api::grant_credit),
        )
}
