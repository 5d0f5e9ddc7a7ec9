use std::sync::Arc;

use ads_engine::advertising::CreditOnlyGateway;
use ads_engine::{api_routes, AdvertisingConfig, AdvertisingContext};
use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::{routing::get, Extension, Router};
use axum_prometheus::PrometheusMetricLayer;
use tower::ServiceExt;

#[tokio::test]
async fn metrics_returns_ok() {
    let (layer, handle) = PrometheusMetricLayer::pair();
    let (context, _store) =
        AdvertisingContext::in_memory(Arc::new(CreditOnlyGateway), AdvertisingConfig::default());
    let app = Router::new()
        .route("/metrics", get(move || async move { handle.render() }))
        .merge(api_routes())
        .layer(layer)
        .layer(Extension(context));
    let response = app
        .oneshot(
            Request::builder()
                .uri("/metrics")
                .body(Body::empty())
                .unwrap(),
        )
        .await
        .unwrap();
    assert_eq!(response.status(), StatusCode::OK);
}
