use std::net::SocketAddr;
use std::sync::Arc;

use ads_engine::advertising::{
    CreditOnlyGateway, HttpPaymentGateway, PaymentGateway, PgAdvertisingStore, PgListingDirectory,
};
use ads_engine::{advertising_config_from_env, api_routes, config, AdvertisingContext};
use axum::{routing::get, Extension, Router};
use axum_prometheus::PrometheusMetricLayer;
use sqlx::postgres::PgPoolOptions;
use tracing_subscriber::{fmt, EnvFilter};

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .json()
        .init();

    dotenvy::dotenv().ok();
    // Fail fast if the JWT secret is missing
    let _ = config::JWT_SECRET.as_str();

    let advertising_config = advertising_config_from_env();
    if advertising_config.cron_secret.is_none() {
        tracing::warn!("ADVERTISING_CRON_SECRET is not set; the cron endpoint will refuse to run");
    }

    let gateway: Arc<dyn PaymentGateway> = match (
        config::PAYMENT_GATEWAY_URL.as_deref(),
        config::PAYMENT_GATEWAY_API_KEY.as_deref(),
    ) {
        (Some(url), Some(api_key)) => Arc::new(HttpPaymentGateway::new(url, api_key)?),
        (Some(_), None) => {
            return Err("PAYMENT_GATEWAY_API_KEY must be set when PAYMENT_GATEWAY_URL is".into())
        }
        (None, _) => {
            tracing::warn!("no payment gateway configured; renewals can only be paid with credit");
            Arc::new(CreditOnlyGateway)
        }
    };

    let context = match config::DATABASE_URL.as_deref() {
        Some(db_url) => {
            let pool = PgPoolOptions::new()
                .max_connections(5)
                .connect(db_url)
                .await?;

            // Run migrations if available
            if let Err(error) = sqlx::migrate!().run(&pool).await {
                if *config::ALLOW_MIGRATION_FAILURE {
                    tracing::warn!(
                        ?error,
                        "Database migrations failed but continuing due to ALLOW_MIGRATION_FAILURE"
                    );
                } else {
                    return Err(Box::new(error) as Box<dyn std::error::Error>);
                }
            }

            AdvertisingContext::new(
                Arc::new(PgAdvertisingStore::new(pool.clone())),
                Arc::new(PgListingDirectory::new(pool)),
                gateway,
                advertising_config,
            )
        }
        None => {
            tracing::warn!("DATABASE_URL is not set; using the in-memory advertising store");
            AdvertisingContext::in_memory(gateway, advertising_config).0
        }
    };

    let (prometheus_layer, metrics_handle) = PrometheusMetricLayer::pair();
    let app = Router::new()
        .route(
            "/metrics",
            get(move || async move { metrics_handle.render() }),
        )
        .merge(api_routes())
        .layer(prometheus_layer)
        .layer(Extension(context));

    let addr: SocketAddr = format!("{}:{}", config::BIND_ADDRESS.as_str(), *config::BIND_PORT)
        .parse()
        .map_err(|error| Box::new(error) as Box<dyn std::error::Error>)?;
    tracing::info!(%addr, "Listening for incoming connections");
    axum::Server::bind(&addr)
        .serve(app.into_make_service())
        .await?;

    Ok(())
}
