use axum::{
    extract::{Extension, Query},
    http::{header::AUTHORIZATION, HeaderMap, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::Utc;
use serde::Deserialize;
use serde_json::json;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::{error, warn};

use super::cron::{CronJob, CronRunError};
use super::AdvertisingContext;

#[derive(Debug, Clone, Copy, Error, PartialEq, Eq)]
pub enum CronAuthError {
    #[error("cron secret is not configured")]
    Unconfigured,
    #[error("missing bearer token")]
    MissingToken,
    #[error("invalid bearer token")]
    InvalidToken,
}

impl CronAuthError {
    fn status(&self) -> StatusCode {
        match self {
            CronAuthError::Unconfigured => StatusCode::INTERNAL_SERVER_ERROR,
            CronAuthError::MissingToken | CronAuthError::InvalidToken => StatusCode::UNAUTHORIZED,
        }
    }
}

/// Checks the trigger's bearer token against the configured secret. Fails closed when no
/// secret is configured.
pub fn authorize(secret: Option<&str>, authorization: Option<&str>) -> Result<(), CronAuthError> {
    let secret = secret.ok_or(CronAuthError::Unconfigured)?;
    let presented = authorization
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
        .ok_or(CronAuthError::MissingToken)?;

    if Sha256::digest(presented.as_bytes()) == Sha256::digest(secret.as_bytes()) {
        Ok(())
    } else {
        Err(CronAuthError::InvalidToken)
    }
}

#[derive(Debug, Default, Deserialize)]
pub struct CronQuery {
    pub job: Option<String>,
}

/// key: advertising-cron-api -> authenticated trigger for the billing jobs
pub async fn run_cron(
    Extension(ctx): Extension<AdvertisingContext>,
    headers: HeaderMap,
    Query(query): Query<CronQuery>,
) -> Response {
    let requested = query.job.unwrap_or_else(|| CronJob::All.as_str().to_string());

    let authorization = headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok());
    if let Err(err) = authorize(ctx.config.cron_secret.as_deref(), authorization) {
        match err {
            CronAuthError::Unconfigured => {
                error!(job = %requested, "cron trigger refused: no secret configured")
            }
            _ => warn!(job = %requested, error = %err, "cron trigger rejected"),
        }
        return (err.status(), Json(json!({ "error": err.to_string(), "job": requested })))
            .into_response();
    }

    let Some(job) = CronJob::parse(&requested) else {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "unknown job", "job": requested })),
        )
            .into_response();
    };

    match ctx.orchestrator.run(job, Utc::now()).await {
        Ok(reports) => (
            StatusCode::OK,
            Json(json!({ "success": true, "job": job, "reports": reports })),
        )
            .into_response(),
        Err(CronRunError::AlreadyRunning) => (
            StatusCode::CONFLICT,
            Json(json!({ "error": "job already running", "job": job })),
        )
            .into_response(),
        Err(CronRunError::Failed(err)) => (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": format!("{err:#}"), "job": job })),
        )
            .into_response(),
    }
}
