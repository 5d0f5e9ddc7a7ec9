use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use reqwest::{Client, StatusCode};
use serde::{Deserialize, Serialize};
use url::Url;
use uuid::Uuid;

/// key: payment-gateway-method -> seller's stored card/wallet
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct StoredPaymentMethod {
    pub billing_key: String,
    #[serde(default)]
    pub label: Option<String>,
}

#[derive(Clone, Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ChargeRequest {
    pub seller_id: Uuid,
    pub subscription_id: Uuid,
    /// Also sent as the idempotency key; renewals reuse it for every retry of one period.
    pub order_id: Uuid,
    pub amount: i64,
    pub billing_key: String,
    pub order_name: String,
}

#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ChargeOutcome {
    Approved { transaction_ref: String },
    /// The gateway answered and refused; this is a billing failure, not an outage.
    Declined { reason: String },
}

/// key: payment-gateway -> external charge capability
///
/// `Err` means the gateway could not be reached or answered nonsense. Business refusals
/// come back as `ChargeOutcome::Declined`.
#[async_trait]
pub trait PaymentGateway: Send + Sync {
    async fn stored_method(&self, seller_id: Uuid) -> Result<Option<StoredPaymentMethod>>;
    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeOutcome>;
}

/// Used when no gateway is configured: nobody has a stored method, so billing is credit only.
#[derive(Clone, Debug, Default)]
pub struct CreditOnlyGateway;

#[async_trait]
impl PaymentGateway for CreditOnlyGateway {
    async fn stored_method(&self, _seller_id: Uuid) -> Result<Option<StoredPaymentMethod>> {
        Ok(None)
    }

    async fn charge(&self, _request: &ChargeRequest) -> Result<ChargeOutcome> {
        Ok(ChargeOutcome::Declined {
            reason: "no payment gateway configured".to_string(),
        })
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ChargeApproved {
    transaction_ref: String,
}

#[derive(Debug, Default, Deserialize)]
struct ChargeDeclined {
    #[serde(default)]
    reason: Option<String>,
}

pub struct HttpPaymentGateway {
    base: String,
    api_key: String,
    client: Client,
}

impl HttpPaymentGateway {
    pub fn new(base: &str, api_key: impl Into<String>) -> Result<Self> {
        let parsed = Url::parse(base).with_context(|| format!("invalid gateway url `{base}`"))?;
        if !matches!(parsed.scheme(), "http" | "https") {
            return Err(anyhow!("gateway url must be http(s), got `{}`", parsed.scheme()));
        }
        let client = Client::builder()
            .timeout(Duration::from_secs(15))
            .build()
            .context("failed to build payment gateway client")?;
        Ok(Self {
            base: base.trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
        })
    }
}

#[async_trait]
impl PaymentGateway for HttpPaymentGateway {
    async fn stored_method(&self, seller_id: Uuid) -> Result<Option<StoredPaymentMethod>> {
        let url = format!("{}/billing-keys/{}", self.base, seller_id);
        let response = self
            .client
            .get(&url)
            .bearer_auth(&self.api_key)
            .send()
            .await?;
        if response.status() == StatusCode::NOT_FOUND {
            return Ok(None);
        }
        let method = response.error_for_status()?.json().await?;
        Ok(Some(method))
    }

    async fn charge(&self, request: &ChargeRequest) -> Result<ChargeOutcome> {
        let url = format!("{}/charges", self.base);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.api_key)
            .header("Idempotency-Key", request.order_id.to_string())
            .json(request)
            .send()
            .await?;

        match response.status() {
            StatusCode::PAYMENT_REQUIRED | StatusCode::UNPROCESSABLE_ENTITY => {
                let declined: ChargeDeclined = response.json().await.unwrap_or_default();
                Ok(ChargeOutcome::Declined {
                    reason: declined
                        .reason
                        .unwrap_or_else(|| "declined by gateway".to_string()),
                })
            }
            status if status.is_success() => {
                let approved: ChargeApproved = response.json().await?;
                Ok(ChargeOutcome::Approved {
                    transaction_ref: approved.transaction_ref,
                })
            }
            status => Err(anyhow!("payment gateway answered {status}")),
        }
    }
}
