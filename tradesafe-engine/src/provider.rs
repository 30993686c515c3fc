//! Escrow Payment Provider - the external funding/refund/payout rail
//!
//! The engine never talks to card capture or payout rails directly; it goes
//! through this trait. Without a configured provider the deterministic dev
//! stub marks orders funded immediately, and the engine treats that
//! identically to a real provider response.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::info;
use uuid::Uuid;

use crate::error::EngineError;
use crate::EngineResult;

/// Opaque reference returned by the provider for a funded escrow
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderRef(pub String);

/// Configuration for the HTTP-backed provider
#[derive(Debug, Clone)]
pub struct ProviderConfig {
    /// Base URL of the provider API
    pub base_url: String,
    /// Bounded per-request timeout; on timeout the triggering transition
    /// is left uncommitted and the caller retries
    pub request_timeout_secs: u64,
}

impl Default for ProviderConfig {
    fn default() -> Self {
        Self {
            base_url: "https://pay.example.com".to_string(),
            request_timeout_secs: 10,
        }
    }
}

/// Abstract escrow payment rail
#[async_trait]
pub trait EscrowPaymentProvider: Send + Sync {
    /// Collect and hold the buyer's funds for an order
    async fn fund_escrow(
        &self,
        order_id: Uuid,
        amount_cents: i64,
        currency: &str,
    ) -> EngineResult<ProviderRef>;

    /// Return held funds to the buyer, fully or partially
    async fn refund(&self, provider_ref: &ProviderRef, amount_cents: Option<i64>)
        -> EngineResult<()>;

    /// Release held funds out of escrow
    async fn payout(&self, provider_ref: &ProviderRef) -> EngineResult<()>;
}

/// Deterministic dev-mode stub: every call succeeds immediately
#[derive(Debug, Default)]
pub struct DevStubProvider;

#[async_trait]
impl EscrowPaymentProvider for DevStubProvider {
    async fn fund_escrow(
        &self,
        order_id: Uuid,
        amount_cents: i64,
        _currency: &str,
    ) -> EngineResult<ProviderRef> {
        info!(
            "Dev stub funded escrow for order {} ({} cents)",
            order_id, amount_cents
        );
        Ok(ProviderRef(format!("dev_{}", Uuid::new_v4().simple())))
    }

    async fn refund(
        &self,
        provider_ref: &ProviderRef,
        _amount_cents: Option<i64>,
    ) -> EngineResult<()> {
        info!("Dev stub refunded {}", provider_ref.0);
        Ok(())
    }

    async fn payout(&self, provider_ref: &ProviderRef) -> EngineResult<()> {
        info!("Dev stub paid out {}", provider_ref.0);
        Ok(())
    }
}

#[derive(Debug, Serialize)]
struct FundRequest<'a> {
    order_id: Uuid,
    amount_cents: i64,
    currency: &'a str,
}

#[derive(Debug, Deserialize)]
struct FundResponse {
    reference: String,
}

#[derive(Debug, Serialize)]
struct RefundRequest<'a> {
    reference: &'a str,
    #[serde(skip_serializing_if = "Option::is_none")]
    amount_cents: Option<i64>,
}

#[derive(Debug, Serialize)]
struct PayoutRequest<'a> {
    reference: &'a str,
}

/// HTTP-backed provider client with a bounded request timeout
pub struct HttpProvider {
    config: ProviderConfig,
    client: reqwest::Client,
}

impl HttpProvider {
    pub fn new(config: ProviderConfig) -> EngineResult<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .map_err(|e| EngineError::upstream(format!("Provider client init failed: {}", e)))?;

        Ok(Self { config, client })
    }

    fn url(&self, path: &str) -> String {
        format!("{}{}", self.config.base_url.trim_end_matches('/'), path)
    }
}

#[async_trait]
impl EscrowPaymentProvider for HttpProvider {
    async fn fund_escrow(
        &self,
        order_id: Uuid,
        amount_cents: i64,
        currency: &str,
    ) -> EngineResult<ProviderRef> {
        let body = FundRequest {
            order_id,
            amount_cents,
            currency,
        };
        let response = self
            .client
            .post(self.url("/escrow/fund"))
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::upstream(format!("Fund request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(EngineError::upstream(format!(
                "Fund request rejected with status {}",
                response.status()
            )));
        }

        let parsed: FundResponse = response
            .json()
            .await
            .map_err(|e| EngineError::upstream(format!("Fund response unreadable: {}", e)))?;

        Ok(ProviderRef(parsed.reference))
    }

    async fn refund(
        &self,
        provider_ref: &ProviderRef,
        amount_cents: Option<i64>,
    ) -> EngineResult<()> {
        let body = RefundRequest {
            reference: &provider_ref.0,
            amount_cents,
        };
        let response = self
            .client
            .post(self.url("/escrow/refund"))
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::upstream(format!("Refund request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(EngineError::upstream(format!(
                "Refund rejected with status {}",
                response.status()
            )));
        }
        Ok(())
    }

    async fn payout(&self, provider_ref: &ProviderRef) -> EngineResult<()> {
        let body = PayoutRequest {
            reference: &provider_ref.0,
        };
        let response = self
            .client
            .post(self.url("/escrow/payout"))
            .json(&body)
            .send()
            .await
            .map_err(|e| EngineError::upstream(format!("Payout request failed: {}", e)))?;

        if !response.status().is_success() {
            return Err(EngineError::upstream(format!(
                "Payout rejected with status {}",
                response.status()
            )));
        }
        Ok(())
    }
}
