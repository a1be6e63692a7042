//! HTTP client for an external verify/settle facilitator.
//!
//! Grounded on the teacher's `crates/x402-axum/src/facilitator_client.rs`
//! `FacilitatorClient`: precomputed `verify`/`settle` URLs, a shared `reqwest::Client`
//! with default headers carrying the API key, generic `post_json` helper, and one
//! `thiserror` variant per failure mode so callers can tell a transport failure from
//! an HTTP-status failure from a deserialization failure.

use std::time::Duration;

use reqwest::header::{HeaderMap, HeaderValue, AUTHORIZATION};
use serde::{de::DeserializeOwned, Serialize};
use url::Url;

#[derive(Debug, thiserror::Error)]
pub enum FacilitatorClientError {
    #[error("failed to parse facilitator base URL: {0}")]
    UrlParse(#[from] url::ParseError),
    #[error("facilitator request failed: {0}")]
    Http(#[source] reqwest::Error),
    #[error("facilitator returned status {status}: {body}")]
    HttpStatus { status: u16, body: String },
    #[error("failed to deserialize facilitator response: {0}")]
    JsonDeserialization(#[source] reqwest::Error),
}

/// An external facilitator's `/verify` and `/settle` JSON contract (spec §4.1, §6).
/// Kept deliberately close to the request/response shape the x402 ecosystem already
/// converged on (teacher's `VerifyRequest`/`SettleRequest`/`VerifyResponse`/
/// `SettleResponse` in `src/types.rs`) so this client can talk to a real third-party
/// facilitator without translation.
#[derive(Clone)]
pub struct FacilitatorClient {
    verify_url: Url,
    settle_url: Url,
    client: reqwest::Client,
}

impl FacilitatorClient {
    pub fn try_new(base_url: &str, api_key: &str) -> Result<Self, FacilitatorClientError> {
        let base = Url::parse(base_url)?;
        let verify_url = base.join("verify")?;
        let settle_url = base.join("settle")?;
        let mut headers = HeaderMap::new();
        let mut auth = HeaderValue::try_from(format!("Bearer {api_key}")).map_err(|_| {
            FacilitatorClientError::HttpStatus {
                status: 0,
                body: "invalid facilitator API key header value".to_string(),
            }
        })?;
        auth.set_sensitive(true);
        headers.insert(AUTHORIZATION, auth);
        let client = reqwest::Client::builder()
            .default_headers(headers)
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(FacilitatorClientError::Http)?;
        Ok(Self {
            verify_url,
            settle_url,
            client,
        })
    }

    async fn post_json<T: Serialize + ?Sized, R: DeserializeOwned>(
        &self,
        url: &Url,
        body: &T,
    ) -> Result<R, FacilitatorClientError> {
        let response = self
            .client
            .post(url.clone())
            .json(body)
            .send()
            .await
            .map_err(FacilitatorClientError::Http)?;
        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(FacilitatorClientError::HttpStatus {
                status: status.as_u16(),
                body,
            });
        }
        response
            .json::<R>()
            .await
            .map_err(FacilitatorClientError::JsonDeserialization)
    }

    pub async fn verify(
        &self,
        envelope: &crate::payment::types::PaymentEnvelope,
        requirement: &crate::payment::types::PaymentRequirement,
    ) -> Result<FacilitatorVerifyResponse, FacilitatorClientError> {
        let request = serde_json::json!({
            "paymentPayload": envelope,
            "paymentRequirements": requirement,
        });
        self.post_json(&self.verify_url, &request).await
    }

    pub async fn settle(
        &self,
        envelope: &crate::payment::types::PaymentEnvelope,
        requirement: &crate::payment::types::PaymentRequirement,
    ) -> Result<FacilitatorSettleResponse, FacilitatorClientError> {
        let request = serde_json::json!({
            "paymentPayload": envelope,
            "paymentRequirements": requirement,
        });
        self.post_json(&self.settle_url, &request).await
    }
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacilitatorVerifyResponse {
    pub is_valid: bool,
    #[serde(default)]
    pub invalid_reason: Option<String>,
    #[serde(default)]
    pub payer: Option<String>,
}

#[derive(Debug, Clone, serde::Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FacilitatorSettleResponse {
    pub success: bool,
    #[serde(default)]
    pub error_reason: Option<String>,
    #[serde(default)]
    pub transaction: Option<String>,
    #[serde(default)]
    pub payer: Option<String>,
}
