//! Thin reverse-proxy call to the protected backend.
//!
//! Out of the core's scope per spec §1 ("the backend reverse-proxy layer" is listed
//! as an external collaborator), but a gateway with nothing behind it cannot exercise
//! the pipeline end-to-end, so `SPEC_FULL.md` adds this minimal forwarder. Grounded
//! on the teacher's plain `reqwest::Client` usage pattern in
//! `crates/x402-axum/src/facilitator_client.rs`: one shared client, one typed error.
//! It deliberately does nothing the pipeline cares about — no retries, no header
//! rewriting beyond injecting the backend credential x402 hides from the client.

use axum::body::Bytes;
use axum::http::{HeaderMap, HeaderName, Method, StatusCode};

#[derive(Debug, thiserror::Error)]
pub enum BackendError {
    #[error("backend request failed: {0}")]
    Http(#[source] reqwest::Error),
    #[error("invalid backend credential header name: {0}")]
    InvalidHeaderName(String),
}

#[derive(Clone)]
pub struct BackendClient {
    client: reqwest::Client,
}

impl BackendClient {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    /// Forwards the request to `route.backend_base_url`, replacing whatever
    /// credential the client sent (none — x402 is the client's only credential) with
    /// the route's configured backend key, injected under `backend_key_header`. The
    /// backend never sees x402 exists (spec §1).
    pub async fn forward(
        &self,
        route: &crate::route::RouteDescriptor,
        path_and_query: &str,
        method: Method,
        body: Bytes,
    ) -> Result<BackendResponse, BackendError> {
        let url = format!(
            "{}{}",
            route.backend_base_url.trim_end_matches('/'),
            path_and_query
        );
        let header_name = HeaderName::try_from(route.backend_key_header.as_str())
            .map_err(|_| BackendError::InvalidHeaderName(route.backend_key_header.clone()))?;
        let response = self
            .client
            .request(method, &url)
            .header(header_name, &route.backend_key_ref)
            .body(body)
            .send()
            .await
            .map_err(BackendError::Http)?;
        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(BackendError::Http)?;
        Ok(BackendResponse {
            status,
            headers,
            body,
        })
    }
}

impl Default for BackendClient {
    fn default() -> Self {
        Self::new()
    }
}

pub struct BackendResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}
