//! Axum routing and the payment-gate request handler.
//!
//! The teacher implements the payment gate as a generic `tower::Layer`/`Service`
//! (`X402MiddlewareService<F>` in `crates/x402-axum/src/layer.rs`) so it can wrap an
//! arbitrary inner Axum app per-route. This gateway's route set is itself
//! config-driven (`GatewayConfig::routes`), so a single handler dispatching on the
//! matched [`crate::route::RouteDescriptor`] serves the same purpose with less
//! machinery — the `Pipeline`/`BackendClient` split below is where the teacher's
//! `X402Paygate::handle_request` logic actually lives (decision recorded in
//! `DESIGN.md`).

use std::collections::HashMap;
use std::sync::Arc;

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::http::{HeaderMap, Method, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::any;
use axum::Router;
use base64::Engine;

use crate::backend::BackendClient;
use crate::credit_task::CreditTaskHandle;
use crate::pipeline::{Pipeline, PipelineOutcome};
use crate::route::RouteDescriptor;

const PAYMENT_HEADER: &str = "payment-signature";
const PAYMENT_HEADER_ALT: &str = "x-payment";
const RECEIPT_HEADER: &str = "payment-response";
const CHALLENGE_HEADER: &str = "payment-required";

pub struct AppState {
    pub routes: HashMap<String, RouteDescriptor>,
    pub pipeline: Arc<Pipeline>,
    pub backend: BackendClient,
    pub credit_task: CreditTaskHandle,
}

pub fn router(state: Arc<AppState>) -> Router {
    Router::new()
        .route("/healthz", any(health))
        .route("/{route_key}", any(gateway_handler))
        .route("/{route_key}/{*rest}", any(gateway_handler))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

async fn gateway_handler(
    State(state): State<Arc<AppState>>,
    Path(route_key): Path<String>,
    headers: HeaderMap,
    method: Method,
    body: Bytes,
) -> Response {
    let Some(route) = state.routes.get(&route_key) else {
        return StatusCode::NOT_FOUND.into_response();
    };

    // Axum's HeaderMap lookups are already case-insensitive per name; clients may
    // use either header name (spec §6), so both are checked in order.
    let payment_header = headers
        .get(PAYMENT_HEADER)
        .or_else(|| headers.get(PAYMENT_HEADER_ALT))
        .and_then(|v| v.to_str().ok());
    let resource = format!("/{route_key}");

    match state.pipeline.handle(route, &resource, payment_header).await {
        PipelineOutcome::Challenge(body) => {
            let header_value = body.header_base64();
            let json = serde_json::to_vec(&body).expect("PaymentRequiredBody always serializes");
            (
                StatusCode::PAYMENT_REQUIRED,
                [
                    ("content-type", "application/json"),
                    (CHALLENGE_HEADER, header_value.as_str()),
                ],
                json,
            )
                .into_response()
        }
        PipelineOutcome::ProceedWithCachedReceipt { receipt_header } => {
            forward(&state, route, &resource, method, body, &receipt_header, None).await
        }
        PipelineOutcome::ProceedWithCredit {
            receipt_header,
            payer,
        } => forward(&state, route, &resource, method, body, &receipt_header, Some(payer)).await,
        PipelineOutcome::ProceedWithSettlement {
            receipt_header,
            payer,
            payment_id: _,
        } => forward(&state, route, &resource, method, body, &receipt_header, Some(payer)).await,
    }
}

async fn forward(
    state: &Arc<AppState>,
    route: &RouteDescriptor,
    resource: &str,
    method: Method,
    body: Bytes,
    receipt_header: &str,
    payer: Option<String>,
) -> Response {
    match state.backend.forward(route, resource, method, body).await {
        Ok(backend_response) => {
            if let Some(payer) = payer {
                state.credit_task.record_backend_outcome(
                    route.clone(),
                    payer,
                    backend_response.status.as_u16(),
                );
            }
            let mut response = Response::builder().status(backend_response.status);
            for (name, value) in backend_response.headers.iter() {
                response = response.header(name, value);
            }
            response = response.header(RECEIPT_HEADER, receipt_header);
            response
                .body(axum::body::Body::from(backend_response.body))
                .unwrap_or_else(|_| StatusCode::INTERNAL_SERVER_ERROR.into_response())
        }
        Err(err) => {
            tracing::error!(error = %err, route = %route.route_key, "backend forwarding failed");
            StatusCode::BAD_GATEWAY.into_response()
        }
    }
}

/// Decodes a client-supplied `payment-response` header, used only in tests to assert
/// on the receipt a successful request carries.
#[cfg(test)]
pub fn decode_receipt(header_value: &str) -> crate::payment::types::SettlementReceipt {
    let bytes = base64::engine::general_purpose::STANDARD
        .decode(header_value)
        .expect("valid base64 receipt in tests");
    serde_json::from_slice(&bytes).expect("valid receipt JSON in tests")
}
