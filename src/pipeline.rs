//! The request-scoped pipeline orchestrator (spec §4.6).
//!
//! Grounded on the teacher's `X402Paygate::handle_request` in
//! `crates/x402-axum/src/layer.rs`, which chains "extract header → verify → call
//! inner handler → settle → stamp response header" as a single straight-line async
//! function. This orchestrator generalizes that chain into the state machine spec'd
//! in §4.6: idempotency short-circuit, a credit-or-settle branch once a payment
//! verifies, and nonce release on settlement failure.

use std::sync::Arc;

use base64::Engine;

use crate::network::NetworkRegistry;
use crate::payment::challenge::{build_challenge, find_matching_requirement, ChallengeReason};
use crate::payment::types::{PaymentEnvelope, PaymentRequiredBody, Scheme, SettlementReceipt};
use crate::route::RouteDescriptor;
use crate::settle::Settler;
use crate::store::{CreditStore, IdempotencyStore, IdempotentOutcome, NonceStore};
use crate::verify::Verifier;

/// What the caller (`server::payment_gate`) should do with the request next.
pub enum PipelineOutcome {
    /// Emit a `402 Payment Required` with this body.
    Challenge(PaymentRequiredBody),
    /// A prior request with the same `payment-identifier` already settled; replay its
    /// receipt and let the backend be called again without re-settling (I2).
    ProceedWithCachedReceipt {
        receipt_header: String,
    },
    /// The payer had a standing credit; it was consumed instead of requiring a new
    /// on-chain settlement (I4).
    ProceedWithCredit {
        receipt_header: String,
        payer: String,
    },
    /// A fresh payment was verified and settled on-chain (or via facilitator).
    ProceedWithSettlement {
        receipt_header: String,
        payer: String,
        payment_id: Option<String>,
    },
}

pub struct Pipeline {
    registry: Arc<NetworkRegistry>,
    verifier: Arc<Verifier>,
    settler: Arc<Settler>,
    nonce_store: Arc<NonceStore>,
    idempotency_store: Arc<IdempotencyStore>,
    credit_store: Arc<CreditStore>,
}

impl Pipeline {
    pub fn new(
        registry: Arc<NetworkRegistry>,
        verifier: Arc<Verifier>,
        settler: Arc<Settler>,
        nonce_store: Arc<NonceStore>,
        idempotency_store: Arc<IdempotencyStore>,
        credit_store: Arc<CreditStore>,
    ) -> Self {
        Self {
            registry,
            verifier,
            settler,
            nonce_store,
            idempotency_store,
            credit_store,
        }
    }

    /// Runs the pipeline for one inbound request. `payment_header` is the raw value
    /// of the client's `Payment-Signature`/`X-Payment` header, if present.
    pub async fn handle(
        &self,
        route: &RouteDescriptor,
        resource: &str,
        payment_header: Option<&str>,
    ) -> PipelineOutcome {
        let Some(header_value) = payment_header else {
            return PipelineOutcome::Challenge(build_challenge(
                &self.registry,
                route,
                resource,
                Some(ChallengeReason::NoPaymentHeader),
            ));
        };

        let envelope = match PaymentEnvelope::decode(header_value) {
            Ok(envelope) => envelope,
            Err(err) => {
                tracing::debug!(error = %err, "malformed payment header");
                return PipelineOutcome::Challenge(build_challenge(
                    &self.registry,
                    route,
                    resource,
                    Some(ChallengeReason::MalformedPaymentHeader),
                ));
            }
        };

        if let Some(payment_id) = envelope.payment_id() {
            match self.idempotency_store.lookup(payment_id).await {
                Ok(Some(cached)) => {
                    return PipelineOutcome::ProceedWithCachedReceipt {
                        receipt_header: cached
                            .settlement_receipt_base64
                            .unwrap_or(cached.body_base64),
                    };
                }
                Ok(None) => {}
                Err(err) => {
                    tracing::warn!(error = %err, "idempotency lookup failed, proceeding as uncached");
                }
            }
        }

        let challenge = build_challenge(&self.registry, route, resource, None);
        let Some(requirement) = find_matching_requirement(&challenge, Scheme::Exact, &envelope.network)
        else {
            return PipelineOutcome::Challenge(build_challenge(
                &self.registry,
                route,
                resource,
                Some(ChallengeReason::NoMatchingRequirements),
            ));
        };

        let verified = match self.verifier.verify(&envelope, requirement).await {
            Ok(verified) => verified,
            Err(err) => {
                tracing::info!(error = %err, route = %route.route_key, "payment verification failed");
                return PipelineOutcome::Challenge(build_challenge(
                    &self.registry,
                    route,
                    resource,
                    Some(ChallengeReason::VerificationFailed),
                ));
            }
        };

        // I4: a verified payment is settled on-chain XOR a standing credit is
        // consumed, never both. Consuming a credit skips nonce reservation entirely,
        // so the authorization remains unspent and the payer can resubmit it (or a
        // fresh one) freely (spec §4.6 ordering rules).
        match self.credit_store.try_spend(route, &verified.payer).await {
            Ok(true) => {
                let receipt = SettlementReceipt {
                    success: true,
                    tx_hash: String::new(),
                    network: envelope.network.clone(),
                    block_number: None,
                    facilitator: None,
                };
                return PipelineOutcome::ProceedWithCredit {
                    receipt_header: receipt.encode(),
                    payer: verified.payer,
                };
            }
            Ok(false) => {}
            Err(err) => {
                tracing::warn!(error = %err, "credit balance check failed, proceeding to settlement");
            }
        }

        // Nonce reservation happens only on the settlement path, after the credit
        // check has had a chance to short-circuit it (spec §4.6).
        if let Err(err) = self.nonce_store.claim(&envelope.network.0, &verified.nonce_key).await {
            tracing::info!(error = %err, route = %route.route_key, "nonce reservation failed");
            return PipelineOutcome::Challenge(build_challenge(
                &self.registry,
                route,
                resource,
                Some(ChallengeReason::VerificationFailed),
            ));
        }

        match self.settler.settle(&envelope, requirement).await {
            Ok(receipt) => {
                if let Err(err) = self.nonce_store.confirm(&envelope.network.0, &verified.nonce_key).await {
                    tracing::warn!(error = %err, "nonce confirmation write failed; on-chain state remains canonical");
                }
                let receipt_header = receipt.encode();
                if let Some(payment_id) = envelope.payment_id() {
                    let outcome = IdempotentOutcome {
                        status: 200,
                        body_base64: base64::engine::general_purpose::STANDARD.encode(b"{}"),
                        settlement_receipt_base64: Some(receipt_header.clone()),
                    };
                    if let Err(err) = self.idempotency_store.store(payment_id, &outcome).await {
                        tracing::warn!(error = %err, "failed to cache idempotent settlement outcome");
                    }
                }
                PipelineOutcome::ProceedWithSettlement {
                    receipt_header,
                    payer: verified.payer,
                    payment_id: envelope.payment_id().map(str::to_string),
                }
            }
            Err(err) => {
                tracing::warn!(error = %err, route = %route.route_key, "settlement failed, releasing nonce");
                if let Err(release_err) = self
                    .nonce_store
                    .release(&envelope.network.0, &verified.nonce_key)
                    .await
                {
                    tracing::warn!(error = %release_err, "failed to release nonce after settlement failure");
                }
                PipelineOutcome::Challenge(build_challenge(
                    &self.registry,
                    route,
                    resource,
                    Some(ChallengeReason::SettlementFailed),
                ))
            }
        }
    }

    /// Called after the backend has responded to a settled (non-credit, non-cached)
    /// request. Issues a compensating credit if the backend's status is one the
    /// route's credit policy treats as its fault, not the payer's (spec §3, §8
    /// scenario 5).
    pub async fn record_backend_outcome(
        &self,
        route: &RouteDescriptor,
        payer: &str,
        backend_status: u16,
    ) {
        if !route.credit_policy.credit_on_status_codes.contains(&backend_status) {
            return;
        }
        match self.credit_store.issue(route, payer).await {
            Ok(balance) => {
                tracing::info!(payer, route = %route.route_key, balance, "issued compensating credit for backend failure");
            }
            Err(err) => {
                tracing::warn!(payer, route = %route.route_key, error = %err, "failed to issue compensating credit");
            }
        }
    }
}
