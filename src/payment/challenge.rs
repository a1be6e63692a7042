//! Builds the `402 Payment Required` challenge body.
//!
//! Grounded on the teacher's `gather_payment_requirements`/`PaymentOffers` in
//! `crates/x402-axum/src/layer.rs`: that function turns a middleware's configured
//! price tag into one `PaymentRequirements` entry per resource. Generalized here to
//! iterate every *active* network in the [`crate::network::NetworkRegistry`] that the
//! route accepts payment on, each becoming one `accepts[]` entry, and to factor in the
//! facilitator's recipient/asset override when a network routes through one (spec §4.1).

use crate::network::{scaled_amount, NetworkDescriptor, NetworkRegistry, Vm};
use crate::payment::types::{
    ChallengeExtensions, MixedAddress, PaymentRequirement, PaymentRequiredBody,
};
use crate::route::RouteDescriptor;

/// Reasons a request reaches the challenge builder without a usable payment
/// already attached (spec §4.6 `AwaitingPayment` / `Rejected` transitions).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChallengeReason {
    NoPaymentHeader,
    MalformedPaymentHeader,
    NoMatchingRequirements,
    VerificationFailed,
    SettlementFailed,
}

impl ChallengeReason {
    fn error_code(self) -> &'static str {
        match self {
            ChallengeReason::NoPaymentHeader => "payment_header_required",
            ChallengeReason::MalformedPaymentHeader => "invalid_payment_header",
            ChallengeReason::NoMatchingRequirements => "no_matching_payment_requirements",
            ChallengeReason::VerificationFailed => "verification_failed",
            ChallengeReason::SettlementFailed => "settlement_failed",
        }
    }

    fn message(self) -> &'static str {
        match self {
            ChallengeReason::NoPaymentHeader => "payment is required to access this resource",
            ChallengeReason::MalformedPaymentHeader => "the payment header could not be parsed",
            ChallengeReason::NoMatchingRequirements => {
                "no accepted payment requirement matches the submitted payment"
            }
            ChallengeReason::VerificationFailed => "the submitted payment failed verification",
            ChallengeReason::SettlementFailed => "settlement of the submitted payment failed",
        }
    }
}

/// Builds the `accepts` entry for one active network (spec §4.2), honoring the
/// facilitator recipient/asset override precedence from spec §4.1.
fn requirement_for(
    route: &RouteDescriptor,
    descriptor: &NetworkDescriptor,
    resource: &str,
) -> Result<PaymentRequirement, crate::network::NetworkConfigError> {
    let amount = scaled_amount(route.price_atomic, descriptor.token.decimals)?;
    let (pay_to, asset) = match &descriptor.facilitator {
        Some(facilitator) => (
            facilitator.external_recipient.clone(),
            descriptor.token.address.clone(),
        ),
        None => (
            route
                .pay_to_for(descriptor.vm)
                .unwrap_or(&descriptor.token.address)
                .to_string(),
            descriptor.token.address.clone(),
        ),
    };
    Ok(PaymentRequirement {
        scheme: crate::payment::types::Scheme::Exact,
        network: descriptor.id.clone(),
        max_amount_required: amount.to_string(),
        amount: amount.to_string(),
        max_timeout_seconds: 3600,
        resource: resource.to_string(),
        description: route.description.clone(),
        mime_type: route.mime_type.clone(),
        pay_to: MixedAddress(pay_to),
        asset: MixedAddress(asset),
        extra: descriptor.eip712.as_ref().map(|hints| {
            serde_json::json!({ "name": hints.name, "version": hints.version })
        }),
    })
}

/// Builds the full 402 body for a route: one `accepts[]` entry per active network.
/// Networks whose amount scaling overflows are skipped with a `tracing::warn!`
/// rather than failing the whole response — a single misconfigured network should
/// not take down every other accepted payment rail (REDESIGN FLAGS).
pub fn build_challenge(
    registry: &NetworkRegistry,
    route: &RouteDescriptor,
    resource: &str,
    reason: Option<ChallengeReason>,
) -> PaymentRequiredBody {
    let mut accepts = Vec::new();
    for descriptor in registry.active() {
        if route.pay_to_for(descriptor.vm).is_none() && descriptor.facilitator.is_none() {
            continue;
        }
        match requirement_for(route, descriptor, resource) {
            Ok(req) => accepts.push(req),
            Err(err) => {
                tracing::warn!(
                    network = %descriptor.id,
                    route = %route.route_key,
                    error = %err,
                    "skipping network in 402 challenge: amount scaling failed"
                );
            }
        }
    }
    let (error, message) = match reason {
        Some(r) => (r.error_code().to_string(), r.message().to_string()),
        None => (
            "payment_header_required".to_string(),
            ChallengeReason::NoPaymentHeader.message().to_string(),
        ),
    };
    PaymentRequiredBody {
        x402_version: 1,
        error,
        message,
        reason: reason.map(|r| r.error_code().to_string()),
        accepts,
        extensions: ChallengeExtensions::default(),
    }
}

/// Picks the `accepts[]` entry (if any) matching an inbound envelope's declared
/// scheme/network, so the verifier can be invoked against the right requirement
/// (spec §4.6, teacher's `find_matching_payment_requirements`).
pub fn find_matching_requirement<'a>(
    body: &'a PaymentRequiredBody,
    scheme: crate::payment::types::Scheme,
    network: &crate::network::NetworkId,
) -> Option<&'a PaymentRequirement> {
    body.accepts
        .iter()
        .find(|r| r.scheme == scheme && &r.network == network)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::network::{Eip712Hints, TokenInfo};
    use crate::route::CreditPolicy;
    use std::collections::HashMap;

    fn base_desc() -> NetworkDescriptor {
        NetworkDescriptor {
            id: "eip155:8453".into(),
            vm: Vm::Evm,
            chain_numeric: Some(8453),
            rpc_url_ref: "RPC_BASE".into(),
            token: TokenInfo {
                address: "0x833589fCD6eDb6E08f4c7C32D4f71b54bdA02913".into(),
                name: "USDC".into(),
                version: Some("2".into()),
                decimals: 6,
            },
            eip712: Some(Eip712Hints {
                name: "USDC".into(),
                version: "2".into(),
            }),
            facilitator: None,
            fee_payer_ref: None,
        }
    }

    fn base_route() -> RouteDescriptor {
        RouteDescriptor {
            route_key: "weather".into(),
            backend_base_url: "http://localhost:9000".into(),
            backend_key_ref: "WEATHER_KEY".into(),
            backend_key_header: "Authorization".into(),
            price_atomic: 10_000,
            display_price: "$0.01".into(),
            pay_to_evm: Some("0x000000000000000000000000000000000000dEaD".into()),
            pay_to_svm: None,
            description: "weather forecast".into(),
            mime_type: "application/json".into(),
            credit_policy: CreditPolicy::default(),
        }
    }

    #[test]
    fn builds_one_accept_entry_per_active_network() {
        let mut rpc = HashMap::new();
        rpc.insert("RPC_BASE".to_string(), url::Url::parse("http://rpc").unwrap());
        let registry = NetworkRegistry::new(vec![base_desc()], rpc, HashMap::new()).unwrap();
        let body = build_challenge(&registry, &base_route(), "/weather", None);
        assert_eq!(body.accepts.len(), 1);
        assert_eq!(body.accepts[0].amount, "10000");
        assert_eq!(body.error, "payment_header_required");
    }

    #[test]
    fn inactive_networks_are_excluded() {
        let registry = NetworkRegistry::new(vec![base_desc()], HashMap::new(), HashMap::new())
            .unwrap();
        let body = build_challenge(&registry, &base_route(), "/weather", None);
        assert!(body.accepts.is_empty());
    }
}
