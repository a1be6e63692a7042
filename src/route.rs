//! Route descriptors: per-endpoint pricing, recipients and credit policy.
//!
//! Grounded on the teacher's `PriceTag`/`X402Middleware` configuration surface
//! (`crates/x402-axum/src/layer.rs`), generalized from "one price tag set per
//! middleware instance" to "one descriptor per proxied route, loaded from
//! [`crate::config::GatewayConfig`]".

use std::collections::HashSet;

/// HTTP statuses that trigger credit issuance by default (spec §3).
pub fn default_credit_status_codes() -> HashSet<u16> {
    [500u16, 502, 503, 504].into_iter().collect()
}

#[derive(Debug, Clone)]
pub struct CreditPolicy {
    pub credit_on_status_codes: HashSet<u16>,
    pub max_credits_per_payer: u32,
    pub credit_ttl_seconds: u64,
}

impl Default for CreditPolicy {
    fn default() -> Self {
        Self {
            credit_on_status_codes: default_credit_status_codes(),
            max_credits_per_payer: 10,
            credit_ttl_seconds: 86_400,
        }
    }
}

/// A protected route behind the gateway.
#[derive(Debug, Clone)]
pub struct RouteDescriptor {
    pub route_key: String,
    pub backend_base_url: String,
    pub backend_key_ref: String,
    pub backend_key_header: String,
    /// Price, in 6-decimal atomic units (spec §3).
    pub price_atomic: u64,
    pub display_price: String,
    pub pay_to_evm: Option<String>,
    pub pay_to_svm: Option<String>,
    pub description: String,
    pub mime_type: String,
    pub credit_policy: CreditPolicy,
}

impl RouteDescriptor {
    /// The recipient address to advertise/verify against for a given VM family,
    /// honoring the precedence rules in spec §4.2 (facilitator recipient wins for
    /// EVM-via-facilitator networks; this method returns the route-level default
    /// and callers apply the facilitator override separately).
    pub fn pay_to_for(&self, vm: crate::network::Vm) -> Option<&str> {
        match vm {
            crate::network::Vm::Evm => self.pay_to_evm.as_deref(),
            crate::network::Vm::Svm => self.pay_to_svm.as_deref(),
        }
    }
}
