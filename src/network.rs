//! Known blockchain networks and the active-network registry.
//!
//! Mirrors the shape of the teacher's network registry (`src/networks.rs`,
//! `src/known.rs`): a static, immutable table keyed by a chain-agnostic identifier,
//! exposed through a lookup/active-view interface rather than a mutable collection.
//! Unlike the teacher, a network here additionally carries optional external-facilitator
//! routing and is "active" only once its RPC endpoint (and, for SVM, fee-payer key) has
//! been supplied via configuration — see [`NetworkRegistry::active`].

use std::collections::HashMap;
use std::fmt;

use serde::{Deserialize, Serialize};
use url::Url;

/// Virtual-machine family a network belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Vm {
    Evm,
    Svm,
}

/// A CAIP-2-style chain identifier, e.g. `"eip155:8453"` or `"solana:<genesis>"`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct NetworkId(pub String);

impl fmt::Display for NetworkId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<&str> for NetworkId {
    fn from(value: &str) -> Self {
        NetworkId(value.to_string())
    }
}

/// EIP-712 domain hints for a token, used when verifying EVM signatures locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Eip712Hints {
    pub name: String,
    pub version: String,
}

/// The token accepted for payment on a given network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TokenInfo {
    pub address: String,
    pub name: String,
    pub version: Option<String>,
    pub decimals: u8,
}

/// Descriptor of an external facilitator this network should route through,
/// instead of verifying/settling locally.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FacilitatorDescriptor {
    pub url: Url,
    pub api_key_ref: String,
    pub external_network_name: String,
    pub external_recipient: String,
    pub external_protocol_version: String,
}

/// Immutable description of one supported network.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NetworkDescriptor {
    pub id: NetworkId,
    pub vm: Vm,
    pub chain_numeric: Option<u64>,
    pub rpc_url_ref: String,
    pub token: TokenInfo,
    pub eip712: Option<Eip712Hints>,
    pub facilitator: Option<FacilitatorDescriptor>,
    /// Config key for the SVM fee-payer keypair; `None` for EVM networks.
    pub fee_payer_ref: Option<String>,
}

#[derive(Debug, thiserror::Error)]
pub enum NetworkConfigError {
    #[error("token decimals must be >= 6 (got {decimals} for network {network})")]
    DecimalsTooNarrow { network: NetworkId, decimals: u8 },
    #[error("amount {price_atomic} scaled by 10^{exponent} overflows u128")]
    AmountOverflow { price_atomic: u64, exponent: u32 },
}

/// The registry of all known networks, plus which of their dependencies
/// (RPC endpoint, fee-payer key) have actually been configured.
#[derive(Debug, Clone)]
pub struct NetworkRegistry {
    networks: HashMap<NetworkId, NetworkDescriptor>,
    configured_rpc: HashMap<String, Url>,
    configured_fee_payers: HashMap<String, ()>,
}

impl NetworkRegistry {
    /// Builds a registry from a static table plus which config keys were actually
    /// supplied. Returns an error if any token's decimal width is narrower than the
    /// 6-decimal atomic unit prices are quoted in (spec §4.1).
    pub fn new(
        networks: Vec<NetworkDescriptor>,
        configured_rpc: HashMap<String, Url>,
        configured_fee_payers: HashMap<String, ()>,
    ) -> Result<Self, NetworkConfigError> {
        let mut map = HashMap::with_capacity(networks.len());
        for descriptor in networks {
            if descriptor.token.decimals < 6 {
                return Err(NetworkConfigError::DecimalsTooNarrow {
                    network: descriptor.id.clone(),
                    decimals: descriptor.token.decimals,
                });
            }
            map.insert(descriptor.id.clone(), descriptor);
        }
        Ok(Self {
            networks: map,
            configured_rpc,
            configured_fee_payers,
        })
    }

    /// Returns a descriptor by id, regardless of whether it is currently active.
    pub fn lookup(&self, id: &NetworkId) -> Option<&NetworkDescriptor> {
        self.networks.get(id)
    }

    /// A network is active only if its RPC endpoint is configured, and, for SVM
    /// networks, its fee-payer key is also configured. This is a read-only filtered
    /// view, never a mutation of the underlying table (spec §4.1, REDESIGN FLAGS).
    pub fn active(&self) -> impl Iterator<Item = &NetworkDescriptor> {
        self.networks.values().filter(move |d| self.is_active(d))
    }

    pub fn is_active(&self, descriptor: &NetworkDescriptor) -> bool {
        if !self.configured_rpc.contains_key(&descriptor.rpc_url_ref) {
            return false;
        }
        if descriptor.vm == Vm::Svm {
            let Some(fee_payer_ref) = &descriptor.fee_payer_ref else {
                return false;
            };
            if !self.configured_fee_payers.contains_key(fee_payer_ref) {
                return false;
            }
        }
        true
    }

    pub fn rpc_url(&self, descriptor: &NetworkDescriptor) -> Option<&Url> {
        self.configured_rpc.get(&descriptor.rpc_url_ref)
    }

    pub fn is_svm(descriptor: &NetworkDescriptor) -> bool {
        descriptor.vm == Vm::Svm
    }

    /// Selection precedence from spec §4.1: a configured facilitator always wins
    /// over local verification/settlement for EVM networks; SVM always uses the
    /// SVM path regardless of any facilitator field.
    pub fn uses_external_facilitator(descriptor: &NetworkDescriptor) -> bool {
        descriptor.vm == Vm::Evm && descriptor.facilitator.is_some()
    }
}

/// Scales a route's 6-decimal atomic price into the wire-level atomic amount for a
/// token with `decimals` decimal places: `priceAtomic * 10^(decimals - 6)`.
///
/// `decimals < 6` is rejected earlier, at registry construction (spec §4.1), so this
/// function only has to handle the `>= 6` branch; it remains a `Result` so overflow
/// for absurdly large tokens/prices is reported rather than panicking.
pub fn scaled_amount(price_atomic: u64, decimals: u8) -> Result<u128, NetworkConfigError> {
    let exponent = (decimals as u32).saturating_sub(6);
    10u128
        .checked_pow(exponent)
        .and_then(|scale| (price_atomic as u128).checked_mul(scale))
        .ok_or(NetworkConfigError::AmountOverflow {
            price_atomic,
            exponent,
        })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn identity_scaling_at_six_decimals() {
        assert_eq!(scaled_amount(10_000, 6).unwrap(), 10_000u128);
    }

    #[test]
    fn scales_up_to_eighteen_decimals() {
        // spec §8 scenario 3: priceAtomic = 10000, d = 18 => 10000 * 10^12 = 10^16
        assert_eq!(scaled_amount(10_000, 18).unwrap(), 10_000_000_000_000_000u128);
    }

    #[test]
    fn active_requires_rpc_and_fee_payer_for_svm() {
        let evm = NetworkDescriptor {
            id: NetworkId::from("eip155:8453"),
            vm: Vm::Evm,
            chain_numeric: Some(8453),
            rpc_url_ref: "RPC_BASE".into(),
            token: TokenInfo {
                address: "0x0000000000000000000000000000000000dEaD".into(),
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
        };
        let svm = NetworkDescriptor {
            id: NetworkId::from("solana:mainnet"),
            vm: Vm::Svm,
            chain_numeric: None,
            rpc_url_ref: "RPC_SOLANA".into(),
            token: TokenInfo {
                address: "EPjFWdd5AufqSSqeM2qN1xzybapC8G4wEGGkZwyTDt1v".into(),
                name: "USDC".into(),
                version: None,
                decimals: 6,
            },
            eip712: None,
            facilitator: None,
            fee_payer_ref: Some("SVM_FEE_PAYER".into()),
        };
        let mut rpc = HashMap::new();
        rpc.insert("RPC_BASE".to_string(), Url::parse("http://rpc").unwrap());
        rpc.insert(
            "RPC_SOLANA".to_string(),
            Url::parse("http://rpc-sol").unwrap(),
        );
        let registry =
            NetworkRegistry::new(vec![evm.clone(), svm.clone()], rpc, HashMap::new()).unwrap();
        assert!(registry.is_active(&evm));
        assert!(!registry.is_active(&svm), "missing fee payer must deactivate SVM");
        assert_eq!(registry.active().count(), 1);
    }

    #[test]
    fn rejects_sub_six_decimal_tokens() {
        let bad = NetworkDescriptor {
            id: NetworkId::from("eip155:1"),
            vm: Vm::Evm,
            chain_numeric: Some(1),
            rpc_url_ref: "RPC".into(),
            token: TokenInfo {
                address: "0x0".into(),
                name: "X".into(),
                version: None,
                decimals: 2,
            },
            eip712: None,
            facilitator: None,
            fee_payer_ref: None,
        };
        let err = NetworkRegistry::new(vec![bad], HashMap::new(), HashMap::new()).unwrap_err();
        assert!(matches!(err, NetworkConfigError::DecimalsTooNarrow { .. }));
    }
}
