//! Process configuration, loaded once at startup.
//!
//! Grounded on the teacher's `src/config.rs`: a `clap`-parsed CLI pointing at a JSON
//! config file (`--config`/`CONFIG` env), a `Config` struct with serde field
//! defaults, and the `LiteralOrEnv<T>` wrapper that lets any string field in the file
//! be either a literal or an `$ENV_VAR`/`${ENV_VAR}` reference — carried over here
//! near-verbatim since secrets (RPC URLs, API keys, fee-payer keys) should never be
//! committed to the config file itself.

use std::collections::HashMap;
use std::fs;
use std::net::IpAddr;
use std::ops::Deref;
use std::path::PathBuf;

use clap::Parser;
use serde::{Deserialize, Deserializer};
use url::Url;

use crate::network::{Eip712Hints, FacilitatorDescriptor, NetworkDescriptor, NetworkId, TokenInfo, Vm};
use crate::route::{CreditPolicy, RouteDescriptor};

#[derive(Parser, Debug)]
#[command(name = "x402-gateway")]
#[command(about = "Self-hosted x402 payment gateway")]
pub struct CliArgs {
    #[arg(long, short, env = "CONFIG", default_value = "config.json")]
    pub config: PathBuf,
}

/// A transparent wrapper resolving `$VAR`/`${VAR}` environment references at
/// deserialization time, so a config file can name secrets without embedding them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LiteralOrEnv<T>(pub T);

impl<T> Deref for LiteralOrEnv<T> {
    type Target = T;
    fn deref(&self) -> &T {
        &self.0
    }
}

fn parse_env_var_syntax(s: &str) -> Option<String> {
    if let Some(inner) = s.strip_prefix("${").and_then(|s| s.strip_suffix('}')) {
        Some(inner.to_string())
    } else if let Some(name) = s.strip_prefix('$') {
        if !name.is_empty() && name.chars().all(|c| c.is_alphanumeric() || c == '_') {
            Some(name.to_string())
        } else {
            None
        }
    } else {
        None
    }
}

impl<'de> Deserialize<'de> for LiteralOrEnv<String> {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        match parse_env_var_syntax(&raw) {
            Some(var) => {
                let resolved = std::env::var(&var).map_err(|_| {
                    serde::de::Error::custom(format!("environment variable {var} is not set"))
                })?;
                Ok(LiteralOrEnv(resolved))
            }
            None => Ok(LiteralOrEnv(raw)),
        }
    }
}

fn default_port() -> u16 {
    8402
}

fn default_host() -> IpAddr {
    IpAddr::from([0, 0, 0, 0])
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_balance_read_failure_policy() -> BalanceReadFailurePolicy {
    BalanceReadFailurePolicy::FailOpen
}

/// Whether a transport error while reading a payer's on-chain balance should block
/// or allow verification to proceed. Decided in `DESIGN.md` (the spec's Open
/// Question): defaults to `FailOpen` because settlement itself will reject an
/// underfunded payer on-chain, so a transient RPC hiccup should not turn into a
/// denial of service for every request on that network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BalanceReadFailurePolicy {
    FailOpen,
    FailClosed,
}

#[derive(Debug, Deserialize)]
pub struct RawNetworkConfig {
    pub id: String,
    pub vm: Vm,
    pub chain_numeric: Option<u64>,
    pub rpc_url: LiteralOrEnv<String>,
    pub token_address: String,
    pub token_name: String,
    pub token_version: Option<String>,
    pub token_decimals: u8,
    pub fee_payer_key: Option<LiteralOrEnv<String>>,
    pub facilitator: Option<RawFacilitatorConfig>,
}

#[derive(Debug, Deserialize)]
pub struct RawFacilitatorConfig {
    pub url: Url,
    pub api_key: LiteralOrEnv<String>,
    pub external_network_name: String,
    pub external_recipient: String,
    pub external_protocol_version: String,
}

#[derive(Debug, Deserialize)]
pub struct RawRouteConfig {
    pub route_key: String,
    pub backend_base_url: String,
    pub backend_key: LiteralOrEnv<String>,
    #[serde(default = "default_backend_key_header")]
    pub backend_key_header: String,
    pub price_atomic: u64,
    pub display_price: String,
    pub pay_to_evm: Option<String>,
    pub pay_to_svm: Option<String>,
    pub description: String,
    #[serde(default = "default_mime_type")]
    pub mime_type: String,
    #[serde(default)]
    pub credit_policy: Option<RawCreditPolicyConfig>,
}

fn default_backend_key_header() -> String {
    "Authorization".to_string()
}

fn default_mime_type() -> String {
    "application/json".to_string()
}

#[derive(Debug, Deserialize)]
pub struct RawCreditPolicyConfig {
    pub credit_on_status_codes: Option<Vec<u16>>,
    pub max_credits_per_payer: Option<u32>,
    pub credit_ttl_seconds: Option<u64>,
}

#[derive(Debug, Deserialize)]
pub struct RawConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_host")]
    pub host: IpAddr,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default = "default_balance_read_failure_policy")]
    pub balance_read_failure_policy: BalanceReadFailurePolicy,
    pub kv_store_url: LiteralOrEnv<String>,
    pub kv_store_token: LiteralOrEnv<String>,
    #[serde(default)]
    pub networks: Vec<RawNetworkConfig>,
    #[serde(default)]
    pub routes: Vec<RawRouteConfig>,
}

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
    #[error("invalid RPC URL for network {network}: {source}")]
    InvalidRpcUrl {
        network: String,
        #[source]
        source: url::ParseError,
    },
    #[error(transparent)]
    Network(#[from] crate::network::NetworkConfigError),
}

pub struct GatewayConfig {
    pub port: u16,
    pub host: IpAddr,
    pub log_level: String,
    pub balance_read_failure_policy: BalanceReadFailurePolicy,
    pub kv_store_url: String,
    pub kv_store_token: String,
    pub networks: Vec<NetworkDescriptor>,
    pub configured_rpc: HashMap<String, Url>,
    pub configured_fee_payers: HashMap<String, String>,
    pub routes: Vec<RouteDescriptor>,
}

impl GatewayConfig {
    pub fn load(path: &PathBuf) -> Result<Self, ConfigError> {
        let raw_text = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.clone(),
            source,
        })?;
        let raw: RawConfig = serde_json::from_str(&raw_text).map_err(|source| ConfigError::Parse {
            path: path.clone(),
            source,
        })?;
        Self::from_raw(raw)
    }

    fn from_raw(raw: RawConfig) -> Result<Self, ConfigError> {
        let mut networks = Vec::with_capacity(raw.networks.len());
        let mut configured_rpc = HashMap::new();
        let mut configured_fee_payers = HashMap::new();

        for network in raw.networks {
            let rpc_url_ref = format!("rpc:{}", network.id);
            let url = Url::parse(&network.rpc_url.0).map_err(|source| ConfigError::InvalidRpcUrl {
                network: network.id.clone(),
                source,
            })?;
            configured_rpc.insert(rpc_url_ref.clone(), url);

            let fee_payer_ref = network.fee_payer_key.as_ref().map(|_| format!("fee_payer:{}", network.id));
            if let (Some(fee_payer_ref), Some(key)) = (&fee_payer_ref, &network.fee_payer_key) {
                configured_fee_payers.insert(fee_payer_ref.clone(), key.0.clone());
            }

            let eip712 = network.token_version.clone().map(|version| Eip712Hints {
                name: network.token_name_for_eip712(),
                version,
            });

            networks.push(NetworkDescriptor {
                id: NetworkId(network.id.clone()),
                vm: network.vm,
                chain_numeric: network.chain_numeric,
                rpc_url_ref,
                token: TokenInfo {
                    address: network.token_address,
                    name: network.token_name,
                    version: network.token_version.clone(),
                    decimals: network.token_decimals,
                },
                eip712,
                facilitator: network.facilitator.map(|f| FacilitatorDescriptor {
                    url: f.url,
                    api_key_ref: f.api_key.0,
                    external_network_name: f.external_network_name,
                    external_recipient: f.external_recipient,
                    external_protocol_version: f.external_protocol_version,
                }),
                fee_payer_ref,
            });
        }

        let routes = raw
            .routes
            .into_iter()
            .map(|route| {
                let credit_policy = route
                    .credit_policy
                    .map(|c| CreditPolicy {
                        credit_on_status_codes: c
                            .credit_on_status_codes
                            .map(|codes| codes.into_iter().collect())
                            .unwrap_or_else(crate::route::default_credit_status_codes),
                        max_credits_per_payer: c.max_credits_per_payer.unwrap_or(10),
                        credit_ttl_seconds: c.credit_ttl_seconds.unwrap_or(86_400),
                    })
                    .unwrap_or_default();
                RouteDescriptor {
                    route_key: route.route_key,
                    backend_base_url: route.backend_base_url,
                    backend_key_ref: route.backend_key.0,
                    backend_key_header: route.backend_key_header,
                    price_atomic: route.price_atomic,
                    display_price: route.display_price,
                    pay_to_evm: route.pay_to_evm,
                    pay_to_svm: route.pay_to_svm,
                    description: route.description,
                    mime_type: route.mime_type,
                    credit_policy,
                }
            })
            .collect();

        Ok(Self {
            port: raw.port,
            host: raw.host,
            log_level: raw.log_level,
            balance_read_failure_policy: raw.balance_read_failure_policy,
            kv_store_url: raw.kv_store_url.0,
            kv_store_token: raw.kv_store_token.0,
            networks,
            configured_rpc,
            configured_fee_payers,
            routes,
        })
    }
}

impl RawNetworkConfig {
    fn token_name_for_eip712(&self) -> String {
        self.token_name.clone()
    }
}
