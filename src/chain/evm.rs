//! EVM chain client: ERC-3009 `transferWithAuthorization` against an Alloy provider.
//!
//! Grounded directly on the teacher's `src/facilitator_local.rs`: the `sol!` ABI
//! binding, `assert_domain`'s name/version resolution (static hint, else on-chain
//! `version()` call), `assert_signature`'s EIP-712 recovery, `assert_time`'s 6-second
//! grace buffer, and `assert_enough_balance`'s `balanceOf` call are all carried over
//! near-verbatim as free functions, generalized from the teacher's USDC-only binding
//! to any ERC-3009-compatible token (spec §4.1 allows arbitrary token addresses).

use std::str::FromStr;
use std::time::{SystemTime, UNIX_EPOCH};

use alloy_primitives::{Address, Bytes, FixedBytes, Signature, B256, U256};
use alloy_provider::{Provider, RootProvider};
use alloy_sol_types::{eip712_domain, sol, Eip712Domain, SolStruct};
use url::Url;

use crate::payment::types::EvmAuthorization;

sol! {
    #[sol(rpc)]
    interface Erc3009Token {
        function balanceOf(address account) external view returns (uint256);
        function version() external view returns (string memory);
        function transferWithAuthorization(
            address from,
            address to,
            uint256 value,
            uint256 validAfter,
            uint256 validBefore,
            bytes32 nonce,
            bytes memory signature
        ) external;
    }
}

sol! {
    struct TransferWithAuthorization {
        address from;
        address to;
        uint256 value;
        uint256 validAfter;
        uint256 validBefore;
        bytes32 nonce;
    }
}

#[derive(Debug, thiserror::Error)]
pub enum EvmChainError {
    #[error("invalid EVM address: {0}")]
    InvalidAddress(String),
    #[error("on-chain call failed: {0}")]
    Rpc(#[source] alloy_contract::Error),
    #[error("invalid signature: {0}")]
    InvalidSignature(String),
    #[error("authorization not yet valid: validAfter {valid_after} > now {now}")]
    NotYetValid { valid_after: u64, now: u64 },
    #[error("authorization expired: now {now} + grace >= validBefore {valid_before}")]
    Expired { now: u64, valid_before: u64 },
    #[error("system clock error: {0}")]
    Clock(String),
    #[error("insufficient on-chain balance")]
    InsufficientFunds,
}

/// Grace window subtracted from `validBefore` to absorb request latency (teacher:
/// `assert_time` in `facilitator_local.rs`).
const EXPIRY_GRACE_SECONDS: u64 = 6;

/// A connected Alloy provider plus the token contract this network pays in.
pub struct EvmClient {
    provider: RootProvider,
    pub chain_id: u64,
    pub eip1559: bool,
}

impl EvmClient {
    pub fn connect(rpc_url: &Url, chain_id: u64, eip1559: bool) -> Self {
        let provider = RootProvider::new_http(rpc_url.clone());
        Self {
            provider,
            chain_id,
            eip1559,
        }
    }

    fn token(&self, asset_address: &str) -> Result<Erc3009Token::Erc3009TokenInstance<&RootProvider>, EvmChainError> {
        let address = Address::from_str(asset_address)
            .map_err(|_| EvmChainError::InvalidAddress(asset_address.to_string()))?;
        Ok(Erc3009Token::new(address, &self.provider))
    }

    /// Resolves the EIP-712 domain for `asset_address`: a statically configured
    /// name/version wins, otherwise `version()` is read from the contract itself
    /// (teacher: `assert_domain`).
    pub async fn resolve_domain(
        &self,
        asset_address: &str,
        static_name: &str,
        static_version: Option<&str>,
    ) -> Result<Eip712Domain, EvmChainError> {
        let address = Address::from_str(asset_address)
            .map_err(|_| EvmChainError::InvalidAddress(asset_address.to_string()))?;
        let version = match static_version {
            Some(v) => v.to_string(),
            None => {
                let token = self.token(asset_address)?;
                token
                    .version()
                    .call()
                    .await
                    .map_err(EvmChainError::Rpc)?
            }
        };
        Ok(eip712_domain! {
            name: static_name.to_string(),
            version: version,
            chain_id: self.chain_id,
            verifying_contract: address,
        })
    }

    pub async fn balance_of(&self, asset_address: &str, owner: &str) -> Result<U256, EvmChainError> {
        let token = self.token(asset_address)?;
        let owner = Address::from_str(owner)
            .map_err(|_| EvmChainError::InvalidAddress(owner.to_string()))?;
        token
            .balanceOf(owner)
            .call()
            .await
            .map_err(EvmChainError::Rpc)
    }

    /// Dry-runs a `transferWithAuthorization` call without broadcasting it, used by
    /// the verifier to confirm the authorization would succeed on-chain without
    /// spending it (teacher: `Facilitator::verify`, `tx.call()`).
    pub async fn dry_run_transfer(
        &self,
        asset_address: &str,
        authorization: &EvmAuthorization,
        signature_bytes: &[u8; 65],
    ) -> Result<(), EvmChainError> {
        let token = self.token(asset_address)?;
        let call = build_transfer_call(&token, authorization, signature_bytes)?;
        call.call().await.map_err(EvmChainError::Rpc)?;
        Ok(())
    }

    /// Broadcasts a `transferWithAuthorization` transaction and waits for its
    /// receipt (teacher: `Facilitator::settle`, `tx.send()` + `get_receipt()`).
    pub async fn settle_transfer(
        &self,
        asset_address: &str,
        authorization: &EvmAuthorization,
        signature_bytes: &[u8; 65],
    ) -> Result<SettledTransfer, EvmChainError> {
        let token = self.token(asset_address)?;
        let call = build_transfer_call(&token, authorization, signature_bytes)?;
        let pending = call.send().await.map_err(EvmChainError::Rpc)?;
        let tx_hash = *pending.tx_hash();
        let receipt = pending
            .get_receipt()
            .await
            .map_err(|e| EvmChainError::Rpc(e.into()))?;
        Ok(SettledTransfer {
            tx_hash: format!("0x{}", hex::encode(tx_hash)),
            success: receipt.status(),
            block_number: receipt.block_number,
        })
    }
}

pub struct SettledTransfer {
    pub tx_hash: String,
    pub success: bool,
    pub block_number: Option<u64>,
}

fn build_transfer_call<'a>(
    token: &'a Erc3009Token::Erc3009TokenInstance<&'a RootProvider>,
    authorization: &EvmAuthorization,
    signature_bytes: &[u8; 65],
) -> Result<
    alloy_contract::CallBuilder<&'a &'a RootProvider, std::marker::PhantomData<Erc3009Token::transferWithAuthorizationCall>>,
    EvmChainError,
> {
    Ok(token.transferWithAuthorization(
        authorization.from.0,
        authorization.to.0,
        U256::from(authorization.value.0),
        U256::from(authorization.valid_after.0),
        U256::from(authorization.valid_before.0),
        FixedBytes::from_slice(&authorization.nonce.0),
        Bytes::from(*signature_bytes),
    ))
}

/// Recovers the signer of an EIP-712 `TransferWithAuthorization` struct and checks
/// it matches `authorization.from` (teacher: `assert_signature`).
pub fn verify_authorization_signature(
    authorization: &EvmAuthorization,
    signature_bytes: &[u8; 65],
    domain: &Eip712Domain,
) -> Result<(), EvmChainError> {
    let signature = Signature::from_raw_array(signature_bytes)
        .map_err(|e| EvmChainError::InvalidSignature(e.to_string()))?;
    let typed = TransferWithAuthorization {
        from: authorization.from.0,
        to: authorization.to.0,
        value: U256::from(authorization.value.0),
        validAfter: U256::from(authorization.valid_after.0),
        validBefore: U256::from(authorization.valid_before.0),
        nonce: FixedBytes::<32>::from_slice(&authorization.nonce.0),
    };
    let hash: B256 = typed.eip712_signing_hash(domain);
    let recovered = signature
        .recover_address_from_prehash(&hash)
        .map_err(|e| EvmChainError::InvalidSignature(e.to_string()))?;
    if recovered != authorization.from.0 {
        return Err(EvmChainError::InvalidSignature(format!(
            "recovered {recovered} does not match authorization.from {}",
            authorization.from.0
        )));
    }
    Ok(())
}

/// Checks `validAfter <= now < validBefore - grace` (teacher: `assert_time`).
pub fn verify_authorization_window(authorization: &EvmAuthorization) -> Result<(), EvmChainError> {
    let now = SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map_err(|e| EvmChainError::Clock(e.to_string()))?
        .as_secs();
    let valid_before = authorization.valid_before.0;
    if valid_before < now + EXPIRY_GRACE_SECONDS {
        return Err(EvmChainError::Expired { now, valid_before });
    }
    let valid_after = authorization.valid_after.0;
    if valid_after > now {
        return Err(EvmChainError::NotYetValid { valid_after, now });
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::payment::types::{DecimalU128, EvmAddress, HexEncodedNonce, UnixTimestamp};

    fn authorization(valid_after: u64, valid_before: u64) -> EvmAuthorization {
        EvmAuthorization {
            from: EvmAddress(Address::ZERO),
            to: EvmAddress(Address::ZERO),
            value: DecimalU128(1),
            valid_after: UnixTimestamp(valid_after),
            valid_before: UnixTimestamp(valid_before),
            nonce: HexEncodedNonce([0u8; 32]),
        }
    }

    #[test]
    fn rejects_expired_authorization() {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let auth = authorization(0, now);
        let err = verify_authorization_window(&auth).unwrap_err();
        assert!(matches!(err, EvmChainError::Expired { .. }));
    }

    #[test]
    fn rejects_not_yet_active_authorization() {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let auth = authorization(now + 3600, now + 7200);
        let err = verify_authorization_window(&auth).unwrap_err();
        assert!(matches!(err, EvmChainError::NotYetValid { .. }));
    }

    #[test]
    fn accepts_window_with_grace_margin() {
        let now = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap()
            .as_secs();
        let auth = authorization(now - 10, now + 3600);
        assert!(verify_authorization_window(&auth).is_ok());
    }
}
