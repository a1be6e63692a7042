//! Wire types for the x402 payment envelope and requirements.
//!
//! Grounded on the teacher's `src/types.rs` (`EvmSignature`, `HexEncodedNonce`,
//! `EvmAddress`, `ExactEvmPayloadAuthorization`, `MixedAddress`, `PaymentRequirements`),
//! generalized in two ways the teacher's single-scheme types do not need to be:
//! the envelope's `payload` is scheme/VM-dependent (decoded lazily, see
//! [`PaymentEnvelope::evm_payload`]/[`PaymentEnvelope::svm_payload`]), and the
//! envelope carries an optional `payment-identifier` extension for idempotent retries.

use std::fmt;

use once_cell::sync::Lazy;
use regex::Regex;
use serde::de::Error as DeError;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::network::NetworkId;

/// Only scheme accepted by this gateway (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Scheme {
    Exact,
}

impl fmt::Display for Scheme {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "exact")
    }
}

/// A 65-byte ECDSA signature, `0x`-prefixed hex, 130 hex chars.
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EvmSignature(pub [u8; 65]);

static SIG_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^0x[0-9a-fA-F]{130}$").expect("valid regex"));

impl<'de> Deserialize<'de> for EvmSignature {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if !SIG_REGEX.is_match(&s) {
            return Err(DeError::custom(
                "invalid EVM signature: expected 0x-prefixed 130 hex chars",
            ));
        }
        let bytes = hex::decode(&s[2..]).map_err(|_| DeError::custom("invalid signature hex"))?;
        let array: [u8; 65] = bytes
            .try_into()
            .map_err(|_| DeError::custom("signature must be exactly 65 bytes"))?;
        Ok(EvmSignature(array))
    }
}

impl Serialize for EvmSignature {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(self.0)))
    }
}

/// A 32-byte, `0x`-prefixed hex-encoded EVM authorization nonce.
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
pub struct HexEncodedNonce(pub [u8; 32]);

static NONCE_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^0x[0-9a-fA-F]{64}$").expect("valid regex"));

impl<'de> Deserialize<'de> for HexEncodedNonce {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        if !NONCE_REGEX.is_match(&s) {
            return Err(DeError::custom("invalid nonce: expected 0x + 64 hex chars"));
        }
        let bytes = hex::decode(&s[2..]).map_err(|_| DeError::custom("invalid nonce hex"))?;
        let array: [u8; 32] = bytes
            .try_into()
            .map_err(|_| DeError::custom("nonce must be exactly 32 bytes"))?;
        Ok(HexEncodedNonce(array))
    }
}

impl Serialize for HexEncodedNonce {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("0x{}", hex::encode(self.0)))
    }
}

impl fmt::Display for HexEncodedNonce {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "0x{}", hex::encode(self.0))
    }
}

/// A 40-hex-char, `0x`-prefixed EVM address. Case is preserved on the wire but
/// comparisons throughout the verifier are case-insensitive (spec §4.3).
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
pub struct EvmAddress(pub alloy_primitives::Address);

impl fmt::Display for EvmAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl<'de> Deserialize<'de> for EvmAddress {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse::<alloy_primitives::Address>()
            .map(EvmAddress)
            .map_err(|e| DeError::custom(format!("invalid EVM address: {e}")))
    }
}

impl Serialize for EvmAddress {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

/// A decimal-string encoded unsigned integer (authorization `value`), parsed to
/// `u128` to avoid precision loss that a JSON number would risk (spec §3).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DecimalU128(pub u128);

impl<'de> Deserialize<'de> for DecimalU128 {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse::<u128>()
            .map(DecimalU128)
            .map_err(|_| DeError::custom("expected a non-negative decimal integer string"))
    }
}

impl Serialize for DecimalU128 {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

/// A unix timestamp, transmitted as a decimal string.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub struct UnixTimestamp(pub u64);

impl<'de> Deserialize<'de> for UnixTimestamp {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse::<u64>()
            .map(UnixTimestamp)
            .map_err(|_| DeError::custom("expected a non-negative integer timestamp"))
    }
}

impl Serialize for UnixTimestamp {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0.to_string())
    }
}

/// The ERC-3009-style authorization signed by the payer.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EvmAuthorization {
    pub from: EvmAddress,
    pub to: EvmAddress,
    pub value: DecimalU128,
    pub valid_after: UnixTimestamp,
    pub valid_before: UnixTimestamp,
    pub nonce: HexEncodedNonce,
}

/// The EVM `"exact"` scheme payload: authorization plus its EIP-712 signature.
#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExactEvmPayload {
    pub signature: EvmSignature,
    pub authorization: EvmAuthorization,
}

/// The SVM `"exact"` scheme payload: a partially-signed, base64-encoded transaction
/// with the fee-payer signature slot left empty (spec GLOSSARY).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExactSvmPayload {
    pub transaction: String,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentIdentifierExtension {
    #[serde(default)]
    pub payment_id: Option<String>,
}

#[derive(Debug, Default, Clone, Serialize, Deserialize)]
pub struct Extensions {
    #[serde(rename = "payment-identifier", default, skip_serializing_if = "Option::is_none")]
    pub payment_identifier: Option<PaymentIdentifierExtension>,
}

/// A payment envelope as submitted by a client in the `Payment-Signature`/`X-Payment`
/// header (spec §3). `payload` is kept as a raw JSON value because its shape depends
/// on the network's VM family, which is only knowable after looking up `network` in
/// the [`crate::network::NetworkRegistry`]; use [`PaymentEnvelope::evm_payload`] or
/// [`PaymentEnvelope::svm_payload`] to decode it once that lookup has happened.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentEnvelope {
    pub x402_version: u8,
    pub scheme: Scheme,
    pub network: NetworkId,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub extensions: Extensions,
}

#[derive(Debug, thiserror::Error)]
pub enum EnvelopeError {
    #[error("malformed base64 payment header")]
    Base64,
    #[error("malformed JSON payment envelope: {0}")]
    Json(#[from] serde_json::Error),
    #[error("unsupported x402Version {0}")]
    UnsupportedVersion(u8),
    #[error("payment-identifier must be 16..128 chars of [A-Za-z0-9_-], got {0:?}")]
    InvalidPaymentId(String),
}

static PAYMENT_ID_REGEX: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^[A-Za-z0-9_-]{16,128}$").expect("valid regex"));

impl PaymentEnvelope {
    /// Decodes a base64-encoded JSON payment envelope from an inbound header value.
    pub fn decode(header_value: &str) -> Result<Self, EnvelopeError> {
        use base64::Engine;
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(header_value.trim())
            .map_err(|_| EnvelopeError::Base64)?;
        let envelope: PaymentEnvelope = serde_json::from_slice(&bytes)?;
        if envelope.x402_version != 1 {
            return Err(EnvelopeError::UnsupportedVersion(envelope.x402_version));
        }
        if let Some(ext) = &envelope.extensions.payment_identifier {
            if let Some(id) = &ext.payment_id {
                if !PAYMENT_ID_REGEX.is_match(id) {
                    return Err(EnvelopeError::InvalidPaymentId(id.clone()));
                }
            }
        }
        Ok(envelope)
    }

    pub fn payment_id(&self) -> Option<&str> {
        self.extensions
            .payment_identifier
            .as_ref()
            .and_then(|p| p.payment_id.as_deref())
    }

    pub fn evm_payload(&self) -> Result<ExactEvmPayload, EnvelopeError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }

    pub fn svm_payload(&self) -> Result<ExactSvmPayload, EnvelopeError> {
        Ok(serde_json::from_value(self.payload.clone())?)
    }
}

/// Either an EVM address or an off-chain/base58 address, used for `payTo`/`asset`
/// fields that may refer to either VM family (teacher: `MixedAddress` in `types.rs`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MixedAddress(pub String);

impl fmt::Display for MixedAddress {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// One item of the `accepts` array in a 402 challenge response (spec §4.2).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequirement {
    pub scheme: Scheme,
    pub network: NetworkId,
    pub max_amount_required: String,
    pub amount: String,
    pub max_timeout_seconds: u64,
    pub resource: String,
    pub description: String,
    pub mime_type: String,
    pub pay_to: MixedAddress,
    pub asset: MixedAddress,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub extra: Option<serde_json::Value>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentIdentifierOffer {
    pub supported: bool,
    pub required: bool,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ChallengeExtensions {
    #[serde(rename = "payment-identifier")]
    pub payment_identifier: PaymentIdentifierOffer,
}

impl Default for PaymentIdentifierOffer {
    fn default() -> Self {
        Self {
            supported: true,
            required: false,
        }
    }
}

/// Body of a `402 Payment Required` response (spec §4.2, §6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PaymentRequiredBody {
    pub x402_version: u8,
    pub error: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    pub accepts: Vec<PaymentRequirement>,
    pub extensions: ChallengeExtensions,
}

impl PaymentRequiredBody {
    /// Base64 of this body's JSON, carried in the `PAYMENT-REQUIRED` response header
    /// alongside the JSON body itself (spec §4.2, §6).
    pub fn header_base64(&self) -> String {
        use base64::Engine;
        let json = serde_json::to_vec(self).expect("PaymentRequiredBody always serializes");
        base64::engine::general_purpose::STANDARD.encode(json)
    }
}

/// Receipt emitted in the `PAYMENT-RESPONSE` header on successful settlement
/// (spec §4.6).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SettlementReceipt {
    pub success: bool,
    pub tx_hash: String,
    pub network: NetworkId,
    pub block_number: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub facilitator: Option<String>,
}

impl SettlementReceipt {
    pub fn encode(&self) -> String {
        use base64::Engine;
        let json = serde_json::to_vec(self).expect("SettlementReceipt always serializes");
        base64::engine::general_purpose::STANDARD.encode(json)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_payment_id_outside_length_bounds() {
        let short = "a".repeat(15);
        assert!(!PAYMENT_ID_REGEX.is_match(&short));
        let ok = "a".repeat(16);
        assert!(PAYMENT_ID_REGEX.is_match(&ok));
        let long = "a".repeat(129);
        assert!(!PAYMENT_ID_REGEX.is_match(&long));
    }

    #[test]
    fn rejects_payment_id_with_bad_alphabet() {
        assert!(!PAYMENT_ID_REGEX.is_match(&"!".repeat(16)));
    }
}
