//! Payment envelope wire types and the 402 challenge builder.

pub mod challenge;
pub mod types;

pub use challenge::{build_challenge, find_matching_requirement, ChallengeReason};
pub use types::{
    EnvelopeError, EvmAddress, EvmAuthorization, EvmSignature, ExactEvmPayload, ExactSvmPayload,
    HexEncodedNonce, MixedAddress, PaymentEnvelope, PaymentRequirement, PaymentRequiredBody,
    Scheme, SettlementReceipt,
};
