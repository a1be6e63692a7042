//! Per-chain read/write clients.
//!
//! Split along VM family exactly as the teacher splits `src/chain/evm/` from
//! `src/chain/solana/`: the EVM path wraps an Alloy `Provider` against an ERC-3009
//! token contract, the SVM path wraps a `solana_client` RPC client against a
//! partially-signed transaction. Both are deliberately thin — verification and
//! settlement semantics live in [`crate::verify`]/[`crate::settle`], these clients
//! only expose the chain calls those modules need.

pub mod evm;
pub mod svm;

pub use evm::EvmClient;
pub use svm::SvmClient;
