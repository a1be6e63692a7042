//! Lazily-initialized, single-flight cache of chain clients.
//!
//! Grounded on the teacher's `ProviderCache`/`ProviderMap` (`src/provider_cache.rs`),
//! which eagerly builds one provider per configured network at startup. Per the
//! REDESIGN FLAGS, this gateway instead builds a chain client the first time a
//! network is actually used, and only once even if many requests race to be first —
//! exactly the single-flight behavior `tokio::sync::OnceCell` gives for free, keyed
//! per network in a `Mutex<HashMap<..>>` the way the teacher keys its eager `HashMap`.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};

use tokio::sync::OnceCell;
use url::Url;

use crate::chain::{EvmClient, SvmClient};
use crate::network::{NetworkDescriptor, NetworkId, Vm};

#[derive(Debug, thiserror::Error)]
pub enum ProviderCacheError {
    #[error("network {0} is not active (missing RPC endpoint or fee-payer key)")]
    NotActive(NetworkId),
    #[error("network {0} is an SVM network but no fee-payer keypair was loaded")]
    MissingFeePayer(NetworkId),
    #[error("network {0} is not an EVM network")]
    NotEvm(NetworkId),
    #[error("network {0} is not an SVM network")]
    NotSvm(NetworkId),
}

enum Slot {
    Evm(OnceCell<Arc<EvmClient>>),
    Svm(OnceCell<Arc<SvmClient>>),
}

/// Resolves fee-payer keypairs by the config key named in
/// `NetworkDescriptor::fee_payer_ref`; kept as a trait so tests can supply an
/// in-memory keypair set without touching the environment (teacher:
/// `SignerType::from_env` in `src/provider_cache.rs`, generalized here to return an
/// owned keypair per lookup instead of mutating process env state).
pub trait FeePayerSource: Send + Sync {
    fn keypair_for(&self, fee_payer_ref: &str) -> Option<solana_keypair::Keypair>;
}

pub struct ProviderCache {
    slots: Mutex<HashMap<NetworkId, Arc<Slot>>>,
    fee_payers: Arc<dyn FeePayerSource>,
}

impl ProviderCache {
    pub fn new(fee_payers: Arc<dyn FeePayerSource>) -> Self {
        Self {
            slots: Mutex::new(HashMap::new()),
            fee_payers,
        }
    }

    fn slot_for(&self, descriptor: &NetworkDescriptor) -> Arc<Slot> {
        let mut slots = self.slots.lock().expect("provider cache mutex poisoned");
        slots
            .entry(descriptor.id.clone())
            .or_insert_with(|| {
                Arc::new(match descriptor.vm {
                    Vm::Evm => Slot::Evm(OnceCell::new()),
                    Vm::Svm => Slot::Svm(OnceCell::new()),
                })
            })
            .clone()
    }

    /// Returns the EVM client for `descriptor`, building it on first use. Concurrent
    /// callers for the same network all await the same in-flight build rather than
    /// each connecting their own provider (REDESIGN FLAGS: single-flight lazy init).
    pub async fn evm_client(
        &self,
        descriptor: &NetworkDescriptor,
        rpc_url: &Url,
        eip1559: bool,
    ) -> Result<Arc<EvmClient>, ProviderCacheError> {
        let slot = self.slot_for(descriptor);
        match slot.as_ref() {
            Slot::Evm(cell) => {
                let chain_id = descriptor.chain_numeric.unwrap_or(0);
                let client = cell
                    .get_or_init(|| async {
                        Arc::new(EvmClient::connect(rpc_url, chain_id, eip1559))
                    })
                    .await;
                Ok(client.clone())
            }
            Slot::Svm(_) => Err(ProviderCacheError::NotEvm(descriptor.id.clone())),
        }
    }

    pub async fn svm_client(
        &self,
        descriptor: &NetworkDescriptor,
        rpc_url: &Url,
    ) -> Result<Arc<SvmClient>, ProviderCacheError> {
        let fee_payer_ref = descriptor
            .fee_payer_ref
            .as_ref()
            .ok_or_else(|| ProviderCacheError::MissingFeePayer(descriptor.id.clone()))?;
        let slot = self.slot_for(descriptor);
        match slot.as_ref() {
            Slot::Svm(cell) => {
                let fee_payers = self.fee_payers.clone();
                let fee_payer_ref = fee_payer_ref.clone();
                let rpc_url = rpc_url.to_string();
                let client = cell
                    .get_or_try_init(|| async {
                        let keypair = fee_payers
                            .keypair_for(&fee_payer_ref)
                            .ok_or_else(|| ProviderCacheError::MissingFeePayer(descriptor.id.clone()))?;
                        Ok::<_, ProviderCacheError>(Arc::new(SvmClient::connect(&rpc_url, keypair)))
                    })
                    .await?;
                Ok(client.clone())
            }
            Slot::Evm(_) => Err(ProviderCacheError::NotSvm(descriptor.id.clone())),
        }
    }
}
