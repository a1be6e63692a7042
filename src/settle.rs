//! The settlement engine (spec §4.4) — the write-side counterpart of [`crate::verify`].
//!
//! Same three-way dispatch, grounded the same way: local-EVM submits and confirms
//! `transferWithAuthorization` (teacher: `Facilitator::settle` in
//! `src/facilitator_local.rs`), external-facilitator EVM POSTs to `/settle`
//! (teacher: `FacilitatorClient`), SVM broadcasts the co-signed transaction.

use std::sync::Arc;

use crate::chain::evm::EvmChainError;
use crate::facilitator_client::{FacilitatorClient, FacilitatorClientError};
use crate::network::{NetworkDescriptor, NetworkRegistry, Vm};
use crate::payment::types::{PaymentEnvelope, PaymentRequirement, SettlementReceipt};
use crate::provider_cache::ProviderCache;

#[derive(Debug, thiserror::Error)]
pub enum SettleError {
    #[error("unknown network {0}")]
    UnknownNetwork(String),
    #[error(transparent)]
    Evm(#[from] EvmChainError),
    #[error("facilitator settlement failed: {0}")]
    FacilitatorRejected(String),
    #[error("facilitator request failed: {0}")]
    FacilitatorClient(#[from] FacilitatorClientError),
    #[error("svm settlement failed: {0}")]
    Svm(String),
    #[error("malformed payment envelope: {0}")]
    Envelope(#[from] crate::payment::types::EnvelopeError),
}

pub struct Settler {
    registry: Arc<NetworkRegistry>,
    providers: Arc<ProviderCache>,
    facilitators: std::collections::HashMap<String, FacilitatorClient>,
}

impl Settler {
    pub fn new(
        registry: Arc<NetworkRegistry>,
        providers: Arc<ProviderCache>,
        facilitators: std::collections::HashMap<String, FacilitatorClient>,
    ) -> Self {
        Self {
            registry,
            providers,
            facilitators,
        }
    }

    pub async fn settle(
        &self,
        envelope: &PaymentEnvelope,
        requirement: &PaymentRequirement,
    ) -> Result<SettlementReceipt, SettleError> {
        let descriptor = self
            .registry
            .lookup(&envelope.network)
            .ok_or_else(|| SettleError::UnknownNetwork(envelope.network.0.clone()))?;

        match (descriptor.vm, &descriptor.facilitator) {
            (Vm::Evm, None) => self.settle_local_evm(envelope, descriptor).await,
            (Vm::Evm, Some(_)) => self.settle_facilitator_evm(envelope, requirement, descriptor).await,
            (Vm::Svm, _) => self.settle_svm(envelope, descriptor).await,
        }
    }

    async fn settle_local_evm(
        &self,
        envelope: &PaymentEnvelope,
        descriptor: &NetworkDescriptor,
    ) -> Result<SettlementReceipt, SettleError> {
        let payload = envelope.evm_payload()?;
        let rpc_url = self
            .registry
            .rpc_url(descriptor)
            .ok_or_else(|| SettleError::UnknownNetwork(descriptor.id.0.clone()))?;
        let client = self
            .providers
            .evm_client(descriptor, rpc_url, true)
            .await
            .map_err(|e| SettleError::UnknownNetwork(e.to_string()))?;
        let settled = client
            .settle_transfer(
                &descriptor.token.address,
                &payload.authorization,
                &payload.signature.0,
            )
            .await?;
        Ok(SettlementReceipt {
            success: settled.success,
            tx_hash: settled.tx_hash,
            network: descriptor.id.clone(),
            block_number: settled.block_number,
            facilitator: None,
        })
    }

    async fn settle_facilitator_evm(
        &self,
        envelope: &PaymentEnvelope,
        requirement: &PaymentRequirement,
        descriptor: &NetworkDescriptor,
    ) -> Result<SettlementReceipt, SettleError> {
        let facilitator_desc = descriptor.facilitator.as_ref().expect("checked by caller");
        let client = self
            .facilitators
            .get(&facilitator_desc.api_key_ref)
            .ok_or_else(|| SettleError::UnknownNetwork(descriptor.id.0.clone()))?;
        let response = client.settle(envelope, requirement).await?;
        if !response.success {
            return Err(SettleError::FacilitatorRejected(
                response.error_reason.unwrap_or_else(|| "unspecified".to_string()),
            ));
        }
        Ok(SettlementReceipt {
            success: true,
            tx_hash: response.transaction.unwrap_or_default(),
            network: descriptor.id.clone(),
            block_number: None,
            facilitator: Some(facilitator_desc.url.to_string()),
        })
    }

    async fn settle_svm(
        &self,
        envelope: &PaymentEnvelope,
        descriptor: &NetworkDescriptor,
    ) -> Result<SettlementReceipt, SettleError> {
        let payload = envelope.svm_payload()?;
        let rpc_url = self
            .registry
            .rpc_url(descriptor)
            .ok_or_else(|| SettleError::UnknownNetwork(descriptor.id.0.clone()))?;
        let client = self
            .providers
            .svm_client(descriptor, rpc_url)
            .await
            .map_err(|e| SettleError::Svm(e.to_string()))?;
        let settled = client
            .settle(&payload.transaction)
            .await
            .map_err(|e| SettleError::Svm(e.to_string()))?;
        Ok(SettlementReceipt {
            success: true,
            tx_hash: settled.signature,
            network: descriptor.id.clone(),
            block_number: None,
            facilitator: None,
        })
    }
}
