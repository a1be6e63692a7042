//! End-to-end tests against `Pipeline::handle` that do not require a live chain RPC
//! or facilitator endpoint: the "no payment header" and "idempotent replay" paths
//! both resolve before any chain or facilitator call is made (spec §4.6, §8
//! scenario 1 and property P3).

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use base64::Engine;
use x402_gateway::kv::{InMemoryKvStore, KvStore};
use x402_gateway::network::{NetworkRegistry, Vm};
use x402_gateway::pipeline::{Pipeline, PipelineOutcome};
use x402_gateway::provider_cache::{FeePayerSource, ProviderCache};
use x402_gateway::route::{CreditPolicy, RouteDescriptor};
use x402_gateway::settle::Settler;
use x402_gateway::store::{CreditStore, IdempotencyStore, IdempotentOutcome, NonceStore};
use x402_gateway::verify::Verifier;

struct NoFeePayers;
impl FeePayerSource for NoFeePayers {
    fn keypair_for(&self, _fee_payer_ref: &str) -> Option<solana_keypair::Keypair> {
        None
    }
}

fn route() -> RouteDescriptor {
    RouteDescriptor {
        route_key: "weather".into(),
        backend_base_url: "http://localhost:9000".into(),
        backend_key_ref: "WEATHER_KEY".into(),
        backend_key_header: "Authorization".into(),
        price_atomic: 10_000,
        display_price: "$0.01".into(),
        pay_to_evm: Some("0x000000000000000000000000000000000000dEaD".into()),
        pay_to_svm: None,
        description: "weather forecast".into(),
        mime_type: "application/json".into(),
        credit_policy: CreditPolicy::default(),
    }
}

fn build_pipeline() -> Pipeline {
    let registry = Arc::new(NetworkRegistry::new(vec![], HashMap::new(), HashMap::new()).unwrap());
    let providers = Arc::new(ProviderCache::new(Arc::new(NoFeePayers)));
    let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
    let nonce_store = Arc::new(NonceStore::new(kv.clone()));
    let idempotency_store = Arc::new(IdempotencyStore::new(kv.clone(), Duration::from_secs(3600)));
    let credit_store = Arc::new(CreditStore::new(kv));
    let verifier = Arc::new(Verifier::new(registry.clone(), providers.clone(), HashMap::new()));
    let settler = Arc::new(Settler::new(registry.clone(), providers, HashMap::new()));
    Pipeline::new(registry, verifier, settler, nonce_store, idempotency_store, credit_store)
}

#[tokio::test]
async fn cold_request_without_payment_header_is_challenged() {
    let pipeline = build_pipeline();
    let route = route();
    let outcome = pipeline.handle(&route, "/weather", None).await;
    match outcome {
        PipelineOutcome::Challenge(body) => {
            assert_eq!(body.error, "payment_header_required");
            assert!(body.extensions.payment_identifier.supported);
            assert!(!body.extensions.payment_identifier.required);
        }
        _ => panic!("expected a 402 challenge when no payment header is present"),
    }
}

#[tokio::test]
async fn malformed_payment_header_is_challenged_not_panicked() {
    let pipeline = build_pipeline();
    let route = route();
    let outcome = pipeline.handle(&route, "/weather", Some("not-valid-base64!!")).await;
    match outcome {
        PipelineOutcome::Challenge(body) => assert_eq!(body.error, "invalid_payment_header"),
        _ => panic!("expected a 402 challenge for a malformed header"),
    }
}

#[tokio::test]
async fn envelope_for_unknown_network_is_challenged() {
    let pipeline = build_pipeline();
    let route = route();
    let envelope_json = serde_json::json!({
        "x402Version": 1,
        "scheme": "exact",
        "network": "eip155:999999",
        "payload": {},
    });
    let header = base64::engine::general_purpose::STANDARD.encode(envelope_json.to_string());
    let outcome = pipeline.handle(&route, "/weather", Some(&header)).await;
    match outcome {
        PipelineOutcome::Challenge(body) => assert_eq!(body.error, "no_matching_payment_requirements"),
        _ => panic!("expected a 402 challenge for an unrecognized network"),
    }
}

#[tokio::test]
async fn idempotent_payment_id_replays_cached_receipt_without_reverifying() {
    let pipeline = build_pipeline();
    let route = route();

    // Seed the idempotency cache as if a prior request had already settled this
    // payment-identifier, bypassing the verifier/settler entirely (spec I2/I3).
    let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
    let idempotency_store = IdempotencyStore::new(kv, Duration::from_secs(3600));
    let payment_id = "0123456789abcdef";
    idempotency_store
        .store(
            payment_id,
            &IdempotentOutcome {
                status: 200,
                body_base64: "e30=".into(),
                settlement_receipt_base64: Some("cached-receipt".into()),
            },
        )
        .await
        .unwrap();

    // Rebuild a pipeline sharing that same idempotency store.
    let registry = Arc::new(NetworkRegistry::new(vec![], HashMap::new(), HashMap::new()).unwrap());
    let providers = Arc::new(ProviderCache::new(Arc::new(NoFeePayers)));
    let kv: Arc<dyn KvStore> = Arc::new(InMemoryKvStore::new());
    let nonce_store = Arc::new(NonceStore::new(kv.clone()));
    let verifier = Arc::new(Verifier::new(registry.clone(), providers.clone(), HashMap::new()));
    let settler = Arc::new(Settler::new(registry.clone(), providers, HashMap::new()));
    let credit_store = Arc::new(CreditStore::new(kv));
    let pipeline = Pipeline::new(
        registry,
        verifier,
        settler,
        nonce_store,
        Arc::new(idempotency_store),
        credit_store,
    );

    let envelope_json = serde_json::json!({
        "x402Version": 1,
        "scheme": "exact",
        "network": "eip155:8453",
        "payload": {},
        "extensions": { "payment-identifier": { "paymentId": payment_id } },
    });
    let header = base64::engine::general_purpose::STANDARD.encode(envelope_json.to_string());
    let outcome = pipeline.handle(&route, "/weather", Some(&header)).await;
    match outcome {
        PipelineOutcome::ProceedWithCachedReceipt { receipt_header } => {
            assert_eq!(receipt_header, "cached-receipt");
        }
        _ => panic!("expected the cached idempotent receipt to be replayed"),
    }
}

#[test]
fn network_registry_reports_no_active_networks_when_unconfigured() {
    let registry = NetworkRegistry::new(vec![], HashMap::new(), HashMap::new()).unwrap();
    assert_eq!(registry.active().count(), 0);
    assert!(!registry.is_active(&dummy_descriptor()));
}

fn dummy_descriptor() -> x402_gateway::network::NetworkDescriptor {
    x402_gateway::network::NetworkDescriptor {
        id: "eip155:1".into(),
        vm: Vm::Evm,
        chain_numeric: Some(1),
        rpc_url_ref: "RPC".into(),
        token: x402_gateway::network::TokenInfo {
            address: "0x0".into(),
            name: "X".into(),
            version: None,
            decimals: 6,
        },
        eip712: None,
        facilitator: None,
        fee_payer_ref: None,
    }
}
