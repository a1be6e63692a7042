//! Process bootstrap for the x402 payment gateway.
//!
//! Grounded on the teacher's `src/main.rs`: `dotenv().ok()`, `Telemetry::...register()`,
//! config load, registry construction, an Axum `Router` behind a CORS layer, and
//! graceful shutdown via a cancellation token handed to `axum::serve`.

use std::collections::{HashMap, HashSet};
use std::net::SocketAddr;
use std::sync::Arc;

use axum::http::Method;
use clap::Parser;
use dotenvy::dotenv;
use tokio_util::sync::CancellationToken;
use tower_http::cors;

use x402_gateway::config::{CliArgs, GatewayConfig};
use x402_gateway::facilitator_client::FacilitatorClient;
use x402_gateway::kv::{HttpKvStore, KvStore};
use x402_gateway::network::NetworkRegistry;
use x402_gateway::pipeline::Pipeline;
use x402_gateway::provider_cache::{FeePayerSource, ProviderCache};
use x402_gateway::settle::Settler;
use x402_gateway::store::{CreditStore, IdempotencyStore, NonceStore};
use x402_gateway::telemetry::Telemetry;
use x402_gateway::verify::Verifier;
use x402_gateway::{backend, credit_task, server};

/// Resolves an SVM fee-payer keypair from the base58-encoded secret key supplied in
/// the config file (via [`x402_gateway::config::LiteralOrEnv`]).
struct ConfiguredFeePayers(HashMap<String, String>);

impl FeePayerSource for ConfiguredFeePayers {
    fn keypair_for(&self, fee_payer_ref: &str) -> Option<solana_keypair::Keypair> {
        let encoded = self.0.get(fee_payer_ref)?;
        let bytes = bs58::decode(encoded).into_vec().ok()?;
        solana_keypair::Keypair::try_from(bytes.as_slice()).ok()
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    dotenv().ok();

    let args = CliArgs::parse();
    let config = GatewayConfig::load(&args.config)?;

    Telemetry::new()
        .with_name(env!("CARGO_PKG_NAME"))
        .with_version(env!("CARGO_PKG_VERSION"))
        .with_default_level(config.log_level.clone())
        .register();

    let fee_payer_refs: HashSet<String> = config.configured_fee_payers.keys().cloned().collect();
    let registry = Arc::new(NetworkRegistry::new(
        config.networks,
        config.configured_rpc,
        fee_payer_refs.into_iter().map(|r| (r, ())).collect(),
    )?);

    let fee_payers = Arc::new(ConfiguredFeePayers(config.configured_fee_payers));
    let providers = Arc::new(ProviderCache::new(fee_payers));

    let kv: Arc<dyn KvStore> = Arc::new(HttpKvStore::try_new(&config.kv_store_url, &config.kv_store_token)?);
    let nonce_store = Arc::new(NonceStore::new(kv.clone()));
    let idempotency_store = Arc::new(IdempotencyStore::new(kv.clone(), std::time::Duration::from_secs(3600)));
    let credit_store = Arc::new(CreditStore::new(kv.clone()));

    let mut facilitators = HashMap::new();
    for network in registry.active() {
        if let Some(descriptor) = &network.facilitator {
            if !facilitators.contains_key(&descriptor.api_key_ref) {
                let client = FacilitatorClient::try_new(descriptor.url.as_str(), &descriptor.api_key_ref)?;
                facilitators.insert(descriptor.api_key_ref.clone(), client);
            }
        }
    }

    let verifier = Arc::new(Verifier::new(
        registry.clone(),
        providers.clone(),
        facilitators.clone(),
    ));
    let settler = Arc::new(Settler::new(registry.clone(), providers.clone(), facilitators));

    let pipeline = Arc::new(Pipeline::new(
        registry,
        verifier,
        settler,
        nonce_store,
        idempotency_store,
        credit_store,
    ));

    let shutdown = CancellationToken::new();
    let credit_task = credit_task::spawn(pipeline.clone(), shutdown.clone());

    let routes = config
        .routes
        .into_iter()
        .map(|route| (route.route_key.clone(), route))
        .collect();

    let state = Arc::new(server::AppState {
        routes,
        pipeline,
        backend: backend::BackendClient::new(),
        credit_task,
    });

    let app = server::router(state).layer(
        cors::CorsLayer::new()
            .allow_origin(cors::Any)
            .allow_methods([Method::GET, Method::POST])
            .allow_headers(cors::Any),
    );

    let addr = SocketAddr::new(config.host, config.port);
    tracing::info!("starting x402 gateway at http://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    let shutdown_signal = shutdown.clone();
    let ctrl_c = async move {
        let _ = tokio::signal::ctrl_c().await;
        shutdown_signal.cancel();
    };
    tokio::spawn(ctrl_c);

    let graceful = async move { shutdown.cancelled().await };
    axum::serve(listener, app)
        .with_graceful_shutdown(graceful)
        .await?;

    Ok(())
}
