//! Core Rust implementation of a self-hosted [x402](https://www.x402.org) payment gateway.
//!
//! This crate implements the per-request payment pipeline that sits in front of a
//! protected backend API: it challenges unpaid requests with `402 Payment Required`,
//! verifies signed stablecoin transfer authorizations across EVM and SVM chains,
//! settles them on-chain (or via an external facilitator), and guards against replay
//! with a nonce/idempotency/credit store so that a paid request is served exactly once.
//!
//! # Modules
//!
//! - [`network`] — the static network registry and atomic-unit amount scaling.
//! - [`route`] — per-route pricing, recipients and credit policy.
//! - [`payment`] — wire types for the payment envelope and the 402 challenge builder.
//! - [`kv`] — the key-value store contract used by every stateful component.
//! - [`store`] — nonce, idempotency and credit policies layered over [`kv`].
//! - [`chain`] — per-chain read/write clients (EVM via Alloy, SVM facilitator wrapper).
//! - [`provider_cache`] — single-flight lazily-initialized chain client cache.
//! - [`verify`] — the multi-scheme payment verifier.
//! - [`settle`] — the multi-scheme settlement engine.
//! - [`facilitator_client`] — HTTP client for external verify/settle facilitators.
//! - [`pipeline`] — the request-scoped orchestrator state machine.
//! - [`backend`] — the thin reverse-proxy call to the protected backend.
//! - [`server`] — axum routing and the payment-gate middleware.
//! - [`config`] — process configuration, loaded once at startup.
//! - [`telemetry`] — tracing setup.

pub mod backend;
pub mod chain;
pub mod config;
pub mod credit_task;
pub mod facilitator_client;
pub mod kv;
pub mod network;
pub mod payment;
pub mod pipeline;
pub mod provider_cache;
pub mod route;
pub mod server;
pub mod settle;
pub mod store;
pub mod telemetry;
pub mod verify;
