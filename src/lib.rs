//! Rampart - a resilience API gateway.
//!
//! Rampart matches inbound requests against an ordered route table and runs
//! each route's filter chain (basic auth, token-bucket rate limiting, circuit
//! breaking with a fallback route, bounded retry, path rewriting) before
//! forwarding to a load-balanced upstream instance. Server-Sent-Events and
//! WebSocket upstreams are relayed to the client with bounded buffering.
//!
//! # Architecture
//! The crate keeps the traffic policies inside `core`, the traits it needs
//! from the outside world in `ports`, and the concrete implementations
//! (hyper client, axum handler, static discovery, health prober, basic auth,
//! config providers) in `adapters`. `customers` is a small demo upstream used
//! by the end-to-end tests and the `rampart customers` subcommand.
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use rampart::{
//!     BasicAuthenticator, GatewayService, HttpClientAdapter, HttpHandler, StaticDiscovery,
//! };
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let config = rampart::config::load_config("rampart.toml").await?;
//! let gateway = GatewayService::new(
//!     &config,
//!     Arc::new(StaticDiscovery::from_config(&config, None)?),
//!     Arc::new(BasicAuthenticator::new(&config.users)),
//!     Arc::new(HttpClientAdapter::new()?),
//! )
//! .await?;
//! let app = HttpHandler::new(Arc::new(gateway)).into_router();
//! let listener = tokio::net::TcpListener::bind(&config.listen_addr).await?;
//! axum::serve(listener, app).await?;
//! # Ok(()) }
//! ```
//!
//! # Error Handling
//! Request outcomes are [`error::GatewayError`] values rendered as HTTP
//! responses. Wiring code returns `eyre::Result` with `WrapErr` context.
//!
//! # Concurrency & Data Structures
//! Per-key state (token buckets, breakers, demo counters) lives in
//! `scc::HashMap`; the route table and reloadable collaborators are swapped
//! with `arc-swap`.
pub mod config;
pub mod customers;
pub mod error;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

pub use crate::{
    adapters::{
        BasicAuthenticator, FileConfigProvider, HealthChecker, HttpClientAdapter,
        HttpConfigProvider, HttpHandler, StaticDiscovery,
    },
    core::GatewayService,
    error::{GatewayError, Outcome},
    ports::http_client::HttpClient,
    utils::ShutdownSignal,
};
