//! Gatehouse - an API gateway for a small fleet of backend services.
//!
//! Every request entering the gateway is either answered locally (info,
//! health, metrics, docs) or matched against a route table and run through a
//! fixed pipeline:
//!
//! - JSON body validation (bounded)
//! - bearer token verification for protected routes
//! - per-client fixed window rate limiting (global, auth and per-service api classes)
//! - a health gate backed by a TTL cache of upstream probes
//! - forwarding with identity and tracing headers
//!
//! # Architecture
//! Business logic lives in `core`, the outbound HTTP capability is a port
//! (`ports::http_client::HttpClient`) with a hyper-based adapter, and the axum
//! surface lives in `adapters`. All shared mutable state (rate limit counters,
//! the health cache and request metrics) is owned by a [`GatewayService`]
//! instance rather than process globals, so gateways can be built side by side
//! in tests.
//!
//! # Quick Example
//! ```no_run
//! use std::sync::Arc;
//!
//! use gatehouse::{GatewayService, HttpClientAdapter, HttpHandler, config::load_config};
//!
//! # #[tokio::main] async fn main() -> eyre::Result<()> {
//! let config = Arc::new(load_config(Some("gatehouse.toml")).await?);
//! let client = Arc::new(HttpClientAdapter::new()?);
//! let gateway = Arc::new(GatewayService::new(config, client)?);
//! let app = HttpHandler::new(gateway).router();
//! # let _ = app;
//! # Ok(()) }
//! ```
//!
//! # Error Handling
//! Request-level failures are [`error::GatewayError`] values that render as a
//! JSON envelope with a stable error code. Startup and wiring use
//! `eyre::Result` with `WrapErr` context.
//!
//! # Concurrency & Data Structures
//! Shared maps use `scc::HashMap`; rate limit admission is a single entry
//! update so concurrent requests from one client never lose increments.
pub mod config;
pub mod envelope;
pub mod error;
pub mod metrics;
pub mod ports;
pub mod tracing_setup;
pub mod utils;

pub mod adapters;
pub mod core;

pub use crate::{
    adapters::{HttpClientAdapter, HttpHandler},
    core::GatewayService,
    error::{GatewayError, GatewayResult},
    ports::http_client::HttpClient,
    utils::GracefulShutdown,
};
