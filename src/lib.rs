//! Switchboard: a provider-agnostic reverse proxy for LLM APIs.
//!
//! Clients speak one messages-style API and name a logical model; the
//! proxy routes to a concrete provider and model, manages API keys and
//! keep-alive connections, enforces rate limits and circuit breakers,
//! caches eligible responses, and records usage metrics.
//!
//! Module map:
//!
//! | Module | Concern |
//! |--------|---------|
//! | [`config`] | Immutable configuration snapshot (JSON5 + env) |
//! | [`context`] | Request IDs, priorities, deadlines |
//! | [`usage`] | Provider-agnostic token usage extraction |
//! | [`breaker`] | Per provider+model circuit breakers |
//! | [`upstream`] | Connection pool and provider dispatch |
//! | [`keys`] | API-key pool with health and strategies |
//! | [`ratelimit`] | Token-bucket + sliding-window limiting |
//! | [`cache`] | L1/L2 response cache with similarity |
//! | [`queue`] | Per-provider sequential gating |
//! | [`router`] | Logical-model to provider+model routing |
//! | [`metrics`] | Aggregates, durable rollups, streaming |
//! | [`pipeline`] | The per-request lifecycle |
//! | [`server`] | Axum HTTP surface |

pub mod breaker;
pub mod cache;
pub mod config;
pub mod context;
pub mod error;
pub mod keys;
pub mod metrics;
pub mod pipeline;
pub mod queue;
pub mod ratelimit;
pub mod router;
pub mod server;
pub mod upstream;
pub mod usage;

pub use config::Config;
pub use error::{Error, ErrorKind, ProxyError};
pub use pipeline::{InboundRequest, PipelineReply, Proxy};
