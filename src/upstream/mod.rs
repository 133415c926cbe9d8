//! Outbound side of the proxy: the per-origin connection pool and the
//! provider dispatch path built on top of it.

pub mod dispatch;
pub mod pool;

pub use dispatch::{
    IdentityShaper, RequestShaper, ShapedRequest, StreamRelay, StreamSummary,
};
pub use pool::{AcquireError, Connection, ConnectionPool, OriginStats, ReleaseOutcome};
