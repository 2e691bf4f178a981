//! Tokengate
//!
//! A distributed token-bucket admission gateway. Requests are keyed by
//! client identity (API key, bearer-token claim, or source address) and
//! checked against per-(identity, rule) buckets held in a sharded Redis
//! store, with the refill-and-consume step executed atomically server-side.
//! The gateway fails closed when the store is unreachable.

pub mod bucket;
pub mod config;
pub mod error;
pub mod gateway;
pub mod identity;
pub mod limiter;
pub mod metrics;
pub mod policy;
pub mod redis;
pub mod response;
pub mod shard;
pub mod store;

// Re-export main types
pub use error::{GateError, Result};
pub use limiter::{Decision, DenyReason, RateLimiter};
pub use policy::Policy;
pub use store::TokenStore;
