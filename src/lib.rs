//! Turnstile - per-identifier request quota enforcement
//!
//! Each inbound request is attributed to an identifier (an API token or the
//! client's network address), counted against a fixed window limit in a
//! shared counter store, and either admitted or rejected with a cooldown.
//! The counting and blocking decision runs as one atomic operation in the
//! store, so any number of service instances can share the same quotas.

pub mod config;
pub mod error;
pub mod http;
pub mod ratelimit;
