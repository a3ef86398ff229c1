//! HTTP dispatch layer: resolves identifiers per request and enforces the
//! rate limiter's decisions.

mod middleware;
mod server;

pub use middleware::{rate_limit, AppState, API_KEY_HEADER, REJECTION_MESSAGE};
pub use server::{router, HttpServer};
