//! Rate limiting logic and counter stores.

mod backend;
mod identifier;
mod limiter;
mod limits;
mod memory;
mod redis_store;

pub use backend::{CounterStore, Decision};
pub use identifier::{Identifier, UNKNOWN_IDENTIFIER};
pub use limiter::RateLimiter;
pub use limits::LimitTable;
pub use memory::MemoryStore;
pub use redis_store::RedisStore;
