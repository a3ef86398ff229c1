//! Counter store backed by a shared Redis server.
//!
//! The whole decision runs as one Lua script, so concurrent callers for the
//! same identifier, from this process or any other, are serialised by Redis
//! itself and can never race past the limit.

use async_trait::async_trait;
use redis::aio::{ConnectionLike, MultiplexedConnection};
use redis::{ErrorKind, RedisError, Script, Value};
use std::time::Duration;
use tracing::{debug, info, trace};

use super::backend::{CounterStore, Decision};
use super::identifier::Identifier;
use crate::error::{Result, TurnstileError};

/// KEYS[1] = block flag, KEYS[2] = window counter.
/// ARGV[1] = limit, ARGV[2] = window (ms), ARGV[3] = block duration (ms).
/// Replies `{admitted, retry_after_ms}`.
const DECIDE_SCRIPT: &str = r#"
local blocked_ttl = redis.call('PTTL', KEYS[1])
if blocked_ttl > 0 then
  return {0, blocked_ttl}
end

local count = redis.call('INCR', KEYS[2])
if count == 1 then
  redis.call('PEXPIRE', KEYS[2], ARGV[2])
end

if count > tonumber(ARGV[1]) then
  redis.call('SET', KEYS[1], '1', 'PX', ARGV[3])
  return {0, tonumber(ARGV[3])}
end

return {1, 0}
"#;

/// A counter store on a Redis server.
///
/// Holds a single multiplexed connection that is cloned per call; clones
/// share one underlying socket and may be used concurrently.
pub struct RedisStore<C = MultiplexedConnection> {
    connection: C,
    script: Script,
    response_timeout: Duration,
}

impl RedisStore {
    /// Connect to the Redis server at `url`.
    pub async fn connect(
        url: &str,
        connect_timeout: Duration,
        response_timeout: Duration,
    ) -> Result<Self> {
        let client = redis::Client::open(url)
            .map_err(|e| TurnstileError::Config(format!("Invalid redis url '{}': {}", url, e)))?;

        let connection =
            match tokio::time::timeout(connect_timeout, client.get_multiplexed_async_connection())
                .await
            {
                Ok(result) => result.map_err(classify_error)?,
                Err(_) => {
                    return Err(TurnstileError::StoreUnavailable(format!(
                        "timed out connecting to redis after {:?}",
                        connect_timeout
                    )))
                }
            };

        info!(
            addr = %client.get_connection_info().addr,
            "Connected to redis counter store"
        );

        Ok(Self::with_connection(connection, response_timeout))
    }
}

impl<C> RedisStore<C>
where
    C: ConnectionLike + Clone + Send + Sync,
{
    /// Wrap an already established connection.
    pub fn with_connection(connection: C, response_timeout: Duration) -> Self {
        Self {
            connection,
            script: Script::new(DECIDE_SCRIPT),
            response_timeout,
        }
    }

    /// Check that the server answers.
    pub async fn ping(&self) -> Result<()> {
        let mut connection = self.connection.clone();
        let pong: String = match tokio::time::timeout(
            self.response_timeout,
            redis::cmd("PING").query_async(&mut connection),
        )
        .await
        {
            Ok(result) => result.map_err(classify_error)?,
            Err(_) => return Err(timeout_error(self.response_timeout)),
        };
        trace!(reply = %pong, "Redis ping");
        Ok(())
    }
}

#[async_trait]
impl<C> CounterStore for RedisStore<C>
where
    C: ConnectionLike + Clone + Send + Sync + 'static,
{
    async fn decide(
        &self,
        identifier: &Identifier,
        limit: u64,
        window: Duration,
        block_duration: Duration,
    ) -> Result<Decision> {
        let window_ms = as_millis(window)?;
        let block_ms = as_millis(block_duration)?;
        let mut connection = self.connection.clone();

        let mut invocation = self.script.prepare_invoke();
        invocation
            .key(identifier.block_key())
            .key(identifier.counter_key())
            .arg(limit)
            .arg(window_ms)
            .arg(block_ms);

        let reply: Value = match tokio::time::timeout(
            self.response_timeout,
            invocation.invoke_async(&mut connection),
        )
        .await
        {
            Ok(result) => result.map_err(classify_error)?,
            Err(_) => return Err(timeout_error(self.response_timeout)),
        };

        let decision = parse_reply(reply)?;
        trace!(
            identifier = %identifier,
            admitted = decision.admitted,
            retry_after_ms = decision.retry_after.as_millis() as u64,
            "Redis decision"
        );
        Ok(decision)
    }
}

/// Redis TTLs are positive whole milliseconds that fit a signed 64-bit
/// integer.
fn as_millis(duration: Duration) -> Result<u64> {
    let millis = i64::try_from(duration.as_millis()).map_err(|_| {
        TurnstileError::Config(format!("duration {:?} is too long for a redis TTL", duration))
    })?;
    Ok((millis as u64).max(1))
}

fn timeout_error(timeout: Duration) -> TurnstileError {
    TurnstileError::StoreUnavailable(format!("redis did not answer within {:?}", timeout))
}

/// Map a Redis error onto the store error taxonomy.
///
/// Connectivity problems and server replies refusing service for now
/// (loading, failover, read-only replica, bad credentials) mean the store is
/// unavailable. Anything else the server answered with (script errors, type
/// errors) is a malformed reply.
fn classify_error(error: RedisError) -> TurnstileError {
    let refused = matches!(
        error.kind(),
        ErrorKind::BusyLoadingError
            | ErrorKind::TryAgain
            | ErrorKind::ClusterDown
            | ErrorKind::MasterDown
            | ErrorKind::ReadOnly
            | ErrorKind::AuthenticationFailed
    );

    if refused
        || error.is_timeout()
        || error.is_io_error()
        || error.is_connection_dropped()
        || error.is_connection_refusal()
    {
        debug!(error = %error, "Redis unavailable");
        TurnstileError::StoreUnavailable(error.to_string())
    } else {
        TurnstileError::MalformedResponse(error.to_string())
    }
}

/// Decode the `{admitted, retry_after_ms}` script reply.
fn parse_reply(reply: Value) -> Result<Decision> {
    let items = match reply {
        Value::Array(items) => items,
        other => {
            return Err(TurnstileError::MalformedResponse(format!(
                "expected a two-element array, got {:?}",
                other
            )))
        }
    };

    match items.as_slice() {
        [Value::Int(1), Value::Int(0)] => Ok(Decision::admit()),
        [Value::Int(0), Value::Int(retry_ms)] if *retry_ms > 0 => {
            Ok(Decision::deny(Duration::from_millis(*retry_ms as u64)))
        }
        other => Err(TurnstileError::MalformedResponse(format!(
            "unexpected decision reply {:?}",
            other
        ))),
    }
}
