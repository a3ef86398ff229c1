//! HTTP server implementation.

use axum::routing::get;
use axum::{middleware, Json, Router};
use serde_json::{json, Value};
use std::net::SocketAddr;
use tokio::net::TcpListener;
use tracing::{error, info};

use super::middleware::{rate_limit, AppState};
use crate::error::{Result, TurnstileError};

/// Build the service router with every route behind the rate limiter.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(root))
        .layer(middleware::from_fn_with_state(state, rate_limit))
}

async fn root() -> Json<Value> {
    Json(json!({ "message": "ok" }))
}

/// HTTP server fronted by the rate limiter.
pub struct HttpServer {
    /// Bound listener
    listener: TcpListener,
    /// State shared with the middleware
    state: AppState,
}

impl HttpServer {
    /// Bind the server to an address.
    pub async fn bind(addr: SocketAddr, state: AppState) -> Result<Self> {
        let listener = TcpListener::bind(addr).await?;
        Ok(Self { listener, state })
    }

    /// The address the server is listening on.
    pub fn local_addr(&self) -> Result<SocketAddr> {
        Ok(self.listener.local_addr()?)
    }

    /// Start the HTTP server with graceful shutdown.
    ///
    /// The server will shut down when the provided signal resolves.
    pub async fn serve_with_shutdown<F>(self, signal: F) -> Result<()>
    where
        F: std::future::Future<Output = ()> + Send + 'static,
    {
        let addr = self.local_addr()?;
        info!(addr = %addr, "Starting HTTP server with graceful shutdown");

        let app = router(self.state).into_make_service_with_connect_info::<SocketAddr>();

        axum::serve(self.listener, app)
            .with_graceful_shutdown(signal)
            .await
            .map_err(|e| {
                error!(error = %e, "HTTP server failed");
                TurnstileError::Io(e)
            })
    }
}
