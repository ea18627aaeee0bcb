pub mod handlers;
pub mod types;

use axum::{routing::post, Router};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::info;

use crate::error::AnchorError;
use crate::service::AnchorService;

#[derive(Clone)]
pub struct RpcState {
    pub service: Arc<AnchorService>,
}

pub struct RpcServer {
    state: RpcState,
    bind_addr: String,
}

impl RpcServer {
    pub fn new(service: Arc<AnchorService>, port: u16) -> Self {
        Self {
            state: RpcState { service },
            bind_addr: format!("0.0.0.0:{}", port),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/", post(handlers::handle_rpc_request))
            .with_state(self.state.clone())
    }

    /// Serves until `stop` changes.
    pub async fn start(self, mut stop: watch::Receiver<bool>) -> Result<(), AnchorError> {
        let app = self.router();
        let listener = tokio::net::TcpListener::bind(&self.bind_addr)
            .await
            .map_err(|e| AnchorError::Config(format!("Failed to bind RPC server on {}: {}", self.bind_addr, e)))?;

        info!("🌐 RPC server listening on {}", self.bind_addr);
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = stop.changed().await;
            })
            .await
            .map_err(|e| AnchorError::Network(format!("RPC server failed: {}", e)))?;
        info!("🛑 RPC server stopped");
        Ok(())
    }
}
