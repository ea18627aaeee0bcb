use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info};

use crate::chain::evm::EvmChain;
use crate::chain::ChainHandles;
use crate::config::AnchorConfig;
use crate::content::{ContentStore, SledContentStore};
use crate::error::AnchorError;
use crate::rpc::RpcServer;
use crate::service::AnchorService;

/// The long-running process: RPC surface, sponsor monitor and stuck-record
/// sweeper around one `AnchorService`.
pub struct AnchorNode {
    service: Arc<AnchorService>,
    config: AnchorConfig,
}

impl AnchorNode {
    /// Opens the content store and connects to the configured chain.
    pub fn new(config: AnchorConfig) -> Result<Self, AnchorError> {
        config.validate()?;
        info!("Persistence: Opening Sled DB at '{}'...", config.node.db_path);
        let store = Arc::new(SledContentStore::open(&config.node.db_path)?);
        let chain = Arc::new(EvmChain::new(&config.chain));
        info!("⛓️ Chain endpoint {}", config.chain.rpc_url);
        Self::with_parts(config, store, &chain.handles())
    }

    pub fn with_parts(
        config: AnchorConfig,
        store: Arc<dyn ContentStore>,
        handles: &ChainHandles,
    ) -> Result<Self, AnchorError> {
        let service = Arc::new(AnchorService::new(store, handles, &config)?);
        Ok(Self { service, config })
    }

    pub fn service(&self) -> Arc<AnchorService> {
        self.service.clone()
    }

    /// Runs every background service until Ctrl+C.
    pub async fn start(self) -> Result<(), AnchorError> {
        self.run_until(async {
            if let Err(e) = tokio::signal::ctrl_c().await {
                error!("Failed to listen for Ctrl+C: {}", e);
            }
        })
        .await
    }

    /// Runs every background service until `shutdown` resolves, then stops
    /// them and waits for each to finish.
    pub async fn run_until<F>(self, shutdown: F) -> Result<(), AnchorError>
    where
        F: Future<Output = ()>,
    {
        info!("Starting Content Anchor Node Services...");
        let (stop_tx, stop_rx) = watch::channel(false);

        let monitor = tokio::spawn(self.service.monitor().run(stop_rx.clone()));
        let sweeper = tokio::spawn(
            self.service
                .reconciler()
                .run(Duration::from_secs(self.config.reconciler.sweep_interval_secs), stop_rx.clone()),
        );
        let server = RpcServer::new(self.service.clone(), self.config.node.rpc_port);
        let mut rpc = tokio::spawn(server.start(stop_rx));

        info!("Node Running. Press Ctrl+C to stop.");
        let rpc_result = tokio::select! {
            _ = shutdown => None,
            joined = &mut rpc => Some(joined),
        };

        info!("🛑 Shutting down...");
        let _ = stop_tx.send(true);
        let rpc_result = match rpc_result {
            Some(joined) => joined,
            None => rpc.await,
        };
        let _ = monitor.await;
        let _ = sweeper.await;

        match rpc_result {
            Ok(result) => result,
            Err(e) => Err(AnchorError::Network(format!("RPC task panicked: {}", e))),
        }
    }
}
