use clap::Parser;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use content_anchor::cli::{handle_client_command, Cli, Commands, NodeCommands};
use content_anchor::config::AnchorConfig;
use content_anchor::node::AnchorNode;

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    let Some(command) = cli.command else {
        init_tracing("info");
        info!("No command given. Try `content_anchor node start` or `content_anchor --help`.");
        return;
    };

    match command {
        Commands::Node {
            cmd: NodeCommands::Start { rpc_port, db_path },
        } => {
            let mut config = AnchorConfig::load_or_default(&cli.config);
            init_tracing(&config.node.log_level);
            if let Some(port) = rpc_port {
                config.node.rpc_port = port;
            }
            if let Some(path) = db_path {
                config.node.db_path = path;
            }

            info!("⚓ Content Anchor v{} starting", env!("CARGO_PKG_VERSION"));
            let result = match AnchorNode::new(config) {
                Ok(node) => node.start().await,
                Err(e) => Err(e),
            };
            if let Err(e) = result {
                error!("❌ Node failed: {}", e);
                std::process::exit(1);
            }
        }
        cmd => {
            init_tracing("warn");
            if let Err(e) = handle_client_command(&cmd, &cli.node_url).await {
                eprintln!("Error: {}", e);
                std::process::exit(1);
            }
        }
    }
}

/// `RUST_LOG` wins over the configured level.
fn init_tracing(default_level: &str) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    tracing_subscriber::fmt().with_env_filter(filter).init();
}
