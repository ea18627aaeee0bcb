use clap::{Parser, Subcommand};
use serde_json::{json, Value};

use crate::chain::rpc_client::RpcClient;
use crate::error::AnchorError;

#[derive(Parser)]
#[command(name = "content_anchor")]
#[command(about = "Sponsored content anchoring node and CLI", long_about = None)]
pub struct Cli {
    /// Config file for `node start`
    #[arg(long, global = true, default_value = "anchor.toml")]
    pub config: String,
    /// RPC endpoint of a running node
    #[arg(long, global = true, default_value = "http://127.0.0.1:9100")]
    pub node_url: String,
    #[command(subcommand)]
    pub command: Option<Commands>,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Node operations
    Node {
        #[command(subcommand)]
        cmd: NodeCommands,
    },
    /// Store a new record and anchor it
    Submit {
        #[arg(long)]
        owner: String,
        #[arg(long)]
        title: String,
        #[arg(long)]
        body: String,
    },
    /// Anchor a pending record (after an edit, or a failure reset)
    Register { id: String },
    Edit {
        id: String,
        #[arg(long)]
        title: String,
        #[arg(long)]
        body: String,
    },
    Get { id: String },
    List {
        #[arg(long)]
        owner: String,
        #[arg(long, default_value = "1")]
        page: usize,
        #[arg(long, default_value = "20")]
        limit: usize,
    },
    /// Compare a fingerprint against the registry
    Verify {
        id: String,
        #[arg(long)]
        fingerprint: String,
    },
    /// Verify one processing record and retry it if it is stuck
    Check { id: String },
    /// Run a stuck-record sweep now
    Sweep,
    /// Sponsor deposit health
    Health,
    /// Top up the sponsor deposit if it is below the minimum
    FundSponsor,
    /// Smart account details for an identity
    Account { identity: String },
    Network,
    /// Status of a chain transaction
    Tx { hash: String },
}

#[derive(Subcommand)]
pub enum NodeCommands {
    Start {
        #[arg(long)]
        rpc_port: Option<u16>,
        #[arg(long)]
        db_path: Option<String>,
    },
}

/// JSON-RPC method and params for a client command. `None` for commands
/// that run locally.
pub fn request_for(cmd: &Commands) -> Option<(&'static str, Value)> {
    let request = match cmd {
        Commands::Node { .. } => return None,
        Commands::Submit { owner, title, body } => (
            "submitContent",
            json!({ "owner": owner, "title": title, "body": body }),
        ),
        Commands::Register { id } => ("registerContent", json!({ "id": id })),
        Commands::Edit { id, title, body } => (
            "editContent",
            json!({ "id": id, "title": title, "body": body }),
        ),
        Commands::Get { id } => ("getContent", json!({ "id": id })),
        Commands::List { owner, page, limit } => (
            "listContent",
            json!({ "owner": owner, "page": page, "limit": limit }),
        ),
        Commands::Verify { id, fingerprint } => (
            "verifyContent",
            json!({ "id": id, "fingerprint": fingerprint }),
        ),
        Commands::Check { id } => ("checkRecord", json!({ "id": id })),
        Commands::Sweep => ("sweepStuck", Value::Null),
        Commands::Health => ("checkSponsorHealth", Value::Null),
        Commands::FundSponsor => ("fundSponsor", Value::Null),
        Commands::Account { identity } => ("getAccountInfo", json!({ "identity": identity })),
        Commands::Network => ("getNetworkInfo", Value::Null),
        Commands::Tx { hash } => ("getTransactionStatus", json!({ "hash": hash })),
    };
    Some(request)
}

/// Sends a client command to the node and prints the result.
pub async fn handle_client_command(cmd: &Commands, node_url: &str) -> Result<(), AnchorError> {
    let Some((method, params)) = request_for(cmd) else {
        return Ok(());
    };
    let client = RpcClient::new(node_url.to_string());
    let result = client.send_request(method, params).await?;
    let pretty = serde_json::to_string_pretty(&result).unwrap_or_else(|_| result.to_string());
    println!("{}", pretty);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_submit() {
        let cli = Cli::try_parse_from([
            "content_anchor",
            "submit",
            "--owner",
            "u1",
            "--title",
            "Groceries",
            "--body",
            "milk",
        ])
        .unwrap();
        let cmd = cli.command.unwrap();
        let (method, params) = request_for(&cmd).unwrap();
        assert_eq!(method, "submitContent");
        assert_eq!(params["owner"], "u1");
        assert_eq!(cli.node_url, "http://127.0.0.1:9100");
    }

    #[test]
    fn test_list_defaults_and_node_is_local() {
        let cli = Cli::try_parse_from(["content_anchor", "list", "--owner", "u1"]).unwrap();
        let (method, params) = request_for(cli.command.as_ref().unwrap()).unwrap();
        assert_eq!(method, "listContent");
        assert_eq!(params["page"], 1);
        assert_eq!(params["limit"], 20);

        let node = Cli::try_parse_from(["content_anchor", "node", "start", "--rpc-port", "9200"]).unwrap();
        assert!(request_for(node.command.as_ref().unwrap()).is_none());
    }
}
