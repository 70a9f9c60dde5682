//! CLI entry point for clusterctl: inspect and edit a cluster through any
//! member's RPC endpoint.

use std::time::Duration;

use clap::{Parser, Subcommand};
use clusterd::rpc::client::HttpRpcClient;
use clusterd::RpcError;
use serde_json::{json, Value};

#[derive(Parser)]
#[command(name = "clusterctl", about = "clusterd cluster administration tool")]
struct Cli {
    /// RPC address of any cluster member.
    #[arg(long, default_value = "127.0.0.1:5100")]
    addr: String,

    /// Per-request timeout in milliseconds (0 disables it).
    #[arg(long, default_value_t = 5000)]
    timeout_ms: u64,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Check that the node answers
    Liveness,
    /// Check that the node's consensus layer is ready
    Readiness,
    /// Show cluster membership
    Cluster,
    /// Inspect or edit a member
    Node {
        #[command(subcommand)]
        command: NodeCommands,
    },
    /// Inspect or edit replicated configuration state
    State {
        #[command(subcommand)]
        command: StateCommands,
    },
}

#[derive(Subcommand)]
enum NodeCommands {
    Get {
        id: String,
    },
    /// Register a node, e.g. to retry a failed join
    Set {
        id: String,
        /// Node metadata as a JSON object
        #[arg(long, default_value = "{}")]
        metadata: String,
    },
    Delete {
        id: String,
    },
}

#[derive(Subcommand)]
enum StateCommands {
    Get {
        key: String,
    },
    Set {
        key: String,
        /// JSON value
        value: String,
    },
    Delete {
        key: String,
    },
}

#[tokio::main(flavor = "current_thread")]
async fn main() {
    let cli = Cli::parse();
    let timeout = (cli.timeout_ms > 0).then(|| Duration::from_millis(cli.timeout_ms));

    let client = match HttpRpcClient::connect(&cli.addr, timeout) {
        Ok(client) => client,
        Err(e) => {
            eprintln!("Error: {}", e);
            std::process::exit(1);
        }
    };

    let rc = match run(&client, cli.command).await {
        Ok(output) => {
            match serde_json::to_string_pretty(&output) {
                Ok(text) => println!("{}", text),
                Err(e) => eprintln!("Error: {}", e),
            }
            0
        }
        Err(e) => {
            eprintln!("Error: {} ({})", e, e.code());
            1
        }
    };
    let _ = client.close();
    std::process::exit(rc);
}

async fn run(client: &HttpRpcClient, command: Commands) -> Result<Value, RpcError> {
    match command {
        Commands::Liveness => Ok(json!({ "state": client.liveness().await? })),
        Commands::Readiness => Ok(json!({ "state": client.readiness().await? })),
        Commands::Cluster => Ok(json!(client.get_cluster().await?)),
        Commands::Node { command } => match command {
            NodeCommands::Get { id } => Ok(json!(client.get_node(&id).await?)),
            NodeCommands::Set { id, metadata } => {
                let metadata = match parse_json(&metadata)? {
                    Value::Object(map) => map,
                    _ => {
                        return Err(RpcError::invalid_argument(
                            "--metadata must be a JSON object",
                        ))
                    }
                };
                client.set_node(&id, &metadata).await?;
                Ok(json!({ "id": id, "metadata": Value::Object(metadata) }))
            }
            NodeCommands::Delete { id } => {
                client.delete_node(&id).await?;
                Ok(json!({ "deleted": id }))
            }
        },
        Commands::State { command } => match command {
            StateCommands::Get { key } => Ok(client.get_state(&key).await?),
            StateCommands::Set { key, value } => {
                let value = parse_json(&value)?;
                client.set_state(&key, value.clone()).await?;
                Ok(json!({ "key": key, "value": value }))
            }
            StateCommands::Delete { key } => {
                client.delete_state(&key).await?;
                Ok(json!({ "deleted": key }))
            }
        },
    }
}

fn parse_json(text: &str) -> Result<Value, RpcError> {
    serde_json::from_str(text)
        .map_err(|e| RpcError::invalid_argument(format!("invalid JSON {text:?}: {e}")))
}
