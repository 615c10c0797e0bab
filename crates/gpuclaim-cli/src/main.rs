//! gpuclaim CLI
//!
//! Command-line interface for interacting with the gpuclaim daemon.

mod commands;

use clap::{Parser, Subcommand};
use std::path::PathBuf;
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// gpuclaim - inspect and drive topology-aware GPU placement
#[derive(Parser, Debug)]
#[command(name = "gpuclaim")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Daemon API address
    #[arg(long, default_value = "http://localhost:9090", global = true)]
    api: String,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// List node device reports
    Nodes,

    /// List device leases
    Leases,

    /// Create or replace a claim from a JSON file
    ClaimApply {
        /// Path to the claim JSON
        file: PathBuf,
    },

    /// Publish a node device report from a JSON file
    NodeApply {
        /// Path to the report JSON
        file: PathBuf,
    },

    /// Run a scheduling cycle for a pod
    Schedule {
        /// Pod name
        pod: String,

        /// Claim the pod references
        #[arg(long)]
        claim: String,

        /// Pod namespace
        #[arg(long, short, default_value = "default")]
        namespace: String,

        /// Pod uid (generated by the daemon if omitted)
        #[arg(long)]
        uid: Option<String>,

        /// Candidate node; repeat for several (all nodes if omitted)
        #[arg(long = "node")]
        nodes: Vec<String>,
    },

    /// Show the committed allocation of a pod
    Allocation {
        /// Pod namespace
        namespace: String,

        /// Pod name
        pod: String,
    },

    /// Parse an allocation record such as "nodeA:0,1"
    Parse {
        /// Allocation record
        record: String,
    },

    /// Show daemon status
    Status,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    // Initialize logging
    let log_level = if cli.verbose {
        Level::DEBUG
    } else {
        Level::WARN
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .finish();
    let _ = tracing::subscriber::set_global_default(subscriber);

    let client = commands::ApiClient::new(&cli.api);

    match cli.command {
        Commands::Nodes => {
            commands::nodes(&client).await?;
        }
        Commands::Leases => {
            commands::leases(&client).await?;
        }
        Commands::ClaimApply { file } => {
            commands::claim_apply(&client, &file).await?;
        }
        Commands::NodeApply { file } => {
            commands::node_apply(&client, &file).await?;
        }
        Commands::Schedule {
            pod,
            claim,
            namespace,
            uid,
            nodes,
        } => {
            commands::schedule(&client, namespace, pod, claim, uid, nodes).await?;
        }
        Commands::Allocation { namespace, pod } => {
            commands::allocation(&client, &namespace, &pod).await?;
        }
        Commands::Parse { record } => {
            commands::parse(&record)?;
        }
        Commands::Status => {
            commands::status(&client).await?;
        }
    }

    Ok(())
}
