//! gpufleet CLI
//!
//! Command-line interface for operating a gpufleet control plane.

mod commands;

use clap::{Parser, Subcommand};
use gpufleet_core::{Principal, RecordId};
use tracing::Level;
use tracing_subscriber::FmtSubscriber;

/// gpufleet - GPU fleet scheduler and container orchestrator
#[derive(Parser, Debug)]
#[command(name = "gpufleet")]
#[command(version, about, long_about = None)]
struct Cli {
    /// Daemon API address
    #[arg(long, default_value = "http://localhost:9090", global = true)]
    api: String,

    /// User id to act as
    #[arg(long, default_value_t = 1, global = true)]
    user: RecordId,

    /// Act as an administrator
    #[arg(long, global = true)]
    admin: bool,

    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Show nodes able to host a spec
    Candidates {
        /// Spec id
        spec: RecordId,

        /// Image the workload would run
        #[arg(long)]
        image: Option<RecordId>,
    },

    /// Create a workload
    Create {
        /// Image id
        #[arg(long)]
        image: RecordId,

        /// Spec id
        #[arg(long)]
        spec: RecordId,

        /// Node id
        #[arg(long)]
        node: RecordId,

        /// Workload name
        #[arg(long)]
        name: Option<String>,

        /// Free-form note
        #[arg(long)]
        remark: Option<String>,
    },

    /// List workloads
    Ps {
        /// Page number
        #[arg(long, default_value_t = 1)]
        page: u64,

        /// Page size, 0 for everything
        #[arg(long, default_value_t = 0)]
        page_size: u64,
    },

    /// Delete workloads
    Rm {
        /// Workload ids
        #[arg(required = true)]
        ids: Vec<RecordId>,
    },

    /// Start a workload
    Start {
        /// Workload id
        id: RecordId,
    },

    /// Stop a workload
    Stop {
        /// Workload id
        id: RecordId,
    },

    /// Restart a workload
    Restart {
        /// Workload id
        id: RecordId,
    },

    /// Show live usage of a workload
    Stats {
        /// Workload id
        id: RecordId,
    },

    /// Show workload output
    Logs {
        /// Workload id
        id: RecordId,

        /// Number of trailing lines
        #[arg(long)]
        tail: Option<u64>,
    },

    /// List compute nodes
    Nodes,

    /// Probe a node's engine
    TestNode {
        /// Node id
        id: RecordId,
    },

    /// Show images, nodes and specs available for placement
    Catalog,
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

    let principal = Principal {
        user_id: cli.user,
        is_admin: cli.admin,
    };
    let client = commands::ApiClient::new(&cli.api, principal);

    match cli.command {
        Commands::Candidates { spec, image } => commands::candidates(&client, spec, image).await?,
        Commands::Create {
            image,
            spec,
            node,
            name,
            remark,
        } => commands::create(&client, image, spec, node, name, remark).await?,
        Commands::Ps { page, page_size } => commands::ps(&client, page, page_size).await?,
        Commands::Rm { ids } => commands::rm(&client, ids).await?,
        Commands::Start { id } => commands::lifecycle(&client, id, "start").await?,
        Commands::Stop { id } => commands::lifecycle(&client, id, "stop").await?,
        Commands::Restart { id } => commands::lifecycle(&client, id, "restart").await?,
        Commands::Stats { id } => commands::stats(&client, id).await?,
        Commands::Logs { id, tail } => commands::logs(&client, id, tail).await?,
        Commands::Nodes => commands::nodes(&client).await?,
        Commands::TestNode { id } => commands::test_node(&client, id).await?,
        Commands::Catalog => commands::catalog(&client).await?,
    }

    Ok(())
}
