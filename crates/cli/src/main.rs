//! planctx CLI, the main entry point.
//!
//! Commands:
//! - `status` : Show configuration and database status
//! - `budget` : Show how a token ceiling is split between context parts
//! - `memory` : Inspect, query, delete and restore embeddings
//! - `jobs`   : Submit, inspect and cancel jobs

use clap::{Parser, Subcommand};

mod commands;

#[derive(Parser)]
#[command(
    name = "planctx",
    about = "planctx: plan context assembly and job lifecycle",
    version,
    author
)]
struct Cli {
    #[command(subcommand)]
    command: Commands,

    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

#[derive(Subcommand)]
enum Commands {
    /// Show configuration and database status
    Status,

    /// Show the token budget split for a context ceiling
    Budget {
        /// Overall token ceiling (defaults to context.max_tokens)
        max_tokens: Option<usize>,
    },

    /// Embedding store commands
    Memory {
        #[command(subcommand)]
        command: MemoryCommands,
    },

    /// Job lifecycle commands
    Jobs {
        #[command(subcommand)]
        command: JobCommands,
    },
}

#[derive(Subcommand)]
enum MemoryCommands {
    /// Show store statistics
    Stats {
        /// Count active records of this plan
        #[arg(short, long)]
        plan: Option<String>,
    },

    /// Nearest-neighbour query with a raw vector
    Query {
        #[arg(short, long)]
        plan: String,

        /// Comma-separated vector components
        #[arg(long)]
        vector: String,

        #[arg(short = 'k', long, default_value_t = 10)]
        top_k: usize,

        #[arg(short, long, default_value_t = 0.7)]
        threshold: f32,
    },

    /// Soft-delete an embedding record
    Delete {
        id: String,

        /// Who is deleting
        #[arg(long, default_value = "cli")]
        by: String,
    },

    /// Restore a soft-deleted embedding record
    Restore { id: String },
}

#[derive(Subcommand)]
enum JobCommands {
    /// Create a job
    Submit {
        #[arg(short, long)]
        plan: String,

        #[arg(short, long)]
        user: String,

        /// Job type, e.g. `context.build`
        #[arg(short = 't', long = "type")]
        job_type: String,

        /// JSON object of job parameters
        #[arg(long, default_value = "{}")]
        params: String,

        /// Explicit job id (a UUID is generated otherwise)
        #[arg(long)]
        id: Option<String>,

        /// Start in PENDING instead of QUEUED
        #[arg(long)]
        pending: bool,
    },

    /// Show one job
    Show { id: String },

    /// List the jobs of a plan
    List {
        #[arg(short, long)]
        plan: String,
    },

    /// Cancel an open job
    Cancel { id: String },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let cli = Cli::parse();

    // Initialize tracing
    let filter = if cli.verbose { "debug" } else { "info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(filter)),
        )
        .with_target(false)
        .init();

    match cli.command {
        Commands::Status => commands::status::run().await?,
        Commands::Budget { max_tokens } => commands::budget::run(max_tokens).await?,
        Commands::Memory { command } => match command {
            MemoryCommands::Stats { plan } => commands::memory::stats(plan.as_deref()).await?,
            MemoryCommands::Query {
                plan,
                vector,
                top_k,
                threshold,
            } => commands::memory::query(&plan, &vector, top_k, threshold).await?,
            MemoryCommands::Delete { id, by } => commands::memory::delete(&id, &by).await?,
            MemoryCommands::Restore { id } => commands::memory::restore(&id).await?,
        },
        Commands::Jobs { command } => match command {
            JobCommands::Submit {
                plan,
                user,
                job_type,
                params,
                id,
                pending,
            } => {
                commands::jobs::submit(commands::jobs::SubmitArgs {
                    plan,
                    user,
                    job_type,
                    params,
                    id,
                    pending,
                })
                .await?
            }
            JobCommands::Show { id } => commands::jobs::show(&id).await?,
            JobCommands::List { plan } => commands::jobs::list(&plan).await?,
            JobCommands::Cancel { id } => commands::jobs::cancel(&id).await?,
        },
    }

    Ok(())
}
