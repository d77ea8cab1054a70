//! manualctl - command-line client for manuald
//!
//! Asks questions about a product manual and streams the progress.

mod client;
mod commands;

use anyhow::Result;
use clap::{Parser, Subcommand};
use manual_shared::{DEFAULT_URL, VERSION};

#[derive(Parser)]
#[command(name = "manualctl")]
#[command(about = "Ask questions about your product manuals", long_about = None)]
#[command(version = VERSION)]
struct Cli {
    /// Daemon base URL
    #[arg(long, global = true, default_value = DEFAULT_URL)]
    url: String,

    /// Caller identity (defaults to $USER)
    #[arg(long, global = true)]
    user: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Ask a question and stream the answer
    Ask {
        product: String,
        question: String,

        /// Continue an existing conversation
        #[arg(long)]
        session: Option<String>,
    },

    /// Rate an answer
    Feedback {
        product: String,

        #[arg(long)]
        question: String,

        #[arg(long)]
        answer: String,

        #[arg(long, conflicts_with = "not_helpful")]
        helpful: bool,

        #[arg(long)]
        not_helpful: bool,

        /// Corrected answer (with --not-helpful)
        #[arg(long)]
        correction: Option<String>,
    },

    /// Start a fresh conversation for a product
    Reset { product: String },

    /// Show the messages of a conversation
    History {
        session: String,

        #[arg(long)]
        limit: Option<usize>,
    },

    /// Show daemon health and your restriction status
    Status,
}

fn resolve_user(flag: Option<String>) -> String {
    flag.or_else(|| std::env::var("USER").ok())
        .filter(|u| !u.trim().is_empty())
        .unwrap_or_else(|| "anonymous".to_string())
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let client = client::ManualClient::new(&cli.url, &resolve_user(cli.user))?;

    match cli.command {
        Commands::Ask {
            product,
            question,
            session,
        } => commands::ask(&client, &product, &question, session).await,
        Commands::Feedback {
            product,
            question,
            answer,
            helpful,
            not_helpful,
            correction,
        } => {
            if helpful == not_helpful {
                anyhow::bail!("Pass exactly one of --helpful or --not-helpful");
            }
            commands::feedback(&client, &product, question, answer, helpful, correction).await
        }
        Commands::Reset { product } => commands::reset(&client, &product).await,
        Commands::History { session, limit } => commands::history(&client, &session, limit).await,
        Commands::Status => commands::status(&client).await,
    }
}
