//! Deskmail CLI — entry point.
//!
//! # Commands
//!
//! - `deskmail serve [--config PATH] [--logs]` — run inboxes and pipelines
//! - `deskmail inboxes [--json]` — list inboxes with their state
//! - `deskmail add-inbox --file PATH` — create an inbox from a JSON file
//! - `deskmail add-agent --email E --first-name F --last-name L`
//! - `deskmail test-inbox --file PATH [--test-email ADDR]` — connection diagnostics
//! - `deskmail reply --conversation UUID --agent ID --body TEXT` — queue a reply

mod admin;
mod helpers;
mod reply;
mod serve;
mod test_inbox;

use std::path::PathBuf;

use anyhow::Result;
use clap::{Parser, Subcommand};

use deskmail_core::config::{load_config, Config};

// ─────────────────────────────────────────────
// CLI definition
// ─────────────────────────────────────────────

/// 📬 Deskmail — helpdesk email ingestion and delivery
#[derive(Parser)]
#[command(name = "deskmail", version, about, long_about = None)]
struct Cli {
    /// Config file (defaults to ~/.deskmail/config.json)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Enable debug logging
    #[arg(long, global = true, default_value_t = false)]
    logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start every enabled inbox plus the ingestion and dispatch pipelines
    Serve,

    /// List inboxes with their state
    Inboxes {
        /// Print redacted records as JSON
        #[arg(long, default_value_t = false)]
        json: bool,
    },

    /// Create an inbox from a JSON file (secrets are sealed before storing)
    AddInbox {
        #[arg(short, long)]
        file: PathBuf,
    },

    /// Create an agent who can reply to conversations
    AddAgent {
        #[arg(long)]
        email: String,
        #[arg(long, default_value = "")]
        first_name: String,
        #[arg(long, default_value = "")]
        last_name: String,
    },

    /// Test IMAP/SMTP settings without saving them
    TestInbox {
        /// JSON file with optional `imap` and `smtp` sections
        #[arg(short, long)]
        file: PathBuf,

        /// Also send a test message to this address
        #[arg(long)]
        test_email: Option<String>,
    },

    /// Queue an agent reply; the next `serve` delivers it
    Reply {
        /// Conversation UUID
        #[arg(long)]
        conversation: String,

        /// Agent id
        #[arg(long)]
        agent: i64,

        #[arg(long)]
        body: String,

        /// Treat the body as HTML
        #[arg(long, default_value_t = false)]
        html: bool,
    },
}

// ─────────────────────────────────────────────
// Entrypoint
// ─────────────────────────────────────────────

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let config = load_config(cli.config.as_deref());
    init_logging(&config, cli.logs);

    match cli.command {
        Commands::Serve => serve::run(config).await,
        Commands::Inboxes { json } => admin::list_inboxes(&config, json).await,
        Commands::AddInbox { file } => admin::add_inbox(&config, &file).await,
        Commands::AddAgent {
            email,
            first_name,
            last_name,
        } => admin::add_agent(&config, &email, &first_name, &last_name).await,
        Commands::TestInbox { file, test_email } => test_inbox::run(&file, test_email).await,
        Commands::Reply {
            conversation,
            agent,
            body,
            html,
        } => reply::run(&config, &conversation, agent, body, html).await,
    }
}

/// Initialize tracing/logging.
///
/// `RUST_LOG` wins when set; otherwise `--logs` turns on debug output for
/// deskmail crates and `app.logLevel` applies.
fn init_logging(config: &Config, verbose: bool) {
    use tracing_subscriber::EnvFilter;

    let fallback = if verbose {
        "deskmail=debug,info".to_string()
    } else {
        config.app.log_level.clone()
    };
    let filter = EnvFilter::try_from_default_env()
        .or_else(|_| EnvFilter::try_new(&fallback))
        .unwrap_or_else(|_| EnvFilter::new("info"));

    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false);
    if config.app.log_format.eq_ignore_ascii_case("json") {
        builder.json().init();
    } else {
        builder.compact().init();
    }
}
