use anyhow::{Context, Result};
use clap::{Args, Parser, Subcommand};
use std::path::PathBuf;

use leadboard::logging::{self, LogFormat};

mod cmd;

#[derive(Parser)]
#[command(name = "leadboard")]
#[command(version, about = "Lead-tracking CRM with a kanban pipeline and a chat assistant")]
pub struct Cli {
    #[arg(short, long, global = true)]
    pub verbose: bool,

    /// Directory holding leadboard.toml
    #[arg(long, global = true, default_value = ".leadboard", env = "LEADBOARD_CONFIG_DIR")]
    pub config_dir: PathBuf,

    /// Log output format: pretty, json
    #[arg(long, global = true, default_value = "pretty")]
    pub log_format: LogFormat,

    /// Write logs to daily files in this directory instead of stderr
    #[arg(long, global = true)]
    pub log_dir: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the CRM API server
    Serve {
        /// Port to serve on
        #[arg(short, long)]
        port: Option<u16>,

        /// Interface to bind
        #[arg(long)]
        host: Option<String>,

        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Enable dev mode (CORS mirrors any origin, binds 0.0.0.0)
        #[arg(long)]
        dev: bool,
    },
    /// Create the database and a default leadboard.toml
    Init {
        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Show or validate configuration
    Config {
        #[command(subcommand)]
        command: Option<ConfigCommands>,
    },
    /// Manage user accounts (local database)
    User {
        #[command(subcommand)]
        command: UserCommands,
    },
    /// Work with the lead board on a running server
    Leads {
        #[command(flatten)]
        remote: RemoteArgs,

        #[command(subcommand)]
        command: LeadsCommands,
    },
    /// Ask the assistant on a running server
    Chat {
        /// Message to send
        message: String,

        /// Continue an existing conversation
        #[arg(long)]
        conversation: Option<i64>,

        /// Clear the assistant context before sending
        #[arg(long)]
        fresh: bool,

        #[command(flatten)]
        remote: RemoteArgs,
    },
}

#[derive(Subcommand, Clone)]
pub enum ConfigCommands {
    /// Show the effective configuration
    Show,
    /// Validate configuration and show any problems
    Validate,
}

#[derive(Subcommand, Clone)]
pub enum UserCommands {
    /// Create a user
    Add {
        #[arg(long)]
        email: String,

        /// Prompted for when omitted
        #[arg(long)]
        password: Option<String>,

        #[arg(long, default_value = "")]
        first_name: String,

        #[arg(long, default_value = "")]
        last_name: String,

        #[arg(long)]
        admin: bool,

        /// Database path
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
}

#[derive(Subcommand, Clone)]
pub enum LeadsCommands {
    /// Print the board, one column per stage
    List,
    /// Create a lead
    Add {
        name: String,
        #[arg(long)]
        company: Option<String>,
        #[arg(long)]
        email: Option<String>,
        #[arg(long)]
        phone: Option<String>,
        #[arg(long)]
        value: Option<f64>,
        #[arg(long)]
        notes: Option<String>,
        /// Stage label, e.g. "Meeting booked"
        #[arg(long)]
        status: Option<String>,
        #[arg(long)]
        source: Option<String>,
    },
    /// Move a lead to another stage
    Move {
        id: i64,
        /// Stage label, e.g. "Proposal sent"
        status: String,
        /// Position in the target column
        #[arg(long, default_value = "1")]
        order: i64,
    },
    /// Delete a lead
    Rm {
        id: i64,
        /// Skip confirmation prompt
        #[arg(long)]
        force: bool,
    },
}

/// Connection settings for commands that talk to a running server.
#[derive(Args, Clone)]
pub struct RemoteArgs {
    /// Server base URL
    #[arg(long, env = "LEADBOARD_URL", default_value = "http://127.0.0.1:8000")]
    pub url: String,

    /// Login email (prompted for when omitted)
    #[arg(long, env = "LEADBOARD_EMAIL")]
    pub email: Option<String>,

    /// Login password (prompted for when omitted)
    #[arg(long, env = "LEADBOARD_PASSWORD", hide_env_values = true)]
    pub password: Option<String>,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _log_guard = logging::init(cli.verbose, cli.log_format, cli.log_dir.as_deref())
        .context("Failed to initialize logging")?;

    match &cli.command {
        Commands::Serve {
            port,
            host,
            db_path,
            dev,
        } => {
            cmd::cmd_serve(&cli.config_dir, *port, host.clone(), db_path.clone(), *dev).await?;
        }
        Commands::Init { db_path } => cmd::cmd_init(&cli.config_dir, db_path.clone())?,
        Commands::Config { command } => cmd::cmd_config(&cli.config_dir, command.clone())?,
        Commands::User { command } => cmd::cmd_user(&cli.config_dir, command.clone())?,
        Commands::Leads { remote, command } => cmd::cmd_leads(remote, command.clone()).await?,
        Commands::Chat {
            message,
            conversation,
            fresh,
            remote,
        } => {
            cmd::cmd_chat(remote, message, *conversation, *fresh).await?;
        }
    }

    Ok(())
}
