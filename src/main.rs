use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use std::path::PathBuf;
use taskpulse::config::{CliOverrides, LogFormat, TaskpulseConfig};
use tracing_subscriber::{EnvFilter, fmt};

mod cmd;

#[derive(Parser)]
#[command(name = "taskpulse")]
#[command(version, about = "Compliance task progress tracking with live tab-unlock notifications")]
pub struct Cli {
    /// Path to the config file (defaults to ./taskpulse.toml)
    #[arg(long, global = true)]
    pub config: Option<PathBuf>,

    /// Log output format: text or json
    #[arg(long, global = true)]
    pub log_format: Option<LogFormat>,

    /// Verbose logging (debug level unless RUST_LOG is set)
    #[arg(short, long, global = true)]
    pub verbose: bool,

    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the HTTP API and WebSocket server
    Serve {
        #[arg(long)]
        host: Option<String>,

        #[arg(short, long)]
        port: Option<u16>,

        /// Database path (overrides DATABASE_URL and the config file)
        #[arg(long)]
        db_path: Option<PathBuf>,

        /// Enable dev mode (CORS permissive for a local front-end dev server)
        #[arg(long)]
        dev: bool,
    },
    /// Create the database and run migrations
    Init {
        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Import form field definitions from a JSON file
    ImportFields {
        file: PathBuf,

        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Show how many fields each group of a form has
    FieldGroups {
        /// Task type, e.g. ky3p, company_kyb, open_banking
        task_type: String,

        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Recompute a task's progress from its field responses
    Recalculate {
        task_id: i64,

        /// Persist and broadcast even if nothing changed
        #[arg(long)]
        force: bool,

        #[arg(long)]
        skip_broadcast: bool,

        #[arg(long)]
        db_path: Option<PathBuf>,
    },
    /// Set a task's progress by hand, recording the reason in its metadata
    OverrideProgress {
        task_id: i64,

        #[arg(value_parser = clap::value_parser!(u8).range(0..=100))]
        progress: u8,

        #[arg(long)]
        reason: String,

        #[arg(long)]
        db_path: Option<PathBuf>,
    },
}

impl Commands {
    fn overrides(&self) -> CliOverrides {
        match self {
            Commands::Serve {
                host,
                port,
                db_path,
                dev,
            } => CliOverrides {
                host: host.clone(),
                port: *port,
                db_path: db_path.clone(),
                dev_mode: *dev,
                log_format: None,
            },
            Commands::Init { db_path }
            | Commands::ImportFields { db_path, .. }
            | Commands::FieldGroups { db_path, .. }
            | Commands::Recalculate { db_path, .. }
            | Commands::OverrideProgress { db_path, .. } => CliOverrides {
                db_path: db_path.clone(),
                ..Default::default()
            },
        }
    }
}

fn init_tracing(log_format: LogFormat, verbose: bool) -> Result<()> {
    let default_level = if verbose { "debug" } else { "info" };
    let env_filter =
        EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level));
    let subscriber = fmt().with_env_filter(env_filter).with_writer(std::io::stderr);

    match log_format {
        LogFormat::Text => subscriber
            .try_init()
            .map_err(|err| anyhow::anyhow!("failed to init tracing: {err}"))?,
        LogFormat::Json => subscriber
            .json()
            .try_init()
            .map_err(|err| anyhow::anyhow!("failed to init tracing: {err}"))?,
    }

    Ok(())
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();

    let mut overrides = cli.command.overrides();
    overrides.log_format = cli.log_format;
    let config = TaskpulseConfig::load(cli.config.as_deref(), &overrides)
        .context("Failed to load configuration")?;

    init_tracing(config.logging.format, cli.verbose)?;

    match cli.command {
        Commands::Serve { .. } => cmd::cmd_serve(&config).await?,
        Commands::Init { .. } => cmd::cmd_init(&config)?,
        Commands::ImportFields { file, .. } => cmd::cmd_import_fields(&config, &file).await?,
        Commands::FieldGroups { task_type, .. } => {
            cmd::cmd_field_groups(&config, &task_type).await?
        }
        Commands::Recalculate {
            task_id,
            force,
            skip_broadcast,
            ..
        } => cmd::cmd_recalculate(&config, task_id, force, skip_broadcast, cli.verbose).await?,
        Commands::OverrideProgress {
            task_id,
            progress,
            reason,
            ..
        } => cmd::cmd_override_progress(&config, task_id, progress, reason).await?,
    }

    Ok(())
}
