use anyhow::{Context, Result};
use taskpulse::config::TaskpulseConfig;
use taskpulse::progress::db::ProgressDb;
use taskpulse::progress::server::{ServerConfig, start_server};

pub async fn cmd_serve(config: &TaskpulseConfig) -> Result<()> {
    start_server(ServerConfig::from(config)).await
}

/// Create the database and run migrations without starting the server.
pub fn cmd_init(config: &TaskpulseConfig) -> Result<()> {
    let path = &config.database.path;
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent).context("Failed to create database directory")?;
        }
    }
    ProgressDb::new(path).context("Failed to initialize progress database")?;
    println!("Database initialized at {}", path.display());
    Ok(())
}
