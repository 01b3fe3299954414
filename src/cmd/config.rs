//! Setup and configuration commands — `leadboard init`, `leadboard config`.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result};

use leadboard::config::CrmConfig;
use leadboard::crm::db::CrmDb;

use super::super::ConfigCommands;

pub fn cmd_init(config_dir: &Path, db_path: Option<PathBuf>) -> Result<()> {
    std::fs::create_dir_all(config_dir)
        .with_context(|| format!("Failed to create {}", config_dir.display()))?;

    let config_path = config_dir.join("leadboard.toml");
    let mut config = CrmConfig::load_or_default(config_dir)?;
    if let Some(db_path) = db_path {
        config.server.db_path = db_path;
    }
    if !config_path.exists() {
        config.save(&config_path)?;
        println!("Wrote {}", config_path.display());
    }

    let db_path = &config.server.db_path;
    if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
        std::fs::create_dir_all(parent)?;
    }
    CrmDb::new(db_path)?;
    println!("Database initialized at {}", db_path.display());
    Ok(())
}

pub fn cmd_config(config_dir: &Path, command: Option<ConfigCommands>) -> Result<()> {
    let config = CrmConfig::resolve(config_dir)?;

    match command {
        None | Some(ConfigCommands::Show) => {
            let config_path = config_dir.join("leadboard.toml");
            println!();
            println!("leadboard configuration");
            println!("=======================");
            println!();
            if config_path.exists() {
                println!("Config file: {}", config_path.display());
            } else {
                println!("No leadboard.toml found at {}; using defaults", config_path.display());
            }
            println!();
            print!(
                "{}",
                toml::to_string_pretty(&config).context("Failed to render configuration")?
            );
            println!();
            let key_state = if config.assistant.effective_api_key().is_some() {
                "configured"
            } else {
                "not configured (placeholder replies)"
            };
            println!("OpenAI API key: {}", key_state);
        }
        Some(ConfigCommands::Validate) => {
            let problems = config.validate();
            if problems.is_empty() {
                println!("{}", console::style("Configuration is valid.").green());
            } else {
                for problem in &problems {
                    println!("  {} {}", console::style("✗").red(), problem);
                }
                anyhow::bail!("{} configuration problem(s) found", problems.len());
            }
        }
    }
    Ok(())
}
