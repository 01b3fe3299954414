//! Local account management — `leadboard user`.

use std::path::Path;

use anyhow::{Context, Result};

use leadboard::config::CrmConfig;
use leadboard::crm::auth::hash_password;
use leadboard::crm::db::CrmDb;
use leadboard::crm::models::NewUser;

use super::super::UserCommands;

pub fn cmd_user(config_dir: &Path, command: UserCommands) -> Result<()> {
    match command {
        UserCommands::Add {
            email,
            password,
            first_name,
            last_name,
            admin,
            db_path,
        } => {
            let mut config = CrmConfig::resolve(config_dir)?;
            if let Some(db_path) = db_path {
                config.server.db_path = db_path;
            }

            let email = email.trim().to_string();
            if email.is_empty() {
                anyhow::bail!("Email is required");
            }
            let password = match password {
                Some(p) => p,
                None => {
                    use dialoguer::Password;
                    Password::new()
                        .with_prompt(format!("Password for {}", email))
                        .with_confirmation("Confirm password", "Passwords do not match")
                        .interact()
                        .context("Failed to read password")?
                }
            };
            if password.is_empty() {
                anyhow::bail!("Password must not be empty");
            }

            let db_path = &config.server.db_path;
            if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
                std::fs::create_dir_all(parent)?;
            }
            let db = CrmDb::new(db_path)?;
            let user = db.create_user(&NewUser {
                email,
                password_hash: hash_password(&password, config.server.bcrypt_cost)?,
                first_name,
                last_name,
                is_admin: admin,
            })?;
            tracing::info!(user_id = user.id, "User created");
            println!(
                "{} Created user {} (id {})",
                console::style("✓").green(),
                user.email,
                user.id
            );
        }
    }
    Ok(())
}
