//! Login for commands that talk to a running server.

use anyhow::{Context, Result};

use leadboard::client::CrmClient;

use super::super::RemoteArgs;

/// Build a client for `remote.url` and log in, prompting for missing
/// credentials.
pub async fn connect(remote: &RemoteArgs) -> Result<CrmClient> {
    let client = CrmClient::new(&remote.url)?;

    let email = match &remote.email {
        Some(email) => email.clone(),
        None => {
            use dialoguer::Input;
            Input::<String>::new()
                .with_prompt("Email")
                .interact_text()
                .context("Failed to read email")?
        }
    };
    let password = match &remote.password {
        Some(password) => password.clone(),
        None => {
            use dialoguer::Password;
            Password::new()
                .with_prompt("Password")
                .interact()
                .context("Failed to read password")?
        }
    };

    let user = client
        .login(&email, &password)
        .await
        .with_context(|| format!("Login to {} failed", client.base_url()))?;
    tracing::debug!(user_id = user.id, "Logged in");
    Ok(client)
}
