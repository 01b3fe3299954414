//! Assistant command — `leadboard chat`.

use std::time::Duration;

use anyhow::Result;
use console::style;
use indicatif::{ProgressBar, ProgressStyle};

use leadboard::client::{ChatOutcome, ChatSession};

use super::super::RemoteArgs;
use super::leads::refresh_board;
use super::remote::connect;

pub async fn cmd_chat(
    remote: &RemoteArgs,
    message: &str,
    conversation: Option<i64>,
    fresh: bool,
) -> Result<()> {
    let client = connect(remote).await?;
    let session = ChatSession::new(&client, conversation);
    if fresh {
        session.clear().await?;
    }

    let spinner = ProgressBar::new_spinner();
    spinner.set_style(
        ProgressStyle::default_spinner()
            .template("{spinner} {msg}")
            .expect("progress bar template is a valid static string"),
    );
    spinner.set_message("Thinking...");
    spinner.enable_steady_tick(Duration::from_millis(100));

    let outcome = session.send(message).await;
    spinner.finish_and_clear();

    match outcome? {
        ChatOutcome::Reply {
            result,
            leads_changed,
            confirmation_requested,
        } => {
            println!("{}", result.ai_message);
            if let Some(id) = session.conversation_id() {
                println!("{}", style(format!("conversation {}", id)).dim());
            }
            if confirmation_requested {
                println!(
                    "{}",
                    style("Reply with a confirmation in the same conversation to delete.").yellow()
                );
            }
            if leads_changed {
                println!();
                refresh_board(&client).await?;
            }
        }
        ChatOutcome::Failed(message) => {
            anyhow::bail!("{}", message);
        }
    }
    Ok(())
}
