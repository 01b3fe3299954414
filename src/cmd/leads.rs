//! Lead board commands — `leadboard leads`.

use std::str::FromStr;

use anyhow::Result;
use console::style;

use leadboard::client::CrmClient;
use leadboard_common::{KanbanBoard, Lead, NewLead, Stage};

use super::super::{LeadsCommands, RemoteArgs};
use super::remote::connect;

pub async fn cmd_leads(remote: &RemoteArgs, command: LeadsCommands) -> Result<()> {
    let client = connect(remote).await?;

    match command {
        LeadsCommands::List => {
            let board = client.list_leads().await?;
            print_board(&board);
        }
        LeadsCommands::Add {
            name,
            company,
            email,
            phone,
            value,
            notes,
            status,
            source,
        } => {
            let status = status.as_deref().map(Stage::from_str).transpose()?;
            let lead = client
                .create_lead(&NewLead {
                    name,
                    company,
                    email,
                    phone,
                    value,
                    notes,
                    status,
                    source,
                })
                .await?;
            println!(
                "{} Created lead #{} in {}",
                style("✓").green(),
                lead.id,
                style(lead.status).bold()
            );
        }
        LeadsCommands::Move { id, status, order } => {
            let stage = Stage::from_str(&status)?;
            let lead = client.move_lead(id, stage, order).await?;
            println!(
                "{} Moved #{} {} to {}",
                style("✓").green(),
                lead.id,
                lead.name,
                style(lead.status).bold()
            );
        }
        LeadsCommands::Rm { id, force } => {
            let lead = client.get_lead(id).await?;
            if !force && !confirm_delete(&lead)? {
                println!("Cancelled.");
                return Ok(());
            }
            client.delete_lead(id).await?;
            println!("{} Deleted #{} {}", style("✓").green(), lead.id, lead.name);
        }
    }
    Ok(())
}

fn confirm_delete(lead: &Lead) -> Result<bool> {
    use dialoguer::Confirm;
    Ok(Confirm::new()
        .with_prompt(format!("Delete lead #{} {}?", lead.id, lead.name))
        .default(false)
        .interact()?)
}

/// Print every column of the board with its cards.
pub fn print_board(board: &KanbanBoard) {
    for (stage, leads) in board.columns() {
        println!(
            "{} {}",
            style(stage).bold().cyan(),
            style(format!("({})", leads.len())).dim()
        );
        for lead in leads {
            println!("  {}", format_lead(lead));
        }
    }
}

fn format_lead(lead: &Lead) -> String {
    let mut line = format!("#{} {}", lead.id, lead.name);
    if let Some(company) = lead.company.as_deref().filter(|c| !c.is_empty()) {
        line.push_str(&format!(" ({})", company));
    }
    if let Some(value) = lead.value {
        line.push_str(&format!(" ${:.2}", value));
    }
    line
}

/// Refresh and print the board after the assistant changed it.
pub async fn refresh_board(client: &CrmClient) -> Result<()> {
    let board = client.list_leads().await?;
    print_board(&board);
    Ok(())
}
