use super::ui;
use crate::App;
use crate::core::fund::FundId;
use crate::core::ledger::{PositionRecord, UserId};
use crate::core::positions::{NewPosition, PositionUpdate};
use anyhow::Result;
use chrono::Local;
use comfy_table::{Cell, Color, Table};

pub async fn list(app: &App, user: UserId) -> Result<()> {
    let positions = app.ledger.list(user).await?;
    if positions.is_empty() {
        println!("User {user} holds no positions.");
        return Ok(());
    }

    println!(
        "\nPositions of user {}",
        ui::style_text(&user.to_string(), ui::StyleType::Title)
    );
    println!("{}", positions_table(&positions));

    let total_amount: f64 = positions.iter().filter_map(|p| p.amount).sum();
    let total_earnings: f64 = positions.iter().map(|p| p.total_earnings).sum();
    println!(
        "{} {:.2}   {} {}",
        ui::style_text("Amount:", ui::StyleType::TotalLabel),
        total_amount,
        ui::style_text("Total earnings:", ui::StyleType::TotalLabel),
        ui::style_text(&format!("{total_earnings:+.2}"), ui::StyleType::TotalValue)
    );
    Ok(())
}

pub async fn add(app: &App, user: UserId, position: NewPosition) -> Result<()> {
    match app.ledger.add(user, position).await? {
        FundId::Resolved(code) => println!("Saved position {code}"),
        FundId::Unresolved(name) => println!(
            "{}",
            ui::style_text(
                &format!("Saved position '{name}' without a fund code; run complete-codes later"),
                ui::StyleType::Error
            )
        ),
    }
    Ok(())
}

pub async fn update(app: &App, user: UserId, id: &FundId, update: PositionUpdate) -> Result<()> {
    let updated = app.ledger.update(user, id, update).await?;
    if &updated == id {
        println!("Updated position {updated}");
    } else {
        println!("Moved position {id} to {updated}");
    }
    Ok(())
}

pub async fn remove(app: &App, user: UserId, ids: &[FundId]) -> Result<()> {
    let deleted = app.ledger.remove_many(user, ids).await?;
    println!("Removed {deleted} of {} position(s)", ids.len());
    Ok(())
}

pub async fn complete_codes(app: &App, user: UserId) -> Result<()> {
    let outcome = app.ledger.complete_codes(user).await?;
    for (name, code) in &outcome.completed {
        println!("{name} -> {code}");
    }
    for (name, code) in &outcome.already_held {
        println!(
            "{}",
            ui::style_text(&format!("{name} -> {code} (already held, kept as is)"), ui::StyleType::Subtle)
        );
    }
    for name in &outcome.not_found {
        println!("{}", ui::style_text(&format!("{name}: not found"), ui::StyleType::Error));
    }
    println!(
        "{} completed, {} not found",
        outcome.completed.len(),
        outcome.not_found.len()
    );
    Ok(())
}

fn positions_table(positions: &[PositionRecord]) -> Table {
    let mut table = ui::new_styled_table();
    table.set_header(
        [
            "Id", "Name", "Amount", "Latest", "Total", "Return", "Notes", "Updated",
        ]
        .into_iter()
        .map(ui::header_cell),
    );
    for position in positions {
        let id_cell = match &position.id {
            FundId::Resolved(code) => Cell::new(code),
            FundId::Unresolved(_) => Cell::new("unresolved").fg(Color::Yellow),
        };
        let name = match &position.id {
            FundId::Unresolved(name) => Some(name.as_str()),
            FundId::Resolved(_) => position.fund_name.as_deref(),
        };
        table.add_row(vec![
            id_cell,
            Cell::new(name.unwrap_or("")),
            ui::format_optional_cell(position.amount, |v| format!("{v:.2}")),
            match position.earnings_yesterday {
                Some(profit) => ui::profit_cell(profit),
                None => ui::format_optional_cell(None::<f64>, |v| v.to_string()),
            },
            ui::profit_cell(position.total_earnings),
            ui::format_optional_cell(position.return_rate, |v| format!("{v:.2}%")),
            Cell::new(position.notes.as_deref().unwrap_or("")),
            Cell::new(position.updated_at.with_timezone(&Local).format("%Y-%m-%d %H:%M")),
        ]);
    }
    table
}
