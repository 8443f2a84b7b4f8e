use super::ui;
use crate::App;
use crate::core::ledger::{DailySettlementRecord, UserId};
use crate::core::schedule::Scheduler;
use anyhow::{Context, Result};
use chrono::{Local, NaiveDate};
use comfy_table::{Cell, CellAlignment, Table};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::info;

/// Runs the slot scheduler until Ctrl-C. A settlement in progress finishes
/// before the command returns.
pub async fn serve(app: &App) -> Result<()> {
    let scheduler = Scheduler::new(
        Arc::clone(&app.engine),
        Duration::from_secs(app.config.settlement.sleep_chunk_secs),
    );
    let shutdown = CancellationToken::new();
    let handle = scheduler.spawn(shutdown.clone());
    println!(
        "{}",
        ui::style_text("Settlement scheduler running, press Ctrl-C to stop", ui::StyleType::Subtle)
    );

    tokio::signal::ctrl_c()
        .await
        .context("Failed to listen for Ctrl-C")?;
    info!("Shutdown requested");
    shutdown.cancel();
    handle.await.context("Scheduler task failed")?;
    Ok(())
}

pub async fn settle(app: &App, rollup: bool) -> Result<()> {
    let run = app.engine.trigger(rollup).await?;
    println!(
        "{} {} slot {}: {} settled, {} skipped{}",
        ui::style_text("Settled", ui::StyleType::TotalLabel),
        run.date,
        run.slot,
        ui::style_text(&run.count.to_string(), ui::StyleType::TotalValue),
        run.skipped,
        if run.rolled_up { ", rolled up" } else { "" }
    );
    Ok(())
}

pub async fn status(app: &App) -> Result<()> {
    match app.engine.status().await {
        Some(status) => println!(
            "Last successful run: {} slot {} at {}",
            status.date,
            status.slot,
            status.timestamp.with_timezone(&Local).format("%Y-%m-%d %H:%M:%S")
        ),
        None => println!(
            "{}",
            ui::style_text("No settlement has completed yet", ui::StyleType::Subtle)
        ),
    }
    Ok(())
}

pub async fn snapshots(app: &App, user: UserId, date: Option<NaiveDate>) -> Result<()> {
    let records = app.engine.daily_snapshots(user, date).await?;
    if records.is_empty() {
        println!("No settlement snapshots for user {user}.");
        return Ok(());
    }
    println!("{}", snapshot_table(&records));
    Ok(())
}

pub async fn recompute(app: &App, user: UserId, date: Option<NaiveDate>) -> Result<()> {
    let date = date.unwrap_or_else(|| Local::now().date_naive());
    let outcome = app.engine.recompute_totals(user, date).await?;
    println!(
        "Recomputed {date} for user {user}: {} position(s) updated",
        outcome.updated_count
    );
    Ok(())
}

fn snapshot_table(records: &[DailySettlementRecord]) -> Table {
    let mut table = ui::new_styled_table();
    table.set_header(
        ["Date", "Slot", "Code", "Name", "Amount", "Change", "Profit"]
            .into_iter()
            .map(ui::header_cell),
    );
    for record in records {
        table.add_row(vec![
            Cell::new(record.date),
            Cell::new(&record.time_slot),
            Cell::new(&record.code),
            Cell::new(record.fund_name.as_deref().unwrap_or("")),
            Cell::new(format!("{:.2}", record.amount)).set_alignment(CellAlignment::Right),
            ui::change_cell(record.pct),
            ui::profit_cell(record.profit),
        ]);
    }
    table
}
