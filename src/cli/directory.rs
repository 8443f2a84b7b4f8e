use super::ui;
use crate::App;
use crate::core::fund::FundCode;
use crate::core::resolver::MatchRule;
use anyhow::Result;

/// Profiles requested per progress bar step.
const INGEST_CHUNK: usize = 20;

pub async fn resolve(app: &App, name: &str) -> Result<()> {
    match app.resolver.resolve_match(name).await? {
        Some(found) => {
            let rule = match found.rule {
                MatchRule::Exact => "exact".to_string(),
                MatchRule::Normalized => "normalized".to_string(),
                MatchRule::Contains => "contains".to_string(),
                MatchRule::Similar(ratio) => format!("similarity {ratio:.2}"),
            };
            println!(
                "{} {} ({})",
                ui::style_text(found.code.as_str(), ui::StyleType::TotalValue),
                found.name,
                ui::style_text(&rule, ui::StyleType::Subtle)
            );
        }
        None => println!(
            "{}",
            ui::style_text(&format!("No fund matches '{name}'"), ui::StyleType::Error)
        ),
    }
    Ok(())
}

pub async fn sync(app: &App, limit: Option<usize>, offset: usize) -> Result<()> {
    let written = app.directory.sync_directory(limit, offset).await?;
    app.resolver.refresh().await;
    println!("Wrote {written} fund(s) to the directory");
    Ok(())
}

pub async fn ingest(app: &App, codes: &[FundCode]) -> Result<()> {
    let pb = ui::new_progress_bar(codes.len() as u64);
    let mut written = 0;
    for chunk in codes.chunks(INGEST_CHUNK) {
        written += app.directory.ingest_profiles(chunk).await?;
        pb.inc(chunk.len() as u64);
    }
    pb.finish_and_clear();
    app.resolver.refresh().await;

    for code in codes {
        if let Some(profile) = app.directory.fund_profile(code).await? {
            println!(
                "{} {} {} {}",
                profile.code,
                profile.name,
                ui::style_text(profile.company.as_deref().unwrap_or("-"), ui::StyleType::Subtle),
                profile.managers.join(", ")
            );
        }
    }
    println!("Ingested {written} of {} profile(s)", codes.len());
    Ok(())
}
