use anyhow::{Context, Result};
use chrono::NaiveDate;
use clap::{Args, CommandFactory, Parser, Subcommand};
use fundwatch::AppCommand;
use fundwatch::cli::setup::{setup, setup_at_path};
use fundwatch::core::fund::{FundCode, FundId};
use fundwatch::core::log::init_logging;
use fundwatch::core::positions::{NewPosition, PositionUpdate};
use tracing::level_filters::LevelFilter;

#[derive(Parser)]
#[command(version, about)]
struct Cli {
    /// Enable verbose logging
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Path to optional configuration file
    #[arg(short, long, global = true)]
    config_path: Option<String>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Args)]
struct UserArg {
    /// Owner of the positions
    #[arg(short, long)]
    user: u64,
}

#[derive(Subcommand)]
enum Commands {
    /// Create default configuration
    Setup,
    /// Run the settlement scheduler until Ctrl-C
    Serve,
    /// Settle every position now
    Settle {
        /// Also roll today's profit into lifetime earnings
        #[arg(long)]
        rollup: bool,
    },
    /// Show the last successful settlement run
    Status,
    /// List settlement snapshots
    Snapshots {
        #[command(flatten)]
        user: UserArg,
        /// Day to list (YYYY-MM-DD); the most recent records otherwise
        #[arg(short, long)]
        date: Option<NaiveDate>,
    },
    /// Add a day's settled profit to lifetime earnings
    Recompute {
        #[command(flatten)]
        user: UserArg,
        /// Day to recompute (YYYY-MM-DD); today otherwise
        #[arg(short, long)]
        date: Option<NaiveDate>,
    },
    /// Match a fund name against the directory
    Resolve { name: String },
    /// List a user's positions
    Positions {
        #[command(flatten)]
        user: UserArg,
    },
    /// Add or replace a position
    Add {
        #[command(flatten)]
        user: UserArg,
        #[arg(long, required_unless_present = "name")]
        code: Option<String>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        amount: Option<f64>,
        #[arg(long)]
        return_rate: Option<f64>,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Edit a position; `name:<text>` selects an unresolved one
    Update {
        #[command(flatten)]
        user: UserArg,
        id: String,
        /// Move the position to this fund code
        #[arg(long)]
        code: Option<String>,
        #[arg(long)]
        name: Option<String>,
        #[arg(long)]
        amount: Option<f64>,
        #[arg(long)]
        total_earnings: Option<f64>,
        #[arg(long)]
        return_rate: Option<f64>,
        #[arg(long)]
        notes: Option<String>,
    },
    /// Remove positions; `name:<text>` selects an unresolved one
    Remove {
        #[command(flatten)]
        user: UserArg,
        #[arg(required = true)]
        ids: Vec<String>,
    },
    /// Retry code resolution for unresolved positions
    CompleteCodes {
        #[command(flatten)]
        user: UserArg,
    },
    /// Load the fund code list into the directory
    SyncDirectory {
        #[arg(long)]
        limit: Option<usize>,
        #[arg(long, default_value_t = 0)]
        offset: usize,
    },
    /// Fetch full fund profiles into the directory
    Ingest {
        #[arg(required = true)]
        codes: Vec<String>,
    },
}

fn parse_id(raw: &str) -> Result<FundId> {
    FundId::parse(raw).with_context(|| format!("Invalid position id '{raw}'"))
}

fn parse_code(raw: &str) -> Result<FundCode> {
    FundCode::parse(raw).with_context(|| format!("Invalid fund code '{raw}'"))
}

impl TryFrom<Commands> for AppCommand {
    type Error = anyhow::Error;

    fn try_from(cmd: Commands) -> Result<AppCommand> {
        Ok(match cmd {
            Commands::Serve => AppCommand::Serve,
            Commands::Settle { rollup } => AppCommand::Settle { rollup },
            Commands::Status => AppCommand::Status,
            Commands::Snapshots { user, date } => AppCommand::Snapshots {
                user: user.user,
                date,
            },
            Commands::Recompute { user, date } => AppCommand::Recompute {
                user: user.user,
                date,
            },
            Commands::Resolve { name } => AppCommand::Resolve { name },
            Commands::Positions { user } => AppCommand::Positions { user: user.user },
            Commands::Add {
                user,
                code,
                name,
                amount,
                return_rate,
                notes,
            } => AppCommand::Add {
                user: user.user,
                position: NewPosition {
                    code,
                    name,
                    amount,
                    return_rate,
                    notes,
                    ..Default::default()
                },
            },
            Commands::Update {
                user,
                id,
                code,
                name,
                amount,
                total_earnings,
                return_rate,
                notes,
            } => AppCommand::Update {
                user: user.user,
                id: parse_id(&id)?,
                update: PositionUpdate {
                    code,
                    fund_name: name,
                    amount,
                    total_earnings,
                    return_rate,
                    notes,
                    ..Default::default()
                },
            },
            Commands::Remove { user, ids } => AppCommand::Remove {
                user: user.user,
                ids: ids.iter().map(|id| parse_id(id)).collect::<Result<_>>()?,
            },
            Commands::CompleteCodes { user } => AppCommand::CompleteCodes { user: user.user },
            Commands::SyncDirectory { limit, offset } => AppCommand::SyncDirectory { limit, offset },
            Commands::Ingest { codes } => AppCommand::Ingest {
                codes: codes.iter().map(|c| parse_code(c)).collect::<Result<_>>()?,
            },
            Commands::Setup => unreachable!("Setup command should be handled separately"),
        })
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    let default_level = match cli.command {
        Some(Commands::Serve) => LevelFilter::INFO,
        _ => LevelFilter::WARN,
    };
    init_logging(cli.verbose, default_level);

    let result = match cli.command {
        Some(Commands::Setup) => match cli.config_path.as_deref() {
            Some(path) => setup_at_path(path),
            None => setup(),
        },
        Some(cmd) => match AppCommand::try_from(cmd) {
            Ok(command) => fundwatch::run_command(command, cli.config_path.as_deref()).await,
            Err(e) => Err(e),
        },
        None => {
            Cli::command().print_help()?;
            Ok(())
        }
    };

    if let Err(e) = &result {
        tracing::error!(error = %e, "Application failed");
    }
    result
}
