// ABOUTME: Command-line entry point for the charbridge dispatch engine
// ABOUTME: Validates config, lists stored sessions, prints the lingering curve, runs the console

use anyhow::Result;
use charbridge::config::Config;
use charbridge::linger::LingerCurve;
use charbridge::{commands, console, logging};
use clap::{Parser, Subcommand};
use std::path::PathBuf;

#[derive(Parser)]
#[command(name = "charbridge", version, about = "Bridge chat platforms to character-chat backends")]
struct Cli {
    /// Config file (defaults to $CHARBRIDGE_CONFIG, then ./charbridge.toml)
    #[arg(short, long, global = true)]
    config: Option<PathBuf>,

    /// Emit logs as JSON lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Load and validate the config, then summarize it
    Check,
    /// List persisted surface-to-session bindings
    Sessions {
        /// Only this bot
        #[arg(long)]
        bot: Option<String>,
        /// Print JSON instead of a table
        #[arg(long)]
        json: bool,
    },
    /// Print the lingering chance table for the configured curve
    Curve {
        /// Seconds between samples
        #[arg(long, default_value_t = 1.0)]
        step: f64,
    },
    /// Chat with a bot from the terminal using the in-memory backend
    Console {
        /// Bot name (defaults to the first configured bot)
        #[arg(long)]
        bot: Option<String>,
        /// Treat the console as a private conversation
        #[arg(long)]
        private: bool,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenvy::dotenv().ok();
    let cli = Cli::parse();
    logging::init(cli.json_logs);

    let config = Config::load(cli.config.as_deref())?;
    tracing::debug!(bots = config.bots.len(), workspace = %config.workspace.path, "Configuration loaded");

    match cli.command {
        Command::Check => {
            println!("{}", commands::check_report(&config));
        }
        Command::Sessions { bot, json } => {
            let sessions = commands::list_sessions(&config, bot.as_deref())?;
            if json {
                println!("{}", serde_json::to_string_pretty(&sessions)?);
            } else {
                println!("{}", commands::render_sessions(&sessions));
            }
        }
        Command::Curve { step } => {
            let curve = LingerCurve::from_config(&config.lingering);
            let points = commands::curve_points(&curve, step)?;
            println!("{}", commands::render_curve(&points));
        }
        Command::Console { bot, private } => {
            let bot = match bot {
                Some(bot) => bot,
                None => config
                    .bots
                    .first()
                    .map(|b| b.name.clone())
                    .ok_or_else(|| anyhow::anyhow!("No bots configured"))?,
            };
            charbridge_core::metrics::register_metrics();
            console::run(config, &bot, private).await?;
        }
    }

    Ok(())
}
