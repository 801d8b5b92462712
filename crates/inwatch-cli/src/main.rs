use anyhow::Result;
use clap::{Parser, Subcommand};
use inwatch_sync::RunState;
use tracing::error;
use tracing_subscriber::EnvFilter;

const TEST_MESSAGE: &str = "See, this works!";
const DEFAULT_LOG_FILTER: &str =
    "inwatch_cli=info,inwatch_sync=info,inwatch_storage=info,inwatch_adapters=info,inwatch_notify=info";

#[derive(Debug, Parser)]
#[command(name = "inwatch-cli")]
#[command(about = "Insider Watch: notify new insider trades from the OpenInsider screener")]
struct Cli {
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    /// Scrape once, notify new trades and append them to the store.
    Run {
        /// Print the run report as JSON on stdout.
        #[arg(long)]
        json: bool,
    },
    /// Send one message to the configured room to check credentials.
    SendTest {
        message: Option<String>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(DEFAULT_LOG_FILTER)),
        )
        .init();

    let cli = Cli::parse();

    match cli.command.unwrap_or(Commands::Run { json: false }) {
        Commands::Run { json } => {
            let report = match inwatch_sync::run_once_from_env().await {
                Ok(report) => report,
                Err(err) => {
                    error!(state = ?RunState::Failed, "{err:#}");
                    return Err(err);
                }
            };
            if json {
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!(
                    "run complete: run_id={} scraped={} new={} notified={} persisted={} undelivered={}",
                    report.run_id,
                    report.scraped,
                    report.new_records,
                    report.notified,
                    report.persisted,
                    report.unformattable.len() + report.send_failures.len()
                );
            }
        }
        Commands::SendTest { message } => {
            let message = message.unwrap_or_else(|| TEST_MESSAGE.to_string());
            inwatch_sync::send_test_message_from_env(&message).await?;
            println!("test message sent");
        }
    }

    Ok(())
}
