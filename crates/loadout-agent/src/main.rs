use std::{path::PathBuf, process::ExitCode, sync::Arc};

use anyhow::Context;
use clap::{Parser, Subcommand};
use loadout_agent::{
    config::{self, Catalog},
    messages::{BuiltinMessages, MessageCatalog, fill, render_summary},
    session::{SessionError, SessionOrchestrator},
    settings::{Tuning, format_error_chain},
};
use loadout_model::{LaunchPlatform, Outcome, SessionReport};

#[derive(Debug, Parser)]
#[command(name = "loadout", version, about = "Start a game together with its companion apps and tools")]
struct Cli {
    /// Catalog file (defaults to <config dir>/loadout/loadout.toml).
    #[arg(long, global = true, env = "LOADOUT_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Debug, Subcommand)]
enum Command {
    /// List configured games.
    List,
    /// Validate the configuration and exit.
    Check,
    /// Run a session for a game until it exits (Ctrl-C ends monitoring).
    Launch {
        game: String,
        /// Print the session report as JSON.
        #[arg(long)]
        json: bool,
    },
}

fn init_tracing() -> Option<tracing_appender::non_blocking::WorkerGuard> {
    use tracing_subscriber::{EnvFilter, fmt, prelude::*};

    let filter = || EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let stderr = fmt::layer().with_writer(std::io::stderr);

    match std::env::var_os("LOADOUT_LOG_DIR").filter(|v| !v.is_empty()) {
        Some(dir) => {
            let (writer, guard) =
                tracing_appender::non_blocking(tracing_appender::rolling::daily(dir, "loadout.log"));
            tracing_subscriber::registry()
                .with(filter())
                .with(stderr)
                .with(fmt::layer().with_ansi(false).with_writer(writer))
                .init();
            Some(guard)
        }
        None => {
            tracing_subscriber::registry().with(filter()).with(stderr).init();
            None
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();
    let _guard = init_tracing();

    match run(cli).await {
        Ok(code) => code,
        Err(e) => {
            tracing::error!(error = %format_error_chain(&e), "loadout failed");
            ExitCode::from(2)
        }
    }
}

async fn run(cli: Cli) -> anyhow::Result<ExitCode> {
    let path = cli
        .config
        .or_else(config::default_config_path)
        .context("no config path; pass --config or set LOADOUT_CONFIG")?;
    let catalog = config::load_catalog(&path).await?;
    let messages = BuiltinMessages;

    match cli.command {
        Command::List => {
            list_games(&catalog, &messages);
            Ok(ExitCode::SUCCESS)
        }
        Command::Check => {
            let games = catalog.games().count().to_string();
            let apps = catalog.apps().count().to_string();
            println!(
                "{}",
                fill(&messages.text("config.ok"), &[("games", &*games), ("apps", &*apps)])
            );
            Ok(ExitCode::SUCCESS)
        }
        Command::Launch { game, json } => launch(catalog, &game, json, &messages).await,
    }
}

fn list_games(catalog: &Catalog, messages: &dyn MessageCatalog) {
    let mut any = false;
    for game in catalog.games() {
        any = true;
        let platform = match &game.platform {
            LaunchPlatform::Direct => "direct".to_string(),
            LaunchPlatform::Storefront { store } => format!("storefront:{store}"),
            LaunchPlatform::ManualExit => "manual-exit".to_string(),
        };
        println!("{}\t{}\t{platform}", game.id, game.display_name);
    }
    if !any {
        println!("{}", messages.text("game.list_empty"));
    }
}

async fn launch(catalog: Catalog, game: &str, json: bool, messages: &dyn MessageCatalog) -> anyhow::Result<ExitCode> {
    let orchestrator = SessionOrchestrator::new(Arc::new(catalog), Tuning::from_env());
    let handle = match orchestrator.launch(game) {
        Ok(h) => h,
        Err(SessionError::GameNotFound(id)) => {
            eprintln!("{}", fill(&messages.text("game.not_found"), &[("game", id.as_str())]));
            return Ok(ExitCode::from(2));
        }
        Err(e) => return Err(e.into()),
    };

    let canceller = handle.canceller();
    let cancelling = messages.text("session.cancelling");
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            eprintln!("{cancelling}");
            canceller.cancel();
        }
    });

    match handle.wait().await {
        Ok(report) => {
            print_report(&report, json, messages)?;
            if report.has_problems() {
                tracing::warn!(
                    failed = report.count(Outcome::Failed),
                    "session finished, but some actions failed"
                );
            }
            Ok(ExitCode::SUCCESS)
        }
        Err(SessionError::GameLaunch { report, detail }) => {
            tracing::error!(%detail, "game did not start");
            print_report(&report, json, messages)?;
            Ok(ExitCode::FAILURE)
        }
        Err(e) => Err(e.into()),
    }
}

fn print_report(report: &SessionReport, json: bool, messages: &dyn MessageCatalog) -> anyhow::Result<()> {
    if json {
        println!("{}", serde_json::to_string_pretty(report).context("failed to encode report")?);
    } else {
        println!("{}", render_summary(report, messages));
    }
    Ok(())
}
