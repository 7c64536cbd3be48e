//! Phaseflow CLI entry point.
//!
//! Binary name: `pflow`
//!
//! Parses CLI arguments, loads configuration and templates, recovers
//! persisted instances, then dispatches to the command handler. Every live
//! instance is persisted again before the process exits.

mod cli;
mod state;

use clap::Parser;
use clap_complete::generate;
use phaseflow_observe::tracing_setup::{init_tracing, shutdown_tracing, verbosity_filter};

use cli::instance::Operation;
use cli::{Cli, Commands, parse_area};
use state::AppState;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();

    init_tracing(verbosity_filter(cli.verbose, cli.quiet), cli.otel)
        .map_err(|e| anyhow::anyhow!(e))?;

    // Shell completions don't need app state
    if let Commands::Completions { shell } = &cli.command {
        let mut cmd = <Cli as clap::CommandFactory>::command();
        generate(*shell, &mut cmd, "pflow", &mut std::io::stdout());
        return Ok(());
    }

    let state = AppState::init(cli.data_dir.clone(), cli.templates.clone()).await?;
    if state.recovery.skipped > 0 {
        tracing::warn!(skipped = state.recovery.skipped, "some persisted instances could not be recovered");
    }

    let result = dispatch(&state, cli.command, cli.json).await;
    state.shutdown().await;
    shutdown_tracing();
    result
}

async fn dispatch(state: &AppState, command: Commands, json: bool) -> anyhow::Result<()> {
    match command {
        Commands::Run {
            template,
            phases,
            options,
        } => cli::instance::run(state, &template, phases, options.into_options()?, json).await,

        Commands::Start { template, options } => {
            cli::instance::start(state, &template, options.into_options()?, json).await
        }

        Commands::Next { id } => cli::instance::next(state, &id, json).await,

        Commands::Validate { id } => cli::instance::validate(state, &id, json).await,

        Commands::List {
            status,
            template,
            area,
        } => {
            let area = area.as_deref().map(parse_area).transpose()?;
            cli::instance::list(state, status, template, area, json).await
        }

        Commands::Show { id } => cli::instance::show(state, &id, json).await,

        Commands::Stats => cli::instance::stats(state, json).await,

        Commands::Pause { id } => cli::instance::operate(state, &id, Operation::Pause, json).await,

        Commands::Resume { id } => cli::instance::operate(state, &id, Operation::Resume, json).await,

        Commands::Cancel { id, reason } => {
            cli::instance::operate(state, &id, Operation::Cancel { reason }, json).await
        }

        Commands::Remove { id, archive } => cli::instance::remove(state, &id, archive, json).await,

        Commands::Templates => cli::template::list_templates(state, json).await,

        Commands::Completions { .. } => unreachable!("handled above"),
    }
}
