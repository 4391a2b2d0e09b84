//! fieldsync CLI - queue field assessment data offline and sync it when a link is available

mod cli;
mod commands;
mod error;


use clap::Parser;
use tracing_subscriber::filter::Directive;
use tracing_subscriber::EnvFilter;

use crate::cli::{
    Cli, Commands, ConflictsCommand, QueueCommand, RulesCommand, SyncCommand, UpdatesCommand,
};
use crate::commands::common::{open_runtime, RuntimeOptions};
use crate::commands::conflicts::{
    run_conflicts_audit, run_conflicts_list, run_conflicts_override, run_conflicts_resolve,
    run_conflicts_show, run_conflicts_stats, run_conflicts_suggest,
};
use crate::commands::queue::{run_queue_add, run_queue_list, run_queue_rescore};
use crate::commands::rules::{run_rules_add, run_rules_list, run_rules_set_active};
use crate::commands::sync::{run_sync, run_sync_history, run_sync_status, run_sync_watch};
use crate::commands::updates::{
    run_updates_get, run_updates_retry, run_updates_rollback, run_updates_rollback_failed,
    run_updates_show, run_updates_stats,
};
use crate::error::CliError;

#[tokio::main]
async fn main() {
    if let Err(error) = run().await {
        eprintln!("Error: {error}");
        std::process::exit(1);
    }
}

async fn run() -> Result<(), CliError> {
    dotenvy::dotenv().ok();

    let directive = "fieldsync=info"
        .parse::<Directive>()
        .map_err(|error| CliError::Config(format!("log filter: {error}")))?;
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(directive))
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();
    let options = RuntimeOptions::resolve(cli.db_path, cli.config, cli.server_url, cli.api_token);
    let server_configured = options.server_url.is_some();
    let runtime = open_runtime(&options)?;
    let json = cli.json;

    match cli.command {
        Commands::Queue(command) => match command {
            QueueCommand::Add(args) => run_queue_add(args, json, &runtime).await?,
            QueueCommand::List { limit } => run_queue_list(limit, json, &runtime).await?,
            QueueCommand::Rescore => run_queue_rescore(json, &runtime).await?,
        },
        Commands::Rules(command) => match command {
            RulesCommand::Add(args) => run_rules_add(args, json, &runtime).await?,
            RulesCommand::List => run_rules_list(json, &runtime).await?,
            RulesCommand::Disable { id } => run_rules_set_active(&id, false, &runtime).await?,
            RulesCommand::Enable { id } => run_rules_set_active(&id, true, &runtime).await?,
        },
        Commands::Conflicts(command) => match command {
            ConflictsCommand::List(args) => run_conflicts_list(args, json, &runtime).await?,
            ConflictsCommand::Show { id } => run_conflicts_show(&id, json, &runtime).await?,
            ConflictsCommand::Resolve(args) => run_conflicts_resolve(args, json, &runtime).await?,
            ConflictsCommand::Override(args) => {
                run_conflicts_override(args, json, &runtime).await?;
            }
            ConflictsCommand::Audit {
                entity_id,
                include_resolved,
            } => run_conflicts_audit(&entity_id, include_resolved, json, &runtime).await?,
            ConflictsCommand::Suggest { id } => run_conflicts_suggest(&id, json, &runtime).await?,
            ConflictsCommand::Stats => run_conflicts_stats(json, &runtime).await?,
        },
        Commands::Updates(command) => match command {
            UpdatesCommand::Stats => run_updates_stats(json, &runtime).await?,
            UpdatesCommand::Show {
                entity_type,
                entity_id,
            } => run_updates_show(entity_type.into(), &entity_id, json, &runtime).await?,
            UpdatesCommand::Get { id } => run_updates_get(&id, json, &runtime).await?,
            UpdatesCommand::Retry { id } => run_updates_retry(&id, json, &runtime).await?,
            UpdatesCommand::Rollback { id } => run_updates_rollback(&id, json, &runtime).await?,
            UpdatesCommand::RollbackFailed => run_updates_rollback_failed(json, &runtime).await?,
        },
        Commands::Sync(command) => match command {
            SyncCommand::Run { reason } => {
                run_sync(&reason, server_configured, json, &runtime).await?;
            }
            SyncCommand::Watch => run_sync_watch(server_configured, &runtime).await?,
            SyncCommand::Status => run_sync_status(json, &runtime).await?,
            SyncCommand::History { limit } => run_sync_history(limit, json, &runtime).await?,
        },
    }

    Ok(())
}
