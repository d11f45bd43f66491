//! Event dispatch daemon for the identity platform.
//!
//! `run` starts the dispatch pipeline for the configured subscriptions and
//! runs until SIGHUP/SIGTERM. `stats` and `requeue` are operator utilities
//! against the same change log.

use std::sync::Arc;

use anyhow::Context;
use clap::{Parser, Subcommand};
use sqlx::postgres::PgPoolOptions;
use tracing::info;

use campusidm_core::{EventId, TargetSystem};
use campusidm_dispatch::changelog::{ChangeLog, PostgresChangeLog};
use campusidm_dispatch::config::DaemonConfig;
use campusidm_dispatch::handler::HandlerRegistry;
use campusidm_dispatch::notify::{NotificationSource, PgNotificationSource};
use campusidm_dispatch::supervisor::{Supervisor, SupervisorOptions};

#[derive(Parser)]
#[command(name = "campusidm-eventd", about = "Identity platform event dispatch daemon")]
struct Cli {
    /// Change log connection string. Overrides the config file.
    #[arg(long, env = "DATABASE_URL", global = true)]
    database_url: Option<String>,

    /// Path to the daemon configuration file.
    #[arg(long, default_value = "/etc/campusidm/eventd.json", global = true)]
    config: String,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Run the dispatch pipeline until a termination signal arrives.
    Run {
        /// Run only the subscription for this target system.
        #[arg(long)]
        target_system: Option<String>,

        /// Disable live collectors; rely on backfill sweeps alone.
        #[arg(long)]
        no_listener: bool,

        /// Disable backfill collectors; deliver notifications only.
        #[arg(long)]
        no_collector: bool,
    },

    /// Print delivery statistics for one target system as JSON.
    Stats {
        #[arg(long)]
        target_system: String,

        /// Also list the permanently failed and locked events behind the
        /// counts.
        #[arg(long)]
        list: bool,
    },

    /// Take one failure off an event's count so sweeps retry it again.
    Requeue {
        #[arg(long)]
        target_system: String,

        #[arg(long)]
        event_id: i64,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    campusidm_observability::init();

    let cli = Cli::parse();
    let config = DaemonConfig::from_file(&cli.config)
        .with_context(|| format!("loading config from {}", cli.config))?;

    let database_url = cli
        .database_url
        .or_else(|| config.database_url.clone())
        .context("no database URL; set DATABASE_URL or database_url in the config file")?;

    let pool = PgPoolOptions::new()
        .max_connections(10)
        .connect(&database_url)
        .await
        .context("connecting to the change log")?;
    let changelog: Arc<dyn ChangeLog> =
        Arc::new(PostgresChangeLog::new(pool.clone(), database_url));

    match cli.command {
        Command::Run {
            target_system,
            no_listener,
            no_collector,
        } => {
            let subscriptions = config.select(target_system.as_deref())?;
            let options = SupervisorOptions {
                queue_capacity: config.queue_capacity,
                disable_listener: no_listener,
                disable_collector: no_collector,
            };
            let source: Arc<dyn NotificationSource> = Arc::new(PgNotificationSource::new(pool));
            let registry = HandlerRegistry::with_builtins();

            let supervisor =
                Supervisor::start(&subscriptions, &options, &registry, changelog, source)?;
            info!(subscriptions = subscriptions.len(), "daemon started");
            supervisor.wait_for_shutdown().await?;
        }

        Command::Stats {
            target_system,
            list,
        } => {
            let target = TargetSystem::new(&target_system)?;
            let fail_limit = config
                .select(Some(&target_system))
                .map(|subs| subs[0].fail_limit)
                .unwrap_or(10);
            let stats = changelog.target_stats(&target, fail_limit).await?;
            if list {
                let events = changelog.failed_and_locked_events(&target, fail_limit).await?;
                let report = serde_json::json!({ "stats": stats, "events": events });
                println!("{}", serde_json::to_string_pretty(&report)?);
            } else {
                println!("{}", serde_json::to_string_pretty(&stats)?);
            }
        }

        Command::Requeue {
            target_system,
            event_id,
        } => {
            let target = TargetSystem::new(&target_system)?;
            let id = EventId::new(event_id);
            changelog.decrement_failed_count(id, &target).await?;
            info!(
                event_id = id.as_i64(),
                target_system = %target,
                "failure count decremented",
            );
        }
    }

    Ok(())
}
