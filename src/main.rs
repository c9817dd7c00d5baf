mod cli;
mod ui;

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use batchflow::barrier::PartialPolicy;
use batchflow::config::EngineConfig;
use batchflow::logging::{self, LogFormat};
use batchflow::model::TransactionKind;
use batchflow::simulation::{FailurePlan, InMemoryEngine, SimulatedWorkers};
use batchflow::store::EntityStore;
use batchflow::topic::StageTopic;
use clap::Parser;
use cli::{Cli, Command, DemoArgs};
use tokio::time::Instant;
use ui::DemoProgress;
use uuid::Uuid;

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let format = if cli.json_logs { LogFormat::Json } else { LogFormat::Text };
    logging::init(cli.verbose, format);

    let mut config = match &cli.config {
        Some(path) => {
            let mut config = EngineConfig::load_from(path)
                .with_context(|| format!("reading configuration from {}", path.display()))?;
            config.apply_env_overrides(|key| std::env::var(key).ok())?;
            config
        }
        None => EngineConfig::load()?,
    };
    if let Some(max_retries) = cli.max_retries {
        config.max_retries = max_retries;
    }

    match cli.command {
        Command::Demo(args) => run_demo(&config, args).await,
        Command::Topics => {
            for topic in StageTopic::ALL {
                let level = if topic.is_transaction_level() { "transaction" } else { "batch" };
                println!("{topic:<36} {level}");
            }
            Ok(())
        }
        Command::Config => {
            print!("{}", toml::to_string_pretty(&config)?);
            Ok(())
        }
    }
}

async fn run_demo(config: &EngineConfig, args: DemoArgs) -> Result<()> {
    let mut settings = config.dispatcher_settings();
    settings.retry.retry_interval = Duration::from_millis(args.retry_delay_ms);
    if args.partial {
        settings.partial_policy = PartialPolicy::ProceedWithPartial;
    }
    if args.no_doc_upload {
        settings.default_options.doc_upload_enabled = false;
    }

    let mut engine = InMemoryEngine::new(
        settings,
        Some(config.context_ttl()),
        config.notification_webhook.as_deref(),
    )?;
    let requests = engine
        .take_requests()
        .context("stage request stream already taken")?;

    let plan = FailurePlan {
        transient: args.transient_failure.map(|topic| (topic, args.transient_attempts)),
        terminal: args.terminal_failure,
    };
    let workers = Arc::new(
        SimulatedWorkers::new(args.batches, plan).with_latency(Duration::from_millis(args.latency_ms)),
    );
    let worker_loop = workers.spawn(engine.dispatcher.clone(), requests);

    let kind = TransactionKind::from(args.kind);
    let simple = Uuid::new_v4().simple().to_string();
    let transaction_id = format!("T-{}", &simple[..8]);
    let progress = DemoProgress::start(&format!(
        "{kind} transaction {transaction_id} with {} batches",
        args.batches
    ));

    engine
        .dispatcher
        .ingest_transaction(&transaction_id, kind, None)
        .await?;

    let deadline = Instant::now() + Duration::from_secs(args.timeout_secs);
    let status = loop {
        let status = engine
            .store
            .transaction(&transaction_id)
            .await?
            .map(|txn| txn.status);
        if let Some(status) = status {
            progress.update(status);
        }
        if status.is_some_and(|s| s.is_terminal()) || Instant::now() >= deadline {
            break status;
        }
        tokio::time::sleep(Duration::from_millis(50)).await;
    };
    worker_loop.abort();
    let purged = engine.contexts.purge_expired();
    tracing::debug!(purged, "expired job contexts purged");

    progress.complete(&transaction_id, status);
    progress.print_timeline(&transaction_id, &engine.audit.timeline(&transaction_id));
    for link in engine.store.links(&transaction_id).await? {
        progress.print_timeline(&link.batch_id, &engine.audit.timeline(&link.batch_id));
    }
    progress.print_notifications(&engine.audit.notifications_for(&transaction_id));

    if !status.is_some_and(|s| s.is_terminal()) {
        anyhow::bail!(
            "transaction {transaction_id} did not finish within {}s",
            args.timeout_secs
        );
    }
    Ok(())
}
