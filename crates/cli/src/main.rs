//! ContentWorks CLI entry point.
//!
//! This binary is the composition root for the entire system. Responsibilities:
//!
//! 1. **Parse configuration**: load `contentworks.toml` and validate it before
//!    any item is touched.
//! 2. **Wire observability**: install the `tracing-subscriber` stack (plain or
//!    JSON lines, plus OTLP export when configured).
//! 3. **Construct infrastructure**: file-backed state store and operator
//!    queue, one [`CommandProducer`] per stage, one [`HttpPublisher`] per
//!    destination, all injected into [`PipelineExecutor`].
//! 4. **Dispatch the operator command.**
//!
//! Ctrl-C cancels in-flight stages and publishes; affected items are left
//! BLOCKED and can be resumed later.

mod config;
mod telemetry;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use nodes::{Collaborators, PipelineExecutor};
use pipeline::{
    DestinationId, Directive, ItemId, LoadedConfig, OperatorQueue, PlatformPublisher, SafetyTier,
    StageId, StageProducer, StateStore, TopicLabel,
};
use publisher::HttpPublisher;
use serde::Serialize;
use stage_command::CommandProducer;
use store::{FileOperatorQueue, FileStateStore};
use tracing::{info, warn};

use crate::config::AppConfig;

const NOTICES_FILE: &str = "notices.jsonl";

#[derive(Parser)]
#[command(name = "contentworks")]
#[command(version = env!("CARGO_PKG_VERSION"))]
#[command(about = "Staged content pipeline with quality gates and idempotent publishing", long_about = None)]
struct Cli {
    /// Path to contentworks.toml
    #[arg(long, global = true, env = "CONTENTWORKS_CONFIG", default_value = "contentworks.toml")]
    config: PathBuf,

    /// Directory holding items, escalation counters, publish records and blobs
    #[arg(long, global = true, env = "CONTENTWORKS_STATE_DIR", default_value = ".contentworks")]
    state_dir: PathBuf,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json_logs: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate the configuration and print every tier's stage plan
    CheckConfig,

    /// Queue a new item
    Submit {
        /// Topic label
        topic: String,

        /// Safety tier: safe, caution, danger or forbidden
        #[arg(long)]
        tier: SafetyTier,

        /// Start at this stage instead of the first (direct mode)
        #[arg(long, conflicts_with = "start_index")]
        start_stage: Option<String>,

        /// Start at this position of the tier's plan (direct mode)
        #[arg(long)]
        start_index: Option<usize>,
    },

    /// Run pending items, or one item by id
    Run {
        /// Run only this item
        #[arg(long)]
        item: Option<ItemId>,

        /// Items advanced concurrently
        #[arg(long, default_value = "4")]
        concurrency: usize,
    },

    /// Show one item, or a one-line summary of every item
    Status { item: Option<ItemId> },

    /// Resume a BLOCKED item
    Resume { item: ItemId },

    /// Close a BLOCKED item for good
    Close {
        item: ItemId,

        #[arg(long)]
        reason: String,
    },

    /// Clear a halted cohort so its pending items start again
    ResetCohort { tier: SafetyTier },

    /// Print the operator queue
    Notices,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let _telemetry = telemetry::init(cli.json_logs)?;

    let app = AppConfig::load(&cli.config)?;
    let loaded = Arc::new(
        app.validate()
            .with_context(|| format!("invalid configuration in {}", cli.config.display()))?,
    );

    match cli.command {
        Commands::CheckConfig => cmd_check_config(&loaded),
        Commands::Notices => cmd_notices(&cli.state_dir).await,
        command => {
            let executor = Arc::new(build_executor(&app, loaded, &cli.state_dir).await?);
            cancel_on_ctrl_c(&executor);
            dispatch(&executor, command).await
        }
    }
}

async fn dispatch(executor: &Arc<PipelineExecutor>, command: Commands) -> Result<()> {
    match command {
        Commands::Submit {
            topic,
            tier,
            start_stage,
            start_index,
        } => {
            let topic = TopicLabel::new(topic).context("topic must not be empty")?;
            let mut directive = Directive::new(topic, tier);
            directive.start_index = start_index;
            directive.start_stage = start_stage
                .map(|s| StageId::new(s).context("start stage must not be empty"))
                .transpose()?;
            let item = executor.submit(directive).await?;
            println!("{}", item.id());
        }
        Commands::Run { item: Some(id), .. } => {
            let item = executor.run_item(id).await?;
            print_json(&item)?;
        }
        Commands::Run {
            item: None,
            concurrency,
        } => {
            let summary = executor.run_pending(concurrency).await?;
            print_json(&summary)?;
        }
        Commands::Status { item: Some(id) } => print_json(&executor.status(id).await?)?,
        Commands::Status { item: None } => {
            for item in executor.list().await? {
                println!(
                    "{}  {:<11}  {:<9}  {}",
                    item.id(),
                    item.state(),
                    item.tier(),
                    item.topic()
                );
            }
        }
        Commands::Resume { item } => print_json(&executor.resume(item).await?)?,
        Commands::Close { item, reason } => print_json(&executor.close(item, reason).await?)?,
        Commands::ResetCohort { tier } => {
            let was_halted = executor.reset_cohort(tier).await?;
            if !was_halted {
                warn!(tier = %tier, "cohort was not halted");
            }
        }
        Commands::CheckConfig | Commands::Notices => {}
    }
    Ok(())
}

/// Builds the adapters named in `app` and wires them into an executor.
async fn build_executor(
    app: &AppConfig,
    loaded: Arc<LoadedConfig>,
    state_dir: &Path,
) -> Result<PipelineExecutor> {
    let store = FileStateStore::open(state_dir)
        .with_context(|| format!("opening state directory {}", state_dir.display()))?;
    let queue = FileOperatorQueue::open(state_dir.join(NOTICES_FILE))?;

    let mut producers: BTreeMap<StageId, Arc<dyn StageProducer>> = BTreeMap::new();
    for (stage, producer) in &app.producers {
        let id = StageId::new(stage.as_str()).context("stage names must not be empty")?;
        let command = CommandProducer::new(producer.command.clone(), producer.timeout())
            .with_context(|| format!("producer for stage '{stage}'"))?;
        producers.insert(id, Arc::new(command));
    }

    let mut publishers: Vec<Arc<dyn PlatformPublisher>> = Vec::new();
    for (name, destination) in &app.destinations {
        let id = DestinationId::new(name.as_str()).context("destination names must not be empty")?;
        let http = HttpPublisher::new(
            id,
            destination.endpoint.clone(),
            destination.token()?,
            destination.timeout(),
        )
        .with_context(|| format!("publisher for destination '{name}'"))?;
        publishers.push(Arc::new(http));
    }

    let executor = PipelineExecutor::new(
        loaded,
        Collaborators {
            producers,
            publishers,
            store: Arc::new(store) as Arc<dyn StateStore>,
            queue: Arc::new(queue) as Arc<dyn OperatorQueue>,
        },
    )
    .await
    .context("wiring the pipeline executor")?;
    info!(run = %executor.run_id(), state_dir = %state_dir.display(), "executor ready");
    Ok(executor)
}

fn cancel_on_ctrl_c(executor: &PipelineExecutor) {
    let token = executor.cancellation_token();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            warn!("interrupt received; cancelling in-flight work");
            token.cancel();
        }
    });
}

fn cmd_check_config(loaded: &LoadedConfig) -> Result<()> {
    for tier in SafetyTier::ALL {
        let plan = loaded.registry().plan_for(tier);
        let stages: Vec<String> = plan
            .stages()
            .iter()
            .map(|s| {
                if s.forbidden_in_tier {
                    format!("!{}", s.id)
                } else if s.required {
                    s.id.to_string()
                } else {
                    format!("({})", s.id)
                }
            })
            .collect();
        println!("{tier:<9} {}", stages.join(" -> "));
    }
    let publish = loaded.publish();
    let destinations: Vec<&str> = publish.destinations.iter().map(|d| d.as_str()).collect();
    println!("publish   {}", destinations.join(", "));
    Ok(())
}

async fn cmd_notices(state_dir: &Path) -> Result<()> {
    let queue = FileOperatorQueue::open(state_dir.join(NOTICES_FILE))?;
    for notice in queue.notices().await? {
        println!("{}", serde_json::to_string(&notice)?);
    }
    Ok(())
}

fn print_json(value: &impl Serialize) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;
    use pipeline::LifecycleState;

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn submit_rejects_both_start_positions() {
        let parsed = Cli::try_parse_from([
            "contentworks",
            "submit",
            "hydration",
            "--tier",
            "safe",
            "--start-stage",
            "fact-check",
            "--start-index",
            "1",
        ]);
        assert!(parsed.is_err());
    }

    #[test]
    fn run_parses_item_id() {
        let id = ItemId::new_random();
        let parsed = Cli::try_parse_from(["contentworks", "run", "--item", &id.to_string()]).unwrap();
        assert!(matches!(parsed.command, Commands::Run { item: Some(i), .. } if i == id));
    }

    #[tokio::test]
    async fn executor_wires_from_example_config() {
        let app = AppConfig::parse(include_str!("../../../config/contentworks.example.toml")).unwrap();
        let loaded = Arc::new(app.validate().unwrap());
        let dir = tempfile::tempdir().unwrap();
        let executor = build_executor(&app, loaded, dir.path()).await.unwrap();
        let item = executor
            .submit(Directive::new(TopicLabel::new("hydration").unwrap(), SafetyTier::Safe))
            .await
            .unwrap();
        assert_eq!(executor.status(item.id()).await.unwrap().state(), LifecycleState::Pending);
    }
}
