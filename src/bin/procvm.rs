use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use procvm::config::EngineConfig;
use procvm::definition::loader::load_definition_from_yaml;
use procvm::migration::{MigrationOptions, MigrationPlan};
use procvm::runtime::engine::Engine;
use procvm::runtime::history::ChannelHistoryHandler;
use serde_json::Value;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;
use uuid::Uuid;

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    /// Engine configuration YAML
    #[arg(long, short, global = true)]
    config: Option<PathBuf>,

    /// Overrides the configured log filter
    #[arg(long, global = true)]
    log: Option<String>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Start a process instance and print its execution tree
    Run {
        /// Path to the process definition YAML file
        #[arg(long, short)]
        file: PathBuf,

        /// Initial variables (key=value)
        #[arg(long, short = 'D', value_parser = parse_key_val)]
        vars: Vec<(String, Value)>,
    },

    /// Load and validate a process definition
    Validate {
        #[arg(long, short)]
        file: PathBuf,
    },

    /// Start an instance on the source definition and migrate it
    Migrate {
        #[arg(long)]
        source: PathBuf,

        #[arg(long)]
        target: PathBuf,

        /// Path to the migration plan YAML file
        #[arg(long)]
        plan: PathBuf,

        #[arg(long, short = 'D', value_parser = parse_key_val)]
        vars: Vec<(String, Value)>,

        #[arg(long)]
        skip_custom_listeners: bool,

        #[arg(long)]
        skip_io_mappings: bool,
    },
}

fn parse_key_val(s: &str) -> Result<(String, Value), String> {
    let pos = s.find('=').ok_or_else(|| format!("invalid KEY=value: no `=` found in `{}`", s))?;
    let key = s[..pos].to_string();
    let val_str = &s[pos + 1..];
    // JSON if it parses, a plain string otherwise
    let val = serde_json::from_str(val_str).unwrap_or_else(|_| Value::String(val_str.to_string()));
    Ok((key, val))
}

fn load_plan(path: &Path) -> Result<MigrationPlan> {
    let content = fs::read_to_string(path)
        .with_context(|| format!("Failed to read migration plan from {}", path.display()))?;
    serde_yaml::from_str(&content).with_context(|| format!("Failed to deserialize migration plan from {}", path.display()))
}

async fn print_instance(engine: &Engine, instance_id: Uuid) -> Result<()> {
    if let Some(instance) = engine.process_instance(instance_id).await? {
        println!("process instance {} ({})", instance.id, instance.definition_id);
        println!("{}", instance.tree.render());
        println!("{}", instance.tree.activity_instance_tree(&instance.definition_id));
        println!("variables: {}", serde_json::to_string(&instance.tree.variables_local(instance.tree.root()))?);
    }
    Ok(())
}

/// Engine whose history events are logged by a background task.
fn engine_with_history(config: EngineConfig) -> Engine {
    let (handler, mut events) = ChannelHistoryHandler::new(config.history_channel_capacity);
    let mut engine = Engine::new(config);
    engine.set_history_handler(Arc::new(handler));
    tokio::spawn(async move {
        while let Some(event) = events.recv().await {
            debug!(?event, "history");
        }
    });
    engine
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut config = match &cli.config {
        Some(path) => EngineConfig::load(path)?,
        None => EngineConfig::default(),
    };
    if let Some(log) = cli.log {
        config.log_filter = log;
    }
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_filter));
    tracing_subscriber::fmt().with_env_filter(filter).init();

    match cli.command {
        Commands::Validate { file } => {
            let definition = load_definition_from_yaml(&file)?;
            info!("Process definition '{}' is valid", definition.id);
            println!(
                "{}: {} activities, {} transitions",
                definition.id,
                definition.activities.len(),
                definition.transitions.len()
            );
        }

        Commands::Run { file, vars } => {
            let engine = engine_with_history(config);
            let definition = engine.deploy(load_definition_from_yaml(&file)?)?;
            let variables: BTreeMap<_, _> = vars.into_iter().collect();
            let instance_id = engine.start_process_instance(&definition.id, variables).await?;
            info!("Process instance started: {}", instance_id);
            print_instance(&engine, instance_id).await?;
        }

        Commands::Migrate {
            source,
            target,
            plan,
            vars,
            skip_custom_listeners,
            skip_io_mappings,
        } => {
            let engine = engine_with_history(config);
            let source = engine.deploy(load_definition_from_yaml(&source)?)?;
            engine.deploy(load_definition_from_yaml(&target)?)?;
            let plan = load_plan(&plan)?;

            let variables: BTreeMap<_, _> = vars.into_iter().collect();
            let instance_id = engine.start_process_instance(&source.id, variables).await?;
            print_instance(&engine, instance_id).await?;

            let options = MigrationOptions {
                skip_custom_listeners,
                skip_io_mappings,
            };
            engine.migrate(instance_id, &plan, options).await?;
            info!("Process instance migrated to '{}'", plan.target_definition_id);
            print_instance(&engine, instance_id).await?;
        }
    }

    Ok(())
}
