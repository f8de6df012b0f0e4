use std::collections::HashMap;
use std::path::PathBuf;
use std::time::Duration;

use anyhow::Result;
use clap::{Parser, Subcommand};
use flowvm::compiler::Compiler;
use flowvm::compiler::loader::load_definition;
use flowvm::config::EngineConfig;
use flowvm::runtime::engine::Engine;
use serde_json::{Value, json};
use tracing::{info, warn};

#[derive(Parser)]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a process model in memory and print its final state
    Run {
        /// Path to the process YAML file
        file: PathBuf,

        /// Initial variables (key=value)
        #[arg(long, short = 'D', value_parser = parse_key_val)]
        vars: Vec<(String, Value)>,

        /// Signal the execution parked at this activity (repeatable)
        #[arg(long)]
        signal: Vec<String>,

        /// Deliver a message event (repeatable)
        #[arg(long)]
        message: Vec<String>,

        /// Broadcast a signal event (repeatable)
        #[arg(long)]
        event: Vec<String>,

        /// Keep firing timers for up to this many milliseconds
        #[arg(long)]
        timeout_ms: Option<u64>,

        /// Engine config YAML
        #[arg(long)]
        config: Option<PathBuf>,
    },

    /// Compile a process model and print a summary
    Check {
        /// Path to the process YAML file
        file: PathBuf,
    },
}

fn parse_key_val(s: &str) -> Result<(String, Value), String> {
    let pos = s.find('=').ok_or_else(|| format!("invalid KEY=value: no `=` found in `{}`", s))?;
    let key = s[..pos].to_string();
    let val_str = &s[pos + 1..];
    // Try parsing as JSON, otherwise treat as string
    let val = serde_json::from_str(val_str).unwrap_or_else(|_| Value::String(val_str.to_string()));
    Ok((key, val))
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt::init();
    let cli = Cli::parse();

    match cli.command {
        Commands::Run {
            file,
            vars,
            signal,
            message,
            event,
            timeout_ms,
            config,
        } => {
            let mut config = match config {
                Some(path) => EngineConfig::from_yaml_file(&path.to_string_lossy())?,
                None => EngineConfig::default(),
            };
            // the final state is read back after the instance may have ended
            config.retain_finished_instances = true;
            let compiler = Compiler::new();
            let (model, definition) = load_definition(&file.to_string_lossy(), &compiler)?;
            info!("Loaded process: {}", model.id);

            let engine = Engine::with_config(config);
            engine.deploy(definition);

            let mut initial_vars: HashMap<String, Value> = model.variables.clone();
            initial_vars.extend(vars);
            let instance_id = engine.start_process(&model.id, initial_vars).await?;
            info!("Process started: {}", instance_id);

            // signals first, then messages, then broadcast signal events
            for activity in &signal {
                engine.signal(instance_id, activity, None, None).await?;
            }
            for name in &message {
                if !engine.message(instance_id, name, None).await? {
                    warn!(message = %name, "nobody is waiting for message");
                }
            }
            for name in &event {
                let delivered = engine.broadcast_signal(name, None).await?;
                info!(signal = %name, delivered, "signal broadcast");
            }

            if let Some(ms) = timeout_ms {
                tokio::select! {
                    _ = engine.run_worker() => {}
                    _ = engine.wait_until_ended(instance_id) => {}
                    _ = tokio::time::sleep(Duration::from_millis(ms)) => {}
                }
            }

            let state = json!({
                "instance": instance_id,
                "ended": engine.is_ended(instance_id).await?,
                "active": engine.active_activity_ids(instance_id).await?,
                "variables": engine.get_instance_vars(instance_id).await?,
            });
            println!("{}", serde_json::to_string_pretty(&state)?);
        }

        Commands::Check { file } => {
            let compiler = Compiler::new();
            let (model, definition) = load_definition(&file.to_string_lossy(), &compiler)?;
            let initial = definition.initial().map(|a| a.id().to_string());
            let summary = json!({
                "process": model.id,
                "activities": definition.activities().count(),
                "transitions": definition.transitions().count(),
                "initial": initial,
            });
            println!("{}", serde_json::to_string_pretty(&summary)?);
        }
    }

    Ok(())
}
