//! # colloquy-cli
//!
//! CLI for working with colloquy dialogue specifications: validate and
//! inspect a YAML spec, or chat with it in a REPL backed by file checkpoints
//! (so a conversation survives quitting and restarting the binary).

use anyhow::Context;
use clap::{Parser, Subcommand};
use std::collections::HashMap;
use std::io::{BufRead, Write};
use std::path::PathBuf;
use std::sync::Arc;

use colloquy_checkpoint::{CheckpointSaver, FileCheckpointSaver};
use colloquy_core::action::FnAction;
use colloquy_core::{ActionRegistry, CompiledSpec, DialogueEngine, DialogueSpec, Next};

mod nlu;

use nlu::HeuristicNlu;

#[derive(Parser)]
#[command(name = "colloquy")]
#[command(about = "Dialogue orchestration runtime - validate, inspect, and chat with flow specs", long_about = None)]
#[command(version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Validate a YAML dialogue specification and compile its flows
    Validate {
        /// Path to the YAML spec
        file: PathBuf,
    },

    /// Print the compiled node graph of each flow
    Inspect {
        /// Path to the YAML spec
        file: PathBuf,

        /// Limit output to one flow
        #[arg(short, long)]
        flow: Option<String>,
    },

    /// Chat with a spec using the built-in heuristic NLU
    Chat {
        /// Path to the YAML spec
        file: PathBuf,

        /// Session key (conversations with the same key resume)
        #[arg(short, long, default_value = "local")]
        session: String,

        /// Directory for session checkpoints
        #[arg(long, default_value = ".colloquy/sessions")]
        state_dir: PathBuf,
    },
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("warn")),
        )
        .init();

    let cli = Cli::parse();
    match cli.command {
        Commands::Validate { file } => validate(&file),
        Commands::Inspect { file, flow } => inspect(&file, flow.as_deref()),
        Commands::Chat {
            file,
            session,
            state_dir,
        } => chat(&file, &session, &state_dir).await,
    }
}

fn load(file: &PathBuf) -> anyhow::Result<(DialogueSpec, CompiledSpec)> {
    let spec = DialogueSpec::from_path(file)
        .with_context(|| format!("failed to load {}", file.display()))?;
    let compiled = CompiledSpec::compile(&spec).context("compilation failed")?;
    Ok((spec, compiled))
}

fn validate(file: &PathBuf) -> anyhow::Result<()> {
    let (spec, compiled) = load(file)?;

    println!("OK: {} flows compiled", spec.flows.len());
    for name in compiled.flow_names() {
        let graph = compiled.flow(name)?;
        let unreachable = graph.unreachable_steps();
        if unreachable.is_empty() {
            println!("  {} ({} steps)", name, graph.len());
        } else {
            println!(
                "  {} ({} steps, unreachable: {})",
                name,
                graph.len(),
                unreachable.join(", ")
            );
        }
    }
    Ok(())
}

fn inspect(file: &PathBuf, only_flow: Option<&str>) -> anyhow::Result<()> {
    let (_, compiled) = load(file)?;

    for name in compiled.flow_names() {
        if let Some(only) = only_flow {
            if only != name {
                continue;
            }
        }
        let graph = compiled.flow(name)?;
        println!("flow {}:", name);
        for node in graph.nodes() {
            let next = match node.next {
                Next::Step(i) => format!("-> {}", i),
                Next::End => "-> END".to_string(),
            };
            println!("  [{:>2}] {:<24} {:<8} {}", node.index, node.name, node.kind.name(), next);
        }
    }
    Ok(())
}

async fn chat(file: &PathBuf, session: &str, state_dir: &PathBuf) -> anyhow::Result<()> {
    let (spec, _) = load(file)?;
    let nlu = Arc::new(HeuristicNlu::new(&spec));
    let checkpointer = Arc::new(
        FileCheckpointSaver::new(state_dir.clone())
            .await
            .context("failed to open the checkpoint directory")?,
    );

    // Declared actions get stub handlers so any spec is chattable without
    // wiring real integrations; they succeed and return no outputs.
    let mut registry = ActionRegistry::new();
    for action in &spec.actions {
        let name = action.clone();
        registry = registry.register(
            action.clone(),
            Arc::new(FnAction(move |_slots: HashMap<String, serde_json::Value>| {
                let name = name.clone();
                async move {
                    tracing::info!(action = %name, "stub action invoked");
                    Ok::<_, colloquy_core::ActionError>(HashMap::new())
                }
            })),
        );
    }

    let engine = DialogueEngine::builder(spec)
        .with_nlu(nlu)
        .with_actions(registry)
        .with_checkpointer(checkpointer as Arc<dyn CheckpointSaver>)
        .build()
        .context("failed to build the engine")?;

    println!("colloquy chat - session '{}' (blank line or ctrl-D to quit)", session);
    let stdin = std::io::stdin();
    let mut stdout = std::io::stdout();

    loop {
        print!("you> ");
        stdout.flush()?;
        let mut line = String::new();
        if stdin.lock().read_line(&mut line)? == 0 {
            break;
        }
        let utterance = line.trim();
        if utterance.is_empty() {
            break;
        }

        match engine.process_turn(session, utterance).await {
            Ok(result) => println!("bot> {}", result.response),
            Err(e) => {
                tracing::error!(error = %e, "turn failed");
                println!("bot> (error: {})", e);
            }
        }
    }

    // Flush anything buffered under `exit` durability before quitting.
    engine.flush().await?;
    println!("bye");
    Ok(())
}
