use std::collections::HashMap;
use std::sync::Arc;

use anyhow::{Context as _, Result};
use clap::Parser;
use directories::BaseDirs;

use rcodegen_core::events::TracingEventSink;
use rcodegen_core::executor_tool::ToolRegistry;
use rcodegen_core::options::RunOptions;
use rcodegen_core::tool::EchoTool;
use rcodegen_core::{Orchestrator, bundle, cancel::CancellationToken};

mod cli;

use cli::{Cli, Commands, OutputFormat};

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .try_init()
        .ok();

    let cli = Cli::parse();
    let home = BaseDirs::new()
        .map(|b| b.home_dir().to_path_buf())
        .context("could not determine home directory")?;

    match cli.command {
        Commands::List => {
            let names = match &cli.bundles_dir {
                Some(dir) => bundle::list_from(dir)?,
                None => bundle::list(&home)?,
            };
            for name in names {
                println!("{name}");
            }
            Ok(())
        }
        Commands::Run { bundle: name, inputs } => {
            run_bundle(&home, &name, inputs, cli.format, cli.no_lock, cli.bundles_dir).await
        }
    }
}

async fn run_bundle(
    home: &std::path::Path,
    bundle_name: &str,
    inputs: Vec<(String, String)>,
    format: OutputFormat,
    no_lock: bool,
    bundles_dir: Option<std::path::PathBuf>,
) -> Result<()> {
    let mut options = RunOptions::new(home.to_path_buf(), home.join(".rcodegen"));
    options.lock_enabled = !no_lock;
    options.bundles_dir = bundles_dir;

    let bundle = match &options.bundles_dir {
        Some(dir) => bundle::load_from(dir, bundle_name),
        None => bundle::load(home, bundle_name),
    }
    .context("failed to load bundle")?;

    let mut tools: ToolRegistry = HashMap::new();
    tools.insert("echo".to_string(), Arc::new(EchoTool));

    let orchestrator = Orchestrator::new(tools, Arc::new(TracingEventSink));

    let identifier = std::env::current_dir()
        .ok()
        .and_then(|p| p.file_name().map(|n| n.to_string_lossy().into_owned()))
        .unwrap_or_else(|| "unknown".to_string());

    let cancel = CancellationToken::new();
    let cancel_for_signal = cancel.clone();
    tokio::spawn(async move {
        wait_for_termination_signal().await;
        tracing::warn!("received interrupt, cancelling run");
        cancel_for_signal.cancel();
    });

    let inputs: HashMap<String, String> = inputs.into_iter().collect();
    let envelope = orchestrator
        .run(&bundle, inputs, &options, &identifier, cancel)
        .await;

    match format {
        OutputFormat::Json => {
            println!("{}", serde_json::to_string_pretty(&envelope)?);
        }
        OutputFormat::Text => {
            println!("status: {}", envelope.status);
            if let Some(error) = &envelope.error {
                println!("error: [{}] {}", error.code, error.message);
            }
            println!(
                "cost_usd: {:.4}  input_tokens: {}  output_tokens: {}",
                envelope.metrics.cost_usd, envelope.metrics.input_tokens, envelope.metrics.output_tokens
            );
        }
    }

    if envelope.status.is_failure() {
        std::process::exit(1);
    }
    Ok(())
}

/// Resolves on the first of SIGINT or (on unix) SIGTERM. Mirrors the
/// teacher's `execute_transport_with_signal` split: a real SIGTERM
/// listener races alongside `ctrl_c()` under `#[cfg(unix)]`, with a
/// SIGINT-only fallback elsewhere.
#[cfg(unix)]
async fn wait_for_termination_signal() {
    let mut sigterm = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
        Ok(s) => s,
        Err(e) => {
            tracing::warn!(error = %e, "failed to register SIGTERM handler, SIGINT only");
            let _ = tokio::signal::ctrl_c().await;
            return;
        }
    };
    tokio::select! {
        _ = sigterm.recv() => {}
        _ = tokio::signal::ctrl_c() => {}
    }
}

#[cfg(not(unix))]
async fn wait_for_termination_signal() {
    let _ = tokio::signal::ctrl_c().await;
}
