use clap::{Parser, Subcommand, ValueEnum};

#[derive(Parser)]
#[command(name = "rcodegen", version)]
#[command(about = "Drives declarative multi-step bundles through external AI coding assistants")]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,

    /// Output format for the final run envelope.
    #[arg(long, global = true, default_value = "text")]
    pub format: OutputFormat,

    /// Disable the cross-process advisory lock (useful for tests or a
    /// known-single-writer environment).
    #[arg(long, global = true)]
    pub no_lock: bool,

    /// Search this directory for bundles instead of $HOME/.rcodegen/bundles.
    #[arg(long, global = true)]
    pub bundles_dir: Option<std::path::PathBuf>,
}

#[derive(Clone, Copy, Debug, ValueEnum)]
pub enum OutputFormat {
    Text,
    Json,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run a bundle by name.
    Run {
        /// Bundle name, loaded from $HOME/.rcodegen/bundles/<name>.json or a builtin.
        bundle: String,

        /// Input key=value pairs, available to steps as `${inputs.KEY}`.
        #[arg(long = "input", value_parser = parse_key_val)]
        inputs: Vec<(String, String)>,
    },
    /// List available bundles (user bundles, then unshadowed builtins).
    List,
}

fn parse_key_val(s: &str) -> Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))?;
    Ok((key.to_string(), value.to_string()))
}
