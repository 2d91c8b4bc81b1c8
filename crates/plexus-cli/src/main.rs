use std::{
    path::{Path, PathBuf},
    sync::{Arc, OnceLock},
};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use plexus_core::{
    api::MemoryHostApi,
    config::Config,
    environment::{discover_bundles, PluginEnvironment},
    server::Server,
    HandleOptions, PluginHandle,
};
use plexus_plugin_sdk::{hooks::HookTable, PluginManifest};
use regex::Regex;
use serde::Serialize;
use tracing_subscriber::{fmt, EnvFilter};

#[derive(Parser, Debug)]
#[command(name = "plexus", author, version, about = "Chat server host for process-isolated plugins")]
struct Cli {
    /// Sets the log level (error, warn, info, debug, trace).
    #[arg(long, default_value = "info", global = true)]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Load the plugins and serve their HTTP routes.
    Run {
        #[arg(short, long, value_name = "FILE", default_value = "plexus.toml")]
        config: PathBuf,
    },
    /// Validate or print configuration files.
    Config {
        #[command(subcommand)]
        command: ConfigCommands,
    },
    /// Inspect plugin bundles.
    Plugins {
        #[command(subcommand)]
        command: PluginCommands,
    },
    /// Dump the resolved configuration as JSON.
    Diag {
        #[arg(short, long, value_name = "FILE", default_value = "plexus.toml")]
        config: PathBuf,
    },
}

#[derive(Subcommand, Debug)]
enum ConfigCommands {
    /// Validates the provided configuration file.
    Validate {
        #[arg(value_name = "FILE")]
        config: PathBuf,
    },
    /// Prints a commented example configuration.
    Example,
}

#[derive(Subcommand, Debug)]
enum PluginCommands {
    /// Lists the valid bundles under a directory.
    List {
        #[arg(long, value_name = "DIR", default_value = "plugins")]
        dir: PathBuf,
        /// Print JSON instead of one line per plugin.
        #[arg(long)]
        json: bool,
    },
    /// Starts one bundle, prints the hooks it implements and stops it.
    Inspect {
        #[arg(value_name = "BUNDLE_DIR")]
        bundle: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_tracing(&cli.log_level)?;
    match cli.command {
        Commands::Run { config } => handle_run(config).await,
        Commands::Config { command } => handle_config(command),
        Commands::Plugins { command } => handle_plugins(command).await,
        Commands::Diag { config } => handle_diag(config),
    }
}

fn init_tracing(level: &str) -> Result<()> {
    let filter = EnvFilter::try_new(level).unwrap_or_else(|_| EnvFilter::new("info"));
    fmt().with_env_filter(filter).try_init().ok();
    Ok(())
}

async fn handle_run(config_path: PathBuf) -> Result<()> {
    let config = load_config(&config_path)?;
    tracing::info!(
        config = %config_path.display(),
        listeners = config.listeners.len(),
        plugin_dir = %config.plugins.directory,
        "starting plexus {}",
        plexus_core::version()
    );
    let env = Arc::new(PluginEnvironment::new(
        config.plugins.clone(),
        Arc::new(MemoryHostApi::new()),
    ));
    let server = Server::new(&config, env.clone())?;
    env.load_all().await?;
    tracing::info!(plugins = ?env.active_ids(), "plugins loaded");
    server.run().await
}

fn handle_config(command: ConfigCommands) -> Result<()> {
    match command {
        ConfigCommands::Validate { config } => {
            let cfg = load_config(&config)?;
            cfg.validate()?;
            println!("configuration OK: {}", config.display());
        }
        ConfigCommands::Example => print!("{}", Config::example()),
    }
    Ok(())
}

#[derive(Debug, Serialize)]
struct PluginSummary<'a> {
    id: &'a str,
    name: &'a str,
    version: &'a str,
    transport: String,
    declared_hooks: Option<Vec<&'static str>>,
    bundle: String,
}

async fn handle_plugins(command: PluginCommands) -> Result<()> {
    match command {
        PluginCommands::List { dir, json } => {
            let bundles = discover_bundles(&dir)?;
            if json {
                let summaries: Vec<_> = bundles.iter().map(|(m, path)| summarize(m, path)).collect();
                println!("{}", serde_json::to_string_pretty(&summaries)?);
            } else if bundles.is_empty() {
                println!("no plugin bundles found under {}", dir.display());
            } else {
                for (manifest, _) in &bundles {
                    println!(
                        "- {} ({}) v{} [{}]{}",
                        manifest.name,
                        manifest.id,
                        manifest.version,
                        manifest.transport,
                        manifest
                            .description
                            .as_ref()
                            .map(|d| format!(": {d}"))
                            .unwrap_or_default()
                    );
                }
            }
        }
        PluginCommands::Inspect { bundle } => {
            let manifest = PluginManifest::load(&bundle)?;
            manifest.validate_bundle(&bundle)?;
            let options = HandleOptions {
                transport: manifest.transport,
                ..HandleOptions::default()
            };
            tracing::debug!(plugin_id = %manifest.id, bundle = %bundle.display(), "starting bundle");
            let handle = PluginHandle::spawn(&manifest, &bundle, options, &HookTable::new()).await?;
            println!("{} implements: {}", manifest.id, handle.implemented().names().join(", "));
            handle.shutdown().await;
        }
    }
    Ok(())
}

fn summarize<'a>(manifest: &'a PluginManifest, bundle: &Path) -> PluginSummary<'a> {
    PluginSummary {
        id: &manifest.id,
        name: &manifest.name,
        version: &manifest.version,
        transport: manifest.transport.to_string(),
        declared_hooks: manifest.declared_hooks(),
        bundle: bundle.display().to_string(),
    }
}

fn handle_diag(path: PathBuf) -> Result<()> {
    let cfg = load_config(&path)?;
    let json = serde_json::to_string_pretty(&cfg)?;
    println!("{json}");
    Ok(())
}

fn load_config(path: &Path) -> Result<Config> {
    let raw = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read config file {}", path.display()))?;
    let expanded = interpolate_env(&raw)?;
    let cfg = toml::from_str::<Config>(&expanded)
        .with_context(|| format!("failed to parse {}", path.display()))?;
    Ok(cfg)
}

fn env_pattern() -> Result<&'static Regex> {
    static RE: OnceLock<Regex> = OnceLock::new();
    if let Some(regex) = RE.get() {
        return Ok(regex);
    }
    let regex = Regex::new(r"\$\{([A-Z0-9_]+)(?::([^}]+))?\}")?;
    Ok(RE.get_or_init(|| regex))
}

/// Expands `${VAR}` and `${VAR:default}` from the process environment.
fn interpolate_env(input: &str) -> Result<String> {
    let result = env_pattern()?.replace_all(input, |caps: &regex::Captures| {
        let key = &caps[1];
        let default = caps.get(2).map(|m| m.as_str()).unwrap_or("");
        std::env::var(key).unwrap_or_else(|_| default.to_string())
    });
    Ok(result.into_owned())
}
