//! Strategy sandbox host
//!
//! Runs user-supplied trading strategies (WebAssembly text) in isolated
//! sandboxes, one thread per session, and streams their logs, metrics and
//! orders back to the host.

mod host;
mod keystore;
mod models;
mod protocol;
mod sandbox;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, Context, Result};
use clap::{Args, Parser, Subcommand};
use serde_json::{Map, Value};
use tokio::io::{AsyncBufReadExt, BufReader};
use tracing::{debug, info, warn, Level};
use tracing_subscriber::FmtSubscriber;
use uuid::Uuid;

use crate::host::{Observed, SessionRegistry};
use crate::keystore::{EphemeralKeySlot, SqliteSlotStore, EPHEMERAL_KEY_SLOT};
use crate::models::AlgoIndexItem;
use crate::protocol::{Message, RunRequest, SystemId};
use crate::sandbox::{build_engine, inspect_source, SandboxConfig, TickErrorPolicy};

/// Strategy sandbox CLI.
#[derive(Parser)]
#[command(name = "stratbox")]
#[command(about = "Run trading strategies in isolated WebAssembly sandboxes", long_about = None)]
struct Cli {
    /// Database URL for the ephemeral key slot
    #[arg(short, long, default_value = "sqlite:./stratbox.db?mode=rwc")]
    database: String,

    /// Log level (trace, debug, info, warn, error)
    #[arg(short, long, default_value = "info")]
    log_level: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run one strategy until Ctrl+C or a tick limit
    Run {
        /// Strategy source (.wat)
        file: PathBuf,

        /// Session id (random if omitted)
        #[arg(long)]
        id: Option<String>,

        /// Strategy config entry, repeatable (key=value, value parsed as JSON when possible)
        #[arg(short, long = "config", value_name = "KEY=VALUE")]
        config: Vec<String>,

        /// Metadata JSON (defaults to the source's `;; @key value` header)
        #[arg(long)]
        meta: Option<String>,

        /// Stop after this many completed ticks
        #[arg(short, long)]
        ticks: Option<u64>,

        #[command(flatten)]
        sandbox: SandboxArgs,
    },

    /// Serve the message protocol: commands as JSON lines on stdin, events on stdout
    Serve {
        #[command(flatten)]
        sandbox: SandboxArgs,
    },

    /// Manage the ephemeral key slot
    Key {
        #[command(subcommand)]
        action: KeyAction,
    },

    /// Compile a strategy and show its metadata and entry points
    Inspect {
        /// Strategy source (.wat)
        file: PathBuf,
    },

    /// Show the effective sandbox configuration
    Config {
        #[command(flatten)]
        sandbox: SandboxArgs,
    },
}

#[derive(Subcommand)]
enum KeyAction {
    /// Store a value (JSON, or a plain string)
    Set { value: String },
    /// Print the stored value
    Get,
    /// Remove the stored value
    Clear,
}

/// Overrides applied on top of `SandboxConfig::from_env`.
#[derive(Args, Debug, Default)]
struct SandboxArgs {
    /// Milliseconds between ticks
    #[arg(long)]
    cadence_ms: Option<u64>,

    /// What a failing onTick does to its session (tolerate, fatal)
    #[arg(long)]
    tick_errors: Option<String>,

    /// Fuel budget per strategy call; exhausting it fails the call
    #[arg(long)]
    fuel: Option<u64>,
}

impl SandboxArgs {
    fn resolve(&self) -> Result<SandboxConfig> {
        let mut config = SandboxConfig::from_env()?;

        if let Some(ms) = self.cadence_ms {
            config.cadence = Duration::from_millis(ms);
        }
        if let Some(policy) = &self.tick_errors {
            config.tick_error_policy = policy.parse::<TickErrorPolicy>()?;
        }
        if let Some(fuel) = self.fuel {
            config.fuel_per_tick = Some(fuel);
        }

        Ok(config)
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();

    // Setup logging. stdout carries protocol output, so logs go to stderr.
    let log_level = match cli.log_level.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    };

    let subscriber = FmtSubscriber::builder()
        .with_max_level(log_level)
        .with_target(false)
        .with_writer(std::io::stderr)
        .finish();
    tracing::subscriber::set_global_default(subscriber)?;

    match cli.command {
        Commands::Run {
            file,
            id,
            config,
            meta,
            ticks,
            sandbox,
        } => {
            let sandbox_config = sandbox.resolve()?;
            let source = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;

            let meta = match meta {
                Some(raw) => serde_json::from_str(&raw).context("--meta must be valid JSON")?,
                None => {
                    let header = AlgoIndexItem::parse(&source);
                    if header.is_empty() {
                        Value::Null
                    } else {
                        header.to_meta()
                    }
                }
            };

            let request = RunRequest {
                system_id: SystemId::new(id.unwrap_or_else(|| Uuid::new_v4().to_string())),
                source,
                config: parse_config_entries(&config)?,
                meta,
            };
            let system_id = request.system_id.clone();

            info!(
                system_id = %system_id,
                file = %file.display(),
                cadence_ms = sandbox_config.cadence.as_millis() as u64,
                policy = %sandbox_config.tick_error_policy,
                "Starting strategy"
            );

            let (mut registry, mut events) = SessionRegistry::new(sandbox_config)?;
            registry.run(request)?;

            println!("\n=== Strategy Sandbox ===");
            println!("System ID: {}", system_id);
            println!("Source:    {}", file.display());
            if let Some(limit) = ticks {
                println!("Limit:     {} ticks", limit);
            }
            println!("\nPress Ctrl+C to stop.\n");

            let mut stop_sent = false;
            if ticks == Some(0) {
                stop_sent = registry.stop(&system_id);
            }

            let ctrl_c = tokio::signal::ctrl_c();
            tokio::pin!(ctrl_c);

            loop {
                tokio::select! {
                    _ = &mut ctrl_c, if !stop_sent => {
                        let ticks = registry.view(&system_id).map_or(0, |view| view.tick_count);
                        println!("\nStopping strategy after {} ticks...", ticks);
                        registry.stop(&system_id);
                        stop_sent = true;
                    }
                    message = events.recv() => {
                        let Some(message) = message else {
                            warn!("Event channel closed before the session finished");
                            break;
                        };
                        print_event(&message);

                        match registry.observe(message) {
                            Observed::Finished(view) => {
                                println!("{}", view);
                                break;
                            }
                            Observed::Updated { tick_count } => {
                                if !stop_sent && ticks.is_some_and(|limit| tick_count >= limit) {
                                    info!(ticks = tick_count, "Tick limit reached");
                                    registry.stop(&system_id);
                                    stop_sent = true;
                                }
                            }
                            Observed::Dropped => {}
                        }
                    }
                }
            }
        }

        Commands::Serve { sandbox } => {
            let sandbox_config = sandbox.resolve()?;
            info!(
                cadence_ms = sandbox_config.cadence.as_millis() as u64,
                policy = %sandbox_config.tick_error_policy,
                "Serving on stdin/stdout"
            );

            let (mut registry, mut events) = SessionRegistry::new(sandbox_config)?;
            let mut lines = BufReader::new(tokio::io::stdin()).lines();

            let ctrl_c = tokio::signal::ctrl_c();
            tokio::pin!(ctrl_c);

            loop {
                tokio::select! {
                    _ = &mut ctrl_c => {
                        info!("Interrupted");
                        break;
                    }
                    line = lines.next_line() => match line {
                        Ok(Some(line)) => {
                            if !line.trim().is_empty() {
                                registry.submit_raw(&line);
                            }
                        }
                        Ok(None) => {
                            debug!("stdin closed");
                            break;
                        }
                        Err(e) => {
                            warn!(error = %e, "Failed to read stdin");
                            break;
                        }
                    },
                    Some(message) = events.recv() => {
                        emit_json_line(&message);
                        registry.observe(message);
                    }
                }
            }

            let finished = registry.shutdown(&mut events, emit_json_line).await;
            info!(sessions = finished.len(), "Shutdown complete");
        }

        Commands::Key { action } => {
            let store = Arc::new(SqliteSlotStore::new(&cli.database).await?);
            let slot = EphemeralKeySlot::new(store.clone());

            match action {
                KeyAction::Set { value } => {
                    slot.set(parse_value(&value)).await?;
                    println!("Ephemeral key stored");
                }
                KeyAction::Get => match slot.get().await? {
                    Some(value) => {
                        println!("{}", serde_json::to_string_pretty(&value)?);
                        if let Some(at) = store.updated_at(EPHEMERAL_KEY_SLOT).await? {
                            println!("\nUpdated: {}", at);
                        }
                    }
                    None => println!("No ephemeral key stored. Use 'stratbox key set <value>' to store one."),
                },
                KeyAction::Clear => {
                    slot.clear().await?;
                    println!("Ephemeral key cleared");
                }
            }
        }

        Commands::Inspect { file } => {
            let source = tokio::fs::read_to_string(&file)
                .await
                .with_context(|| format!("Failed to read {}", file.display()))?;

            let header = AlgoIndexItem::parse(&source);
            let engine = build_engine(&SandboxConfig::default())?;
            let summary = inspect_source(&engine, &source)?;

            println!("\n=== Strategy: {} ===", file.display());
            if header.is_empty() {
                println!("No metadata header");
            } else {
                println!("Name:        {}", header.name);
                println!("Description: {}", truncate(&header.description, 60));
                println!("Mode:        {}", header.mode);
                println!("Market:      {}", header.market);
                println!("Exchange:    {}", header.exchange);
                println!("Instrument:  {}", header.instrument);
                println!("Counter:     {}", header.counter_asset);
            }

            println!("\n--- Entry Points ---");
            println!("onTick:      {}", if summary.on_tick { "yes" } else { "no (runs once)" });
            println!("stop:        {}", if summary.teardown { "yes" } else { "no" });

            println!("\n--- Imports ({}) ---", summary.imports.len());
            for import in &summary.imports {
                println!("  {}", import);
            }
        }

        Commands::Config { sandbox } => {
            let config = sandbox.resolve()?;

            println!("\n=== Sandbox Configuration ===\n");
            println!("  Cadence:            {}ms", config.cadence.as_millis());
            println!("  Tick Errors:        {}", config.tick_error_policy);
            match config.fuel_per_tick {
                Some(fuel) => println!("  Fuel Per Call:      {}", fuel),
                None => println!("  Fuel Per Call:      unmetered"),
            }
            println!("  Log History:        {} lines", config.log_history);
            println!("\n  Database:           {}", cli.database);
        }
    }

    Ok(())
}

/// Parse repeated `key=value` flags into a strategy config object.
fn parse_config_entries(entries: &[String]) -> Result<Map<String, Value>> {
    let mut config = Map::new();
    for entry in entries {
        let (key, value) = entry
            .split_once('=')
            .ok_or_else(|| anyhow!("config entry `{entry}` is not key=value"))?;
        let key = key.trim();
        if key.is_empty() {
            return Err(anyhow!("config entry `{entry}` has an empty key"));
        }
        config.insert(key.to_string(), parse_value(value));
    }
    Ok(config)
}

/// JSON if it parses, otherwise the raw text as a string.
fn parse_value(raw: &str) -> Value {
    serde_json::from_str(raw).unwrap_or_else(|_| Value::String(raw.to_string()))
}

fn print_event(message: &Message) {
    let now = chrono::Local::now().format("%H:%M:%S");
    match message {
        Message::Log { msg, tick_count, .. } => println!("[{now}] #{tick_count:<5} LOG    {msg}"),
        Message::Metric { pnl, tick_count, .. } => {
            println!("[{now}] #{tick_count:<5} P&L    {pnl:.4}")
        }
        Message::Order { order, tick_count, .. } => {
            println!("[{now}] #{tick_count:<5} ORDER  {order}")
        }
        Message::Error { error, fatal: true, .. } => println!("[{now}]        FATAL  {error}"),
        Message::Error { error, .. } => println!("[{now}]        ERROR  {error}"),
        Message::Tick { tick_count, .. } => debug!(tick = tick_count, "Tick completed"),
        Message::Stopped { .. } => println!("[{now}]        STOPPED"),
        Message::Run(_) | Message::Stop { .. } => {}
    }
}

fn emit_json_line(message: &Message) {
    match message.to_json() {
        Ok(line) => println!("{}", line),
        Err(e) => warn!(error = %e, kind = message.kind(), "Failed to encode event"),
    }
}

/// Truncate a string with ellipsis if too long.
fn truncate(s: &str, max_len: usize) -> String {
    if s.chars().count() <= max_len {
        s.to_string()
    } else {
        let head: String = s.chars().take(max_len.saturating_sub(3)).collect();
        format!("{}...", head)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_config_entries() {
        let entries = vec![
            "threshold=0.5".to_string(),
            "symbol=BTC-USD".to_string(),
            "window = 20".to_string(),
            "flags={\"fast\":true}".to_string(),
        ];
        let config = parse_config_entries(&entries).unwrap();
        assert_eq!(config["threshold"], json!(0.5));
        assert_eq!(config["symbol"], json!("BTC-USD"));
        assert_eq!(config["window"], json!(20));
        assert_eq!(config["flags"], json!({"fast": true}));

        assert!(parse_config_entries(&["novalue".to_string()]).is_err());
        assert!(parse_config_entries(&["=1".to_string()]).is_err());
    }

    #[test]
    fn test_truncate() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("a much longer description", 10), "a much ...");
    }
}
