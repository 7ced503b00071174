//! Meldestelle sync command-line tool.
//!
//! Runs delta-sync passes against the configured remote, either once or in
//! a polling loop, and inspects the local store.

mod scheduler;
mod signals;
mod style;

use std::path::{Path, PathBuf};
use std::process::ExitCode;

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use comfy_table::{presets::UTF8_FULL, Cell, ContentArrangement, Table};
use tracing::info;
use tracing_subscriber::EnvFilter;

use meldestelle_sync_core::config::AppConfig;
use meldestelle_sync_core::sync_engine::EngineStatus;
use meldestelle_sync_core::{SyncEngine, SyncReport};

// ---------------------------------------------------------------------------
// CLI argument definitions
// ---------------------------------------------------------------------------

/// Meldestelle delta-sync client.
#[derive(Parser, Debug)]
#[command(name = "meldestelle-sync", version, about)]
struct Cli {
    /// Path to the TOML configuration file.
    #[arg(
        short,
        long,
        global = true,
        default_value = "~/.config/meldestelle/sync.toml"
    )]
    config: String,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run one sync pass over every entity type and exit.
    Sync {
        /// Print the reports as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Sync repeatedly at the configured poll interval until interrupted.
    Watch,

    /// Show the storage backend, row counts and cursors.
    Status {
        /// Print the status as JSON.
        #[arg(long)]
        json: bool,
    },

    /// Generate a default configuration file.
    Init {
        /// Output path for the generated config file.
        #[arg(short, long, default_value = "./meldestelle-sync.toml")]
        output: PathBuf,
    },

    /// Validate a configuration file.
    Validate,
}

// ---------------------------------------------------------------------------
// Main
// ---------------------------------------------------------------------------

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    match run(cli).await {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{}", style::error(&format!("{:#}", e)));
            ExitCode::FAILURE
        }
    }
}

async fn run(cli: Cli) -> Result<()> {
    let config_path = PathBuf::from(expand_tilde(&cli.config));

    match cli.command {
        Commands::Init { output } => {
            init_tracing("warn");
            cmd_init(&output)
        }
        Commands::Validate => {
            init_tracing("warn");
            cmd_validate(&config_path)
        }
        command => {
            let config = AppConfig::load_and_resolve(&config_path).with_context(|| {
                format!("failed to load configuration from {}", config_path.display())
            })?;
            init_tracing(&config.daemon.log_level);

            let engine = SyncEngine::from_config(config)
                .await
                .context("failed to initialize sync engine")?;

            match command {
                Commands::Sync { json } => cmd_sync(&engine, json).await,
                Commands::Watch => cmd_watch(&engine).await,
                Commands::Status { json } => cmd_status(&engine, json).await,
                Commands::Init { .. } | Commands::Validate => Ok(()),
            }
        }
    }
}

/// Install the tracing subscriber. `RUST_LOG` wins over `default_level`.
fn init_tracing(default_level: &str) {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(default_level)),
        )
        .with_target(false)
        .init();
}

fn expand_tilde(path: &str) -> String {
    if let Some(rest) = path.strip_prefix("~/") {
        if let Some(home) = dirs::home_dir() {
            return format!("{}/{}", home.display(), rest);
        }
    }
    path.to_string()
}

// ---------------------------------------------------------------------------
// Subcommand implementations
// ---------------------------------------------------------------------------

async fn cmd_sync(engine: &SyncEngine, json: bool) -> Result<()> {
    let reports = engine.run_pass().await.context("sync pass failed")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&reports)?);
        return Ok(());
    }

    println!();
    println!("{}", style::header("Sync Pass"));
    println!();
    println!("{}", reports_table(&reports));
    println!();

    let written: usize = reports.iter().map(|r| r.written).sum();
    if written == 0 {
        println!("{}", style::success("Already up to date"));
    } else {
        println!(
            "{}",
            style::success(&format!("{} entit{} written", written, if written == 1 { "y" } else { "ies" }))
        );
    }
    Ok(())
}

async fn cmd_watch(engine: &SyncEngine) -> Result<()> {
    let interval = engine.config().daemon.poll_interval();
    println!(
        "{}",
        style::dim(&format!(
            "Watching {} every {}s ({}). Press Ctrl+C to stop.",
            engine.config().remote.base_url,
            interval.as_secs(),
            engine.driver().describe()
        ))
    );

    let shutdown = signals::setup_signal_handlers();
    scheduler::run_polling_loop(engine, interval, shutdown).await;

    info!("watch stopped");
    Ok(())
}

async fn cmd_status(engine: &SyncEngine, json: bool) -> Result<()> {
    let status = engine
        .status()
        .await
        .context("failed to read local store status")?;

    if json {
        println!("{}", serde_json::to_string_pretty(&status)?);
        return Ok(());
    }

    print_status(&status);
    Ok(())
}

fn print_status(status: &EngineStatus) {
    println!();
    println!("{}", style::header("Meldestelle Sync Status"));
    println!();
    println!("  Backend  : {}", status.backend);
    println!("  Storage  : {}", status.storage);
    println!("  Database : {}", status.database_path.display());
    if status.storage.contains("in-memory") {
        println!();
        println!(
            "  {}",
            style::warn("Data is held in memory and will not survive this session")
        );
    }
    println!();

    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Entity", "Rows", "Cursor"]);
    for entity in &status.entities {
        table.add_row(vec![
            Cell::new(&entity.entity),
            Cell::new(entity.rows),
            Cell::new(
                entity
                    .cursor
                    .as_ref()
                    .map(|c| c.as_str().to_string())
                    .unwrap_or_else(|| "—".to_string()),
            ),
        ]);
    }
    println!("{}", table);
    println!();
}

fn reports_table(reports: &[SyncReport]) -> Table {
    let mut table = Table::new();
    table.load_preset(UTF8_FULL);
    table.set_content_arrangement(ContentArrangement::Dynamic);
    table.set_header(vec!["Entity", "Fetched", "Written", "Cursor", "Duration"]);

    for r in reports {
        let cursor = match (&r.cursor_before, &r.cursor_after) {
            (Some(before), Some(after)) if before != after => format!("{} → {}", before, after),
            (None, Some(after)) => format!("— → {}", after),
            (_, Some(after)) => after.to_string(),
            (_, None) => "—".to_string(),
        };
        let millis = (r.completed_at - r.started_at).num_milliseconds();

        table.add_row(vec![
            Cell::new(&r.entity),
            Cell::new(r.fetched),
            Cell::new(r.written),
            Cell::new(cursor),
            Cell::new(format!("{} ms", millis)),
        ]);
    }
    table
}

fn cmd_init(output: &Path) -> Result<()> {
    let default_config = r#"# Meldestelle sync client configuration.

[daemon]
poll_interval_secs = 60
log_level = "info"

[remote]
base_url = "https://meldestelle.example.com"
# token_env = "MELDESTELLE_TOKEN"
timeout_secs = 15

[storage]
# "native" opens the database in-process; "worker" hosts it on a
# dedicated storage thread.
backend = "native"
# data_dir = "~/.local/share/meldestelle"
file_name = "app.db"
request_timeout_ms = 10000

[endpoints.ping]
path = "/api/ping/sync"
cursor_param = "since"
"#;

    if output.exists() {
        anyhow::bail!(
            "file already exists: {}. Use a different path or remove the existing file.",
            output.display()
        );
    }

    std::fs::write(output, default_config).context("failed to write config file")?;
    println!(
        "{}",
        style::success(&format!("Default configuration written to {}", output.display()))
    );
    println!();
    println!("Next steps:");
    println!("  1. Set remote.base_url to your Meldestelle server");
    println!("  2. Validate with: meldestelle-sync --config {} validate", output.display());
    println!("  3. Run a pass:    meldestelle-sync --config {} sync", output.display());
    Ok(())
}

fn cmd_validate(config_path: &Path) -> Result<()> {
    println!("Validating configuration: {}", config_path.display());
    println!();

    let mut config =
        AppConfig::load_from_file(config_path).context("failed to parse configuration")?;
    println!("  {}", style::success("TOML structure is valid"));

    config.resolve_env_vars()?;
    if let Err(e) = config.validate() {
        println!("  {}", style::error(&format!("Validation error: {}", e)));
        anyhow::bail!("configuration validation failed");
    }
    println!("  {}", style::success("All required fields are valid"));

    println!();
    println!("Configuration summary:");
    println!("  Remote URL     : {}", config.remote.base_url);
    println!(
        "  Remote token   : {}",
        match (&config.remote.token_env, &config.remote.token) {
            (None, _) => "not configured",
            (Some(_), Some(_)) => "set",
            (Some(_), None) => "NOT SET",
        }
    );
    println!("  Backend        : {}", config.storage.backend);
    println!("  Database       : {}", config.storage.database_path().display());
    println!("  Poll interval  : {}s", config.daemon.poll_interval_secs);
    println!(
        "  Ping endpoint  : {}?{}=<cursor>",
        config.endpoints.ping.path, config.endpoints.ping.cursor_param
    );
    println!();
    println!("Configuration is valid.");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_tilde() {
        assert_eq!(expand_tilde("/etc/sync.toml"), "/etc/sync.toml");
        if let Some(home) = dirs::home_dir() {
            assert_eq!(
                expand_tilde("~/sync.toml"),
                format!("{}/sync.toml", home.display())
            );
        }
    }

    #[test]
    fn test_init_writes_valid_config() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("sync.toml");
        cmd_init(&path).unwrap();

        let config = AppConfig::load_from_file(&path).unwrap();
        config.validate().unwrap();
        assert_eq!(config.endpoints.ping.path, "/api/ping/sync");

        // Refuses to overwrite.
        assert!(cmd_init(&path).is_err());
    }

    #[test]
    fn test_cli_parses_commands() {
        let cli = Cli::parse_from(["meldestelle-sync", "--config", "/tmp/x.toml", "status", "--json"]);
        assert_eq!(cli.config, "/tmp/x.toml");
        assert!(matches!(cli.command, Commands::Status { json: true }));

        let cli = Cli::parse_from(["meldestelle-sync", "watch"]);
        assert!(matches!(cli.command, Commands::Watch));
    }
}
