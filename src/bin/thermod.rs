//! Ingestion daemon for temperature telemetry.
//!
//! Loads configuration from (in precedence order): defaults, config file, environment variables
//! (`THERMO_*`), and CLI flags. Opens the durable store, optionally applies retention, then reads
//! newline-delimited JSON messages from stdin and dispatches each one to storage and threshold
//! alerting until EOF.

use std::io::{BufRead, IsTerminal};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use chrono::{DateTime, Duration, Utc};
use clap::Parser;
use config::{Config, Environment, File};
use thermo_ingest::config::DEFAULT_PARTITION_EXPIRATION_DAYS;
use thermo_ingest::{
    MessageError, PipelineConfig, StdoutNotifier, TimeSeriesStore, Timestamp,
    TracingEventListener,
};
use tracing_subscriber::EnvFilter;

// ---------- CLI ----------

/// Temperature telemetry ingestion daemon.
#[derive(Parser, Debug)]
#[command(name = "thermod", version, about)]
pub struct Cli {
    /// Path to config file (TOML). If omitted, ./thermod.toml is loaded when present.
    #[arg(long, env = "THERMO_CONFIG")]
    pub config: Option<PathBuf>,

    /// Override data directory (root of the durable store).
    #[arg(long, env = "THERMO_DATA_DIR")]
    pub data_dir: Option<PathBuf>,

    /// Do not load any config file; use defaults + env + CLI only.
    #[arg(long, default_value_t = false)]
    pub no_config: bool,

    /// Load and validate config (file + env + CLI), print the effective settings, then exit.
    /// Does not open the store.
    #[arg(long, default_value_t = false)]
    pub validate_config: bool,

    /// Minimum temperature for a sensor, as NAME=VALUE. Repeatable; replaces configured thresholds.
    #[arg(long = "threshold", value_name = "NAME=VALUE")]
    pub thresholds: Vec<String>,

    /// Delete records older than this many days before processing messages.
    #[arg(long, env = "THERMO_RETENTION_DAYS")]
    pub retention_days: Option<u64>,

    /// Apply retention and exit without reading stdin.
    #[arg(long, default_value_t = false)]
    pub retention_only: bool,
}

// ---------- File/env config (all optional for partial config) ----------

#[derive(Debug, Default, serde::Deserialize)]
pub struct TableFileConfig {
    pub project: Option<String>,
    pub dataset: Option<String>,
    pub table: Option<String>,
    pub location: Option<String>,
}

/// One `[[thresholds]]` entry. Sensor names are case-sensitive, so they live in values.
#[derive(Debug, serde::Deserialize)]
pub struct ThresholdFileConfig {
    pub sensor: String,
    pub minimum: f64,
}

/// Top-level daemon config as read from file + env. Every field optional for layering.
#[derive(Debug, Default, serde::Deserialize)]
pub struct DaemonFileConfig {
    pub data_dir: Option<String>,
    pub table: Option<TableFileConfig>,
    /// 0 disables partition expiration.
    pub partition_expiration_days: Option<u64>,
    pub thresholds: Option<Vec<ThresholdFileConfig>>,
    pub alert_cooldown_secs: Option<u64>,
    pub retention_days: Option<u64>,
    /// Where the last alert instant is kept between runs. Default: `<data_dir>/thermod.last_alert`.
    pub alert_state_file: Option<String>,
}

/// Runtime options for the daemon derived from config + env + CLI.
#[derive(Debug, Clone)]
pub struct DaemonOptions {
    pub alert_state_file: PathBuf,
}

fn days(n: u64, what: &str) -> Result<Duration, String> {
    i64::try_from(n)
        .ok()
        .and_then(Duration::try_days)
        .ok_or_else(|| format!("{} out of range: {}", what, n))
}

fn seconds(n: u64, what: &str) -> Result<Duration, String> {
    i64::try_from(n)
        .ok()
        .and_then(Duration::try_seconds)
        .ok_or_else(|| format!("{} out of range: {}", what, n))
}

/// Parses `NAME=VALUE`.
fn parse_threshold(s: &str) -> Result<(String, f64), String> {
    let (name, value) = s
        .split_once('=')
        .ok_or_else(|| format!("invalid threshold {:?}: expected NAME=VALUE", s))?;
    let name = name.trim();
    if name.is_empty() {
        return Err(format!("invalid threshold {:?}: empty sensor name", s));
    }
    let value: f64 = value
        .trim()
        .parse()
        .map_err(|e| format!("invalid threshold {:?}: {}", s, e))?;
    Ok((name.to_string(), value))
}

/// Load merged config and daemon options. CLI overrides file/env for both.
fn load_daemon_config(cli: &Cli) -> Result<(PipelineConfig, DaemonOptions), String> {
    let mut builder = Config::builder();

    if !cli.no_config {
        if let Some(ref path) = cli.config {
            if !path.exists() {
                return Err(format!("config file not found: {}", path.display()));
            }
            builder = builder.add_source(File::from(path.as_path()).required(false));
        } else {
            let default_path = PathBuf::from("thermod.toml");
            if default_path.exists() {
                builder = builder.add_source(File::from(default_path.as_path()).required(false));
            }
        }
    }

    builder = builder.add_source(
        Environment::with_prefix("THERMO")
            .prefix_separator("_")
            .separator("__")
            .try_parsing(true)
            .ignore_empty(true),
    );

    let merged = builder.build().map_err(|e| e.to_string())?;
    let partial: DaemonFileConfig = merged.try_deserialize().map_err(|e| e.to_string())?;

    let mut config = PipelineConfig {
        event_listener: Arc::new(TracingEventListener),
        ..PipelineConfig::default()
    };
    merge_into_pipeline_config(&mut config, &partial)?;

    if let Some(ref d) = cli.data_dir {
        config.data_dir = d.clone();
    }
    if !cli.thresholds.is_empty() {
        config.thresholds = cli
            .thresholds
            .iter()
            .map(String::as_str)
            .map(parse_threshold)
            .collect::<Result<_, _>>()?;
    }
    if let Some(n) = cli.retention_days {
        config.retention = Some(days(n, "retention_days")?);
    }
    if cli.retention_only && config.retention.is_none() {
        return Err("--retention-only requires retention_days".to_string());
    }

    let alert_state_file = partial
        .alert_state_file
        .as_ref()
        .map(PathBuf::from)
        .unwrap_or_else(|| config.data_dir.join("thermod.last_alert"));

    Ok((config, DaemonOptions { alert_state_file }))
}

/// Merge file/env partial config onto `PipelineConfig`. Only overwrites fields that are `Some`.
fn merge_into_pipeline_config(
    base: &mut PipelineConfig,
    partial: &DaemonFileConfig,
) -> Result<(), String> {
    if let Some(s) = &partial.data_dir {
        base.data_dir = PathBuf::from(s);
    }
    if let Some(t) = &partial.table {
        if let Some(v) = &t.project {
            base.table.project = v.clone();
        }
        if let Some(v) = &t.dataset {
            base.table.dataset = v.clone();
        }
        if let Some(v) = &t.table {
            base.table.table = v.clone();
        }
        if let Some(v) = &t.location {
            base.table.location = v.clone();
        }
    }
    if let Some(n) = partial.partition_expiration_days {
        base.table_options.partition_expiration = if n == 0 {
            None
        } else {
            Some(days(n, "partition_expiration_days")?)
        };
    }
    if let Some(list) = &partial.thresholds {
        base.thresholds = list.iter().map(|t| (t.sensor.clone(), t.minimum)).collect();
    }
    if let Some(secs) = partial.alert_cooldown_secs {
        base.alert_cooldown = Some(seconds(secs, "alert_cooldown_secs")?);
    }
    if let Some(n) = partial.retention_days {
        base.retention = Some(days(n, "retention_days")?);
    }
    Ok(())
}

// ---------- Safe startup checks ----------

/// Ensures `data_dir` exists and is writable. Returns an error message on failure.
fn check_data_dir_writable(data_dir: &Path) -> Result<(), String> {
    std::fs::create_dir_all(data_dir)
        .map_err(|e| format!("data_dir {} cannot be created: {}", data_dir.display(), e))?;
    let marker = data_dir.join(".thermod_write_check");
    std::fs::write(&marker, b"")
        .map_err(|e| format!("data_dir {} not writable: {}", data_dir.display(), e))?;
    let _ = std::fs::remove_file(marker);
    Ok(())
}

// ---------- Alert cooldown state ----------

fn load_last_alert(path: &Path) -> Option<Timestamp> {
    let text = std::fs::read_to_string(path).ok()?;
    match DateTime::parse_from_rfc3339(text.trim()) {
        Ok(t) => Some(t.with_timezone(&Utc)),
        Err(e) => {
            tracing::warn!(path = %path.display(), error = %e, "ignoring unreadable alert state");
            None
        }
    }
}

fn save_last_alert(path: &Path, last: Timestamp) -> std::io::Result<()> {
    std::fs::write(path, last.to_rfc3339())
}

// ---------- Main ----------

fn print_effective_config(config: &PipelineConfig, options: &DaemonOptions) {
    let expiration_days = config
        .table_options
        .partition_expiration
        .map(|d| d.num_days())
        .unwrap_or(0);
    println!("data_dir={}", config.data_dir.display());
    println!("table={}", config.table.qualified_name());
    println!("location={}", config.table.location);
    println!("partition_expiration_days={}", expiration_days);
    for (sensor, minimum) in &config.thresholds {
        println!("threshold.{}={}", sensor, minimum);
    }
    println!(
        "alert_cooldown_secs={}",
        config.alert_cooldown.map(|d| d.num_seconds()).unwrap_or(0)
    );
    println!(
        "retention_days={}",
        config.retention.map(|d| d.num_days()).unwrap_or(0)
    );
    println!("alert_state_file={}", options.alert_state_file.display());
}

fn main() -> Result<(), Box<dyn std::error::Error + Send + Sync>> {
    let cli = Cli::parse();
    let (config, options) = load_daemon_config(&cli).map_err(|e| {
        eprintln!("config error: {}", e);
        e
    })?;

    if cli.validate_config {
        print_effective_config(&config, &options);
        return Ok(());
    }

    // Alerts go to stdout, logs to stderr.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .with_writer(std::io::stderr)
        .with_ansi(std::io::stderr().is_terminal())
        .init();

    // Safe startup: data_dir must exist and be writable before opening the store.
    check_data_dir_writable(&config.data_dir).map_err(|e| {
        tracing::error!(error = %e, "startup check failed");
        e
    })?;

    let store = Arc::new(config.open_store().map_err(|e| {
        tracing::error!(error = %e, "failed to open store");
        e
    })?);
    tracing::info!(
        data_dir = %config.data_dir.display(),
        table = %config.table.qualified_name(),
        "store opened"
    );

    if let Some(retention) = config.retention {
        let removed = store.delete(retention).map_err(|e| {
            tracing::error!(error = %e, "retention failed");
            e
        })?;
        tracing::info!(removed, retention_days = retention.num_days(), "retention done");
    }
    if cli.retention_only {
        return Ok(());
    }

    let alerting = Arc::new(config.alert_consumer(
        Arc::new(StdoutNotifier),
        load_last_alert(&options.alert_state_file),
    ));
    let dispatcher = config.build_dispatcher(store.clone(), alerting.clone());

    let mut processed = 0u64;
    let mut dropped = 0u64;
    let mut failed = 0u64;
    // Lines are raw bytes: one message that is not UTF-8 must not end the run.
    let mut stdin = std::io::stdin().lock();
    let mut line = Vec::new();
    let input = loop {
        line.clear();
        match stdin.read_until(b'\n', &mut line) {
            Ok(0) => break Ok(()),
            Ok(_) => {}
            Err(e) => break Err(e),
        }
        let message = line.trim_ascii();
        if message.is_empty() {
            continue;
        }
        processed += 1;
        // Failures are already reported through the event listener; keep going.
        match dispatcher.dispatch_encoded(message) {
            Ok(()) => {}
            Err(MessageError::Decode(_)) => dropped += 1,
            Err(MessageError::Dispatch(_)) => failed += 1,
        }
    };

    if let Some(last) = alerting.last_notified()? {
        if let Err(e) = save_last_alert(&options.alert_state_file, last) {
            tracing::warn!(error = %e, "could not persist alert state");
        }
    }
    if let Err(e) = input {
        tracing::error!(error = %e, processed, "reading stdin failed");
        return Err(e.into());
    }
    tracing::info!(processed, dropped, failed, "input closed, shutting down");
    Ok(())
}
