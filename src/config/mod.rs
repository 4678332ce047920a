//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{path::PathBuf, str::FromStr};

use clap::{Args, Parser, Subcommand, builder::BoolishValueParser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

use crate::cache::ClientConfig;
use crate::gate::NetworkMode;
use crate::mutation::MapOperator;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "querycache";
const ENV_PREFIX: &str = "QUERYCACHE";
const DEFAULT_DEMO_CONSUMERS: usize = 3;
const DEFAULT_DEMO_FAILURES: u32 = 1;
const DEFAULT_DEMO_LATENCY_MS: u64 = 50;
const DEFAULT_DEMO_MUTATIONS: usize = 3;

/// Command-line arguments for the querycache binary.
#[derive(Debug, Parser)]
#[command(name = "querycache", version, about = "In-process data-fetching cache")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "QUERYCACHE_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(subcommand)]
    pub command: Option<Command>,
}

#[derive(Debug, Subcommand, Clone)]
pub enum Command {
    /// Drive a simulated workload through the cache and log what happens.
    Demo(Box<DemoArgs>),
}

#[derive(Debug, Args, Clone)]
pub struct DemoArgs {
    #[command(flatten)]
    pub overrides: ClientOverrides,

    /// Number of consumers attaching to the same query.
    #[arg(long, default_value_t = DEFAULT_DEMO_CONSUMERS)]
    pub consumers: usize,

    /// Attempts that fail before the simulated backend answers.
    #[arg(long, default_value_t = DEFAULT_DEMO_FAILURES)]
    pub failures: u32,

    /// Simulated backend latency in milliseconds.
    #[arg(long = "latency-ms", default_value_t = DEFAULT_DEMO_LATENCY_MS)]
    pub latency_ms: u64,

    /// Coordination of overlapping mutations (merge|concat|switch).
    #[arg(long, default_value_t = MapOperator::Merge)]
    pub operator: MapOperator,

    /// Number of back-to-back mutations to submit.
    #[arg(long, default_value_t = DEFAULT_DEMO_MUTATIONS)]
    pub mutations: usize,
}

impl Default for DemoArgs {
    fn default() -> Self {
        Self {
            overrides: ClientOverrides::default(),
            consumers: DEFAULT_DEMO_CONSUMERS,
            failures: DEFAULT_DEMO_FAILURES,
            latency_ms: DEFAULT_DEMO_LATENCY_MS,
            operator: MapOperator::Merge,
            mutations: DEFAULT_DEMO_MUTATIONS,
        }
    }
}

#[derive(Debug, Args, Default, Clone)]
pub struct ClientOverrides {
    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Toggle JSON logging.
    #[arg(
        long = "log-json",
        value_name = "BOOL",
        value_parser = BoolishValueParser::new()
    )]
    pub log_json: Option<bool>,

    /// Override how long fetched results stay fresh.
    #[arg(long = "stale-time-ms", value_name = "MILLIS")]
    pub stale_time_ms: Option<u64>,

    /// Override how long entries outlive their last consumer.
    #[arg(long = "cache-time-ms", value_name = "MILLIS")]
    pub cache_time_ms: Option<u64>,

    /// Override the number of query retries.
    #[arg(long = "retry-count", value_name = "COUNT")]
    pub retry_count: Option<u32>,

    /// Override the delay between query retries.
    #[arg(long = "retry-delay-ms", value_name = "MILLIS")]
    pub retry_delay_ms: Option<u64>,

    /// Override the network mode (online|always).
    #[arg(long = "network-mode", value_name = "MODE")]
    pub network_mode: Option<String>,
}

/// Fully-resolved settings after precedence resolution and validation.
#[derive(Debug, Clone)]
pub struct Settings {
    pub client: ClientConfig,
    pub logging: LoggingSettings,
}

#[derive(Debug, Clone)]
pub struct LoggingSettings {
    pub level: LevelFilter,
    pub format: LogFormat,
}

#[derive(Debug, Clone, Copy)]
pub enum LogFormat {
    Json,
    Compact,
}

#[derive(Debug, Error)]
pub enum LoadError {
    #[error("failed to build configuration: {0}")]
    Build(#[from] config::ConfigError),
    #[error("invalid configuration for `{key}`: {reason}")]
    Invalid { key: &'static str, reason: String },
}

impl LoadError {
    fn invalid(key: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            key,
            reason: reason.into(),
        }
    }
}

/// Load settings using the configured precedence (file → environment → CLI).
pub fn load(cli: &CliArgs) -> Result<Settings, LoadError> {
    let mut builder = Config::builder()
        .add_source(File::with_name(DEFAULT_CONFIG_BASENAME).required(false))
        .add_source(File::with_name(LOCAL_CONFIG_BASENAME).required(false));

    if let Some(path) = cli.config_file.as_ref() {
        builder = builder.add_source(File::from(path.as_path()).required(true));
    }

    builder = builder.add_source(Environment::with_prefix(ENV_PREFIX).separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;

    match cli.command.as_ref() {
        Some(Command::Demo(args)) => raw.apply_client_overrides(&args.overrides),
        None => raw.apply_client_overrides(&ClientOverrides::default()),
    }

    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    client: RawClientSettings,
    logging: RawLoggingSettings,
}

impl RawSettings {
    fn apply_client_overrides(&mut self, overrides: &ClientOverrides) {
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if let Some(json) = overrides.log_json {
            self.logging.json = Some(json);
        }
        if let Some(millis) = overrides.stale_time_ms {
            self.client.stale_time_ms = Some(millis);
        }
        if let Some(millis) = overrides.cache_time_ms {
            self.client.cache_time_ms = Some(millis);
        }
        if let Some(count) = overrides.retry_count {
            self.client.retry_count = Some(count);
        }
        if let Some(millis) = overrides.retry_delay_ms {
            self.client.retry_delay_ms = Some(millis);
        }
        if let Some(mode) = overrides.network_mode.as_ref() {
            self.client.network_mode = Some(mode.clone());
        }
    }
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings { client, logging } = raw;

        let client = build_client_config(client)?;
        let logging = build_logging_settings(logging)?;

        Ok(Self { client, logging })
    }
}

fn build_client_config(client: RawClientSettings) -> Result<ClientConfig, LoadError> {
    let defaults = ClientConfig::default();

    let network_mode = match client.network_mode {
        Some(mode) => parse_network_mode(&mode)
            .map_err(|reason| LoadError::invalid("client.network_mode", reason))?,
        None => defaults.network_mode,
    };

    Ok(ClientConfig {
        stale_time_ms: client.stale_time_ms.unwrap_or(defaults.stale_time_ms),
        cache_time_ms: client.cache_time_ms.unwrap_or(defaults.cache_time_ms),
        retry_count: client.retry_count.unwrap_or(defaults.retry_count),
        retry_delay_ms: client.retry_delay_ms.unwrap_or(defaults.retry_delay_ms),
        network_mode,
        refetch_on_focus: client.refetch_on_focus.unwrap_or(defaults.refetch_on_focus),
        refetch_on_reconnect: client
            .refetch_on_reconnect
            .unwrap_or(defaults.refetch_on_reconnect),
        mutation_gc_time_ms: client
            .mutation_gc_time_ms
            .unwrap_or(defaults.mutation_gc_time_ms),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(level) => LevelFilter::from_str(level.as_str()).map_err(|err| {
            LoadError::invalid("logging.level", format!("failed to parse: {err}"))
        })?,
        None => LevelFilter::INFO,
    };

    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };

    Ok(LoggingSettings { level, format })
}

fn parse_network_mode(value: &str) -> Result<NetworkMode, String> {
    match value.trim().to_ascii_lowercase().as_str() {
        "online" => Ok(NetworkMode::Online),
        "always" => Ok(NetworkMode::Always),
        other => Err(format!("unknown network mode `{other}` (expected online or always)")),
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawClientSettings {
    stale_time_ms: Option<u64>,
    cache_time_ms: Option<u64>,
    retry_count: Option<u32>,
    retry_delay_ms: Option<u64>,
    network_mode: Option<String>,
    refetch_on_focus: Option<bool>,
    refetch_on_reconnect: Option<bool>,
    mutation_gc_time_ms: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

/// Resolve configuration using the supplied CLI arguments, returning both for downstream use.
pub fn load_with_cli() -> Result<(CliArgs, Settings), LoadError> {
    let args = CliArgs::parse();
    let settings = load(&args)?;
    Ok((args, settings))
}

#[cfg(test)]
mod tests;
