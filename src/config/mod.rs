//! Configuration layer: typed settings with layered precedence (file → env → CLI).

use std::{net::SocketAddr, path::PathBuf, str::FromStr, time::Duration};

use clap::{Args, Parser};
use config::{Config, Environment, File};
use serde::Deserialize;
use thiserror::Error;
use tracing::level_filters::LevelFilter;

const DEFAULT_CONFIG_BASENAME: &str = "config/default";
const LOCAL_CONFIG_BASENAME: &str = "aula";
const DEFAULT_HOST: &str = "127.0.0.1";
const DEFAULT_PORT: u16 = 4000;
const DEFAULT_GRACEFUL_SHUTDOWN_SECS: u64 = 30;
const DEFAULT_RESPONSE_LIMIT: usize = 512;
const DEFAULT_TOMBSTONE_TTL_SECS: u64 = 60;
const DEFAULT_REFETCH_TIMEOUT_SECS: u64 = 10;
const DEFAULT_REFETCH_MAX_ATTEMPTS: u32 = 4;
const DEFAULT_REFETCH_BACKOFF_MS: u64 = 250;

/// Command-line arguments for the Aula cache server.
#[derive(Debug, Parser)]
#[command(name = "aula", version, about = "Aula cache-consistency server")]
pub struct CliArgs {
    /// Optional path to a configuration file.
    #[arg(long = "config-file", env = "AULA_CONFIG_FILE", value_name = "PATH")]
    pub config_file: Option<PathBuf>,

    #[command(flatten)]
    pub overrides: ServeOverrides,
}

#[derive(Debug, Args, Default, Clone)]
pub struct ServeOverrides {
    /// Override the listener host.
    #[arg(long = "server-host", value_name = "HOST")]
    pub server_host: Option<String>,

    /// Override the listener port.
    #[arg(long = "server-port", value_name = "PORT")]
    pub server_port: Option<u16>,

    /// Override the graceful shutdown timeout.
    #[arg(long = "server-graceful-shutdown-seconds", value_name = "SECONDS")]
    pub graceful_shutdown_seconds: Option<u64>,

    /// Override the base log level (trace|debug|info|warn|error).
    #[arg(long = "log-level", value_name = "LEVEL")]
    pub log_level: Option<String>,

    /// Emit logs as JSON instead of the compact format.
    #[arg(long = "log-json", action = clap::ArgAction::SetTrue)]
    pub log_json: bool,

    /// Shared secret for `POST /internal/cache/invalidate`.
    #[arg(
        long = "invalidation-secret",
        env = "AULA_GATEWAY__INVALIDATION_SECRET",
        value_name = "SECRET",
        hide_env_values = true
    )]
    pub invalidation_secret: Option<String>,

    /// Shared secret for `POST /internal/cache/revalidate`.
    #[arg(
        long = "revalidation-secret",
        env = "AULA_GATEWAY__REVALIDATION_SECRET",
        value_name = "SECRET",
        hide_env_values = true
    )]
    pub revalidation_secret: Option<String>,
}

#[derive(Debug, Clone)]
pub struct Settings {
    pub server: ServerSettings,
    pub logging: LoggingSettings,
    pub cache: CacheSettings,
    pub gateway: GatewaySettings,
    pub live: LiveSettings,
}

#[derive(Debug, Clone)]
pub struct ServerSettings {
    pub listen_addr: SocketAddr,
    pub graceful_shutdown: Duration,
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

#[derive(Debug, Clone)]
pub struct CacheSettings {
    pub enable_response_cache: bool,
    pub response_limit: usize,
}

#[derive(Debug, Clone)]
pub struct GatewaySettings {
    pub invalidation_secret: Option<String>,
    pub revalidation_secret: Option<String>,
}

#[derive(Debug, Clone)]
pub struct LiveSettings {
    pub tombstone_ttl: Duration,
    pub refetch_timeout: Duration,
    pub refetch_max_attempts: u32,
    pub refetch_backoff: Duration,
}

impl From<&LiveSettings> for crate::live::LiveConfig {
    fn from(settings: &LiveSettings) -> Self {
        Self {
            tombstone_ttl: settings.tombstone_ttl,
            refetch: crate::live::RefetchPolicy {
                timeout: settings.refetch_timeout,
                max_attempts: settings.refetch_max_attempts,
                initial_backoff: settings.refetch_backoff,
            },
        }
    }
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

    builder = builder.add_source(Environment::with_prefix("AULA").separator("__"));

    let mut raw: RawSettings = builder.build()?.try_deserialize()?;
    raw.apply_overrides(&cli.overrides);
    Settings::from_raw(raw)
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawSettings {
    server: RawServerSettings,
    logging: RawLoggingSettings,
    cache: RawCacheSettings,
    gateway: RawGatewaySettings,
    live: RawLiveSettings,
}

impl RawSettings {
    fn apply_overrides(&mut self, overrides: &ServeOverrides) {
        if let Some(host) = overrides.server_host.as_ref() {
            self.server.host = Some(host.clone());
        }
        if let Some(port) = overrides.server_port {
            self.server.port = Some(port);
        }
        if let Some(seconds) = overrides.graceful_shutdown_seconds {
            self.server.graceful_shutdown_seconds = Some(seconds);
        }
        if let Some(level) = overrides.log_level.as_ref() {
            self.logging.level = Some(level.clone());
        }
        if overrides.log_json {
            self.logging.json = Some(true);
        }
        if let Some(secret) = overrides.invalidation_secret.as_ref() {
            self.gateway.invalidation_secret = Some(secret.clone());
        }
        if let Some(secret) = overrides.revalidation_secret.as_ref() {
            self.gateway.revalidation_secret = Some(secret.clone());
        }
    }
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawServerSettings {
    host: Option<String>,
    port: Option<u16>,
    graceful_shutdown_seconds: Option<u64>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLoggingSettings {
    level: Option<String>,
    json: Option<bool>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawCacheSettings {
    enable_response_cache: Option<bool>,
    response_limit: Option<usize>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawGatewaySettings {
    invalidation_secret: Option<String>,
    revalidation_secret: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Default)]
#[serde(default)]
struct RawLiveSettings {
    tombstone_ttl_seconds: Option<u64>,
    refetch_timeout_seconds: Option<u64>,
    refetch_max_attempts: Option<u32>,
    refetch_backoff_ms: Option<u64>,
}

impl Settings {
    fn from_raw(raw: RawSettings) -> Result<Self, LoadError> {
        let RawSettings {
            server,
            logging,
            cache,
            gateway,
            live,
        } = raw;

        Ok(Self {
            server: build_server_settings(server)?,
            logging: build_logging_settings(logging)?,
            cache: build_cache_settings(cache)?,
            gateway: build_gateway_settings(gateway)?,
            live: build_live_settings(live)?,
        })
    }
}

fn build_server_settings(server: RawServerSettings) -> Result<ServerSettings, LoadError> {
    let host = server.host.unwrap_or_else(|| DEFAULT_HOST.to_string());
    if host.trim().is_empty() {
        return Err(LoadError::invalid("server.host", "must not be empty"));
    }
    let port = server.port.unwrap_or(DEFAULT_PORT);
    let listen_addr = format!("{host}:{port}")
        .parse::<SocketAddr>()
        .map_err(|err| LoadError::invalid("server.host", err.to_string()))?;

    let graceful_secs = server
        .graceful_shutdown_seconds
        .unwrap_or(DEFAULT_GRACEFUL_SHUTDOWN_SECS);
    if graceful_secs == 0 {
        return Err(LoadError::invalid(
            "server.graceful_shutdown_seconds",
            "must be greater than zero",
        ));
    }

    Ok(ServerSettings {
        listen_addr,
        graceful_shutdown: Duration::from_secs(graceful_secs),
    })
}

fn build_logging_settings(logging: RawLoggingSettings) -> Result<LoggingSettings, LoadError> {
    let level = match logging.level {
        Some(raw) => LevelFilter::from_str(&raw)
            .map_err(|err| LoadError::invalid("logging.level", format!("failed to parse: {err}")))?,
        None => LevelFilter::INFO,
    };
    let format = if logging.json.unwrap_or(false) {
        LogFormat::Json
    } else {
        LogFormat::Compact
    };
    Ok(LoggingSettings { level, format })
}

fn build_cache_settings(cache: RawCacheSettings) -> Result<CacheSettings, LoadError> {
    let response_limit = cache.response_limit.unwrap_or(DEFAULT_RESPONSE_LIMIT);
    if response_limit == 0 {
        return Err(LoadError::invalid(
            "cache.response_limit",
            "must be greater than zero",
        ));
    }
    Ok(CacheSettings {
        enable_response_cache: cache.enable_response_cache.unwrap_or(true),
        response_limit,
    })
}

fn build_gateway_settings(gateway: RawGatewaySettings) -> Result<GatewaySettings, LoadError> {
    let check = |key: &'static str, secret: Option<String>| match secret {
        Some(value) if value.trim().is_empty() => {
            Err(LoadError::invalid(key, "must not be empty when set"))
        }
        other => Ok(other),
    };
    Ok(GatewaySettings {
        invalidation_secret: check("gateway.invalidation_secret", gateway.invalidation_secret)?,
        revalidation_secret: check("gateway.revalidation_secret", gateway.revalidation_secret)?,
    })
}

fn build_live_settings(live: RawLiveSettings) -> Result<LiveSettings, LoadError> {
    let max_attempts = live
        .refetch_max_attempts
        .unwrap_or(DEFAULT_REFETCH_MAX_ATTEMPTS);
    if max_attempts == 0 {
        return Err(LoadError::invalid(
            "live.refetch_max_attempts",
            "must be greater than zero",
        ));
    }
    Ok(LiveSettings {
        tombstone_ttl: Duration::from_secs(
            live.tombstone_ttl_seconds.unwrap_or(DEFAULT_TOMBSTONE_TTL_SECS),
        ),
        refetch_timeout: Duration::from_secs(
            live.refetch_timeout_seconds
                .unwrap_or(DEFAULT_REFETCH_TIMEOUT_SECS),
        ),
        refetch_max_attempts: max_attempts,
        refetch_backoff: Duration::from_millis(
            live.refetch_backoff_ms.unwrap_or(DEFAULT_REFETCH_BACKOFF_MS),
        ),
    })
}
