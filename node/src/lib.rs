//! Operator node for prizeline.
//!
//! Reads a YAML [Config], validates it into a [ValidatedConfig] and wires the settlement engine
//! to its production collaborators. The `prizeline` binary is a thin CLI over [commands].

use prizeline_client::EvmTransferConfig;
use prizeline_settlement::EngineConfig;
use prizeline_types::{Address, Amount, MAX_DECIMALS};
use serde::{Deserialize, Serialize};
use std::{
    fmt, fs,
    num::NonZeroU32,
    path::{Path, PathBuf},
    str::FromStr,
    time::Duration,
};
use thiserror::Error;
use tracing::Level;
use url::Url;

pub mod commands;
pub mod defaults;
pub mod server;


/// Output format of the log subscriber.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum LogFormat {
    #[default]
    Text,
    Json,
}

/// Node configuration as read from YAML.
#[derive(Deserialize, Serialize)]
pub struct Config {
    pub rpc_url: String,
    pub chain_id: u64,
    pub standings_url: String,

    /// Hex-encoded payer key. Prefer `payer_private_key_file` or the environment.
    #[serde(default)]
    pub payer_private_key: Option<String>,
    #[serde(default)]
    pub payer_private_key_file: Option<PathBuf>,

    #[serde(default = "default_ledger_path")]
    pub ledger_path: PathBuf,
    #[serde(default)]
    pub schedule_path: Option<PathBuf>,
    #[serde(default)]
    pub metrics_port: Option<u16>,
    #[serde(default = "default_log_level")]
    pub log_level: String,
    #[serde(default)]
    pub log_format: LogFormat,

    #[serde(default = "default_confirmation_timeout_ms")]
    pub confirmation_timeout_ms: u64,
    #[serde(default = "default_confirmation_poll_ms")]
    pub confirmation_poll_ms: u64,
    #[serde(default = "default_rpc_timeout_ms")]
    pub rpc_timeout_ms: u64,
    #[serde(default = "default_recovery_probe_timeout_ms")]
    pub recovery_probe_timeout_ms: u64,
    #[serde(default = "default_submit_attempts")]
    pub submit_attempts: u32,
    #[serde(default = "default_submit_backoff_ms")]
    pub submit_backoff_ms: u64,
    /// Decimal amount of the native asset never spent on payouts.
    #[serde(default = "default_balance_reserve")]
    pub balance_reserve: String,
    #[serde(default = "default_decimals")]
    pub decimals: u32,
    #[serde(default = "default_confirmations")]
    pub confirmations: u64,
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid log level: {value}")]
    InvalidLogLevel { value: String },
    #[error("{field} must be > 0 (got {value})")]
    InvalidNonZero { field: &'static str, value: u64 },
    #[error("{field} must be a valid URL: {value}")]
    InvalidUrl { field: &'static str, value: String },
    #[error("{field} URL scheme must be http or https: {value}")]
    InvalidUrlScheme { field: &'static str, value: String },
    #[error("decimals must be <= {MAX_DECIMALS} (got {0})")]
    UnsupportedDecimals(u32),
    #[error("{field} is not a valid amount: {value}")]
    InvalidAmount {
        field: &'static str,
        value: String,
        #[source]
        source: prizeline_types::Error,
    },
    #[error("could not read key file {path}")]
    ReadKeyFile {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("key file {0} is empty")]
    EmptyKeyFile(PathBuf),
    #[error(
        "no payer private key: set payer_private_key_file or {}",
        defaults::PAYER_PRIVATE_KEY_ENV
    )]
    MissingPrivateKey,
}

pub struct ValidatedConfig {
    pub rpc_url: String,
    pub chain_id: u64,
    pub standings_url: String,
    pub payer_private_key: Option<String>,

    pub ledger_path: PathBuf,
    pub schedule_path: Option<PathBuf>,
    pub metrics_port: Option<u16>,
    pub log_level: Level,
    pub log_format: LogFormat,

    pub confirmation_timeout: Duration,
    pub confirmation_poll: Duration,
    pub rpc_timeout: Duration,
    pub recovery_probe_timeout: Duration,
    pub submit_attempts: NonZeroU32,
    pub submit_backoff: Duration,
    pub balance_reserve: Amount,
    pub decimals: u32,
    pub confirmations: u64,
}

impl ValidatedConfig {
    /// Engine settings for payouts from `payer`.
    pub fn engine_config(&self, payer: Address) -> EngineConfig {
        EngineConfig {
            payer,
            confirmation_timeout: self.confirmation_timeout,
            recovery_probe_timeout: self.recovery_probe_timeout,
            submit_attempts: self.submit_attempts,
            submit_backoff: self.submit_backoff,
            balance_reserve: self.balance_reserve,
        }
    }

    pub fn transfer_config(&self) -> Result<EvmTransferConfig, ConfigError> {
        let private_key = self
            .payer_private_key
            .clone()
            .ok_or(ConfigError::MissingPrivateKey)?;
        Ok(EvmTransferConfig {
            rpc_url: self.rpc_url.clone(),
            private_key,
            chain_id: self.chain_id,
            confirmations: self.confirmations,
            poll_interval: self.confirmation_poll,
            request_timeout: self.rpc_timeout,
        })
    }
}

struct RedactedConfig<'a>(&'a Config);

impl fmt::Debug for RedactedConfig<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let cfg = self.0;
        f.debug_struct("Config")
            .field("rpc_url", &cfg.rpc_url)
            .field("chain_id", &cfg.chain_id)
            .field("standings_url", &cfg.standings_url)
            .field(
                "payer_private_key",
                &cfg.payer_private_key.as_ref().map(|_| "<redacted>"),
            )
            .field("payer_private_key_file", &cfg.payer_private_key_file)
            .field("ledger_path", &cfg.ledger_path)
            .field("schedule_path", &cfg.schedule_path)
            .field("metrics_port", &cfg.metrics_port)
            .field("log_level", &cfg.log_level)
            .field("log_format", &cfg.log_format)
            .field("confirmation_timeout_ms", &cfg.confirmation_timeout_ms)
            .field("confirmation_poll_ms", &cfg.confirmation_poll_ms)
            .field("rpc_timeout_ms", &cfg.rpc_timeout_ms)
            .field("recovery_probe_timeout_ms", &cfg.recovery_probe_timeout_ms)
            .field("submit_attempts", &cfg.submit_attempts)
            .field("submit_backoff_ms", &cfg.submit_backoff_ms)
            .field("balance_reserve", &cfg.balance_reserve)
            .field("decimals", &cfg.decimals)
            .field("confirmations", &cfg.confirmations)
            .finish()
    }
}

fn default_ledger_path() -> PathBuf {
    PathBuf::from(defaults::DEFAULT_LEDGER_PATH)
}

fn default_log_level() -> String {
    defaults::DEFAULT_LOG_LEVEL.to_string()
}

fn default_confirmation_timeout_ms() -> u64 {
    defaults::DEFAULT_CONFIRMATION_TIMEOUT_MS
}

fn default_confirmation_poll_ms() -> u64 {
    defaults::DEFAULT_CONFIRMATION_POLL_MS
}

fn default_rpc_timeout_ms() -> u64 {
    defaults::DEFAULT_RPC_TIMEOUT_MS
}

fn default_recovery_probe_timeout_ms() -> u64 {
    defaults::DEFAULT_RECOVERY_PROBE_TIMEOUT_MS
}

fn default_submit_attempts() -> u32 {
    defaults::DEFAULT_SUBMIT_ATTEMPTS
}

fn default_submit_backoff_ms() -> u64 {
    defaults::DEFAULT_SUBMIT_BACKOFF_MS
}

fn default_balance_reserve() -> String {
    defaults::DEFAULT_BALANCE_RESERVE.to_string()
}

fn default_decimals() -> u32 {
    defaults::DEFAULT_DECIMALS
}

fn default_confirmations() -> u64 {
    defaults::DEFAULT_CONFIRMATIONS
}

fn nonzero_millis(field: &'static str, value: u64) -> Result<Duration, ConfigError> {
    ensure_nonzero(field, value)?;
    Ok(Duration::from_millis(value))
}

fn ensure_nonzero(field: &'static str, value: u64) -> Result<(), ConfigError> {
    if value == 0 {
        return Err(ConfigError::InvalidNonZero { field, value });
    }
    Ok(())
}

fn validate_http_url(field: &'static str, value: &str) -> Result<(), ConfigError> {
    let url = Url::parse(value).map_err(|_| ConfigError::InvalidUrl {
        field,
        value: value.to_string(),
    })?;
    match url.scheme() {
        "http" | "https" => {}
        _ => {
            return Err(ConfigError::InvalidUrlScheme {
                field,
                value: value.to_string(),
            })
        }
    }
    if url.host_str().is_none() {
        return Err(ConfigError::InvalidUrl {
            field,
            value: value.to_string(),
        });
    }
    Ok(())
}

fn non_blank(value: Option<String>) -> Option<String> {
    value
        .map(|value| value.trim().to_string())
        .filter(|value| !value.is_empty())
}

fn read_key_file(path: &Path) -> Result<String, ConfigError> {
    let key = fs::read_to_string(path).map_err(|source| ConfigError::ReadKeyFile {
        path: path.to_path_buf(),
        source,
    })?;
    non_blank(Some(key)).ok_or_else(|| ConfigError::EmptyKeyFile(path.to_path_buf()))
}

impl Config {
    pub fn redacted_debug(&self) -> impl fmt::Debug + '_ {
        RedactedConfig(self)
    }

    /// Find the payer key: inline value, then key file, then the environment.
    ///
    /// `None` when no source is configured; commands that sign transfers refuse to run then.
    pub fn resolve_private_key(
        &self,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<Option<String>, ConfigError> {
        if let Some(key) = non_blank(self.payer_private_key.clone()) {
            return Ok(Some(key));
        }
        if let Some(path) = &self.payer_private_key_file {
            return read_key_file(path).map(Some);
        }
        if let Some(key) = non_blank(env(defaults::PAYER_PRIVATE_KEY_ENV)) {
            return Ok(Some(key));
        }
        if let Some(path) = non_blank(env(defaults::PAYER_PRIVATE_KEY_FILE_ENV)) {
            return read_key_file(Path::new(&path)).map(Some);
        }
        Ok(None)
    }

    pub fn validate(self) -> Result<ValidatedConfig, ConfigError> {
        self.validate_with_env(|name| std::env::var(name).ok())
    }

    pub fn validate_with_env(
        self,
        env: impl Fn(&str) -> Option<String>,
    ) -> Result<ValidatedConfig, ConfigError> {
        let log_level =
            Level::from_str(&self.log_level).map_err(|_| ConfigError::InvalidLogLevel {
                value: self.log_level.clone(),
            })?;
        validate_http_url("rpc_url", &self.rpc_url)?;
        validate_http_url("standings_url", &self.standings_url)?;
        ensure_nonzero("chain_id", self.chain_id)?;
        ensure_nonzero("confirmations", self.confirmations)?;
        let confirmation_timeout =
            nonzero_millis("confirmation_timeout_ms", self.confirmation_timeout_ms)?;
        let confirmation_poll = nonzero_millis("confirmation_poll_ms", self.confirmation_poll_ms)?;
        let rpc_timeout = nonzero_millis("rpc_timeout_ms", self.rpc_timeout_ms)?;
        let recovery_probe_timeout =
            nonzero_millis("recovery_probe_timeout_ms", self.recovery_probe_timeout_ms)?;
        let submit_attempts =
            NonZeroU32::new(self.submit_attempts).ok_or(ConfigError::InvalidNonZero {
                field: "submit_attempts",
                value: 0,
            })?;
        if self.decimals > MAX_DECIMALS {
            return Err(ConfigError::UnsupportedDecimals(self.decimals));
        }
        let balance_reserve =
            Amount::parse_decimal(&self.balance_reserve, self.decimals).map_err(|source| {
                ConfigError::InvalidAmount {
                    field: "balance_reserve",
                    value: self.balance_reserve.clone(),
                    source,
                }
            })?;
        let payer_private_key = self.resolve_private_key(env)?;

        Ok(ValidatedConfig {
            rpc_url: self.rpc_url,
            chain_id: self.chain_id,
            standings_url: self.standings_url,
            payer_private_key,
            ledger_path: self.ledger_path,
            schedule_path: self.schedule_path,
            metrics_port: self.metrics_port,
            log_level,
            log_format: self.log_format,
            confirmation_timeout,
            confirmation_poll,
            rpc_timeout,
            recovery_probe_timeout,
            submit_attempts,
            submit_backoff: Duration::from_millis(self.submit_backoff_ms),
            balance_reserve,
            decimals: self.decimals,
            confirmations: self.confirmations,
        })
    }
}
