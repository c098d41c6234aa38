use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_PORT: u16 = 5500;
pub const DEFAULT_BIND: &str = "127.0.0.1";
/// Path the reminder workflow is addressed by; shown as the target URL of instances.
pub const REMINDER_WORKFLOW_PATH: &str = "/api/v1/workflows/subscription/reminder";

/// Top-level config (subtrack.toml + SUBTRACK_* env overrides).
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct SubtrackConfig {
    #[serde(default)]
    pub gateway: GatewayConfig,
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    #[serde(default)]
    pub notifier: NotifierConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GatewayConfig {
    #[serde(default = "default_port")]
    pub port: u16,
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Externally reachable base URL; prefixes the workflow target URL.
    /// Defaults to `http://{bind}:{port}`.
    pub public_url: Option<String>,
    #[serde(default)]
    pub auth: AuthConfig,
}

impl Default for GatewayConfig {
    fn default() -> Self {
        Self {
            port: DEFAULT_PORT,
            bind: DEFAULT_BIND.to_string(),
            public_url: None,
            auth: AuthConfig::default(),
        }
    }
}

impl GatewayConfig {
    /// Full URL of the reminder workflow endpoint, recorded on every instance.
    pub fn workflow_target(&self) -> String {
        let base = self
            .public_url
            .clone()
            .unwrap_or_else(|| format!("http://{}:{}", self.bind, self.port));
        format!("{}{}", base.trim_end_matches('/'), REMINDER_WORKFLOW_PATH)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AuthConfig {
    pub mode: AuthMode,
    pub token: Option<String>,
}

/// Token mode with no token configured rejects every admin request.
impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mode: AuthMode::Token,
            token: None,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "kebab-case")]
pub enum AuthMode {
    Token,
    None,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DatabaseConfig {
    #[serde(default = "default_db_path")]
    pub path: String,
}

impl Default for DatabaseConfig {
    fn default() -> Self {
        Self {
            path: default_db_path(),
        }
    }
}

/// Tuning for the workflow engine and lifecycle manager.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// How often the engine looks for instances whose wake time has arrived.
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// How long `arm`/`disarm` wait for a running instance to acknowledge a stop.
    #[serde(default = "default_stop_ack_timeout_ms")]
    pub stop_ack_timeout_ms: u64,
    /// Attempts per journaled step for transient failures (1 = no retry).
    #[serde(default = "default_step_retries")]
    pub step_retries: u32,
    /// Base delay between step attempts; doubled after every failure.
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    /// Times a run that still fails transiently is parked and retried later
    /// before the instance is given up on.
    #[serde(default = "default_deferred_retries")]
    pub deferred_retries: u32,
    /// Wake delay after the first parked retry; doubled after every further one.
    #[serde(default = "default_deferred_backoff_ms")]
    pub deferred_backoff_ms: u64,
    /// Run the stray-instance sweep every N ticks (0 disables periodic sweeps).
    #[serde(default = "default_sweep_every_ticks")]
    pub sweep_every_ticks: u64,
    /// Maximum instances claimed per tick.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: default_poll_interval_ms(),
            stop_ack_timeout_ms: default_stop_ack_timeout_ms(),
            step_retries: default_step_retries(),
            retry_backoff_ms: default_retry_backoff_ms(),
            deferred_retries: default_deferred_retries(),
            deferred_backoff_ms: default_deferred_backoff_ms(),
            sweep_every_ticks: default_sweep_every_ticks(),
            batch_size: default_batch_size(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Default)]
#[serde(rename_all = "kebab-case")]
pub enum NotifierKind {
    /// Render reminders and write them to the log only.
    #[default]
    Log,
    /// POST reminders as JSON to `notifier.webhook.url`.
    Webhook,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct NotifierConfig {
    #[serde(default)]
    pub kind: NotifierKind,
    pub webhook: Option<WebhookNotifierConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WebhookNotifierConfig {
    pub url: String,
    /// When set, each request carries `X-Subtrack-Signature: sha256=<hex hmac of body>`.
    pub secret: Option<String>,
    #[serde(default = "default_webhook_timeout_ms")]
    pub timeout_ms: u64,
}

fn default_port() -> u16 {
    DEFAULT_PORT
}
fn default_bind() -> String {
    DEFAULT_BIND.to_string()
}
fn default_poll_interval_ms() -> u64 {
    1_000
}
fn default_stop_ack_timeout_ms() -> u64 {
    5_000
}
fn default_step_retries() -> u32 {
    3
}
fn default_retry_backoff_ms() -> u64 {
    200
}
fn default_deferred_retries() -> u32 {
    5
}
fn default_deferred_backoff_ms() -> u64 {
    60_000
}
fn default_sweep_every_ticks() -> u64 {
    60
}
fn default_batch_size() -> usize {
    64
}
fn default_webhook_timeout_ms() -> u64 {
    10_000
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.subtrack/subtrack.db", home)
}

impl SubtrackConfig {
    /// Load config from a TOML file with SUBTRACK_* env var overrides.
    ///
    /// Env keys nest on a double underscore, so
    /// `SUBTRACK_SCHEDULER__POLL_INTERVAL_MS` sets `scheduler.poll_interval_ms`.
    /// Uses the explicit path when given, else `~/.subtrack/subtrack.toml`.
    /// A missing file is not an error; every section has defaults.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        if !std::path::Path::new(&path).exists() {
            tracing::warn!(path = %path, "config file not found, using defaults");
        }

        let config: SubtrackConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("SUBTRACK_").split("__"))
            .extract()
            .map_err(|e| crate::error::SubtrackError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.subtrack/subtrack.toml", home)
}
