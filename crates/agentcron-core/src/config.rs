use chrono::{DateTime, Utc};
use figment::{
    providers::{Env, Format, Toml},
    Figment,
};
use serde::{Deserialize, Serialize};

pub const DEFAULT_TICK_INTERVAL_SECS: u64 = 1;
pub const DEFAULT_TIMEZONE: &str = "UTC";
pub const DEFAULT_MAX_CATCHUP_RUNS: usize = 1_000;
pub const DEFAULT_DISPATCH_BUFFER: usize = 256; // fired runs waiting for the dispatcher

/// Top-level config (agentcron.toml + AGENTCRON_* env overrides).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentcronConfig {
    #[serde(default)]
    pub database: DatabaseConfig,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
    /// Job definitions seeded into the store on startup.
    #[serde(default)]
    pub jobs: Vec<JobConfig>,
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

/// Scheduler tuning knobs.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Seconds between two ticks of the scheduler loop.
    #[serde(default = "default_tick_interval_secs")]
    pub tick_interval_secs: u64,
    /// IANA zone used for jobs that do not name one.
    #[serde(default = "default_timezone")]
    pub default_timezone: String,
    /// Upper bound on runs materialized by one catch-up pass of a single job.
    #[serde(default = "default_max_catchup_runs")]
    pub max_catchup_runs: usize,
    /// Capacity of the channel between the tick loop and the dispatcher.
    #[serde(default = "default_dispatch_buffer")]
    pub dispatch_buffer: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval_secs: DEFAULT_TICK_INTERVAL_SECS,
            default_timezone: DEFAULT_TIMEZONE.to_string(),
            max_catchup_runs: DEFAULT_MAX_CATCHUP_RUNS,
            dispatch_buffer: DEFAULT_DISPATCH_BUFFER,
        }
    }
}

/// A job definition as written in the config file.
///
/// `concurrency` stays a plain string here; the scheduler decides what an
/// unrecognised value means.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct JobConfig {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    /// Cron expression, five fields or six/seven with seconds/years.
    pub schedule: String,
    pub timezone: Option<String>,
    #[serde(default = "bool_true")]
    pub enabled: bool,
    #[serde(default)]
    pub jitter_ms: u64,
    pub not_before: Option<DateTime<Utc>>,
    pub not_after: Option<DateTime<Utc>>,
    #[serde(default)]
    pub catchup: bool,
    #[serde(default = "default_concurrency")]
    pub concurrency: String,
    /// Opaque payload handed to the executor.
    #[serde(default)]
    pub action: serde_json::Value,
}

fn bool_true() -> bool {
    true
}
fn default_concurrency() -> String {
    "allow".to_string()
}
fn default_tick_interval_secs() -> u64 {
    DEFAULT_TICK_INTERVAL_SECS
}
fn default_timezone() -> String {
    DEFAULT_TIMEZONE.to_string()
}
fn default_max_catchup_runs() -> usize {
    DEFAULT_MAX_CATCHUP_RUNS
}
fn default_dispatch_buffer() -> usize {
    DEFAULT_DISPATCH_BUFFER
}
fn default_db_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.agentcron/agentcron.db", home)
}

impl AgentcronConfig {
    /// Load config from a TOML file with AGENTCRON_* env var overrides.
    ///
    /// Nested keys use a double underscore, e.g.
    /// `AGENTCRON_SCHEDULER__TICK_INTERVAL_SECS=5`.
    pub fn load(config_path: Option<&str>) -> crate::error::Result<Self> {
        let path = config_path
            .map(String::from)
            .unwrap_or_else(default_config_path);

        let config: AgentcronConfig = Figment::new()
            .merge(Toml::file(&path))
            .merge(Env::prefixed("AGENTCRON_").split("__"))
            .extract()
            .map_err(|e| crate::error::AgentcronError::Config(e.to_string()))?;

        Ok(config)
    }
}

fn default_config_path() -> String {
    let home = std::env::var("HOME").unwrap_or_else(|_| ".".to_string());
    format!("{}/.agentcron/agentcron.toml", home)
}
