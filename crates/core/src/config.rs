use std::env;
use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{KdsError, Result};

/// Load .env file (silently ignores if missing).
pub fn load_dotenv() {
    dotenvy::dotenv().ok();
}

fn env_or(key: &str, default: &str) -> String {
    env::var(key).unwrap_or_else(|_| default.to_string())
}

fn env_opt(key: &str) -> Option<String> {
    env::var(key).ok().filter(|s| !s.is_empty())
}

/// Read a profiled env var: tries {PROFILE}_{KEY} first, falls back to {KEY}.
fn profiled_env_opt(profile: &str, key: &str) -> Option<String> {
    if !profile.is_empty() {
        let prefixed = format!("{}_{}", profile, key);
        if let Some(v) = env_opt(&prefixed) {
            return Some(v);
        }
    }
    env_opt(key)
}

/// Parse a profiled env var, ignoring values that do not parse.
fn profiled_env_parse<T: std::str::FromStr>(profile: &str, key: &str) -> Option<T> {
    profiled_env_opt(profile, key).and_then(|v| {
        let parsed = v.parse().ok();
        if parsed.is_none() {
            tracing::warn!("Ignoring unparsable value for {}: {:?}", key, v);
        }
        parsed
    })
}

fn profiled_env_bool(profile: &str, key: &str) -> Option<bool> {
    profiled_env_opt(profile, key).map(|v| matches!(v.to_ascii_lowercase().as_str(), "1" | "true" | "yes" | "on"))
}

// ── Top-level config ──────────────────────────────────────────

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    /// Active profile name (empty = default).
    #[serde(default)]
    pub profile: String,
    #[serde(default)]
    pub scheduler: SchedulerConfig,
}

impl Config {
    /// Build config from environment variables (call `load_dotenv()` first).
    /// Profile is read from `KDS_PROFILE`. When set (e.g. `BENCH`), every key
    /// is first looked up as `{PROFILE}_{KEY}`, falling back to `{KEY}`.
    pub fn from_env() -> Self {
        let profile = env_or("KDS_PROFILE", "").to_uppercase();
        Self::for_profile(&profile)
    }

    /// Build config for a specific named profile (empty string = default).
    pub fn for_profile(profile: &str) -> Self {
        let p = profile.to_uppercase();
        Self {
            scheduler: SchedulerConfig::from_env_profiled(&p, SchedulerConfig::default()),
            profile: p,
        }
    }

    /// Layer environment over an optional TOML file over defaults, then validate.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let profile = env_or("KDS_PROFILE", "").to_uppercase();
        let base = match path {
            Some(path) => SchedulerConfig::from_toml_file(path)?,
            None => SchedulerConfig::default(),
        };
        let scheduler = SchedulerConfig::from_env_profiled(&profile, base);
        scheduler.validate()?;
        Ok(Self { profile, scheduler })
    }

    pub fn profile_label(&self) -> &str {
        if self.profile.is_empty() { "default" } else { &self.profile }
    }

    /// Print a summary for startup logs.
    pub fn log_summary(&self) {
        let s = &self.scheduler;
        tracing::info!("Config loaded (profile: {}):", self.profile_label());
        tracing::info!("  admission:   max_pending={}, default_slots={}", s.max_pending, s.default_slots);
        tracing::info!("  timing:      tick={}ms, poll={}us, reset_poll={}us", s.tick_interval_ms, s.poll_interval_us, s.reset_poll_interval_us);
        tracing::info!("  cu:          credits={}", s.cu_credits);
        tracing::info!("  reset:       drain_retries={}, drain_wait={}ms, flush_wait={}ms", s.reset_drain_retries, s.reset_drain_wait_ms, s.flush_wait_ms);
    }

    pub fn summary_json(&self) -> serde_json::Value {
        serde_json::json!({
            "profile": self.profile_label(),
            "scheduler": self.scheduler,
        })
    }
}

// ── Scheduler ─────────────────────────────────────────────────

/// Scheduler tunables.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SchedulerConfig {
    /// Maximum jobs waiting in the cross-thread pending queue.
    #[serde(default = "default_max_pending")]
    pub max_pending: usize,
    /// Timeout supervisor period.
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,
    /// Increment between reset-done checks.
    #[serde(default = "default_reset_poll_interval_us")]
    pub reset_poll_interval_us: u64,
    /// Self-wake period while jobs need polling.
    #[serde(default = "default_poll_interval_us")]
    pub poll_interval_us: u64,
    /// Slot count before the first configure command.
    #[serde(default = "default_slots")]
    pub default_slots: usize,
    /// Jobs a single CU may hold before it is marked busy.
    #[serde(default = "default_cu_credits")]
    pub cu_credits: u32,
    #[serde(default = "default_reset_drain_retries")]
    pub reset_drain_retries: u32,
    #[serde(default = "default_reset_drain_wait_ms")]
    pub reset_drain_wait_ms: u64,
    #[serde(default = "default_flush_wait_ms")]
    pub flush_wait_ms: u64,
    /// Record per-state timestamps on every job regardless of submit flag.
    #[serde(default)]
    pub capture_timestamps: bool,
}

fn default_max_pending() -> usize {
    1024
}

fn default_tick_interval_ms() -> u64 {
    500
}

fn default_reset_poll_interval_us() -> u64 {
    1000
}

fn default_poll_interval_us() -> u64 {
    100
}

fn default_slots() -> usize {
    16
}

fn default_cu_credits() -> u32 {
    1
}

fn default_reset_drain_retries() -> u32 {
    20
}

fn default_reset_drain_wait_ms() -> u64 {
    100
}

fn default_flush_wait_ms() -> u64 {
    1000
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            max_pending: default_max_pending(),
            tick_interval_ms: default_tick_interval_ms(),
            reset_poll_interval_us: default_reset_poll_interval_us(),
            poll_interval_us: default_poll_interval_us(),
            default_slots: default_slots(),
            cu_credits: default_cu_credits(),
            reset_drain_retries: default_reset_drain_retries(),
            reset_drain_wait_ms: default_reset_drain_wait_ms(),
            flush_wait_ms: default_flush_wait_ms(),
            capture_timestamps: false,
        }
    }
}

impl SchedulerConfig {
    /// Defaults overlaid with `KDS_*` environment variables.
    pub fn from_env() -> Self {
        let profile = env_or("KDS_PROFILE", "").to_uppercase();
        Self::from_env_profiled(&profile, Self::default())
    }

    /// Overlay profiled `KDS_*` variables onto `base`. Unset keys keep the base value.
    pub fn from_env_profiled(p: &str, base: Self) -> Self {
        Self {
            max_pending: profiled_env_parse(p, "KDS_MAX_PENDING").unwrap_or(base.max_pending),
            tick_interval_ms: profiled_env_parse(p, "KDS_TICK_INTERVAL_MS").unwrap_or(base.tick_interval_ms),
            reset_poll_interval_us: profiled_env_parse(p, "KDS_RESET_POLL_INTERVAL_US")
                .unwrap_or(base.reset_poll_interval_us),
            poll_interval_us: profiled_env_parse(p, "KDS_POLL_INTERVAL_US").unwrap_or(base.poll_interval_us),
            default_slots: profiled_env_parse(p, "KDS_DEFAULT_SLOTS").unwrap_or(base.default_slots),
            cu_credits: profiled_env_parse(p, "KDS_CU_CREDITS").unwrap_or(base.cu_credits),
            reset_drain_retries: profiled_env_parse(p, "KDS_RESET_DRAIN_RETRIES").unwrap_or(base.reset_drain_retries),
            reset_drain_wait_ms: profiled_env_parse(p, "KDS_RESET_DRAIN_WAIT_MS").unwrap_or(base.reset_drain_wait_ms),
            flush_wait_ms: profiled_env_parse(p, "KDS_FLUSH_WAIT_MS").unwrap_or(base.flush_wait_ms),
            capture_timestamps: profiled_env_bool(p, "KDS_CAPTURE_TIMESTAMPS").unwrap_or(base.capture_timestamps),
        }
    }

    pub fn from_toml_str(content: &str) -> Result<Self> {
        Ok(toml::from_str(content)?)
    }

    pub fn from_toml_file(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    pub fn validate(&self) -> Result<()> {
        if self.max_pending == 0 {
            return Err(KdsError::InvalidConfig("max_pending must be positive".into()));
        }
        if self.tick_interval_ms == 0 {
            return Err(KdsError::InvalidConfig("tick_interval_ms must be positive".into()));
        }
        if self.reset_poll_interval_us == 0 || self.poll_interval_us == 0 {
            return Err(KdsError::InvalidConfig("poll intervals must be positive".into()));
        }
        if self.default_slots == 0 || self.default_slots > crate::command::MAX_SLOTS {
            return Err(KdsError::InvalidConfig(format!(
                "default_slots {} outside 1..={}",
                self.default_slots,
                crate::command::MAX_SLOTS
            )));
        }
        if self.cu_credits == 0 {
            return Err(KdsError::InvalidConfig("cu_credits must be positive".into()));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.tick_interval_ms)
    }

    pub fn reset_poll_interval(&self) -> Duration {
        Duration::from_micros(self.reset_poll_interval_us)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_micros(self.poll_interval_us)
    }

    pub fn reset_drain_wait(&self) -> Duration {
        Duration::from_millis(self.reset_drain_wait_ms)
    }

    pub fn flush_wait(&self) -> Duration {
        Duration::from_millis(self.flush_wait_ms)
    }

    /// Supervisor ticks a job may run before it is declared hung. Zero means no timeout.
    pub fn run_timeout_ticks(&self, run_timeout: Duration) -> u32 {
        if run_timeout.is_zero() {
            return 0;
        }
        let ticks = run_timeout.as_micros() / self.tick_interval().as_micros().max(1) + 1;
        ticks.min(u32::MAX as u128) as u32
    }

    /// Reset-done checks before a reset is declared failed.
    pub fn reset_timeout_retries(&self, reset_timeout: Duration) -> u32 {
        let retries = reset_timeout.as_micros() / self.reset_poll_interval().as_micros().max(1) + 1;
        retries.min(u32::MAX as u128) as u32
    }
}
