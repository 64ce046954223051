use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;

use thiserror::Error;

use crate::model::{DAY_MS, HOUR_MS, MINUTE_MS, Ms};

#[derive(Debug, Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("{0} must be greater than zero")]
    Zero(&'static str),
    #[error("{0} must not be negative")]
    Negative(&'static str),
    #[error("invalid value for {var}: {value:?}")]
    Unparsable { var: &'static str, value: String },
}

/// Business constants for one facility. Passed to `Engine::new`; nothing here is global.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EngineConfig {
    pub max_duration_hours: u32,
    pub max_daily_bookings: u32,
    pub max_concurrent_per_slot: u32,
    /// Modifications and cancellations are refused once `start - now <= lockout_ms`.
    pub lockout_ms: Ms,
    pub check_in_before_ms: Ms,
    pub check_in_after_ms: Ms,
    /// A reservation nobody checked in to is scored as a no-show once
    /// `start + no_show_grace_ms < now`.
    pub no_show_grace_ms: Ms,
    /// Sessions longer than this are overstays; open ones older than this get auto-closed.
    pub max_session_ms: Ms,
    /// Trailing window over which demerit points count toward suspension.
    pub penalty_window_ms: Ms,
    /// Run auto-suspension for every owner penalized by a sweep.
    pub auto_suspend_after_sweep: bool,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_duration_hours: 3,
            max_daily_bookings: 3,
            max_concurrent_per_slot: 4,
            lockout_ms: HOUR_MS,
            check_in_before_ms: 10 * MINUTE_MS,
            check_in_after_ms: 10 * MINUTE_MS,
            no_show_grace_ms: 0,
            max_session_ms: 5 * HOUR_MS,
            penalty_window_ms: 30 * DAY_MS,
            auto_suspend_after_sweep: false,
        }
    }
}

impl EngineConfig {
    /// Defaults overridden by `GYMKEEP_*` environment variables.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Some(v) = env_parse::<u32>("GYMKEEP_MAX_DURATION_HOURS")? {
            config.max_duration_hours = v;
        }
        if let Some(v) = env_parse::<u32>("GYMKEEP_MAX_DAILY_BOOKINGS")? {
            config.max_daily_bookings = v;
        }
        if let Some(v) = env_parse::<u32>("GYMKEEP_MAX_CONCURRENT_PER_SLOT")? {
            config.max_concurrent_per_slot = v;
        }
        if let Some(v) = env_duration("GYMKEEP_LOCKOUT_MINUTES", MINUTE_MS)? {
            config.lockout_ms = v;
        }
        if let Some(v) = env_duration("GYMKEEP_CHECK_IN_WINDOW_MINUTES", MINUTE_MS)? {
            config.check_in_before_ms = v;
            config.check_in_after_ms = v;
        }
        if let Some(v) = env_duration("GYMKEEP_NO_SHOW_GRACE_MINUTES", MINUTE_MS)? {
            config.no_show_grace_ms = v;
        }
        if let Some(v) = env_duration("GYMKEEP_MAX_SESSION_HOURS", HOUR_MS)? {
            config.max_session_ms = v;
        }
        if let Some(v) = env_duration("GYMKEEP_PENALTY_WINDOW_DAYS", DAY_MS)? {
            config.penalty_window_ms = v;
        }
        if let Some(v) = env_parse::<bool>("GYMKEEP_AUTO_SUSPEND")? {
            config.auto_suspend_after_sweep = v;
        }
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.max_duration_hours == 0 {
            return Err(ConfigError::Zero("max_duration_hours"));
        }
        if self.max_daily_bookings == 0 {
            return Err(ConfigError::Zero("max_daily_bookings"));
        }
        if self.max_concurrent_per_slot == 0 {
            return Err(ConfigError::Zero("max_concurrent_per_slot"));
        }
        if self.lockout_ms < 0 {
            return Err(ConfigError::Negative("lockout_ms"));
        }
        if self.no_show_grace_ms < 0 {
            return Err(ConfigError::Negative("no_show_grace_ms"));
        }
        if self.check_in_before_ms < 0 || self.check_in_after_ms < 0 {
            return Err(ConfigError::Negative("check-in window"));
        }
        if self.max_session_ms <= 0 {
            return Err(ConfigError::Zero("max_session_ms"));
        }
        if self.penalty_window_ms <= 0 {
            return Err(ConfigError::Zero("penalty_window_ms"));
        }
        if self.check_in_before_ms + self.check_in_after_ms <= 0 {
            return Err(ConfigError::Zero("check-in window"));
        }
        Ok(())
    }
}

/// Process-level settings for the `gymkeep` daemon.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    pub data_dir: PathBuf,
    pub metrics_port: Option<u16>,
    pub sweep_interval: Duration,
    pub compact_threshold: u64,
}

impl Default for DaemonConfig {
    fn default() -> Self {
        Self {
            data_dir: PathBuf::from("./data"),
            metrics_port: None,
            sweep_interval: Duration::from_secs(60),
            compact_threshold: 1000,
        }
    }
}

impl DaemonConfig {
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        if let Ok(dir) = std::env::var("GYMKEEP_DATA_DIR") {
            config.data_dir = PathBuf::from(dir);
        }
        config.metrics_port = env_parse::<u16>("GYMKEEP_METRICS_PORT")?;
        if let Some(secs) = env_parse::<u64>("GYMKEEP_SWEEP_INTERVAL_SECS")? {
            if secs == 0 {
                return Err(ConfigError::Zero("GYMKEEP_SWEEP_INTERVAL_SECS"));
            }
            config.sweep_interval = Duration::from_secs(secs);
        }
        if let Some(v) = env_parse::<u64>("GYMKEEP_COMPACT_THRESHOLD")? {
            config.compact_threshold = v;
        }
        Ok(config)
    }

    pub fn wal_path(&self) -> PathBuf {
        self.data_dir.join("gymkeep.wal")
    }
}

/// A whole number of `unit`s, in milliseconds. Anything that overflows `Ms` is unparsable.
fn env_duration(var: &'static str, unit: Ms) -> Result<Option<Ms>, ConfigError> {
    let Some(v) = env_parse::<Ms>(var)? else {
        return Ok(None);
    };
    v.checked_mul(unit)
        .map(Some)
        .ok_or_else(|| ConfigError::Unparsable {
            var,
            value: v.to_string(),
        })
}

/// Unset is `None`; set-but-garbage is an error rather than a silent default.
fn env_parse<T: FromStr>(var: &'static str) -> Result<Option<T>, ConfigError> {
    match std::env::var(var) {
        Ok(value) => value
            .trim()
            .parse()
            .map(Some)
            .map_err(|_| ConfigError::Unparsable { var, value }),
        Err(_) => Ok(None),
    }
}
