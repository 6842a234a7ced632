//! Configuration loader for the `codemetal-solarcast` service.
//!
//! This module centralizes all runtime configuration values and their defaults,
//! loading from environment variables (with optional `.env` file support
//! provided by the caller). Pipeline tunables live in [`PipelineConfig`] so the
//! forecast service never reads the environment itself (EMBP: `main.rs` loads,
//! everything else receives a value).
use std::{env, time::Duration};

use anyhow::{anyhow, bail, Result};
use chrono::NaiveTime;
use chrono_tz::Tz;

use crate::{
    accuracy::AccuracySettings, clamp::ClampSettings, models::HorizonKind, store::ActualRule,
};

/// Parse an optional integer environment variable with a default value.
macro_rules! parse_env_u32 {
    ($var_name:expr, $default:expr) => {
        env::var($var_name)
            .ok()
            .map(|v| v.parse::<u32>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse an optional floating point environment variable with a default value.
macro_rules! parse_env_f64 {
    ($var_name:expr, $default:expr) => {
        env::var($var_name)
            .ok()
            .map(|v| v.parse::<f64>())
            .transpose()
            .map_err(|e| anyhow!("Invalid {}: {}", $var_name, e))?
            .unwrap_or($default)
    };
}

/// Parse a required string environment variable.
macro_rules! require_env {
    ($var_name:expr) => {
        env::var($var_name)
            .map_err(|_| anyhow!("{} must be set in .env or environment", $var_name))?
    };
}

// ---

const DEFAULT_TZ: Tz = chrono_tz::Asia::Seoul;
const DEFAULT_RUN_TIMEOUT_SECS: u32 = 300;
const DEFAULT_ACTUAL_MIN_READINGS: u32 = 20;
const DEFAULT_RIDGE_LAMBDA: f64 = 0.1;

/// Strongly typed application configuration.
///
/// All fields are immutable after loading, ensuring a consistent configuration
/// snapshot for the lifetime of the application.
#[derive(Debug, Clone)]
pub struct Config {
    // ---
    /// PostgreSQL connection string.
    pub db_url: String,

    /// Maximum number of database connections in the pool.
    pub db_pool_max: u32,

    /// HTTP listen port.
    pub http_port: u16,

    /// Whether the in-process scheduler fires runs.
    pub scheduler_enabled: bool,

    pub pipeline: PipelineConfig,
}

/// Settings of one forecast horizon.
#[derive(Debug, Clone, PartialEq)]
pub struct HorizonSettings {
    // ---
    /// Local time of day at which the scheduler fires.
    pub schedule: NaiveTime,

    /// Number of daily values produced per run.
    pub horizon_days: u32,

    /// Training window length in days; 0 means the full history.
    pub training_days: u32,

    /// Fewer observed training days than this fails with `InsufficientData`.
    pub min_training_days: u32,

    pub clamp: ClampSettings,
}

impl HorizonSettings {
    // ---
    pub fn defaults(horizon: HorizonKind) -> Self {
        // ---
        let (horizon_days, min_training_days) = match horizon {
            HorizonKind::NextDay => (1, 7),
            HorizonKind::SevenDay => (7, 14),
        };
        HorizonSettings {
            schedule: NaiveTime::from_hms_opt(7, 30, 0).unwrap_or(NaiveTime::MIN),
            horizon_days,
            training_days: 0,
            min_training_days,
            clamp: ClampSettings::default(),
        }
    }
}

/// Everything a forecast run needs to know besides its collaborators.
#[derive(Debug, Clone, PartialEq)]
pub struct PipelineConfig {
    // ---
    /// Timezone in which "today", period bounds and schedules are evaluated.
    pub timezone: Tz,

    /// Upper bound on one run, lock included.
    pub run_timeout: Duration,

    pub accuracy: AccuracySettings,

    /// Local hours (inclusive) summed by the seven-day actual rule.
    pub daylight_first_hour: u32,
    pub daylight_last_hour: u32,

    /// Readings a local day needs (besides one in its last hour) before its
    /// actual is taken as final.
    pub actual_min_readings: u32,

    /// Ridge penalty of the next-day weather regression.
    pub ridge_lambda: f64,

    pub next_day: HorizonSettings,
    pub seven_day: HorizonSettings,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        PipelineConfig {
            timezone: DEFAULT_TZ,
            run_timeout: Duration::from_secs(u64::from(DEFAULT_RUN_TIMEOUT_SECS)),
            accuracy: AccuracySettings::default(),
            daylight_first_hour: 7,
            daylight_last_hour: 20,
            actual_min_readings: DEFAULT_ACTUAL_MIN_READINGS,
            ridge_lambda: DEFAULT_RIDGE_LAMBDA,
            next_day: HorizonSettings::defaults(HorizonKind::NextDay),
            seven_day: HorizonSettings::defaults(HorizonKind::SevenDay),
        }
    }
}

impl PipelineConfig {
    // ---
    pub fn horizon(&self, horizon: HorizonKind) -> &HorizonSettings {
        match horizon {
            HorizonKind::NextDay => &self.next_day,
            HorizonKind::SevenDay => &self.seven_day,
        }
    }

    /// How realized output is measured for `horizon`.
    ///
    /// Next-day uses the cumulative counter delta; seven-day sums hourly
    /// power over the daylight window.
    pub fn actual_rule(&self, horizon: HorizonKind) -> ActualRule {
        // ---
        match horizon {
            HorizonKind::NextDay => ActualRule::CounterDelta,
            HorizonKind::SevenDay => ActualRule::DaylightSum {
                first_hour: self.daylight_first_hour,
                last_hour: self.daylight_last_hour,
                tz: self.timezone,
            },
        }
    }
}

fn env_prefix(horizon: HorizonKind) -> &'static str {
    match horizon {
        HorizonKind::NextDay => "NEXT_DAY",
        HorizonKind::SevenDay => "SEVEN_DAY",
    }
}

fn parse_bool(var_name: &str, default: bool) -> Result<bool> {
    // ---
    match env::var(var_name).ok().as_deref() {
        None => Ok(default),
        Some("1") | Some("true") | Some("yes") => Ok(true),
        Some("0") | Some("false") | Some("no") => Ok(false),
        Some(other) => Err(anyhow!("Invalid {}: '{}' is not a boolean", var_name, other)),
    }
}

fn parse_time(var_name: &str, default: NaiveTime) -> Result<NaiveTime> {
    // ---
    env::var(var_name)
        .ok()
        .map(|v| NaiveTime::parse_from_str(&v, "%H:%M"))
        .transpose()
        .map_err(|e| anyhow!("Invalid {}: {} (expected HH:MM)", var_name, e))
        .map(|t| t.unwrap_or(default))
}

fn parse_tz(var_name: &str, default: Tz) -> Result<Tz> {
    // ---
    env::var(var_name)
        .ok()
        .map(|v| v.parse::<Tz>())
        .transpose()
        .map_err(|e| anyhow!("Invalid {}: {}", var_name, e))
        .map(|tz| tz.unwrap_or(default))
}

fn load_clamp(prefix: &str, default: ClampSettings) -> Result<ClampSettings> {
    // ---
    let multiplier = parse_env_f64!(&format!("{prefix}CLAMP_MULTIPLIER"), default.multiplier);
    let hard_cap = parse_env_f64!(&format!("{prefix}CLAMP_HARD_CAP_MWH"), default.hard_cap);

    if !(multiplier.is_finite() && multiplier > 0.0) {
        bail!("{}CLAMP_MULTIPLIER must be a positive number", prefix);
    }
    if !(hard_cap.is_finite() && hard_cap >= 0.0) {
        bail!("{}CLAMP_HARD_CAP_MWH must be a non-negative number", prefix);
    }
    Ok(ClampSettings {
        multiplier,
        hard_cap,
    })
}

fn load_horizon(horizon: HorizonKind, clamp: ClampSettings) -> Result<HorizonSettings> {
    // ---
    let prefix = env_prefix(horizon);
    let defaults = HorizonSettings::defaults(horizon);

    let settings = HorizonSettings {
        schedule: parse_time(&format!("{prefix}_SCHEDULE"), defaults.schedule)?,
        horizon_days: parse_env_u32!(&format!("{prefix}_HORIZON_DAYS"), defaults.horizon_days),
        training_days: parse_env_u32!(&format!("{prefix}_TRAINING_DAYS"), defaults.training_days),
        min_training_days: parse_env_u32!(
            &format!("{prefix}_MIN_TRAINING_DAYS"),
            defaults.min_training_days
        ),
        clamp: load_clamp(&format!("{prefix}_"), clamp)?,
    };

    if settings.horizon_days == 0 {
        bail!("{}_HORIZON_DAYS must be at least 1", prefix);
    }
    if settings.min_training_days == 0 {
        bail!("{}_MIN_TRAINING_DAYS must be at least 1", prefix);
    }
    if settings.training_days != 0 && settings.training_days < settings.min_training_days {
        bail!(
            "{}_TRAINING_DAYS ({}) is shorter than {}_MIN_TRAINING_DAYS ({})",
            prefix,
            settings.training_days,
            prefix,
            settings.min_training_days
        );
    }
    Ok(settings)
}

/// Load the pipeline part of the configuration. Nothing here is required.
pub fn load_pipeline_from_env() -> Result<PipelineConfig> {
    // ---
    let timezone = parse_tz("FACILITY_TZ", DEFAULT_TZ)?;
    let run_timeout_secs = parse_env_u32!("RUN_TIMEOUT_SECS", DEFAULT_RUN_TIMEOUT_SECS);
    let accuracy = AccuracySettings {
        epsilon: parse_env_f64!("MAPE_EPSILON", AccuracySettings::default().epsilon),
        min_actual: parse_env_f64!("MAPE_MIN_ACTUAL", AccuracySettings::default().min_actual),
    };
    let daylight_first_hour = parse_env_u32!("DAYLIGHT_FIRST_HOUR", 7);
    let daylight_last_hour = parse_env_u32!("DAYLIGHT_LAST_HOUR", 20);
    let actual_min_readings = parse_env_u32!("ACTUAL_MIN_READINGS", DEFAULT_ACTUAL_MIN_READINGS);
    let ridge_lambda = parse_env_f64!("NEXT_DAY_RIDGE_LAMBDA", DEFAULT_RIDGE_LAMBDA);

    if run_timeout_secs == 0 {
        bail!("RUN_TIMEOUT_SECS must be at least 1");
    }
    if !(accuracy.epsilon.is_finite() && accuracy.epsilon > 0.0) {
        bail!("MAPE_EPSILON must be a positive number");
    }
    if daylight_first_hour > daylight_last_hour || daylight_last_hour > 23 {
        bail!(
            "Invalid daylight window {}..={} (hours must satisfy first <= last <= 23)",
            daylight_first_hour,
            daylight_last_hour
        );
    }

    if !(ridge_lambda.is_finite() && ridge_lambda >= 0.0) {
        bail!("NEXT_DAY_RIDGE_LAMBDA must be a non-negative number");
    }

    let clamp = load_clamp("", ClampSettings::default())?;

    Ok(PipelineConfig {
        timezone,
        run_timeout: Duration::from_secs(u64::from(run_timeout_secs)),
        accuracy,
        daylight_first_hour,
        daylight_last_hour,
        actual_min_readings,
        ridge_lambda,
        next_day: load_horizon(HorizonKind::NextDay, clamp)?,
        seven_day: load_horizon(HorizonKind::SevenDay, clamp)?,
    })
}

/// Load configuration from environment variables with defaults.
///
/// Required:
/// - `DATABASE_URL` – PostgreSQL connection string
///
/// Optional:
/// - `DB_POOL_MAX` – max DB connections (default: 5)
/// - `HTTP_PORT` – listen port (default: 8080)
/// - `SCHEDULER_ENABLED` – fire scheduled runs (default: true)
/// - `FACILITY_TZ`, `RUN_TIMEOUT_SECS`, `MAPE_*`, `CLAMP_*`, `DAYLIGHT_*`,
///   `ACTUAL_MIN_READINGS` and the `NEXT_DAY_*` / `SEVEN_DAY_*` horizon
///   settings (`NEXT_DAY_RIDGE_LAMBDA` included)
///
/// Returns an error if any required variable is missing or invalid.
pub fn load_from_env() -> Result<Config> {
    // ---
    let db_url = require_env!("DATABASE_URL");
    let db_pool_max = parse_env_u32!("DB_POOL_MAX", 5);
    let http_port = parse_env_u32!("HTTP_PORT", 8080);
    let http_port =
        u16::try_from(http_port).map_err(|_| anyhow!("Invalid HTTP_PORT: {}", http_port))?;
    let scheduler_enabled = parse_bool("SCHEDULER_ENABLED", true)?;

    Ok(Config {
        db_url,
        db_pool_max,
        http_port,
        scheduler_enabled,
        pipeline: load_pipeline_from_env()?,
    })
}

impl Config {
    /// Log the loaded configuration for debugging purposes.
    ///
    /// Masks sensitive information like database passwords while showing
    /// all configuration values that were loaded.
    pub fn log_config(&self) {
        // ---
        let p = &self.pipeline;

        tracing::info!("Configuration loaded:");
        tracing::info!("  DATABASE_URL      : {}", mask_db_url(&self.db_url));
        tracing::info!("  DB_POOL_MAX       : {}", self.db_pool_max);
        tracing::info!("  HTTP_PORT         : {}", self.http_port);
        tracing::info!("  SCHEDULER_ENABLED : {}", self.scheduler_enabled);
        tracing::info!("  FACILITY_TZ       : {}", p.timezone);
        tracing::info!("  RUN_TIMEOUT_SECS  : {}", p.run_timeout.as_secs());
        tracing::info!(
            "  DAYLIGHT_HOURS    : {}..={}",
            p.daylight_first_hour,
            p.daylight_last_hour
        );
        tracing::info!("  ACTUAL_MIN_READINGS : {}", p.actual_min_readings);
        tracing::info!("  RIDGE_LAMBDA      : {}", p.ridge_lambda);
        for horizon in HorizonKind::ALL {
            let h = p.horizon(horizon);
            tracing::info!(
                "  {:<17} : at {} | {} day(s) | train {} (min {}) | clamp x{} cap {}",
                env_prefix(horizon),
                h.schedule.format("%H:%M"),
                h.horizon_days,
                if h.training_days == 0 {
                    "all".to_string()
                } else {
                    h.training_days.to_string()
                },
                h.min_training_days,
                h.clamp.multiplier,
                h.clamp.hard_cap
            );
        }
    }
}

/// Replace the password of a connection URL with `****`.
fn mask_db_url(db_url: &str) -> String {
    // ---
    if let Some(at_pos) = db_url.rfind('@') {
        if let Some(colon_pos) = db_url[..at_pos].rfind(':') {
            // No password: the only colon is the scheme separator
            if db_url[colon_pos..].starts_with("://") {
                return db_url.to_string();
            }
            return format!("{}:****{}", &db_url[..colon_pos], &db_url[at_pos..]);
        }
    }
    db_url.to_string()
}
