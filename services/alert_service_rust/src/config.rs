//! Configuration for the alert service.

use anyhow::{anyhow, Result};
use std::env;
use std::time::Duration;

#[derive(Debug, Clone)]
pub struct Config {
    // Database
    pub database_url: String,

    // Detection
    pub alert_threshold_pct: f64,
    pub detection_interval: Duration,
    pub cycle_deadline: Duration,
    pub pair_fetch_timeout: Duration,

    // Notifications
    pub alert_cooldown_hours: i64,
    pub notification_ttl_hours: i64,

    // Retention
    pub cleanup_interval: Duration,
    pub read_retention_days: i64,

    // Realtime hub
    pub broadcast_send_timeout: Duration,
    pub hub_channel_capacity: usize,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        let database_url =
            env::var("DATABASE_URL").map_err(|_| anyhow!("DATABASE_URL must be set"))?;

        let alert_threshold_pct = parse_f64("ALERT_THRESHOLD_PCT", 5.0)?;
        let alert_cooldown_hours = parse_i64("ALERT_COOLDOWN_HOURS", 24)?;
        let notification_ttl_hours = parse_i64("NOTIFICATION_TTL_HOURS", 72)?;
        let read_retention_days = parse_i64("READ_RETENTION_DAYS", 30)?;

        if alert_threshold_pct <= 0.0 {
            return Err(anyhow!("ALERT_THRESHOLD_PCT must be > 0"));
        }
        if alert_cooldown_hours < 0 {
            return Err(anyhow!("ALERT_COOLDOWN_HOURS must be >= 0"));
        }
        if notification_ttl_hours <= 0 {
            return Err(anyhow!("NOTIFICATION_TTL_HOURS must be > 0"));
        }
        if read_retention_days <= 0 {
            return Err(anyhow!("READ_RETENTION_DAYS must be > 0"));
        }

        let hub_channel_capacity = parse_u64("HUB_CHANNEL_CAPACITY", 64)? as usize;
        if hub_channel_capacity == 0 {
            return Err(anyhow!("HUB_CHANNEL_CAPACITY must be > 0"));
        }

        Ok(Self {
            database_url,

            alert_threshold_pct,
            detection_interval: Duration::from_secs(parse_u64("DETECTION_INTERVAL_SECS", 300)?),
            cycle_deadline: Duration::from_secs(parse_u64("CYCLE_DEADLINE_SECS", 60)?),
            pair_fetch_timeout: Duration::from_secs(parse_u64("PAIR_FETCH_TIMEOUT_SECS", 5)?),

            alert_cooldown_hours,
            notification_ttl_hours,

            cleanup_interval: Duration::from_secs(parse_u64("CLEANUP_INTERVAL_SECS", 3600)?),
            read_retention_days,

            broadcast_send_timeout: Duration::from_millis(parse_u64(
                "BROADCAST_SEND_TIMEOUT_MS",
                250,
            )?),
            hub_channel_capacity,
        })
    }
}

/// Parse environment variable as f64 with default fallback
fn parse_f64(var_name: &str, default: f64) -> Result<f64> {
    match env::var(var_name) {
        Ok(val) => val
            .parse()
            .map_err(|_| anyhow!("{} must be a valid f64", var_name)),
        Err(_) => Ok(default),
    }
}

/// Parse environment variable as i64 with default fallback
fn parse_i64(var_name: &str, default: i64) -> Result<i64> {
    match env::var(var_name) {
        Ok(val) => val
            .parse()
            .map_err(|_| anyhow!("{} must be a valid i64", var_name)),
        Err(_) => Ok(default),
    }
}

/// Parse environment variable as u64 with default fallback
fn parse_u64(var_name: &str, default: u64) -> Result<u64> {
    match env::var(var_name) {
        Ok(val) => val
            .parse()
            .map_err(|_| anyhow!("{} must be a valid u64", var_name)),
        Err(_) => Ok(default),
    }
}
