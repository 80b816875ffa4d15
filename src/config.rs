//! Runtime configuration from environment variables.
//! Defaults match the stock Hilo integration (60 s polling, "rate d" plan).

use std::time::Duration;

use crate::client::{DEFAULT_MAX_RETRIES, DEFAULT_TIMEOUT};
use crate::tariff::{parse_high_periods, TariffConfig, TariffPlan, DEFAULT_HIGH_PERIODS, DEFAULT_PLAN_NAME};

pub const DEFAULT_HASS_URL: &str = "http://localhost:8123";
pub const DEFAULT_SCAN_INTERVAL_SECS: u64 = 60;

#[derive(Debug, Clone)]
pub struct Config {
    pub hilo_username: String,
    pub hilo_password: String,
    /// Base URL of the Home Assistant instance.
    pub hass_url: String,
    /// Long-lived Home Assistant access token.
    pub hass_token: String,
    /// Minimum spacing between two full poll cycles.
    pub scan_interval: Duration,
    pub tariff: TariffConfig,
    /// Retries after the first attempt of every API call.
    pub max_request_retries: u32,
    /// Timeout of a single HTTP attempt.
    pub request_timeout: Duration,
    /// Publish `binary_sensor.hilo_challenge` from the active-events endpoint.
    pub track_events: bool,
}

impl Config {
    pub fn from_env() -> Result<Self, String> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(get: impl Fn(&str) -> Option<String>) -> Result<Self, String> {
        let required = |key: &str| match get(key) {
            Some(v) if !v.trim().is_empty() => Ok(v),
            _ => Err(format!("Missing required setting {}", key)),
        };
        let secs = |key: &str, default: u64| -> Result<u64, String> {
            match get(key) {
                Some(v) if !v.trim().is_empty() => v
                    .trim()
                    .parse::<u64>()
                    .map_err(|_| format!("{} must be a whole number of seconds", key)),
                _ => Ok(default),
            }
        };

        let hilo_username = required("HILO_USERNAME")?;
        let hilo_password = required("HILO_PASSWORD")?;
        let hass_token = required("HASS_TOKEN")?;
        let hass_url = get("HASS_URL")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_HASS_URL.to_string());

        let plan_name = get("HILO_PLAN")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| DEFAULT_PLAN_NAME.to_string());
        let plan = TariffPlan::builtin(&plan_name)
            .ok_or_else(|| format!("Unknown HILO_PLAN `{}` (expected `rate d` or `flex d`)", plan_name))?;
        let high_periods = parse_high_periods(
            get("HIGH_PERIODS")
                .as_deref()
                .unwrap_or(DEFAULT_HIGH_PERIODS),
        )?;

        let max_request_retries = match get("MAX_REQUEST_RETRIES") {
            Some(v) if !v.trim().is_empty() => v
                .trim()
                .parse::<u32>()
                .map_err(|_| "MAX_REQUEST_RETRIES must be a non-negative integer".to_string())?,
            _ => DEFAULT_MAX_RETRIES,
        };

        let track_events = get("TRACK_EVENTS")
            .map(|s| matches!(s.trim(), "1" | "true" | "TRUE"))
            .unwrap_or(false);

        let scan_secs = secs("SCAN_INTERVAL_SECS", DEFAULT_SCAN_INTERVAL_SECS)?;
        if scan_secs == 0 {
            return Err("SCAN_INTERVAL_SECS must be greater than zero".to_string());
        }

        Ok(Config {
            hilo_username,
            hilo_password,
            hass_url,
            hass_token,
            scan_interval: Duration::from_secs(scan_secs),
            tariff: TariffConfig {
                plan_name,
                plan,
                high_periods,
            },
            max_request_retries,
            request_timeout: Duration::from_secs(secs("REQUEST_TIMEOUT_SECS", DEFAULT_TIMEOUT.as_secs())?),
            track_events,
        })
    }
}
