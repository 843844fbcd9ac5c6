use serde::{Deserialize, Serialize};
use std::env;
use std::time::Duration;

pub const DEFAULT_JWKS_URL: &str =
    "https://www.googleapis.com/service_accounts/v1/jwk/securetoken@system.gserviceaccount.com";

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Config {
    pub openweather_api_key: String,
    pub openweather_base_url: String,
    pub openweather_current_path: String,
    pub openweather_forecast_path: String,
    pub openweather_units: String,
    pub openweather_timeout_secs: u64,
    pub normalize_timestamps: bool,
    pub redis_url: String,
    pub database_url: String,
    pub snapshot_retention_days: i64,
    pub sweep_interval_secs: u64,
    pub firebase_project_id: String,
    pub firebase_jwks_url: String,
    pub firebase_jwks_ttl_secs: u64,
    pub bypass_auth: bool,
    pub app_env: String,
    pub bind_addr: String,
}

impl Config {
    pub fn from_env() -> anyhow::Result<Self> {
        let bypass_auth = parse_flag("BYPASS_AUTH", false)?;
        let app_env = env::var("APP_ENV").unwrap_or_else(|_| "development".to_string());

        if bypass_auth && app_env.eq_ignore_ascii_case("production") {
            anyhow::bail!("BYPASS_AUTH cannot be enabled when APP_ENV=production");
        }

        let firebase_project_id = match env::var("FIREBASE_PROJECT_ID") {
            Ok(id) => id,
            Err(_) if bypass_auth => String::new(),
            Err(_) => anyhow::bail!("FIREBASE_PROJECT_ID not set"),
        };

        Ok(Config {
            openweather_api_key: env::var("OPENWEATHER_API_KEY")
                .map_err(|_| anyhow::anyhow!("OPENWEATHER_API_KEY not set"))?,
            openweather_base_url: env::var("OPENWEATHER_BASE_URL")
                .unwrap_or_else(|_| "https://api.openweathermap.org".to_string()),
            openweather_current_path: env::var("OPENWEATHER_CURRENT_PATH")
                .unwrap_or_else(|_| "/data/2.5/weather".to_string()),
            openweather_forecast_path: env::var("OPENWEATHER_FORECAST_PATH")
                .unwrap_or_else(|_| "/data/2.5/forecast".to_string()),
            openweather_units: env::var("OPENWEATHER_UNITS")
                .unwrap_or_else(|_| "metric".to_string()),
            openweather_timeout_secs: parse_number("OPENWEATHER_TIMEOUT_SECS", 30)?,
            normalize_timestamps: parse_flag("NORMALIZE_TIMESTAMPS", true)?,
            redis_url: env::var("REDIS_URL")
                .unwrap_or_else(|_| "redis://127.0.0.1:6379/0".to_string()),
            database_url: env::var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./horizon_weather.db".to_string()),
            snapshot_retention_days: retention_days(parse_number("SNAPSHOT_RETENTION_DAYS", 30)?)?,
            sweep_interval_secs: parse_number("SWEEP_INTERVAL_SECS", 3600)?,
            firebase_project_id,
            firebase_jwks_url: env::var("FIREBASE_JWKS_URL")
                .unwrap_or_else(|_| DEFAULT_JWKS_URL.to_string()),
            firebase_jwks_ttl_secs: parse_number("FIREBASE_JWKS_TTL_SECS", 3600)?,
            bypass_auth,
            app_env,
            bind_addr: env::var("BIND_ADDR").unwrap_or_else(|_| "0.0.0.0:8080".to_string()),
        })
    }

    pub fn openweather_timeout(&self) -> Duration {
        Duration::from_secs(self.openweather_timeout_secs)
    }

    pub fn retention(&self) -> chrono::Duration {
        chrono::Duration::days(self.snapshot_retention_days)
    }

    /// `None` when the sweep is disabled.
    pub fn sweep_interval(&self) -> Option<Duration> {
        (self.sweep_interval_secs > 0).then(|| Duration::from_secs(self.sweep_interval_secs))
    }
}

const MAX_RETENTION_DAYS: i64 = 36_500;

fn retention_days(days: i64) -> anyhow::Result<i64> {
    if !(1..=MAX_RETENTION_DAYS).contains(&days) {
        anyhow::bail!(
            "SNAPSHOT_RETENTION_DAYS must be between 1 and {}, got {}",
            MAX_RETENTION_DAYS,
            days
        );
    }
    Ok(days)
}

fn parse_flag(name: &str, default: bool) -> anyhow::Result<bool> {
    match env::var(name) {
        Ok(value) => match value.trim().to_ascii_lowercase().as_str() {
            "1" | "true" | "yes" | "on" => Ok(true),
            "0" | "false" | "no" | "off" | "" => Ok(false),
            other => anyhow::bail!("{} must be a boolean, got {:?}", name, other),
        },
        Err(_) => Ok(default),
    }
}

fn parse_number<T>(name: &str, default: T) -> anyhow::Result<T>
where
    T: std::str::FromStr,
    T::Err: std::fmt::Display,
{
    match env::var(name) {
        Ok(value) => value
            .trim()
            .parse()
            .map_err(|e| anyhow::anyhow!("{} is invalid: {}", name, e)),
        Err(_) => Ok(default),
    }
}

#[cfg(test)]
impl Config {
    /// Configuration pointing every external collaborator at local fakes.
    pub fn for_tests(openweather_base_url: &str, database_url: &str) -> Self {
        Config {
            openweather_api_key: "test-key".to_string(),
            openweather_base_url: openweather_base_url.to_string(),
            openweather_current_path: "/data/2.5/weather".to_string(),
            openweather_forecast_path: "/data/2.5/forecast".to_string(),
            openweather_units: "metric".to_string(),
            openweather_timeout_secs: 5,
            normalize_timestamps: true,
            redis_url: "redis://127.0.0.1:1/0".to_string(),
            database_url: database_url.to_string(),
            snapshot_retention_days: 30,
            sweep_interval_secs: 0,
            firebase_project_id: "horizon-test".to_string(),
            firebase_jwks_url: DEFAULT_JWKS_URL.to_string(),
            firebase_jwks_ttl_secs: 3600,
            bypass_auth: false,
            app_env: "test".to_string(),
            bind_addr: "127.0.0.1:0".to_string(),
        }
    }
}
