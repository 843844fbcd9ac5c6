pub mod redis_backend;
pub mod sqlite_backend;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use thiserror::Error;

use crate::clock::Clock;
use crate::config::Config;
use redis_backend::RedisBackend;
use sqlite_backend::SqliteBackend;

const REDIS_PROBE_TIMEOUT: Duration = Duration::from_secs(2);

#[derive(Error, Debug)]
pub enum StoreError {
    #[error("Redis operation failed: {0}")]
    Redis(#[from] redis::RedisError),
    #[error("Database operation failed: {0}")]
    Database(#[from] sqlx::Error),
    #[error("Stored payload is not valid JSON: {0}")]
    Corrupt(#[from] serde_json::Error),
    #[error("Snapshot already exists: {0}")]
    Conflict(String),
    #[error("Backend unavailable: {0}")]
    Unavailable(String),
}

/// One fetched copy of the provider's current conditions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherSnapshot {
    pub user_id: String,
    pub lat: f64,
    pub lon: f64,
    pub timestamp: i64,
    pub payload: Value,
}

/// Latest forecast for a location. There is never more than one per key.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ForecastSnapshot {
    pub user_id: String,
    pub lat: f64,
    pub lon: f64,
    pub payload: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BackendKind {
    Redis,
    Sqlite,
}

impl BackendKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            BackendKind::Redis => "redis",
            BackendKind::Sqlite => "sqlite",
        }
    }
}

impl fmt::Display for BackendKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Raw storage operations. Expiry policy lives in [`WeatherStore`], not here.
#[async_trait]
pub trait SnapshotBackend: Send + Sync {
    fn kind(&self) -> BackendKind;

    /// Inserts a snapshot, failing with [`StoreError::Conflict`] if one with the
    /// same identity exists. `expires_at` is honoured by backends with native expiry.
    async fn insert_weather(&self, snapshot: &WeatherSnapshot, expires_at: i64) -> Result<(), StoreError>;

    async fn weather_history(&self, user_id: &str, lat: f64, lon: f64) -> Result<Vec<WeatherSnapshot>, StoreError>;

    async fn upsert_forecast(&self, snapshot: &ForecastSnapshot) -> Result<(), StoreError>;

    async fn forecast(&self, user_id: &str, lat: f64, lon: f64) -> Result<Option<ForecastSnapshot>, StoreError>;

    /// Deletes snapshots captured at or before `cutoff`. Returns the number removed.
    async fn purge_expired(&self, cutoff: i64) -> Result<u64, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

/// Probes Redis once. If it answers, it is the backend for the life of the
/// process; otherwise SQLite is.
pub async fn select_backend(config: &Config) -> Result<Arc<dyn SnapshotBackend>, StoreError> {
    match RedisBackend::probe(&config.redis_url, REDIS_PROBE_TIMEOUT).await {
        Ok(backend) => {
            tracing::info!("Using Redis snapshot store at {}", config.redis_url);
            return Ok(Arc::new(backend));
        }
        Err(e) => {
            tracing::warn!(
                "Redis unreachable ({}), using SQLite at {} for the process lifetime",
                e,
                config.database_url
            );
        }
    }

    let backend = SqliteBackend::connect(&config.database_url, 5).await?;
    Ok(Arc::new(backend))
}

/// Opens a fresh handle of the given kind, sharing nothing with existing ones.
pub async fn open_backend(kind: BackendKind, config: &Config) -> Result<Arc<dyn SnapshotBackend>, StoreError> {
    match kind {
        BackendKind::Redis => Ok(Arc::new(RedisBackend::probe(&config.redis_url, REDIS_PROBE_TIMEOUT).await?)),
        BackendKind::Sqlite => Ok(Arc::new(SqliteBackend::connect(&config.database_url, 1).await?)),
    }
}

/// Snapshot storage with a retention window applied uniformly to every backend.
#[derive(Clone)]
pub struct WeatherStore {
    backend: Arc<dyn SnapshotBackend>,
    retention: chrono::Duration,
    clock: Arc<dyn Clock>,
}

impl WeatherStore {
    pub fn new(backend: Arc<dyn SnapshotBackend>, retention: chrono::Duration, clock: Arc<dyn Clock>) -> Self {
        Self {
            backend,
            retention,
            clock,
        }
    }

    pub fn backend_kind(&self) -> BackendKind {
        self.backend.kind()
    }

    pub async fn put_weather(
        &self,
        user_id: &str,
        lat: f64,
        lon: f64,
        timestamp: i64,
        payload: Value,
    ) -> Result<WeatherSnapshot, StoreError> {
        let snapshot = WeatherSnapshot {
            user_id: user_id.to_string(),
            lat,
            lon,
            timestamp,
            payload,
        };
        let expires_at = timestamp + self.retention.num_seconds();

        self.backend.insert_weather(&snapshot, expires_at).await?;
        tracing::debug!(
            "Stored weather snapshot for {} at ({}, {}) ts={}",
            user_id,
            lat,
            lon,
            timestamp
        );

        Ok(snapshot)
    }

    /// Live snapshots for the location, oldest first.
    pub async fn get_weather_history(
        &self,
        user_id: &str,
        lat: f64,
        lon: f64,
    ) -> Result<Vec<WeatherSnapshot>, StoreError> {
        let cutoff = self.expiry_cutoff();

        let mut snapshots = self.backend.weather_history(user_id, lat, lon).await?;
        snapshots.retain(|s| s.timestamp > cutoff);
        snapshots.sort_by_key(|s| s.timestamp);

        Ok(snapshots)
    }

    pub async fn put_forecast(
        &self,
        user_id: &str,
        lat: f64,
        lon: f64,
        payload: Value,
    ) -> Result<ForecastSnapshot, StoreError> {
        let snapshot = ForecastSnapshot {
            user_id: user_id.to_string(),
            lat,
            lon,
            payload,
        };

        self.backend.upsert_forecast(&snapshot).await?;
        Ok(snapshot)
    }

    pub async fn get_forecast(
        &self,
        user_id: &str,
        lat: f64,
        lon: f64,
    ) -> Result<Option<ForecastSnapshot>, StoreError> {
        self.backend.forecast(user_id, lat, lon).await
    }

    pub async fn purge_expired(&self) -> Result<u64, StoreError> {
        self.backend.purge_expired(self.expiry_cutoff()).await
    }

    pub async fn health_check(&self) -> Result<(), StoreError> {
        self.backend.ping().await
    }

    /// Snapshots captured at or before this instant are expired.
    fn expiry_cutoff(&self) -> i64 {
        (self.clock.now() - self.retention).timestamp()
    }
}
