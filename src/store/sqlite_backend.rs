use async_trait::async_trait;
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePool, SqlitePoolOptions};
use std::str::FromStr;
use std::time::Duration;

use super::{BackendKind, ForecastSnapshot, SnapshotBackend, StoreError, WeatherSnapshot};

/// Durable fallback. Rows carry no expiry of their own; the sweep removes them.
pub struct SqliteBackend {
    pool: SqlitePool,
}

impl SqliteBackend {
    pub async fn connect(database_url: &str, max_connections: u32) -> Result<Self, StoreError> {
        let options = SqliteConnectOptions::from_str(database_url)?
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .busy_timeout(Duration::from_secs(5));

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await?;

        let backend = Self { pool };
        backend.init_tables().await?;
        Ok(backend)
    }

    pub async fn init_tables(&self) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS weather_data (
                user_id TEXT NOT NULL,
                lat REAL NOT NULL,
                lon REAL NOT NULL,
                timestamp INTEGER NOT NULL,
                data TEXT NOT NULL,
                PRIMARY KEY (user_id, lat, lon, timestamp)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query(
            r#"
            CREATE TABLE IF NOT EXISTS forecast_data (
                user_id TEXT NOT NULL,
                lat REAL NOT NULL,
                lon REAL NOT NULL,
                data TEXT NOT NULL,
                PRIMARY KEY (user_id, lat, lon)
            )
            "#,
        )
        .execute(&self.pool)
        .await?;

        sqlx::query("CREATE INDEX IF NOT EXISTS idx_weather_data_timestamp ON weather_data(timestamp)")
            .execute(&self.pool)
            .await?;

        Ok(())
    }
}

#[async_trait]
impl SnapshotBackend for SqliteBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Sqlite
    }

    async fn insert_weather(&self, snapshot: &WeatherSnapshot, _expires_at: i64) -> Result<(), StoreError> {
        let data = serde_json::to_string(&snapshot.payload)?;

        let result = sqlx::query(
            r#"
            INSERT OR IGNORE INTO weather_data (user_id, lat, lon, timestamp, data)
            VALUES ($1, $2, $3, $4, $5)
            "#,
        )
        .bind(&snapshot.user_id)
        .bind(snapshot.lat)
        .bind(snapshot.lon)
        .bind(snapshot.timestamp)
        .bind(data)
        .execute(&self.pool)
        .await?;

        if result.rows_affected() == 0 {
            return Err(StoreError::Conflict(format!(
                "{}:{}:{}:{}",
                snapshot.user_id, snapshot.lat, snapshot.lon, snapshot.timestamp
            )));
        }

        Ok(())
    }

    async fn weather_history(&self, user_id: &str, lat: f64, lon: f64) -> Result<Vec<WeatherSnapshot>, StoreError> {
        let rows: Vec<(i64, String)> = sqlx::query_as(
            "SELECT timestamp, data FROM weather_data WHERE user_id = $1 AND lat = $2 AND lon = $3 ORDER BY timestamp",
        )
        .bind(user_id)
        .bind(lat)
        .bind(lon)
        .fetch_all(&self.pool)
        .await?;

        rows.into_iter()
            .map(|(timestamp, data)| {
                Ok::<_, StoreError>(WeatherSnapshot {
                    user_id: user_id.to_string(),
                    lat,
                    lon,
                    timestamp,
                    payload: serde_json::from_str(&data)?,
                })
            })
            .collect()
    }

    async fn upsert_forecast(&self, snapshot: &ForecastSnapshot) -> Result<(), StoreError> {
        let data = serde_json::to_string(&snapshot.payload)?;

        sqlx::query(
            r#"
            INSERT INTO forecast_data (user_id, lat, lon, data)
            VALUES ($1, $2, $3, $4)
            ON CONFLICT (user_id, lat, lon) DO UPDATE SET data = excluded.data
            "#,
        )
        .bind(&snapshot.user_id)
        .bind(snapshot.lat)
        .bind(snapshot.lon)
        .bind(data)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn forecast(&self, user_id: &str, lat: f64, lon: f64) -> Result<Option<ForecastSnapshot>, StoreError> {
        let data: Option<String> = sqlx::query_scalar(
            "SELECT data FROM forecast_data WHERE user_id = $1 AND lat = $2 AND lon = $3",
        )
        .bind(user_id)
        .bind(lat)
        .bind(lon)
        .fetch_optional(&self.pool)
        .await?;

        data.map(|data| {
            Ok::<_, StoreError>(ForecastSnapshot {
                user_id: user_id.to_string(),
                lat,
                lon,
                payload: serde_json::from_str(&data)?,
            })
        })
        .transpose()
    }

    async fn purge_expired(&self, cutoff: i64) -> Result<u64, StoreError> {
        let result = sqlx::query("DELETE FROM weather_data WHERE timestamp <= $1")
            .bind(cutoff)
            .execute(&self.pool)
            .await?;

        Ok(result.rows_affected())
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }
}
