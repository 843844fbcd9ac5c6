use async_trait::async_trait;
use redis::aio::ConnectionManager;
use std::time::Duration;

use super::{BackendKind, ForecastSnapshot, SnapshotBackend, StoreError, WeatherSnapshot};

const SCAN_BATCH: usize = 200;

/// Fast backend. Weather snapshots expire natively via `EXAT`.
#[derive(Clone)]
pub struct RedisBackend {
    manager: ConnectionManager,
}

impl RedisBackend {
    /// Connects and sends a `PING`, giving up after `timeout`.
    pub async fn probe(redis_url: &str, timeout: Duration) -> Result<Self, StoreError> {
        let client = redis::Client::open(redis_url)?;

        let connect = async {
            let manager = ConnectionManager::new(client).await?;
            let backend = Self { manager };
            backend.ping().await?;
            Ok::<_, StoreError>(backend)
        };

        tokio::time::timeout(timeout, connect)
            .await
            .map_err(|_| StoreError::Unavailable(format!("no reply from {} within {:?}", redis_url, timeout)))?
    }
}

/// `-0.0` and `0.0` name the same place.
fn coord(value: f64) -> f64 {
    if value == 0.0 {
        0.0
    } else {
        value
    }
}

fn location_prefix(user_id: &str, lat: f64, lon: f64) -> String {
    format!("{}:weather_data:{}:{}:", user_id, coord(lat), coord(lon))
}

pub fn weather_key(user_id: &str, lat: f64, lon: f64, timestamp: i64) -> String {
    format!("{}{}", location_prefix(user_id, lat, lon), timestamp)
}

pub fn forecast_key(user_id: &str, lat: f64, lon: f64) -> String {
    format!("{}:forecast_data:{}:{}", user_id, coord(lat), coord(lon))
}

fn history_pattern(user_id: &str, lat: f64, lon: f64) -> String {
    format!("{}*", escape_glob(&location_prefix(user_id, lat, lon)))
}

/// Escapes `SCAN MATCH` metacharacters so the prefix only matches itself.
fn escape_glob(raw: &str) -> String {
    let mut escaped = String::with_capacity(raw.len());
    for c in raw.chars() {
        if matches!(c, '*' | '?' | '[' | ']' | '\\') {
            escaped.push('\\');
        }
        escaped.push(c);
    }
    escaped
}

/// Timestamp of a key that sits directly under `prefix`. Keys of other users
/// whose ids happen to extend the prefix yield `None`.
fn timestamp_under(key: &str, prefix: &str) -> Option<i64> {
    key.strip_prefix(prefix)?.parse().ok()
}

#[async_trait]
impl SnapshotBackend for RedisBackend {
    fn kind(&self) -> BackendKind {
        BackendKind::Redis
    }

    async fn insert_weather(&self, snapshot: &WeatherSnapshot, expires_at: i64) -> Result<(), StoreError> {
        let key = weather_key(&snapshot.user_id, snapshot.lat, snapshot.lon, snapshot.timestamp);
        let data = serde_json::to_string(&snapshot.payload)?;
        let mut con = self.manager.clone();

        let created: Option<String> = redis::cmd("SET")
            .arg(&key)
            .arg(data)
            .arg("NX")
            .arg("EXAT")
            .arg(expires_at)
            .query_async(&mut con)
            .await?;

        match created {
            Some(_) => Ok(()),
            None => Err(StoreError::Conflict(key)),
        }
    }

    async fn weather_history(&self, user_id: &str, lat: f64, lon: f64) -> Result<Vec<WeatherSnapshot>, StoreError> {
        let pattern = history_pattern(user_id, lat, lon);
        let mut con = self.manager.clone();

        let mut keys: Vec<String> = Vec::new();
        let mut cursor: u64 = 0;
        loop {
            let (next, batch): (u64, Vec<String>) = redis::cmd("SCAN")
                .arg(cursor)
                .arg("MATCH")
                .arg(&pattern)
                .arg("COUNT")
                .arg(SCAN_BATCH)
                .query_async(&mut con)
                .await?;
            keys.extend(batch);
            if next == 0 {
                break;
            }
            cursor = next;
        }

        // SCAN may report a key more than once.
        keys.sort();
        keys.dedup();

        let prefix = location_prefix(user_id, lat, lon);
        let owned: Vec<(String, i64)> = keys
            .into_iter()
            .filter_map(|key| {
                let timestamp = timestamp_under(&key, &prefix);
                if timestamp.is_none() {
                    tracing::debug!("Skipping key outside {}: {}", prefix, key);
                }
                timestamp.map(|ts| (key, ts))
            })
            .collect();

        if owned.is_empty() {
            return Ok(Vec::new());
        }

        let names: Vec<&str> = owned.iter().map(|(key, _)| key.as_str()).collect();
        let values: Vec<Option<String>> = redis::cmd("MGET").arg(&names).query_async(&mut con).await?;

        let mut snapshots = Vec::with_capacity(owned.len());
        for ((_, timestamp), value) in owned.into_iter().zip(values) {
            // Expired between SCAN and MGET.
            let Some(data) = value else { continue };
            snapshots.push(WeatherSnapshot {
                user_id: user_id.to_string(),
                lat,
                lon,
                timestamp,
                payload: serde_json::from_str(&data)?,
            });
        }

        Ok(snapshots)
    }

    async fn upsert_forecast(&self, snapshot: &ForecastSnapshot) -> Result<(), StoreError> {
        let key = forecast_key(&snapshot.user_id, snapshot.lat, snapshot.lon);
        let data = serde_json::to_string(&snapshot.payload)?;
        let mut con = self.manager.clone();

        let _: () = redis::cmd("SET").arg(&key).arg(data).query_async(&mut con).await?;
        Ok(())
    }

    async fn forecast(&self, user_id: &str, lat: f64, lon: f64) -> Result<Option<ForecastSnapshot>, StoreError> {
        let key = forecast_key(user_id, lat, lon);
        let mut con = self.manager.clone();

        let data: Option<String> = redis::cmd("GET").arg(&key).query_async(&mut con).await?;

        match data {
            Some(data) => Ok(Some(ForecastSnapshot {
                user_id: user_id.to_string(),
                lat,
                lon,
                payload: serde_json::from_str(&data)?,
            })),
            None => Ok(None),
        }
    }

    async fn purge_expired(&self, _cutoff: i64) -> Result<u64, StoreError> {
        // Keys were written with EXAT; Redis has already dropped them.
        Ok(0)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        let mut con = self.manager.clone();
        let _: String = redis::cmd("PING").query_async(&mut con).await?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::store::WeatherStore;
    use serde_json::json;
    use std::sync::Arc;

    #[test]
    fn test_keys_are_prefixed_by_user() {
        assert_eq!(weather_key("u1", -26.14, 27.98, 1720710000), "u1:weather_data:-26.14:27.98:1720710000");
        assert_eq!(forecast_key("u1", -26.14, 27.98), "u1:forecast_data:-26.14:27.98");
    }

    #[test]
    fn test_negative_zero_is_the_same_location() {
        assert_eq!(weather_key("u1", -0.0, 0.0, 5), "u1:weather_data:0:0:5");
        assert_eq!(weather_key("u1", 0.0, -0.0, 5), weather_key("u1", -0.0, 0.0, 5));
        assert_eq!(forecast_key("u1", -0.0, -0.0), "u1:forecast_data:0:0");
        assert_eq!(history_pattern("u1", -0.0, 1.0), "u1:weather_data:0:1:*");
    }

    #[test]
    fn test_history_pattern_escapes_user_id() {
        assert_eq!(history_pattern("a*b", 1.5, 2.0), "a\\*b:weather_data:1.5:2:*");
        assert_eq!(history_pattern("plain", 1.5, 2.0), "plain:weather_data:1.5:2:*");
    }

    #[test]
    fn test_timestamp_only_for_keys_directly_under_prefix() {
        let prefix = location_prefix("u1", 1.0, 2.0);
        assert_eq!(timestamp_under("u1:weather_data:1:2:1720710000", &prefix), Some(1720710000));
        assert_eq!(timestamp_under("u1:weather_data:1:2:oops", &prefix), None);
        // Belongs to the user "u1:weather_data:1:2", whose keys the SCAN pattern also matches.
        assert_eq!(timestamp_under("u1:weather_data:1:2:weather_data:1:2:1720710000", &prefix), None);
        assert_eq!(timestamp_under("u2:weather_data:1:2:1720710000", &prefix), None);
    }

    #[tokio::test]
    async fn test_probe_fails_fast_without_server() {
        // Port 1 is never a Redis server.
        let result = RedisBackend::probe("redis://127.0.0.1:1/0", Duration::from_millis(500)).await;
        assert!(result.is_err());
    }

    // Tests below need a Redis server (>= 6.2).
    // Run with: REDIS_TEST_URL=redis://127.0.0.1:6379/15 cargo test -- --ignored

    const RETENTION_DAYS: i64 = 30;

    fn redis_url_for_tests() -> String {
        std::env::var("REDIS_TEST_URL").unwrap_or_else(|_| "redis://127.0.0.1:6379/15".to_string())
    }

    fn unique_user(tag: &str) -> String {
        let nanos = std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_nanos();
        format!("test-{}-{}-{}", tag, std::process::id(), nanos)
    }

    async fn redis_store(clock: Arc<ManualClock>) -> (WeatherStore, RedisBackend) {
        let backend = RedisBackend::probe(&redis_url_for_tests(), Duration::from_secs(2)).await.unwrap();
        let store = WeatherStore::new(
            Arc::new(backend.clone()),
            chrono::Duration::days(RETENTION_DAYS),
            clock,
        );
        (store, backend)
    }

    async fn remove_user_keys(backend: &RedisBackend, user_id: &str) {
        let mut con = backend.manager.clone();
        let keys: Vec<String> = redis::cmd("KEYS")
            .arg(format!("{}*", escape_glob(user_id)))
            .query_async(&mut con)
            .await
            .unwrap();
        if !keys.is_empty() {
            let _: i64 = redis::cmd("DEL").arg(&keys).query_async(&mut con).await.unwrap();
        }
    }

    fn now() -> i64 {
        chrono::Utc::now().timestamp()
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_history_accumulates_oldest_first() {
        let t = now();
        let (store, backend) = redis_store(Arc::new(ManualClock::at(t))).await;
        let user = unique_user("history");

        store.put_weather(&user, -26.14, 27.98, t, json!({"n": 2})).await.unwrap();
        store.put_weather(&user, -26.14, 27.98, t - 60, json!({"n": 1})).await.unwrap();

        let history = store.get_weather_history(&user, -26.14, 27.98).await.unwrap();
        let payloads: Vec<_> = history.iter().map(|s| s.payload.clone()).collect();
        assert_eq!(payloads, vec![json!({"n": 1}), json!({"n": 2})]);
        assert_eq!(history[0].timestamp, t - 60);

        remove_user_keys(&backend, &user).await;
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_put_weather_never_overwrites() {
        let t = now();
        let (store, backend) = redis_store(Arc::new(ManualClock::at(t))).await;
        let user = unique_user("nx");

        store.put_weather(&user, 1.0, 2.0, t, json!({"first": true})).await.unwrap();
        let result = store.put_weather(&user, 1.0, 2.0, t, json!({"first": false})).await;
        assert!(matches!(result, Err(StoreError::Conflict(_))));

        let history = store.get_weather_history(&user, 1.0, 2.0).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].payload, json!({"first": true}));

        remove_user_keys(&backend, &user).await;
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_snapshot_expires_natively() {
        let t = now();
        let (store, backend) = redis_store(Arc::new(ManualClock::at(t))).await;
        let user = unique_user("ttl");
        let retention = chrono::Duration::days(RETENTION_DAYS).num_seconds();

        store.put_weather(&user, 1.0, 2.0, t, json!({})).await.unwrap();

        let mut con = backend.manager.clone();
        let ttl: i64 = redis::cmd("TTL")
            .arg(weather_key(&user, 1.0, 2.0, t))
            .query_async(&mut con)
            .await
            .unwrap();
        assert!(ttl > retention - 30 && ttl <= retention, "ttl was {}", ttl);

        // Captured longer ago than the retention window: Redis drops it on write.
        store
            .put_weather(&user, 1.0, 2.0, t - retention - 10, json!({"stale": true}))
            .await
            .unwrap();
        let raw = backend.weather_history(&user, 1.0, 2.0).await.unwrap();
        assert_eq!(raw.len(), 1);
        assert_eq!(raw[0].timestamp, t);

        remove_user_keys(&backend, &user).await;
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_forecast_is_overwritten() {
        let (store, backend) = redis_store(Arc::new(ManualClock::at(now()))).await;
        let user = unique_user("forecast");

        assert_eq!(store.get_forecast(&user, 1.0, 2.0).await.unwrap(), None);

        store.put_forecast(&user, 1.0, 2.0, json!({"v": "old"})).await.unwrap();
        store.put_forecast(&user, 1.0, 2.0, json!({"v": "new"})).await.unwrap();

        let forecast = store.get_forecast(&user, 1.0, 2.0).await.unwrap().unwrap();
        assert_eq!(forecast.payload, json!({"v": "new"}));

        remove_user_keys(&backend, &user).await;
    }

    #[tokio::test]
    #[ignore]
    async fn test_redis_users_are_isolated() {
        let t = now();
        let (store, backend) = redis_store(Arc::new(ManualClock::at(t))).await;
        let alice = unique_user("alice");
        let lookalike = format!("{}:weather_data:1:2", alice);
        let bob = unique_user("bob");

        store.put_weather(&alice, 1.0, 2.0, t, json!({"owner": "alice"})).await.unwrap();
        store.put_forecast(&alice, 1.0, 2.0, json!({"owner": "alice"})).await.unwrap();
        store.put_weather(&lookalike, 1.0, 2.0, t, json!({"owner": "lookalike"})).await.unwrap();

        let history = store.get_weather_history(&alice, 1.0, 2.0).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].payload, json!({"owner": "alice"}));

        assert!(store.get_weather_history(&bob, 1.0, 2.0).await.unwrap().is_empty());
        assert_eq!(store.get_forecast(&bob, 1.0, 2.0).await.unwrap(), None);

        remove_user_keys(&backend, &alice).await;
        remove_user_keys(&backend, &bob).await;
    }
}
