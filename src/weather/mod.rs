pub mod normalize;
pub mod openweather;

use serde::Serialize;
use serde_json::Value;
use std::sync::Arc;
use thiserror::Error;

use crate::clock::Clock;
use crate::store::{StoreError, WeatherStore};
use crate::utils::validate_coordinates;
use normalize::{format_utc, normalize_current, normalize_forecast};
use openweather::{OpenWeatherClient, OpenWeatherError};

#[derive(Error, Debug)]
pub enum ServiceError {
    #[error("{0}")]
    InvalidCoordinates(String),
    #[error("Weather source failed: {0}")]
    Upstream(#[from] OpenWeatherError),
    #[error("Snapshot store failed: {0}")]
    Store(#[from] StoreError),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UpdateOutcome {
    pub detail: String,
    pub timestamp: String,
}

pub struct WeatherService {
    client: OpenWeatherClient,
    store: WeatherStore,
    clock: Arc<dyn Clock>,
    normalize_timestamps: bool,
}

impl WeatherService {
    pub fn new(
        client: OpenWeatherClient,
        store: WeatherStore,
        clock: Arc<dyn Clock>,
        normalize_timestamps: bool,
    ) -> Self {
        Self {
            client,
            store,
            clock,
            normalize_timestamps,
        }
    }

    pub fn store(&self) -> &WeatherStore {
        &self.store
    }

    /// Fetches current conditions and forecast, then records both. Nothing is
    /// written unless both fetches succeed.
    pub async fn update(&self, user_id: &str, lat: f64, lon: f64) -> Result<UpdateOutcome, ServiceError> {
        validate_coordinates(lat, lon).map_err(ServiceError::InvalidCoordinates)?;

        let (mut current, mut forecast) = tokio::try_join!(
            self.client.get_current(lat, lon),
            self.client.get_forecast(lat, lon)
        )?;

        if self.normalize_timestamps {
            normalize_current(&mut current);
            normalize_forecast(&mut forecast);
        }

        let captured_at = self.clock.now().timestamp();
        match self.store.put_weather(user_id, lat, lon, captured_at, current).await {
            Ok(_) => {}
            // Same capture second: the first snapshot stands, the forecast still refreshes.
            Err(StoreError::Conflict(key)) => {
                tracing::debug!("Weather snapshot {} already recorded", key);
            }
            Err(e) => return Err(e.into()),
        }
        // A failure here leaves the history entry in place.
        self.store.put_forecast(user_id, lat, lon, forecast).await?;

        tracing::info!("Updated weather for {} at ({}, {})", user_id, lat, lon);

        Ok(UpdateOutcome {
            detail: "Weather data updated".to_string(),
            timestamp: format_utc(captured_at),
        })
    }

    pub async fn list_history(&self, user_id: &str, lat: f64, lon: f64) -> Result<Vec<Value>, ServiceError> {
        let snapshots = self.store.get_weather_history(user_id, lat, lon).await?;
        Ok(snapshots.into_iter().map(|s| s.payload).collect())
    }

    /// `None` when the location has never been updated for this user.
    pub async fn get_forecast(&self, user_id: &str, lat: f64, lon: f64) -> Result<Option<Value>, ServiceError> {
        let snapshot = self.store.get_forecast(user_id, lat, lon).await?;
        Ok(snapshot.map(|s| s.payload))
    }
}


#[cfg(test)]
mod tests {
    use super::test_support::*;
    use super::*;
    use crate::clock::ManualClock;
    use crate::config::Config;
    use crate::store::test_support::{sqlite_store, T0};
    use serde_json::json;
    use wiremock::matchers::{method, path};
    use wiremock::{Mock, MockServer, ResponseTemplate};

    async fn build_service(server: &MockServer, clock: Arc<ManualClock>) -> (WeatherService, tempfile::TempDir) {
        let (store, dir) = sqlite_store(clock.clone()).await;
        let client = OpenWeatherClient::new(Config::for_tests(&server.uri(), "unused")).unwrap();
        (WeatherService::new(client, store, clock, true), dir)
    }

    #[tokio::test]
    async fn test_update_persists_normalized_snapshot() {
        let mock_server = MockServer::start().await;
        mount_openweather(&mock_server, current_body(), forecast_body()).await;
        let clock = Arc::new(ManualClock::at(T0));
        let (service, _dir) = build_service(&mock_server, clock).await;

        let outcome = service.update("u1", -26.14, 27.98).await.unwrap();
        assert_eq!(outcome.detail, "Weather data updated");
        assert_eq!(outcome.timestamp, "2024-07-11 15:00:00");

        let history = service.list_history("u1", -26.14, 27.98).await.unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0]["dt"], "2024-07-11 17:00:00");
        assert_eq!(history[0]["sys"]["sunrise"], "2024-07-11 06:55:14");
        assert_eq!(history[0]["sys"]["sunset"], "2024-07-11 17:31:36");
        assert_eq!(history[0]["name"], "Johannesburg");

        let forecast = service.get_forecast("u1", -26.14, 27.98).await.unwrap().unwrap();
        assert_eq!(forecast["list"][0]["dt"], "2024-07-11 20:00:00");
    }

    #[tokio::test]
    async fn test_update_appends_history_and_replaces_forecast() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data/2.5/weather"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"reading": 1})))
            .up_to_n_times(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/data/2.5/forecast"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"version": 1})))
            .up_to_n_times(1)
            .mount(&mock_server)
            .await;
        mount_openweather(&mock_server, json!({"reading": 2}), json!({"version": 2})).await;

        let clock = Arc::new(ManualClock::at(T0));
        let (service, _dir) = build_service(&mock_server, clock.clone()).await;

        service.update("u1", 1.0, 2.0).await.unwrap();
        clock.advance(chrono::Duration::minutes(5));
        service.update("u1", 1.0, 2.0).await.unwrap();

        let history = service.list_history("u1", 1.0, 2.0).await.unwrap();
        assert_eq!(history, vec![json!({"reading": 1}), json!({"reading": 2})]);

        let first = service.get_forecast("u1", 1.0, 2.0).await.unwrap();
        let second = service.get_forecast("u1", 1.0, 2.0).await.unwrap();
        assert_eq!(first, Some(json!({"version": 2})));
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn test_same_second_update_keeps_snapshot_and_refreshes_forecast() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data/2.5/weather"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"v": 1})))
            .up_to_n_times(1)
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/data/2.5/forecast"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({"v": 1})))
            .up_to_n_times(1)
            .mount(&mock_server)
            .await;
        mount_openweather(&mock_server, json!({"v": 2}), json!({"v": 2})).await;

        let clock = Arc::new(ManualClock::at(T0));
        let (service, _dir) = build_service(&mock_server, clock).await;

        service.update("u1", 1.0, 2.0).await.unwrap();
        let second = service.update("u1", 1.0, 2.0).await.unwrap();
        assert_eq!(second.detail, "Weather data updated");

        let history = service.list_history("u1", 1.0, 2.0).await.unwrap();
        assert_eq!(history, vec![json!({"v": 1})]);
        assert_eq!(service.get_forecast("u1", 1.0, 2.0).await.unwrap(), Some(json!({"v": 2})));
    }

    #[tokio::test]
    async fn test_upstream_failure_writes_nothing() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .and(path("/data/2.5/weather"))
            .respond_with(ResponseTemplate::new(200).set_body_json(current_body()))
            .mount(&mock_server)
            .await;
        Mock::given(method("GET"))
            .and(path("/data/2.5/forecast"))
            .respond_with(ResponseTemplate::new(500))
            .mount(&mock_server)
            .await;

        let clock = Arc::new(ManualClock::at(T0));
        let (service, _dir) = build_service(&mock_server, clock).await;

        let err = service.update("u1", 1.0, 2.0).await.unwrap_err();
        assert!(matches!(err, ServiceError::Upstream(_)));
        assert!(service.list_history("u1", 1.0, 2.0).await.unwrap().is_empty());
        assert_eq!(service.get_forecast("u1", 1.0, 2.0).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_invalid_coordinates_skip_fetch() {
        let mock_server = MockServer::start().await;
        Mock::given(method("GET"))
            .respond_with(ResponseTemplate::new(200).set_body_json(json!({})))
            .expect(0)
            .mount(&mock_server)
            .await;

        let clock = Arc::new(ManualClock::at(T0));
        let (service, _dir) = build_service(&mock_server, clock).await;

        let err = service.update("u1", 91.0, 0.0).await.unwrap_err();
        assert!(matches!(err, ServiceError::InvalidCoordinates(_)));
    }

    #[tokio::test]
    async fn test_other_users_see_nothing() {
        let mock_server = MockServer::start().await;
        mount_openweather(&mock_server, current_body(), forecast_body()).await;
        let clock = Arc::new(ManualClock::at(T0));
        let (service, _dir) = build_service(&mock_server, clock).await;

        service.update("alice", -26.14, 27.98).await.unwrap();

        assert!(service.list_history("bob", -26.14, 27.98).await.unwrap().is_empty());
        assert_eq!(service.get_forecast("bob", -26.14, 27.98).await.unwrap(), None);
    }
}
