use crate::config::Config;
use reqwest::Client;
use serde_json::Value;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum OpenWeatherError {
    #[error("HTTP request failed: {0}")]
    RequestFailed(#[from] reqwest::Error),
    #[error("API error: {0}")]
    ApiError(String),
}

/// Client for the current-conditions and 5-day forecast endpoints. Payloads
/// are returned as untyped JSON and stored as-is.
pub struct OpenWeatherClient {
    client: Client,
    config: Config,
}

impl OpenWeatherClient {
    pub fn new(config: Config) -> Result<Self, OpenWeatherError> {
        let client = Client::builder()
            .user_agent("HorizonWeather/1.0")
            .timeout(config.openweather_timeout())
            .build()?;

        Ok(Self { client, config })
    }

    pub async fn get_current(&self, lat: f64, lon: f64) -> Result<Value, OpenWeatherError> {
        self.fetch(&self.config.openweather_current_path, lat, lon).await
    }

    pub async fn get_forecast(&self, lat: f64, lon: f64) -> Result<Value, OpenWeatherError> {
        self.fetch(&self.config.openweather_forecast_path, lat, lon).await
    }

    /// Single attempt, no retry. A failure here fails the whole update.
    async fn fetch(&self, path: &str, lat: f64, lon: f64) -> Result<Value, OpenWeatherError> {
        let url = format!("{}{}", self.config.openweather_base_url, path);

        let response = self
            .client
            .get(&url)
            .query(&[
                ("lat", lat.to_string().as_str()),
                ("lon", lon.to_string().as_str()),
                ("units", self.config.openweather_units.as_str()),
                ("appid", self.config.openweather_api_key.as_str()),
            ])
            .send()
            .await?;

        let status = response.status();
        if !status.is_success() {
            let error_text = response.text().await.unwrap_or_default();
            return Err(OpenWeatherError::ApiError(format!(
                "HTTP {} from {}: {}",
                status, path, error_text
            )));
        }

        Ok(response.json::<Value>().await?)
    }
}
