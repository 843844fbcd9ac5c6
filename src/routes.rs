use axum::{
    extract::{Path, Query, State},
    http::{header::WWW_AUTHENTICATE, StatusCode},
    response::{Html, IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::sync::Arc;
use thiserror::Error;

use crate::{
    auth::{AuthError, AuthenticatedUser, IdentityVerifier},
    config::Config,
    store::BackendKind,
    weather::{ServiceError, UpdateOutcome, WeatherService},
};

const INDEX_HTML: &str = include_str!("../static/index.html");

// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub weather: Arc<WeatherService>,
    pub verifier: Arc<dyn IdentityVerifier>,
}

#[derive(Error, Debug)]
pub enum ApiError {
    #[error("{0}")]
    Unauthorized(AuthError),
    #[error(transparent)]
    Service(#[from] ServiceError),
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        match self {
            ApiError::Unauthorized(e) => {
                let detail = match e {
                    AuthError::MissingCredential => "Not authenticated",
                    AuthError::InvalidToken(_) | AuthError::KeysUnavailable(_) => "Invalid or expired token",
                };
                (
                    StatusCode::UNAUTHORIZED,
                    [(WWW_AUTHENTICATE, "Bearer")],
                    Json(json!({ "detail": detail })),
                )
                    .into_response()
            }
            ApiError::Service(ServiceError::InvalidCoordinates(message)) => {
                (StatusCode::BAD_REQUEST, Json(json!({ "detail": message }))).into_response()
            }
            ApiError::Service(ServiceError::Upstream(e)) => {
                tracing::error!("Weather update failed upstream: {}", e);
                (
                    StatusCode::BAD_GATEWAY,
                    Json(json!({ "detail": "Weather source unavailable" })),
                )
                    .into_response()
            }
            ApiError::Service(ServiceError::Store(e)) => {
                tracing::error!("Snapshot store failed: {}", e);
                (
                    StatusCode::INTERNAL_SERVER_ERROR,
                    Json(json!({ "detail": "Internal server error" })),
                )
                    .into_response()
            }
        }
    }
}

// Request/Response types
#[derive(Debug, Deserialize)]
pub struct CoordinateQuery {
    pub lat: f64,
    pub lon: f64,
}

#[derive(Debug, Serialize)]
pub struct HealthResponse {
    pub status: String,
    pub backend: BackendKind,
    pub environment: String,
    pub timestamp: chrono::DateTime<chrono::Utc>,
    pub version: String,
}

// Route handlers
pub async fn index() -> Html<&'static str> {
    Html(INDEX_HTML)
}

pub async fn health(State(state): State<AppState>) -> Json<HealthResponse> {
    let store = state.weather.store();
    let status = match store.health_check().await {
        Ok(()) => "healthy",
        Err(e) => {
            tracing::warn!("Store health check failed: {}", e);
            "degraded"
        }
    };

    Json(HealthResponse {
        status: status.to_string(),
        backend: store.backend_kind(),
        environment: state.config.app_env.clone(),
        timestamp: chrono::Utc::now(),
        version: env!("CARGO_PKG_VERSION").to_string(),
    })
}

pub async fn update_weather(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Query(params): Query<CoordinateQuery>,
) -> Result<Json<UpdateOutcome>, ApiError> {
    let outcome = state.weather.update(&user_id, params.lat, params.lon).await?;
    Ok(Json(outcome))
}

pub async fn get_weather_data(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path((lat, lon)): Path<(f64, f64)>,
) -> Result<Json<Vec<Value>>, ApiError> {
    let history = state.weather.list_history(&user_id, lat, lon).await?;
    Ok(Json(history))
}

pub async fn get_forecast_data(
    State(state): State<AppState>,
    AuthenticatedUser(user_id): AuthenticatedUser,
    Path((lat, lon)): Path<(f64, f64)>,
) -> Result<Json<Value>, ApiError> {
    let forecast = state.weather.get_forecast(&user_id, lat, lon).await?;
    Ok(Json(forecast.unwrap_or_else(|| json!({ "error": "Data not found" }))))
}

// Create the router
pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/health", get(health))
        .route("/update_weather", post(update_weather))
        .route("/update_weather/", post(update_weather))
        .route("/weather_data/:lat/:lon", get(get_weather_data))
        .route("/forecast_data/:lat/:lon", get(get_forecast_data))
        .with_state(state)
}
