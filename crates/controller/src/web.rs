use axum::extract::{Query, State};
use axum::http::{header, StatusCode};
use axum::response::{IntoResponse, Json};
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tracing::{info, warn};

use crate::pump::{self, Pump};
use crate::state::{SettingsPatch, Store};
use crate::weather::WeatherPoller;

const INDEX_HTML: &str = include_str!("ui/index.html");

/// Everything the request handlers touch.
#[derive(Clone)]
pub struct AppState {
    pub store: Store,
    pub pump: Arc<dyn Pump>,
    pub weather: WeatherPoller,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(index))
        .route("/sensor", get(sensor))
        .route("/weather", get(weather))
        .route("/water", get(water))
        .route("/setcity", get(set_city))
        .route("/settings", get(get_settings).post(post_settings))
        .route("/api/status", get(api_status))
        .with_state(state)
}

async fn index() -> impl IntoResponse {
    ([(header::CONTENT_TYPE, "text/html; charset=utf-8")], INDEX_HTML)
}

async fn sensor(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.store.sensor().await)
}

async fn weather(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.store.weather().await)
}

#[derive(Deserialize)]
struct WaterQuery {
    seconds: Option<u32>,
}

async fn water(State(state): State<AppState>, Query(q): Query<WaterQuery>) -> impl IntoResponse {
    let seconds = match q.seconds {
        Some(s) => s,
        None => state.store.settings().await.pump_run_seconds,
    };
    info!(seconds, "manual watering requested");
    pump::spawn_run(Arc::clone(&state.pump), seconds, "manual");
    Json(json!({ "status": "ok", "seconds": seconds }))
}

#[derive(Deserialize)]
struct CityQuery {
    c: Option<String>,
}

async fn set_city(State(state): State<AppState>, Query(q): Query<CityQuery>) -> impl IntoResponse {
    let city = q.c.unwrap_or_default().trim().to_string();
    if city.is_empty() {
        return (
            StatusCode::BAD_REQUEST,
            Json(json!({ "error": "missing city parameter 'c'" })),
        );
    }

    info!(%city, "monitored location changed");
    state.store.set_location(city.clone()).await;
    if state.weather.is_enabled() {
        state.weather.spawn_refresh();
    } else {
        warn!("weather disabled; location stored without refresh");
    }
    (StatusCode::OK, Json(json!({ "status": "ok", "city": city })))
}

async fn get_settings(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.store.settings().await)
}

/// Partial update. The body is read as loose JSON so one bad field never
/// rejects the others.
async fn post_settings(State(state): State<AppState>, body: String) -> impl IntoResponse {
    let value: Value = match serde_json::from_str(&body) {
        Ok(v) => v,
        Err(e) => {
            warn!(error = %e, "settings: body is not json");
            return (
                StatusCode::BAD_REQUEST,
                Json(json!({ "error": format!("invalid json: {e}") })),
            );
        }
    };

    let patch = SettingsPatch::from_json(&value);
    let (applied, settings) = state
        .store
        .update_settings(|s| (patch.apply(s), s.clone()))
        .await;

    if !patch.rejected.is_empty() {
        warn!(rejected = ?patch.rejected, "settings: fields skipped");
    }
    info!(?applied, "settings updated");

    (
        StatusCode::OK,
        Json(json!({
            "status": "ok",
            "applied": applied,
            "rejected": patch.rejected,
            "settings": settings,
        })),
    )
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    Json(state.store.to_status().await)
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState, port: u16) -> anyhow::Result<()> {
    use anyhow::Context;

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {port}"))?;

    info!("web ui listening on http://{addr}");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::{PumpError, WeatherError};
    use crate::forecast::ForecastPoint;
    use crate::weather::{CurrentConditions, WeatherProvider};
    use crate::state::Settings;
    use async_trait::async_trait;
    use axum::body::Body;
    use axum::http::{Method, Request};
    use http_body_util::BodyExt;
    use std::sync::Mutex;
    use std::time::Duration;
    use time::UtcOffset;
    use tower::ServiceExt;

    #[derive(Default)]
    struct RecordingPump {
        runs: Mutex<Vec<u32>>,
    }

    #[async_trait]
    impl Pump for RecordingPump {
        async fn run(&self, seconds: u32) -> Result<(), PumpError> {
            self.runs.lock().unwrap().push(seconds);
            Ok(())
        }
    }

    /// Weather provider whose summary names the location it was asked for.
    #[derive(Default)]
    struct EchoWeather {
        seen: Mutex<Vec<String>>,
    }

    #[async_trait]
    impl WeatherProvider for EchoWeather {
        async fn current(&self, location: &str) -> Result<CurrentConditions, WeatherError> {
            self.seen.lock().unwrap().push(location.to_string());
            Ok(CurrentConditions {
                summary: Some(format!("clear over {location}")),
                description: Some("Clear".into()),
                temperature: Some(27.0),
            })
        }

        async fn forecast(&self, _location: &str) -> Result<Vec<ForecastPoint>, WeatherError> {
            Ok(Vec::new())
        }
    }

    fn test_app() -> (Router, Store, Arc<RecordingPump>) {
        build_app(None)
    }

    fn build_app(
        weather: Option<Arc<dyn WeatherProvider>>,
    ) -> (Router, Store, Arc<RecordingPump>) {
        let enabled = weather.is_some();
        let store = Store::new(
            Settings {
                temp_threshold_c: 30.0,
                soil_dry_threshold_percent: 30,
                pump_run_seconds: 5,
                auto_enabled: true,
            },
            enabled,
            "Bengaluru,IN".to_string(),
        );
        let pump = Arc::new(RecordingPump::default());
        let state = AppState {
            store: store.clone(),
            pump: pump.clone(),
            weather: WeatherPoller::new(weather, store.clone(), UtcOffset::UTC),
        };
        (router(state), store, pump)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, Value) {
        let resp = app
            .oneshot(Request::builder().uri(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(Value::Null);
        (status, json)
    }

    async fn post_settings_body(app: Router, body: &str) -> (StatusCode, Value) {
        let resp = app
            .oneshot(
                Request::builder()
                    .method(Method::POST)
                    .uri("/settings")
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(body.to_string()))
                    .unwrap(),
            )
            .await
            .unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    /// Wait for detached work spawned by a handler.
    async fn settle(pump: &RecordingPump, want: usize) {
        for _ in 0..100 {
            if pump.runs.lock().unwrap().len() >= want {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    }

    #[tokio::test]
    async fn index_serves_html() {
        let (app, _, _) = test_app();
        let resp = app
            .oneshot(Request::builder().uri("/").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::OK);
        let ct = resp.headers().get(header::CONTENT_TYPE).unwrap();
        assert!(ct.to_str().unwrap().starts_with("text/html"));
    }

    #[tokio::test]
    async fn sensor_returns_current_reading() {
        let (app, store, _) = test_app();
        store
            .update_sensor(|s| {
                s.temperature = Some(31.2);
                s.humidity = Some(40.0);
                s.soil_moisture_percent = Some(0);
                s.error = None;
            })
            .await;

        let (status, json) = get_json(app, "/sensor").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["temperature"], 31.2);
        assert_eq!(json["soil"], 0);
        assert!(json["error"].is_null());
    }

    #[tokio::test]
    async fn weather_returns_snapshot_fields() {
        let (app, store, _) = test_app();
        store
            .update_weather(|w| {
                w.rain_expected_next_24h = true;
                w.rain_times = vec!["2025-06-01 18:00".into()];
            })
            .await;

        let (_, json) = get_json(app, "/weather").await;
        assert_eq!(json["enabled"], false);
        assert_eq!(json["rain_next_24h"], true);
        assert_eq!(json["rain_times"][0], "2025-06-01 18:00");
        assert_eq!(json["rain"], false);
    }

    #[tokio::test]
    async fn water_uses_query_seconds() {
        let (app, _, pump) = test_app();
        let (status, json) = get_json(app, "/water?seconds=12").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["seconds"], 12);

        settle(&pump, 1).await;
        assert_eq!(*pump.runs.lock().unwrap(), vec![12]);
    }

    #[tokio::test]
    async fn water_defaults_to_configured_duration() {
        let (app, store, pump) = test_app();
        store.update_settings(|s| s.pump_run_seconds = 7).await;

        let (_, json) = get_json(app, "/water").await;
        assert_eq!(json["seconds"], 7);

        settle(&pump, 1).await;
        assert_eq!(*pump.runs.lock().unwrap(), vec![7]);
    }

    #[tokio::test]
    async fn water_rejects_non_numeric_seconds() {
        let (app, _, pump) = test_app();
        let (status, _) = get_json(app, "/water?seconds=lots").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert!(pump.runs.lock().unwrap().is_empty());
    }

    #[tokio::test]
    async fn setcity_updates_location() {
        let (app, store, _) = test_app();
        let (status, json) = get_json(app, "/setcity?c=Chennai,IN").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["city"], "Chennai,IN");
        assert_eq!(store.location().await, "Chennai,IN");
    }

    #[tokio::test]
    async fn setcity_refreshes_weather_for_new_city() {
        let provider = Arc::new(EchoWeather::default());
        let (app, store, _) = build_app(Some(provider.clone() as Arc<dyn WeatherProvider>));

        let (status, _) = get_json(app, "/setcity?c=Chennai,IN").await;
        assert_eq!(status, StatusCode::OK);

        for _ in 0..100 {
            if store.weather().await.summary.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        let w = store.weather().await;
        assert_eq!(w.summary.as_deref(), Some("clear over Chennai,IN"));
        assert_eq!(*provider.seen.lock().unwrap(), vec!["Chennai,IN".to_string()]);
    }

    #[tokio::test]
    async fn setcity_without_name_is_rejected() {
        let (app, store, _) = test_app();
        let (status, _) = get_json(app, "/setcity?c=%20").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(store.location().await, "Bengaluru,IN");
    }

    #[tokio::test]
    async fn get_settings_uses_wire_names() {
        let (app, _, _) = test_app();
        let (_, json) = get_json(app, "/settings").await;
        assert_eq!(json["TEMP_THRESHOLD"], 30.0);
        assert_eq!(json["SOIL_DRY_THRESHOLD"], 30);
        assert_eq!(json["PUMP_TIME"], 5);
        assert_eq!(json["AUTO_ENABLED"], true);
    }

    #[tokio::test]
    async fn post_settings_partial_update() {
        let (app, store, _) = test_app();
        let (status, json) =
            post_settings_body(app, r#"{"TEMP_THRESHOLD": 33.5, "AUTO_ENABLED": false}"#).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["applied"], serde_json::json!(["TEMP_THRESHOLD", "AUTO_ENABLED"]));
        let s = store.settings().await;
        assert_eq!(s.temp_threshold_c, 33.5);
        assert!(!s.auto_enabled);
        assert_eq!(s.pump_run_seconds, 5);
    }

    #[tokio::test]
    async fn post_settings_skips_bad_fields_only() {
        let (app, store, _) = test_app();
        let (status, json) =
            post_settings_body(app, r#"{"PUMP_TIME": "x", "SOIL_DRY_THRESHOLD": "45"}"#).await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["rejected"], serde_json::json!(["PUMP_TIME"]));
        assert_eq!(json["settings"]["SOIL_DRY_THRESHOLD"], 45);
        let s = store.settings().await;
        assert_eq!(s.soil_dry_threshold_percent, 45);
        assert_eq!(s.pump_run_seconds, 5);
    }

    #[tokio::test]
    async fn post_settings_invalid_json() {
        let (app, store, _) = test_app();
        let (status, _) = post_settings_body(app, "{not json").await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(store.settings().await.temp_threshold_c, 30.0);
    }

    #[tokio::test]
    async fn api_status_includes_everything() {
        let (app, _, _) = test_app();
        let (status, json) = get_json(app, "/api/status").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(json["location"], "Bengaluru,IN");
        assert!(json["uptime_secs"].is_u64());
        assert_eq!(json["sensor"]["error"], "Initializing");
        assert_eq!(json["settings"]["PUMP_TIME"], 5);
    }
}
