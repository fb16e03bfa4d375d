//! The shared state store. Sensor, weather and settings live behind a single
//! lock; callers only ever get copies out or hand a short closure in, so no
//! code path can keep the guard across a hardware read or an HTTP call.

use serde::Serialize;
use serde_json::{Map, Value};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::RwLock;

/// Error text shown until the first sensor cycle has completed.
pub const SENSOR_INITIALIZING: &str = "Initializing";

/// Longest run the pump firmware accepts for a single request.
pub const MAX_PUMP_SECONDS: u32 = 20;

/// Accepted range for the temperature threshold (°C).
const TEMP_THRESHOLD_RANGE: std::ops::RangeInclusive<f64> = -40.0..=85.0;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

/// Latest known environment sample.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SensorReading {
    pub temperature: Option<f64>,
    pub humidity: Option<f64>,
    /// 0 = fully dry, 100 = fully wet.
    #[serde(rename = "soil")]
    pub soil_moisture_percent: Option<u8>,
    pub error: Option<String>,
}

impl SensorReading {
    fn initializing() -> Self {
        Self {
            temperature: None,
            humidity: None,
            soil_moisture_percent: None,
            error: Some(SENSOR_INITIALIZING.to_string()),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WeatherSnapshot {
    pub enabled: bool,
    pub summary: Option<String>,
    pub description: Option<String>,
    #[serde(rename = "temp")]
    pub temperature: Option<f64>,
    #[serde(rename = "rain")]
    pub currently_raining: bool,
    #[serde(rename = "rain_next_24h")]
    pub rain_expected_next_24h: bool,
    pub rain_times: Vec<String>,
}

impl WeatherSnapshot {
    fn new(enabled: bool) -> Self {
        Self {
            enabled,
            summary: None,
            description: None,
            temperature: None,
            currently_raining: false,
            rain_expected_next_24h: false,
            rain_times: Vec::new(),
        }
    }

    /// Rain now or rain in the forecast window. Suppresses auto watering.
    pub fn combined_rain(&self) -> bool {
        self.currently_raining || self.rain_expected_next_24h
    }
}

/// User-tunable settings. Field names on the wire match the dashboard.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Settings {
    #[serde(rename = "TEMP_THRESHOLD")]
    pub temp_threshold_c: f64,
    #[serde(rename = "SOIL_DRY_THRESHOLD")]
    pub soil_dry_threshold_percent: i32,
    #[serde(rename = "PUMP_TIME")]
    pub pump_run_seconds: u32,
    #[serde(rename = "AUTO_ENABLED")]
    pub auto_enabled: bool,
}

/// A point-in-time copy of everything the scheduler needs.
#[derive(Debug, Clone, PartialEq)]
pub struct Snapshot {
    pub sensor: SensorReading,
    pub weather: WeatherSnapshot,
    pub settings: Settings,
}

struct SystemState {
    sensor: SensorReading,
    weather: WeatherSnapshot,
    settings: Settings,
    location: String,
}

// ---------------------------------------------------------------------------
// JSON response (what the status API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub location: String,
    pub sensor: SensorReading,
    pub weather: WeatherSnapshot,
    pub settings: Settings,
}

// ---------------------------------------------------------------------------
// Store
// ---------------------------------------------------------------------------

#[derive(Clone)]
pub struct Store {
    inner: Arc<RwLock<SystemState>>,
    started_at: Instant,
}

impl Store {
    pub fn new(settings: Settings, weather_enabled: bool, location: String) -> Self {
        Self {
            inner: Arc::new(RwLock::new(SystemState {
                sensor: SensorReading::initializing(),
                weather: WeatherSnapshot::new(weather_enabled),
                settings,
                location,
            })),
            started_at: Instant::now(),
        }
    }

    /// Copy sensor, weather and settings under one read guard.
    pub async fn snapshot(&self) -> Snapshot {
        let st = self.inner.read().await;
        Snapshot {
            sensor: st.sensor.clone(),
            weather: st.weather.clone(),
            settings: st.settings.clone(),
        }
    }

    pub async fn sensor(&self) -> SensorReading {
        self.inner.read().await.sensor.clone()
    }

    pub async fn weather(&self) -> WeatherSnapshot {
        self.inner.read().await.weather.clone()
    }

    pub async fn settings(&self) -> Settings {
        self.inner.read().await.settings.clone()
    }

    pub async fn location(&self) -> String {
        self.inner.read().await.location.clone()
    }

    pub async fn update_sensor<R>(&self, f: impl FnOnce(&mut SensorReading) -> R) -> R {
        f(&mut self.inner.write().await.sensor)
    }

    pub async fn update_weather<R>(&self, f: impl FnOnce(&mut WeatherSnapshot) -> R) -> R {
        f(&mut self.inner.write().await.weather)
    }

    pub async fn update_settings<R>(&self, f: impl FnOnce(&mut Settings) -> R) -> R {
        f(&mut self.inner.write().await.settings)
    }

    pub async fn set_location(&self, location: String) {
        self.inner.write().await.location = location;
    }

    pub async fn to_status(&self) -> StatusResponse {
        let st = self.inner.read().await;
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            location: st.location.clone(),
            sensor: st.sensor.clone(),
            weather: st.weather.clone(),
            settings: st.settings.clone(),
        }
    }
}

// ---------------------------------------------------------------------------
// Partial settings updates
// ---------------------------------------------------------------------------

/// A partial settings update decoded from an arbitrary JSON body. Each field
/// is coerced and range-checked on its own; fields that fail are listed in
/// `rejected` and left out of the update.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct SettingsPatch {
    pub temp_threshold_c: Option<f64>,
    pub soil_dry_threshold_percent: Option<i32>,
    pub pump_run_seconds: Option<u32>,
    pub auto_enabled: Option<bool>,
    pub rejected: Vec<String>,
}

impl SettingsPatch {
    pub fn from_json(body: &Value) -> Self {
        let mut patch = Self::default();
        let Some(obj) = body.as_object() else {
            patch.rejected.push("body".to_string());
            return patch;
        };

        if let Some(v) = lookup(obj, "TEMP_THRESHOLD", "temp_threshold_c") {
            match as_f64(v).filter(|t| TEMP_THRESHOLD_RANGE.contains(t)) {
                Some(t) => patch.temp_threshold_c = Some(t),
                None => patch.rejected.push("TEMP_THRESHOLD".to_string()),
            }
        }

        if let Some(v) = lookup(obj, "SOIL_DRY_THRESHOLD", "soil_dry_threshold_percent") {
            match as_i64(v).filter(|s| (0..=100).contains(s)) {
                Some(s) => patch.soil_dry_threshold_percent = Some(s as i32),
                None => patch.rejected.push("SOIL_DRY_THRESHOLD".to_string()),
            }
        }

        if let Some(v) = lookup(obj, "PUMP_TIME", "pump_run_seconds") {
            match as_i64(v).filter(|p| (1..=MAX_PUMP_SECONDS as i64).contains(p)) {
                Some(p) => patch.pump_run_seconds = Some(p as u32),
                None => patch.rejected.push("PUMP_TIME".to_string()),
            }
        }

        if let Some(v) = lookup(obj, "AUTO_ENABLED", "auto_enabled") {
            match as_bool(v) {
                Some(b) => patch.auto_enabled = Some(b),
                None => patch.rejected.push("AUTO_ENABLED".to_string()),
            }
        }

        patch
    }

    /// Write the accepted fields. Returns the wire names that changed.
    pub fn apply(&self, settings: &mut Settings) -> Vec<&'static str> {
        let mut applied = Vec::new();
        if let Some(t) = self.temp_threshold_c {
            settings.temp_threshold_c = t;
            applied.push("TEMP_THRESHOLD");
        }
        if let Some(s) = self.soil_dry_threshold_percent {
            settings.soil_dry_threshold_percent = s;
            applied.push("SOIL_DRY_THRESHOLD");
        }
        if let Some(p) = self.pump_run_seconds {
            settings.pump_run_seconds = p;
            applied.push("PUMP_TIME");
        }
        if let Some(b) = self.auto_enabled {
            settings.auto_enabled = b;
            applied.push("AUTO_ENABLED");
        }
        applied
    }
}

fn lookup<'a>(obj: &'a Map<String, Value>, wire: &str, alias: &str) -> Option<&'a Value> {
    obj.get(wire).or_else(|| obj.get(alias))
}

fn as_f64(v: &Value) -> Option<f64> {
    let f = match v {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    }?;
    f.is_finite().then_some(f)
}

/// Integers, floats (truncated toward zero) and numeric strings.
fn as_i64(v: &Value) -> Option<i64> {
    match v {
        Value::Number(n) => n.as_i64().or_else(|| as_f64(v).map(|f| f.trunc() as i64)),
        Value::String(s) => {
            let s = s.trim();
            s.parse::<i64>()
                .ok()
                .or_else(|| as_f64(v).map(|f| f.trunc() as i64))
        }
        _ => None,
    }
}

fn as_bool(v: &Value) -> Option<bool> {
    match v {
        Value::Bool(b) => Some(*b),
        Value::Number(n) => match n.as_i64() {
            Some(0) => Some(false),
            Some(1) => Some(true),
            _ => None,
        },
        Value::String(s) => match s.trim().to_ascii_lowercase().as_str() {
            "true" | "1" | "on" => Some(true),
            "false" | "0" | "off" => Some(false),
            _ => None,
        },
        _ => None,
    }
}

// ===========================================================================
// Tests
// ===========================================================================
