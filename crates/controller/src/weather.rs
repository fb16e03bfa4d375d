//! Weather provider seam, the OpenWeatherMap client behind it, and the
//! poller that keeps the weather part of the store current.
//!
//! Unlike sensor readings, weather is never kept stale: when a fetch fails
//! the snapshot degrades to "unknown, not raining" so an old "rain coming"
//! signal cannot keep suppressing watering.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde::Deserialize;
use time::{OffsetDateTime, UtcOffset};
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{debug, info, warn};

use crate::config::WeatherConfig;
use crate::cycle::{degraded_if_any, CycleOutcome};
use crate::error::WeatherError;
use crate::forecast::{self, mentions_rain, ForecastPoint, RainOutlook};
use crate::state::Store;

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CurrentConditions {
    /// Detailed text, e.g. "light rain".
    pub summary: Option<String>,
    /// Condition group, e.g. "Rain".
    pub description: Option<String>,
    pub temperature: Option<f64>,
}

#[async_trait]
pub trait WeatherProvider: Send + Sync {
    async fn current(&self, location: &str) -> Result<CurrentConditions, WeatherError>;

    /// Forecast points covering at least the next 24 hours.
    async fn forecast(&self, location: &str) -> Result<Vec<ForecastPoint>, WeatherError>;
}

// ---------------------------------------------------------------------------
// OpenWeatherMap
// ---------------------------------------------------------------------------

pub struct OpenWeatherMap {
    http: reqwest::Client,
    base_url: String,
    api_key: String,
}

impl OpenWeatherMap {
    pub fn new(cfg: &WeatherConfig) -> anyhow::Result<Self> {
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(cfg.timeout_sec))
            .connect_timeout(Duration::from_secs(cfg.timeout_sec))
            .build()
            .context("failed to build weather http client")?;

        Ok(Self {
            http,
            base_url: cfg.base_url.trim_end_matches('/').to_string(),
            api_key: cfg.api_key.clone(),
        })
    }

    async fn get(&self, endpoint: &str, location: &str) -> Result<Vec<u8>, WeatherError> {
        let resp = self
            .http
            .get(format!("{}/{endpoint}", self.base_url))
            .query(&[
                ("q", location),
                ("appid", self.api_key.as_str()),
                ("units", "metric"),
            ])
            .send()
            .await?;

        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(WeatherError::Status { status, body });
        }
        Ok(resp.bytes().await?.to_vec())
    }
}

#[async_trait]
impl WeatherProvider for OpenWeatherMap {
    async fn current(&self, location: &str) -> Result<CurrentConditions, WeatherError> {
        let body = self.get("weather", location).await?;
        Ok(parse_current(&body)?)
    }

    async fn forecast(&self, location: &str) -> Result<Vec<ForecastPoint>, WeatherError> {
        let body = self.get("forecast", location).await?;
        Ok(parse_forecast(&body)?)
    }
}

// -- wire format ------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct OwmCondition {
    main: Option<String>,
    description: Option<String>,
}

#[derive(Debug, Deserialize)]
struct OwmMain {
    temp: Option<f64>,
}

#[derive(Debug, Deserialize)]
struct OwmCurrent {
    #[serde(default)]
    weather: Vec<OwmCondition>,
    main: Option<OwmMain>,
}

#[derive(Debug, Deserialize)]
struct OwmForecast {
    #[serde(default)]
    list: Vec<serde_json::Value>,
}

#[derive(Debug, Deserialize)]
struct OwmEntry {
    dt: i64,
    #[serde(default)]
    weather: Vec<OwmCondition>,
    rain: Option<OwmPrecip>,
}

#[derive(Debug, Deserialize)]
struct OwmPrecip {
    #[serde(rename = "3h")]
    three_h: Option<f64>,
    #[serde(rename = "1h")]
    one_h: Option<f64>,
}

impl OwmPrecip {
    /// The larger of the reported amounts, so a zero in one bucket never
    /// hides rain in the other.
    fn amount(self) -> Option<f64> {
        match (self.three_h, self.one_h) {
            (Some(a), Some(b)) => Some(a.max(b)),
            (a, b) => a.or(b),
        }
    }
}

fn parse_current(body: &[u8]) -> Result<CurrentConditions, serde_json::Error> {
    let cur: OwmCurrent = serde_json::from_slice(body)?;
    let first = cur.weather.into_iter().next();
    Ok(CurrentConditions {
        summary: first.as_ref().and_then(|w| w.description.clone()),
        description: first.and_then(|w| w.main),
        temperature: cur.main.and_then(|m| m.temp),
    })
}

/// Decode the forecast list. Entries that do not parse are dropped one by
/// one rather than failing the whole forecast.
fn parse_forecast(body: &[u8]) -> Result<Vec<ForecastPoint>, serde_json::Error> {
    let fc: OwmForecast = serde_json::from_slice(body)?;
    let mut points = Vec::with_capacity(fc.list.len());

    for raw in fc.list {
        let entry: OwmEntry = match serde_json::from_value(raw) {
            Ok(e) => e,
            Err(e) => {
                debug!(error = %e, "skipping malformed forecast entry");
                continue;
            }
        };
        let Ok(timestamp) = OffsetDateTime::from_unix_timestamp(entry.dt) else {
            debug!(dt = entry.dt, "skipping forecast entry with bad timestamp");
            continue;
        };
        points.push(ForecastPoint {
            timestamp,
            precipitation_mm: entry.rain.and_then(OwmPrecip::amount),
            description: entry.weather.into_iter().next().and_then(|w| w.description),
        });
    }

    Ok(points)
}

// ---------------------------------------------------------------------------
// Poller
// ---------------------------------------------------------------------------

/// Refreshes the weather snapshot. Cheap to clone; clones share the provider
/// and serialize their refreshes, so an on-demand refresh after a location
/// change always lands after any refresh already in flight.
#[derive(Clone)]
pub struct WeatherPoller {
    provider: Option<Arc<dyn WeatherProvider>>,
    store: Store,
    display_offset: UtcOffset,
    clock: fn() -> OffsetDateTime,
    in_flight: Arc<Mutex<()>>,
}

impl WeatherPoller {
    pub fn new(
        provider: Option<Arc<dyn WeatherProvider>>,
        store: Store,
        display_offset: UtcOffset,
    ) -> Self {
        Self {
            provider,
            store,
            display_offset,
            clock: OffsetDateTime::now_utc,
            in_flight: Arc::new(Mutex::new(())),
        }
    }

    #[cfg(test)]
    fn with_clock(mut self, clock: fn() -> OffsetDateTime) -> Self {
        self.clock = clock;
        self
    }

    pub fn is_enabled(&self) -> bool {
        self.provider.is_some()
    }

    /// Run the weather poller forever: once immediately, then every `every`.
    pub async fn run(self, every: Duration) {
        if !self.is_enabled() {
            info!("weather disabled: no api key configured");
            return;
        }

        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(every_sec = every.as_secs(), "weather poller started");

        loop {
            ticker.tick().await;
            self.refresh().await.log("weather");
        }
    }

    /// Refresh on a detached task; the outcome only goes to the log.
    pub fn spawn_refresh(&self) {
        let poller = self.clone();
        tokio::spawn(async move {
            poller.refresh().await.log("weather-refresh");
        });
    }

    /// One weather cycle: fetch current conditions and forecast, analyse the
    /// forecast window, then write everything in a single store update.
    pub async fn refresh(&self) -> CycleOutcome {
        let Some(provider) = &self.provider else {
            return CycleOutcome::Failed("weather provider not configured".to_string());
        };

        let _serial = self.in_flight.lock().await;
        let location = self.store.location().await;

        let (current, forecast) =
            tokio::join!(provider.current(&location), provider.forecast(&location));

        let outlook = match &forecast {
            Ok(points) => forecast::analyze(points, (self.clock)(), self.display_offset),
            Err(_) => RainOutlook::default(),
        };

        let mut problems = Vec::new();
        if let Err(e) = &current {
            warn!(%location, error = %e, "current conditions unavailable");
            problems.push(format!("current conditions: {e}"));
        }
        if let Err(e) = &forecast {
            warn!(%location, error = %e, "forecast unavailable");
            problems.push(format!("forecast: {e}"));
        }

        if outlook.rain_expected {
            info!(
                %location,
                first = %outlook.rain_times[0],
                slots = outlook.rain_times.len(),
                "rain expected within 24h"
            );
        }

        self.store
            .update_weather(|w| {
                match current {
                    Ok(c) => {
                        w.currently_raining = c.summary.as_deref().is_some_and(mentions_rain)
                            || c.description.as_deref().is_some_and(mentions_rain);
                        w.summary = c.summary;
                        w.description = c.description;
                        w.temperature = c.temperature;
                    }
                    Err(_) => {
                        w.summary = None;
                        w.description = None;
                        w.temperature = None;
                        w.currently_raining = false;
                    }
                }
                w.rain_expected_next_24h = outlook.rain_expected;
                w.rain_times = outlook.rain_times;
            })
            .await;

        degraded_if_any(problems)
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Settings;
    use std::sync::Mutex as StdMutex;
    use time::macros::datetime;

    const NOW: OffsetDateTime = datetime!(2025-06-01 06:00 UTC);

    fn fixed_now() -> OffsetDateTime {
        NOW
    }

    /// Provider returning canned results and recording requested locations.
    struct FakeWeather {
        current: Option<CurrentConditions>,
        forecast: Option<Vec<ForecastPoint>>,
        seen: StdMutex<Vec<String>>,
    }

    impl FakeWeather {
        fn new(current: Option<CurrentConditions>, forecast: Option<Vec<ForecastPoint>>) -> Arc<Self> {
            Arc::new(Self {
                current,
                forecast,
                seen: StdMutex::new(Vec::new()),
            })
        }
    }

    fn unavailable() -> WeatherError {
        WeatherError::Decode(serde_json::from_str::<serde_json::Value>("{").unwrap_err())
    }

    #[async_trait]
    impl WeatherProvider for FakeWeather {
        async fn current(&self, location: &str) -> Result<CurrentConditions, WeatherError> {
            self.seen.lock().unwrap().push(location.to_string());
            self.current.clone().ok_or_else(unavailable)
        }

        async fn forecast(&self, _location: &str) -> Result<Vec<ForecastPoint>, WeatherError> {
            self.forecast.clone().ok_or_else(unavailable)
        }
    }

    fn test_store() -> Store {
        Store::new(
            Settings {
                temp_threshold_c: 30.0,
                soil_dry_threshold_percent: 30,
                pump_run_seconds: 5,
                auto_enabled: true,
            },
            true,
            "Bengaluru,IN".to_string(),
        )
    }

    fn clear_now() -> CurrentConditions {
        CurrentConditions {
            summary: Some("clear sky".into()),
            description: Some("Clear".into()),
            temperature: Some(29.5),
        }
    }

    fn rainy_forecast() -> Vec<ForecastPoint> {
        vec![
            ForecastPoint {
                timestamp: NOW + time::Duration::hours(3),
                precipitation_mm: Some(0.8),
                description: Some("light rain".into()),
            },
            ForecastPoint {
                timestamp: NOW + time::Duration::hours(6),
                precipitation_mm: None,
                description: Some("broken clouds".into()),
            },
        ]
    }

    fn poller(provider: Arc<FakeWeather>, store: Store) -> WeatherPoller {
        WeatherPoller::new(Some(provider), store, UtcOffset::UTC).with_clock(fixed_now)
    }

    // -- refresh ------------------------------------------------------------

    #[tokio::test]
    async fn refresh_applies_current_and_forecast() {
        let store = test_store();
        let out = poller(FakeWeather::new(Some(clear_now()), Some(rainy_forecast())), store.clone())
            .refresh()
            .await;

        assert!(out.is_ok());
        let w = store.weather().await;
        assert_eq!(w.summary.as_deref(), Some("clear sky"));
        assert_eq!(w.description.as_deref(), Some("Clear"));
        assert_eq!(w.temperature, Some(29.5));
        assert!(!w.currently_raining);
        assert!(w.rain_expected_next_24h);
        assert_eq!(w.rain_times, vec!["2025-06-01 09:00".to_string()]);
    }

    #[tokio::test]
    async fn current_rain_detected_from_description() {
        let store = test_store();
        let current = CurrentConditions {
            summary: Some("moderate rain".into()),
            description: Some("Rain".into()),
            temperature: Some(22.0),
        };
        poller(FakeWeather::new(Some(current), Some(vec![])), store.clone())
            .refresh()
            .await;

        let w = store.weather().await;
        assert!(w.currently_raining);
        assert!(!w.rain_expected_next_24h);
        assert!(w.combined_rain());
    }

    #[tokio::test]
    async fn current_failure_degrades_instead_of_keeping_stale() {
        let store = test_store();
        store
            .update_weather(|w| {
                w.summary = Some("thunderstorm".into());
                w.currently_raining = true;
                w.temperature = Some(21.0);
            })
            .await;

        let out = poller(FakeWeather::new(None, Some(vec![])), store.clone())
            .refresh()
            .await;

        assert!(matches!(out, CycleOutcome::Degraded(_)));
        let w = store.weather().await;
        assert_eq!(w.summary, None);
        assert_eq!(w.temperature, None);
        assert!(!w.currently_raining);
    }

    #[tokio::test]
    async fn forecast_failure_clears_rain_outlook() {
        let store = test_store();
        store
            .update_weather(|w| {
                w.rain_expected_next_24h = true;
                w.rain_times = vec!["2025-06-01 03:00".into()];
            })
            .await;

        poller(FakeWeather::new(Some(clear_now()), None), store.clone())
            .refresh()
            .await;

        let w = store.weather().await;
        assert!(!w.rain_expected_next_24h);
        assert!(w.rain_times.is_empty());
        assert_eq!(w.summary.as_deref(), Some("clear sky"));
    }

    #[tokio::test]
    async fn refresh_uses_current_location() {
        let store = test_store();
        let provider = FakeWeather::new(Some(clear_now()), Some(vec![]));
        let p = poller(Arc::clone(&provider), store.clone());

        store.set_location("Chennai,IN".into()).await;
        p.refresh().await;

        assert_eq!(*provider.seen.lock().unwrap(), vec!["Chennai,IN".to_string()]);
    }

    #[tokio::test]
    async fn disabled_poller_leaves_store_untouched() {
        let store = test_store();
        let before = store.weather().await;
        let p = WeatherPoller::new(None, store.clone(), UtcOffset::UTC);

        assert!(!p.is_enabled());
        assert!(matches!(p.refresh().await, CycleOutcome::Failed(_)));
        assert_eq!(store.weather().await, before);
    }

    #[tokio::test]
    async fn spawned_refresh_eventually_lands() {
        let store = test_store();
        let p = poller(FakeWeather::new(Some(clear_now()), Some(rainy_forecast())), store.clone());

        p.spawn_refresh();
        for _ in 0..100 {
            if store.weather().await.summary.is_some() {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert_eq!(store.weather().await.summary.as_deref(), Some("clear sky"));
    }

    // -- run ----------------------------------------------------------------

    #[tokio::test(start_paused = true)]
    async fn run_refreshes_at_startup_then_on_interval() {
        let store = test_store();
        let provider = FakeWeather::new(Some(clear_now()), Some(rainy_forecast()));
        let task = tokio::spawn(
            poller(Arc::clone(&provider), store.clone()).run(Duration::from_secs(300)),
        );

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(provider.seen.lock().unwrap().len(), 1);
        assert!(store.weather().await.rain_expected_next_24h);

        tokio::time::sleep(Duration::from_secs(250)).await;
        assert_eq!(provider.seen.lock().unwrap().len(), 1);

        tokio::time::sleep(Duration::from_secs(60)).await;
        assert_eq!(provider.seen.lock().unwrap().len(), 2);
        task.abort();
    }

    #[tokio::test]
    async fn disabled_run_returns_immediately() {
        let p = WeatherPoller::new(None, test_store(), UtcOffset::UTC);
        tokio::time::timeout(Duration::from_secs(1), p.run(Duration::from_secs(300)))
            .await
            .unwrap();
    }

    // -- wire parsing -------------------------------------------------------

    #[test]
    fn parse_current_payload() {
        let body = br#"{
            "weather": [{"main": "Drizzle", "description": "light intensity drizzle"}],
            "main": {"temp": 18.4, "humidity": 90}
        }"#;
        let c = parse_current(body).unwrap();
        assert_eq!(c.summary.as_deref(), Some("light intensity drizzle"));
        assert_eq!(c.description.as_deref(), Some("Drizzle"));
        assert_eq!(c.temperature, Some(18.4));
    }

    #[test]
    fn parse_current_tolerates_missing_sections() {
        let c = parse_current(b"{}").unwrap();
        assert_eq!(c, CurrentConditions::default());
    }

    #[test]
    fn parse_forecast_payload() {
        let body = br#"{"list": [
            {"dt": 1748757600, "weather": [{"main": "Rain", "description": "light rain"}], "rain": {"3h": 0.45}},
            {"dt": 1748768400, "weather": [{"main": "Clouds", "description": "few clouds"}]}
        ]}"#;
        let points = parse_forecast(body).unwrap();
        assert_eq!(points.len(), 2);
        assert_eq!(points[0].timestamp.unix_timestamp(), 1_748_757_600);
        assert_eq!(points[0].precipitation_mm, Some(0.45));
        assert_eq!(points[0].description.as_deref(), Some("light rain"));
        assert_eq!(points[1].precipitation_mm, None);
    }

    #[test]
    fn parse_forecast_skips_malformed_entries() {
        let body = br#"{"list": [
            {"weather": [{"description": "rain"}]},
            {"dt": "soon"},
            {"dt": 1748757600, "rain": {"1h": 1.2}}
        ]}"#;
        let points = parse_forecast(body).unwrap();
        assert_eq!(points.len(), 1);
        assert_eq!(points[0].precipitation_mm, Some(1.2));
    }

    #[test]
    fn parse_forecast_prefers_positive_bucket() {
        let body = br#"{"list": [
            {"dt": 1748757600, "rain": {"3h": 0, "1h": 0.6}},
            {"dt": 1748768400, "rain": {"3h": 1.5, "1h": 0.2}}
        ]}"#;
        let points = parse_forecast(body).unwrap();
        assert_eq!(points[0].precipitation_mm, Some(0.6));
        assert_eq!(points[1].precipitation_mm, Some(1.5));
    }

    #[test]
    fn parse_forecast_without_list_is_empty() {
        assert!(parse_forecast(br#"{"cod": "200"}"#).unwrap().is_empty());
    }

    #[test]
    fn parse_forecast_rejects_non_json() {
        assert!(parse_forecast(b"<html>").is_err());
    }
}
