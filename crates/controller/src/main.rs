mod config;
mod cycle;
mod dht;
mod error;
mod forecast;
mod pump;
mod scheduler;
mod sensor;
mod state;
mod weather;
mod web;

use anyhow::{Context, Result};
use std::{env, sync::Arc, time::Duration};
use time::UtcOffset;
use tracing::info;
use tracing_subscriber::EnvFilter;

use config::Config;
use pump::{HttpPump, Pump};
use scheduler::Scheduler;
use sensor::{SensorProvider, Sensors};
use state::Store;
use weather::{OpenWeatherMap, WeatherPoller, WeatherProvider};

fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let cfg = config::load_or_default(&config_path)?;

    // The local offset can only be read while the process is single-threaded.
    let display_offset = cfg.display_offset();

    tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .build()
        .context("failed to start tokio runtime")?
        .block_on(run(cfg, display_offset))
}

async fn run(cfg: Config, display_offset: UtcOffset) -> Result<()> {
    // ── Weather provider (optional) ─────────────────────────────────
    let provider: Option<Arc<dyn WeatherProvider>> = if cfg.weather.api_key.is_empty() {
        info!("no openweather api key; rain checks disabled");
        None
    } else {
        Some(Arc::new(OpenWeatherMap::new(&cfg.weather)?))
    };

    // ── Shared state ────────────────────────────────────────────────
    let store = Store::new(
        cfg.initial_settings(),
        provider.is_some(),
        cfg.weather.city.clone(),
    );

    // ── Hardware ────────────────────────────────────────────────────
    let sensors: Arc<dyn SensorProvider> = Arc::new(Sensors::new(&cfg.sensor)?);
    let pump: Arc<dyn Pump> = Arc::new(HttpPump::new(&cfg.pump)?);

    info!(
        city = %cfg.weather.city,
        pump = %cfg.pump.url,
        offset = %display_offset,
        "controller starting"
    );

    // ── Background loops ────────────────────────────────────────────
    let polling = &cfg.polling;

    tokio::spawn(sensor::run(
        sensors,
        store.clone(),
        Duration::from_secs(polling.sensor_sec),
        Duration::from_secs(cfg.sensor.read_timeout_sec),
    ));

    let weather = WeatherPoller::new(provider, store.clone(), display_offset);
    tokio::spawn(weather.clone().run(Duration::from_secs(polling.weather_sec)));

    let scheduler = Scheduler::new(
        store.clone(),
        Arc::clone(&pump),
        Duration::from_secs(polling.pump_margin_sec),
    );
    tokio::spawn(scheduler.run(Duration::from_secs(polling.auto_sec)));

    // ── Web server ──────────────────────────────────────────────────
    web::serve(
        web::AppState {
            store,
            pump,
            weather,
        },
        cfg.web.port,
    )
    .await
}
