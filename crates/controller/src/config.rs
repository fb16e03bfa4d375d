//! TOML config file loading, environment overrides, and validation.

use anyhow::{bail, Context, Result};
use serde::Deserialize;
use std::env;
use std::path::Path;
use time::macros::format_description;
use time::UtcOffset;

use crate::state::{Settings, MAX_PUMP_SECONDS};

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    pub polling: PollingConfig,
    pub irrigation: IrrigationConfig,
    pub weather: WeatherConfig,
    pub pump: PumpConfig,
    pub sensor: SensorConfig,
    pub web: WebConfig,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PollingConfig {
    pub sensor_sec: u64,
    pub weather_sec: u64,
    pub auto_sec: u64,
    /// Added to the pump run before the scheduler evaluates again.
    pub pump_margin_sec: u64,
}

impl Default for PollingConfig {
    fn default() -> Self {
        Self {
            sensor_sec: 2,
            weather_sec: 300,
            auto_sec: 10,
            pump_margin_sec: 3,
        }
    }
}

/// Startup values for the user-tunable settings.
#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct IrrigationConfig {
    pub temp_threshold_c: f64,
    pub soil_dry_threshold_percent: i32,
    pub pump_run_seconds: u32,
    pub auto_enabled: bool,
}

impl Default for IrrigationConfig {
    fn default() -> Self {
        Self {
            temp_threshold_c: 30.0,
            soil_dry_threshold_percent: 30,
            pump_run_seconds: 5,
            auto_enabled: true,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WeatherConfig {
    /// Empty disables the weather poller.
    pub api_key: String,
    pub city: String,
    pub base_url: String,
    pub timeout_sec: u64,
    /// Offset used to display rain times, e.g. "+05:30". Defaults to the
    /// host's local offset.
    pub utc_offset: Option<String>,
}

impl Default for WeatherConfig {
    fn default() -> Self {
        Self {
            api_key: String::new(),
            city: "Bengaluru,IN".to_string(),
            base_url: "https://api.openweathermap.org/data/2.5".to_string(),
            timeout_sec: 8,
            utc_offset: None,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct PumpConfig {
    pub url: String,
    pub timeout_sec: u64,
}

impl Default for PumpConfig {
    fn default() -> Self {
        Self {
            url: "http://esp-pump.local:5001".to_string(),
            timeout_sec: 4,
        }
    }
}

/// Which output level of the digital soil probe means "wet".
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum WetLevel {
    Low,
    High,
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct SensorConfig {
    pub dht_pin: u8,
    pub soil_pin: u8,
    pub soil_wet_level: WetLevel,
    pub read_timeout_sec: u64,
}

impl Default for SensorConfig {
    fn default() -> Self {
        Self {
            dht_pin: 4,
            soil_pin: 17,
            // Common LM393 probe boards pull DO low when the soil is wet.
            soil_wet_level: WetLevel::Low,
            read_timeout_sec: 3,
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(default)]
pub struct WebConfig {
    pub port: u16,
}

impl Default for WebConfig {
    fn default() -> Self {
        Self { port: 5000 }
    }
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
const VALID_GPIO_PINS: std::ops::RangeInclusive<u8> = 2..=27;

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate the whole config. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        self.validate_polling(&mut errors);
        self.validate_irrigation(&mut errors);
        self.validate_endpoints(&mut errors);
        self.validate_sensor(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_polling(&self, errors: &mut Vec<String>) {
        let p = &self.polling;
        for (name, value) in [
            ("sensor_sec", p.sensor_sec),
            ("weather_sec", p.weather_sec),
            ("auto_sec", p.auto_sec),
        ] {
            if value == 0 {
                errors.push(format!("polling.{name} must be positive"));
            }
        }
    }

    fn validate_irrigation(&self, errors: &mut Vec<String>) {
        let i = &self.irrigation;
        if !i.temp_threshold_c.is_finite() {
            errors.push("irrigation.temp_threshold_c must be a number".to_string());
        }
        if !(0..=100).contains(&i.soil_dry_threshold_percent) {
            errors.push(format!(
                "irrigation.soil_dry_threshold_percent {} out of range [0, 100]",
                i.soil_dry_threshold_percent
            ));
        }
        if !(1..=MAX_PUMP_SECONDS).contains(&i.pump_run_seconds) {
            errors.push(format!(
                "irrigation.pump_run_seconds {} out of range [1, {MAX_PUMP_SECONDS}]",
                i.pump_run_seconds
            ));
        }
    }

    fn validate_endpoints(&self, errors: &mut Vec<String>) {
        if !is_http_url(&self.pump.url) {
            errors.push(format!("pump.url '{}' is not an http(s) URL", self.pump.url));
        }
        if self.pump.timeout_sec == 0 {
            errors.push("pump.timeout_sec must be positive".to_string());
        }

        let w = &self.weather;
        if !w.api_key.is_empty() {
            if w.city.trim().is_empty() {
                errors.push("weather.city is empty".to_string());
            }
            if !is_http_url(&w.base_url) {
                errors.push(format!(
                    "weather.base_url '{}' is not an http(s) URL",
                    w.base_url
                ));
            }
        }
        if w.timeout_sec == 0 {
            errors.push("weather.timeout_sec must be positive".to_string());
        }
        if let Some(raw) = &w.utc_offset {
            if parse_utc_offset(raw).is_none() {
                errors.push(format!(
                    "weather.utc_offset '{raw}' is not an offset like +05:30"
                ));
            }
        }
    }

    fn validate_sensor(&self, errors: &mut Vec<String>) {
        let s = &self.sensor;
        for (name, pin) in [("dht_pin", s.dht_pin), ("soil_pin", s.soil_pin)] {
            if !VALID_GPIO_PINS.contains(&pin) {
                errors.push(format!(
                    "sensor.{name} {pin} is not a valid BCM GPIO pin (allowed: 2-27)"
                ));
            }
        }
        if s.dht_pin == s.soil_pin {
            errors.push(format!(
                "sensor.dht_pin and sensor.soil_pin are both {}",
                s.dht_pin
            ));
        }
        if s.read_timeout_sec == 0 {
            errors.push("sensor.read_timeout_sec must be positive".to_string());
        }
    }

    /// Environment variables win over the file.
    pub fn apply_env(&mut self) {
        if let Ok(key) = env::var("OPENWEATHER_API_KEY") {
            self.weather.api_key = key;
        }
        if let Ok(city) = env::var("WEATHER_CITY") {
            self.weather.city = city;
        }
        if let Ok(url) = env::var("PUMP_URL") {
            self.pump.url = url;
        }
        if let Some(port) = env::var("WEB_PORT").ok().and_then(|s| s.parse().ok()) {
            self.web.port = port;
        }
    }

    pub fn initial_settings(&self) -> Settings {
        Settings {
            temp_threshold_c: self.irrigation.temp_threshold_c,
            soil_dry_threshold_percent: self.irrigation.soil_dry_threshold_percent,
            pump_run_seconds: self.irrigation.pump_run_seconds,
            auto_enabled: self.irrigation.auto_enabled,
        }
    }

    /// Offset for displaying forecast times: configured, else the host's
    /// local offset, else UTC.
    pub fn display_offset(&self) -> UtcOffset {
        self.weather
            .utc_offset
            .as_deref()
            .and_then(parse_utc_offset)
            .or_else(|| UtcOffset::current_local_offset().ok())
            .unwrap_or(UtcOffset::UTC)
    }
}

fn is_http_url(s: &str) -> bool {
    s.starts_with("http://") || s.starts_with("https://")
}

fn parse_utc_offset(raw: &str) -> Option<UtcOffset> {
    let fmt = format_description!("[offset_hour sign:mandatory]:[offset_minute]");
    UtcOffset::parse(raw.trim(), fmt).ok()
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Read and parse a TOML config file. Validation happens in [`load_or_default`].
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config: Config =
        toml::from_str(&contents).with_context(|| format!("failed to parse config: {path}"))?;
    Ok(config)
}

/// Load `path` if it exists (defaults otherwise), apply environment
/// overrides, then validate the result.
pub fn load_or_default(path: &str) -> Result<Config> {
    let mut config = if Path::new(path).exists() {
        load(path)?
    } else {
        tracing::warn!(%path, "config file not found, using defaults");
        Config::default()
    };
    config.apply_env();
    config
        .validate()
        .with_context(|| format!("invalid config: {path}"))?;
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================
