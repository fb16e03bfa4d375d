//! Local environment sensors and the poller that keeps the sensor part of
//! the store fresh. The `gpio` feature gates the real rppal drivers (DHT11 +
//! digital soil probe); without it, a simulated board stands in.

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, info};

use crate::config::{SensorConfig, WetLevel};
use crate::cycle::CycleOutcome;
use crate::dht::Climate;
use crate::error::SensorError;
use crate::state::Store;

pub const SENSOR_WARMING_UP: &str = "Sensor warming up";
const SOIL_ERROR_PREFIX: &str = "Soil read error";
const INTERNAL_ERROR_PREFIX: &str = "Sensor thread error";

/// Anything that can produce a climate pair and a soil reading. Reads are
/// blocking and are always run off the async executor.
pub trait SensorProvider: Send + Sync + 'static {
    fn read_climate(&self) -> Result<Climate, SensorError>;

    /// Soil moisture in percent, 0 = fully dry, 100 = fully wet.
    fn read_soil(&self) -> Result<u8, SensorError>;
}

/// Map the digital soil probe's output level to a percentage.
pub fn soil_percent(line_is_low: bool, wet_level: WetLevel) -> u8 {
    let wet = match wet_level {
        WetLevel::Low => line_is_low,
        WetLevel::High => !line_is_low,
    };
    if wet {
        100
    } else {
        0
    }
}

// ---------------------------------------------------------------------------
// Real sensors (production — requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub(crate) struct Sensors {
    dht: crate::dht::Dht11,
    soil: rppal::gpio::InputPin,
    wet_level: WetLevel,
}

#[cfg(feature = "gpio")]
impl Sensors {
    pub(crate) fn new(cfg: &SensorConfig) -> anyhow::Result<Self> {
        use anyhow::Context;

        let gpio = rppal::gpio::Gpio::new().context("failed to open gpio")?;
        let dht = crate::dht::Dht11::new(&gpio, cfg.dht_pin)?;
        let soil = gpio
            .get(cfg.soil_pin)
            .with_context(|| format!("soil probe: cannot claim gpio {}", cfg.soil_pin))?
            .into_input();

        info!(
            dht_pin = cfg.dht_pin,
            soil_pin = cfg.soil_pin,
            wet_level = ?cfg.soil_wet_level,
            "gpio sensors initialised"
        );
        Ok(Self {
            dht,
            soil,
            wet_level: cfg.soil_wet_level,
        })
    }
}

#[cfg(feature = "gpio")]
impl SensorProvider for Sensors {
    fn read_climate(&self) -> Result<Climate, SensorError> {
        self.dht.read()
    }

    fn read_soil(&self) -> Result<u8, SensorError> {
        Ok(soil_percent(self.soil.is_low(), self.wet_level))
    }
}

// ---------------------------------------------------------------------------
// Simulated sensors (development — no hardware)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub(crate) struct Sensors {
    sim: std::sync::Mutex<SimState>,
    wet_level: WetLevel,
}

#[cfg(not(feature = "gpio"))]
struct SimState {
    temperature: f64,
    humidity: f64,
    line_is_low: bool,
}

/// Fraction of climate reads that fail, roughly what a DHT11 does.
#[cfg(not(feature = "gpio"))]
const SIM_DHT_FAILURE_RATE: f64 = 0.1;

/// Chance per read that the simulated soil probe flips state.
#[cfg(not(feature = "gpio"))]
const SIM_SOIL_FLIP_RATE: f64 = 0.02;

#[cfg(not(feature = "gpio"))]
impl Sensors {
    pub(crate) fn new(cfg: &SensorConfig) -> anyhow::Result<Self> {
        info!(
            dht_pin = cfg.dht_pin,
            soil_pin = cfg.soil_pin,
            "simulated sensors initialised (no hardware)"
        );
        Ok(Self {
            sim: std::sync::Mutex::new(SimState {
                temperature: 27.0,
                humidity: 55.0,
                line_is_low: true,
            }),
            wet_level: cfg.soil_wet_level,
        })
    }
}

#[cfg(not(feature = "gpio"))]
impl SensorProvider for Sensors {
    fn read_climate(&self) -> Result<Climate, SensorError> {
        if fastrand::f64() < SIM_DHT_FAILURE_RATE {
            return Err(SensorError::NoResponse);
        }
        let mut sim = self
            .sim
            .lock()
            .map_err(|_| SensorError::Gpio("simulator lock poisoned".to_string()))?;
        sim.temperature = (sim.temperature + (fastrand::f64() - 0.5) * 0.4).clamp(15.0, 42.0);
        sim.humidity = (sim.humidity + (fastrand::f64() - 0.5)).clamp(20.0, 95.0);
        Ok(Climate {
            temperature: (sim.temperature * 10.0).round() / 10.0,
            humidity: sim.humidity.round(),
        })
    }

    fn read_soil(&self) -> Result<u8, SensorError> {
        let mut sim = self
            .sim
            .lock()
            .map_err(|_| SensorError::Gpio("simulator lock poisoned".to_string()))?;
        if fastrand::f64() < SIM_SOIL_FLIP_RATE {
            sim.line_is_low = !sim.line_is_low;
        }
        Ok(soil_percent(sim.line_is_low, self.wet_level))
    }
}

// ---------------------------------------------------------------------------
// Poller
// ---------------------------------------------------------------------------

/// Run the sensor poller forever. Intended to be `tokio::spawn`-ed from main.
pub async fn run(
    provider: Arc<dyn SensorProvider>,
    store: Store,
    every: Duration,
    read_timeout: Duration,
) {
    let mut ticker = tokio::time::interval(every);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(every_sec = every.as_secs_f64(), "sensor poller started");

    loop {
        ticker.tick().await;
        poll_once(Arc::clone(&provider), &store, read_timeout)
            .await
            .log("sensor");
    }
}

/// One sensor cycle: read both channels off the executor, then apply the
/// results to the store in a single short update.
pub async fn poll_once(
    provider: Arc<dyn SensorProvider>,
    store: &Store,
    read_timeout: Duration,
) -> CycleOutcome {
    let climate = read_blocking(Arc::clone(&provider), read_timeout, |p| p.read_climate()).await;
    let soil = read_blocking(provider, read_timeout, |p| p.read_soil()).await;

    // A faulted channel is skipped; the other one is still applied.
    let fault = match (&climate, &soil) {
        (Err(f), _) | (_, Err(f)) => Some(format!("{INTERNAL_ERROR_PREFIX}: {f}")),
        _ => None,
    };
    let climate = climate.ok();
    let soil = soil.ok();

    if let Some(Err(e)) = &climate {
        // Intermittent DHT failures are normal; previous values stay.
        debug!(error = %e, "climate read failed");
    }

    let warming_up = store
        .update_sensor(|s| {
            match &climate {
                Some(Ok(c)) => {
                    s.temperature = Some(c.temperature);
                    s.humidity = Some(c.humidity);
                }
                Some(Err(_)) if s.temperature.is_none() => {
                    s.error = Some(SENSOR_WARMING_UP.to_string());
                }
                _ => {}
            }

            match &soil {
                Some(Ok(percent)) => {
                    s.soil_moisture_percent = Some(*percent);
                    if s
                        .error
                        .as_deref()
                        .is_some_and(|e| e.starts_with(SOIL_ERROR_PREFIX))
                    {
                        s.error = None;
                    }
                }
                Some(Err(e)) => {
                    s.soil_moisture_percent = None;
                    s.error = Some(format!("{SOIL_ERROR_PREFIX}: {e}"));
                }
                None => {}
            }

            // A valid pair this cycle clears any earlier message.
            if matches!(climate, Some(Ok(_))) {
                s.error = None;
            }
            if let Some(msg) = &fault {
                s.error = Some(msg.clone());
            }

            s.temperature.is_none()
        })
        .await;

    if let Some(msg) = fault {
        return CycleOutcome::Failed(msg);
    }

    let mut problems = Vec::new();
    if let (Some(Err(e)), true) = (&climate, warming_up) {
        problems.push(format!("no climate reading yet: {e}"));
    }
    if let Some(Err(e)) = &soil {
        problems.push(format!("soil: {e}"));
    }
    crate::cycle::degraded_if_any(problems)
}

/// Run a blocking read on the blocking pool with a deadline. The outer
/// `Err` is an internal fault (the read panicked), not a sensor failure.
async fn read_blocking<T, F>(
    provider: Arc<dyn SensorProvider>,
    limit: Duration,
    read: F,
) -> Result<Result<T, SensorError>, String>
where
    T: Send + 'static,
    F: FnOnce(&dyn SensorProvider) -> Result<T, SensorError> + Send + 'static,
{
    let task = tokio::task::spawn_blocking(move || read(provider.as_ref()));
    match tokio::time::timeout(limit, task).await {
        Ok(Ok(result)) => Ok(result),
        Ok(Err(join)) => Err(join.to_string()),
        Err(_) => Ok(Err(SensorError::Timeout(limit))),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
