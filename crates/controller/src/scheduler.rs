//! Auto-watering scheduler: every tick it takes one consistent snapshot of
//! the store, decides whether the pump should run, and if so runs it and
//! then holds off for the run length plus a safety margin.
//!
//! ```text
//!          ┌─[auto off / reading unknown]─▶ Skip
//! Snapshot ┼─[hot or dry, rain signal]────▶ Hold
//!          ├─[neither hot nor dry]────────▶ Idle
//!          └─[hot or dry, no rain]────────▶ Water ──▶ pause(run + margin)
//! ```

use std::sync::Arc;
use std::time::Duration;

use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info};

use crate::cycle::CycleOutcome;
use crate::pump::Pump;
use crate::state::{Snapshot, Store};

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum SkipReason {
    AutoDisabled,
    NoTemperature,
    NoSoilReading,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decision {
    Skip(SkipReason),
    /// Watering is warranted but rain (now or forecast) suppresses it.
    Hold,
    /// Neither too hot nor too dry.
    Idle,
    Water { seconds: u32 },
}

/// Pure watering decision over one snapshot.
pub fn decide(snap: &Snapshot) -> Decision {
    let settings = &snap.settings;
    if !settings.auto_enabled {
        return Decision::Skip(SkipReason::AutoDisabled);
    }
    let Some(temperature) = snap.sensor.temperature else {
        return Decision::Skip(SkipReason::NoTemperature);
    };
    let Some(soil) = snap.sensor.soil_moisture_percent else {
        return Decision::Skip(SkipReason::NoSoilReading);
    };

    // Soil percent: lower is drier.
    let too_hot = temperature > settings.temp_threshold_c;
    let too_dry = i32::from(soil) < settings.soil_dry_threshold_percent;

    if !(too_hot || too_dry) {
        Decision::Idle
    } else if snap.weather.combined_rain() {
        Decision::Hold
    } else {
        Decision::Water {
            seconds: settings.pump_run_seconds,
        }
    }
}

/// Result of one scheduler tick.
#[derive(Debug, PartialEq)]
pub struct Tick {
    pub decision: Decision,
    pub outcome: CycleOutcome,
    /// Extra wait before the next evaluation.
    pub pause: Option<Duration>,
}

pub struct Scheduler {
    store: Store,
    pump: Arc<dyn Pump>,
    safety_margin: Duration,
}

impl Scheduler {
    pub fn new(store: Store, pump: Arc<dyn Pump>, safety_margin: Duration) -> Self {
        Self {
            store,
            pump,
            safety_margin,
        }
    }

    /// Run the scheduler loop forever. Intended to be `tokio::spawn`-ed from main.
    pub async fn run(self, every: Duration) {
        let mut ticker = tokio::time::interval(every);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        // Give the pollers one interval to populate the store before the
        // first decision.
        ticker.tick().await;

        info!(
            every_sec = every.as_secs(),
            margin_sec = self.safety_margin.as_secs(),
            "scheduler started"
        );

        loop {
            ticker.tick().await;

            let tick = self.tick().await;
            tick.outcome.log("scheduler");

            if let Some(pause) = tick.pause {
                debug!(pause_sec = pause.as_secs(), "scheduler: holding off while pump runs");
                tokio::time::sleep(pause).await;
                ticker.reset();
            }
        }
    }

    /// Evaluate once and act on the decision.
    pub async fn tick(&self) -> Tick {
        let snap = self.store.snapshot().await;
        let decision = decide(&snap);

        let (outcome, pause) = match decision {
            Decision::Skip(reason) => {
                debug!(?reason, "scheduler: skipping");
                (CycleOutcome::Ok, None)
            }
            Decision::Idle => (CycleOutcome::Ok, None),
            Decision::Hold => {
                info!(
                    rain_now = snap.weather.currently_raining,
                    rain_next_24h = snap.weather.rain_expected_next_24h,
                    "scheduler: watering needed but rain expected, holding"
                );
                (CycleOutcome::Ok, None)
            }
            Decision::Water { seconds } => {
                info!(
                    temperature = ?snap.sensor.temperature,
                    soil = ?snap.sensor.soil_moisture_percent,
                    seconds,
                    "scheduler: triggering pump"
                );
                let pause = Duration::from_secs(seconds as u64) + self.safety_margin;
                // A failed call may still have started the relay, so the
                // hold-off applies either way.
                let outcome = match self.pump.run(seconds).await {
                    Ok(()) => CycleOutcome::Ok,
                    Err(e) => {
                        error!(error = %e, "scheduler: pump run failed");
                        CycleOutcome::Failed(format!("pump: {e}"))
                    }
                };
                (outcome, Some(pause))
            }
        };

        Tick {
            decision,
            outcome,
            pause,
        }
    }
}

// ===========================================================================
// Tests
// ===========================================================================
