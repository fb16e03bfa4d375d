//! Pump actuator: a tiny HTTP service that runs the relay for a requested
//! number of seconds and replies when the run is over.

mod relay;

use anyhow::{Context, Result};
use axum::extract::{Query, State};
use axum::http::StatusCode;
use axum::response::Json;
use axum::routing::get;
use axum::Router;
use serde::Deserialize;
use serde_json::{json, Value};
use std::{env, net::SocketAddr, sync::Arc, time::Duration};
use tokio::net::TcpListener;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use relay::Relay;

/// Longest run the service accepts, in seconds.
const MAX_RUN_SECONDS: i64 = 20;

type SharedRelay = Arc<Mutex<Relay>>;

#[derive(Deserialize)]
struct WaterQuery {
    seconds: Option<String>,
}

fn parse_seconds(raw: Option<&str>) -> Result<u64, &'static str> {
    let raw = raw.map(str::trim).filter(|s| !s.is_empty());
    let Some(raw) = raw else {
        return Err("missing seconds parameter");
    };
    match raw.parse::<i64>() {
        Ok(n) if (1..=MAX_RUN_SECONDS).contains(&n) => Ok(n as u64),
        _ => Err("invalid seconds"),
    }
}

/// Energise the relay for `seconds`. The caller already holds the relay, so
/// the run has started; it lives on its own task so a dropped request never
/// leaves the pump on.
async fn run_pump(mut relay: OwnedMutexGuard<Relay>, seconds: u64) -> Result<()> {
    tokio::spawn(async move {
        relay.set(true);
        tokio::time::sleep(Duration::from_secs(seconds)).await;
        relay.set(false);
    })
    .await
    .context("pump run task failed")
}

async fn water(
    State(relay): State<SharedRelay>,
    Query(q): Query<WaterQuery>,
) -> (StatusCode, Json<Value>) {
    let seconds = match parse_seconds(q.seconds.as_deref()) {
        Ok(s) => s,
        Err(msg) => {
            warn!(seconds = ?q.seconds, "rejected: {msg}");
            return (StatusCode::BAD_REQUEST, Json(json!({ "error": msg })));
        }
    };

    // One run at a time. A request that cannot start now is refused rather
    // than queued, so a caller that gives up never gets a late run.
    let Ok(relay) = relay.try_lock_owned() else {
        warn!(seconds, "rejected: pump busy");
        return (StatusCode::CONFLICT, Json(json!({ "error": "pump busy" })));
    };

    info!(seconds, "watering");
    if let Err(e) = run_pump(relay, seconds).await {
        error!(error = %e, "pump run aborted");
        return (
            StatusCode::INTERNAL_SERVER_ERROR,
            Json(json!({ "error": "pump run failed" })),
        );
    }

    (
        StatusCode::OK,
        Json(json!({ "status": "ok", "pump_seconds": seconds })),
    )
}

fn router(relay: SharedRelay) -> Router {
    Router::new().route("/water", get(water)).with_state(relay)
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let port: u16 = env_or("PUMP_PORT", 5001);
    let pin: u8 = env_or("RELAY_PIN", 27);
    // Most relay boards are active-low. If yours is active-high, set false.
    let active_low = env::var("RELAY_ACTIVE_LOW")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(true);

    let relay = Arc::new(Mutex::new(Relay::new(pin, active_low)?));

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind pump port {port}"))?;
    info!("pump service listening on http://{addr}");

    axum::serve(listener, router(relay))
        .await
        .context("pump server error")
}

// ===========================================================================
// Tests
// ===========================================================================
