//! Forecast-window analysis.
//!
//! Given forecast points and the current instant, decide whether rain is
//! expected in `[now, now + 24h)` and list the local times that say so.
//! A point indicates rain when its precipitation amount is positive; only
//! when the amount is missing or zero does its description get a look.

use time::macros::format_description;
use time::{Duration, OffsetDateTime, UtcOffset};

/// Width of the look-ahead window.
pub const WINDOW: Duration = Duration::hours(24);

/// Description fragments that count as rain (matched case-insensitively).
pub const RAIN_KEYWORDS: [&str; 4] = ["rain", "shower", "drizzle", "thunder"];

/// One point from the provider's forecast.
#[derive(Debug, Clone, PartialEq)]
pub struct ForecastPoint {
    pub timestamp: OffsetDateTime,
    pub precipitation_mm: Option<f64>,
    pub description: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ForecastSample {
    pub timestamp: OffsetDateTime,
    pub rain_indicated: bool,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RainOutlook {
    pub rain_expected: bool,
    /// Local `YYYY-MM-DD HH:MM` strings, oldest first.
    pub rain_times: Vec<String>,
}

pub fn mentions_rain(text: &str) -> bool {
    let text = text.to_lowercase();
    RAIN_KEYWORDS.iter().any(|k| text.contains(k))
}

pub fn rain_indicated(point: &ForecastPoint) -> bool {
    if point.precipitation_mm.is_some_and(|mm| mm > 0.0) {
        return true;
    }
    point.description.as_deref().is_some_and(mentions_rain)
}

/// Samples inside `[now, now + WINDOW)`, in chronological order.
pub fn window_samples(points: &[ForecastPoint], now: OffsetDateTime) -> Vec<ForecastSample> {
    let end = now + WINDOW;
    let mut samples: Vec<ForecastSample> = points
        .iter()
        .filter(|p| p.timestamp >= now && p.timestamp < end)
        .map(|p| ForecastSample {
            timestamp: p.timestamp,
            rain_indicated: rain_indicated(p),
        })
        .collect();
    samples.sort_by_key(|s| s.timestamp);
    samples
}

pub fn analyze(points: &[ForecastPoint], now: OffsetDateTime, display: UtcOffset) -> RainOutlook {
    let rain_times: Vec<String> = window_samples(points, now)
        .into_iter()
        .filter(|s| s.rain_indicated)
        .map(|s| local_time(s.timestamp, display))
        .collect();

    RainOutlook {
        rain_expected: !rain_times.is_empty(),
        rain_times,
    }
}

fn local_time(ts: OffsetDateTime, offset: UtcOffset) -> String {
    let fmt = format_description!("[year]-[month]-[day] [hour]:[minute]");
    ts.to_offset(offset)
        .format(fmt)
        .unwrap_or_else(|_| ts.to_string())
}

// ===========================================================================
// Tests
// ===========================================================================
