//! Error types for the three external seams: sensors, weather, pump.

use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum SensorError {
    #[error("no response from sensor")]
    NoResponse,

    #[error("checksum mismatch (expected {expected:#04x}, got {actual:#04x})")]
    Checksum { expected: u8, actual: u8 },

    #[error("read timed out after {0:?}")]
    Timeout(Duration),

    #[error("gpio: {0}")]
    Gpio(String),
}

#[derive(Debug, thiserror::Error)]
pub enum WeatherError {
    #[error("weather request failed: {0}")]
    Request(#[from] reqwest::Error),

    #[error("weather service returned {status}: {body}")]
    Status {
        status: reqwest::StatusCode,
        body: String,
    },

    #[error("unexpected weather payload: {0}")]
    Decode(#[from] serde_json::Error),
}

#[derive(Debug, thiserror::Error)]
pub enum PumpError {
    #[error("pump unreachable: {0}")]
    Unreachable(#[from] reqwest::Error),

    #[error("pump rejected request with {status}: {body}")]
    Rejected {
        status: reqwest::StatusCode,
        body: String,
    },
}
