//! Pump relay on a single GPIO line. The `gpio` feature gates the real rppal
//! driver; without it, a mock records the line state and logs changes.

use anyhow::Result;
use tracing::info;

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

// ---------------------------------------------------------------------------
// Real relay (production, requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub(crate) struct Relay {
    pin: OutputPin,
    active_low: bool,
}

#[cfg(feature = "gpio")]
impl Relay {
    pub(crate) fn new(bcm_pin: u8, active_low: bool) -> Result<Self> {
        let pin = Gpio::new()?.get(bcm_pin)?.into_output();
        let mut relay = Self { pin, active_low };
        // Fail-safe: pump off at startup
        relay.set(false);
        info!(bcm_pin, active_low, "relay ready");
        Ok(relay)
    }

    pub(crate) fn set(&mut self, on: bool) {
        // active-low: LOW = ON
        if on != self.active_low {
            self.pin.set_high();
        } else {
            self.pin.set_low();
        }
        info!("pump {}", if on { "ON" } else { "OFF" });
    }
}

// ---------------------------------------------------------------------------
// Mock relay (development, no hardware)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub(crate) struct Relay {
    pub(super) on: bool,
    pub(super) switches: u32,
}

#[cfg(not(feature = "gpio"))]
impl Relay {
    pub(crate) fn new(bcm_pin: u8, _active_low: bool) -> Result<Self> {
        info!(bcm_pin, "[mock-gpio] relay initialised (no hardware)");
        Ok(Self {
            on: false,
            switches: 0,
        })
    }

    pub(crate) fn set(&mut self, on: bool) {
        if self.on != on {
            self.switches += 1;
        }
        self.on = on;
        info!("[mock-gpio] pump {}", if on { "ON" } else { "OFF" });
    }
}

// ===========================================================================
// Tests
// ===========================================================================
