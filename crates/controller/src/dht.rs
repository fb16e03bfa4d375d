//! DHT11 temperature/humidity sensor.
//!
//! The sensor answers a host start pulse with a 40-bit frame:
//! humidity (int, dec), temperature (int, dec), checksum. Each bit is a
//! ~50 µs low followed by a high whose width encodes the value
//! (~26 µs = 0, ~70 µs = 1). Frame decoding is plain arithmetic and is always
//! compiled; the bit-banged driver needs the `gpio` feature.

use crate::error::SensorError;

/// One temperature/humidity pair. Both come from the same frame.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Climate {
    pub temperature: f64,
    pub humidity: f64,
}

/// Decode a raw 5-byte frame, verifying the checksum.
#[cfg_attr(not(feature = "gpio"), allow(dead_code))]
pub fn decode_frame(frame: &[u8; 5]) -> Result<Climate, SensorError> {
    // An all-zero frame means the line never left LOW.
    if frame.iter().all(|b| *b == 0) {
        return Err(SensorError::NoResponse);
    }

    let sum = frame[..4].iter().fold(0u8, |acc, b| acc.wrapping_add(*b));
    if sum != frame[4] {
        return Err(SensorError::Checksum {
            expected: sum,
            actual: frame[4],
        });
    }

    let humidity = frame[0] as f64 + frame[1] as f64 / 10.0;
    let mut temperature = frame[2] as f64 + (frame[3] & 0x7f) as f64 / 10.0;
    if frame[3] & 0x80 != 0 {
        temperature = -temperature;
    }

    Ok(Climate {
        temperature,
        humidity,
    })
}

// ---------------------------------------------------------------------------
// Bit-banged driver (production — requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
mod driver {
    use super::{decode_frame, Climate};
    use crate::error::SensorError;
    use anyhow::{Context, Result};
    use rppal::gpio::{Gpio, IoPin, Level, Mode};
    use std::sync::Mutex;
    use std::thread;
    use std::time::{Duration, Instant};

    /// Host start pulse; the datasheet asks for at least 18 ms.
    const START_LOW: Duration = Duration::from_millis(18);
    /// High pulses longer than this are a 1 bit.
    const BIT_ONE_THRESHOLD: Duration = Duration::from_micros(40);
    /// Longest any single level lasts in a healthy frame, with margin.
    const EDGE_TIMEOUT: Duration = Duration::from_micros(200);

    pub(crate) struct Dht11 {
        pin: Mutex<IoPin>,
    }

    impl Dht11 {
        pub(crate) fn new(gpio: &Gpio, bcm_pin: u8) -> Result<Self> {
            let mut pin = gpio
                .get(bcm_pin)
                .with_context(|| format!("dht11: cannot claim gpio {bcm_pin}"))?
                .into_io(Mode::Output);
            pin.set_high(); // idle state of the bus
            Ok(Self {
                pin: Mutex::new(pin),
            })
        }

        pub(crate) fn read(&self) -> Result<Climate, SensorError> {
            let mut pin = self
                .pin
                .lock()
                .map_err(|_| SensorError::Gpio("dht11 pin lock poisoned".to_string()))?;
            let frame = read_frame(&mut pin)?;
            decode_frame(&frame)
        }
    }

    fn read_frame(pin: &mut IoPin) -> Result<[u8; 5], SensorError> {
        pin.set_mode(Mode::Output);
        pin.set_low();
        thread::sleep(START_LOW);
        pin.set_high();
        pin.set_mode(Mode::Input);

        // Response: ~80 µs LOW, ~80 µs HIGH, then the first bit's LOW.
        wait_for(pin, Level::Low)?;
        wait_for(pin, Level::High)?;
        wait_for(pin, Level::Low)?;

        let mut frame = [0u8; 5];
        for i in 0..40 {
            wait_for(pin, Level::High)?;
            let rise = Instant::now();
            wait_for(pin, Level::Low)?;
            frame[i / 8] <<= 1;
            if rise.elapsed() > BIT_ONE_THRESHOLD {
                frame[i / 8] |= 1;
            }
        }

        pin.set_mode(Mode::Output);
        pin.set_high();
        Ok(frame)
    }

    fn wait_for(pin: &IoPin, level: Level) -> Result<(), SensorError> {
        let start = Instant::now();
        while pin.read() != level {
            if start.elapsed() > EDGE_TIMEOUT {
                return Err(SensorError::NoResponse);
            }
        }
        Ok(())
    }
}

#[cfg(feature = "gpio")]
pub(crate) use driver::Dht11;

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    fn with_checksum(b: [u8; 4]) -> [u8; 5] {
        let sum = b.iter().fold(0u8, |acc, x| acc.wrapping_add(*x));
        [b[0], b[1], b[2], b[3], sum]
    }

    #[test]
    fn decodes_typical_frame() {
        let c = decode_frame(&with_checksum([55, 0, 24, 5])).unwrap();
        assert_eq!(c.humidity, 55.0);
        assert!((c.temperature - 24.5).abs() < 1e-9);
    }

    #[test]
    fn decodes_negative_temperature() {
        let c = decode_frame(&with_checksum([40, 0, 3, 0x80 | 2])).unwrap();
        assert!((c.temperature + 3.2).abs() < 1e-9);
    }

    #[test]
    fn checksum_wraps_around() {
        let frame = with_checksum([200, 0, 100, 0]); // 300 mod 256
        assert_eq!(frame[4], 44);
        assert!(decode_frame(&frame).is_ok());
    }

    #[test]
    fn bad_checksum_rejected() {
        let mut frame = with_checksum([55, 0, 24, 5]);
        frame[4] ^= 0xff;
        assert!(matches!(
            decode_frame(&frame),
            Err(SensorError::Checksum { .. })
        ));
    }

    #[test]
    fn all_zero_frame_is_no_response() {
        assert!(matches!(
            decode_frame(&[0; 5]),
            Err(SensorError::NoResponse)
        ));
    }
}
