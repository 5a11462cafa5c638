//! Valve control via GPIO. The `gpio` feature gates the real rppal driver;
//! without it, a mock implementation logs state changes.
//!
//! Both variants implement the engine's [`Actuator`]; an unknown zone is an
//! actuation failure rather than a silent no-op.

use anyhow::Result;
use sprinkler_engine::{Actuator, CapabilityError};
use std::collections::HashMap;
use tracing::info;

#[cfg(feature = "gpio")]
use rppal::gpio::{Gpio, OutputPin};

fn on_off(on: bool) -> &'static str {
    if on {
        "ON"
    } else {
        "OFF"
    }
}

// ---------------------------------------------------------------------------
// Real GPIO valve board (production, requires rppal + Raspberry Pi hardware)
// ---------------------------------------------------------------------------
#[cfg(feature = "gpio")]
pub(crate) struct ValveBoard {
    pins: HashMap<String, OutputPin>, // zone_id -> GPIO pin
    active_low: bool,                 // many relay boards are active-low
}

#[cfg(feature = "gpio")]
impl ValveBoard {
    pub(crate) fn new(zone_to_gpio: &[(String, u8)], active_low: bool) -> Result<Self> {
        let gpio = Gpio::new()?;
        let mut pins = HashMap::new();

        for (zone_id, pin_num) in zone_to_gpio {
            let mut pin = gpio.get(*pin_num)?.into_output();

            // Fail-safe: ensure "OFF" at startup
            if active_low {
                pin.set_high();
            } else {
                pin.set_low();
            }

            pins.insert(zone_id.clone(), pin);
        }

        Ok(Self { pins, active_low })
    }

    pub(crate) fn all_off(&mut self) {
        let keys: Vec<String> = self.pins.keys().cloned().collect();
        for k in keys {
            let _ = self.set(&k, false);
        }
    }
}

#[cfg(feature = "gpio")]
impl Actuator for ValveBoard {
    fn set(&mut self, zone_id: &str, on: bool) -> Result<(), CapabilityError> {
        let pin = self
            .pins
            .get_mut(zone_id)
            .ok_or_else(|| CapabilityError::new(format!("unknown zone_id '{zone_id}'")))?;
        // active-low relay: LOW = ON, HIGH = OFF
        if on != self.active_low {
            pin.set_high();
        } else {
            pin.set_low();
        }
        info!(zone = %zone_id, state = on_off(on), "valve set");
        Ok(())
    }
}

// ---------------------------------------------------------------------------
// Mock valve board (development, no hardware)
// ---------------------------------------------------------------------------
#[cfg(not(feature = "gpio"))]
pub(crate) struct ValveBoard {
    pub(super) zones: HashMap<String, bool>, // zone_id -> on/off state
}

#[cfg(not(feature = "gpio"))]
impl ValveBoard {
    pub(crate) fn new(zone_to_gpio: &[(String, u8)], _active_low: bool) -> Result<Self> {
        let mut zones = HashMap::new();
        for (zone_id, pin_num) in zone_to_gpio {
            info!(zone = %zone_id, gpio = pin_num, "[mock-gpio] registered zone (not wired)");
            zones.insert(zone_id.clone(), false);
        }
        info!("[mock-gpio] valve board initialised (no hardware)");
        Ok(Self { zones })
    }

    pub(crate) fn all_off(&mut self) {
        for state in self.zones.values_mut() {
            *state = false;
        }
        info!("[mock-gpio] all valves OFF");
    }
}

#[cfg(not(feature = "gpio"))]
impl Actuator for ValveBoard {
    fn set(&mut self, zone_id: &str, on: bool) -> Result<(), CapabilityError> {
        let state = self
            .zones
            .get_mut(zone_id)
            .ok_or_else(|| CapabilityError::new(format!("unknown zone_id '{zone_id}'")))?;
        *state = on;
        info!(zone = %zone_id, state = on_off(on), "[mock-gpio] valve set");
        Ok(())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
