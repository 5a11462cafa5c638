//! Capability traits the host implements and the engine consumes.
//!
//! ```text
//!   host adapter ──▶ capability trait ──▶ Coordinator
//! ```
//!
//! Reads are fast, possibly stale snapshots. Nothing here may block the tick.

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};

use crate::error::CapabilityError;

/// Switches a zone's valve.
pub trait Actuator: Send {
    fn set(&mut self, zone_id: &str, on: bool) -> Result<(), CapabilityError>;
}

/// Per-zone soil readings. `None` means unavailable.
pub trait ZoneSensors: Send {
    /// Soil moisture in percent.
    fn moisture(&self, zone_id: &str) -> Option<f64>;
    /// Local temperature in °F.
    fn temperature(&self, zone_id: &str) -> Option<f64>;
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CurrentConditions {
    /// °F.
    pub temperature: Option<f64>,
    /// Relative humidity, percent.
    pub humidity: Option<f64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct ForecastSummary {
    /// Percent.
    pub rain_probability: f64,
    pub rain_amount_mm: f64,
    /// Lowest forecast temperature over the horizon, °F.
    pub min_temperature: Option<f64>,
}

pub trait WeatherProvider: Send {
    fn current(&self) -> Result<CurrentConditions, CapabilityError>;
    fn forecast(&self, hours: u32) -> Result<ForecastSummary, CapabilityError>;
}

/// Optional tipping-bucket style rain gauge.
pub trait RainSensor: Send {
    /// Millimetres measured since `since`.
    fn measured_since(&self, since: OffsetDateTime) -> Result<f64, CapabilityError>;
}

pub trait ScheduleProvider: Send {
    fn is_within_window(&self, now: OffsetDateTime) -> bool;

    /// Time left before the window closes. `None` means unbounded.
    fn remaining(&self, _now: OffsetDateTime) -> Option<Duration> {
        None
    }
}

/// Schedule used when no window is configured: always open, no budget limit.
#[derive(Debug, Clone, Copy, Default)]
pub struct AlwaysOpen;

impl ScheduleProvider for AlwaysOpen {
    fn is_within_window(&self, _now: OffsetDateTime) -> bool {
        true
    }
}

/// Everything the coordinator needs from its host.
pub struct Capabilities {
    pub actuator: Box<dyn Actuator>,
    pub sensors: Box<dyn ZoneSensors>,
    pub weather: Option<Box<dyn WeatherProvider>>,
    pub rain: Option<Box<dyn RainSensor>>,
    pub schedule: Box<dyn ScheduleProvider>,
}
