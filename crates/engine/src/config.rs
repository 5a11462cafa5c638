//! Engine-wide tuning and per-zone configuration.

use serde::{Deserialize, Serialize};

use crate::error::EngineError;

/// Length of one watering burst.
pub const DEFAULT_CYCLE_MIN: f64 = 15.0;
/// Passive soak between bursts.
pub const DEFAULT_SOAK_MIN: f64 = 30.0;
/// °F; at or below this no new watering starts.
pub const DEFAULT_FREEZE_THRESHOLD: f64 = 36.0;
/// Forecast rain (mm) at or above which new watering is skipped.
pub const DEFAULT_RAIN_THRESHOLD_MM: f64 = 3.0;
/// Initial absorption estimate for a zone with no observations (%/min).
pub const DEFAULT_ABSORPTION_RATE: f64 = 0.5;
/// Weight of a new observation in the absorption average.
pub const DEFAULT_ABSORPTION_ALPHA: f64 = 0.3;
/// Sensor reporting delay compensated by the absorption learner.
pub const DEFAULT_ABSORPTION_DELAY_MIN: f64 = 30.0;
/// Without a schedule window, sessions run at most once a day.
pub const DEFAULT_SESSION_INTERVAL_MIN: f64 = 1440.0;

fn default_crop_coefficient() -> f64 {
    1.0
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub cycle_min: f64,
    pub soak_min: f64,
    pub freeze_threshold: f64,
    pub rain_threshold_mm: f64,
    /// Forecast rain only counts toward the gate at or above this probability (%).
    pub rain_probability_min: f64,
    pub forecast_hours: u32,
    pub forecast_refresh_min: f64,
    pub absorption_delay_min: f64,
    pub absorption_alpha: f64,
    pub default_absorption_rate: f64,
    /// Actuator attempts per command within one tick.
    pub actuation_attempts: u32,
    /// Consecutive ticks without a moisture reading before an active zone aborts.
    pub sensor_fault_ticks: u32,
    /// Under an unbounded schedule, minimum time from the end of one session
    /// to the start of the next.
    pub session_interval_min: f64,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            cycle_min: DEFAULT_CYCLE_MIN,
            soak_min: DEFAULT_SOAK_MIN,
            freeze_threshold: DEFAULT_FREEZE_THRESHOLD,
            rain_threshold_mm: DEFAULT_RAIN_THRESHOLD_MM,
            rain_probability_min: 0.0,
            forecast_hours: 24,
            forecast_refresh_min: 60.0,
            absorption_delay_min: DEFAULT_ABSORPTION_DELAY_MIN,
            absorption_alpha: DEFAULT_ABSORPTION_ALPHA,
            default_absorption_rate: DEFAULT_ABSORPTION_RATE,
            actuation_attempts: 3,
            sensor_fault_ticks: 15,
            session_interval_min: DEFAULT_SESSION_INTERVAL_MIN,
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        let positive = [
            ("cycle_min", self.cycle_min),
            ("soak_min", self.soak_min),
            ("forecast_refresh_min", self.forecast_refresh_min),
            ("absorption_delay_min", self.absorption_delay_min),
            ("default_absorption_rate", self.default_absorption_rate),
        ];
        for (name, value) in positive {
            if !(value.is_finite() && value > 0.0) {
                return Err(invalid(format!("{name} must be positive, got {value}")));
            }
        }
        if !(self.absorption_alpha > 0.0 && self.absorption_alpha <= 1.0) {
            return Err(invalid(format!(
                "absorption_alpha must be in (0, 1], got {}",
                self.absorption_alpha
            )));
        }
        if !(0.0..=100.0).contains(&self.rain_probability_min) {
            return Err(invalid(format!(
                "rain_probability_min {} out of range [0, 100]",
                self.rain_probability_min
            )));
        }
        if !(self.rain_threshold_mm.is_finite() && self.rain_threshold_mm > 0.0) {
            return Err(invalid(format!(
                "rain_threshold_mm must be positive, got {}",
                self.rain_threshold_mm
            )));
        }
        if !self.freeze_threshold.is_finite() {
            return Err(invalid("freeze_threshold must be finite".to_string()));
        }
        if self.forecast_hours == 0 {
            return Err(invalid("forecast_hours must be positive".to_string()));
        }
        if self.actuation_attempts == 0 {
            return Err(invalid("actuation_attempts must be at least 1".to_string()));
        }
        // The delayed reading of a session's last cycle must land before the
        // next session plans from it.
        if !(self.session_interval_min.is_finite() && self.session_interval_min >= self.absorption_delay_min) {
            return Err(invalid(format!(
                "session_interval_min ({}) must be at least absorption_delay_min ({})",
                self.session_interval_min, self.absorption_delay_min
            )));
        }
        Ok(())
    }
}

/// One irrigation zone. The id doubles as the capability reference: the
/// host resolves switch, moisture and temperature devices from it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneConfig {
    pub zone_id: String,
    pub name: String,
    /// Moisture (%) at or below which the zone asks for water.
    pub min_moisture: f64,
    /// Target moisture (%).
    pub max_moisture: f64,
    /// Hard ceiling on watering time per session.
    pub max_duration_min: f64,
    /// Multiplies reference ET for this zone's planting.
    #[serde(default = "default_crop_coefficient")]
    pub crop_coefficient: f64,
}

impl ZoneConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        let ctx = &self.zone_id;
        if self.zone_id.trim().is_empty() {
            return Err(invalid("zone_id is empty".to_string()));
        }
        if !(0.0..=100.0).contains(&self.min_moisture) || !(0.0..=100.0).contains(&self.max_moisture) {
            return Err(invalid(format!("zone '{ctx}': moisture bounds must be within [0, 100]")));
        }
        if self.max_moisture <= self.min_moisture {
            return Err(invalid(format!(
                "zone '{ctx}': max_moisture ({}) must be greater than min_moisture ({})",
                self.max_moisture, self.min_moisture
            )));
        }
        if !(self.max_duration_min.is_finite() && self.max_duration_min > 0.0) {
            return Err(invalid(format!(
                "zone '{ctx}': max_duration_min must be positive, got {}",
                self.max_duration_min
            )));
        }
        if !(self.crop_coefficient.is_finite() && self.crop_coefficient > 0.0) {
            return Err(invalid(format!(
                "zone '{ctx}': crop_coefficient must be positive, got {}",
                self.crop_coefficient
            )));
        }
        Ok(())
    }
}

fn invalid(reason: String) -> EngineError {
    EngineError::InvalidConfig { reason }
}
