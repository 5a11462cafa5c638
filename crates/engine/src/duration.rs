//! Watering time needed to bring a zone from its current moisture to target.

use serde::{Deserialize, Serialize};

use crate::absorption::AbsorptionLearner;
use crate::config::ZoneConfig;

/// Extra time at full saturation. Infiltration slows as soil fills up.
pub const SATURATION_GAIN: f64 = 0.5;

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct DurationRequest {
    /// Prediction from the learned rate alone.
    pub base_min: f64,
    /// After saturation correction and the zone's cap.
    pub duration_min: f64,
    pub cycles: u32,
}

impl DurationRequest {
    pub fn none() -> Self {
        Self::default()
    }

    pub fn is_empty(&self) -> bool {
        self.cycles == 0
    }
}

#[derive(Debug, Clone, Copy)]
pub struct DurationCalculator {
    cycle_min: f64,
}

impl DurationCalculator {
    pub fn new(cycle_min: f64) -> Self {
        Self { cycle_min }
    }

    pub fn compute(
        &self,
        zone: &ZoneConfig,
        learner: &AbsorptionLearner,
        current_moisture: f64,
        deficit_mm: f64,
        gate_ok: bool,
    ) -> DurationRequest {
        if !gate_ok || !current_moisture.is_finite() || current_moisture >= zone.max_moisture {
            return DurationRequest::none();
        }
        if deficit_mm < 0.0 {
            return DurationRequest::none();
        }

        let rise = zone.max_moisture - current_moisture;
        let base = learner.predict(rise, f64::INFINITY);
        let saturation = 1.0 + SATURATION_GAIN * (current_moisture / zone.max_moisture).clamp(0.0, 1.0);
        let duration = (base * saturation).min(zone.max_duration_min);
        if duration <= 0.0 {
            return DurationRequest::none();
        }
        // Tolerance keeps an exact multiple from rounding up to an extra cycle.
        let cycles = ((duration / self.cycle_min - 1e-9).ceil() as u32).max(1);
        DurationRequest {
            base_min: base,
            duration_min: duration,
            cycles,
        }
    }
}
