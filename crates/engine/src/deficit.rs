//! Per-zone water deficit driven by evapotranspiration and rainfall.
//!
//! ```text
//!   deficit += ET(temp, humidity) * crop_coefficient * elapsed_days
//!   deficit -= rainfall_mm
//! ```
//!
//! Nothing is clamped. A negative deficit is a surplus and suppresses
//! watering requests until it climbs back above zero.

use std::collections::HashMap;

use time::OffsetDateTime;
use tracing::trace;

use crate::config::ZoneConfig;
use crate::weather::WeatherSnapshot;

/// Reference ET at 20 °C and 0 % humidity.
const BASE_ET_MM_PER_DAY: f64 = 5.0;
const TEMP_SENSITIVITY: f64 = 0.045;
const HUMIDITY_DAMPING: f64 = 0.5;
/// Moisture percent to millimetres of water.
pub const MM_PER_MOISTURE_PERCENT: f64 = 1.0;

fn fahrenheit_to_celsius(f: f64) -> f64 {
    (f - 32.0) * 5.0 / 9.0
}

/// Simplified reference evapotranspiration in mm/day. Rises with
/// temperature, falls with humidity. Missing humidity counts as 50 %.
pub fn reference_et_mm_per_day(temperature_f: f64, humidity: Option<f64>) -> f64 {
    let temp_c = fahrenheit_to_celsius(temperature_f);
    let rh = humidity.unwrap_or(50.0).clamp(0.0, 100.0);
    BASE_ET_MM_PER_DAY * (TEMP_SENSITIVITY * (temp_c - 20.0)).exp() * (1.0 - HUMIDITY_DAMPING * rh / 100.0)
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeficitRecord {
    pub deficit_mm: f64,
    pub last_update: Option<OffsetDateTime>,
    pub et_today_mm: f64,
    pub rain_today_mm: f64,
}

impl DeficitRecord {
    fn new(deficit_mm: f64) -> Self {
        Self {
            deficit_mm,
            last_update: None,
            et_today_mm: 0.0,
            rain_today_mm: 0.0,
        }
    }
}

#[derive(Debug, Clone, Default)]
pub struct MoistureDeficitTracker {
    records: HashMap<String, DeficitRecord>,
}

impl MoistureDeficitTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Applies ET since the zone's last update and subtracts `rainfall_mm`.
    /// Without weather, or on the zone's first update, ET is zero.
    pub fn update(
        &mut self,
        zone: &ZoneConfig,
        weather: Option<&WeatherSnapshot>,
        rainfall_mm: f64,
        now: OffsetDateTime,
    ) -> f64 {
        let rec = self
            .records
            .entry(zone.zone_id.clone())
            .or_insert_with(|| DeficitRecord::new(0.0));

        if let Some(prev) = rec.last_update {
            if prev.date() != now.date() {
                rec.et_today_mm = 0.0;
                rec.rain_today_mm = 0.0;
            }
        }

        let elapsed_days = match rec.last_update {
            Some(prev) if now > prev => (now - prev).as_seconds_f64() / 86_400.0,
            _ => 0.0,
        };
        let et = match weather.and_then(|w| w.temperature.map(|t| (t, w.humidity))) {
            Some((t, h)) => reference_et_mm_per_day(t, h) * zone.crop_coefficient * elapsed_days,
            None => 0.0,
        };
        let rain = if rainfall_mm.is_finite() && rainfall_mm > 0.0 {
            rainfall_mm
        } else {
            0.0
        };

        rec.deficit_mm += et - rain;
        rec.et_today_mm += et;
        rec.rain_today_mm += rain;
        rec.last_update = Some(now);
        trace!(zone = %zone.zone_id, et, rain, deficit = rec.deficit_mm, "deficit updated");
        rec.deficit_mm
    }

    /// Credits an observed moisture rise from irrigation against the deficit.
    /// Irrigation can bring a zone back to target but never into surplus;
    /// only rain does that.
    pub fn credit_irrigation(&mut self, zone_id: &str, rise_percent: f64) {
        if !(rise_percent.is_finite() && rise_percent > 0.0) {
            return;
        }
        if let Some(rec) = self.records.get_mut(zone_id) {
            if rec.deficit_mm > 0.0 {
                rec.deficit_mm = (rec.deficit_mm - rise_percent * MM_PER_MOISTURE_PERCENT).max(0.0);
            }
        }
    }

    pub fn deficit(&self, zone_id: &str) -> f64 {
        self.records.get(zone_id).map_or(0.0, |r| r.deficit_mm)
    }

    pub fn record(&self, zone_id: &str) -> Option<&DeficitRecord> {
        self.records.get(zone_id)
    }

    /// Seeds a zone from persisted state. ET accrual restarts at the next update.
    pub fn restore(&mut self, zone_id: &str, deficit_mm: f64) {
        let value = if deficit_mm.is_finite() { deficit_mm } else { 0.0 };
        self.records.insert(zone_id.to_string(), DeficitRecord::new(value));
    }

    pub fn remove(&mut self, zone_id: &str) {
        self.records.remove(zone_id);
    }

    pub fn reset(&mut self) {
        self.records.clear();
    }
}
