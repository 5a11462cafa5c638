//! TOML config file loading and validation: engine tuning, the optional
//! weekly window, zones and the sensor channels that feed them.

use anyhow::{anyhow, bail, Context, Result};
use serde::Deserialize;
use sprinkler_engine::schedule::parse_hhmm;
use sprinkler_engine::{EngineConfig, WeeklyWindow, ZoneConfig};
use std::collections::HashSet;
use time::UtcOffset;

use crate::db::compute_moisture;

// ---------------------------------------------------------------------------
// Config file structures
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub engine: EngineConfig,
    #[serde(default)]
    pub schedule: Option<ScheduleEntry>,
    #[serde(default)]
    pub zones: Vec<ZoneEntry>,
    #[serde(default)]
    pub sensors: Vec<SensorEntry>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleEntry {
    pub days: Vec<String>,
    pub start: String,
    pub end: String,
    #[serde(default)]
    pub utc_offset_hours: i8,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ZoneEntry {
    pub zone_id: String,
    pub name: String,
    pub min_moisture: f64,
    pub max_moisture: f64,
    pub max_duration_min: f64,
    #[serde(default = "default_crop_coefficient")]
    pub crop_coefficient: f64,
    pub valve_gpio_pin: i64,
}

fn default_crop_coefficient() -> f64 {
    1.0
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SensorKind {
    #[default]
    Moisture,
    /// Reports tenths of °F.
    Temperature,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SensorEntry {
    /// Qualified "<node_id>/<channel>", e.g. "node-a/s1".
    pub sensor_id: String,
    pub node_id: String,
    pub zone_id: String,
    #[serde(default)]
    pub kind: SensorKind,
    #[serde(default)]
    pub raw_dry: Option<i64>,
    #[serde(default)]
    pub raw_wet: Option<i64>,
}

// ---------------------------------------------------------------------------
// GPIO whitelist
// ---------------------------------------------------------------------------

/// BCM GPIO pins available on the Raspberry Pi 40-pin header for general
/// use. GPIO 0-1 are reserved for the ID EEPROM and must never be used.
/// GPIO 28+ are not exposed on the standard header.
const VALID_GPIO_PINS: &[i64] = &[
    2, 3, 4, 5, 6, 7, 8, 9, 10, 11, 12, 13, 14, 15, 16, 17, 18, 19, 20, 21, 22, 23, 24, 25, 26, 27,
];

/// Maximum single-ended reading from the ADS1115 (15-bit unsigned).
const ADS1115_MAX: i64 = 32767;

// ---------------------------------------------------------------------------
// Conversions
// ---------------------------------------------------------------------------

impl ZoneEntry {
    pub fn to_zone_config(&self) -> ZoneConfig {
        ZoneConfig {
            zone_id: self.zone_id.clone(),
            name: self.name.clone(),
            min_moisture: self.min_moisture,
            max_moisture: self.max_moisture,
            max_duration_min: self.max_duration_min,
            crop_coefficient: self.crop_coefficient,
        }
    }
}

impl SensorEntry {
    /// Converts a raw channel value to the unit the engine expects
    /// (moisture percent or °F).
    pub fn convert(&self, raw: i64) -> f64 {
        match self.kind {
            SensorKind::Moisture => {
                compute_moisture(raw, self.raw_dry.unwrap_or(0), self.raw_wet.unwrap_or(0))
            }
            SensorKind::Temperature => raw as f64 / 10.0,
        }
    }
}

impl ScheduleEntry {
    pub fn to_window(&self) -> Result<WeeklyWindow> {
        let days = WeeklyWindow::days_from_names(&self.days)?;
        let start = parse_hhmm(&self.start)?;
        let end = parse_hhmm(&self.end)?;
        let offset = UtcOffset::from_hms(self.utc_offset_hours, 0, 0)
            .map_err(|e| anyhow!("utc_offset_hours {} out of range: {e}", self.utc_offset_hours))?;
        Ok(WeeklyWindow::new(days, start, end, offset)?)
    }
}

impl Config {
    pub fn zone_configs(&self) -> Vec<ZoneConfig> {
        self.zones.iter().map(ZoneEntry::to_zone_config).collect()
    }

    /// zone_id -> BCM pin, as the valve board wants it.
    pub fn zone_to_gpio(&self) -> Vec<(String, u8)> {
        self.zones
            .iter()
            .filter_map(|z| u8::try_from(z.valve_gpio_pin).ok().map(|p| (z.zone_id.clone(), p)))
            .collect()
    }

    pub fn window(&self) -> Result<Option<WeeklyWindow>> {
        self.schedule.as_ref().map(ScheduleEntry::to_window).transpose()
    }
}

// ---------------------------------------------------------------------------
// Validation
// ---------------------------------------------------------------------------

impl Config {
    /// Validate all config entries. Returns `Ok(())` or an error describing
    /// every violation found (not just the first one).
    pub fn validate(&self) -> Result<()> {
        let mut errors: Vec<String> = Vec::new();

        if let Err(e) = self.engine.validate() {
            errors.push(format!("engine: {e}"));
        }
        if let Some(schedule) = &self.schedule {
            if let Err(e) = schedule.to_window() {
                errors.push(format!("schedule: {e}"));
            }
        }
        self.validate_zones(&mut errors);
        self.validate_sensors(&mut errors);

        if errors.is_empty() {
            Ok(())
        } else {
            bail!(
                "config validation failed ({} error{}):\n  - {}",
                errors.len(),
                if errors.len() == 1 { "" } else { "s" },
                errors.join("\n  - ")
            );
        }
    }

    fn validate_zones(&self, errors: &mut Vec<String>) {
        let mut seen_ids: HashSet<&str> = HashSet::new();
        let mut seen_pins: HashSet<i64> = HashSet::new();

        for (i, z) in self.zones.iter().enumerate() {
            let ctx = || {
                if z.zone_id.is_empty() {
                    format!("zones[{i}]")
                } else {
                    format!("zone '{}'", z.zone_id)
                }
            };

            // ── Identity ────────────────────────────────────────
            if z.zone_id.trim().is_empty() {
                errors.push(format!("{}: zone_id is empty", ctx()));
            } else if !seen_ids.insert(&z.zone_id) {
                errors.push(format!("{}: duplicate zone_id", ctx()));
            }

            if z.name.trim().is_empty() {
                errors.push(format!("{}: name is empty", ctx()));
            }

            // ── Engine-level bounds ─────────────────────────────
            if !z.zone_id.trim().is_empty() {
                if let Err(e) = z.to_zone_config().validate() {
                    errors.push(e.to_string());
                }
            }

            // ── GPIO pin whitelist ──────────────────────────────
            if !VALID_GPIO_PINS.contains(&z.valve_gpio_pin) {
                errors.push(format!(
                    "{}: valve_gpio_pin {} is not a valid BCM GPIO pin (allowed: 2-27)",
                    ctx(),
                    z.valve_gpio_pin
                ));
            } else if !seen_pins.insert(z.valve_gpio_pin) {
                errors.push(format!(
                    "{}: valve_gpio_pin {} is already used by another zone",
                    ctx(),
                    z.valve_gpio_pin
                ));
            }
        }
    }

    fn validate_sensors(&self, errors: &mut Vec<String>) {
        let zone_ids: HashSet<&str> = self.zones.iter().map(|z| z.zone_id.as_str()).collect();
        let mut seen_ids: HashSet<&str> = HashSet::new();

        for (i, s) in self.sensors.iter().enumerate() {
            let ctx = || {
                if s.sensor_id.is_empty() {
                    format!("sensors[{i}]")
                } else {
                    format!("sensor '{}'", s.sensor_id)
                }
            };

            // ── Identity ────────────────────────────────────────
            if s.sensor_id.trim().is_empty() {
                errors.push(format!("{}: sensor_id is empty", ctx()));
            } else if !seen_ids.insert(&s.sensor_id) {
                errors.push(format!("{}: duplicate sensor_id", ctx()));
            }

            if s.node_id.trim().is_empty() {
                errors.push(format!("{}: node_id is empty", ctx()));
            } else if !s.sensor_id.starts_with(&format!("{}/", s.node_id)) {
                errors.push(format!(
                    "{}: sensor_id must be qualified as '{}/<channel>'",
                    ctx(),
                    s.node_id
                ));
            }

            if s.zone_id.trim().is_empty() {
                errors.push(format!("{}: zone_id is empty", ctx()));
            } else if !zone_ids.contains(s.zone_id.as_str()) {
                errors.push(format!(
                    "{}: zone_id '{}' does not match any defined zone",
                    ctx(),
                    s.zone_id
                ));
            }

            // ── ADC calibration bounds ──────────────────────────
            if s.kind == SensorKind::Moisture {
                let (Some(dry), Some(wet)) = (s.raw_dry, s.raw_wet) else {
                    errors.push(format!(
                        "{}: moisture sensors need raw_dry and raw_wet",
                        ctx()
                    ));
                    continue;
                };
                if !(0..=ADS1115_MAX).contains(&dry) {
                    errors.push(format!(
                        "{}: raw_dry {dry} out of ADS1115 range [0, {ADS1115_MAX}]",
                        ctx()
                    ));
                }
                if !(0..=ADS1115_MAX).contains(&wet) {
                    errors.push(format!(
                        "{}: raw_wet {wet} out of ADS1115 range [0, {ADS1115_MAX}]",
                        ctx()
                    ));
                }
                if dry == wet {
                    errors.push(format!(
                        "{}: raw_dry and raw_wet are both {dry}, calibration range is zero",
                        ctx()
                    ));
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Load
// ---------------------------------------------------------------------------

/// Parse and validate TOML config text.
pub fn parse(contents: &str) -> Result<Config> {
    let config: Config = toml::from_str(contents).context("failed to parse config")?;
    config.validate()?;
    Ok(config)
}

/// Read, parse, and validate a TOML config file.
pub fn load(path: &str) -> Result<Config> {
    let contents =
        std::fs::read_to_string(path).with_context(|| format!("failed to read config: {path}"))?;
    let config = parse(&contents).with_context(|| format!("invalid config: {path}"))?;
    tracing::info!(
        zones = config.zones.len(),
        sensors = config.sensors.len(),
        windowed = config.schedule.is_some(),
        "config loaded"
    );
    Ok(config)
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;

    // -- Helper: build a valid baseline config that passes validation ------

    fn valid_zone() -> ZoneEntry {
        ZoneEntry {
            zone_id: "z1".into(),
            name: "Zone 1".into(),
            min_moisture: 20.0,
            max_moisture: 35.0,
            max_duration_min: 60.0,
            crop_coefficient: 1.0,
            valve_gpio_pin: 17,
        }
    }

    fn valid_sensor() -> SensorEntry {
        SensorEntry {
            sensor_id: "node-a/s1".into(),
            node_id: "node-a".into(),
            zone_id: "z1".into(),
            kind: SensorKind::Moisture,
            raw_dry: Some(26000),
            raw_wet: Some(12000),
        }
    }

    fn valid_config() -> Config {
        Config {
            engine: EngineConfig::default(),
            schedule: None,
            zones: vec![valid_zone()],
            sensors: vec![valid_sensor()],
        }
    }

    fn assert_validation_err(cfg: &Config, needle: &str) {
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains(needle), "expected '{needle}' in: {msg}");
    }

    // -- Parsing ------------------------------------------------------------

    #[test]
    fn parse_full_file() {
        let cfg = parse(
            r#"
            [engine]
            cycle_min = 10
            soak_min = 20

            [schedule]
            days = ["mon", "wed", "fri"]
            start = "05:00"
            end = "07:00"
            utc_offset_hours = -7

            [[zones]]
            zone_id = "front"
            name = "Front lawn"
            min_moisture = 20
            max_moisture = 35
            max_duration_min = 45
            valve_gpio_pin = 17

            [[sensors]]
            sensor_id = "node-a/s1"
            node_id = "node-a"
            zone_id = "front"
            raw_dry = 26000
            raw_wet = 12000

            [[sensors]]
            sensor_id = "node-a/t1"
            node_id = "node-a"
            zone_id = "front"
            kind = "temperature"
            "#,
        )
        .unwrap();

        assert_eq!(cfg.engine.cycle_min, 10.0);
        assert_eq!(cfg.engine.freeze_threshold, EngineConfig::default().freeze_threshold);
        assert!(cfg.window().unwrap().is_some());
        assert_eq!(cfg.zones[0].crop_coefficient, 1.0);
        assert_eq!(cfg.zone_to_gpio(), vec![("front".to_string(), 17)]);
        assert_eq!(cfg.sensors[1].kind, SensorKind::Temperature);
    }

    #[test]
    fn parse_empty_file_uses_defaults() {
        let cfg = parse("").unwrap();
        assert!(cfg.zones.is_empty());
        assert!(cfg.window().unwrap().is_none());
        assert_eq!(cfg.engine, EngineConfig::default());
    }

    #[test]
    fn valid_config_passes() {
        valid_config().validate().unwrap();
    }

    // -- Sensor conversion --------------------------------------------------

    #[test]
    fn moisture_sensor_converts_to_percent() {
        let s = valid_sensor();
        assert!((s.convert(19000) - 50.0).abs() < 1e-9);
    }

    #[test]
    fn temperature_sensor_reports_tenths() {
        let s = SensorEntry {
            kind: SensorKind::Temperature,
            raw_dry: None,
            raw_wet: None,
            ..valid_sensor()
        };
        assert_eq!(s.convert(345), 34.5);
    }

    // -- Engine + schedule --------------------------------------------------

    #[test]
    fn engine_section_validated() {
        let mut cfg = valid_config();
        cfg.engine.cycle_min = 0.0;
        assert_validation_err(&cfg, "engine: invalid configuration");
    }

    #[test]
    fn schedule_bad_time_rejected() {
        let mut cfg = valid_config();
        cfg.schedule = Some(ScheduleEntry {
            days: vec!["mon".into()],
            start: "25:00".into(),
            end: "06:00".into(),
            utc_offset_hours: 0,
        });
        assert_validation_err(&cfg, "invalid time '25:00'");
    }

    #[test]
    fn schedule_unknown_day_rejected() {
        let mut cfg = valid_config();
        cfg.schedule = Some(ScheduleEntry {
            days: vec!["someday".into()],
            start: "05:00".into(),
            end: "06:00".into(),
            utc_offset_hours: 0,
        });
        assert_validation_err(&cfg, "unknown weekday");
    }

    #[test]
    fn schedule_offset_out_of_range_rejected() {
        let mut cfg = valid_config();
        cfg.schedule = Some(ScheduleEntry {
            days: vec!["mon".into()],
            start: "05:00".into(),
            end: "06:00".into(),
            utc_offset_hours: 30,
        });
        assert_validation_err(&cfg, "utc_offset_hours 30 out of range");
    }

    // -- Zone: identity -----------------------------------------------------

    #[test]
    fn zone_empty_id_rejected() {
        let mut cfg = valid_config();
        cfg.zones[0].zone_id = "".into();
        assert_validation_err(&cfg, "zone_id is empty");
    }

    #[test]
    fn zone_duplicate_id_rejected() {
        let mut cfg = valid_config();
        cfg.zones.push(ZoneEntry {
            valve_gpio_pin: 27,
            ..valid_zone()
        });
        assert_validation_err(&cfg, "duplicate zone_id");
    }

    #[test]
    fn zone_empty_name_rejected() {
        let mut cfg = valid_config();
        cfg.zones[0].name = "  ".into();
        assert_validation_err(&cfg, "name is empty");
    }

    // -- Zone: moisture and duration bounds ----------------------------------

    #[test]
    fn zone_max_below_min_rejected() {
        let mut cfg = valid_config();
        cfg.zones[0].max_moisture = 15.0;
        assert_validation_err(&cfg, "max_moisture (15) must be greater than min_moisture (20)");
    }

    #[test]
    fn zone_moisture_out_of_range_rejected() {
        let mut cfg = valid_config();
        cfg.zones[0].max_moisture = 120.0;
        assert_validation_err(&cfg, "within [0, 100]");
    }

    #[test]
    fn zone_zero_duration_rejected() {
        let mut cfg = valid_config();
        cfg.zones[0].max_duration_min = 0.0;
        assert_validation_err(&cfg, "max_duration_min must be positive");
    }

    // -- Zone: GPIO whitelist ---------------------------------------------

    #[test]
    fn zone_gpio_pin_0_rejected() {
        let mut cfg = valid_config();
        cfg.zones[0].valve_gpio_pin = 0;
        assert_validation_err(&cfg, "not a valid BCM GPIO pin");
    }

    #[test]
    fn zone_gpio_pin_28_rejected() {
        let mut cfg = valid_config();
        cfg.zones[0].valve_gpio_pin = 28;
        assert_validation_err(&cfg, "not a valid BCM GPIO pin");
    }

    #[test]
    fn zone_gpio_boundaries_accepted() {
        for pin in [2, 27] {
            let mut cfg = valid_config();
            cfg.zones[0].valve_gpio_pin = pin;
            cfg.validate().unwrap();
        }
    }

    #[test]
    fn zone_duplicate_gpio_rejected() {
        let mut cfg = valid_config();
        cfg.zones.push(ZoneEntry {
            zone_id: "z2".into(),
            name: "Zone 2".into(),
            ..valid_zone()
        });
        assert_validation_err(&cfg, "already used by another zone");
    }

    // -- Sensor: identity -------------------------------------------------

    #[test]
    fn sensor_duplicate_id_rejected() {
        let mut cfg = valid_config();
        cfg.sensors.push(valid_sensor());
        assert_validation_err(&cfg, "duplicate sensor_id");
    }

    #[test]
    fn sensor_unqualified_id_rejected() {
        let mut cfg = valid_config();
        cfg.sensors[0].sensor_id = "s1".into();
        assert_validation_err(&cfg, "must be qualified as 'node-a/<channel>'");
    }

    #[test]
    fn sensor_unknown_zone_rejected() {
        let mut cfg = valid_config();
        cfg.sensors[0].zone_id = "nonexistent".into();
        assert_validation_err(&cfg, "does not match any defined zone");
    }

    // -- Sensor: ADC calibration ------------------------------------------

    #[test]
    fn sensor_missing_calibration_rejected() {
        let mut cfg = valid_config();
        cfg.sensors[0].raw_wet = None;
        assert_validation_err(&cfg, "need raw_dry and raw_wet");
    }

    #[test]
    fn sensor_raw_dry_too_high() {
        let mut cfg = valid_config();
        cfg.sensors[0].raw_dry = Some(40000);
        assert_validation_err(&cfg, "raw_dry 40000 out of ADS1115 range");
    }

    #[test]
    fn sensor_raw_wet_negative() {
        let mut cfg = valid_config();
        cfg.sensors[0].raw_wet = Some(-100);
        assert_validation_err(&cfg, "raw_wet -100 out of ADS1115 range");
    }

    #[test]
    fn sensor_raw_dry_equals_wet() {
        let mut cfg = valid_config();
        cfg.sensors[0].raw_dry = Some(15000);
        cfg.sensors[0].raw_wet = Some(15000);
        assert_validation_err(&cfg, "calibration range is zero");
    }

    #[test]
    fn temperature_sensor_needs_no_calibration() {
        let mut cfg = valid_config();
        cfg.sensors.push(SensorEntry {
            sensor_id: "node-a/t1".into(),
            kind: SensorKind::Temperature,
            raw_dry: None,
            raw_wet: None,
            ..valid_sensor()
        });
        cfg.validate().unwrap();
    }

    // -- Multiple errors reported at once ---------------------------------

    #[test]
    fn multiple_errors_collected() {
        let cfg = Config {
            engine: EngineConfig::default(),
            schedule: None,
            zones: vec![ZoneEntry {
                zone_id: "".into(),
                name: "".into(),
                min_moisture: -1.0,
                max_moisture: 200.0,
                max_duration_min: -1.0,
                crop_coefficient: 1.0,
                valve_gpio_pin: 0,
            }],
            sensors: vec![],
        };
        let err = cfg.validate().unwrap_err();
        let msg = format!("{err:#}");
        assert!(msg.contains("3 errors"), "wrong count in: {msg}");
        assert!(msg.contains("zone_id is empty"), "missing zone_id error in: {msg}");
        assert!(msg.contains("name is empty"), "missing name error in: {msg}");
        assert!(msg.contains("not a valid BCM GPIO pin"), "missing gpio error in: {msg}");
    }
}
