//! Scripted capabilities shared by the integration tests.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard};

use sprinkler_engine::{
    Actuator, Capabilities, CapabilityError, Coordinator, CurrentConditions, EngineConfig, ForecastSummary,
    RainSensor, ScheduleProvider, WeatherProvider, ZoneConfig, ZoneSensors,
};
use time::macros::datetime;
use time::{Duration, OffsetDateTime};

pub const T0: OffsetDateTime = datetime!(2024-06-03 5:00 UTC);

pub fn at(min: i64) -> OffsetDateTime {
    T0 + Duration::minutes(min)
}

pub struct World {
    pub moisture: HashMap<String, f64>,
    pub temperature: HashMap<String, f64>,
    pub current: CurrentConditions,
    pub forecast: ForecastSummary,
    pub weather_fails: bool,
    /// Returned by every rain sensor read.
    pub rain_mm: f64,
    pub valves: HashMap<String, bool>,
    pub commands: usize,
    pub actuator_fails: bool,
    pub open: bool,
    pub window_end: Option<OffsetDateTime>,
}

impl Default for World {
    fn default() -> Self {
        Self {
            moisture: HashMap::new(),
            temperature: HashMap::new(),
            current: CurrentConditions {
                temperature: Some(70.0),
                humidity: Some(50.0),
            },
            forecast: ForecastSummary::default(),
            weather_fails: false,
            rain_mm: 0.0,
            valves: HashMap::new(),
            commands: 0,
            actuator_fails: false,
            open: true,
            window_end: None,
        }
    }
}

impl World {
    pub fn valves_on(&self) -> usize {
        self.valves.values().filter(|on| **on).count()
    }
}

#[derive(Clone, Default)]
pub struct Mock(pub Arc<Mutex<World>>);

impl Mock {
    pub fn world(&self) -> MutexGuard<'_, World> {
        self.0.lock().unwrap()
    }

    pub fn set_moisture(&self, zone_id: &str, value: f64) {
        self.world().moisture.insert(zone_id.to_string(), value);
    }
}

impl Actuator for Mock {
    fn set(&mut self, zone_id: &str, on: bool) -> Result<(), CapabilityError> {
        let mut w = self.world();
        w.commands += 1;
        if w.actuator_fails {
            return Err(CapabilityError::new("relay not responding"));
        }
        w.valves.insert(zone_id.to_string(), on);
        Ok(())
    }
}

impl ZoneSensors for Mock {
    fn moisture(&self, zone_id: &str) -> Option<f64> {
        self.world().moisture.get(zone_id).copied()
    }

    fn temperature(&self, zone_id: &str) -> Option<f64> {
        self.world().temperature.get(zone_id).copied()
    }
}

impl WeatherProvider for Mock {
    fn current(&self) -> Result<CurrentConditions, CapabilityError> {
        let w = self.world();
        if w.weather_fails {
            return Err(CapabilityError::new("weather service unreachable"));
        }
        Ok(w.current)
    }

    fn forecast(&self, _hours: u32) -> Result<ForecastSummary, CapabilityError> {
        Ok(self.world().forecast)
    }
}

impl RainSensor for Mock {
    fn measured_since(&self, _since: OffsetDateTime) -> Result<f64, CapabilityError> {
        Ok(self.world().rain_mm)
    }
}

impl ScheduleProvider for Mock {
    fn is_within_window(&self, now: OffsetDateTime) -> bool {
        let w = self.world();
        w.open && w.window_end.map_or(true, |end| now < end)
    }

    fn remaining(&self, now: OffsetDateTime) -> Option<Duration> {
        self.world().window_end.map(|end| (end - now).max(Duration::ZERO))
    }
}

pub fn zone(id: &str, max_duration_min: f64) -> ZoneConfig {
    ZoneConfig {
        zone_id: id.to_string(),
        name: format!("Zone {id}"),
        min_moisture: 20.0,
        max_moisture: 25.0,
        max_duration_min,
        crop_coefficient: 1.0,
    }
}

pub fn engine(mock: &Mock, config: EngineConfig, zones: &[ZoneConfig]) -> Coordinator {
    let caps = Capabilities {
        actuator: Box::new(mock.clone()),
        sensors: Box::new(mock.clone()),
        weather: Some(Box::new(mock.clone())),
        rain: Some(Box::new(mock.clone())),
        schedule: Box::new(mock.clone()),
    };
    let mut c = Coordinator::new(config, caps).unwrap();
    for z in zones {
        c.add_zone(z.clone()).unwrap();
    }
    c
}
