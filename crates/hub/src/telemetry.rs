//! Latest sensor and weather values received over MQTT, exposed to the
//! engine through its capability traits.
//!
//! The MQTT loop writes, the engine reads during `tick`. Both sides hold the
//! lock only for a map lookup, so a plain `std::sync::RwLock` is enough.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, RwLock};

use sprinkler_engine::{
    CapabilityError, CurrentConditions, ForecastSummary, RainSensor, WeatherProvider, ZoneSensors,
};
use time::{Duration, OffsetDateTime};

/// Weather messages arrive far less often than sensor telemetry.
const WEATHER_STALE_HOURS: i64 = 3;

/// Rain gauge increments kept for `measured_since` lookups.
const RAIN_RETENTION_HOURS: i64 = 48;

#[derive(Debug, Clone, Copy, PartialEq)]
struct Sample<T> {
    value: T,
    received_at: OffsetDateTime,
}

#[derive(Debug)]
pub struct Telemetry {
    stale_after: Duration,
    moisture: HashMap<String, Sample<f64>>,
    temperature: HashMap<String, Sample<f64>>,
    current: Option<Sample<CurrentConditions>>,
    forecast: Option<(u32, Sample<ForecastSummary>)>,
    rain: VecDeque<(OffsetDateTime, f64)>,
}

impl Telemetry {
    pub fn new(stale_after: Duration) -> Self {
        Self {
            stale_after,
            moisture: HashMap::new(),
            temperature: HashMap::new(),
            current: None,
            forecast: None,
            rain: VecDeque::new(),
        }
    }

    pub fn record_moisture(&mut self, zone_id: &str, percent: f64, at: OffsetDateTime) {
        self.moisture.insert(
            zone_id.to_string(),
            Sample {
                value: percent,
                received_at: at,
            },
        );
    }

    pub fn record_temperature(&mut self, zone_id: &str, fahrenheit: f64, at: OffsetDateTime) {
        self.temperature.insert(
            zone_id.to_string(),
            Sample {
                value: fahrenheit,
                received_at: at,
            },
        );
    }

    pub fn record_current(&mut self, conditions: CurrentConditions, at: OffsetDateTime) {
        self.current = Some(Sample {
            value: conditions,
            received_at: at,
        });
    }

    pub fn record_forecast(&mut self, hours: u32, forecast: ForecastSummary, at: OffsetDateTime) {
        self.forecast = Some((
            hours,
            Sample {
                value: forecast,
                received_at: at,
            },
        ));
    }

    pub fn record_rain(&mut self, mm: f64, at: OffsetDateTime) {
        let cutoff = at - Duration::hours(RAIN_RETENTION_HOURS);
        while self.rain.front().is_some_and(|(ts, _)| *ts < cutoff) {
            self.rain.pop_front();
        }
        self.rain.push_back((at, mm));
    }

    pub fn moisture_at(&self, zone_id: &str, now: OffsetDateTime) -> Option<f64> {
        fresh(self.moisture.get(zone_id), now, self.stale_after)
    }

    pub fn temperature_at(&self, zone_id: &str, now: OffsetDateTime) -> Option<f64> {
        fresh(self.temperature.get(zone_id), now, self.stale_after)
    }

    pub fn current_at(&self, now: OffsetDateTime) -> Option<CurrentConditions> {
        fresh(self.current.as_ref(), now, Duration::hours(WEATHER_STALE_HOURS))
    }

    pub fn forecast_at(&self, now: OffsetDateTime) -> Option<(u32, ForecastSummary)> {
        let (hours, sample) = self.forecast.as_ref()?;
        fresh(Some(sample), now, Duration::hours(WEATHER_STALE_HOURS))
            .map(|f| (*hours, f))
    }

    /// Total gauge increments received after `since`.
    pub fn rain_since(&self, since: OffsetDateTime) -> f64 {
        self.rain
            .iter()
            .filter(|(ts, _)| *ts > since)
            .map(|(_, mm)| mm)
            .sum()
    }
}

fn fresh<T: Copy>(sample: Option<&Sample<T>>, now: OffsetDateTime, max_age: Duration) -> Option<T> {
    let s = sample?;
    (now - s.received_at <= max_age).then_some(s.value)
}

pub type SharedTelemetry = Arc<RwLock<Telemetry>>;

/// Capability adapter handed to the engine. Cheap to clone.
#[derive(Clone)]
pub struct TelemetryHandle(pub SharedTelemetry);

impl TelemetryHandle {
    pub fn new(stale_after: Duration) -> Self {
        Self(Arc::new(RwLock::new(Telemetry::new(stale_after))))
    }

    fn read<T>(&self, f: impl FnOnce(&Telemetry) -> T) -> Result<T, CapabilityError> {
        let guard = self
            .0
            .read()
            .map_err(|_| CapabilityError::new("telemetry lock poisoned"))?;
        Ok(f(&guard))
    }

    /// Runs `f` with write access; a poisoned lock drops the update.
    pub fn update(&self, f: impl FnOnce(&mut Telemetry)) {
        match self.0.write() {
            Ok(mut guard) => f(&mut guard),
            Err(_) => tracing::error!("telemetry lock poisoned, update dropped"),
        }
    }
}

impl ZoneSensors for TelemetryHandle {
    fn moisture(&self, zone_id: &str) -> Option<f64> {
        let now = OffsetDateTime::now_utc();
        self.read(|t| t.moisture_at(zone_id, now)).ok().flatten()
    }

    fn temperature(&self, zone_id: &str) -> Option<f64> {
        let now = OffsetDateTime::now_utc();
        self.read(|t| t.temperature_at(zone_id, now)).ok().flatten()
    }
}

impl WeatherProvider for TelemetryHandle {
    /// Without a current-conditions message a fresh forecast still counts;
    /// temperature and humidity are then reported unknown.
    fn current(&self) -> Result<CurrentConditions, CapabilityError> {
        let now = OffsetDateTime::now_utc();
        let (current, has_forecast) = self.read(|t| (t.current_at(now), t.forecast_at(now).is_some()))?;
        match current {
            Some(c) => Ok(c),
            None if has_forecast => Ok(CurrentConditions::default()),
            None => Err(CapabilityError::new("no recent weather/current message")),
        }
    }

    fn forecast(&self, hours: u32) -> Result<ForecastSummary, CapabilityError> {
        let now = OffsetDateTime::now_utc();
        let (horizon, forecast) = self
            .read(|t| t.forecast_at(now))?
            .ok_or_else(|| CapabilityError::new("no recent weather/forecast message"))?;
        if horizon < hours {
            tracing::debug!(horizon, wanted = hours, "forecast covers a shorter horizon than configured");
        }
        Ok(forecast)
    }
}

impl RainSensor for TelemetryHandle {
    fn measured_since(&self, since: OffsetDateTime) -> Result<f64, CapabilityError> {
        self.read(|t| t.rain_since(since))
    }
}

// ===========================================================================
// Tests
// ===========================================================================
