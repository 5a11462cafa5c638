//! Weather cache and the rain/freeze gate.

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use tracing::{debug, warn};

use crate::capability::WeatherProvider;
use crate::config::EngineConfig;
use crate::error::EngineError;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WeatherSnapshot {
    /// Current temperature, °F.
    pub temperature: Option<f64>,
    /// Current relative humidity, percent.
    pub humidity: Option<f64>,
    /// Forecast rain probability over the horizon, percent.
    pub rain_probability: f64,
    pub rain_amount_mm: f64,
    pub forecast_min_temperature: Option<f64>,
    /// Rain gauge total since the cache was last cleared.
    pub measured_rain_mm: f64,
    #[serde(with = "time::serde::rfc3339")]
    pub fetched_at: OffsetDateTime,
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GateBlock {
    RainForecast { amount_mm: f64, threshold_mm: f64 },
    Freeze { temperature: f64, threshold: f64 },
    /// No temperature known while a previous freeze is still latched.
    FreezeUnknown,
}

#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct GateDecision {
    pub blocked: Option<GateBlock>,
}

impl GateDecision {
    pub fn open() -> Self {
        Self { blocked: None }
    }

    pub fn is_open(&self) -> bool {
        self.blocked.is_none()
    }
}

/// Returns the freeze block for a single temperature reading, if any.
pub fn freeze_block(temperature: Option<f64>, threshold: f64) -> Option<GateBlock> {
    match temperature {
        Some(t) if t.is_finite() && t <= threshold => Some(GateBlock::Freeze {
            temperature: t,
            threshold,
        }),
        _ => None,
    }
}

/// Last known good weather plus the freeze latch.
#[derive(Debug, Clone, Default)]
pub struct WeatherCache {
    snapshot: Option<WeatherSnapshot>,
    freeze_latched: bool,
    last_attempt: Option<OffsetDateTime>,
    measured_rain_mm: f64,
}

impl WeatherCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> Option<&WeatherSnapshot> {
        self.snapshot.as_ref()
    }

    pub fn freeze_latched(&self) -> bool {
        self.freeze_latched
    }

    pub fn needs_refresh(&self, now: OffsetDateTime, cadence_min: f64) -> bool {
        match self.last_attempt {
            None => true,
            Some(at) => now - at >= Duration::seconds_f64(cadence_min * 60.0),
        }
    }

    /// Pulls a fresh snapshot from `provider`. Refreshing twice at the same
    /// instant hands back the cached snapshot. On failure the cache keeps the
    /// previous snapshot.
    pub fn refresh(
        &mut self,
        provider: Option<&dyn WeatherProvider>,
        hours: u32,
        now: OffsetDateTime,
    ) -> Result<WeatherSnapshot, EngineError> {
        if let Some(s) = &self.snapshot {
            if s.fetched_at == now {
                return Ok(s.clone());
            }
        }
        self.last_attempt = Some(now);

        let provider = provider.ok_or_else(|| EngineError::ForecastUnavailable {
            reason: "no weather provider configured".to_string(),
        })?;
        let unavailable = |e: crate::error::CapabilityError| EngineError::ForecastUnavailable {
            reason: e.message,
        };
        let current = provider.current().map_err(unavailable)?;
        let forecast = provider.forecast(hours).map_err(unavailable)?;

        if !forecast.rain_amount_mm.is_finite() || !forecast.rain_probability.is_finite() {
            return Err(EngineError::ForecastUnavailable {
                reason: "forecast contains non-finite values".to_string(),
            });
        }

        let snapshot = WeatherSnapshot {
            temperature: current.temperature.filter(|t| t.is_finite()),
            humidity: current.humidity.filter(|h| h.is_finite()),
            rain_probability: forecast.rain_probability.clamp(0.0, 100.0),
            rain_amount_mm: forecast.rain_amount_mm.max(0.0),
            forecast_min_temperature: forecast.min_temperature.filter(|t| t.is_finite()),
            measured_rain_mm: self.measured_rain_mm,
            fetched_at: now,
        };
        debug!(
            temperature = ?snapshot.temperature,
            humidity = ?snapshot.humidity,
            rain_mm = snapshot.rain_amount_mm,
            rain_pct = snapshot.rain_probability,
            "weather refreshed"
        );
        self.snapshot = Some(snapshot.clone());
        Ok(snapshot)
    }

    /// Adds rain gauge millimetres to the running total.
    pub fn record_rain(&mut self, mm: f64) {
        if !(mm.is_finite() && mm > 0.0) {
            return;
        }
        self.measured_rain_mm += mm;
        if let Some(s) = self.snapshot.as_mut() {
            s.measured_rain_mm = self.measured_rain_mm;
        }
    }

    /// Evaluates the global gate against the cached snapshot and updates the
    /// freeze latch.
    pub fn gate(&mut self, cfg: &EngineConfig) -> GateDecision {
        let Some(s) = &self.snapshot else {
            if self.freeze_latched {
                return GateDecision {
                    blocked: Some(GateBlock::FreezeUnknown),
                };
            }
            return GateDecision::open();
        };

        let coldest = [s.temperature, s.forecast_min_temperature]
            .into_iter()
            .flatten()
            .reduce(f64::min);
        let freeze = match coldest {
            Some(t) => {
                let block = freeze_block(Some(t), cfg.freeze_threshold);
                if block.is_some() && !self.freeze_latched {
                    warn!(temperature = t, threshold = cfg.freeze_threshold, "freeze condition");
                }
                self.freeze_latched = block.is_some();
                block
            }
            None if self.freeze_latched => Some(GateBlock::FreezeUnknown),
            None => None,
        };
        if freeze.is_some() {
            return GateDecision { blocked: freeze };
        }

        if s.rain_amount_mm >= cfg.rain_threshold_mm && s.rain_probability >= cfg.rain_probability_min {
            return GateDecision {
                blocked: Some(GateBlock::RainForecast {
                    amount_mm: s.rain_amount_mm,
                    threshold_mm: cfg.rain_threshold_mm,
                }),
            };
        }
        GateDecision::open()
    }

    /// Drops the snapshot, the latch and the rain total.
    pub fn clear(&mut self) {
        *self = Self::default();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::capability::{CurrentConditions, ForecastSummary};
    use crate::error::CapabilityError;
    use time::macros::datetime;

    struct Fixed {
        current: CurrentConditions,
        forecast: ForecastSummary,
        fail: bool,
    }

    impl WeatherProvider for Fixed {
        fn current(&self) -> Result<CurrentConditions, CapabilityError> {
            if self.fail {
                return Err(CapabilityError::new("offline"));
            }
            Ok(self.current)
        }
        fn forecast(&self, _hours: u32) -> Result<ForecastSummary, CapabilityError> {
            Ok(self.forecast)
        }
    }

    fn provider(temp: f64, rain_mm: f64) -> Fixed {
        Fixed {
            current: CurrentConditions {
                temperature: Some(temp),
                humidity: Some(50.0),
            },
            forecast: ForecastSummary {
                rain_probability: 80.0,
                rain_amount_mm: rain_mm,
                min_temperature: None,
            },
            fail: false,
        }
    }

    const T0: OffsetDateTime = datetime!(2024-06-03 5:00 UTC);

    // ---- gate ----

    #[test]
    fn no_snapshot_gate_is_open() {
        let mut cache = WeatherCache::new();
        assert!(cache.gate(&EngineConfig::default()).is_open());
    }

    #[test]
    fn rain_forecast_blocks() {
        let cfg = EngineConfig {
            rain_threshold_mm: 5.0,
            ..EngineConfig::default()
        };
        let mut cache = WeatherCache::new();
        cache.refresh(Some(&provider(70.0, 10.0)), 24, T0).unwrap();
        assert!(matches!(
            cache.gate(&cfg).blocked,
            Some(GateBlock::RainForecast { amount_mm, .. }) if amount_mm == 10.0
        ));
    }

    #[test]
    fn unlikely_rain_does_not_block() {
        let cfg = EngineConfig {
            rain_probability_min: 90.0,
            ..EngineConfig::default()
        };
        let mut cache = WeatherCache::new();
        cache.refresh(Some(&provider(70.0, 10.0)), 24, T0).unwrap();
        assert!(cache.gate(&cfg).is_open());
    }

    #[test]
    fn freeze_blocks_and_latches() {
        let cfg = EngineConfig::default();
        let mut cache = WeatherCache::new();
        cache.refresh(Some(&provider(30.0, 0.0)), 24, T0).unwrap();
        assert!(matches!(cache.gate(&cfg).blocked, Some(GateBlock::Freeze { .. })));
        assert!(cache.freeze_latched());

        // Temperature disappears: latched freeze keeps blocking.
        let mut unknown = provider(0.0, 0.0);
        unknown.current.temperature = None;
        cache.refresh(Some(&unknown), 24, T0 + Duration::hours(1)).unwrap();
        assert_eq!(cache.gate(&cfg).blocked, Some(GateBlock::FreezeUnknown));

        // Warm reading clears the latch.
        cache.refresh(Some(&provider(50.0, 0.0)), 24, T0 + Duration::hours(2)).unwrap();
        assert!(cache.gate(&cfg).is_open());
        assert!(!cache.freeze_latched());
    }

    #[test]
    fn unknown_temperature_without_latch_is_open() {
        let mut p = provider(0.0, 0.0);
        p.current.temperature = None;
        let mut cache = WeatherCache::new();
        cache.refresh(Some(&p), 24, T0).unwrap();
        assert!(cache.gate(&EngineConfig::default()).is_open());
    }

    #[test]
    fn forecast_minimum_counts_toward_freeze() {
        let mut p = provider(50.0, 0.0);
        p.forecast.min_temperature = Some(33.0);
        let mut cache = WeatherCache::new();
        cache.refresh(Some(&p), 24, T0).unwrap();
        assert!(!cache.gate(&EngineConfig::default()).is_open());
    }

    // ---- refresh ----

    #[test]
    fn refresh_same_instant_is_idempotent() {
        let mut cache = WeatherCache::new();
        let first = cache.refresh(Some(&provider(70.0, 1.0)), 24, T0).unwrap();
        let second = cache.refresh(Some(&provider(20.0, 50.0)), 24, T0).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn failed_refresh_keeps_last_good() {
        let mut cache = WeatherCache::new();
        cache.refresh(Some(&provider(70.0, 1.0)), 24, T0).unwrap();
        let mut bad = provider(70.0, 1.0);
        bad.fail = true;
        let err = cache.refresh(Some(&bad), 24, T0 + Duration::hours(1)).unwrap_err();
        assert!(matches!(err, EngineError::ForecastUnavailable { .. }));
        assert_eq!(cache.snapshot().unwrap().fetched_at, T0);
    }

    #[test]
    fn missing_provider_is_unavailable() {
        let mut cache = WeatherCache::new();
        assert!(cache.refresh(None, 24, T0).is_err());
        assert!(!cache.needs_refresh(T0 + Duration::minutes(10), 60.0));
        assert!(cache.needs_refresh(T0 + Duration::minutes(60), 60.0));
    }

    #[test]
    fn rain_total_carries_across_refresh() {
        let mut cache = WeatherCache::new();
        cache.record_rain(2.5);
        let s = cache.refresh(Some(&provider(70.0, 0.0)), 24, T0).unwrap();
        assert_eq!(s.measured_rain_mm, 2.5);
        cache.record_rain(1.0);
        assert_eq!(cache.snapshot().unwrap().measured_rain_mm, 3.5);
        cache.clear();
        assert!(cache.snapshot().is_none());
    }
}
