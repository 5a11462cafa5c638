//! Learned soil absorption rate per zone, in moisture-percent per minute of
//! watering.
//!
//! Moisture sensors report with a lag, so a watering interval is not scored
//! when it ends. It is parked as a pending observation and attributed to the
//! first sample taken at least one delay window later.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};
use time::{Duration, OffsetDateTime};
use tracing::debug;

pub const MIN_RATE: f64 = 0.01;
/// Rates above this are sensor glitches, not soil.
pub const MAX_PLAUSIBLE_RATE: f64 = 5.0;
pub const DEFAULT_RATE: f64 = 0.5;
pub const DEFAULT_ALPHA: f64 = 0.3;
/// Observations needed for full confidence.
const CONFIDENT_OBSERVATIONS: f64 = 20.0;
pub const SAMPLE_CAPACITY: usize = 128;
/// Pending observations expire after this many delay windows.
const PENDING_EXPIRY_WINDOWS: i32 = 4;

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub at: OffsetDateTime,
    pub moisture: f64,
}

/// Persisted form of a zone's learned absorption.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct AbsorptionModel {
    pub rate: f64,
    pub alpha: f64,
    pub observations: u32,
}

impl Default for AbsorptionModel {
    fn default() -> Self {
        Self {
            rate: DEFAULT_RATE,
            alpha: DEFAULT_ALPHA,
            observations: 0,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
struct Pending {
    watering_min: f64,
    before: f64,
    ended_at: OffsetDateTime,
}

/// Result of attributing a delayed reading to a watering interval.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Attribution {
    pub watering_min: f64,
    /// Moisture rise seen by the delayed reading.
    pub rise: f64,
    /// New rate, if the observation was accepted.
    pub rate: Option<f64>,
}

#[derive(Debug, Clone)]
pub struct AbsorptionLearner {
    model: AbsorptionModel,
    default_rate: f64,
    delay: Duration,
    samples: VecDeque<Sample>,
    pending: Option<Pending>,
}

impl AbsorptionLearner {
    pub fn new(default_rate: f64, alpha: f64, delay_min: f64) -> Self {
        let default_rate = default_rate.clamp(MIN_RATE, MAX_PLAUSIBLE_RATE);
        Self {
            model: AbsorptionModel {
                rate: default_rate,
                alpha,
                observations: 0,
            },
            default_rate,
            delay: Duration::seconds_f64(delay_min * 60.0),
            samples: VecDeque::with_capacity(SAMPLE_CAPACITY),
            pending: None,
        }
    }

    /// Rebuilds a learner from a persisted model. An implausible stored rate
    /// falls back to the default.
    pub fn from_model(model: AbsorptionModel, default_rate: f64, delay_min: f64) -> Self {
        let mut learner = Self::new(default_rate, model.alpha, delay_min);
        if model.rate.is_finite() && (MIN_RATE..=MAX_PLAUSIBLE_RATE).contains(&model.rate) {
            learner.model.rate = model.rate;
            learner.model.observations = model.observations;
        }
        learner
    }

    pub fn model(&self) -> AbsorptionModel {
        self.model
    }

    pub fn rate(&self) -> f64 {
        self.model.rate
    }

    pub fn confidence(&self) -> f64 {
        (f64::from(self.model.observations) / CONFIDENT_OBSERVATIONS).min(1.0)
    }

    /// Folds one watering interval into the running average. Returns the new
    /// rate, or `None` when the observation is rejected as implausible.
    pub fn observe(&mut self, watering_min: f64, before: f64, after: f64) -> Option<f64> {
        if !(watering_min.is_finite() && watering_min > 0.0) {
            return None;
        }
        let observed = (after - before) / watering_min;
        if !observed.is_finite() || observed <= 0.0 || observed > MAX_PLAUSIBLE_RATE {
            debug!(observed, watering_min, "absorption observation rejected");
            return None;
        }
        let a = self.model.alpha;
        self.model.rate = (a * observed + (1.0 - a) * self.model.rate).max(MIN_RATE);
        self.model.observations = self.model.observations.saturating_add(1);
        Some(self.model.rate)
    }

    /// Minutes of watering needed for `rise` percent, capped at `max_duration_min`.
    pub fn predict(&self, rise: f64, max_duration_min: f64) -> f64 {
        if !(rise.is_finite() && rise > 0.0) {
            return 0.0;
        }
        (rise / self.model.rate.max(MIN_RATE)).min(max_duration_min)
    }

    pub fn record_sample(&mut self, at: OffsetDateTime, moisture: f64) {
        if !moisture.is_finite() {
            return;
        }
        if self.samples.len() >= SAMPLE_CAPACITY {
            self.samples.pop_front();
        }
        self.samples.push_back(Sample { at, moisture });
    }

    /// Parks a finished watering interval until a delayed reading arrives.
    pub fn begin_observation(&mut self, watering_min: f64, before: f64, ended_at: OffsetDateTime) {
        if self.pending.is_some() {
            debug!("replacing unattributed absorption observation");
        }
        self.pending = Some(Pending {
            watering_min,
            before,
            ended_at,
        });
    }

    pub fn has_pending(&self) -> bool {
        self.pending.is_some()
    }

    /// Drops the parked interval unscored.
    pub fn cancel_observation(&mut self) {
        self.pending = None;
    }

    /// Attributes the pending observation once a sample at least one delay
    /// window after it exists. Drops it if none shows up in time.
    pub fn poll(&mut self, now: OffsetDateTime) -> Option<Attribution> {
        let p = self.pending?;
        let due = p.ended_at + self.delay;
        let sample = self
            .samples
            .iter()
            .find(|s| s.at >= due && s.at <= now)
            .copied();

        match sample {
            Some(s) => {
                self.pending = None;
                let rise = s.moisture - p.before;
                let rate = self.observe(p.watering_min, p.before, s.moisture);
                Some(Attribution {
                    watering_min: p.watering_min,
                    rise,
                    rate,
                })
            }
            None => {
                if now >= p.ended_at + self.delay * PENDING_EXPIRY_WINDOWS {
                    debug!("absorption observation expired without a delayed reading");
                    self.pending = None;
                }
                None
            }
        }
    }

    /// Forgets everything learned.
    pub fn reset(&mut self) {
        self.model.rate = self.default_rate;
        self.model.observations = 0;
        self.samples.clear();
        self.pending = None;
    }
}
