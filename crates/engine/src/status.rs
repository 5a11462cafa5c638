//! Events and status snapshots the coordinator reports to its host.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::cycle::{AbortReason, DoneReason, Outcome, Phase};
use crate::weather::GateBlock;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EngineEvent {
    SessionStarted {
        #[serde(with = "time::serde::rfc3339")]
        at: OffsetDateTime,
    },
    SessionEnded {
        #[serde(with = "time::serde::rfc3339")]
        at: OffsetDateTime,
        /// Zones that watered at least one cycle.
        zones_watered: usize,
    },
    ZoneStarted {
        zone_id: String,
        /// 1-based cycle number.
        cycle: u32,
        cycles: u32,
        minutes: f64,
    },
    ZoneSoaking {
        zone_id: String,
        cycles_completed: u32,
        watered_min: f64,
    },
    ZoneDone {
        zone_id: String,
        reason: DoneReason,
        cycles_completed: u32,
        watered_min: f64,
    },
    ZoneAborted {
        zone_id: String,
        reason: AbortReason,
        cycles_completed: u32,
        watered_min: f64,
    },
    ActuationFailed {
        zone_id: String,
        on: bool,
        attempts: u32,
        reason: String,
    },
    RateLearned {
        zone_id: String,
        rate: f64,
        observations: u32,
    },
    WeatherBlocked {
        block: GateBlock,
    },
    ForecastUnavailable {
        reason: String,
    },
}

impl EngineEvent {
    /// Zone the event concerns, if any.
    pub fn zone_id(&self) -> Option<&str> {
        match self {
            EngineEvent::ZoneStarted { zone_id, .. }
            | EngineEvent::ZoneSoaking { zone_id, .. }
            | EngineEvent::ZoneDone { zone_id, .. }
            | EngineEvent::ZoneAborted { zone_id, .. }
            | EngineEvent::ActuationFailed { zone_id, .. }
            | EngineEvent::RateLearned { zone_id, .. } => Some(zone_id),
            _ => None,
        }
    }

    /// Events after which learned state has changed and is worth saving.
    pub fn changes_state(&self) -> bool {
        matches!(
            self,
            EngineEvent::SessionEnded { .. }
                | EngineEvent::ZoneDone { .. }
                | EngineEvent::ZoneAborted { .. }
                | EngineEvent::RateLearned { .. }
        )
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TickReport {
    pub events: Vec<EngineEvent>,
    /// Zone holding the watering slot after the tick.
    pub watering: Option<String>,
    pub gate_open: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneStatus {
    pub zone_id: String,
    pub name: String,
    pub phase: Phase,
    pub cycles_completed: u32,
    pub allocated_cycles: u32,
    pub allocated_min: f64,
    /// Latest request from the duration calculator.
    pub requested_min: f64,
    pub watered_min: f64,
    pub deficit_mm: f64,
    /// Evapotranspiration and rain booked against the deficit today.
    pub et_today_mm: f64,
    pub rain_today_mm: f64,
    pub learned_rate: f64,
    pub rate_confidence: f64,
    pub moisture: Option<f64>,
    pub outcome: Option<Outcome>,
    pub cycles_total: u32,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_session: Option<OffsetDateTime>,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_serializes_with_kind_tag() {
        let ev = EngineEvent::ZoneDone {
            zone_id: "front".into(),
            reason: DoneReason::TargetReached,
            cycles_completed: 2,
            watered_min: 30.0,
        };
        let json = serde_json::to_value(&ev).unwrap();
        assert_eq!(json["kind"], "zone_done");
        assert_eq!(json["reason"], "target_reached");
        assert_eq!(ev.zone_id(), Some("front"));
        assert!(ev.changes_state());
    }

    #[test]
    fn forecast_event_has_no_zone() {
        let ev = EngineEvent::ForecastUnavailable {
            reason: "offline".into(),
        };
        assert_eq!(ev.zone_id(), None);
        assert!(!ev.changes_state());
    }
}
