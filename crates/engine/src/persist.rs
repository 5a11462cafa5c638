//! Persisted engine state. The host stores it as an opaque document.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::absorption::AbsorptionModel;

pub const STATE_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EngineState {
    pub version: u32,
    pub zones: Vec<ZoneState>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ZoneState {
    pub zone_id: String,
    pub absorption: AbsorptionModel,
    pub deficit_mm: f64,
    /// Cycles completed in the most recent session that watered.
    pub cycles_completed: u32,
    pub cycles_total: u32,
    #[serde(default, with = "time::serde::rfc3339::option")]
    pub last_session: Option<OffsetDateTime>,
}

#[cfg(test)]
mod tests {
    use super::*;
    use time::macros::datetime;

    #[test]
    fn state_json_layout() {
        let state = EngineState {
            version: STATE_VERSION,
            zones: vec![ZoneState {
                zone_id: "front".into(),
                absorption: AbsorptionModel {
                    rate: 0.25,
                    alpha: 0.3,
                    observations: 4,
                },
                deficit_mm: 3.5,
                cycles_completed: 2,
                cycles_total: 17,
                last_session: Some(datetime!(2024-06-03 5:00 UTC)),
            }],
        };
        let json = serde_json::to_value(&state).unwrap();
        assert_eq!(json["zones"][0]["absorption"]["rate"], 0.25);
        assert_eq!(json["zones"][0]["last_session"], "2024-06-03T05:00:00Z");
    }

    #[test]
    fn missing_last_session_defaults_to_none() {
        let json = r#"{"version":1,"zones":[{"zone_id":"a","absorption":{"rate":0.5,"alpha":0.3,"observations":0},"deficit_mm":0.0,"cycles_completed":0,"cycles_total":0}]}"#;
        let state: EngineState = serde_json::from_str(json).unwrap();
        assert_eq!(state.zones[0].last_session, None);
    }
}
