//! Error types for the sprinkler-engine crate.

/// Failure reported by a host capability (actuator, weather provider, rain
/// sensor). The engine folds these into [`EngineError`].
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("{message}")]
pub struct CapabilityError {
    /// Human-readable description from the host.
    pub message: String,
}

impl CapabilityError {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

/// Error type for all fallible engine operations.
///
/// A budget too small to fund any cycle is not an error: it shows up as a
/// zero allocation in the plan and the zone waits for the next session.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum EngineError {
    /// A zone's moisture reading is missing or invalid and no fallback exists.
    #[error("sensor unavailable for zone '{zone_id}'")]
    SensorUnavailable {
        /// Zone whose sensor failed.
        zone_id: String,
    },

    /// The weather provider could not be read.
    #[error("weather forecast unavailable: {reason}")]
    ForecastUnavailable {
        /// Description of the failure.
        reason: String,
    },

    /// The actuator refused a command after every allowed attempt.
    #[error("actuator failed for zone '{zone_id}' after {attempts} attempt(s): {reason}")]
    ActuationFailed {
        /// Zone whose switch failed.
        zone_id: String,
        /// Number of attempts made within the tick.
        attempts: u32,
        /// Last error reported by the actuator.
        reason: String,
    },

    /// The zone id is not registered with the coordinator.
    #[error("unknown zone '{zone_id}'")]
    UnknownZone {
        /// The unknown id.
        zone_id: String,
    },

    /// A zone with this id is already registered.
    #[error("duplicate zone '{zone_id}'")]
    DuplicateZone {
        /// The duplicated id.
        zone_id: String,
    },

    /// Engine or zone configuration is unusable.
    #[error("invalid configuration: {reason}")]
    InvalidConfig {
        /// Description of the problem.
        reason: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn error_actuation_failed() {
        let e = EngineError::ActuationFailed {
            zone_id: "front".into(),
            attempts: 3,
            reason: "relay timeout".into(),
        };
        assert_eq!(
            e.to_string(),
            "actuator failed for zone 'front' after 3 attempt(s): relay timeout"
        );
    }

    #[test]
    fn error_forecast_unavailable() {
        let e = EngineError::ForecastUnavailable {
            reason: "no provider".into(),
        };
        assert_eq!(e.to_string(), "weather forecast unavailable: no provider");
    }

    #[test]
    fn capability_error_displays_message() {
        let e = CapabilityError::new("gpio busy");
        assert_eq!(e.to_string(), "gpio busy");
    }

    #[test]
    fn error_is_send_and_sync() {
        fn assert_impl<T: Send + Sync + std::error::Error>() {}
        assert_impl::<EngineError>();
        assert_impl::<CapabilityError>();
    }
}
