use serde::Serialize;
use sprinkler_engine::{EngineEvent, GateDecision, WeatherSnapshot, ZoneStatus};
use std::collections::{HashMap, VecDeque};
use std::sync::Arc;
use std::time::Instant;
use time::OffsetDateTime;
use tokio::sync::RwLock;

/// Maximum number of events retained in the ring buffer.
const MAX_EVENTS: usize = 200;

// ---------------------------------------------------------------------------
// Public type alias
// ---------------------------------------------------------------------------

pub type SharedState = Arc<RwLock<SystemState>>;

// ---------------------------------------------------------------------------
// Core types
// ---------------------------------------------------------------------------

pub struct SystemState {
    pub started_at: Instant,
    pub mqtt_connected: bool,
    pub nodes: HashMap<String, NodeState>,
    pub engine: EngineSnapshot,
    pub events: VecDeque<SystemEvent>,
}

#[derive(Clone, Serialize)]
pub struct NodeState {
    #[serde(with = "time::serde::rfc3339")]
    pub last_seen: OffsetDateTime,
    pub readings: Vec<SensorReading>,
}

#[derive(Clone, Serialize)]
pub struct SensorReading {
    pub sensor_id: String,
    pub raw: i64,
}

/// Copy of the coordinator's view taken after each tick.
#[derive(Clone, Default, Serialize)]
pub struct EngineSnapshot {
    pub enabled: bool,
    pub watering: Option<String>,
    pub gate: GateDecision,
    pub weather: Option<WeatherSnapshot>,
    pub zones: Vec<ZoneStatus>,
}

#[derive(Clone, Serialize)]
pub struct SystemEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub ts: OffsetDateTime,
    pub kind: EventKind,
    pub detail: String,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum EventKind {
    Reading,
    Engine,
    Error,
    System,
}

// ---------------------------------------------------------------------------
// JSON response (what the API returns)
// ---------------------------------------------------------------------------

#[derive(Serialize)]
pub struct StatusResponse {
    pub uptime_secs: u64,
    pub mqtt_connected: bool,
    pub nodes: HashMap<String, NodeState>,
    pub engine: EngineSnapshot,
    pub events: Vec<SystemEvent>,
}

// ---------------------------------------------------------------------------
// Construction & mutation
// ---------------------------------------------------------------------------

impl SystemState {
    pub fn new() -> Self {
        Self {
            started_at: Instant::now(),
            mqtt_connected: false,
            nodes: HashMap::new(),
            engine: EngineSnapshot::default(),
            events: VecDeque::with_capacity(MAX_EVENTS),
        }
    }

    /// Record a telemetry message from a node.
    pub fn record_reading(&mut self, node_id: &str, readings: Vec<SensorReading>) {
        let detail = format!(
            "{node_id}: {}",
            readings
                .iter()
                .map(|r| format!("{}={}", r.sensor_id, r.raw))
                .collect::<Vec<_>>()
                .join(", ")
        );

        self.nodes.insert(
            node_id.to_string(),
            NodeState {
                last_seen: OffsetDateTime::now_utc(),
                readings,
            },
        );

        self.push_event(EventKind::Reading, detail);
    }

    /// Record an event reported by the engine.
    pub fn record_engine(&mut self, event: &EngineEvent) {
        self.push_event(EventKind::Engine, describe(event));
    }

    /// Record an error event.
    pub fn record_error(&mut self, detail: String) {
        self.push_event(EventKind::Error, detail);
    }

    /// Record a generic system event.
    pub fn record_system(&mut self, detail: String) {
        self.push_event(EventKind::System, detail);
    }

    pub fn set_engine(&mut self, snapshot: EngineSnapshot) {
        self.engine = snapshot;
    }

    pub fn zone(&self, zone_id: &str) -> Option<&ZoneStatus> {
        self.engine.zones.iter().find(|z| z.zone_id == zone_id)
    }

    /// Build the JSON-serialisable status snapshot.
    pub fn to_status(&self) -> StatusResponse {
        StatusResponse {
            uptime_secs: self.started_at.elapsed().as_secs(),
            mqtt_connected: self.mqtt_connected,
            nodes: self.nodes.clone(),
            engine: self.engine.clone(),
            events: self.events.iter().rev().cloned().collect(),
        }
    }

    fn push_event(&mut self, kind: EventKind, detail: String) {
        if self.events.len() >= MAX_EVENTS {
            self.events.pop_front();
        }
        self.events.push_back(SystemEvent {
            ts: OffsetDateTime::now_utc(),
            kind,
            detail,
        });
    }
}

impl Default for SystemState {
    fn default() -> Self {
        Self::new()
    }
}

/// One-line human summary of an engine event.
pub fn describe(event: &EngineEvent) -> String {
    match event {
        EngineEvent::SessionStarted { .. } => "session started".to_string(),
        EngineEvent::SessionEnded { zones_watered, .. } => {
            format!("session ended, {zones_watered} zone(s) watered")
        }
        EngineEvent::ZoneStarted {
            zone_id,
            cycle,
            cycles,
            minutes,
        } => format!("{zone_id} cycle {cycle}/{cycles} started ({minutes:.1} min)"),
        EngineEvent::ZoneSoaking {
            zone_id,
            cycles_completed,
            watered_min,
        } => format!("{zone_id} soaking after {cycles_completed} cycle(s), {watered_min:.1} min"),
        EngineEvent::ZoneDone {
            zone_id,
            reason,
            watered_min,
            ..
        } => format!("{zone_id} done ({}), {watered_min:.1} min", reason.as_str()),
        EngineEvent::ZoneAborted {
            zone_id,
            reason,
            watered_min,
            ..
        } => format!("{zone_id} aborted ({}), {watered_min:.1} min", reason.as_str()),
        EngineEvent::ActuationFailed {
            zone_id,
            on,
            attempts,
            reason,
        } => format!(
            "{zone_id} valve {} failed after {attempts} attempt(s): {reason}",
            if *on { "ON" } else { "OFF" }
        ),
        EngineEvent::RateLearned {
            zone_id,
            rate,
            observations,
        } => format!("{zone_id} absorption {rate:.3} %/min ({observations} obs)"),
        EngineEvent::WeatherBlocked { block } => format!("weather gate closed: {block:?}"),
        EngineEvent::ForecastUnavailable { reason } => format!("forecast unavailable: {reason}"),
    }
}

// ===========================================================================
// Tests
// ===========================================================================
