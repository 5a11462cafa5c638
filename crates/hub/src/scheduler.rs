//! Drives the engine: calls `Coordinator::tick` on a fixed interval, then
//! fans the report out to the log, the status snapshot and SQLite.
//!
//! ```text
//! interval ──▶ lock engine ──▶ tick(now) ──▶ unlock
//!                                   │
//!                                   ├──▶ tracing + SystemState events
//!                                   ├──▶ watering_events rows
//!                                   └──▶ zone_state rows (after session events)
//! ```
//!
//! The engine lock is never held across an `.await`.

use std::sync::Arc;
use std::time::Duration;

use sprinkler_engine::{Coordinator, EngineEvent, EngineState, TickReport};
use time::OffsetDateTime;
use tokio::sync::Mutex;
use tokio::time::MissedTickBehavior;
use tracing::{error, info, warn};

use crate::db::Db;
use crate::state::{describe, EngineSnapshot, SharedState};

pub type SharedEngine = Arc<Mutex<Coordinator>>;

// ---------------------------------------------------------------------------
// Entry points
// ---------------------------------------------------------------------------

/// Run the scheduler loop. Intended to be `tokio::spawn`-ed from main.
pub async fn run(engine: SharedEngine, db: Db, shared: SharedState, tick: Duration) {
    let mut ticker = tokio::time::interval(tick);
    ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

    info!(tick_sec = tick.as_secs(), "scheduler started");
    shared
        .write()
        .await
        .record_system(format!("scheduler started (tick {}s)", tick.as_secs()));

    loop {
        ticker.tick().await;
        step(&engine, &db, &shared, OffsetDateTime::now_utc()).await;
    }
}

/// One tick plus all of its side effects.
pub async fn step(engine: &SharedEngine, db: &Db, shared: &SharedState, now: OffsetDateTime) -> TickReport {
    let (report, snapshot, state) = {
        let mut c = engine.lock().await;
        let report = c.tick(now);
        let state = report
            .events
            .iter()
            .any(EngineEvent::changes_state)
            .then(|| c.export_state());
        (report, snapshot(&c), state)
    };

    handle_events(&report.events, db, shared, now).await;
    if let Some(state) = state {
        persist(&state, db, shared, now).await;
    }
    shared.write().await.set_engine(snapshot);
    report
}

/// Disables the engine, which aborts any running zone and closes its valve,
/// then saves state. Called on the way out.
pub async fn shutdown(engine: &SharedEngine, db: &Db, shared: &SharedState, now: OffsetDateTime) {
    let (events, snapshot, state) = {
        let mut c = engine.lock().await;
        let events = c.set_enabled(false, now);
        (events, snapshot(&c), c.export_state())
    };
    handle_events(&events, db, shared, now).await;
    persist(&state, db, shared, now).await;
    shared.write().await.set_engine(snapshot);
    info!("engine stopped");
}

pub fn snapshot(c: &Coordinator) -> EngineSnapshot {
    EngineSnapshot {
        enabled: c.is_enabled(),
        watering: c.watering_zone().map(str::to_string),
        gate: c.gate(),
        weather: c.weather().cloned(),
        zones: c.zone_statuses(),
    }
}

// ---------------------------------------------------------------------------
// Report handling
// ---------------------------------------------------------------------------

pub async fn handle_events(events: &[EngineEvent], db: &Db, shared: &SharedState, now: OffsetDateTime) {
    if events.is_empty() {
        return;
    }
    let ts = now.unix_timestamp();

    for event in events {
        log_event(event);
        if let Some((zone_id, cycles, watered_min, result)) = watering_row(event) {
            if let Err(e) = db
                .insert_watering_event(ts, zone_id, cycles, watered_min, result)
                .await
            {
                error!(zone = %zone_id, "insert_watering_event failed: {e:#}");
            }
        }
    }

    let mut st = shared.write().await;
    for event in events {
        st.record_engine(event);
    }
}

async fn persist(state: &EngineState, db: &Db, shared: &SharedState, now: OffsetDateTime) {
    if let Err(e) = db.save_engine_state(state, now.unix_timestamp()).await {
        error!("failed to save engine state: {e:#}");
        shared
            .write()
            .await
            .record_error(format!("failed to save engine state: {e}"));
    }
}

/// Rows for `watering_events`: one per finished cycle, one per outcome.
fn watering_row(event: &EngineEvent) -> Option<(&str, u32, f64, &'static str)> {
    match event {
        EngineEvent::ZoneSoaking {
            zone_id,
            cycles_completed,
            watered_min,
        } => Some((zone_id, *cycles_completed, *watered_min, "cycle")),
        EngineEvent::ZoneDone {
            zone_id,
            reason,
            cycles_completed,
            watered_min,
        } => Some((zone_id, *cycles_completed, *watered_min, reason.as_str())),
        EngineEvent::ZoneAborted {
            zone_id,
            reason,
            cycles_completed,
            watered_min,
        } => Some((zone_id, *cycles_completed, *watered_min, reason.as_str())),
        _ => None,
    }
}

fn log_event(event: &EngineEvent) {
    let detail = describe(event);
    match event {
        EngineEvent::ActuationFailed { zone_id, .. } => error!(zone = %zone_id, "{detail}"),
        EngineEvent::ZoneAborted { zone_id, .. } => warn!(zone = %zone_id, "{detail}"),
        EngineEvent::ForecastUnavailable { .. } | EngineEvent::WeatherBlocked { .. } => warn!("{detail}"),
        _ => match event.zone_id() {
            Some(zone_id) => info!(zone = %zone_id, "{detail}"),
            None => info!("{detail}"),
        },
    }
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(all(test, not(feature = "gpio")))]
mod tests {
    use super::*;
    use crate::state::SystemState;
    use crate::telemetry::TelemetryHandle;
    use crate::valve::ValveBoard;
    use sprinkler_engine::{AlwaysOpen, Capabilities, EngineConfig, Phase, ZoneConfig};
    use tokio::sync::RwLock;

    fn test_zone() -> ZoneConfig {
        ZoneConfig {
            zone_id: "front".into(),
            name: "Front lawn".into(),
            min_moisture: 20.0,
            max_moisture: 35.0,
            max_duration_min: 60.0,
            crop_coefficient: 1.0,
        }
    }

    fn test_engine(telemetry: &TelemetryHandle) -> SharedEngine {
        let board = ValveBoard::new(&[("front".to_string(), 17)], true).unwrap();
        let caps = Capabilities {
            actuator: Box::new(board),
            sensors: Box::new(telemetry.clone()),
            weather: Some(Box::new(telemetry.clone())),
            rain: Some(Box::new(telemetry.clone())),
            schedule: Box::new(AlwaysOpen),
        };
        let mut c = Coordinator::new(EngineConfig::default(), caps).unwrap();
        c.add_zone(test_zone()).unwrap();
        Arc::new(Mutex::new(c))
    }

    fn test_shared() -> SharedState {
        Arc::new(RwLock::new(SystemState::new()))
    }

    async fn test_db() -> Db {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        db
    }

    fn telemetry_with_moisture(percent: f64) -> TelemetryHandle {
        let telemetry = TelemetryHandle::new(time::Duration::minutes(10));
        telemetry.update(|t| t.record_moisture("front", percent, OffsetDateTime::now_utc()));
        telemetry
    }

    // -- tick ---------------------------------------------------------------

    #[tokio::test]
    async fn dry_zone_starts_watering() {
        let telemetry = telemetry_with_moisture(10.0);
        let engine = test_engine(&telemetry);
        let (db, shared) = (test_db().await, test_shared());

        let report = step(&engine, &db, &shared, OffsetDateTime::now_utc()).await;
        assert_eq!(report.watering.as_deref(), Some("front"));

        let st = shared.read().await;
        assert_eq!(st.engine.watering.as_deref(), Some("front"));
        assert_eq!(st.zone("front").unwrap().phase, Phase::Watering);
        assert!(st.events.iter().any(|e| e.detail.starts_with("front cycle 1/")));
    }

    #[tokio::test]
    async fn no_reading_means_no_watering() {
        let telemetry = TelemetryHandle::new(time::Duration::minutes(10));
        let engine = test_engine(&telemetry);
        let (db, shared) = (test_db().await, test_shared());

        let report = step(&engine, &db, &shared, OffsetDateTime::now_utc()).await;
        assert_eq!(report.watering, None);
        // no weather messages yet
        assert!(report
            .events
            .iter()
            .any(|e| matches!(e, EngineEvent::ForecastUnavailable { .. })));
        assert_eq!(shared.read().await.zone("front").unwrap().phase, Phase::Idle);
    }

    #[tokio::test]
    async fn wet_zone_stays_idle_and_saves_nothing() {
        let telemetry = telemetry_with_moisture(30.0);
        let engine = test_engine(&telemetry);
        let (db, shared) = (test_db().await, test_shared());

        let report = step(&engine, &db, &shared, OffsetDateTime::now_utc()).await;
        assert_eq!(report.watering, None);
        assert_eq!(db.load_engine_state().await.unwrap(), None);
    }

    // -- shutdown -----------------------------------------------------------

    #[tokio::test]
    async fn shutdown_aborts_running_zone_and_persists() {
        let telemetry = telemetry_with_moisture(10.0);
        let engine = test_engine(&telemetry);
        let (db, shared) = (test_db().await, test_shared());
        let now = OffsetDateTime::now_utc();

        step(&engine, &db, &shared, now).await;
        shutdown(&engine, &db, &shared, now + time::Duration::minutes(5)).await;

        let st = shared.read().await;
        assert!(!st.engine.enabled);
        assert_eq!(st.engine.watering, None);
        assert_eq!(st.zone("front").unwrap().phase, Phase::Aborted);
        drop(st);

        let events = db.recent_watering_events("front", 10).await.unwrap();
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].result, "disabled");
        assert!((events[0].watered_min - 5.0).abs() < 1e-9);

        let saved = db.load_engine_state().await.unwrap().unwrap();
        assert_eq!(saved.zones.len(), 1);
        assert_eq!(saved.zones[0].zone_id, "front");
    }

    // -- event rows -----------------------------------------------------------

    #[test]
    fn soaking_and_outcomes_become_rows() {
        let soak = EngineEvent::ZoneSoaking {
            zone_id: "front".into(),
            cycles_completed: 1,
            watered_min: 15.0,
        };
        assert_eq!(watering_row(&soak), Some(("front", 1, 15.0, "cycle")));

        let started = EngineEvent::ZoneStarted {
            zone_id: "front".into(),
            cycle: 1,
            cycles: 3,
            minutes: 15.0,
        };
        assert_eq!(watering_row(&started), None);
    }
}
