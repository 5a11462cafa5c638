use anyhow::{Context, Result};
use serde::Serialize;
use sprinkler_engine::{EngineState, ZoneState};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqlitePoolOptions};
use sqlx::{Pool, Sqlite};
use std::str::FromStr;

#[derive(Clone)]
pub struct Db {
    pool: Pool<Sqlite>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WateringEvent {
    pub ts: i64,
    pub zone_id: String,
    pub cycles: i64,
    pub watered_min: f64,
    pub result: String,
}

/// Convert a raw ADC reading to moisture percent (0..=100) using the
/// sensor's dry/wet calibration endpoints. Out-of-range readings clamp.
pub fn compute_moisture(raw: i64, raw_dry: i64, raw_wet: i64) -> f64 {
    let range = raw_dry - raw_wet;
    if range == 0 {
        return 0.0;
    }
    let m = (raw_dry - raw) as f64 / range as f64;
    m.clamp(0.0, 1.0) * 100.0
}

impl Db {
    /// db_url examples:
    /// - "sqlite:/home/pi/sprinkler/sprinkler.db"
    /// - "sqlite::memory:" (tests)
    pub async fn connect(db_url: &str) -> Result<Self> {
        let options = SqliteConnectOptions::from_str(db_url)
            .with_context(|| format!("invalid sqlite connection string: {db_url}"))?
            .journal_mode(SqliteJournalMode::Wal)
            .foreign_keys(true);

        // An in-memory database lives and dies with its connection.
        let max_connections = if db_url.contains(":memory:") { 1 } else { 5 };

        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect_with(options)
            .await
            .with_context(|| format!("failed to connect to sqlite db: {db_url}"))?;

        Ok(Self { pool })
    }

    /// Runs SQLx migrations from ./migrations.
    pub async fn migrate(&self) -> Result<()> {
        sqlx::migrate!("./migrations")
            .run(&self.pool)
            .await
            .context("failed to run migrations")?;
        Ok(())
    }

    // ----------------------------
    // Readings
    // ----------------------------

    pub async fn insert_reading(
        &self,
        ts: i64,
        sensor_id: &str,
        zone_id: &str,
        raw: i64,
        value: f64,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO readings (ts, sensor_id, zone_id, raw, value)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(ts)
        .bind(sensor_id)
        .bind(zone_id)
        .bind(raw)
        .bind(value)
        .execute(&self.pool)
        .await
        .context("insert_reading failed")?;
        Ok(())
    }

    /// Newest (ts, value) recorded for a zone across its sensors.
    pub async fn latest_zone_reading(&self, zone_id: &str) -> Result<Option<(i64, f64)>> {
        sqlx::query_as::<_, (i64, f64)>(
            r#"
            SELECT ts, value
            FROM readings
            WHERE zone_id = ?
            ORDER BY ts DESC, id DESC
            LIMIT 1
            "#,
        )
        .bind(zone_id)
        .fetch_optional(&self.pool)
        .await
        .context("latest_zone_reading failed")
    }

    // ----------------------------
    // Engine state
    // ----------------------------

    /// Upserts one row per zone. Zones absent from `state` are left alone.
    pub async fn save_engine_state(&self, state: &EngineState, now: i64) -> Result<()> {
        let mut tx = self.pool.begin().await.context("save_engine_state: begin failed")?;
        for zone in &state.zones {
            let doc = serde_json::to_string(zone)
                .with_context(|| format!("failed to encode state for zone '{}'", zone.zone_id))?;
            sqlx::query(
                r#"
                INSERT INTO zone_state (zone_id, version, state, updated_at)
                VALUES (?, ?, ?, ?)
                ON CONFLICT(zone_id) DO UPDATE SET
                  version=excluded.version,
                  state=excluded.state,
                  updated_at=excluded.updated_at
                "#,
            )
            .bind(&zone.zone_id)
            .bind(i64::from(state.version))
            .bind(doc)
            .bind(now)
            .execute(&mut *tx)
            .await
            .with_context(|| format!("save_engine_state failed for zone '{}'", zone.zone_id))?;
        }
        tx.commit().await.context("save_engine_state: commit failed")?;
        Ok(())
    }

    /// Reassembles the persisted document, or `None` when nothing was saved.
    pub async fn load_engine_state(&self) -> Result<Option<EngineState>> {
        let rows = sqlx::query_as::<_, (String, i64, String)>(
            r#"
            SELECT zone_id, version, state
            FROM zone_state
            ORDER BY zone_id
            "#,
        )
        .fetch_all(&self.pool)
        .await
        .context("load_engine_state failed")?;

        if rows.is_empty() {
            return Ok(None);
        }

        let mut version = 0;
        let mut zones = Vec::with_capacity(rows.len());
        for (zone_id, v, doc) in rows {
            let zone: ZoneState = serde_json::from_str(&doc)
                .with_context(|| format!("corrupt engine state for zone '{zone_id}'"))?;
            version = version.max(u32::try_from(v).unwrap_or(u32::MAX));
            zones.push(zone);
        }
        Ok(Some(EngineState { version, zones }))
    }

    // ----------------------------
    // Watering events
    // ----------------------------

    pub async fn insert_watering_event(
        &self,
        ts: i64,
        zone_id: &str,
        cycles: u32,
        watered_min: f64,
        result: &str,
    ) -> Result<()> {
        sqlx::query(
            r#"
            INSERT INTO watering_events (ts, zone_id, cycles, watered_min, result)
            VALUES (?, ?, ?, ?, ?)
            "#,
        )
        .bind(ts)
        .bind(zone_id)
        .bind(i64::from(cycles))
        .bind(watered_min)
        .bind(result)
        .execute(&self.pool)
        .await
        .context("insert_watering_event failed")?;
        Ok(())
    }

    /// Most recent events for a zone, newest first.
    pub async fn recent_watering_events(&self, zone_id: &str, limit: i64) -> Result<Vec<WateringEvent>> {
        let rows = sqlx::query_as::<_, (i64, String, i64, f64, String)>(
            r#"
            SELECT ts, zone_id, cycles, watered_min, result
            FROM watering_events
            WHERE zone_id = ?
            ORDER BY ts DESC, id DESC
            LIMIT ?
            "#,
        )
        .bind(zone_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await
        .context("recent_watering_events failed")?;

        Ok(rows
            .into_iter()
            .map(|(ts, zone_id, cycles, watered_min, result)| WateringEvent {
                ts,
                zone_id,
                cycles,
                watered_min,
                result,
            })
            .collect())
    }
}

// ===========================================================================
// Tests
// ===========================================================================
