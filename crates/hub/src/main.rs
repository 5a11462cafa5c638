mod config;
mod db;
mod mqtt;
mod scheduler;
mod state;
mod telemetry;
mod valve;
mod web;

use anyhow::{Context, Result};
use rumqttc::{AsyncClient, Event, MqttOptions, Packet, QoS};
use sprinkler_engine::{
    AlwaysOpen, Capabilities, Coordinator, CurrentConditions, ForecastSummary, ScheduleProvider,
};
use std::{collections::HashMap, env, sync::Arc, time::Duration};
use time::OffsetDateTime;
use tokio::sync::{Mutex, RwLock};
use tokio::time::sleep;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use config::SensorEntry;
use db::Db;
use mqtt::{classify, CurrentMsg, ForecastMsg, RainMsg, ReadingMsg, Topic};
use scheduler::SharedEngine;
use state::{SensorReading, SharedState, SystemState};
use telemetry::TelemetryHandle;
use valve::ValveBoard;

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(default)
}

fn env_flag(key: &str, default: bool) -> bool {
    env::var(key)
        .ok()
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(default)
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("sprinkler_hub=info,sprinkler_engine=info")),
        )
        .init();

    // ── Env config ──────────────────────────────────────────────────
    let broker = env::var("MQTT_HOST").unwrap_or_else(|_| "127.0.0.1".to_string());
    let port: u16 = env_or("MQTT_PORT", 1883);
    let db_url = env::var("DB_URL").unwrap_or_else(|_| "sqlite:sprinkler.db?mode=rwc".to_string());
    let config_path = env::var("CONFIG_PATH").unwrap_or_else(|_| "config.toml".to_string());
    let tick_sec: u64 = env_or("TICK_SEC", 60);
    let stale_min: i64 = env_or("SENSOR_STALE_MIN", 30);

    // ── Database ────────────────────────────────────────────────────
    let db = Db::connect(&db_url).await?;
    db.migrate().await?;

    // ── Config file ─────────────────────────────────────────────────
    let cfg = config::load(&config_path)?;
    if cfg.zones.is_empty() {
        warn!("no zones configured");
    }

    // Keys are qualified IDs: "node-a/s1", "node-b/s2", etc.
    let sensor_map: HashMap<String, SensorEntry> = cfg
        .sensors
        .iter()
        .map(|s| (s.sensor_id.clone(), s.clone()))
        .collect();

    // ── Valve board ─────────────────────────────────────────────────
    // Many common relay boards are active-low. If yours is active-high, set false.
    let active_low = env_flag("RELAY_ACTIVE_LOW", true);
    let mut valves = ValveBoard::new(&cfg.zone_to_gpio(), active_low)?;
    valves.all_off();

    // ── Engine ──────────────────────────────────────────────────────
    let telemetry = TelemetryHandle::new(time::Duration::minutes(stale_min));
    let schedule: Box<dyn ScheduleProvider> = match cfg.window()? {
        Some(window) => Box::new(window),
        None => Box::new(AlwaysOpen),
    };
    let caps = Capabilities {
        actuator: Box::new(valves),
        sensors: Box::new(telemetry.clone()),
        weather: Some(Box::new(telemetry.clone())),
        rain: Some(Box::new(telemetry.clone())),
        schedule,
    };
    let mut coordinator = Coordinator::new(cfg.engine.clone(), caps).context("invalid engine config")?;
    for zone in cfg.zone_configs() {
        coordinator.add_zone(zone)?;
    }

    if env_flag("RESET_STATISTICS", false) {
        coordinator.reset_statistics();
        info!("RESET_STATISTICS set, persisted engine state ignored");
    } else if let Some(saved) = db.load_engine_state().await? {
        match coordinator.restore_state(&saved) {
            Ok(()) => info!(zones = saved.zones.len(), "engine state restored"),
            Err(e) => warn!("persisted engine state not restored: {e}"),
        }
    }

    info!(
        zones = cfg.zones.len(),
        sensors = sensor_map.len(),
        tick_sec,
        "engine ready"
    );

    let engine: SharedEngine = Arc::new(Mutex::new(coordinator));

    // ── Shared state (ephemeral, for the status API) ────────────────
    let shared: SharedState = Arc::new(RwLock::new(SystemState::new()));
    {
        let c = engine.lock().await;
        let mut st = shared.write().await;
        st.set_engine(scheduler::snapshot(&c));
        st.record_system("hub started".to_string());
    }

    // ── Web server ──────────────────────────────────────────────────
    let app_state = web::AppState {
        shared: Arc::clone(&shared),
        db: db.clone(),
    };
    tokio::spawn(async move {
        if let Err(e) = web::serve(app_state).await {
            error!("status api stopped: {e:#}");
        }
    });

    // ── Scheduler ───────────────────────────────────────────────────
    tokio::spawn(scheduler::run(
        Arc::clone(&engine),
        db.clone(),
        Arc::clone(&shared),
        Duration::from_secs(tick_sec.max(1)),
    ));

    // ── MQTT ────────────────────────────────────────────────────────
    let mut mqttoptions = MqttOptions::new("sprinkler-hub", broker, port);
    mqttoptions.set_keep_alive(Duration::from_secs(30));

    let (client, eventloop) = AsyncClient::new(mqttoptions, 20);
    for topic in mqtt::SUBSCRIPTIONS {
        client.subscribe(*topic, QoS::AtLeastOnce).await?;
    }
    info!(topics = ?mqtt::SUBSCRIPTIONS, "hub subscribed");

    let intake = Intake {
        db: db.clone(),
        shared: Arc::clone(&shared),
        engine: Arc::clone(&engine),
        telemetry,
        sensor_map,
    };

    tokio::select! {
        () = intake.run(eventloop) => {}
        res = tokio::signal::ctrl_c() => {
            res.context("failed to listen for ctrl-c")?;
            info!("shutdown requested");
        }
    }

    scheduler::shutdown(&engine, &db, &shared, OffsetDateTime::now_utc()).await;
    Ok(())
}

/// Everything the MQTT loop writes into.
struct Intake {
    db: Db,
    shared: SharedState,
    engine: SharedEngine,
    telemetry: TelemetryHandle,
    sensor_map: HashMap<String, SensorEntry>,
}

impl Intake {
    async fn run(&self, mut eventloop: rumqttc::EventLoop) {
        loop {
            match eventloop.poll().await {
                Ok(Event::Incoming(Packet::Publish(p))) => {
                    self.handle_publish(&p.topic, &p.payload).await;
                }
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("mqtt connected");
                    let mut st = self.shared.write().await;
                    st.mqtt_connected = true;
                    st.record_system("mqtt connected".to_string());
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("mqtt disconnected");
                    let mut st = self.shared.write().await;
                    st.mqtt_connected = false;
                    st.record_system("mqtt disconnected".to_string());
                }
                Ok(_) => {}
                Err(e) => {
                    // Readings go stale on their own; the engine aborts a
                    // running zone once its sensor stays silent long enough.
                    error!("mqtt error: {e}. reconnecting...");
                    let mut st = self.shared.write().await;
                    st.mqtt_connected = false;
                    st.record_error(format!("mqtt error: {e}"));
                    drop(st);

                    sleep(Duration::from_secs(2)).await;
                }
            }
        }
    }

    async fn handle_publish(&self, topic: &str, payload: &[u8]) {
        let now = OffsetDateTime::now_utc();
        let result = match classify(topic) {
            Some(Topic::Reading { node_id }) => self.handle_reading(node_id, payload, now).await,
            Some(Topic::Current) => serde_json::from_slice::<CurrentMsg>(payload).map(|msg| {
                self.telemetry.update(|t| {
                    t.record_current(
                        CurrentConditions {
                            temperature: msg.temperature,
                            humidity: msg.humidity,
                        },
                        now,
                    )
                });
            }),
            Some(Topic::Forecast) => match serde_json::from_slice::<ForecastMsg>(payload) {
                Ok(msg) => {
                    self.telemetry.update(|t| {
                        t.record_forecast(
                            msg.hours,
                            ForecastSummary {
                                rain_probability: msg.rain_probability,
                                rain_amount_mm: msg.rain_amount_mm,
                                min_temperature: msg.min_temperature,
                            },
                            now,
                        )
                    });
                    self.refresh_forecast(now).await;
                    Ok(())
                }
                Err(e) => Err(e),
            },
            Some(Topic::Rain) => match serde_json::from_slice::<RainMsg>(payload) {
                Ok(msg) => {
                    info!(mm = msg.mm, ts = msg.ts, "rain gauge");
                    self.telemetry.update(|t| t.record_rain(msg.mm, now));
                    self.recalculate_deficits(now).await;
                    Ok(())
                }
                Err(e) => Err(e),
            },
            None => {
                warn!(%topic, "unhandled topic");
                Ok(())
            }
        };

        if let Err(e) = result {
            warn!(%topic, "bad json: {e}");
            self.shared
                .write()
                .await
                .record_error(format!("bad json on {topic}: {e}"));
        }
    }

    async fn handle_reading(&self, node_id: &str, payload: &[u8], now: OffsetDateTime) -> serde_json::Result<()> {
        let msg: ReadingMsg = serde_json::from_slice(payload)?;
        tracing::debug!(node = %node_id, ts = msg.ts, count = msg.readings.len(), "telemetry");

        // Qualify sensor_id with node_id so each node's local channel names
        // ("s1", "s2") become unique.
        for r in &msg.readings {
            let qualified_id = format!("{node_id}/{}", r.sensor_id);
            let Some(sensor) = self.sensor_map.get(&qualified_id) else {
                warn!(sensor = %qualified_id, "unknown sensor, skipping");
                continue;
            };
            let value = sensor.convert(r.raw);
            self.telemetry.update(|t| match sensor.kind {
                config::SensorKind::Moisture => t.record_moisture(&sensor.zone_id, value, now),
                config::SensorKind::Temperature => t.record_temperature(&sensor.zone_id, value, now),
            });
            if let Err(e) = self
                .db
                .insert_reading(msg.ts, &qualified_id, &sensor.zone_id, r.raw, value)
                .await
            {
                error!(sensor = %qualified_id, "db: insert_reading failed: {e:#}");
            }
        }

        let readings = msg
            .readings
            .into_iter()
            .map(|r| SensorReading {
                sensor_id: r.sensor_id,
                raw: r.raw,
            })
            .collect();
        self.shared.write().await.record_reading(node_id, readings);
        Ok(())
    }

    /// Books gauge rain against the deficits at once so the status API shows
    /// it before the next tick.
    async fn recalculate_deficits(&self, now: OffsetDateTime) {
        let (events, snapshot) = {
            let mut c = self.engine.lock().await;
            (c.recalculate_deficits(now), scheduler::snapshot(&c))
        };
        scheduler::handle_events(&events, &self.db, &self.shared, now).await;
        self.shared.write().await.set_engine(snapshot);
    }

    /// A new forecast re-evaluates the weather gate right away instead of
    /// waiting for the refresh cadence.
    async fn refresh_forecast(&self, now: OffsetDateTime) {
        let (result, snapshot) = {
            let mut c = self.engine.lock().await;
            (c.refresh_forecast(now), scheduler::snapshot(&c))
        };
        match result {
            Ok(w) => info!(
                rain_mm = w.rain_amount_mm,
                rain_probability = w.rain_probability,
                gate_open = snapshot.gate.is_open(),
                "forecast refreshed"
            ),
            Err(e) => warn!("forecast refresh failed: {e}"),
        }
        self.shared.write().await.set_engine(snapshot);
    }
}
