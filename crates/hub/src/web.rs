use anyhow::{Context, Result};
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::response::{IntoResponse, Json, Response};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use sprinkler_engine::ZoneStatus;
use std::env;
use std::net::SocketAddr;
use tokio::net::TcpListener;

use crate::db::{Db, WateringEvent};
use crate::state::SharedState;

/// Watering events returned with a zone's detail.
const ZONE_HISTORY: i64 = 20;

#[derive(Clone)]
pub struct AppState {
    pub shared: SharedState,
    pub db: Db,
}

#[derive(Serialize)]
struct ZoneDetail {
    status: ZoneStatus,
    /// (unix ts, value) of the newest sensor reading.
    last_reading: Option<(i64, f64)>,
    history: Vec<WateringEvent>,
}

// ---------------------------------------------------------------------------
// Routes
// ---------------------------------------------------------------------------

pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/api/status", get(api_status))
        .route("/api/zones/{zone_id}", get(api_zone))
        .with_state(state)
}

async fn api_status(State(state): State<AppState>) -> impl IntoResponse {
    let st = state.shared.read().await;
    Json(st.to_status())
}

async fn api_zone(State(state): State<AppState>, Path(zone_id): Path<String>) -> Response {
    let status = {
        let st = state.shared.read().await;
        st.zone(&zone_id).cloned()
    };
    let Some(status) = status else {
        return (StatusCode::NOT_FOUND, format!("unknown zone '{zone_id}'")).into_response();
    };

    let history = state.db.recent_watering_events(&zone_id, ZONE_HISTORY).await;
    let last_reading = state.db.latest_zone_reading(&zone_id).await;
    match (history, last_reading) {
        (Ok(history), Ok(last_reading)) => Json(ZoneDetail {
            status,
            last_reading,
            history,
        })
        .into_response(),
        (Err(e), _) | (_, Err(e)) => {
            tracing::error!(zone = %zone_id, "zone detail query failed: {e:#}");
            (StatusCode::INTERNAL_SERVER_ERROR, "database error").into_response()
        }
    }
}

// ---------------------------------------------------------------------------
// Server entry-point
// ---------------------------------------------------------------------------

pub async fn serve(state: AppState) -> Result<()> {
    let port: u16 = env::var("WEB_PORT")
        .ok()
        .and_then(|s| s.parse().ok())
        .unwrap_or(8080);

    let addr = SocketAddr::from(([0, 0, 0, 0], port));
    let listener = TcpListener::bind(addr)
        .await
        .with_context(|| format!("failed to bind web port {addr}"))?;

    tracing::info!(%addr, "status api listening");

    axum::serve(listener, router(state))
        .await
        .context("web server error")
}

// ===========================================================================
// Tests
// ===========================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::{EngineSnapshot, SystemState};
    use axum::body::Body;
    use axum::http::Request;
    use http_body_util::BodyExt;
    use sprinkler_engine::Phase;
    use std::sync::Arc;
    use tokio::sync::RwLock;
    use tower::ServiceExt;

    fn zone_status(zone_id: &str) -> ZoneStatus {
        ZoneStatus {
            zone_id: zone_id.into(),
            name: "Front lawn".into(),
            phase: Phase::Soaking,
            cycles_completed: 1,
            allocated_cycles: 3,
            allocated_min: 45.0,
            requested_min: 45.0,
            watered_min: 15.0,
            deficit_mm: 4.0,
            et_today_mm: 1.2,
            rain_today_mm: 0.0,
            learned_rate: 0.5,
            rate_confidence: 0.0,
            moisture: Some(18.0),
            outcome: None,
            cycles_total: 1,
            last_session: None,
        }
    }

    async fn app() -> (Router, Db) {
        let db = Db::connect("sqlite::memory:").await.unwrap();
        db.migrate().await.unwrap();
        let mut st = SystemState::new();
        st.set_engine(EngineSnapshot {
            enabled: true,
            watering: None,
            zones: vec![zone_status("front")],
            ..EngineSnapshot::default()
        });
        st.record_system("hub started".into());
        let state = AppState {
            shared: Arc::new(RwLock::new(st)),
            db: db.clone(),
        };
        (router(state), db)
    }

    async fn get_json(app: Router, uri: &str) -> (StatusCode, serde_json::Value) {
        let resp = app
            .oneshot(Request::get(uri).body(Body::empty()).unwrap())
            .await
            .unwrap();
        let status = resp.status();
        let bytes = resp.into_body().collect().await.unwrap().to_bytes();
        let json = serde_json::from_slice(&bytes).unwrap_or(serde_json::Value::Null);
        (status, json)
    }

    // -- /api/status --------------------------------------------------------

    #[tokio::test]
    async fn status_reports_engine_and_events() {
        let (app, _db) = app().await;
        let (code, json) = get_json(app, "/api/status").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(json["engine"]["enabled"], true);
        assert_eq!(json["engine"]["zones"][0]["zone_id"], "front");
        assert_eq!(json["engine"]["zones"][0]["phase"], "soaking");
        assert_eq!(json["events"][0]["kind"], "system");
    }

    // -- /api/zones/{zone_id} -----------------------------------------------

    #[tokio::test]
    async fn zone_detail_includes_history() {
        let (app, db) = app().await;
        db.insert_watering_event(100, "front", 1, 15.0, "cycle").await.unwrap();
        db.insert_reading(90, "node-a/s1", "front", 21000, 18.0).await.unwrap();

        let (code, json) = get_json(app, "/api/zones/front").await;
        assert_eq!(code, StatusCode::OK);
        assert_eq!(json["status"]["zone_id"], "front");
        assert_eq!(json["status"]["et_today_mm"], 1.2);
        assert_eq!(json["history"][0]["result"], "cycle");
        assert_eq!(json["last_reading"][1], 18.0);
    }

    #[tokio::test]
    async fn unknown_zone_is_404() {
        let (app, _db) = app().await;
        let (code, _) = get_json(app, "/api/zones/nowhere").await;
        assert_eq!(code, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn no_control_endpoints() {
        let (app, _db) = app().await;
        let resp = app
            .oneshot(
                Request::post("/api/zones/front")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(resp.status(), StatusCode::METHOD_NOT_ALLOWED);
    }
}
