use serde::Deserialize;

// ---------------------------------------------------------------------------
// MQTT message types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
pub(crate) struct Reading {
    pub(crate) sensor_id: String,
    pub(crate) raw: i64,
}

/// Payload of `tele/<node_id>/reading`.
#[derive(Debug, Deserialize)]
pub(crate) struct ReadingMsg {
    pub(crate) ts: i64,
    pub(crate) readings: Vec<Reading>,
}

/// Payload of `weather/current`. Temperature in °F.
#[derive(Debug, Deserialize)]
pub(crate) struct CurrentMsg {
    #[serde(default)]
    pub(crate) temperature: Option<f64>,
    #[serde(default)]
    pub(crate) humidity: Option<f64>,
}

/// Payload of `weather/forecast`.
#[derive(Debug, Deserialize)]
pub(crate) struct ForecastMsg {
    #[serde(default = "default_forecast_hours")]
    pub(crate) hours: u32,
    pub(crate) rain_probability: f64,
    pub(crate) rain_amount_mm: f64,
    #[serde(default)]
    pub(crate) min_temperature: Option<f64>,
}

fn default_forecast_hours() -> u32 {
    24
}

/// Payload of `weather/rain`: gauge increment since the previous message.
#[derive(Debug, Deserialize)]
pub(crate) struct RainMsg {
    pub(crate) ts: i64,
    pub(crate) mm: f64,
}

// ---------------------------------------------------------------------------
// Topic helpers
// ---------------------------------------------------------------------------

pub(crate) const SUBSCRIPTIONS: &[&str] = &[
    "tele/+/reading",
    "weather/current",
    "weather/forecast",
    "weather/rain",
];

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Topic<'a> {
    Reading { node_id: &'a str },
    Current,
    Forecast,
    Rain,
}

/// Extract node_id from "tele/<node_id>/reading".
pub(crate) fn extract_node_id(topic: &str) -> Option<&str> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() == 3 && parts[0] == "tele" && parts[2] == "reading" && !parts[1].is_empty() {
        Some(parts[1])
    } else {
        None
    }
}

pub(crate) fn classify(topic: &str) -> Option<Topic<'_>> {
    if let Some(node_id) = extract_node_id(topic) {
        return Some(Topic::Reading { node_id });
    }
    match topic {
        "weather/current" => Some(Topic::Current),
        "weather/forecast" => Some(Topic::Forecast),
        "weather/rain" => Some(Topic::Rain),
        _ => None,
    }
}

// ===========================================================================
// Tests
// ===========================================================================
