//! Plug configuration and runtime state types.

mod client;
mod config;
mod manager;
mod store;

pub use client::{DeviceCommander, TasmotaClient};
pub use config::{load_plugs, parse_plugs, PlugsFile};
pub use manager::Manager;
pub use store::StateStore;

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Kind of accessory a plug is exposed as.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PlugType {
    #[default]
    Outlet,
    Bulb,
}

/// Optional hardware capabilities of a plug.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PlugFeatures {
    #[serde(default)]
    pub power_monitoring: bool,
    #[serde(default)]
    pub energy_tracking: bool,
}

/// A single configured plug. Immutable after load.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Plug {
    pub id: String,
    pub name: String,
    pub address: String,
    #[serde(default)]
    pub model: String,
    #[serde(rename = "type", default)]
    pub kind: PlugType,
    #[serde(default)]
    pub features: PlugFeatures,
    #[serde(rename = "homekit", default = "default_true")]
    pub homekit_enabled: bool,
    #[serde(rename = "web", default = "default_true")]
    pub web_enabled: bool,
}

fn default_true() -> bool {
    true
}

/// Runtime state of a plug. Owned exclusively by the [`StateStore`]; every
/// other component reads copies.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PlugState {
    pub on: bool,
    /// Watts
    pub power: f64,
    /// Volts
    pub voltage: f64,
    /// Amperes
    pub current: f64,
    /// kWh
    pub energy: f64,
    pub last_updated: Option<OffsetDateTime>,
    pub mqtt_connected: bool,
    pub last_seen: Option<OffsetDateTime>,
}

/// Field names accepted in [`StateChangedEvent::updated_fields`].
pub mod fields {
    pub const ON: &str = "on";
    pub const POWER: &str = "power";
    pub const VOLTAGE: &str = "voltage";
    pub const CURRENT: &str = "current";
    pub const ENERGY: &str = "energy";
    pub const MQTT_CONNECTED: &str = "mqtt_connected";
    pub const LAST_SEEN: &str = "last_seen";
    pub const LAST_UPDATED: &str = "last_updated";
}

/// Partial state delta from telemetry ingest. `updated_fields` names exactly
/// the fields of `state` that carry new information; when absent, the
/// zero-time fallback in the store applies.
#[derive(Debug, Clone)]
pub struct StateChangedEvent {
    pub plug_id: String,
    pub state: PlugState,
    pub updated_fields: Option<Vec<String>>,
}

/// Telemetry-channel health derived from the time since the last ingest.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionState {
    Connected,
    Stale,
    Disconnected,
}

impl ConnectionState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionState::Connected => "connected",
            ConnectionState::Stale => "stale",
            ConnectionState::Disconnected => "disconnected",
        }
    }
}

impl std::fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Classifies a plug's telemetry channel from its last ingest time. Under
/// 30 s of silence the plug counts as connected, under 60 s as stale, beyond
/// that (or if it was never seen) as disconnected.
pub fn classify_connection(
    last_seen: Option<OffsetDateTime>,
    now: OffsetDateTime,
) -> (ConnectionState, String) {
    let Some(last_seen) = last_seen else {
        return (ConnectionState::Disconnected, "Never seen".to_string());
    };

    let since = (now - last_seen).whole_seconds().max(0);
    let note = format!("Last seen: {since}s ago");
    let state = if since < 30 {
        ConnectionState::Connected
    } else if since < 60 {
        ConnectionState::Stale
    } else {
        ConnectionState::Disconnected
    };
    (state, note)
}
