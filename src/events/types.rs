//! Event types carried on the in-process bus.
//!
//! All events are immutable once published. `StateUpdateEvent` is the
//! authoritative snapshot emitted by the plug manager after every state
//! mutation; it is the only event the HomeKit and web adapters consume and
//! doubles as the SSE wire payload.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

use crate::plugs::ConnectionState;

/// Where an authoritative state update originated.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UpdateSource {
    /// Baseline snapshot published when the manager is constructed.
    Initial,
    /// Confirmation of a device command on the HTTP fast path.
    Command,
    /// Result of a `Status 0` fetch.
    Status,
    /// Merge of a telemetry delta received over the bus.
    Eventbus,
}

/// Authoritative per-plug snapshot, also the SSE payload schema.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StateUpdateEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub source: UpdateSource,
    pub plug_id: String,
    pub name: String,
    pub on: bool,
    pub power: f64,
    pub voltage: f64,
    pub current: f64,
    pub energy: f64,
    pub mqtt_connected: bool,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_seen: Option<OffsetDateTime>,
    #[serde(with = "time::serde::rfc3339::option")]
    pub last_updated: Option<OffsetDateTime>,
    pub connection_state: ConnectionState,
    pub connection_note: String,
}

impl StateUpdateEvent {
    /// Whether two events carry the same logical state, ignoring timestamp
    /// and source. Floats compare with a small tolerance.
    pub fn logically_equal(&self, other: &StateUpdateEvent) -> bool {
        self.plug_id == other.plug_id
            && self.name == other.name
            && self.on == other.on
            && almost_equal(self.power, other.power)
            && almost_equal(self.voltage, other.voltage)
            && almost_equal(self.current, other.current)
            && almost_equal(self.energy, other.energy)
            && self.mqtt_connected == other.mqtt_connected
            && self.last_seen == other.last_seen
            && self.last_updated == other.last_updated
            && self.connection_state == other.connection_state
            && self.connection_note == other.connection_note
    }
}

fn almost_equal(a: f64, b: f64) -> bool {
    (a - b).abs() < 0.001
}

/// Supported plug commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CommandType {
    SetPower,
}

impl CommandType {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandType::SetPower => "set_power",
        }
    }
}

/// Which adapter requested a command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommandSource {
    Web,
    Homekit,
}

impl CommandSource {
    pub fn as_str(&self) -> &'static str {
        match self {
            CommandSource::Web => "web",
            CommandSource::Homekit => "homekit",
        }
    }
}

/// Requested control action for a plug. Flows point-to-point into the
/// manager's command channel and is fanned out on the bus for observability.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub source: CommandSource,
    pub plug_id: String,
    pub command_type: CommandType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub on: Option<bool>,
}

/// A plug-scoped failure (device unreachable, unparseable response, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ErrorEvent {
    pub plug_id: String,
    pub error: String,
}

/// Lifecycle state of a long-running component.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
    Failed,
}

impl ConnectionStatus {
    pub const ALL: [ConnectionStatus; 5] = [
        ConnectionStatus::Disconnected,
        ConnectionStatus::Connecting,
        ConnectionStatus::Connected,
        ConnectionStatus::Reconnecting,
        ConnectionStatus::Failed,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
            ConnectionStatus::Reconnecting => "reconnecting",
            ConnectionStatus::Failed => "failed",
        }
    }
}

/// Component lifecycle event (mqtt broker, HAP server, web server).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ConnectionStatusEvent {
    #[serde(with = "time::serde::rfc3339")]
    pub timestamp: OffsetDateTime,
    pub component: String,
    pub status: ConnectionStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(default)]
    pub reconnects: u64,
}
