//! Embedded MQTT broker and telemetry ingest.
//!
//! Plugs publish telemetry to a broker this process embeds. The ingest taps
//! the broker's local link with a wildcard subscription and turns every
//! message under `tele/...` or `stat/...` into a partial
//! [`StateChangedEvent`]: always a liveness marker, plus whatever power
//! state or energy metrics the payload carries. Only the plug manager merges
//! these deltas into authoritative state.

use std::net::SocketAddr;
use std::sync::Arc;
use std::thread;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::clock::Clock;
use crate::events::{ConnectionStatus, ConnectionStatusEvent, Publisher, CLIENT_MQTT};
use crate::plugs::{fields, PlugState, StateChangedEvent};

/// Builds the rumqttd configuration for a single plain-TCP listener.
fn broker_config(listen: SocketAddr) -> Result<rumqttd::Config> {
    let rendered = format!(
        r#"
id = 0

[router]
id = 0
max_connections = 10010
max_outgoing_packet_count = 200
max_segment_size = 104857600
max_segment_count = 10

[v4.1]
name = "v4-1"
listen = "{listen}"
next_connection_delay_ms = 1

[v4.1.connections]
connection_timeout_ms = 60000
max_payload_size = 20480
max_inflight_count = 100
dynamic_filters = true
"#
    );

    let raw = config::Config::builder()
        .add_source(config::File::from_str(&rendered, config::FileFormat::Toml))
        .build()
        .context("failed to assemble broker config")?;
    raw.try_deserialize()
        .context("failed to parse broker config")
}

/// Starts the embedded broker and the ingest loop on dedicated threads.
///
/// The broker's own accept loop is blocking, as is reading from its local
/// link, so both run outside the async runtime; the ingest publishes onto
/// the bus, which never blocks.
pub fn start(
    listen: SocketAddr,
    delta_publisher: Publisher<StateChangedEvent>,
    status_publisher: Publisher<ConnectionStatusEvent>,
    clock: Arc<dyn Clock>,
    cancel: CancellationToken,
) -> Result<()> {
    let config = broker_config(listen)?;
    let mut broker = rumqttd::Broker::new(config);

    let (mut link_tx, mut link_rx) = broker
        .link("tasbridge-ingest")
        .context("failed to open broker link")?;
    link_tx
        .subscribe("#")
        .context("failed to subscribe on broker link")?;

    status_publisher.publish(ConnectionStatusEvent {
        timestamp: clock.now(),
        component: CLIENT_MQTT.to_string(),
        status: ConnectionStatus::Connecting,
        error: None,
        reconnects: 0,
    });

    let broker_status = status_publisher.clone();
    let broker_clock = clock.clone();
    thread::Builder::new()
        .name("mqtt-broker".into())
        .spawn(move || {
            info!(addr = %listen, "starting MQTT broker");
            broker_status.publish(ConnectionStatusEvent {
                timestamp: broker_clock.now(),
                component: CLIENT_MQTT.to_string(),
                status: ConnectionStatus::Connected,
                error: None,
                reconnects: 0,
            });
            if let Err(err) = broker.start() {
                error!(error = %format!("{err:?}"), "MQTT broker error");
                broker_status.publish(ConnectionStatusEvent {
                    timestamp: broker_clock.now(),
                    component: CLIENT_MQTT.to_string(),
                    status: ConnectionStatus::Failed,
                    error: Some(format!("{err:?}")),
                    reconnects: 0,
                });
            }
        })
        .context("failed to spawn broker thread")?;

    thread::Builder::new()
        .name("mqtt-ingest".into())
        .spawn(move || loop {
            if cancel.is_cancelled() {
                return;
            }
            match link_rx.recv() {
                Ok(Some(rumqttd::Notification::Forward(forward))) => {
                    let topic = String::from_utf8_lossy(&forward.publish.topic).to_string();
                    debug!(topic = %topic, bytes = forward.publish.payload.len(), "MQTT message received");
                    if let Some(delta) = parse_publish(&topic, &forward.publish.payload, clock.now())
                    {
                        delta_publisher.publish(delta);
                    }
                }
                Ok(_) => {}
                Err(err) => {
                    error!(error = %format!("{err:?}"), "MQTT ingest link closed");
                    return;
                }
            }
        })
        .context("failed to spawn ingest thread")?;

    Ok(())
}

/// Parses one inbound PUBLISH into a partial state delta.
///
/// The third topic segment of `tele/<*>/<plug_id>/...` or
/// `stat/<*>/<plug_id>/...` names the plug. Any matching message marks
/// liveness; a `POWER` (top-level or under `StatusSTS`) of `"ON"`/`"OFF"`
/// adds the switch state, `StatusSNS.ENERGY` adds energy metrics. Non-JSON
/// payloads still count as liveness.
pub fn parse_publish(
    topic: &str,
    payload: &[u8],
    now: time::OffsetDateTime,
) -> Option<StateChangedEvent> {
    let parts: Vec<&str> = topic.split('/').collect();
    if parts.len() < 3 {
        return None;
    }
    if parts[0] != "tele" && parts[0] != "stat" {
        return None;
    }
    let plug_id = parts[2];
    if plug_id.is_empty() {
        return None;
    }

    let mut state = PlugState {
        mqtt_connected: true,
        last_seen: Some(now),
        ..Default::default()
    };
    let mut updated_fields = vec![
        fields::LAST_SEEN.to_string(),
        fields::MQTT_CONNECTED.to_string(),
    ];

    match serde_json::from_slice::<serde_json::Value>(payload) {
        Err(err) => {
            debug!(topic, error = %err, "non-JSON MQTT payload, marking liveness only");
        }
        Ok(msg) => {
            let power = msg
                .get("POWER")
                .and_then(serde_json::Value::as_str)
                .or_else(|| {
                    msg.get("StatusSTS")
                        .and_then(|sts| sts.get("POWER"))
                        .and_then(serde_json::Value::as_str)
                });
            match power {
                Some("ON") => {
                    state.on = true;
                    state.last_updated = Some(now);
                    updated_fields.push(fields::ON.to_string());
                    updated_fields.push(fields::LAST_UPDATED.to_string());
                }
                Some("OFF") => {
                    state.on = false;
                    state.last_updated = Some(now);
                    updated_fields.push(fields::ON.to_string());
                    updated_fields.push(fields::LAST_UPDATED.to_string());
                }
                _ => {}
            }

            if let Some(energy) = msg.get("StatusSNS").and_then(|sns| sns.get("ENERGY")) {
                let metrics = [
                    ("Power", fields::POWER),
                    ("Voltage", fields::VOLTAGE),
                    ("Current", fields::CURRENT),
                    ("Total", fields::ENERGY),
                ];
                for (key, field) in metrics {
                    if let Some(value) = energy.get(key).and_then(serde_json::Value::as_f64) {
                        match field {
                            fields::POWER => state.power = value,
                            fields::VOLTAGE => state.voltage = value,
                            fields::CURRENT => state.current = value,
                            fields::ENERGY => state.energy = value,
                            _ => {}
                        }
                        updated_fields.push(field.to_string());
                    }
                }
            }
        }
    }

    Some(StateChangedEvent {
        plug_id: plug_id.to_string(),
        state,
        updated_fields: Some(updated_fields),
    })
}
