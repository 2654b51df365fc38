//! Plug manager: the single writer of authoritative plug state.
//!
//! Three cooperating loops run here. The command loop consumes control
//! requests from the bounded command channel and drives the HTTP fast path.
//! The delta loop merges partial telemetry deltas published by the MQTT
//! ingest. The connection monitor watches `last_seen` and reconfigures
//! devices whose telemetry stream has gone silent. Every mutation goes
//! through the [`StateStore`] and is followed by an authoritative
//! `StateUpdateEvent` on the bus.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{anyhow, bail, Context, Result};
use parking_lot::{Mutex, RwLock};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::clock::Clock;
use crate::events::{
    Bus, CommandEvent, CommandType, ErrorEvent, Publisher, StateUpdateEvent, Subscriber,
    UpdateSource, CLIENT_PLUG_MANAGER,
};
use crate::plugs::{
    classify_connection, DeviceCommander, Plug, PlugState, StateChangedEvent, StateStore,
    TasmotaClient,
};

/// Cadence of the connection monitor.
const MONITOR_INTERVAL: Duration = Duration::from_secs(30);
/// Grace period before the one-shot never-connected check runs.
const INITIAL_CHECK_DELAY_SECS: i64 = 60;
/// Commanding a plug silent longer than this logs a warning (but proceeds:
/// user intent wins).
const COMMAND_STALE_SECS: i64 = 60;
/// Silence beyond this triggers a reachability probe and reconfiguration.
const SILENT_THRESHOLD_SECS: i64 = 120;

pub struct Manager {
    store: StateStore,
    clients: RwLock<HashMap<String, Arc<dyn DeviceCommander>>>,
    clock: Arc<dyn Clock>,
    state_publisher: Publisher<StateUpdateEvent>,
    error_publisher: Publisher<ErrorEvent>,
    delta_subscriber: Mutex<Option<Subscriber<StateChangedEvent>>>,
}

impl Manager {
    /// Builds the manager, one HTTP client per plug, and publishes the
    /// baseline `source: initial` update for each.
    pub fn new(plugs: &[Plug], bus: &Bus, clock: Arc<dyn Clock>) -> Result<Arc<Self>> {
        let client = bus
            .client(CLIENT_PLUG_MANAGER)
            .context("failed to get plugmanager eventbus client")?;

        let mut device_clients: HashMap<String, Arc<dyn DeviceCommander>> = HashMap::new();
        for plug in plugs {
            let http = TasmotaClient::new(&plug.address)
                .with_context(|| format!("failed to create client for {}", plug.id))?;
            device_clients.insert(plug.id.clone(), Arc::new(http));
        }

        let manager = Arc::new(Manager {
            store: StateStore::new(plugs),
            clients: RwLock::new(device_clients),
            clock,
            state_publisher: client.publisher(),
            error_publisher: client.publisher(),
            delta_subscriber: Mutex::new(Some(client.subscriber())),
        });

        for plug in plugs {
            if let Some((_, state)) = manager.store.get(&plug.id) {
                manager.publish_state_update(UpdateSource::Initial, &plug.id, &state);
            }
            info!(id = %plug.id, address = %plug.address, "initialized plug client");
        }

        Ok(manager)
    }

    /// By-value copy of every plug and its state.
    pub fn snapshot(&self) -> HashMap<String, (Plug, PlugState)> {
        self.store.snapshot()
    }

    /// By-value copy of one plug and its state.
    pub fn plug(&self, plug_id: &str) -> Option<(Plug, PlugState)> {
        self.store.get(plug_id)
    }

    pub fn plug_count(&self) -> usize {
        self.store.len()
    }

    /// Replaces the device client for a plug. Intended for tests.
    pub fn set_client_for_testing(&self, plug_id: &str, client: Arc<dyn DeviceCommander>) {
        self.clients.write().insert(plug_id.to_string(), client);
    }

    /// Publishes a plug-scoped error on the bus.
    pub fn report_error(&self, plug_id: &str, error: String) {
        self.error_publisher.publish(ErrorEvent {
            plug_id: plug_id.to_string(),
            error,
        });
    }

    fn device_client(&self, plug_id: &str) -> Result<Arc<dyn DeviceCommander>> {
        self.clients
            .read()
            .get(plug_id)
            .cloned()
            .ok_or_else(|| anyhow!("plug {plug_id} not found"))
    }

    /// Sets the power state of a plug over the HTTP fast path.
    pub async fn set_power(&self, plug_id: &str, on: bool) -> Result<()> {
        let Some((_, state)) = self.store.get(plug_id) else {
            bail!("plug {plug_id} not found");
        };

        if let Some(last_seen) = state.last_seen {
            let since = (self.clock.now() - last_seen).whole_seconds();
            if since > COMMAND_STALE_SECS {
                warn!(
                    id = plug_id,
                    since_seconds = since,
                    "attempting to control plug that hasn't been seen recently"
                );
            }
        }

        let command = if on { "Power ON" } else { "Power OFF" };
        let client = self.device_client(plug_id)?;
        if let Err(err) = client.execute(command).await {
            self.error_publisher.publish(ErrorEvent {
                plug_id: plug_id.to_string(),
                error: format!("failed to set power: {err:#}"),
            });
            return Err(err);
        }

        let now = self.clock.now();
        let state = self
            .store
            .apply_power(plug_id, on, now)
            .ok_or_else(|| anyhow!("plug {plug_id} not found"))?;
        self.publish_state_update(UpdateSource::Command, plug_id, &state);

        Ok(())
    }

    /// Fetches `Status 0` from a plug and folds the power state in. Updates
    /// `last_updated` but not `last_seen` (HTTP reachability is not MQTT
    /// liveness).
    pub async fn get_status(&self, plug_id: &str) -> Result<PlugState> {
        let client = self.device_client(plug_id)?;
        let response = client
            .execute("Status 0")
            .await
            .context("failed to get status")?;
        let on = parse_status_power(&response).context("failed to parse status")?;

        let now = self.clock.now();
        let state = self
            .store
            .apply_power(plug_id, on, now)
            .ok_or_else(|| anyhow!("plug {plug_id} not found"))?;
        self.publish_state_update(UpdateSource::Status, plug_id, &state);

        Ok(state)
    }

    /// Points a plug at the embedded broker and its canonical topic.
    pub async fn configure_mqtt(
        &self,
        plug_id: &str,
        broker_host: &str,
        broker_port: u16,
    ) -> Result<()> {
        info!(
            plug_id,
            broker = broker_host,
            port = broker_port,
            "configuring MQTT for plug"
        );

        let commands = vec![
            format!("MqttHost {broker_host}"),
            format!("MqttPort {broker_port}"),
            format!("Topic tasmota/{plug_id}"),
        ];

        let client = self.device_client(plug_id)?;
        client
            .execute_backlog(&commands)
            .await
            .context("failed to configure MQTT")?;

        info!(plug_id, "MQTT configured for plug");
        Ok(())
    }

    /// Command loop: drains the point-to-point command channel.
    pub async fn process_commands(
        self: Arc<Self>,
        mut commands: mpsc::Receiver<CommandEvent>,
        cancel: CancellationToken,
    ) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                cmd = commands.recv() => {
                    let Some(cmd) = cmd else { return };
                    self.handle_command(cmd).await;
                }
            }
        }
    }

    async fn handle_command(&self, cmd: CommandEvent) {
        if !self.store.contains(&cmd.plug_id) {
            warn!(plug_id = %cmd.plug_id, "command for unknown plug");
            self.error_publisher.publish(ErrorEvent {
                plug_id: cmd.plug_id.clone(),
                error: format!("plug {} not found", cmd.plug_id),
            });
            return;
        }

        match cmd.command_type {
            CommandType::SetPower => {
                let Some(on) = cmd.on else {
                    warn!(plug_id = %cmd.plug_id, "set_power command without a value");
                    return;
                };
                if let Err(err) = self.set_power(&cmd.plug_id, on).await {
                    error!(
                        plug_id = %cmd.plug_id,
                        error = %format!("{err:#}"),
                        "failed to process command"
                    );
                }
            }
        }
    }

    /// Delta loop: merges telemetry deltas published on the bus.
    pub async fn process_state_events(self: Arc<Self>, cancel: CancellationToken) {
        let Some(mut subscriber) = self.delta_subscriber.lock().take() else {
            warn!("state event loop already running");
            return;
        };
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = subscriber.recv() => {
                    let Some(event) = event else { return };
                    self.apply_delta(event);
                }
            }
        }
    }

    fn apply_delta(&self, event: StateChangedEvent) {
        let Some(merged) =
            self.store
                .merge(&event.plug_id, &event.state, event.updated_fields.as_deref())
        else {
            warn!(plug_id = %event.plug_id, "received state event for unknown plug");
            return;
        };

        debug!(
            plug_id = %event.plug_id,
            on = merged.on,
            power = merged.power,
            mqtt_connected = merged.mqtt_connected,
            "merged state from eventbus"
        );
        self.publish_state_update(UpdateSource::Eventbus, &event.plug_id, &merged);
    }

    /// Connection monitor: a 30 s ticker that first (once, after a 60 s
    /// grace) reconfigures plugs that never connected, then on every
    /// subsequent tick probes plugs silent for over two minutes.
    pub async fn monitor_connections(
        self: Arc<Self>,
        broker_host: String,
        broker_port: u16,
        cancel: CancellationToken,
    ) {
        let started = self.clock.now();
        let mut initial_check_done = false;

        let mut ticker = tokio::time::interval(MONITOR_INTERVAL);
        // The first tick of a tokio interval completes immediately; swallow
        // it so checks start one full period after startup.
        ticker.tick().await;

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                _ = ticker.tick() => {
                    if !initial_check_done {
                        let elapsed = (self.clock.now() - started).whole_seconds();
                        if elapsed > INITIAL_CHECK_DELAY_SECS {
                            initial_check_done = true;
                            self.run_initial_check(&broker_host, broker_port).await;
                        }
                    } else {
                        self.run_liveness_check(&broker_host, broker_port).await;
                    }
                }
            }
        }
    }

    /// One-shot check for plugs that never produced telemetry: push the MQTT
    /// configuration again and probe reachability. Failures are reported and
    /// left for subsequent liveness ticks.
    async fn run_initial_check(&self, broker_host: &str, broker_port: u16) {
        for plug_id in self.store.plug_ids() {
            let Some((_, state)) = self.store.get(&plug_id) else {
                continue;
            };
            if state.last_seen.is_some() {
                continue;
            }

            warn!(
                plug_id = %plug_id,
                "plug has never connected to MQTT, attempting reconfiguration"
            );
            if let Err(err) = self.configure_mqtt(&plug_id, broker_host, broker_port).await {
                error!(
                    plug_id = %plug_id,
                    error = %format!("{err:#}"),
                    "failed to reconfigure MQTT for offline plug"
                );
                self.error_publisher.publish(ErrorEvent {
                    plug_id: plug_id.clone(),
                    error: format!("plug never connected, reconfiguration failed: {err:#}"),
                });
                continue;
            }

            if let Err(err) = self.get_status(&plug_id).await {
                error!(
                    plug_id = %plug_id,
                    error = %format!("{err:#}"),
                    "plug not reachable via HTTP"
                );
            }
        }
    }

    /// Periodic check for plugs whose telemetry went silent: probe over
    /// HTTP, and when the device answers but stays mute on MQTT, push the
    /// broker configuration again.
    async fn run_liveness_check(&self, broker_host: &str, broker_port: u16) {
        let now = self.clock.now();
        for plug_id in self.store.plug_ids() {
            let Some((_, state)) = self.store.get(&plug_id) else {
                continue;
            };
            let Some(last_seen) = state.last_seen else {
                continue;
            };
            let since = (now - last_seen).whole_seconds();
            if since <= SILENT_THRESHOLD_SECS {
                continue;
            }

            warn!(
                plug_id = %plug_id,
                since_seconds = since,
                "plug hasn't been seen in a while, checking connectivity"
            );

            match self.get_status(&plug_id).await {
                Err(err) => {
                    error!(
                        plug_id = %plug_id,
                        error = %format!("{err:#}"),
                        since_seconds = since,
                        "plug not reachable via HTTP"
                    );
                    self.error_publisher.publish(ErrorEvent {
                        plug_id: plug_id.clone(),
                        error: format!("plug unreachable for {since}s: {err:#}"),
                    });
                }
                Ok(_) => {
                    info!(
                        plug_id = %plug_id,
                        "plug reachable via HTTP but not MQTT, reconfiguring"
                    );
                    if let Err(err) =
                        self.configure_mqtt(&plug_id, broker_host, broker_port).await
                    {
                        error!(
                            plug_id = %plug_id,
                            error = %format!("{err:#}"),
                            "failed to reconfigure MQTT"
                        );
                    }
                }
            }
        }
    }

    fn publish_state_update(&self, source: UpdateSource, plug_id: &str, state: &PlugState) {
        let Some((plug, _)) = self.store.get(plug_id) else {
            return;
        };

        let now = self.clock.now();
        let (connection_state, connection_note) = classify_connection(state.last_seen, now);

        self.state_publisher.publish(StateUpdateEvent {
            timestamp: now,
            source,
            plug_id: plug_id.to_string(),
            name: plug.name,
            on: state.on,
            power: state.power,
            voltage: state.voltage,
            current: state.current,
            energy: state.energy,
            mqtt_connected: state.mqtt_connected,
            last_seen: state.last_seen,
            last_updated: state.last_updated,
            connection_state,
            connection_note,
        });
    }
}

/// Extracts the power state from a `Status 0` response. Accepts
/// `{"Status":{"Power":...}}` with a string or numeric value, and the
/// top-level `{"POWER":"ON"}` shape some firmwares return.
fn parse_status_power(response: &[u8]) -> Result<bool> {
    let value: serde_json::Value =
        serde_json::from_slice(response).context("status response is not JSON")?;

    if let Some(power) = value.get("Status").and_then(|s| s.get("Power")) {
        if let Some(on) = power_value(power) {
            return Ok(on);
        }
    }
    if let Some(power) = value.get("POWER") {
        if let Some(on) = power_value(power) {
            return Ok(on);
        }
    }

    bail!("no power state in status response");
}

fn power_value(value: &serde_json::Value) -> Option<bool> {
    match value {
        serde_json::Value::String(s) => Some(s == "ON"),
        serde_json::Value::Number(n) => Some(n.as_i64().unwrap_or(0) != 0),
        _ => None,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::clock::ManualClock;
    use crate::events::CommandSource;
    use crate::plugs::fields;
    use std::collections::VecDeque;
    use time::macros::datetime;

    const T0: time::OffsetDateTime = datetime!(2024-06-01 12:00:00 UTC);

    #[derive(Default)]
    struct FakeDevice {
        commands: Mutex<Vec<String>>,
        backlogs: Mutex<Vec<Vec<String>>>,
        responses: Mutex<VecDeque<Vec<u8>>>,
        fail: std::sync::atomic::AtomicBool,
    }

    impl FakeDevice {
        fn set_fail(&self, fail: bool) {
            self.fail.store(fail, std::sync::atomic::Ordering::SeqCst);
        }

        fn commands(&self) -> Vec<String> {
            self.commands.lock().clone()
        }

        fn backlogs(&self) -> Vec<Vec<String>> {
            self.backlogs.lock().clone()
        }
    }

    #[async_trait::async_trait]
    impl DeviceCommander for FakeDevice {
        async fn execute(&self, command: &str) -> Result<Vec<u8>> {
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                bail!("device unreachable");
            }
            self.commands.lock().push(command.to_string());
            Ok(self
                .responses
                .lock()
                .pop_front()
                .unwrap_or_else(|| br#"{"StatusSTS":{"POWER":"ON"}}"#.to_vec()))
        }

        async fn execute_backlog(&self, commands: &[String]) -> Result<Vec<u8>> {
            if self.fail.load(std::sync::atomic::Ordering::SeqCst) {
                bail!("device unreachable");
            }
            self.backlogs.lock().push(commands.to_vec());
            Ok(Vec::new())
        }
    }

    struct Fixture {
        bus: Bus,
        manager: Arc<Manager>,
        clock: Arc<ManualClock>,
        device: Arc<FakeDevice>,
    }

    fn fixture() -> Fixture {
        let bus = Bus::new();
        let clock = ManualClock::new(T0);
        let plugs = vec![Plug {
            id: "lamp".into(),
            name: "Lamp".into(),
            address: "192.168.1.10".into(),
            model: "S31".into(),
            kind: Default::default(),
            features: Default::default(),
            homekit_enabled: true,
            web_enabled: true,
        }];
        let manager = Manager::new(&plugs, &bus, clock.clone()).unwrap();
        let device = Arc::new(FakeDevice::default());
        manager.set_client_for_testing("lamp", device.clone());
        Fixture {
            bus,
            manager,
            clock,
            device,
        }
    }

    #[tokio::test]
    async fn set_power_drives_device_and_publishes_command_update() {
        let fx = fixture();
        let mut updates = fx
            .bus
            .client(crate::events::CLIENT_WEB)
            .unwrap()
            .subscriber::<StateUpdateEvent>();

        fx.manager.set_power("lamp", true).await.unwrap();

        assert_eq!(fx.device.commands(), vec!["Power ON".to_string()]);
        let (_, state) = fx.manager.plug("lamp").unwrap();
        assert!(state.on);
        assert_eq!(state.last_updated, Some(T0));
        assert_eq!(state.last_seen, None, "commands must not touch last_seen");

        let update = updates.recv().await.unwrap();
        assert_eq!(update.source, UpdateSource::Command);
        assert!(update.on);
    }

    #[tokio::test]
    async fn set_power_failure_publishes_error_and_keeps_state() {
        let fx = fixture();
        let mut errors = fx
            .bus
            .client(crate::events::CLIENT_WEB)
            .unwrap()
            .subscriber::<ErrorEvent>();
        fx.device.set_fail(true);

        assert!(fx.manager.set_power("lamp", true).await.is_err());

        let (_, state) = fx.manager.plug("lamp").unwrap();
        assert!(!state.on, "failed command must not mutate state");
        assert_eq!(state.last_updated, None);

        let err = errors.recv().await.unwrap();
        assert_eq!(err.plug_id, "lamp");
        assert!(err.error.contains("failed to set power"));
    }

    #[tokio::test]
    async fn set_power_unknown_plug_errors() {
        let fx = fixture();
        assert!(fx.manager.set_power("ghost", true).await.is_err());
    }

    #[tokio::test]
    async fn set_power_proceeds_when_plug_is_stale() {
        let fx = fixture();
        fx.manager.store.merge(
            "lamp",
            &PlugState {
                last_seen: Some(T0),
                mqtt_connected: true,
                ..Default::default()
            },
            Some(&[fields::LAST_SEEN.into(), fields::MQTT_CONNECTED.into()]),
        );
        fx.clock.advance(time::Duration::seconds(300));

        // User intent wins over staleness.
        fx.manager.set_power("lamp", false).await.unwrap();
        assert_eq!(fx.device.commands(), vec!["Power OFF".to_string()]);
    }

    #[tokio::test]
    async fn get_status_parses_all_response_shapes() {
        let fx = fixture();

        for (response, expected) in [
            (r#"{"Status":{"Power":1}}"#, true),
            (r#"{"Status":{"Power":0}}"#, false),
            (r#"{"Status":{"Power":"ON"}}"#, true),
            (r#"{"POWER":"OFF"}"#, false),
        ] {
            *fx.device.responses.lock() = VecDeque::from([response.as_bytes().to_vec()]);
            let state = fx.manager.get_status("lamp").await.unwrap();
            assert_eq!(state.on, expected, "response {response}");
        }
    }

    #[tokio::test]
    async fn get_status_rejects_unparseable_payload() {
        let fx = fixture();
        *fx.device.responses.lock() = VecDeque::from([b"not json".to_vec()]);
        assert!(fx.manager.get_status("lamp").await.is_err());

        *fx.device.responses.lock() = VecDeque::from([b"{}".to_vec()]);
        assert!(fx.manager.get_status("lamp").await.is_err());
    }

    #[tokio::test]
    async fn delta_merge_publishes_eventbus_update() {
        let fx = fixture();
        let mut updates = fx
            .bus
            .client(crate::events::CLIENT_WEB)
            .unwrap()
            .subscriber::<StateUpdateEvent>();

        fx.manager.apply_delta(StateChangedEvent {
            plug_id: "lamp".into(),
            state: PlugState {
                on: true,
                last_seen: Some(T0),
                last_updated: Some(T0),
                mqtt_connected: true,
                ..Default::default()
            },
            updated_fields: Some(vec![
                fields::ON.into(),
                fields::LAST_SEEN.into(),
                fields::LAST_UPDATED.into(),
                fields::MQTT_CONNECTED.into(),
            ]),
        });

        let update = updates.recv().await.unwrap();
        assert_eq!(update.source, UpdateSource::Eventbus);
        assert!(update.on);
        assert!(update.mqtt_connected);
    }

    #[tokio::test]
    async fn stale_echo_after_command_wins() {
        let fx = fixture();

        // Command confirms ON...
        fx.manager.set_power("lamp", true).await.unwrap();
        assert!(fx.manager.plug("lamp").unwrap().1.on);

        // ...then a (stale) OFF echo arrives. Newest information wins; the
        // design guarantees convergence to the last ingest, not latching.
        fx.clock.advance(time::Duration::milliseconds(10));
        let now = fx.clock.now();
        fx.manager.apply_delta(StateChangedEvent {
            plug_id: "lamp".into(),
            state: PlugState {
                on: false,
                last_seen: Some(now),
                last_updated: Some(now),
                mqtt_connected: true,
                ..Default::default()
            },
            updated_fields: Some(vec![
                fields::ON.into(),
                fields::LAST_SEEN.into(),
                fields::LAST_UPDATED.into(),
                fields::MQTT_CONNECTED.into(),
            ]),
        });

        assert!(!fx.manager.plug("lamp").unwrap().1.on);
    }

    #[tokio::test]
    async fn unknown_command_publishes_error() {
        let fx = fixture();
        let mut errors = fx
            .bus
            .client(crate::events::CLIENT_WEB)
            .unwrap()
            .subscriber::<ErrorEvent>();

        fx.manager
            .handle_command(CommandEvent {
                timestamp: T0,
                source: CommandSource::Web,
                plug_id: "ghost".into(),
                command_type: CommandType::SetPower,
                on: Some(true),
            })
            .await;

        let err = errors.recv().await.unwrap();
        assert_eq!(err.plug_id, "ghost");
    }

    #[tokio::test]
    async fn initial_check_reconfigures_never_seen_plugs() {
        let fx = fixture();
        *fx.device.responses.lock() = VecDeque::from([br#"{"Status":{"Power":0}}"#.to_vec()]);

        fx.manager.run_initial_check("10.0.0.1", 1883).await;

        let backlogs = fx.device.backlogs();
        assert_eq!(backlogs.len(), 1);
        assert_eq!(
            backlogs[0],
            vec![
                "MqttHost 10.0.0.1".to_string(),
                "MqttPort 1883".to_string(),
                "Topic tasmota/lamp".to_string(),
            ]
        );
        // Follow-up status fetch ran.
        assert_eq!(fx.device.commands(), vec!["Status 0".to_string()]);
    }

    #[tokio::test]
    async fn initial_check_skips_seen_plugs() {
        let fx = fixture();
        fx.manager.store.merge(
            "lamp",
            &PlugState {
                last_seen: Some(T0),
                mqtt_connected: true,
                ..Default::default()
            },
            Some(&[fields::LAST_SEEN.into(), fields::MQTT_CONNECTED.into()]),
        );

        fx.manager.run_initial_check("10.0.0.1", 1883).await;
        assert!(fx.device.backlogs().is_empty());
    }

    #[tokio::test]
    async fn liveness_check_reconfigures_silent_but_reachable_plug() {
        let fx = fixture();
        fx.manager.store.merge(
            "lamp",
            &PlugState {
                last_seen: Some(T0),
                mqtt_connected: true,
                ..Default::default()
            },
            Some(&[fields::LAST_SEEN.into(), fields::MQTT_CONNECTED.into()]),
        );
        *fx.device.responses.lock() = VecDeque::from([br#"{"Status":{"Power":1}}"#.to_vec()]);

        fx.clock.advance(time::Duration::seconds(125));
        fx.manager.run_liveness_check("10.0.0.1", 1883).await;

        assert_eq!(fx.device.commands(), vec!["Status 0".to_string()]);
        assert_eq!(fx.device.backlogs().len(), 1, "exactly one reconfiguration");

        // Only the status fetch outcome touched state; last_seen is intact.
        let (_, state) = fx.manager.plug("lamp").unwrap();
        assert_eq!(state.last_seen, Some(T0));
        assert!(state.on);
    }

    #[tokio::test]
    async fn liveness_check_reports_unreachable_plug() {
        let fx = fixture();
        let mut errors = fx
            .bus
            .client(crate::events::CLIENT_WEB)
            .unwrap()
            .subscriber::<ErrorEvent>();
        fx.manager.store.merge(
            "lamp",
            &PlugState {
                last_seen: Some(T0),
                mqtt_connected: true,
                ..Default::default()
            },
            Some(&[fields::LAST_SEEN.into(), fields::MQTT_CONNECTED.into()]),
        );
        fx.device.set_fail(true);

        fx.clock.advance(time::Duration::seconds(125));
        fx.manager.run_liveness_check("10.0.0.1", 1883).await;

        let err = errors.recv().await.unwrap();
        assert!(err.error.contains("unreachable for 125s"));
        assert!(fx.device.backlogs().is_empty());
    }

    #[tokio::test]
    async fn liveness_check_leaves_fresh_plugs_alone() {
        let fx = fixture();
        fx.manager.store.merge(
            "lamp",
            &PlugState {
                last_seen: Some(T0),
                mqtt_connected: true,
                ..Default::default()
            },
            Some(&[fields::LAST_SEEN.into(), fields::MQTT_CONNECTED.into()]),
        );

        fx.clock.advance(time::Duration::seconds(90));
        fx.manager.run_liveness_check("10.0.0.1", 1883).await;

        assert!(fx.device.commands().is_empty());
        assert!(fx.device.backlogs().is_empty());
    }

    #[test]
    fn parse_status_power_shapes() {
        assert!(parse_status_power(br#"{"Status":{"Power":1}}"#).unwrap());
        assert!(!parse_status_power(br#"{"Status":{"Power":"OFF"}}"#).unwrap());
        assert!(parse_status_power(br#"{"POWER":"ON"}"#).unwrap());
        assert!(parse_status_power(br#"{"POWER":1}"#).unwrap());
        assert!(parse_status_power(br#"{"other":true}"#).is_err());
        assert!(parse_status_power(b"garbage").is_err());
    }
}
