//! HAP server wiring.
//!
//! Builds the bridge plus one outlet or lightbulb accessory per
//! HomeKit-enabled plug on top of the `hap` crate, and adapts each to the
//! [`Switchable`](super::Switchable) capability. Remote writes of the `On`
//! characteristic are translated into `CommandEvent`s; the plug manager is
//! the only component that actually commands devices.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use anyhow::{anyhow, bail, Context, Result};
use async_trait::async_trait;
use futures::FutureExt;
use hap::accessory::bridge::BridgeAccessory;
use hap::accessory::lightbulb::LightbulbAccessory;
use hap::accessory::outlet::OutletAccessory;
use hap::accessory::{AccessoryCategory, AccessoryInformation};
use hap::characteristic::power_state::PowerStateCharacteristic;
use hap::characteristic::AsyncCharacteristicCallbacks;
use hap::server::{IpServer, Server};
use hap::storage::{FileStorage, Storage};
use hap::{HapType, MacAddress, Pin};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::clock::Clock;
use crate::config::Config;
use crate::events::{CommandEvent, CommandSource, CommandType, Publisher};
use crate::plugs::{Plug, PlugType};

use super::{accessory_id, HapStats, Switchable};

const BRIDGE_NAME: &str = "Tasbridge";

/// A running-but-not-yet-serving HAP server.
pub struct HapRuntime {
    server: IpServer,
}

impl HapRuntime {
    /// Serves HomeKit until cancelled.
    pub async fn run(self, cancel: CancellationToken) -> Result<()> {
        let handle = self.server.run_handle();
        tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            result = handle => result.map_err(|err| anyhow!("HAP server error: {err:?}")),
        }
    }
}

/// Builds the HAP server, its accessories, and the [`Switchable`] handles
/// the adapter drives. Fails when no plug is HomeKit-enabled: a bridge with
/// nothing bridged serves no purpose.
pub async fn build_server(
    cfg: &Config,
    plugs: &[Plug],
    commands: mpsc::Sender<CommandEvent>,
    command_publisher: Publisher<CommandEvent>,
    stats: Arc<HapStats>,
    clock: Arc<dyn Clock>,
) -> Result<(HapRuntime, Vec<Arc<dyn Switchable>>)> {
    let enabled: Vec<&Plug> = plugs.iter().filter(|plug| plug.homekit_enabled).collect();
    if enabled.is_empty() {
        bail!("no accessories to serve");
    }

    let storage_dir = cfg.hap_storage_path.to_string_lossy().to_string();
    let mut storage = FileStorage::new(&storage_dir)
        .await
        .map_err(|err| anyhow!("failed to open HAP storage {storage_dir}: {err:?}"))?;

    // Reuse the stored device identity when present so existing pairings
    // survive restarts; only the listener and local IP may change.
    let hap_config = match storage.load_config().await {
        Ok(mut stored) => {
            stored.redetermine_local_ip();
            stored.port = cfg.hap_addr.port();
            stored.pin = parse_pin(&cfg.hap_pin)?;
            storage
                .save_config(&stored)
                .await
                .map_err(|err| anyhow!("failed to save HAP config: {err:?}"))?;
            stored
        }
        Err(_) => {
            let fresh = hap::Config {
                port: cfg.hap_addr.port(),
                pin: parse_pin(&cfg.hap_pin)?,
                name: BRIDGE_NAME.into(),
                device_id: MacAddress::from([0x1A, 0x5B, 0x3C, 0x9D, 0x4E, 0x6F]),
                category: AccessoryCategory::Bridge,
                ..Default::default()
            };
            storage
                .save_config(&fresh)
                .await
                .map_err(|err| anyhow!("failed to save HAP config: {err:?}"))?;
            fresh
        }
    };

    let server = IpServer::new(hap_config, storage)
        .await
        .map_err(|err| anyhow!("failed to create HAP server: {err:?}"))?;

    let bridge = BridgeAccessory::new(
        1,
        AccessoryInformation {
            name: BRIDGE_NAME.into(),
            manufacturer: "tasbridge".into(),
            model: "Bridge".into(),
            serial_number: "TB001".into(),
            ..Default::default()
        },
    )
    .map_err(|err| anyhow!("failed to create bridge accessory: {err:?}"))?;
    server
        .add_accessory(bridge)
        .await
        .map_err(|err| anyhow!("failed to add bridge accessory: {err:?}"))?;

    let mut switches: Vec<Arc<dyn Switchable>> = Vec::with_capacity(enabled.len());
    for plug in enabled {
        let aid = accessory_id(&plug.id);
        let suppress = Arc::new(AtomicBool::new(false));
        let info = AccessoryInformation {
            name: plug.name.clone(),
            manufacturer: "Tasmota".into(),
            model: plug.model.clone(),
            serial_number: plug.id.clone(),
            ..Default::default()
        };

        let (pointer, service_type, kind) = match plug.kind {
            PlugType::Outlet => {
                let mut outlet = OutletAccessory::new(aid, info)
                    .map_err(|err| anyhow!("failed to create outlet {}: {err:?}", plug.id))?;
                install_write_handler(
                    &mut outlet.outlet.power_state,
                    plug.id.clone(),
                    suppress.clone(),
                    commands.clone(),
                    command_publisher.clone(),
                    stats.clone(),
                    clock.clone(),
                );
                let pointer = server
                    .add_accessory(outlet)
                    .await
                    .map_err(|err| anyhow!("failed to add outlet {}: {err:?}", plug.id))?;
                (pointer, HapType::Outlet, "Outlet")
            }
            PlugType::Bulb => {
                let mut bulb = LightbulbAccessory::new(aid, info)
                    .map_err(|err| anyhow!("failed to create lightbulb {}: {err:?}", plug.id))?;
                install_write_handler(
                    &mut bulb.lightbulb.power_state,
                    plug.id.clone(),
                    suppress.clone(),
                    commands.clone(),
                    command_publisher.clone(),
                    stats.clone(),
                    clock.clone(),
                );
                let pointer = server
                    .add_accessory(bulb)
                    .await
                    .map_err(|err| anyhow!("failed to add lightbulb {}: {err:?}", plug.id))?;
                (pointer, HapType::Lightbulb, "Lightbulb")
            }
        };

        info!(plug_id = %plug.id, name = %plug.name, aid, kind, "created HomeKit accessory");
        switches.push(Arc::new(HapSwitch {
            plug_id: plug.id.clone(),
            name: plug.name.clone(),
            aid,
            service_type,
            kind,
            accessory: pointer,
            mirror: AtomicBool::new(false),
            suppress,
        }));
    }

    Ok((HapRuntime { server }, switches))
}

/// Routes remote writes of `On` into the command channel (and onto the bus
/// for observability). `suppress` is held high while the adapter itself is
/// pushing a value, so bridge-originated writes never loop back as commands.
fn install_write_handler(
    characteristic: &mut PowerStateCharacteristic,
    plug_id: String,
    suppress: Arc<AtomicBool>,
    commands: mpsc::Sender<CommandEvent>,
    command_publisher: Publisher<CommandEvent>,
    stats: Arc<HapStats>,
    clock: Arc<dyn Clock>,
) {
    characteristic.on_update_async(Some(move |_current: bool, new: bool| {
        let plug_id = plug_id.clone();
        let suppress = suppress.clone();
        let commands = commands.clone();
        let command_publisher = command_publisher.clone();
        let stats = stats.clone();
        let clock = clock.clone();
        async move {
            if suppress.load(Ordering::SeqCst) {
                return Ok(());
            }

            info!(plug_id = %plug_id, on = new, "HomeKit command received");
            stats.record_incoming(clock.now());

            let event = CommandEvent {
                timestamp: clock.now(),
                source: CommandSource::Homekit,
                plug_id: plug_id.clone(),
                command_type: CommandType::SetPower,
                on: Some(new),
            };
            command_publisher.publish(event.clone());
            if commands.send(event).await.is_err() {
                warn!(plug_id = %plug_id, "command channel closed");
            }
            Ok(())
        }
        .boxed()
    }));
}

fn parse_pin(pin: &str) -> Result<Pin> {
    if pin.len() != 8 || !pin.bytes().all(|b| b.is_ascii_digit()) {
        bail!("HAP PIN must be exactly 8 digits");
    }
    let mut digits = [0u8; 8];
    for (slot, byte) in digits.iter_mut().zip(pin.bytes()) {
        *slot = byte - b'0';
    }
    Pin::new(digits).map_err(|err| anyhow!("invalid HAP PIN: {err:?}"))
}

/// [`Switchable`] backed by a live HAP accessory.
struct HapSwitch {
    plug_id: String,
    name: String,
    aid: u64,
    service_type: HapType,
    kind: &'static str,
    accessory: hap::pointer::AccessoryPointer,
    /// Shadow of the last pushed/observed value, for cheap reads.
    mirror: AtomicBool,
    suppress: Arc<AtomicBool>,
}

#[async_trait]
impl Switchable for HapSwitch {
    fn plug_id(&self) -> &str {
        &self.plug_id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn aid(&self) -> u64 {
        self.aid
    }

    fn kind(&self) -> &'static str {
        self.kind
    }

    fn on_value(&self) -> bool {
        self.mirror.load(Ordering::SeqCst)
    }

    async fn set_on(&self, on: bool) -> Result<()> {
        self.suppress.store(true, Ordering::SeqCst);
        let result = self.push_value(on).await;
        self.suppress.store(false, Ordering::SeqCst);
        result?;
        self.mirror.store(on, Ordering::SeqCst);
        Ok(())
    }
}

impl HapSwitch {
    async fn push_value(&self, on: bool) -> Result<()> {
        let mut accessory = self.accessory.lock().await;
        let service = accessory
            .get_mut_service(self.service_type)
            .context("accessory service missing")?;
        let characteristic = service
            .get_mut_characteristic(HapType::PowerState)
            .context("power state characteristic missing")?;
        characteristic
            .set_value(serde_json::json!(on))
            .await
            .map_err(|err| anyhow!("failed to push power state: {err:?}"))?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_pin_accepts_eight_digits() {
        assert!(parse_pin("00102003").is_ok());
        assert!(parse_pin("1234567").is_err());
        assert!(parse_pin("12345678a").is_err());
        assert!(parse_pin("1234 567").is_err());
        assert!(parse_pin("1234-567").is_err());
        assert!(parse_pin("abcdefgh").is_err());
    }
}
