//! HomeKit adapter.
//!
//! The bridge exposes one accessory per HomeKit-enabled plug. Accessories
//! are reached through the narrow [`Switchable`] capability (read the `On`
//! value, write it, with the remote-write callback installed at build time),
//! which keeps the adapter independent of the HAP library and lets tests
//! substitute in-memory switches. The adapter never talks to devices: remote
//! writes become `CommandEvent`s for the plug manager, and only
//! authoritative `StateUpdateEvent`s flow back into the accessories.

mod server;

pub use server::{build_server, HapRuntime};

use std::collections::HashMap;
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;

use anyhow::Result;
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use time::format_description::well_known::Rfc3339;
use time::OffsetDateTime;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::clock::Clock;
use crate::events::{Client, StateUpdateEvent, Subscriber};

/// Derives a stable HomeKit accessory id from a plug id (FNV-1a, 64 bit).
/// Stability across restarts is what keeps existing pairings valid, so this
/// must never depend on std's randomized hashers.
pub fn accessory_id(plug_id: &str) -> u64 {
    const OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
    const PRIME: u64 = 0x0000_0100_0000_01b3;

    let mut hash = OFFSET_BASIS;
    for byte in plug_id.as_bytes() {
        hash ^= u64::from(*byte);
        hash = hash.wrapping_mul(PRIME);
    }
    hash
}

/// The one capability the adapter needs from an accessory: a boolean `On`
/// that can be read and written. The remote-write callback is wired when the
/// accessory is built.
#[async_trait]
pub trait Switchable: Send + Sync {
    fn plug_id(&self) -> &str;
    fn name(&self) -> &str;
    fn aid(&self) -> u64;
    /// Accessory kind for the debug inventory ("Outlet" or "Lightbulb").
    fn kind(&self) -> &'static str;
    fn on_value(&self) -> bool;
    async fn set_on(&self, on: bool) -> Result<()>;
}

/// Traffic counters surfaced on `/debug/hap`.
#[derive(Default)]
pub struct HapStats {
    incoming_commands: AtomicU64,
    outgoing_updates: AtomicU64,
    last_activity_unix: AtomicI64,
}

impl HapStats {
    pub fn record_incoming(&self, now: OffsetDateTime) {
        self.incoming_commands.fetch_add(1, Ordering::Relaxed);
        self.last_activity_unix
            .store(now.unix_timestamp(), Ordering::Relaxed);
    }

    pub fn record_outgoing(&self, now: OffsetDateTime) {
        self.outgoing_updates.fetch_add(1, Ordering::Relaxed);
        self.last_activity_unix
            .store(now.unix_timestamp(), Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> HapStatsSnapshot {
        let last = self.last_activity_unix.load(Ordering::Relaxed);
        let last_activity = if last > 0 {
            OffsetDateTime::from_unix_timestamp(last)
                .ok()
                .and_then(|t| t.format(&Rfc3339).ok())
                .unwrap_or_else(|| "Never".to_string())
        } else {
            "Never".to_string()
        };
        HapStatsSnapshot {
            incoming_commands: self.incoming_commands.load(Ordering::Relaxed),
            outgoing_updates: self.outgoing_updates.load(Ordering::Relaxed),
            last_activity,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct HapStatsSnapshot {
    pub incoming_commands: u64,
    pub outgoing_updates: u64,
    pub last_activity: String,
}

/// One row of the `/debug/hap` accessory inventory.
#[derive(Debug, Clone, Serialize)]
pub struct AccessoryInventory {
    pub id: u64,
    pub name: String,
    #[serde(rename = "type")]
    pub kind: String,
    pub plug_id: String,
}

/// Maps authoritative state updates onto accessory characteristics.
pub struct HapManager {
    accessories: HashMap<String, Arc<dyn Switchable>>,
    stats: Arc<HapStats>,
    clock: Arc<dyn Clock>,
    subscriber: Mutex<Option<Subscriber<StateUpdateEvent>>>,
}

impl HapManager {
    /// `client` must be the bus client named `hap`; the caller keeps it to
    /// create the command publisher for accessory write callbacks.
    pub fn new(
        client: &Client,
        accessories: Vec<Arc<dyn Switchable>>,
        stats: Arc<HapStats>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let subscriber = client.subscriber();
        let accessories = accessories
            .into_iter()
            .map(|acc| (acc.plug_id().to_string(), acc))
            .collect();
        HapManager {
            accessories,
            stats,
            clock,
            subscriber: Mutex::new(Some(subscriber)),
        }
    }

    pub fn accessory(&self, plug_id: &str) -> Option<Arc<dyn Switchable>> {
        self.accessories.get(plug_id).cloned()
    }

    pub fn accessory_count(&self) -> usize {
        self.accessories.len()
    }

    pub fn stats(&self) -> HapStatsSnapshot {
        self.stats.snapshot()
    }

    pub fn inventory(&self) -> Vec<AccessoryInventory> {
        let mut rows: Vec<AccessoryInventory> = self
            .accessories
            .values()
            .map(|acc| AccessoryInventory {
                id: acc.aid(),
                name: acc.name().to_string(),
                kind: acc.kind().to_string(),
                plug_id: acc.plug_id().to_string(),
            })
            .collect();
        rows.sort_by(|a, b| a.plug_id.cmp(&b.plug_id));
        rows
    }

    /// Pushes one authoritative update into the matching accessory. Pushes
    /// are idempotent; plugs without a HomeKit accessory are skipped.
    pub async fn update_state(&self, event: &StateUpdateEvent) {
        let Some(accessory) = self.accessories.get(&event.plug_id) else {
            debug!(plug_id = %event.plug_id, "no accessory for plug");
            return;
        };

        if let Err(err) = accessory.set_on(event.on).await {
            warn!(
                plug_id = %event.plug_id,
                error = %format!("{err:#}"),
                "failed to update HomeKit state"
            );
            return;
        }
        self.stats.record_outgoing(self.clock.now());
        debug!(plug_id = %event.plug_id, on = event.on, "updated HomeKit state");
    }

    /// Adapter loop: applies every authoritative update to accessories.
    pub async fn process_state_updates(self: Arc<Self>, cancel: CancellationToken) {
        let Some(mut subscriber) = self.subscriber.lock().take() else {
            warn!("HAP state update loop already running");
            return;
        };
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = subscriber.recv() => {
                    let Some(event) = event else { return };
                    self.update_state(&event).await;
                }
            }
        }
    }
}
