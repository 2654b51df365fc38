//! Authoritative plug registry and state store.
//!
//! The store owns every `PlugState`. The manager is the single writer; all
//! other components read by value through [`snapshot`](StateStore::snapshot)
//! or [`get`](StateStore::get) and never retain references into the map.

use std::collections::HashMap;

use parking_lot::RwLock;
use time::OffsetDateTime;

use super::{fields, Plug, PlugState};

struct Entry {
    plug: Plug,
    state: PlugState,
}

pub struct StateStore {
    entries: RwLock<HashMap<String, Entry>>,
}

impl StateStore {
    pub fn new(plugs: &[Plug]) -> Self {
        let entries = plugs
            .iter()
            .map(|plug| {
                (
                    plug.id.clone(),
                    Entry {
                        plug: plug.clone(),
                        state: PlugState::default(),
                    },
                )
            })
            .collect();
        StateStore {
            entries: RwLock::new(entries),
        }
    }

    /// By-value copy of every plug and its state.
    pub fn snapshot(&self) -> HashMap<String, (Plug, PlugState)> {
        self.entries
            .read()
            .iter()
            .map(|(id, entry)| (id.clone(), (entry.plug.clone(), entry.state.clone())))
            .collect()
    }

    /// By-value copy of one plug and its state.
    pub fn get(&self, plug_id: &str) -> Option<(Plug, PlugState)> {
        self.entries
            .read()
            .get(plug_id)
            .map(|entry| (entry.plug.clone(), entry.state.clone()))
    }

    pub fn contains(&self, plug_id: &str) -> bool {
        self.entries.read().contains_key(plug_id)
    }

    pub fn plug_ids(&self) -> Vec<String> {
        self.entries.read().keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.entries.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.read().is_empty()
    }

    /// Field-level merge of a telemetry delta. With `updated_fields` present
    /// exactly the named fields are copied; without it the legacy rule
    /// applies: the liveness half (`last_seen`, `mqtt_connected`) is copied
    /// iff the delta carries a `last_seen`, the power half (`on` and the
    /// energy metrics) iff it carries a `last_updated`.
    ///
    /// Returns the merged state, or `None` for an unknown plug.
    pub fn merge(
        &self,
        plug_id: &str,
        delta: &PlugState,
        updated_fields: Option<&[String]>,
    ) -> Option<PlugState> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(plug_id)?;
        let state = &mut entry.state;

        match updated_fields {
            Some(names) => {
                for name in names {
                    match name.as_str() {
                        fields::ON => state.on = delta.on,
                        fields::POWER => state.power = delta.power,
                        fields::VOLTAGE => state.voltage = delta.voltage,
                        fields::CURRENT => state.current = delta.current,
                        fields::ENERGY => state.energy = delta.energy,
                        fields::MQTT_CONNECTED => state.mqtt_connected = delta.mqtt_connected,
                        fields::LAST_SEEN => state.last_seen = delta.last_seen,
                        fields::LAST_UPDATED => state.last_updated = delta.last_updated,
                        other => {
                            tracing::debug!(plug_id, field = other, "ignoring unknown delta field");
                        }
                    }
                }
            }
            None => {
                if delta.last_seen.is_some() {
                    state.last_seen = delta.last_seen;
                    state.mqtt_connected = delta.mqtt_connected;
                }
                if delta.last_updated.is_some() {
                    state.last_updated = delta.last_updated;
                    state.on = delta.on;
                    state.power = delta.power;
                    state.voltage = delta.voltage;
                    state.current = delta.current;
                    state.energy = delta.energy;
                }
            }
        }

        Some(state.clone())
    }

    /// Records a confirmed power state from the HTTP fast path. Updates
    /// `last_updated` but never `last_seen`: HTTP reachability is not MQTT
    /// liveness.
    pub fn apply_power(&self, plug_id: &str, on: bool, now: OffsetDateTime) -> Option<PlugState> {
        let mut entries = self.entries.write();
        let entry = entries.get_mut(plug_id)?;
        entry.state.on = on;
        entry.state.last_updated = Some(now);
        Some(entry.state.clone())
    }
}
