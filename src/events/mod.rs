//! Event bus and the event types exchanged over it.

mod bus;
mod types;

pub use bus::{
    Bus, BusError, Client, Publisher, Subscriber, CLIENT_HAP, CLIENT_METRICS, CLIENT_MQTT,
    CLIENT_PLUG_MANAGER, CLIENT_WEB, DEFAULT_QUEUE_CAPACITY,
};
pub use types::{
    CommandEvent, CommandSource, CommandType, ConnectionStatus, ConnectionStatusEvent, ErrorEvent,
    StateUpdateEvent, UpdateSource,
};
