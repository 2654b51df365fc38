//! tasbridge - Tasmota smart plug bridge for HomeKit and the web
//!
//! A single process that keeps one authoritative view of each plug's state
//! across three asymmetric transports:
//! - an outbound HTTP fast path for commands and status fetches
//! - inbound MQTT telemetry via an embedded broker
//! - the HomeKit Accessory Protocol for iOS clients
//!
//! A browser dashboard fed by Server-Sent Events is the fourth observer.
//! Everything revolves around an in-process event bus: the plug manager is
//! the single writer of authoritative state, telemetry arrives as partial
//! deltas only the manager may merge, and a liveness supervisor reconfigures
//! devices whose telemetry goes silent.

pub mod app;
pub mod clock;
pub mod config;
pub mod events;
pub mod hap;
pub mod logging;
pub mod metrics;
pub mod mqtt;
pub mod plugs;
pub mod web;
