//! Prometheus metrics fed from the event bus.
//!
//! The collector is a passive observer: it subscribes to command and
//! component-status events and exposes them as a counter and a gauge on the
//! shared registry the web server serves at `/metrics`.

use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::Mutex;
use prometheus::{IntCounterVec, IntGaugeVec, Opts, Registry};
use tokio_util::sync::CancellationToken;
use tracing::info;

use crate::events::{
    Bus, CommandEvent, ConnectionStatus, ConnectionStatusEvent, Subscriber, CLIENT_METRICS,
};

pub struct Collector {
    command_total: IntCounterVec,
    component_status: IntGaugeVec,
    command_sub: Mutex<Option<Subscriber<CommandEvent>>>,
    status_sub: Mutex<Option<Subscriber<ConnectionStatusEvent>>>,
}

impl Collector {
    pub fn new(bus: &Bus, registry: &Registry) -> Result<Arc<Self>> {
        let client = bus
            .client(CLIENT_METRICS)
            .context("failed to get metrics client")?;

        let command_total = IntCounterVec::new(
            Opts::new(
                "tasbridge_command_total",
                "Total control commands by source and plug",
            ),
            &["source", "plug_id", "command_type"],
        )
        .context("failed to create command counter")?;
        registry
            .register(Box::new(command_total.clone()))
            .context("failed to register command counter")?;

        let component_status = IntGaugeVec::new(
            Opts::new(
                "tasbridge_component_status",
                "Lifecycle state per component (1 when matching status, 0 otherwise)",
            ),
            &["component", "status"],
        )
        .context("failed to create status gauge")?;
        registry
            .register(Box::new(component_status.clone()))
            .context("failed to register status gauge")?;

        Ok(Arc::new(Collector {
            command_total,
            component_status,
            command_sub: Mutex::new(Some(client.subscriber())),
            status_sub: Mutex::new(Some(client.subscriber())),
        }))
    }

    /// Counts one command, substituting `unknown` for missing label values.
    pub fn observe_command(&self, event: &CommandEvent) {
        let plug_id = if event.plug_id.is_empty() {
            "unknown"
        } else {
            event.plug_id.as_str()
        };
        self.command_total
            .with_label_values(&[event.source.as_str(), plug_id, event.command_type.as_str()])
            .inc();
    }

    /// Sets the gauge to 1 for the reported status and 0 for every other
    /// status of that component.
    pub fn observe_status(&self, event: &ConnectionStatusEvent) {
        let component = if event.component.is_empty() {
            "unknown"
        } else {
            event.component.as_str()
        };
        for status in ConnectionStatus::ALL {
            let value = i64::from(status == event.status);
            self.component_status
                .with_label_values(&[component, status.as_str()])
                .set(value);
        }
    }

    /// Consumes bus events until cancelled.
    pub async fn run(self: Arc<Self>, cancel: CancellationToken) {
        let (command_sub, status_sub) = (self.command_sub.lock().take(), self.status_sub.lock().take());
        let (Some(mut command_sub), Some(mut status_sub)) = (command_sub, status_sub) else {
            return;
        };

        info!("metrics collector started");
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                event = command_sub.recv() => {
                    let Some(event) = event else { break };
                    self.observe_command(&event);
                }
                event = status_sub.recv() => {
                    let Some(event) = event else { break };
                    self.observe_status(&event);
                }
            }
        }
        info!("metrics collector stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::events::{CommandSource, CommandType};
    use time::macros::datetime;

    fn command(plug_id: &str, source: CommandSource) -> CommandEvent {
        CommandEvent {
            timestamp: datetime!(2024-06-01 12:00:00 UTC),
            source,
            plug_id: plug_id.to_string(),
            command_type: CommandType::SetPower,
            on: Some(true),
        }
    }

    fn status(component: &str, status: ConnectionStatus) -> ConnectionStatusEvent {
        ConnectionStatusEvent {
            timestamp: datetime!(2024-06-01 12:00:00 UTC),
            component: component.to_string(),
            status,
            error: None,
            reconnects: 0,
        }
    }

    #[test]
    fn commands_increment_labeled_counter_once() {
        let bus = Bus::new();
        let registry = Registry::new();
        let collector = Collector::new(&bus, &registry).unwrap();

        collector.observe_command(&command("lamp", CommandSource::Web));
        collector.observe_command(&command("lamp", CommandSource::Web));
        collector.observe_command(&command("lamp", CommandSource::Homekit));

        assert_eq!(
            collector
                .command_total
                .with_label_values(&["web", "lamp", "set_power"])
                .get(),
            2
        );
        assert_eq!(
            collector
                .command_total
                .with_label_values(&["homekit", "lamp", "set_power"])
                .get(),
            1
        );
    }

    #[test]
    fn empty_plug_id_becomes_unknown() {
        let bus = Bus::new();
        let registry = Registry::new();
        let collector = Collector::new(&bus, &registry).unwrap();

        collector.observe_command(&command("", CommandSource::Web));
        assert_eq!(
            collector
                .command_total
                .with_label_values(&["web", "unknown", "set_power"])
                .get(),
            1
        );
    }

    #[test]
    fn status_gauge_tracks_exactly_one_status() {
        let bus = Bus::new();
        let registry = Registry::new();
        let collector = Collector::new(&bus, &registry).unwrap();

        collector.observe_status(&status("mqtt", ConnectionStatus::Connected));
        assert_eq!(
            collector
                .component_status
                .with_label_values(&["mqtt", "connected"])
                .get(),
            1
        );
        assert_eq!(
            collector
                .component_status
                .with_label_values(&["mqtt", "disconnected"])
                .get(),
            0
        );

        collector.observe_status(&status("mqtt", ConnectionStatus::Failed));
        assert_eq!(
            collector
                .component_status
                .with_label_values(&["mqtt", "connected"])
                .get(),
            0
        );
        assert_eq!(
            collector
                .component_status
                .with_label_values(&["mqtt", "failed"])
                .get(),
            1
        );
    }

    #[tokio::test]
    async fn run_consumes_bus_events() {
        let bus = Bus::new();
        let registry = Registry::new();
        let collector = Collector::new(&bus, &registry).unwrap();
        let cancel = CancellationToken::new();
        let task = tokio::spawn(collector.clone().run(cancel.clone()));

        let publisher = bus
            .client(crate::events::CLIENT_WEB)
            .unwrap()
            .publisher::<CommandEvent>();
        publisher.publish(command("lamp", CommandSource::Web));

        tokio::time::timeout(std::time::Duration::from_secs(1), async {
            loop {
                let count = collector
                    .command_total
                    .with_label_values(&["web", "lamp", "set_power"])
                    .get();
                if count == 1 {
                    break;
                }
                tokio::time::sleep(std::time::Duration::from_millis(5)).await;
            }
        })
        .await
        .expect("command should be counted");

        cancel.cancel();
        task.await.unwrap();
    }
}
