//! Startup orchestration.
//!
//! Wires the bus, plug manager, embedded broker, HomeKit server, metrics
//! and web dashboard together, then serves until a shutdown signal arrives.
//! Construction order matters: the manager must exist before the broker
//! starts feeding deltas, and HomeKit accessories must exist before the web
//! server advertises the pairing code.

use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use crate::clock::{self, Clock};
use crate::config::Config;
use crate::events::{
    Bus, CommandEvent, ConnectionStatus, ConnectionStatusEvent, Publisher, CLIENT_HAP,
    CLIENT_MQTT, CLIENT_WEB,
};
use crate::hap::{self, HapManager, HapStats};
use crate::metrics::Collector;
use crate::mqtt;
use crate::plugs::{self, Manager};
use crate::web::WebServer;

/// Capacity of the point-to-point command channel. Saturation briefly
/// backpressures toggle requests and HomeKit writes.
const COMMAND_QUEUE: usize = 10;

pub async fn run(cfg: Config) -> Result<()> {
    info!(
        version = env!("CARGO_PKG_VERSION"),
        log_level = cfg.log_level.as_str(),
        log_format = cfg.log_format.as_str(),
        "starting tasbridge"
    );
    info!(
        hap_addr = %cfg.hap_addr,
        web_addr = %cfg.web_addr,
        mqtt_addr = %cfg.mqtt_addr,
        plugs_config = %cfg.plugs_config_path.display(),
        "configuration loaded"
    );

    let plugs_file = plugs::load_plugs(&cfg.plugs_config_path)?;
    info!(count = plugs_file.plugs.len(), "loaded plugs");
    for plug in &plugs_file.plugs {
        info!(id = %plug.id, name = %plug.name, address = %plug.address, "plug configured");
    }

    if !cfg.tailscale_auth_key.is_empty() {
        warn!(
            hostname = %cfg.tailscale_hostname,
            "Tailscale serving is not wired in this build; web UI binds locally only"
        );
    }

    let cancel = CancellationToken::new();
    spawn_signal_handler(cancel.clone());

    let bus = Bus::new();
    let clock = clock::system_clock();
    let (command_tx, command_rx) = mpsc::channel::<CommandEvent>(COMMAND_QUEUE);
    info!("event system initialized");

    let registry = prometheus::Registry::new();
    let collector = Collector::new(&bus, &registry)?;
    tokio::spawn(collector.run(cancel.clone()));

    // Devices need a routable address for the embedded broker; the bind
    // address is usually 0.0.0.0 and useless to them.
    let local_ip = match local_ip_address::local_ip() {
        Ok(ip) => ip.to_string(),
        Err(err) => {
            warn!(error = %err, "failed to get local IP, using localhost");
            "localhost".to_string()
        }
    };
    info!(ip = %local_ip, "local IP address");

    let manager = Manager::new(&plugs_file.plugs, &bus, clock.clone())?;

    let mqtt_client = bus.client(CLIENT_MQTT).context("failed to get MQTT client")?;
    let mqtt_status = mqtt_client.publisher::<ConnectionStatusEvent>();
    mqtt::start(
        cfg.mqtt_addr,
        mqtt_client.publisher(),
        mqtt_status.clone(),
        clock.clone(),
        cancel.clone(),
    )?;
    info!(addr = %cfg.mqtt_addr, "MQTT broker started");

    tokio::spawn(
        manager
            .clone()
            .process_commands(command_rx, cancel.clone()),
    );
    tokio::spawn(manager.clone().process_state_events(cancel.clone()));

    // Initial state fetch for all plugs, in parallel.
    for plug in &plugs_file.plugs {
        let manager = manager.clone();
        let plug_id = plug.id.clone();
        tokio::spawn(async move {
            match manager.get_status(&plug_id).await {
                Ok(state) => info!(plug_id = %plug_id, on = state.on, "initial plug state"),
                Err(err) => warn!(
                    plug_id = %plug_id,
                    error = %format!("{err:#}"),
                    "failed to get initial status"
                ),
            }
        });
    }

    // Point every plug at the embedded broker once it has had a moment to
    // come up.
    for plug in &plugs_file.plugs {
        let manager = manager.clone();
        let plug_id = plug.id.clone();
        let broker_host = local_ip.clone();
        let broker_port = cfg.mqtt_addr.port();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(1)).await;
            if let Err(err) = manager
                .configure_mqtt(&plug_id, &broker_host, broker_port)
                .await
            {
                error!(
                    plug_id = %plug_id,
                    error = %format!("{err:#}"),
                    "failed to configure MQTT for plug"
                );
                manager.report_error(&plug_id, format!("MQTT configuration failed: {err:#}"));
                return;
            }
            info!(plug_id = %plug_id, "plug configured for MQTT");
        });
    }

    tokio::spawn(manager.clone().monitor_connections(
        local_ip.clone(),
        cfg.mqtt_addr.port(),
        cancel.clone(),
    ));
    info!("connection monitoring started");

    let hap_client = bus.client(CLIENT_HAP).context("failed to get HAP client")?;
    let hap_stats = Arc::new(HapStats::default());
    let (hap_runtime, switches) = hap::build_server(
        &cfg,
        &plugs_file.plugs,
        command_tx.clone(),
        hap_client.publisher(),
        hap_stats.clone(),
        clock.clone(),
    )
    .await?;
    let hap_manager = Arc::new(HapManager::new(
        &hap_client,
        switches,
        hap_stats,
        clock.clone(),
    ));
    tokio::spawn(hap_manager.clone().process_state_updates(cancel.clone()));

    let hap_status = hap_client.publisher::<ConnectionStatusEvent>();
    publish_status(&hap_status, &clock, CLIENT_HAP, ConnectionStatus::Connecting, None);
    {
        let hap_status = hap_status.clone();
        let clock = clock.clone();
        let cancel = cancel.clone();
        let addr = cfg.hap_addr;
        let pin = cfg.hap_pin.clone();
        tokio::spawn(async move {
            info!(addr = %addr, pin = %pin, "starting HomeKit server");
            publish_status(&hap_status, &clock, CLIENT_HAP, ConnectionStatus::Connected, None);
            match hap_runtime.run(cancel).await {
                Ok(()) => publish_status(
                    &hap_status,
                    &clock,
                    CLIENT_HAP,
                    ConnectionStatus::Disconnected,
                    None,
                ),
                Err(err) => {
                    error!(error = %format!("{err:#}"), "HAP server error");
                    publish_status(
                        &hap_status,
                        &clock,
                        CLIENT_HAP,
                        ConnectionStatus::Failed,
                        Some(format!("{err:#}")),
                    );
                }
            }
        });
    }

    let setup_uri = homekit_setup_uri(&cfg.hap_pin);
    let qr_code = match render_qr(&setup_uri) {
        Ok(qr) => qr,
        Err(err) => {
            warn!(error = %format!("{err:#}"), "failed to generate QR code");
            String::new()
        }
    };
    println!("\n========================================");
    println!("HomeKit bridge ready - pair with PIN: {}\n", cfg.hap_pin);
    if !qr_code.is_empty() {
        println!("{qr_code}");
    }
    println!("========================================");
    info!(pin = %cfg.hap_pin, "scan QR code or enter PIN manually in Home app");

    let web_client = bus.client(CLIENT_WEB).context("failed to get web client")?;
    let web_status = web_client.publisher::<ConnectionStatusEvent>();
    let web = WebServer::new(
        &web_client,
        manager.clone(),
        Some(hap_manager.clone()),
        command_tx.clone(),
        registry.clone(),
        bus.clone(),
        clock.clone(),
        cfg.hap_pin.clone(),
        qr_code,
    );
    web.log_event("Server starting...");
    tokio::spawn(web.clone().process_events(cancel.clone()));

    publish_status(&web_status, &clock, CLIENT_WEB, ConnectionStatus::Connecting, None);
    let listener = tokio::net::TcpListener::bind(cfg.web_addr)
        .await
        .with_context(|| format!("failed to bind web listener {}", cfg.web_addr))?;
    publish_status(&web_status, &clock, CLIENT_WEB, ConnectionStatus::Connected, None);
    info!(url = %format!("http://{}", cfg.web_addr), "web UI available");

    info!("server running, press Ctrl+C to stop");
    axum::serve(listener, web.router())
        .with_graceful_shutdown(cancel.clone().cancelled_owned())
        .await
        .context("web server error")?;

    info!("shutting down");
    publish_status(&web_status, &clock, CLIENT_WEB, ConnectionStatus::Disconnected, None);
    publish_status(&mqtt_status, &clock, CLIENT_MQTT, ConnectionStatus::Disconnected, None);
    bus.close();
    info!("shutdown complete");
    Ok(())
}

fn publish_status(
    publisher: &Publisher<ConnectionStatusEvent>,
    clock: &Arc<dyn Clock>,
    component: &str,
    status: ConnectionStatus,
    error: Option<String>,
) {
    publisher.publish(ConnectionStatusEvent {
        timestamp: clock.now(),
        component: component.to_string(),
        status,
        error,
        reconnects: 0,
    });
}

fn spawn_signal_handler(cancel: CancellationToken) {
    tokio::spawn(async move {
        wait_for_signal().await;
        info!("shutdown signal received");
        cancel.cancel();
    });
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{signal, SignalKind};

    match signal(SignalKind::terminate()) {
        Ok(mut term) => {
            tokio::select! {
                _ = tokio::signal::ctrl_c() => {}
                _ = term.recv() => {}
            }
        }
        Err(err) => {
            warn!(error = %err, "failed to install SIGTERM handler");
            let _ = tokio::signal::ctrl_c().await;
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    let _ = tokio::signal::ctrl_c().await;
}

/// X-HM setup URI for the pairing QR code: base36 of category (bridge),
/// transport flag (IP) and the numeric PIN, followed by the setup id.
fn homekit_setup_uri(pin: &str) -> String {
    const SETUP_ID: &str = "4412";
    const CATEGORY_BRIDGE: u64 = 2;
    const FLAG_IP: u64 = 2;

    let code: u64 = pin.parse().unwrap_or(0);
    let payload = (CATEGORY_BRIDGE << 31) | (FLAG_IP << 27) | code;
    format!("X-HM://{}{}", base36(payload), SETUP_ID)
}

fn base36(mut value: u64) -> String {
    const DIGITS: &[u8; 36] = b"0123456789ABCDEFGHIJKLMNOPQRSTUVWXYZ";

    let mut out = [b'0'; 9];
    let mut i = out.len();
    while value > 0 && i > 0 {
        i -= 1;
        out[i] = DIGITS[(value % 36) as usize];
        value /= 36;
    }
    String::from_utf8_lossy(&out).to_string()
}

fn render_qr(uri: &str) -> Result<String> {
    let code = qrcode::QrCode::new(uri.as_bytes()).context("failed to build QR code")?;
    Ok(code
        .render::<qrcode::render::unicode::Dense1x2>()
        .quiet_zone(true)
        .build())
}
