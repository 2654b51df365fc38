//! Web dashboard and HTTP surface.
//!
//! Serves the HTMX dashboard, translates toggle posts into `CommandEvent`s,
//! and streams authoritative `StateUpdateEvent`s to browsers over SSE. The
//! server keeps a "latest event" view per plug and per component purely for
//! the SSE snapshot flush and the debug page; the state store stays the
//! single source of truth.

mod render;

use std::collections::HashMap;
use std::convert::Infallible;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap, StatusCode};
use axum::response::sse::{Event as SseEvent, KeepAlive, Sse};
use axum::response::{Html, IntoResponse, Redirect, Response};
use axum::routing::{get, post};
use axum::{Form, Json, Router};
use futures::stream::{self, Stream, StreamExt};
use parking_lot::{Mutex, RwLock};
use prometheus::{Encoder, Registry, TextEncoder};
use serde::Deserialize;
use time::format_description::well_known::Rfc3339;
use time::macros::format_description;
use tokio::sync::mpsc;
use tokio_stream::wrappers::ReceiverStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::clock::Clock;
use crate::events::{
    Bus, Client, CommandEvent, CommandSource, CommandType, ConnectionStatusEvent, Publisher,
    StateUpdateEvent, Subscriber, UpdateSource,
};
use crate::hap::HapManager;
use crate::plugs::{classify_connection, Manager};

/// Per-browser SSE send queue; on overflow the incoming update is dropped
/// for that client, which catches up on the next event that fits.
const SSE_QUEUE: usize = 16;
const EVENT_LOG_CAP: usize = 100;
/// How long a toggle waits before rendering the refreshed card fragment.
const TOGGLE_REFRESH_DELAY: Duration = Duration::from_millis(100);

#[derive(Clone)]
pub struct WebServer {
    inner: Arc<WebInner>,
}

struct WebInner {
    manager: Arc<Manager>,
    hap: Option<Arc<HapManager>>,
    commands: mpsc::Sender<CommandEvent>,
    command_publisher: Publisher<CommandEvent>,
    update_sub: Mutex<Option<Subscriber<StateUpdateEvent>>>,
    status_sub: Mutex<Option<Subscriber<ConnectionStatusEvent>>>,
    latest_updates: RwLock<HashMap<String, StateUpdateEvent>>,
    latest_statuses: RwLock<HashMap<String, ConnectionStatusEvent>>,
    sse_clients: RwLock<HashMap<u64, mpsc::Sender<StateUpdateEvent>>>,
    next_sse_id: AtomicU64,
    event_log: Mutex<Vec<String>>,
    registry: Registry,
    bus: Bus,
    clock: Arc<dyn Clock>,
    hap_pin: String,
    qr_code: String,
}

#[derive(Debug, Deserialize)]
struct ToggleForm {
    action: String,
}

impl WebServer {
    /// `client` must be the bus client named `web`.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        client: &Client,
        manager: Arc<Manager>,
        hap: Option<Arc<HapManager>>,
        commands: mpsc::Sender<CommandEvent>,
        registry: Registry,
        bus: Bus,
        clock: Arc<dyn Clock>,
        hap_pin: String,
        qr_code: String,
    ) -> Self {
        WebServer {
            inner: Arc::new(WebInner {
                manager,
                hap,
                commands,
                command_publisher: client.publisher(),
                update_sub: Mutex::new(Some(client.subscriber())),
                status_sub: Mutex::new(Some(client.subscriber())),
                latest_updates: RwLock::new(HashMap::new()),
                latest_statuses: RwLock::new(HashMap::new()),
                sse_clients: RwLock::new(HashMap::new()),
                next_sse_id: AtomicU64::new(1),
                event_log: Mutex::new(Vec::new()),
                registry,
                bus,
                clock,
                hap_pin,
                qr_code,
            }),
        }
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/", get(index))
            .route("/toggle/{plug_id}", post(toggle))
            .route("/events", get(events))
            .route("/health", get(health))
            .route("/metrics", get(metrics))
            .route("/qrcode", get(qrcode))
            .route("/debug/eventbus", get(debug_eventbus))
            .route("/debug/hap", get(debug_hap))
            .with_state(self.clone())
    }

    /// Appends to the bounded dashboard event log.
    pub fn log_event(&self, message: impl Into<String>) {
        let format = format_description!("[hour]:[minute]:[second]");
        let stamp = self
            .inner
            .clock
            .now()
            .format(&format)
            .unwrap_or_else(|_| "??:??:??".to_string());
        let mut log = self.inner.event_log.lock();
        log.push(format!("{stamp}: {}", message.into()));
        if log.len() > EVENT_LOG_CAP {
            log.remove(0);
        }
    }

    pub fn sse_client_count(&self) -> usize {
        self.inner.sse_clients.read().len()
    }

    /// Latest known update for a plug, if any arrived since startup.
    pub fn latest_update(&self, plug_id: &str) -> Option<StateUpdateEvent> {
        self.inner.latest_updates.read().get(plug_id).cloned()
    }

    /// Event loop: tracks latest events and fans updates out to SSE clients.
    pub async fn process_events(self, cancel: CancellationToken) {
        let update_sub = self.inner.update_sub.lock().take();
        let status_sub = self.inner.status_sub.lock().take();
        let (Some(mut update_sub), Some(mut status_sub)) = (update_sub, status_sub) else {
            warn!("web event loop already running");
            return;
        };

        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                event = update_sub.recv() => {
                    let Some(event) = event else { return };
                    self.handle_update(event);
                }
                event = status_sub.recv() => {
                    let Some(event) = event else { return };
                    self.inner
                        .latest_statuses
                        .write()
                        .insert(event.component.clone(), event);
                }
            }
        }
    }

    fn handle_update(&self, event: StateUpdateEvent) {
        debug!(plug_id = %event.plug_id, on = event.on, "web: state update received");
        self.inner
            .latest_updates
            .write()
            .insert(event.plug_id.clone(), event.clone());

        let clients: Vec<mpsc::Sender<StateUpdateEvent>> =
            self.inner.sse_clients.read().values().cloned().collect();
        for client in clients {
            // Full queue: skip this event for that client only.
            let _ = client.try_send(event.clone());
        }
    }

    /// Current snapshot rendered as one update per plug, for the SSE flush.
    fn initial_updates(&self) -> Vec<StateUpdateEvent> {
        let now = self.inner.clock.now();
        let latest = self.inner.latest_updates.read();
        let mut updates: Vec<StateUpdateEvent> = self
            .inner
            .manager
            .snapshot()
            .into_iter()
            .map(|(plug_id, (plug, state))| {
                latest.get(&plug_id).cloned().unwrap_or_else(|| {
                    let (connection_state, connection_note) =
                        classify_connection(state.last_seen, now);
                    StateUpdateEvent {
                        timestamp: now,
                        source: UpdateSource::Initial,
                        plug_id,
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
                    }
                })
            })
            .collect();
        updates.sort_by(|a, b| a.plug_id.cmp(&b.plug_id));
        updates
    }
}

async fn index(State(ws): State<WebServer>) -> Html<String> {
    let now = ws.inner.clock.now();
    let mut plugs: Vec<_> = ws.inner.manager.snapshot().into_values().collect();
    plugs.sort_by(|a, b| a.0.id.cmp(&b.0.id));

    let cards: String = plugs
        .iter()
        .map(|(plug, state)| {
            let (connection, note) = classify_connection(state.last_seen, now);
            render::plug_card(plug, state, connection, &note)
        })
        .collect();

    let events = ws.inner.event_log.lock().clone();
    Html(render::dashboard(plugs.len(), &cards, &events))
}

async fn toggle(
    State(ws): State<WebServer>,
    Path(plug_id): Path<String>,
    headers: HeaderMap,
    Form(form): Form<ToggleForm>,
) -> Response {
    let Some((plug, _)) = ws.inner.manager.plug(&plug_id) else {
        return (StatusCode::NOT_FOUND, "Plug not found").into_response();
    };
    if !plug.web_enabled {
        return (StatusCode::FORBIDDEN, "Plug not exposed to web control").into_response();
    }

    let on = form.action == "on";
    let event = CommandEvent {
        timestamp: ws.inner.clock.now(),
        source: CommandSource::Web,
        plug_id: plug_id.clone(),
        command_type: CommandType::SetPower,
        on: Some(on),
    };

    // Observability fanout first, then the point-to-point channel the
    // manager actually consumes. A saturated channel briefly blocks here.
    ws.inner.command_publisher.publish(event.clone());
    if ws.inner.commands.send(event).await.is_err() {
        error!(plug_id = %plug_id, "command channel closed");
        return (StatusCode::SERVICE_UNAVAILABLE, "Command channel closed").into_response();
    }

    ws.log_event(format!("Web UI: Toggle {plug_id} -> {}", form.action));

    let htmx = headers
        .get("HX-Request")
        .and_then(|value| value.to_str().ok())
        == Some("true");
    if htmx {
        tokio::time::sleep(TOGGLE_REFRESH_DELAY).await;
        let Some((plug, state)) = ws.inner.manager.plug(&plug_id) else {
            return (StatusCode::NOT_FOUND, "Plug not found").into_response();
        };
        let (connection, note) = classify_connection(state.last_seen, ws.inner.clock.now());
        return Html(render::plug_card(&plug, &state, connection, &note)).into_response();
    }

    Redirect::to("/").into_response()
}

async fn events(
    State(ws): State<WebServer>,
) -> Sse<impl Stream<Item = Result<SseEvent, Infallible>>> {
    let (tx, rx) = mpsc::channel(SSE_QUEUE);
    let id = ws.inner.next_sse_id.fetch_add(1, Ordering::Relaxed);
    ws.inner.sse_clients.write().insert(id, tx);
    debug!(client = id, "SSE client connected");

    let initial = ws.initial_updates();
    let guard = SseClientGuard {
        id,
        inner: Arc::clone(&ws.inner),
    };

    let stream = stream::iter(initial)
        .chain(ReceiverStream::new(rx))
        .map(move |event| {
            // Tie the registration to the stream's lifetime; the guard drops
            // (and deregisters) when the client goes away.
            let _ = &guard;
            let data = serde_json::to_string(&event).unwrap_or_default();
            Ok(SseEvent::default().data(data))
        });

    Sse::new(stream).keep_alive(KeepAlive::default())
}

async fn health(State(ws): State<WebServer>) -> Json<serde_json::Value> {
    Json(serde_json::json!({
        "status": "ok",
        "plugs": ws.inner.manager.plug_count(),
        "sse_clients": ws.sse_client_count(),
        "timestamp": ws.inner.clock.now().format(&Rfc3339).unwrap_or_default(),
    }))
}

async fn metrics(State(ws): State<WebServer>) -> Response {
    let mut buffer = Vec::new();
    let encoder = TextEncoder::new();
    if let Err(err) = encoder.encode(&ws.inner.registry.gather(), &mut buffer) {
        error!(error = %err, "failed to encode metrics");
        return (StatusCode::INTERNAL_SERVER_ERROR, "failed to encode metrics").into_response();
    }
    (
        [(header::CONTENT_TYPE, "text/plain; version=0.0.4; charset=utf-8")],
        buffer,
    )
        .into_response()
}

async fn qrcode(State(ws): State<WebServer>) -> Response {
    (
        [(header::CONTENT_TYPE, "text/plain; charset=utf-8")],
        format!("HomeKit PIN: {}\n\n{}", ws.inner.hap_pin, ws.inner.qr_code),
    )
        .into_response()
}

async fn debug_eventbus(State(ws): State<WebServer>) -> Html<String> {
    let mut updates: Vec<StateUpdateEvent> =
        ws.inner.latest_updates.read().values().cloned().collect();
    updates.sort_by(|a, b| a.plug_id.cmp(&b.plug_id));

    let mut statuses: Vec<ConnectionStatusEvent> =
        ws.inner.latest_statuses.read().values().cloned().collect();
    statuses.sort_by(|a, b| a.component.cmp(&b.component));

    Html(render::eventbus_debug(
        &updates,
        &statuses,
        ws.inner.bus.dropped(),
    ))
}

async fn debug_hap(State(ws): State<WebServer>) -> Response {
    match &ws.inner.hap {
        Some(hap) => Json(serde_json::json!({
            "stats": hap.stats(),
            "accessories": hap.inventory(),
        }))
        .into_response(),
        None => (StatusCode::NOT_FOUND, "HomeKit disabled").into_response(),
    }
}

struct SseClientGuard {
    id: u64,
    inner: Arc<WebInner>,
}

impl Drop for SseClientGuard {
    fn drop(&mut self) {
        self.inner.sse_clients.write().remove(&self.id);
        debug!(client = self.id, "SSE client disconnected");
    }
}
