//! HTML assembly for the dashboard.
//!
//! Kept deliberately small: cards carry the HTMX attributes the SSE stream
//! swaps against, everything else is static markup.

use time::macros::format_description;
use time::OffsetDateTime;

use crate::events::{ConnectionStatusEvent, StateUpdateEvent};
use crate::plugs::{ConnectionState, Plug, PlugState};

const STYLE: &str = r#"
    body { font-family: system-ui; max-width: 800px; margin: 40px auto; padding: 0 20px; }
    h1 { color: #333; }
    .plug { border: 1px solid #ddd; padding: 20px; margin: 10px 0; border-radius: 8px; display: flex; justify-content: space-between; align-items: center; }
    .plug.on { background: #e8f5e9; }
    .plug.off { background: #ffebee; }
    .plug-name { font-size: 1.2em; font-weight: 500; }
    .plug-status { font-size: 0.9em; color: #666; }
    .conn { font-size: 0.8em; }
    .conn.connected { color: #2e7d32; }
    .conn.stale { color: #f9a825; }
    .conn.disconnected { color: #c62828; }
    button { padding: 10px 20px; font-size: 1em; cursor: pointer; border: none; border-radius: 4px; }
    button.on { background: #4caf50; color: white; }
    button.off { background: #f44336; color: white; }
    .events { margin-top: 40px; padding: 20px; background: #f5f5f5; border-radius: 8px; max-height: 300px; overflow-y: auto; }
    .event { font-family: monospace; font-size: 0.9em; padding: 4px 0; }
    table { border-collapse: collapse; width: 100%; }
    th, td { border: 1px solid #ddd; padding: 6px 10px; text-align: left; font-size: 0.9em; }
"#;

pub fn escape(text: &str) -> String {
    text.replace('&', "&amp;")
        .replace('<', "&lt;")
        .replace('>', "&gt;")
        .replace('"', "&quot;")
}

pub fn page(title: &str, content: &str) -> String {
    format!(
        r#"<!DOCTYPE html>
<html>
<head>
<title>{title}</title>
<script src="https://unpkg.com/htmx.org@2.0.4"></script>
<script src="https://unpkg.com/htmx-ext-sse@2.2.2/sse.js"></script>
<style>{STYLE}</style>
</head>
<body>{content}</body>
</html>"#,
        title = escape(title),
    )
}

fn clock_time(at: Option<OffsetDateTime>) -> String {
    let format = format_description!("[hour]:[minute]:[second]");
    at.and_then(|t| t.format(&format).ok())
        .unwrap_or_else(|| "never".to_string())
}

/// One dashboard card. The card id doubles as the SSE swap target, so a
/// fresh render replaces the card in place when an update arrives.
pub fn plug_card(
    plug: &Plug,
    state: &PlugState,
    connection: ConnectionState,
    connection_note: &str,
) -> String {
    let (status_class, status_text, button_class, button_text, button_action) = if state.on {
        ("on", "ON", "on", "Turn Off", "off")
    } else {
        ("off", "OFF", "off", "Turn On", "on")
    };

    let toggle = if plug.web_enabled {
        format!(
            r#"<form hx-post="/toggle/{id}" hx-target="#plug-{id}" hx-swap="outerHTML">
<input type="hidden" name="action" value="{button_action}">
<button type="submit" class="{button_class}">{button_text}</button>
</form>"#,
            id = escape(&plug.id),
        )
    } else {
        String::new()
    };

    format!(
        r#"<div id="plug-{id}" class="plug {status_class}" sse-swap="{id}" hx-swap="outerHTML">
<div>
<div class="plug-name">{name}</div>
<div class="plug-status">Status: {status_text} | Last updated: {updated}</div>
<div class="conn {conn_class}">{conn_note}</div>
</div>
{toggle}
</div>"#,
        id = escape(&plug.id),
        name = escape(&plug.name),
        updated = clock_time(state.last_updated),
        conn_class = connection.as_str(),
        conn_note = escape(connection_note),
    )
}

pub fn dashboard(plug_count: usize, cards: &str, events: &[String]) -> String {
    let event_rows: String = events
        .iter()
        .rev()
        .take(20)
        .map(|event| format!(r#"<div class="event">{}</div>"#, escape(event)))
        .collect();

    let content = format!(
        r#"<h1>Tasmota Bridge</h1>
<p>Managing {plug_count} plugs</p>
<div hx-ext="sse" sse-connect="/events">{cards}</div>
<div class="events"><h2>Recent Events</h2><div>{event_rows}</div></div>"#,
    );
    page("Tasmota Bridge", &content)
}

/// Snapshot view of the latest bus traffic for `/debug/eventbus`.
pub fn eventbus_debug(
    updates: &[StateUpdateEvent],
    statuses: &[ConnectionStatusEvent],
    dropped: u64,
) -> String {
    let mut update_rows = String::new();
    for update in updates {
        update_rows.push_str(&format!(
            "<tr><td>{}</td><td>{:?}</td><td>{}</td><td>{:.1}</td><td>{}</td><td>{}</td></tr>",
            escape(&update.plug_id),
            update.source,
            update.on,
            update.power,
            update.connection_state,
            escape(&update.connection_note),
        ));
    }

    let mut status_rows = String::new();
    for status in statuses {
        status_rows.push_str(&format!(
            "<tr><td>{}</td><td>{}</td><td>{}</td></tr>",
            escape(&status.component),
            status.status.as_str(),
            escape(status.error.as_deref().unwrap_or("-")),
        ));
    }

    let content = format!(
        r#"<h1>Event Bus</h1>
<p>Dropped events (full subscriber queues): {dropped}</p>
<h2>Latest state update per plug</h2>
<table><tr><th>Plug</th><th>Source</th><th>On</th><th>Power</th><th>Connection</th><th>Note</th></tr>{update_rows}</table>
<h2>Latest status per component</h2>
<table><tr><th>Component</th><th>Status</th><th>Error</th></tr>{status_rows}</table>"#,
    );
    page("Event Bus Debug", &content)
}
