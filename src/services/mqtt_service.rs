//! MQTT sensor publisher
//!
//! Publishes the forecast sensors as retained JSON payloads to a configured broker.
//! Topic structure: `{prefix}/{array_slug}/state` per array with data, and
//! `{prefix}/system/state` for the system totals.
//! Availability: `{prefix}/status` is `online` while connected, `offline` as last will.

use std::time::Duration;

use rumqttc::{AsyncClient, Event, LastWill, MqttOptions, Packet, QoS};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MqttConfig;
use crate::services::forecast_service::ForecastService;
use crate::shared_state::AppState;

const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Lowercase topic segment; anything but ASCII alphanumerics becomes `_`.
pub fn slug(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() { c.to_ascii_lowercase() } else { '_' })
        .collect()
}

/// Retained state messages for the current cache contents.
pub fn state_messages(prefix: &str, forecasts: &ForecastService) -> Vec<(String, String)> {
    let mut messages = Vec::new();
    for array in forecasts.list_arrays() {
        match forecasts.array_forecast(&array.name) {
            Ok(view) => match serde_json::to_string(&view) {
                Ok(payload) => messages.push((format!("{prefix}/{}/state", slug(&array.name)), payload)),
                Err(e) => warn!(array = %array.name, "cannot serialise array state: {e}"),
            },
            Err(e) => debug!(array = %array.name, "no state to publish: {e}"),
        }
    }
    match serde_json::to_string(&forecasts.system_forecast()) {
        Ok(payload) => messages.push((format!("{prefix}/system/state"), payload)),
        Err(e) => warn!("cannot serialise system state: {e}"),
    }
    messages
}

fn publish_states(client: &AsyncClient, prefix: &str, forecasts: &ForecastService) {
    let messages = state_messages(prefix, forecasts);
    let count = messages.len();
    for (topic, payload) in messages {
        // Never block the loop that drives the connection.
        if let Err(e) = client.try_publish(&topic, QoS::AtLeastOnce, true, payload) {
            warn!(%topic, "MQTT publish failed: {e}");
        }
    }
    debug!(messages = count, "forecast state published");
}

pub async fn run_publisher(cfg: MqttConfig, state: AppState, keep_alive: Duration, cancel: CancellationToken) {
    if !cfg.enabled || cfg.broker_host.is_empty() {
        info!("MQTT disabled or no broker configured, publisher not started");
        return;
    }

    let client_id = if cfg.client_id.is_empty() {
        format!("solar-forecast-{}", uuid::Uuid::new_v4())
    } else {
        cfg.client_id.clone()
    };
    let prefix = cfg.topic_prefix.trim_end_matches('/').to_string();
    let status_topic = format!("{prefix}/status");

    info!(
        broker = %cfg.broker_host,
        port = cfg.broker_port,
        %client_id,
        "connecting to MQTT broker"
    );

    let mut opts = MqttOptions::new(&client_id, &cfg.broker_host, cfg.broker_port);
    opts.set_keep_alive(Duration::from_secs(30));
    opts.set_clean_session(true);
    opts.set_last_will(LastWill::new(&status_topic, "offline", QoS::AtLeastOnce, true));
    if let (Some(user), Some(pass)) = (&cfg.username, &cfg.password) {
        opts.set_credentials(user, pass);
    }

    let (client, mut eventloop) = AsyncClient::new(opts, 64);
    let mut summaries = state.forecasts.coordinator().subscribe();
    let mut ticker = tokio::time::interval(keep_alive.max(Duration::from_secs(1)));

    loop {
        tokio::select! {
            _ = cancel.cancelled() => {
                let _ = client.try_publish(&status_topic, QoS::AtLeastOnce, true, "offline");
                let _ = client.try_disconnect();
                break;
            }
            changed = summaries.changed() => {
                if changed.is_err() {
                    break;
                }
                publish_states(&client, &prefix, &state.forecasts);
            }
            _ = ticker.tick() => publish_states(&client, &prefix, &state.forecasts),
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(_))) => {
                    info!("MQTT connected");
                    if let Err(e) = client.try_publish(&status_topic, QoS::AtLeastOnce, true, "online") {
                        warn!("cannot publish MQTT birth message: {e}");
                    }
                    publish_states(&client, &prefix, &state.forecasts);
                }
                Ok(_) => {}
                Err(e) => {
                    warn!("MQTT connection error: {e}, retrying in 5s");
                    tokio::select! {
                        _ = cancel.cancelled() => break,
                        _ = tokio::time::sleep(RECONNECT_DELAY) => {}
                    }
                }
            },
        }
    }
    info!("MQTT publisher stopped");
}
