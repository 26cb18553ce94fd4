// src/broker.rs
//
// MQTT side of the bridge.
//
// Owns the rumqttc client and the task driving its event loop. Inbound
// publishes and the connected signal are forwarded as events over a
// channel to the command router; reconnection is handled by simply
// polling the event loop again after an error.

use std::time::Duration;

use rumqttc::{AsyncClient, ConnectReturnCode, Event, MqttOptions, Packet, QoS};
use serde_json::Value;
use tokio::sync::{mpsc, watch};
use tracing::{error, info, warn};

use crate::config::MqttSettings;

// ============================================================================
// Payloads
// ============================================================================

/// Publishable payload. Structured payloads are serialized as JSON with
/// non-ASCII characters escaped, matching what the hub expects from the
/// installed bridges.
#[derive(Clone, Debug, PartialEq)]
pub enum Payload {
    Text(String),
    Int(i64),
    Float(f64),
    Json(Value),
}

impl Payload {
    pub fn render(&self) -> String {
        match self {
            Self::Text(s) => s.clone(),
            Self::Int(n) => n.to_string(),
            Self::Float(f) => f.to_string(),
            Self::Json(v) => to_ascii_json(v),
        }
    }
}

impl From<&str> for Payload {
    fn from(value: &str) -> Self {
        Self::Text(value.to_string())
    }
}

impl From<String> for Payload {
    fn from(value: String) -> Self {
        Self::Text(value)
    }
}

impl From<i64> for Payload {
    fn from(value: i64) -> Self {
        Self::Int(value)
    }
}

impl From<Value> for Payload {
    fn from(value: Value) -> Self {
        Self::Json(value)
    }
}

/// Serialize JSON with every non-ASCII character as a `\uXXXX` escape
/// (surrogate pairs for the astral planes).
pub fn to_ascii_json(value: &Value) -> String {
    let raw = serde_json::to_string(value).unwrap_or_else(|_| "null".to_string());
    let mut out = String::with_capacity(raw.len());
    for ch in raw.chars() {
        if ch.is_ascii() {
            out.push(ch);
        } else {
            let mut units = [0u16; 2];
            for unit in ch.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{:04x}", unit));
            }
        }
    }
    out
}

// ============================================================================
// Broker Link
// ============================================================================

/// Event forwarded to the command router.
#[derive(Clone, Debug, PartialEq)]
pub enum BrokerEvent {
    /// Session established and base subscription placed
    Connected,
    /// Inbound publish, payload decoded as trimmed lossy UTF-8
    Message { topic: String, payload: String },
}

/// A publish as seen by a sink handle.
#[derive(Clone, Debug, PartialEq)]
pub struct SinkMessage {
    pub topic: String,
    pub payload: String,
    pub retain: bool,
}

#[derive(Clone)]
enum HandleInner {
    Client(AsyncClient),
    Sink(mpsc::UnboundedSender<SinkMessage>),
}

/// Cloneable publishing handle, valid for the lifetime of the link.
#[derive(Clone)]
pub struct BrokerHandle {
    inner: HandleInner,
}

impl BrokerHandle {
    fn from_client(client: AsyncClient) -> Self {
        Self {
            inner: HandleInner::Client(client),
        }
    }

    /// Handle that records publishes instead of sending them.
    pub fn sink() -> (Self, mpsc::UnboundedReceiver<SinkMessage>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (
            Self {
                inner: HandleInner::Sink(tx),
            },
            rx,
        )
    }

    /// Fire-and-forget publish; failures are logged and tolerated.
    pub async fn publish(&self, topic: &str, payload: Payload, retain: bool, qos: QoS) {
        let rendered = payload.render();
        match &self.inner {
            HandleInner::Client(client) => {
                if let Err(e) = client.publish(topic, qos, retain, rendered).await {
                    warn!(topic, error = %e, "mqtt publish failed");
                }
            }
            HandleInner::Sink(tx) => {
                let _ = tx.send(SinkMessage {
                    topic: topic.to_string(),
                    payload: rendered,
                    retain,
                });
            }
        }
    }
}

pub struct BrokerLink {
    client: AsyncClient,
    shutdown_tx: watch::Sender<bool>,
    task: Option<tokio::task::JoinHandle<()>>,
}

impl BrokerLink {
    /// Connect asynchronously and start the event loop task.
    pub fn start(settings: &MqttSettings, events: mpsc::Sender<BrokerEvent>) -> Self {
        let mut options = MqttOptions::new(
            settings.client_id.clone(),
            settings.host.clone(),
            settings.port,
        );
        options.set_keep_alive(Duration::from_secs(settings.keepalive.max(5)));
        if !settings.username.is_empty() {
            options.set_credentials(settings.username.clone(), settings.password.clone());
        }

        let (client, eventloop) = AsyncClient::new(options, 64);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let task = tokio::spawn(run_event_loop(
            eventloop,
            client.clone(),
            settings.base_topic.clone(),
            events,
            shutdown_rx,
        ));

        Self {
            client,
            shutdown_tx,
            task: Some(task),
        }
    }

    pub fn handle(&self) -> BrokerHandle {
        BrokerHandle::from_client(self.client.clone())
    }

    /// Disconnect and stop the event loop task. Idempotent.
    pub async fn stop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        let _ = self.client.disconnect().await;
        if let Some(task) = self.task.take() {
            let _ = task.await;
        }
    }
}

async fn run_event_loop(
    mut eventloop: rumqttc::EventLoop,
    client: AsyncClient,
    base_topic: String,
    events: mpsc::Sender<BrokerEvent>,
    mut shutdown_rx: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    return;
                }
            }
            event = eventloop.poll() => match event {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    if ack.code != ConnectReturnCode::Success {
                        error!(code = ?ack.code, "mqtt connection refused");
                        continue;
                    }
                    info!("connected to mqtt broker");

                    let filter = format!("{}/#", base_topic);
                    if let Err(e) = client.subscribe(filter, QoS::AtMostOnce).await {
                        warn!(error = %e, "mqtt subscribe failed");
                    }
                    if events.send(BrokerEvent::Connected).await.is_err() {
                        return;
                    }
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let payload = String::from_utf8_lossy(&publish.payload)
                        .trim()
                        .to_string();
                    let message = BrokerEvent::Message {
                        topic: publish.topic,
                        payload,
                    };
                    if events.send(message).await.is_err() {
                        return;
                    }
                }
                Ok(_) => {}
                Err(e) => {
                    warn!(error = %e, "mqtt connection lost, retrying");
                    tokio::time::sleep(Duration::from_secs(1)).await;
                }
            }
        }
    }
}

// ============================================================================
// Tests
// ============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_payload_render_text_and_numbers() {
        assert_eq!(Payload::from("ON").render(), "ON");
        assert_eq!(Payload::from(128i64).render(), "128");
        assert_eq!(Payload::Float(1.5).render(), "1.5");
    }

    #[test]
    fn test_payload_render_json() {
        let payload = Payload::from(json!({"success": true, "ts": 10}));
        assert_eq!(payload.render(), r#"{"success":true,"ts":10}"#);
    }

    #[test]
    fn test_ascii_json_escapes_non_ascii() {
        let rendered = to_ascii_json(&json!({"name": "Caffè"}));
        assert_eq!(rendered, "{\"name\":\"Caff\\u00e8\"}");
        assert!(rendered.bytes().all(|b| b < 0x80));
    }

    #[test]
    fn test_ascii_json_astral_plane() {
        // Astral-plane characters become a surrogate pair
        let rendered = to_ascii_json(&json!("\u{1F4A1}"));
        assert_eq!(rendered, "\"\\ud83d\\udca1\"");
    }
}
