// src/service.rs
//
// Bridge lifecycle and the polling/dispatch machinery.
//
// A running bridge is four workers around one `BridgeCore`:
//   - the serial reader thread (owned by SerialLink)
//   - the broker event loop (owned by BrokerLink)
//   - the frame dispatcher, consuming parsed frames serially
//   - the command router + polling scheduler tasks
//
// Stop is idempotent; reload is stop + rebuild indexes + start with the
// freshly persisted configuration. The dimmer cache lives at service
// scope so remembered brightness survives a reload.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use rumqttc::QoS;
use serde_json::json;
use tokio::sync::{mpsc, watch, Notify};
use tokio::task::JoinHandle;
use tracing::{info, warn};

use crate::broker::{BrokerEvent, BrokerHandle, BrokerLink, Payload};
use crate::config::{AppConfig, DeviceConfig};
use crate::devices::DeviceIndex;
use crate::discovery;
use crate::error::BridgeError;
use crate::projector::{project_polling, OutboundMessage};
use crate::protocol::{
    build_polling_extended, parse_polling_status, ParsedFrame, PollingStatus,
    CMD_POLLING_EXTENDED, CMD_POLLING_RESPONSE,
};
use crate::serial_link::{FrameSender, SerialLink};
use crate::store::ConfigStore;
use crate::transaction::{FrameMatcher, TransactionEngine, COMMAND_ACK_TIMEOUT};

/// Quiet gap between two polled addresses during a sweep
const POLL_SPACING: Duration = Duration::from_millis(50);

pub type DimmerCache = Arc<Mutex<HashMap<String, u8>>>;

// ============================================================================
// Core
// ============================================================================

/// Everything a worker needs to act on the bus and the broker for one run
/// of the bridge. Rebuilt from scratch on every (re)start.
pub struct BridgeCore {
    pub(crate) config: AppConfig,
    pub(crate) index: DeviceIndex,
    pub(crate) broker: BrokerHandle,
    pub(crate) engine: Arc<TransactionEngine>,
    pub(crate) dimmer_cache: DimmerCache,
    pub(crate) poll_trigger: Notify,
}

impl BridgeCore {
    pub fn new(
        config: AppConfig,
        broker: BrokerHandle,
        sender: Arc<dyn FrameSender>,
        dimmer_cache: DimmerCache,
    ) -> Self {
        let index = DeviceIndex::build(&config);
        Self {
            config,
            index,
            broker,
            engine: Arc::new(TransactionEngine::new(sender)),
            dimmer_cache,
            poll_trigger: Notify::new(),
        }
    }

    pub(crate) fn topic_prefix(&self, device: &DeviceConfig) -> String {
        format!("{}/{}", self.config.mqtt.base_topic, device.topic_slug())
    }

    pub(crate) async fn publish(&self, topic: &str, payload: impl Into<Payload>, retain: bool) {
        self.broker
            .publish(topic, payload.into(), retain, QoS::AtMostOnce)
            .await;
    }

    pub(crate) async fn publish_messages(&self, messages: Vec<OutboundMessage>) {
        for message in messages {
            self.broker
                .publish(&message.topic, message.payload, message.retain, QoS::AtMostOnce)
                .await;
        }
    }

    /// Project a polling snapshot for one device: publish its state topics
    /// and refresh the remembered dimmer level.
    pub(crate) async fn apply_projection(&self, device: &DeviceConfig, polling: &PollingStatus) {
        let projection = project_polling(device, polling, &self.config.mqtt.base_topic);
        if let Some(percent) = projection.dimmer_percent {
            self.remember_dimmer_percent(device, percent);
        }
        self.publish_messages(projection.messages).await;
    }

    pub(crate) fn remember_dimmer_percent(&self, device: &DeviceConfig, percent: u8) {
        self.dimmer_cache
            .lock()
            .expect("dimmer cache poisoned")
            .insert(device.id.clone(), percent);
    }

    pub(crate) fn recall_dimmer_percent(&self, device: &DeviceConfig) -> Option<u8> {
        self.dimmer_cache
            .lock()
            .expect("dimmer cache poisoned")
            .get(&device.id)
            .copied()
    }

    pub(crate) async fn publish_action_result(
        &self,
        device: &DeviceConfig,
        action: &str,
        success: bool,
        detail: String,
    ) {
        if !device.publish_enabled {
            return;
        }
        let topic = format!("{}/action/result", self.topic_prefix(device));
        let payload = json!({
            "action": action,
            "success": success,
            "detail": detail,
            "ts": chrono::Utc::now().timestamp(),
        });
        self.publish(&topic, payload, false).await;
    }

    pub(crate) async fn publish_poll_result(&self, device: &DeviceConfig, success: bool) {
        if !device.publish_enabled {
            return;
        }
        let topic = format!("{}/poll/last", self.topic_prefix(device));
        let payload = json!({
            "success": success,
            "ts": chrono::Utc::now().timestamp(),
        });
        self.publish(&topic, payload, true).await;
    }

    pub(crate) async fn publish_light_channel_state(
        &self,
        device: &DeviceConfig,
        channel: u8,
        is_on: bool,
    ) {
        if !device.publish_enabled || !device.channels().contains(&channel) {
            return;
        }

        let prefix = self.topic_prefix(device);
        let state = if is_on { "ON" } else { "OFF" };
        self.publish(&format!("{prefix}/ch/{channel}/state"), state, true)
            .await;
        if device.channels().len() == 1 || channel == device.primary_channel() {
            self.publish(&format!("{prefix}/state"), state, true).await;
        }
    }

    // ------------------------------------------------------------------
    // Polling
    // ------------------------------------------------------------------

    /// One polling transaction plus snapshot decode.
    pub(crate) async fn request_polling_status(&self, address: u8) -> Option<PollingStatus> {
        let frame = build_polling_extended(address).ok()?;
        let reply = self
            .engine
            .send_with_ack(&frame, address, FrameMatcher::PollingReply, COMMAND_ACK_TIMEOUT)
            .await
            .ok()?;
        match parse_polling_status(&reply) {
            Ok(polling) => Some(polling),
            Err(e) => {
                warn!(address, error = %e, "polling reply did not decode");
                None
            }
        }
    }

    /// Poll one address and publish the outcome for every device on it.
    pub(crate) async fn send_poll(&self, address: u8) {
        let polling = self.request_polling_status(address).await;
        let success = polling.is_some();

        if let Some(polling) = &polling {
            for device in self.index.at_address(address) {
                self.apply_projection(device, polling).await;
            }
        } else {
            warn!(address, "polling timed out");
        }

        for device in self.index.at_address(address) {
            self.publish_poll_result(device, success).await;
        }
    }

    /// Sweep every indexed address in ascending order.
    pub(crate) async fn poll_all(&self, shutdown: &watch::Receiver<bool>) {
        let addresses: Vec<u8> = self.index.addresses().collect();
        for address in addresses {
            if *shutdown.borrow() {
                return;
            }
            self.send_poll(address).await;
            tokio::time::sleep(POLL_SPACING).await;
        }
    }

    pub fn trigger_poll_all(&self) {
        self.poll_trigger.notify_one();
    }

    // ------------------------------------------------------------------
    // Inbound Frames
    // ------------------------------------------------------------------

    /// Every parsed frame lands here: first it gets a chance to complete
    /// the pending transaction, then it always flows into general
    /// dispatch so spontaneous traffic keeps the published state fresh.
    pub(crate) async fn handle_frame(&self, frame: ParsedFrame) {
        self.engine.resolve(&frame);

        if frame.command == CMD_POLLING_EXTENDED || frame.command == CMD_POLLING_RESPONSE {
            match parse_polling_status(&frame) {
                Ok(polling) => {
                    for device in self.index.at_address(frame.address) {
                        self.apply_projection(device, &polling).await;
                    }
                }
                Err(e) => warn!(address = frame.address, error = %e, "bad polling frame"),
            }
            return;
        }

        self.handle_non_polling_frame(&frame).await;
    }

    pub(crate) async fn on_broker_connected(&self) {
        info!("broker session established, publishing discovery");
        self.publish_messages(discovery::discovery_messages(&self.config))
            .await;
        self.trigger_poll_all();
    }
}

// ============================================================================
// Workers
// ============================================================================

async fn run_dispatcher(
    core: Arc<BridgeCore>,
    mut frames: mpsc::Receiver<ParsedFrame>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            frame = frames.recv() => match frame {
                Some(frame) => core.handle_frame(frame).await,
                None => return,
            }
        }
    }
}

async fn run_router(
    core: Arc<BridgeCore>,
    mut events: mpsc::Receiver<BrokerEvent>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            event = events.recv() => match event {
                Some(BrokerEvent::Connected) => core.on_broker_connected().await,
                Some(BrokerEvent::Message { topic, payload }) => {
                    core.handle_command(&topic, &payload).await;
                }
                None => return,
            }
        }
    }
}

async fn run_scheduler(core: Arc<BridgeCore>, mut shutdown: watch::Receiver<bool>) {
    loop {
        let interval = Duration::from_secs(core.config.polling.interval_sec.max(1));
        let auto_start = core.config.polling.auto_start;

        tokio::select! {
            _ = shutdown.changed() => {
                if *shutdown.borrow() {
                    return;
                }
            }
            // Manual pokes coalesce: Notify holds one permit at most
            _ = core.poll_trigger.notified() => {
                core.poll_all(&shutdown).await;
            }
            _ = tokio::time::sleep(interval), if auto_start => {
                core.poll_all(&shutdown).await;
            }
        }
    }
}

// ============================================================================
// Service
// ============================================================================

struct RunningBridge {
    core: Arc<BridgeCore>,
    serial: SerialLink,
    broker: BrokerLink,
    shutdown_tx: watch::Sender<bool>,
    tasks: Vec<JoinHandle<()>>,
}

pub struct BridgeService {
    store: Arc<ConfigStore>,
    dimmer_cache: DimmerCache,
    inner: tokio::sync::Mutex<Option<RunningBridge>>,
}

impl BridgeService {
    pub fn new(store: Arc<ConfigStore>) -> Self {
        Self {
            store,
            dimmer_cache: Arc::new(Mutex::new(HashMap::new())),
            inner: tokio::sync::Mutex::new(None),
        }
    }

    /// Start all workers from the stored configuration. Idempotent.
    pub async fn start(&self) -> Result<(), BridgeError> {
        let mut inner = self.inner.lock().await;
        if inner.is_some() {
            return Ok(());
        }

        let config = self.store.config();
        let (frame_tx, frame_rx) = mpsc::channel(256);
        let (event_tx, event_rx) = mpsc::channel(256);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let mut serial = SerialLink::new(config.serial.clone());
        serial.start(frame_tx);

        let broker = BrokerLink::start(&config.mqtt, event_tx);

        let core = Arc::new(BridgeCore::new(
            config,
            broker.handle(),
            Arc::new(serial.handle()),
            self.dimmer_cache.clone(),
        ));

        let tasks = vec![
            tokio::spawn(run_dispatcher(core.clone(), frame_rx, shutdown_rx.clone())),
            tokio::spawn(run_router(core.clone(), event_rx, shutdown_rx.clone())),
            tokio::spawn(run_scheduler(core.clone(), shutdown_rx)),
        ];

        info!(devices = core.index.device_count(), "bridge started");
        *inner = Some(RunningBridge {
            core,
            serial,
            broker,
            shutdown_tx,
            tasks,
        });
        Ok(())
    }

    /// Stop all workers. Idempotent; outstanding transaction waits finish
    /// by their own timeout.
    pub async fn stop(&self) {
        let mut inner = self.inner.lock().await;
        let Some(mut running) = inner.take() else {
            return;
        };

        let _ = running.shutdown_tx.send(true);

        // The reader thread blocks on the port, join it off the runtime
        let serial = running.serial;
        let _ = tokio::task::spawn_blocking(move || {
            let mut serial = serial;
            serial.stop();
        })
        .await;

        running.broker.stop().await;
        for task in running.tasks {
            let _ = task.await;
        }
        info!("bridge stopped");
    }

    /// Re-read the stored configuration and restart the workers.
    pub async fn reload(&self) -> Result<(), BridgeError> {
        let was_running = self.inner.lock().await.is_some();
        self.stop().await;
        if was_running {
            self.start().await?;
        }
        info!("configuration reloaded");
        Ok(())
    }

    /// Coalescing manual poll trigger; no-op while stopped.
    pub async fn trigger_poll_all(&self) {
        let inner = self.inner.lock().await;
        if let Some(running) = inner.as_ref() {
            running.core.trigger_poll_all();
        }
    }

    /// Delayed self-exit so the admin response still goes out.
    pub fn restart_self(&self) -> String {
        tokio::spawn(async {
            tokio::time::sleep(Duration::from_secs(1)).await;
            std::process::exit(0);
        });
        "application restart requested".to_string()
    }

    /// Spawn the configured restart command.
    pub fn run_restart_command(&self) -> Result<String, BridgeError> {
        let command = self.store.config().service.restart_command.trim().to_string();
        if command.is_empty() {
            return Err(BridgeError::config("restart_command not configured"));
        }

        spawn_shell(&command).map_err(|e| BridgeError::config(format!("restart command failed: {e}")))?;
        Ok(format!("command started: {command}"))
    }
}

#[cfg(unix)]
fn spawn_shell(command: &str) -> std::io::Result<std::process::Child> {
    std::process::Command::new("sh").arg("-c").arg(command).spawn()
}

#[cfg(not(unix))]
fn spawn_shell(command: &str) -> std::io::Result<std::process::Child> {
    std::process::Command::new("cmd").arg("/C").arg(command).spawn()
}
