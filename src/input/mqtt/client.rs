//! MQTT client wrapper for the exporter.

use super::Subscriber;
use crate::config::MqttConfig;
use crate::error::{ExporterError, Result};
use async_trait::async_trait;
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use prometheus::IntGauge;
use rumqttc::{
    AsyncClient, Event, EventLoop, MqttOptions, Outgoing, Packet, QoS, SubscribeReasonCode,
};
use std::collections::{BTreeSet, HashMap, VecDeque};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Message received from MQTT broker.
#[derive(Debug, Clone)]
pub struct MqttMessage {
    pub topic: String,
    pub payload: Vec<u8>,
}

/// How long a resubscription after a reconnect may wait for its SUBACK.
const RESUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(5);

/// Subscriptions waiting for their SUBACK, and the ones granted so far.
///
/// rumqttc assigns packet ids inside the event loop, so requests are queued
/// in the order they were handed to the client and matched to the packet id
/// when the event loop reports the outgoing SUBSCRIBE.
#[derive(Default)]
struct SubscribeAcks {
    /// Serializes "queue + send request" so queue order equals request order.
    order: tokio::sync::Mutex<()>,
    queued: Mutex<VecDeque<oneshot::Sender<bool>>>,
    sent: Mutex<HashMap<u16, oneshot::Sender<bool>>>,
    granted: Mutex<BTreeSet<String>>,
    connected_before: AtomicBool,
}

impl SubscribeAcks {
    fn on_granted(&self, topic: &str) {
        self.granted.lock().insert(topic.to_string());
    }

    /// Topics to subscribe again after a CONNACK. Empty on the first
    /// connection and when the broker kept the session.
    fn on_connack(&self, session_present: bool) -> Vec<String> {
        let reconnect = self.connected_before.swap(true, Ordering::SeqCst);
        if !reconnect || session_present {
            return Vec::new();
        }
        self.granted.lock().iter().cloned().collect()
    }

    fn on_outgoing(&self, pkid: u16) {
        let next = self.queued.lock().pop_front();
        match next {
            Some(tx) => {
                self.sent.lock().insert(pkid, tx);
            }
            None => debug!("[MQTT] Untracked subscribe request pkid={}", pkid),
        }
    }

    fn on_suback(&self, pkid: u16, granted: bool) {
        if let Some(tx) = self.sent.lock().remove(&pkid) {
            // Receiver gone means the caller already gave up
            let _ = tx.send(granted);
        }
    }

    /// Drop every sent request; their callers see the subscription as lost.
    fn on_disconnect(&self) {
        self.sent.lock().clear();
    }
}

/// MQTT client: owns the event loop until [`MqttClient::run`] is called.
pub struct MqttClient {
    client: AsyncClient,
    event_loop: EventLoop,
    acks: Arc<SubscribeAcks>,
    status: Option<IntGauge>,
    fatal: Option<mpsc::Sender<ExporterError>>,
}

impl MqttClient {
    /// Create a new MQTT client from configuration.
    pub fn new(config: &MqttConfig) -> Self {
        let mut options =
            MqttOptions::new(&config.client_id, config.connect_host(), config.broker_port);
        options.set_keep_alive(Duration::from_secs(30));

        // Set credentials if provided
        if let (Some(username), Some(password)) = (&config.username, &config.password) {
            options.set_credentials(username, password);
        }

        let (client, event_loop) = AsyncClient::new(options, 100);

        Self {
            client,
            event_loop,
            acks: Arc::new(SubscribeAcks::default()),
            status: None,
            fatal: None,
        }
    }

    /// Report the connection state (1 connected, 0 otherwise) on `gauge`.
    pub fn with_status_gauge(mut self, gauge: IntGauge) -> Self {
        gauge.set(0);
        self.status = Some(gauge);
        self
    }

    /// Where to report subscriptions that couldn't be restored after a
    /// reconnect.
    pub fn with_fatal_channel(mut self, fatal: mpsc::Sender<ExporterError>) -> Self {
        self.fatal = Some(fatal);
        self
    }

    /// Handle for subscribing from other tasks.
    pub fn handle(&self) -> MqttHandle {
        MqttHandle {
            client: self.client.clone(),
            acks: self.acks.clone(),
        }
    }

    /// Run the MQTT event loop and forward messages to the provided channel.
    ///
    /// `connected` fires on the first CONNACK. Runs until the message channel
    /// is closed; connection errors are retried every 5 seconds and granted
    /// subscriptions are restored when the broker lost the session.
    pub async fn run(
        mut self,
        tx: mpsc::Sender<MqttMessage>,
        mut connected: Option<oneshot::Sender<()>>,
    ) {
        info!("[MQTT] Starting event loop");

        loop {
            match self.event_loop.poll().await {
                Ok(Event::Incoming(Packet::ConnAck(ack))) => {
                    info!("[MQTT] Connected ({:?})", ack.code);
                    self.set_status(1);
                    if let Some(signal) = connected.take() {
                        let _ = signal.send(());
                    }
                    let topics = self.acks.on_connack(ack.session_present);
                    if !topics.is_empty() {
                        warn!(
                            "[MQTT] Broker has no session, restoring {} subscriptions",
                            topics.len()
                        );
                        // Separate task, SUBACKs arrive through this loop
                        tokio::spawn(resubscribe(self.handle(), topics, self.fatal.clone()));
                    }
                }
                Ok(Event::Incoming(Packet::SubAck(ack))) => {
                    let granted = !ack
                        .return_codes
                        .iter()
                        .any(|code| matches!(code, SubscribeReasonCode::Failure));
                    debug!("[MQTT] SUBACK pkid={} granted={}", ack.pkid, granted);
                    self.acks.on_suback(ack.pkid, granted);
                }
                Ok(Event::Incoming(Packet::Publish(publish))) => {
                    let msg = MqttMessage {
                        topic: publish.topic.clone(),
                        payload: publish.payload.to_vec(),
                    };
                    if tx.send(msg).await.is_err() {
                        error!("[MQTT] Message channel closed");
                        break;
                    }
                }
                Ok(Event::Outgoing(Outgoing::Subscribe(pkid))) => {
                    self.acks.on_outgoing(pkid);
                }
                Ok(Event::Incoming(Packet::Disconnect)) => {
                    warn!("[MQTT] Broker sent DISCONNECT");
                    self.set_status(0);
                    self.acks.on_disconnect();
                }
                Ok(_) => {}
                Err(e) => {
                    error!("[MQTT] Connection error: {:?}", e);
                    self.set_status(0);
                    self.acks.on_disconnect();
                    // Wait before reconnecting
                    tokio::time::sleep(Duration::from_secs(5)).await;
                }
            }
        }
    }

    fn set_status(&self, value: i64) {
        if let Some(gauge) = &self.status {
            gauge.set(value);
        }
    }
}

async fn resubscribe(
    handle: MqttHandle,
    topics: Vec<String>,
    fatal: Option<mpsc::Sender<ExporterError>>,
) {
    for topic in topics {
        let result = tokio::time::timeout(RESUBSCRIBE_TIMEOUT, handle.subscribe(&topic))
            .await
            .unwrap_or_else(|_| {
                Err(ExporterError::SubscribeTimeout {
                    topic: topic.clone(),
                })
            });
        if let Err(e) = result {
            error!("[MQTT] Failed to restore subscription to {}: {}", topic, e);
            if let Some(fatal) = &fatal {
                let _ = fatal.send(e).await;
            }
            return;
        }
    }
    info!("[MQTT] Subscriptions restored");
}

/// Cloneable subscribe handle bound to a running [`MqttClient`].
#[derive(Clone)]
pub struct MqttHandle {
    client: AsyncClient,
    acks: Arc<SubscribeAcks>,
}

#[async_trait]
impl Subscriber for MqttHandle {
    async fn subscribe(&self, topic: &str) -> Result<()> {
        info!("[MQTT] Subscribing to topic: {}", topic);
        let (ack_tx, ack_rx) = oneshot::channel();
        {
            let _order = self.acks.order.lock().await;
            self.acks.queued.lock().push_back(ack_tx);
            if let Err(e) = self.client.subscribe(topic, QoS::AtMostOnce).await {
                self.acks.queued.lock().pop_back();
                return Err(e.into());
            }
        }

        match ack_rx.await {
            Ok(true) => {
                self.acks.on_granted(topic);
                Ok(())
            }
            Ok(false) => Err(ExporterError::SubscribeRejected {
                topic: topic.to_string(),
            }),
            Err(_) => Err(ExporterError::SubscribeDropped {
                topic: topic.to_string(),
            }),
        }
    }
}
