//! Exporter orchestrator.
//!
//! Wires the MQTT client, the parsers and the metrics endpoint together and
//! runs until a shutdown signal, an HTTP server failure or a fatal
//! subscription error.

use crate::config::Config;
use crate::dispatcher::{Dispatcher, Routes};
use crate::error::{ExporterError, Result};
use crate::hass::{HaDataHandler, HaDiscoveryParser};
use crate::homie::HomieParser;
use crate::input::mqtt::{MqttClient, MqttMessage, Subscriber};
use crate::metrics::{MetricSink, PrometheusSink};
use crate::registry::Registry;
use crate::server;
use log::{error, info, warn};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};

/// Wildcard subscription for Homie devices.
pub const HOMIE_TOPIC: &str = "homie/#";
/// Wildcard subscription for Home Assistant sensor discovery.
pub const HA_DISCOVERY_TOPIC: &str = "homeassistant/sensor/#";

const CONNECT_TIMEOUT: Duration = Duration::from_secs(5);
const BASE_SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(5);

pub struct Exporter {
    config: Config,
    registry: Arc<Registry>,
    sink: Arc<PrometheusSink>,
}

impl Exporter {
    pub fn new(config: Config) -> Result<Self> {
        Ok(Self {
            config,
            registry: Arc::new(Registry::new()),
            sink: Arc::new(PrometheusSink::new()?),
        })
    }

    pub async fn run(self) -> Result<()> {
        let broker = self.config.mqtt.broker_address();
        info!("[MQTT] Connecting to {}", broker);

        // Subscription failures, from discovery or from restoring a session
        let (fatal_tx, mut fatal_rx) = mpsc::channel::<ExporterError>(1);

        let status = self.sink.client_status_gauge(&broker)?;
        let mqtt_client = MqttClient::new(&self.config.mqtt)
            .with_status_gauge(status)
            .with_fatal_channel(fatal_tx.clone());
        let subscriber = Arc::new(mqtt_client.handle());

        // Channel for MQTT messages
        let (msg_tx, msg_rx) = mpsc::channel::<MqttMessage>(256);
        // Channel to signal when connected
        let (connected_tx, connected_rx) = oneshot::channel();

        // Start MQTT event loop FIRST (so it can establish connection)
        let mqtt_loop = tokio::spawn(mqtt_client.run(msg_tx, Some(connected_tx)));

        match tokio::time::timeout(CONNECT_TIMEOUT, connected_rx).await {
            Ok(Ok(())) => info!("[MQTT] Connection established"),
            Ok(Err(_)) => {
                mqtt_loop.abort();
                return Err(ExporterError::EventLoopStopped);
            }
            Err(_) => {
                mqtt_loop.abort();
                return Err(ExporterError::ConnectTimeout(CONNECT_TIMEOUT.as_secs()));
            }
        }

        let sink: Arc<dyn MetricSink> = self.sink.clone();
        let data = Arc::new(HaDataHandler::new(self.registry.clone(), sink.clone()));
        let discovery = Arc::new(HaDiscoveryParser::new(
            self.registry.clone(),
            data.clone(),
            subscriber.clone(),
            fatal_tx,
        ));
        let homie = Arc::new(HomieParser::new(self.registry.clone(), sink));
        let dispatcher = Arc::new(Dispatcher::new(
            Routes::new(&self.config.exporter.ha_state_prefix),
            homie,
            discovery,
            data,
        ));

        // The dispatcher must drain messages before we wait on SUBACKs, the
        // event loop blocks while the message channel is full
        let dispatch_task = tokio::spawn(dispatcher.run(msg_rx));

        for topic in [HOMIE_TOPIC, HA_DISCOVERY_TOPIC] {
            let result = tokio::time::timeout(BASE_SUBSCRIBE_TIMEOUT, subscriber.subscribe(topic))
                .await
                .unwrap_or_else(|_| {
                    Err(ExporterError::SubscribeTimeout {
                        topic: topic.to_string(),
                    })
                });
            if let Err(e) = result {
                mqtt_loop.abort();
                dispatch_task.abort();
                return Err(e);
            }
        }

        let listen = self.config.exporter.listen_address.clone();
        let sink = self.sink.clone();
        let mut http_task = tokio::spawn(async move { server::run(sink, &listen).await });

        let result = tokio::select! {
            _ = shutdown_signal() => {
                info!("Received shutdown signal");
                Ok(())
            }
            res = &mut http_task => match res {
                Ok(Ok(())) => {
                    warn!("[HTTP] Server stopped");
                    Ok(())
                }
                Ok(Err(e)) => Err(e),
                Err(e) => Err(ExporterError::Server(e.to_string())),
            },
            Some(e) = fatal_rx.recv() => {
                error!("Subscription lost: {}", e);
                Err(e)
            }
        };

        http_task.abort();
        dispatch_task.abort();
        mqtt_loop.abort();
        result
    }
}

/// Resolves on Ctrl+C or, on Unix, SIGTERM.
async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("Failed to listen for shutdown signal: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                error!("Failed to listen for SIGTERM: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {}
        _ = terminate => {}
    }
}
