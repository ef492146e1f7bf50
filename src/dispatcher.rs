//! Routes inbound MQTT messages to the parser responsible for their topic.

use crate::hass::{DiscoveryOutcome, HaDataHandler, HaDiscoveryParser, StateOutcome};
use crate::homie::{HomieOutcome, HomieParser};
use crate::input::mqtt::MqttMessage;
use log::{debug, error, info};
use std::sync::Arc;
use tokio::sync::mpsc;

/// Prefix of Homie topics.
pub const HOMIE_PREFIX: &str = "homie/";
/// Prefix of Home Assistant sensor discovery topics.
pub const HA_DISCOVERY_PREFIX: &str = "homeassistant/sensor/";

/// Which handler a topic belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
    Homie,
    HaDiscovery,
    HaState,
    Unmatched,
}

/// Topic prefix table.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routes {
    ha_state_prefix: String,
}

impl Routes {
    /// `ha_state_prefix` is matched as a whole topic level (`tele` matches
    /// `tele/...`). An empty prefix catches every topic not claimed by Homie
    /// or discovery.
    pub fn new(ha_state_prefix: &str) -> Self {
        let mut ha_state_prefix = ha_state_prefix.to_string();
        if !ha_state_prefix.is_empty() && !ha_state_prefix.ends_with('/') {
            ha_state_prefix.push('/');
        }
        Self { ha_state_prefix }
    }

    pub fn route(&self, topic: &str) -> Route {
        if topic.starts_with(HOMIE_PREFIX) {
            Route::Homie
        } else if topic.starts_with(HA_DISCOVERY_PREFIX) {
            Route::HaDiscovery
        } else if topic.starts_with(&self.ha_state_prefix) {
            Route::HaState
        } else {
            Route::Unmatched
        }
    }
}

/// What became of a dispatched message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Dispatched {
    Homie(HomieOutcome),
    HaDiscovery(DiscoveryOutcome),
    HaState(StateOutcome),
    Unmatched,
}

/// Hands each message to the matching parser.
pub struct Dispatcher {
    routes: Routes,
    homie: Arc<HomieParser>,
    discovery: Arc<HaDiscoveryParser>,
    data: Arc<HaDataHandler>,
}

impl Dispatcher {
    pub fn new(
        routes: Routes,
        homie: Arc<HomieParser>,
        discovery: Arc<HaDiscoveryParser>,
        data: Arc<HaDataHandler>,
    ) -> Self {
        Self {
            routes,
            homie,
            discovery,
            data,
        }
    }

    /// Process one message to completion.
    ///
    /// Subscribed state topics win over prefix routing, an entity may publish
    /// its state below `homeassistant/sensor/`.
    pub async fn dispatch(&self, msg: MqttMessage) -> Dispatched {
        let route = if self.data.is_bound(&msg.topic) {
            Route::HaState
        } else {
            self.routes.route(&msg.topic)
        };

        let outcome = match route {
            Route::Homie => Dispatched::Homie(self.homie.handle(&msg.topic, &msg.payload)),
            Route::HaDiscovery => {
                Dispatched::HaDiscovery(self.discovery.handle(&msg.topic, &msg.payload).await)
            }
            Route::HaState => Dispatched::HaState(self.data.handle(&msg.topic, &msg.payload)),
            Route::Unmatched => {
                error!("[Dispatch] No handler for topic {}", msg.topic);
                Dispatched::Unmatched
            }
        };
        debug!("[Dispatch] {} -> {:?}", msg.topic, outcome);
        outcome
    }

    /// Receive messages until the channel closes, handling each one on its
    /// own task.
    pub async fn run(self: Arc<Self>, mut rx: mpsc::Receiver<MqttMessage>) {
        info!("[Dispatch] Waiting for messages");
        while let Some(msg) = rx.recv().await {
            debug!("[Dispatch] Message on {}", msg.topic);
            let dispatcher = self.clone();
            tokio::spawn(async move {
                dispatcher.dispatch(msg).await;
            });
        }
        info!("[Dispatch] Message channel closed");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::ExporterError;
    use crate::hass::testing::{FakeSubscriber, SubscribeBehaviour};
    use crate::metrics::testing::RecordingSink;
    use crate::registry::{DeviceKey, Registry, SourceType};

    fn msg(topic: &str, payload: &[u8]) -> MqttMessage {
        MqttMessage {
            topic: topic.to_string(),
            payload: payload.to_vec(),
        }
    }

    struct Harness {
        dispatcher: Arc<Dispatcher>,
        registry: Arc<Registry>,
        sink: Arc<RecordingSink>,
        _fatal_rx: mpsc::Receiver<ExporterError>,
    }

    fn harness(ha_state_prefix: &str) -> Harness {
        let registry = Arc::new(Registry::new());
        let sink = Arc::new(RecordingSink::default());
        let data = Arc::new(HaDataHandler::new(registry.clone(), sink.clone()));
        let (fatal_tx, fatal_rx) = mpsc::channel(1);
        let discovery = Arc::new(HaDiscoveryParser::new(
            registry.clone(),
            data.clone(),
            Arc::new(FakeSubscriber::new(SubscribeBehaviour::Ack)),
            fatal_tx,
        ));
        let homie = Arc::new(HomieParser::new(registry.clone(), sink.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            Routes::new(ha_state_prefix),
            homie,
            discovery,
            data,
        ));
        Harness {
            dispatcher,
            registry,
            sink,
            _fatal_rx: fatal_rx,
        }
    }

    #[test]
    fn test_routes() {
        let routes = Routes::new("tele");
        assert_eq!(routes.route("homie/dev/node/p"), Route::Homie);
        assert_eq!(routes.route("homeassistant/sensor/x/config"), Route::HaDiscovery);
        assert_eq!(routes.route("tele/plug/SENSOR"), Route::HaState);
        assert_eq!(routes.route("telemetry/plug"), Route::Unmatched);
        assert_eq!(routes.route("homeassistant/light/x/config"), Route::Unmatched);
    }

    #[test]
    fn test_empty_state_prefix_catches_everything_else() {
        let routes = Routes::new("");
        assert_eq!(routes.route("esphome/sensor/temp/state"), Route::HaState);
        assert_eq!(routes.route("homie/dev/node/p"), Route::Homie);
    }

    #[tokio::test]
    async fn test_dispatch_end_to_end() {
        let h = harness("tele");
        let config = serde_json::json!({
            "name": "Energy",
            "stat_t": "tele/plug/energy",
            "uniq_id": "plug_energy",
            "unit_of_meas": "kWh",
            "dev": { "ids": "plug", "name": "Plug" }
        })
        .to_string();

        assert_eq!(
            h.dispatcher
                .dispatch(msg("homeassistant/sensor/plug/energy/config", config.as_bytes()))
                .await,
            Dispatched::HaDiscovery(DiscoveryOutcome::Subscribed)
        );
        assert_eq!(
            h.dispatcher.dispatch(msg("tele/plug/energy", b"1.5")).await,
            Dispatched::HaState(StateOutcome::Exported(1))
        );
        assert_eq!(
            h.dispatcher.dispatch(msg("homie/dev1/node/temp", b"20")).await,
            Dispatched::Homie(HomieOutcome::Exported)
        );
        assert_eq!(
            h.dispatcher.dispatch(msg("other/topic", b"3")).await,
            Dispatched::Unmatched
        );

        let updates = h.sink.updates();
        assert_eq!(updates.len(), 2);
        assert_eq!(updates[0].0.source_type, SourceType::HomeAssistant);
        assert_eq!(updates[0].1, 1.5);
        assert_eq!(updates[1].0.source_type, SourceType::Homie);
        assert!(h.registry.snapshot().contains(&DeviceKey::homie("dev1/node")));
    }

    #[tokio::test]
    async fn test_state_topic_below_discovery_prefix() {
        let h = harness("");
        let config = serde_json::json!({
            "name": "Temperature",
            "stat_t": "homeassistant/sensor/t1/state",
            "uniq_id": "t1",
            "unit_of_meas": "°C",
            "dev": { "ids": "esp-t1", "name": "ESP" }
        })
        .to_string();

        h.dispatcher
            .dispatch(msg("homeassistant/sensor/t1/config", config.as_bytes()))
            .await;
        assert_eq!(
            h.dispatcher
                .dispatch(msg("homeassistant/sensor/t1/state", b"21.5"))
                .await,
            Dispatched::HaState(StateOutcome::Exported(1))
        );

        let (key, value) = h.sink.last().unwrap();
        assert_eq!(key.device, "ESP");
        assert_eq!(key.source_type, SourceType::HomeAssistant);
        assert_eq!(value, 21.5);

        // Unbound topics under the prefix still go to discovery
        assert_eq!(
            h.dispatcher
                .dispatch(msg("homeassistant/sensor/t2/state", b"1"))
                .await,
            Dispatched::HaDiscovery(DiscoveryOutcome::NotConfig)
        );
    }

    #[tokio::test]
    async fn test_run_processes_all_messages() {
        let h = harness("");
        let (tx, rx) = mpsc::channel(16);
        let run = tokio::spawn(h.dispatcher.clone().run(rx));

        for i in 0..10 {
            tx.send(msg(&format!("homie/dev{}/node/$name", i), b"n"))
                .await
                .unwrap();
        }
        drop(tx);
        run.await.unwrap();

        // Spawned handlers may still be running after the loop ends
        for _ in 0..100 {
            if h.registry.snapshot().len() == 10 {
                break;
            }
            tokio::time::sleep(std::time::Duration::from_millis(5)).await;
        }
        assert_eq!(h.registry.snapshot().len(), 10);
    }
}
