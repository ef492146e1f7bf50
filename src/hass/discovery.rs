//! Home Assistant discovery (`.../config`) message handling.

use super::data::{HaDataHandler, PropertyBinding};
use crate::error::{ExporterError, Result};
use crate::input::mqtt::Subscriber;
use crate::registry::{Device, DeviceKey, DeviceTable, Property, Registry};
use log::{debug, error, info, warn};
use parking_lot::Mutex;
use serde::{Deserialize, Deserializer, Serialize};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;

/// How long to wait for the broker to acknowledge a state topic subscription.
pub const SUBSCRIBE_TIMEOUT: Duration = Duration::from_secs(2);

/// `null` decodes like a missing key; Home Assistant allows `"name": null`.
fn null_as_default<'de, D, T>(deserializer: D) -> std::result::Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

/// `ids` is a single string for most firmwares and a list for some.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum DeviceIds {
    One(String),
    Many(Vec<String>),
}

impl Default for DeviceIds {
    fn default() -> Self {
        DeviceIds::One(String::new())
    }
}

impl DeviceIds {
    /// The identifier used as registry key (first one for lists).
    pub fn primary(&self) -> &str {
        match self {
            DeviceIds::One(id) => id,
            DeviceIds::Many(ids) => ids.first().map(String::as_str).unwrap_or(""),
        }
    }
}

/// Device block (`dev`) of a discovery payload.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DeviceDescriptor {
    #[serde(rename = "ids", alias = "identifiers", default, deserialize_with = "null_as_default")]
    pub ids: DeviceIds,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(
        rename = "sw", alias = "sw_version",
        default,
        deserialize_with = "null_as_default"
    )]
    pub version: String,
    #[serde(
        rename = "mdl", alias = "model",
        default,
        deserialize_with = "null_as_default"
    )]
    pub model: String,
    #[serde(
        rename = "mf", alias = "manufacturer",
        default,
        deserialize_with = "null_as_default"
    )]
    pub vendor: String,
}

/// Sensor entity discovery payload.
///
/// Only the abbreviated keys are documented by most firmwares, the long
/// forms are accepted as aliases.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct EntityConfig {
    #[serde(
        rename = "avty_t", alias = "availability_topic",
        default,
        deserialize_with = "null_as_default"
    )]
    pub availability_topic: String,
    #[serde(
        rename = "dev_cla", alias = "device_class",
        default,
        deserialize_with = "null_as_default"
    )]
    pub device_class: String,
    #[serde(
        rename = "ent_cat", alias = "entity_category",
        default,
        deserialize_with = "null_as_default"
    )]
    pub entity_category: String,
    #[serde(default, deserialize_with = "null_as_default")]
    pub name: String,
    #[serde(
        rename = "stat_cla", alias = "state_class",
        default,
        deserialize_with = "null_as_default"
    )]
    pub state_class: String,
    #[serde(
        rename = "stat_t", alias = "state_topic",
        default,
        deserialize_with = "null_as_default"
    )]
    pub status_topic: String,
    #[serde(
        rename = "uniq_id", alias = "unique_id",
        default,
        deserialize_with = "null_as_default"
    )]
    pub unique_id: String,
    #[serde(
        rename = "unit_of_meas", alias = "unit_of_measurement",
        default,
        deserialize_with = "null_as_default"
    )]
    pub unit: String,
    #[serde(rename = "dev", alias = "device", default)]
    pub device: Option<DeviceDescriptor>,
}

impl EntityConfig {
    pub fn device_id(&self) -> &str {
        self.device.as_ref().map(|d| d.ids.primary()).unwrap_or("")
    }

    pub fn device_name(&self) -> &str {
        self.device.as_ref().map(|d| d.name.as_str()).unwrap_or("")
    }
}

/// Device path of a Home Assistant entity: the first two segments of its
/// state topic.
pub fn status_topic_path(status_topic: &str) -> String {
    status_topic
        .splitn(3, '/')
        .take(2)
        .collect::<Vec<_>>()
        .join("/")
}

/// Result of handling one discovery message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DiscoveryOutcome {
    /// Topic under `homeassistant/sensor/` that isn't a `/config` topic.
    NotConfig,
    /// Undecodable JSON or a required key is missing.
    Invalid,
    /// Known entity, attributes refreshed.
    Refreshed,
    /// Another message for the same entity is subscribing right now.
    InProgress,
    /// New entity, state topic subscribed and bound.
    Subscribed,
    /// Subscribing failed; the error went to the fatal channel.
    SubscribeFailed,
}

/// Handles discovery payloads, creating registry entries and subscribing to
/// the state topic of each new entity.
pub struct HaDiscoveryParser {
    registry: Arc<Registry>,
    data: Arc<HaDataHandler>,
    subscriber: Arc<dyn Subscriber>,
    fatal_tx: mpsc::Sender<ExporterError>,
    subscribe_timeout: Duration,
    in_flight: Mutex<HashSet<String>>,
}

impl HaDiscoveryParser {
    /// `fatal_tx` receives the error when a state topic subscription fails;
    /// the process is expected to shut down.
    pub fn new(
        registry: Arc<Registry>,
        data: Arc<HaDataHandler>,
        subscriber: Arc<dyn Subscriber>,
        fatal_tx: mpsc::Sender<ExporterError>,
    ) -> Self {
        Self {
            registry,
            data,
            subscriber,
            fatal_tx,
            subscribe_timeout: SUBSCRIBE_TIMEOUT,
            in_flight: Mutex::new(HashSet::new()),
        }
    }

    pub fn with_subscribe_timeout(mut self, timeout: Duration) -> Self {
        self.subscribe_timeout = timeout;
        self
    }

    /// Handle one message from `homeassistant/sensor/#`.
    pub async fn handle(&self, topic: &str, payload: &[u8]) -> DiscoveryOutcome {
        // homeassistant/sensor/<anything>/config, the middle part isn't parsed
        if !topic.ends_with("/config") {
            debug!("[HA] Not a config topic: {}", topic);
            return DiscoveryOutcome::NotConfig;
        }

        info!("[HA] New entity config message on {}", topic);
        let config: EntityConfig = match serde_json::from_slice(payload) {
            Ok(config) => config,
            Err(e) => {
                warn!(
                    "[HA] Failed to parse entity configuration on {}: {} (payload: {})",
                    topic,
                    e,
                    String::from_utf8_lossy(payload)
                );
                return DiscoveryOutcome::Invalid;
            }
        };

        if config.unique_id.is_empty() {
            warn!("[HA] Entity configuration on {} is missing 'uniq_id'", topic);
            return DiscoveryOutcome::Invalid;
        }
        if config.device_id().is_empty() {
            warn!("[HA] Device configuration on {} is missing 'ids'", topic);
            return DiscoveryOutcome::Invalid;
        }
        if config.status_topic.is_empty() {
            warn!("[HA] Entity configuration on {} is missing 'stat_t'", topic);
            return DiscoveryOutcome::Invalid;
        }

        let key = DeviceKey::home_assistant(config.device_id());

        // Refresh what is already known and claim the subscription for a new
        // entity. The in-flight set is locked before the registry so a second
        // copy of the same announcement can't slip between the registry check
        // and the claim.
        {
            let mut in_flight = self.in_flight.lock();
            let known = self
                .registry
                .transaction(|table| upsert_known(table, &key, &config));
            if known {
                return DiscoveryOutcome::Refreshed;
            }
            if !in_flight.insert(config.unique_id.clone()) {
                debug!(
                    "[HA] Subscription for {} already in progress",
                    config.unique_id
                );
                return DiscoveryOutcome::InProgress;
            }
        }

        // Network round-trip, outside the registry lock
        if let Err(e) = self.subscribe(&config.status_topic).await {
            error!(
                "[HA] Failed to subscribe to state topic {} of {}: {}",
                config.status_topic, config.unique_id, e
            );
            self.in_flight.lock().remove(&config.unique_id);
            if self.fatal_tx.send(e).await.is_err() {
                error!("[HA] Fatal error channel closed");
            }
            return DiscoveryOutcome::SubscribeFailed;
        }

        self.registry.transaction(|table| {
            let (device, _) = upsert_device(table, &key, &config);
            let mut property = Property::with_status_topic(config.status_topic.as_str());
            property.name = config.name.clone();
            property.unit = config.unit.clone();
            device.insert_property(&config.unique_id, property);
            info!(
                "[HA] Created property {} ({}) on {}",
                config.unique_id, config.name, key
            );
        });
        self.data.bind(
            &config.status_topic,
            PropertyBinding {
                device: key,
                property: config.unique_id.clone(),
            },
        );
        self.in_flight.lock().remove(&config.unique_id);
        DiscoveryOutcome::Subscribed
    }

    async fn subscribe(&self, topic: &str) -> Result<()> {
        match tokio::time::timeout(self.subscribe_timeout, self.subscriber.subscribe(topic)).await {
            Ok(result) => result,
            Err(_) => Err(ExporterError::SubscribeTimeout {
                topic: topic.to_string(),
            }),
        }
    }
}

/// Refresh a registered device and, if the entity is known, its attributes.
/// Returns whether the entity was known. Devices are only created once a
/// state topic subscription succeeded.
fn upsert_known(table: &mut DeviceTable, key: &DeviceKey, config: &EntityConfig) -> bool {
    if !table.contains(key) {
        return false;
    }
    let (device, _) = upsert_device(table, key, config);
    let Some(property) = device.property_mut(&config.unique_id) else {
        return false;
    };

    if property.name != config.name {
        info!(
            "[HA] Updating property name of {}: {:?} -> {:?}",
            config.unique_id, property.name, config.name
        );
        property.name = config.name.clone();
    }
    if property.unit != config.unit {
        info!(
            "[HA] Updating property unit of {}: {:?} -> {:?}",
            config.unique_id, property.unit, config.unit
        );
        property.unit = config.unit.clone();
    }
    if property.status_topic() != Some(config.status_topic.as_str()) {
        warn!(
            "[HA] State topic of {} changed from {:?} to {}, topic changes are not supported",
            config.unique_id,
            property.status_topic(),
            config.status_topic
        );
    }
    true
}

fn upsert_device<'t>(
    table: &'t mut DeviceTable,
    key: &DeviceKey,
    config: &EntityConfig,
) -> (&'t mut Device, bool) {
    let path = status_topic_path(&config.status_topic);
    let (device, created) = table.device_or_insert_with(key, || Device::new(path.as_str()));
    if created {
        info!("[HA] Created new device {}", key);
        device.name = config.device_name().to_string();
        return (device, created);
    }

    if device.path() != path {
        info!(
            "[HA] Updating device path of {}: {} -> {}",
            key,
            device.path(),
            path
        );
        device.set_path(path);
    }
    if device.name != config.device_name() {
        info!(
            "[HA] Updating device name of {}: {:?} -> {:?}",
            key,
            device.name,
            config.device_name()
        );
        device.name = config.device_name().to_string();
    }
    (device, created)
}
