//! State topic handling for discovered Home Assistant entities.

use crate::metrics::{MetricKey, MetricSink};
use crate::registry::{DeviceKey, Registry, SourceType};
use log::{debug, warn};
use parking_lot::RwLock;
use std::collections::HashMap;
use std::sync::Arc;

/// Stable identity of a discovered entity: the device id and `uniq_id`.
///
/// Looked up in the registry on every delivery, so a handler always sees the
/// committed state of the property instead of a copy taken at subscribe time.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct PropertyBinding {
    pub device: DeviceKey,
    pub property: String,
}

/// Result of handling one state topic message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StateOutcome {
    /// No entity is bound to the topic.
    Unbound,
    /// The value was exported for this many bound properties.
    Exported(usize),
    /// Every bound property is ignored, or was just ignored because the
    /// payload isn't a number.
    Ignored,
    /// Bound properties are missing from the registry.
    Dropped,
}

/// Exports values published on Home Assistant state topics.
pub struct HaDataHandler {
    registry: Arc<Registry>,
    sink: Arc<dyn MetricSink>,
    bindings: RwLock<HashMap<String, Vec<PropertyBinding>>>,
}

impl HaDataHandler {
    pub fn new(registry: Arc<Registry>, sink: Arc<dyn MetricSink>) -> Self {
        Self {
            registry,
            sink,
            bindings: RwLock::new(HashMap::new()),
        }
    }

    /// Route messages on `topic` to `binding`.
    pub fn bind(&self, topic: &str, binding: PropertyBinding) {
        let mut bindings = self.bindings.write();
        let entry = bindings.entry(topic.to_string()).or_default();
        if !entry.contains(&binding) {
            entry.push(binding);
        }
    }

    pub fn is_bound(&self, topic: &str) -> bool {
        self.bindings.read().contains_key(topic)
    }

    /// Handle one message received on a state topic.
    pub fn handle(&self, topic: &str, payload: &[u8]) -> StateOutcome {
        let Some(bindings) = self.bindings.read().get(topic).cloned() else {
            debug!("[HA] No entity bound to state topic {}, dropping", topic);
            return StateOutcome::Unbound;
        };

        let payload = String::from_utf8_lossy(payload);
        let value = payload.parse::<f64>();
        let mut exported = 0;
        let mut ignored = 0;

        for binding in &bindings {
            self.registry.transaction(|table| {
                let Some(device) = table.device_mut(&binding.device) else {
                    debug!("[HA] Unknown device {}, dropping", binding.device);
                    return;
                };
                let Some(property) = device.property_mut(&binding.property) else {
                    debug!(
                        "[HA] Unknown property {} on {}, dropping",
                        binding.property, binding.device
                    );
                    return;
                };
                if property.is_ignored() {
                    ignored += 1;
                    return;
                }

                match &value {
                    Ok(v) => {
                        let property = property.clone();
                        let key = MetricKey::new(
                            device,
                            &binding.property,
                            &property,
                            SourceType::HomeAssistant,
                        );
                        self.sink.set(&key, *v);
                        exported += 1;
                    }
                    Err(e) => {
                        warn!(
                            "[HA] {} {}: couldn't convert payload {:?} to float, ignoring property: {}",
                            binding.device, binding.property, payload, e
                        );
                        property.ignore();
                        ignored += 1;
                    }
                }
            });
        }

        if exported > 0 {
            StateOutcome::Exported(exported)
        } else if ignored > 0 {
            StateOutcome::Ignored
        } else {
            StateOutcome::Dropped
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::metrics::testing::RecordingSink;
    use crate::registry::{Device, Property};

    fn setup() -> (HaDataHandler, Arc<Registry>, Arc<RecordingSink>, PropertyBinding) {
        let registry = Arc::new(Registry::new());
        let sink = Arc::new(RecordingSink::default());
        let binding = PropertyBinding {
            device: DeviceKey::home_assistant("plug-1"),
            property: "plug-1-power".to_string(),
        };

        registry.transaction(|table| {
            let (device, _) = table.device_or_insert_with(&binding.device, || Device::new("tele/plug"));
            device.name = "Plug".to_string();
            let (property, _) = device.insert_property(
                &binding.property,
                Property::with_status_topic("tele/plug/power"),
            );
            property.name = "Power".to_string();
            property.unit = "W".to_string();
        });

        let handler = HaDataHandler::new(registry.clone(), sink.clone());
        handler.bind("tele/plug/power", binding.clone());
        (handler, registry, sink, binding)
    }

    #[test]
    fn test_value_exported_with_labels() {
        let (handler, _, sink, _) = setup();
        assert_eq!(handler.handle("tele/plug/power", b"12.5"), StateOutcome::Exported(1));

        let (key, value) = sink.last().unwrap();
        assert_eq!(key.device, "Plug");
        assert_eq!(key.path, "tele/plug");
        assert_eq!(key.property, "Power");
        assert_eq!(key.unit, "W");
        assert_eq!(key.source_type, SourceType::HomeAssistant);
        assert_eq!(value, 12.5);
    }

    #[test]
    fn test_parse_failure_latches_ignored() {
        let (handler, registry, sink, binding) = setup();
        assert_eq!(handler.handle("tele/plug/power", b"ON"), StateOutcome::Ignored);
        assert_eq!(handler.handle("tele/plug/power", b"10"), StateOutcome::Ignored);

        assert_eq!(sink.count(), 0);
        let ignored = registry.read(|t| {
            t.property(&binding.device, &binding.property)
                .unwrap()
                .is_ignored()
        });
        assert!(ignored);
    }

    #[test]
    fn test_sees_committed_property_changes() {
        let (handler, registry, sink, binding) = setup();
        registry.transaction(|table| {
            let device = table.device_mut(&binding.device).unwrap();
            device.property_mut(&binding.property).unwrap().unit = "kW".to_string();
        });

        handler.handle("tele/plug/power", b"0.5");
        assert_eq!(sink.last().unwrap().0.unit, "kW");
    }

    #[test]
    fn test_unbound_topic_dropped() {
        let (handler, _, sink, _) = setup();
        assert_eq!(handler.handle("tele/other/power", b"1"), StateOutcome::Unbound);
        assert_eq!(sink.count(), 0);
        assert!(!handler.is_bound("tele/other/power"));
    }

    #[test]
    fn test_bound_but_unregistered_property_dropped() {
        let registry = Arc::new(Registry::new());
        let sink = Arc::new(RecordingSink::default());
        let handler = HaDataHandler::new(registry.clone(), sink.clone());
        handler.bind(
            "a/b",
            PropertyBinding {
                device: DeviceKey::home_assistant("missing"),
                property: "p".to_string(),
            },
        );

        assert_eq!(handler.handle("a/b", b"1"), StateOutcome::Dropped);
        assert_eq!(sink.count(), 0);
        assert!(registry.snapshot().is_empty());
    }

    #[test]
    fn test_shared_state_topic_feeds_every_binding() {
        let (handler, registry, sink, binding) = setup();
        let energy = PropertyBinding {
            device: binding.device.clone(),
            property: "plug-1-energy".to_string(),
        };
        registry.transaction(|table| {
            let device = table.device_mut(&energy.device).unwrap();
            device.insert_property(&energy.property, Property::with_status_topic("tele/plug/power"));
        });
        handler.bind("tele/plug/power", energy.clone());
        // Binding twice is a no-op
        handler.bind("tele/plug/power", energy.clone());

        assert_eq!(handler.handle("tele/plug/power", b"3"), StateOutcome::Exported(2));
        assert_eq!(sink.count(), 2);

        assert_eq!(handler.handle("tele/plug/power", b"unavailable"), StateOutcome::Ignored);
        let ignored = registry.read(|t| {
            [&binding, &energy]
                .iter()
                .all(|b| t.property(&b.device, &b.property).unwrap().is_ignored())
        });
        assert!(ignored);
        assert_eq!(handler.handle("tele/plug/power", b"4"), StateOutcome::Ignored);
        assert_eq!(sink.count(), 2);
    }
}
