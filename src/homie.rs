//! Homie convention parser.
//!
//! Topics look like `homie/<device>/<node>/<property>[/<attribute>]`. The
//! `<device>/<node>` pair is the registry path of a device; root device
//! attributes (`homie/<device>/<attribute>`) are not tracked.

use crate::metrics::{MetricKey, MetricSink};
use crate::registry::{Device, DeviceKey, DeviceTable, Registry, SourceType};
use log::{debug, error, warn};
use std::sync::Arc;
use thiserror::Error;

/// First topic segment of every Homie topic.
pub const HOMIE_ROOT: &str = "homie";

/// Why a topic could not be classified.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum HomieTopicError {
    #[error("expected at least 3 topic segments, got {0}")]
    TooShort(usize),

    #[error("topic doesn't start with 'homie'")]
    NotHomie,

    #[error("unexpected property attributes {0:?}")]
    UnexpectedAttributes(Vec<String>),
}

/// Device level attribute (4th segment starting with `$`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeviceAttribute<'a> {
    Name,
    Properties,
    Other(&'a str),
}

/// What a property topic refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PropertyAttribute<'a> {
    Value,
    Name,
    Datatype,
    Unit,
    Other(&'a str),
}

/// A classified Homie topic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum HomieTopic<'a> {
    /// `homie/<device>/<attribute>`, ignored.
    RootAttribute,
    Device {
        path: String,
        attribute: DeviceAttribute<'a>,
    },
    Property {
        path: String,
        property: &'a str,
        attribute: PropertyAttribute<'a>,
    },
}

impl<'a> HomieTopic<'a> {
    /// Classify a topic without touching any state.
    pub fn parse(topic: &'a str) -> Result<Self, HomieTopicError> {
        let parts: Vec<&str> = topic.split('/').collect();
        if parts.len() < 3 {
            return Err(HomieTopicError::TooShort(parts.len()));
        }
        if parts[0] != HOMIE_ROOT {
            return Err(HomieTopicError::NotHomie);
        }
        if parts.len() == 3 {
            return Ok(HomieTopic::RootAttribute);
        }

        let path = parts[1..3].join("/");
        let attr = parts[3];
        match attr {
            "$name" => Ok(HomieTopic::Device {
                path,
                attribute: DeviceAttribute::Name,
            }),
            "$properties" => Ok(HomieTopic::Device {
                path,
                attribute: DeviceAttribute::Properties,
            }),
            a if a.starts_with('$') => Ok(HomieTopic::Device {
                path,
                attribute: DeviceAttribute::Other(a),
            }),
            "" => Err(unexpected(&parts[3..])),
            property => {
                let rest = &parts[4..];
                let attribute = match rest.first() {
                    None => PropertyAttribute::Value,
                    Some(&"$name") => PropertyAttribute::Name,
                    Some(&"$datatype") => PropertyAttribute::Datatype,
                    Some(&"$unit") => PropertyAttribute::Unit,
                    Some(&a) if a.starts_with('$') => PropertyAttribute::Other(a),
                    Some(_) => return Err(unexpected(rest)),
                };
                Ok(HomieTopic::Property {
                    path,
                    property,
                    attribute,
                })
            }
        }
    }
}

fn unexpected(parts: &[&str]) -> HomieTopicError {
    HomieTopicError::UnexpectedAttributes(parts.iter().map(|s| s.to_string()).collect())
}

/// How a declared `$datatype` is handled.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DatatypeSupport {
    /// `float`: exported as is.
    Native,
    /// `int` or `bool`: still parsed as a float.
    Converted,
    /// Anything else: the property is ignored for good.
    Unsupported,
}

impl DatatypeSupport {
    pub fn classify(datatype: &str) -> Self {
        if datatype.starts_with("int") || datatype.starts_with("bool") {
            DatatypeSupport::Converted
        } else if datatype.starts_with("float") {
            DatatypeSupport::Native
        } else {
            DatatypeSupport::Unsupported
        }
    }
}

/// Result of handling one Homie message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HomieOutcome {
    /// A property value was exported.
    Exported,
    /// Device or property metadata was stored.
    Updated,
    /// The property is ignored, or was just ignored for its datatype.
    Ignored,
    /// Attribute the exporter doesn't track.
    Skipped,
    /// Malformed topic or a value that isn't a number.
    Dropped,
}

/// Applies Homie messages to the registry and exports property values.
pub struct HomieParser {
    registry: Arc<Registry>,
    sink: Arc<dyn MetricSink>,
}

impl HomieParser {
    pub fn new(registry: Arc<Registry>, sink: Arc<dyn MetricSink>) -> Self {
        Self { registry, sink }
    }

    /// Handle one message from `homie/#`.
    pub fn handle(&self, topic: &str, payload: &[u8]) -> HomieOutcome {
        let payload = String::from_utf8_lossy(payload);
        debug!("[Homie] New message on {}: {}", topic, payload);

        let parsed = match HomieTopic::parse(topic) {
            Ok(parsed) => parsed,
            Err(e) => {
                error!("[Homie] Error parsing topic {}: {}", topic, e);
                return HomieOutcome::Dropped;
            }
        };

        match parsed {
            HomieTopic::RootAttribute => {
                debug!("[Homie] Root device attribute ignored: {}", topic);
                HomieOutcome::Skipped
            }
            HomieTopic::Device { path, attribute } => {
                self.handle_device_attribute(path, attribute, &payload)
            }
            HomieTopic::Property {
                path,
                property,
                attribute,
            } => self.handle_property(path, property, attribute, &payload),
        }
    }

    fn handle_device_attribute(
        &self,
        path: String,
        attribute: DeviceAttribute<'_>,
        payload: &str,
    ) -> HomieOutcome {
        let key = DeviceKey::homie(path.as_str());
        match attribute {
            DeviceAttribute::Name => self.registry.transaction(|table| {
                let device = device_entry(table, &key, &path);
                device.name = payload.to_string();
            }),
            DeviceAttribute::Properties => {
                let count = payload.split(',').count();
                self.registry.transaction(|table| {
                    let device = device_entry(table, &key, &path);
                    device.reserve_properties(count);
                });
            }
            DeviceAttribute::Other(attr) => {
                debug!("[Homie] {} attribute {} is ignored", path, attr);
                return HomieOutcome::Skipped;
            }
        }
        HomieOutcome::Updated
    }

    fn handle_property(
        &self,
        path: String,
        id: &str,
        attribute: PropertyAttribute<'_>,
        payload: &str,
    ) -> HomieOutcome {
        let key = DeviceKey::homie(path.as_str());
        match attribute {
            PropertyAttribute::Value => {
                let value = match payload.parse::<f64>() {
                    Ok(v) => v,
                    Err(e) => {
                        warn!(
                            "[Homie] {} {}: couldn't convert payload {:?} to float: {}",
                            path, id, payload, e
                        );
                        return HomieOutcome::Dropped;
                    }
                };
                self.registry.transaction(|table| {
                    let device = device_entry(table, &key, &path);
                    let property = device.property_or_default(id).clone();
                    if property.is_ignored() {
                        return HomieOutcome::Ignored;
                    }
                    let metric = MetricKey::new(device, id, &property, SourceType::Homie);
                    self.sink.set(&metric, value);
                    HomieOutcome::Exported
                })
            }
            PropertyAttribute::Name => {
                self.registry.transaction(|table| {
                    device_entry(table, &key, &path).property_or_default(id).name =
                        payload.to_string();
                });
                HomieOutcome::Updated
            }
            PropertyAttribute::Unit => {
                self.registry.transaction(|table| {
                    device_entry(table, &key, &path).property_or_default(id).unit =
                        payload.to_string();
                });
                HomieOutcome::Updated
            }
            PropertyAttribute::Datatype => match DatatypeSupport::classify(payload) {
                DatatypeSupport::Native => HomieOutcome::Skipped,
                DatatypeSupport::Converted => {
                    debug!(
                        "[Homie] {} {}: datatype {} converted to float",
                        path, id, payload
                    );
                    HomieOutcome::Skipped
                }
                DatatypeSupport::Unsupported => {
                    warn!(
                        "[Homie] {} {}: unsupported datatype {}, ignoring property",
                        path, id, payload
                    );
                    self.registry.transaction(|table| {
                        device_entry(table, &key, &path)
                            .property_or_default(id)
                            .ignore();
                    });
                    HomieOutcome::Ignored
                }
            },
            PropertyAttribute::Other(attr) => {
                debug!("[Homie] {} {}: attribute {} is ignored", path, id, attr);
                HomieOutcome::Skipped
            }
        }
    }
}

fn device_entry<'t>(
    table: &'t mut DeviceTable,
    key: &DeviceKey,
    path: &str,
) -> &'t mut Device {
    let (device, created) = table.device_or_insert_with(key, || Device::new(path));
    if created {
        debug!("[Homie] Created new device {}", path);
    }
    device
}
