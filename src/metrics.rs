//! Prometheus gauges fed by the parsers.

use crate::error::Result;
use crate::registry::{Device, Property, SourceType};
use prometheus::{Encoder, GaugeVec, IntGauge, Opts, TextEncoder};

/// Label names of the `mqtt_sensor` gauge, in order.
pub const SENSOR_LABELS: [&str; 5] = ["device", "path", "property", "unit", "source_type"];

/// Label set identifying one exported sensor value.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MetricKey {
    pub device: String,
    pub path: String,
    pub property: String,
    pub unit: String,
    pub source_type: SourceType,
}

impl MetricKey {
    /// Build the label set for `property` (with id `property_id`) of `device`.
    pub fn new(
        device: &Device,
        property_id: &str,
        property: &Property,
        source_type: SourceType,
    ) -> Self {
        Self {
            device: device.label().to_string(),
            path: device.path().to_string(),
            property: property.label(property_id).to_string(),
            unit: property.unit.clone(),
            source_type,
        }
    }
}

/// Destination for sensor values.
///
/// Implementations keep only the latest value per key; there is no delete.
pub trait MetricSink: Send + Sync {
    fn set(&self, key: &MetricKey, value: f64);
}

/// Sink backed by a private Prometheus registry.
pub struct PrometheusSink {
    registry: prometheus::Registry,
    sensors: GaugeVec,
}

impl PrometheusSink {
    pub fn new() -> Result<Self> {
        let registry = prometheus::Registry::new();
        let sensors = GaugeVec::new(
            Opts::new("mqtt_sensor", "HA|Homie metric."),
            &SENSOR_LABELS,
        )?;
        registry.register(Box::new(sensors.clone()))?;
        Ok(Self { registry, sensors })
    }

    /// Register the `mqtt_client_status` gauge for `broker`.
    pub fn client_status_gauge(&self, broker: &str) -> Result<IntGauge> {
        let gauge = IntGauge::with_opts(
            Opts::new("mqtt_client_status", "MQTT broker connection status.")
                .const_label("broker", broker),
        )?;
        self.registry.register(Box::new(gauge.clone()))?;
        Ok(gauge)
    }

    /// Render every registered metric in the Prometheus text format.
    pub fn render(&self) -> Result<String> {
        let mut buffer = Vec::new();
        TextEncoder::new().encode(&self.registry.gather(), &mut buffer)?;
        String::from_utf8(buffer).map_err(|e| prometheus::Error::Msg(e.to_string()).into())
    }
}

impl MetricSink for PrometheusSink {
    fn set(&self, key: &MetricKey, value: f64) {
        self.sensors
            .with_label_values(&[
                key.device.as_str(),
                key.path.as_str(),
                key.property.as_str(),
                key.unit.as_str(),
                key.source_type.as_label(),
            ])
            .set(value);
    }
}
