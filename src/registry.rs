//! Device and property registry shared by the Homie and Home Assistant parsers.
//!
//! The registry is the single owner of every [`Device`] and, through them, every
//! [`Property`]. State is only reachable through [`Registry::transaction`] (for
//! mutation) or [`Registry::read`] (for inspection); both hold the registry lock
//! for the whole closure, so a read-modify-write cycle triggered by one MQTT
//! message can never interleave with another.

use parking_lot::Mutex;
use std::collections::HashMap;
use std::fmt;

/// Which MQTT convention a device was discovered through.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SourceType {
    Homie,
    HomeAssistant,
}

impl SourceType {
    /// Value of the `source_type` metric label.
    pub fn as_label(&self) -> &'static str {
        match self {
            SourceType::Homie => "homie",
            SourceType::HomeAssistant => "ha",
        }
    }
}

impl fmt::Display for SourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Stable identity of a device inside the registry.
///
/// Homie devices are keyed by their `<device>/<node>` path, Home Assistant
/// devices by the `ids` field of their discovery descriptor. The source is part
/// of the key so the two namespaces never collide.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DeviceKey {
    pub source: SourceType,
    pub id: String,
}

impl DeviceKey {
    pub fn homie(path: impl Into<String>) -> Self {
        Self {
            source: SourceType::Homie,
            id: path.into(),
        }
    }

    pub fn home_assistant(device_id: impl Into<String>) -> Self {
        Self {
            source: SourceType::HomeAssistant,
            id: device_id.into(),
        }
    }
}

impl fmt::Display for DeviceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.source, self.id)
    }
}

/// One-way "ignored" marker.
///
/// There is no way to clear the flag once [`IgnoredFlag::latch`] has been
/// called; a property that produced an unsupported datatype or an unparseable
/// value stays silent for the lifetime of the process.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IgnoredFlag(bool);

impl IgnoredFlag {
    pub fn is_set(&self) -> bool {
        self.0
    }

    /// Set the flag. Returns `true` if this call changed it.
    pub fn latch(&mut self) -> bool {
        let changed = !self.0;
        self.0 = true;
        changed
    }
}

/// Measurement node metadata.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Property {
    pub name: String,
    pub unit: String,
    ignored: IgnoredFlag,
    status_topic: Option<String>,
}

impl Property {
    /// Create a Home Assistant property bound to its state topic.
    ///
    /// The topic cannot be changed afterwards.
    pub fn with_status_topic(status_topic: impl Into<String>) -> Self {
        Self {
            status_topic: Some(status_topic.into()),
            ..Self::default()
        }
    }

    pub fn is_ignored(&self) -> bool {
        self.ignored.is_set()
    }

    /// Permanently ignore this property. Returns `true` on the first call.
    pub fn ignore(&mut self) -> bool {
        self.ignored.latch()
    }

    pub fn status_topic(&self) -> Option<&str> {
        self.status_topic.as_deref()
    }

    /// Label used for the `property` metric label: the display name, or the
    /// property id while no name is known.
    pub fn label<'a>(&'a self, id: &'a str) -> &'a str {
        if self.name.is_empty() { id } else { &self.name }
    }
}

/// Device metadata and its properties.
///
/// For Homie this is really a device node, root device attributes are not
/// tracked.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Device {
    pub name: String,
    path: String,
    properties: HashMap<String, Property>,
}

impl Device {
    pub fn new(path: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            ..Self::default()
        }
    }

    pub fn path(&self) -> &str {
        &self.path
    }

    /// Explicit device-attribute update of the path.
    pub fn set_path(&mut self, path: impl Into<String>) {
        self.path = path.into();
    }

    /// Label used for the `device` metric label: the display name, or the
    /// path while no name is known.
    pub fn label(&self) -> &str {
        if self.name.is_empty() { &self.path } else { &self.name }
    }

    pub fn property(&self, id: &str) -> Option<&Property> {
        self.properties.get(id)
    }

    pub fn property_mut(&mut self, id: &str) -> Option<&mut Property> {
        self.properties.get_mut(id)
    }

    /// Get or create a property by id.
    pub fn property_or_default(&mut self, id: &str) -> &mut Property {
        self.properties.entry(id.to_string()).or_default()
    }

    /// Insert a property if the id is free. Returns the stored property and
    /// whether it was newly inserted.
    pub fn insert_property(&mut self, id: &str, property: Property) -> (&mut Property, bool) {
        let mut inserted = false;
        let stored = self.properties.entry(id.to_string()).or_insert_with(|| {
            inserted = true;
            property
        });
        (stored, inserted)
    }

    pub fn properties(&self) -> impl Iterator<Item = (&str, &Property)> {
        self.properties.iter().map(|(id, p)| (id.as_str(), p))
    }

    pub fn property_count(&self) -> usize {
        self.properties.len()
    }

    /// Make room for `additional` properties without touching existing ones.
    pub fn reserve_properties(&mut self, additional: usize) {
        self.properties.reserve(additional);
    }
}

/// The lock-protected contents of the [`Registry`].
#[derive(Debug, Clone, Default, PartialEq)]
pub struct DeviceTable {
    devices: HashMap<DeviceKey, Device>,
}

impl DeviceTable {
    pub fn device(&self, key: &DeviceKey) -> Option<&Device> {
        self.devices.get(key)
    }

    pub fn device_mut(&mut self, key: &DeviceKey) -> Option<&mut Device> {
        self.devices.get_mut(key)
    }

    /// Get or create a device. `init` builds the device on first reference.
    /// The returned flag is `true` if the device was created.
    pub fn device_or_insert_with(
        &mut self,
        key: &DeviceKey,
        init: impl FnOnce() -> Device,
    ) -> (&mut Device, bool) {
        let mut created = false;
        let device = self.devices.entry(key.clone()).or_insert_with(|| {
            created = true;
            init()
        });
        (device, created)
    }

    /// Look up a property by device key and property id.
    pub fn property(&self, key: &DeviceKey, id: &str) -> Option<&Property> {
        self.devices.get(key).and_then(|d| d.property(id))
    }

    pub fn contains(&self, key: &DeviceKey) -> bool {
        self.devices.contains_key(key)
    }

    pub fn len(&self) -> usize {
        self.devices.len()
    }

    pub fn is_empty(&self) -> bool {
        self.devices.is_empty()
    }

    pub fn devices(&self) -> impl Iterator<Item = (&DeviceKey, &Device)> {
        self.devices.iter()
    }
}

/// Thread-safe owner of all devices.
///
/// One coarse lock guards the whole table; it is never held across an
/// `.await`.
#[derive(Debug, Default)]
pub struct Registry {
    table: Mutex<DeviceTable>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Run `f` with exclusive access to the device table.
    ///
    /// Every change made inside the closure is committed when it returns;
    /// there is no separate store-back step to forget.
    pub fn transaction<R>(&self, f: impl FnOnce(&mut DeviceTable) -> R) -> R {
        let mut table = self.table.lock();
        f(&mut table)
    }

    /// Run `f` with shared access to the device table.
    pub fn read<R>(&self, f: impl FnOnce(&DeviceTable) -> R) -> R {
        let table = self.table.lock();
        f(&table)
    }

    /// Copy of the current state, mainly for diagnostics and tests.
    pub fn snapshot(&self) -> DeviceTable {
        self.table.lock().clone()
    }
}
