//! Home Assistant MQTT discovery documents.
//!
//! Each entity announces itself with a retained JSON document on
//! `<discovery_prefix>/<component>/<unique_id>/config`; publishing an empty
//! retained payload to the same topic removes it again.  Entities supply
//! option key/value pairs; this module renders and publishes the document.

use std::collections::BTreeMap;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::debug;
use vlxbridge_types::BridgeError;

use crate::bus::MessageBus;

/// The "device" block that groups several entities in Home Assistant.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct HaDevice {
    pub name: String,
    pub identifiers: Vec<String>,
    pub manufacturer: String,
    pub model: String,
}

impl HaDevice {
    pub fn new(name: impl Into<String>, identifier: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            identifiers: vec![identifier.into()],
            manufacturer: "Velux".to_string(),
            model: "KLF 200".to_string(),
        }
    }
}

/// Discovery metadata for one entity.
///
/// ```
/// use vlxbridge_middleware::discovery::{Discovery, HaDevice};
///
/// let device = HaDevice::new("Office", "vlx-office");
/// let mut cover = Discovery::new("homeassistant", "cover", "vlx-office", "", device);
/// cover.option("device_class", "window");
/// assert_eq!(cover.config_topic(), "homeassistant/cover/vlx-office/config");
/// assert_eq!(cover.topic("set"), "homeassistant/cover/vlx-office/set");
/// assert_eq!(cover.document()["device_class"], "window");
/// ```
#[derive(Debug, Clone)]
pub struct Discovery {
    component: String,
    unique_id: String,
    name: String,
    base_topic: String,
    device: HaDevice,
    options: BTreeMap<String, Value>,
}

impl Discovery {
    /// An empty `name` lets Home Assistant name the entity after its device.
    pub fn new(
        discovery_prefix: &str,
        component: &str,
        unique_id: impl Into<String>,
        name: impl Into<String>,
        device: HaDevice,
    ) -> Self {
        let unique_id = unique_id.into();
        let base_topic = format!("{discovery_prefix}/{component}/{unique_id}");
        Self {
            component: component.to_string(),
            unique_id,
            name: name.into(),
            base_topic,
            device,
            options: BTreeMap::new(),
        }
    }

    pub fn component(&self) -> &str {
        &self.component
    }

    pub fn unique_id(&self) -> &str {
        &self.unique_id
    }

    pub fn base_topic(&self) -> &str {
        &self.base_topic
    }

    /// `<base_topic>/<suffix>`.
    pub fn topic(&self, suffix: &str) -> String {
        format!("{}/{suffix}", self.base_topic)
    }

    pub fn config_topic(&self) -> String {
        self.topic("config")
    }

    /// Add or replace a document option.
    pub fn option(&mut self, key: &str, value: impl Into<Value>) -> &mut Self {
        self.options.insert(key.to_string(), value.into());
        self
    }

    pub fn get(&self, key: &str) -> Option<&Value> {
        self.options.get(key)
    }

    /// The rendered JSON document.
    pub fn document(&self) -> Value {
        let mut doc = Map::new();
        let name = if self.name.is_empty() {
            Value::Null
        } else {
            Value::String(self.name.clone())
        };
        doc.insert("name".into(), name);
        doc.insert("unique_id".into(), Value::String(self.unique_id.clone()));
        doc.insert("object_id".into(), Value::String(self.unique_id.clone()));
        // A Serialize impl over plain strings cannot fail.
        doc.insert(
            "device".into(),
            serde_json::to_value(&self.device).unwrap_or(Value::Null),
        );
        for (key, value) in &self.options {
            doc.insert(key.clone(), value.clone());
        }
        Value::Object(doc)
    }

    /// Publish the retained discovery document.
    pub async fn publish(&self, bus: &dyn MessageBus) -> Result<(), BridgeError> {
        let payload = serde_json::to_vec(&self.document())
            .map_err(|e| BridgeError::Serialization(e.to_string()))?;
        debug!(entity = %self.unique_id, topic = %self.config_topic(), "publishing discovery");
        bus.publish(&self.config_topic(), &payload, true).await
    }

    /// Remove the entity from Home Assistant.
    pub async fn remove(&self, bus: &dyn MessageBus) -> Result<(), BridgeError> {
        debug!(entity = %self.unique_id, "removing discovery");
        bus.publish(&self.config_topic(), b"", true).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::LocalBus;

    fn switch() -> Discovery {
        let device = HaDevice::new("Bad Fenster", "vlx-bad-fenster");
        let mut d = Discovery::new(
            "homeassistant",
            "switch",
            "vlx-bad-fenster-keepopen",
            "Keep open",
            device,
        );
        let (set, state) = (d.topic("set"), d.topic("state"));
        d.option("command_topic", set)
            .option("state_topic", state)
            .option("icon", "mdi:lock-open-variant");
        d
    }

    #[test]
    fn document_contains_identity_device_and_options() {
        let doc = switch().document();
        assert_eq!(doc["name"], "Keep open");
        assert_eq!(doc["unique_id"], "vlx-bad-fenster-keepopen");
        assert_eq!(doc["device"]["name"], "Bad Fenster");
        assert_eq!(doc["device"]["identifiers"][0], "vlx-bad-fenster");
        assert_eq!(
            doc["command_topic"],
            "homeassistant/switch/vlx-bad-fenster-keepopen/set"
        );
        assert_eq!(doc["icon"], "mdi:lock-open-variant");
    }

    #[test]
    fn empty_name_renders_as_null() {
        let d = Discovery::new("ha", "cover", "x", "", HaDevice::new("X", "x"));
        assert!(d.document()["name"].is_null());
    }

    #[test]
    fn numeric_options_stay_numeric() {
        let mut d = Discovery::new("ha", "cover", "x", "", HaDevice::new("X", "x"));
        d.option("position_open", 100).option("position_closed", 0);
        assert_eq!(d.document()["position_open"], 100);
        assert_eq!(d.get("position_closed"), Some(&Value::from(0)));
    }

    #[tokio::test]
    async fn publish_then_remove_clears_retained_config() -> Result<(), BridgeError> {
        let bus = LocalBus::default();
        let d = switch();
        d.publish(&bus).await?;
        let retained = bus.retained(&d.config_topic()).unwrap_or_default();
        let parsed: Value = serde_json::from_str(&retained).map_err(|e| BridgeError::Serialization(e.to_string()))?;
        assert_eq!(parsed["unique_id"], "vlx-bad-fenster-keepopen");

        d.remove(&bus).await?;
        assert_eq!(bus.retained(&d.config_topic()), None);
        Ok(())
    }
}
