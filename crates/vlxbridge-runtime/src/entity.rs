//! The per-device entity set: one cover and one "keep open" limit switch.
//!
//! Each entity announces itself with a discovery document before its
//! command topic is subscribed, so Home Assistant never sees a command
//! topic it cannot interpret.

use tracing::{debug, warn};
use vlxbridge_middleware::{Discovery, HaDevice, MessageBus};
use vlxbridge_types::{BridgeError, LimitState, MotionState, Orientation, Percent};

/// Topic naming shared by every entity.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Naming {
    /// Root of the discovery tree, normally `homeassistant`.
    pub discovery_prefix: String,
    /// Prepended to device names and entity ids; lets several bridges share
    /// one broker.
    pub haprefix: String,
}

impl Default for Naming {
    fn default() -> Self {
        Self {
            discovery_prefix: "homeassistant".to_string(),
            haprefix: String::new(),
        }
    }
}

impl Naming {
    /// Entity id of the device with `identity`.
    pub fn entity_id(&self, identity: &str) -> String {
        format!("{}vlx-{identity}", self.haprefix)
    }
}

/// Which entity of a device a command topic belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntityKind {
    Cover,
    LimitSwitch,
}

/// The cover entity.
#[derive(Debug, Clone)]
pub struct CoverEntity {
    discovery: Discovery,
}

impl CoverEntity {
    pub fn new(
        naming: &Naming,
        entity_id: &str,
        device: HaDevice,
        device_class: &str,
        orientation: Orientation,
    ) -> Self {
        let mut discovery = Discovery::new(&naming.discovery_prefix, "cover", entity_id, "", device);
        let (set, position, state) = (
            discovery.topic("set"),
            discovery.topic("position"),
            discovery.topic("state"),
        );
        discovery
            .option("command_topic", set.clone())
            .option("set_position_topic", set)
            .option("position_topic", position)
            .option("state_topic", state)
            .option("position_open", orientation.position_open().value())
            .option("position_closed", orientation.position_closed().value())
            .option("device_class", device_class);
        Self { discovery }
    }

    pub fn discovery(&self) -> &Discovery {
        &self.discovery
    }

    pub fn command_topic(&self) -> String {
        self.discovery.topic("set")
    }

    pub fn position_topic(&self) -> String {
        self.discovery.topic("position")
    }

    pub fn state_topic(&self) -> String {
        self.discovery.topic("state")
    }

    pub async fn publish_position(&self, bus: &dyn MessageBus, position: Percent) -> Result<(), BridgeError> {
        bus.publish(&self.position_topic(), position.to_string().as_bytes(), true)
            .await
    }

    pub async fn publish_state(&self, bus: &dyn MessageBus, state: MotionState) -> Result<(), BridgeError> {
        bus.publish(&self.state_topic(), state.as_str().as_bytes(), true)
            .await
    }
}

/// The "keep open" switch bound to the device's position limitation.
#[derive(Debug, Clone)]
pub struct SwitchEntity {
    discovery: Discovery,
}

impl SwitchEntity {
    pub const ICON: &'static str = "mdi:lock-open-variant";

    pub fn new(naming: &Naming, entity_id: &str, device: HaDevice) -> Self {
        let unique_id = format!("{entity_id}-keepopen");
        let mut discovery =
            Discovery::new(&naming.discovery_prefix, "switch", unique_id, "Keep open", device);
        let (set, state) = (discovery.topic("set"), discovery.topic("state"));
        discovery
            .option("command_topic", set)
            .option("state_topic", state)
            .option("payload_on", "ON")
            .option("payload_off", "OFF")
            .option("state_on", LimitState::On.as_str())
            .option("state_off", LimitState::Off.as_str())
            .option("icon", Self::ICON);
        Self { discovery }
    }

    pub fn discovery(&self) -> &Discovery {
        &self.discovery
    }

    pub fn command_topic(&self) -> String {
        self.discovery.topic("set")
    }

    pub fn state_topic(&self) -> String {
        self.discovery.topic("state")
    }

    pub async fn publish_state(&self, bus: &dyn MessageBus, state: LimitState) -> Result<(), BridgeError> {
        bus.publish(&self.state_topic(), state.as_str().as_bytes(), true)
            .await
    }
}

/// Both entities of one device, grouped under one discovery device block.
#[derive(Debug, Clone)]
pub struct EntitySet {
    entity_id: String,
    pub cover: CoverEntity,
    pub switch: SwitchEntity,
}

impl EntitySet {
    pub fn new(
        naming: &Naming,
        identity: &str,
        node_name: &str,
        device_class: &str,
        orientation: Orientation,
    ) -> Self {
        let entity_id = naming.entity_id(identity);
        let device = HaDevice::new(format!("{}{node_name}", naming.haprefix), entity_id.clone());
        Self {
            cover: CoverEntity::new(naming, &entity_id, device.clone(), device_class, orientation),
            switch: SwitchEntity::new(naming, &entity_id, device),
            entity_id,
        }
    }

    pub fn entity_id(&self) -> &str {
        &self.entity_id
    }

    /// Command topics and the entity each belongs to.
    pub fn command_routes(&self) -> [(String, EntityKind); 2] {
        [
            (self.cover.command_topic(), EntityKind::Cover),
            (self.switch.command_topic(), EntityKind::LimitSwitch),
        ]
    }

    /// Announce both entities and subscribe to their command topics,
    /// discovery first.
    pub async fn register(&self, bus: &dyn MessageBus) -> Result<(), BridgeError> {
        self.cover.discovery().publish(bus).await?;
        bus.subscribe(&self.cover.command_topic()).await?;
        self.switch.discovery().publish(bus).await?;
        bus.subscribe(&self.switch.command_topic()).await?;
        debug!(entity = %self.entity_id, "entities registered");
        Ok(())
    }

    /// Unsubscribe and withdraw discovery.  Every step is attempted even if
    /// an earlier one fails or registration never completed; the first error
    /// is returned.
    pub async fn close(&self, bus: &dyn MessageBus) -> Result<(), BridgeError> {
        let results = [
            bus.unsubscribe(&self.cover.command_topic()).await,
            bus.unsubscribe(&self.switch.command_topic()).await,
            self.cover.discovery().remove(bus).await,
            self.switch.discovery().remove(bus).await,
        ];
        let mut first = None;
        for result in results {
            if let Err(e) = result {
                warn!(entity = %self.entity_id, error = %e, "entity teardown step failed");
                first.get_or_insert(e);
            }
        }
        first.map_or(Ok(()), Err)
    }
}
