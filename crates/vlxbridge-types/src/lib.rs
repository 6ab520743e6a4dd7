use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Identifier the gateway assigns to a paired node.
pub type NodeId = u16;

/// A position in percent, always within `0..=100`.
///
/// The gateway reports positions as raw integers; [`Percent::saturating`]
/// clamps anything outside the range so downstream derivation stays total.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(try_from = "u8", into = "u8")]
pub struct Percent(u8);

impl Percent {
    /// 0 %.
    pub const MIN: Percent = Percent(0);
    /// 100 %.
    pub const MAX: Percent = Percent(100);

    /// Build a percent value, rejecting anything above 100.
    pub fn new(value: u8) -> Result<Self, BridgeError> {
        if value > 100 {
            return Err(BridgeError::OutOfRange(i64::from(value)));
        }
        Ok(Self(value))
    }

    /// Clamp an arbitrary integer into `0..=100`.
    pub fn saturating(value: i64) -> Self {
        Self(value.clamp(0, 100) as u8)
    }

    pub fn value(self) -> u8 {
        self.0
    }
}

impl TryFrom<u8> for Percent {
    type Error = BridgeError;

    fn try_from(value: u8) -> Result<Self, Self::Error> {
        Percent::new(value)
    }
}

impl From<Percent> for u8 {
    fn from(p: Percent) -> Self {
        p.0
    }
}

impl fmt::Display for Percent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Discrete motion state published on a cover's state topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MotionState {
    Open,
    Closed,
    Opening,
    Closing,
}

impl MotionState {
    pub fn as_str(self) -> &'static str {
        match self {
            MotionState::Open => "open",
            MotionState::Closed => "closed",
            MotionState::Opening => "opening",
            MotionState::Closing => "closing",
        }
    }
}

impl fmt::Display for MotionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// State of the "keep open" limit switch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LimitState {
    /// The device is kept from travelling its full range.
    On,
    Off,
}

impl LimitState {
    pub fn as_str(self) -> &'static str {
        match self {
            LimitState::On => "on",
            LimitState::Off => "off",
        }
    }
}

impl fmt::Display for LimitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Whether increasing position percent means "more closed" or "more open".
///
/// The orientation is the only axis along which device bridges differ: it
/// picks the discovery position codes, the motion derivation mapping and
/// the physical action behind the `OPEN` / `CLOSE` commands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Orientation {
    /// 0 % = fully open, 100 % = fully closed.
    #[default]
    Normal,
    /// 0 % = fully closed, 100 % = fully open (awnings).
    Inverted,
}

impl Orientation {
    /// Position code announced as "open" in discovery metadata.
    pub fn position_open(self) -> Percent {
        match self {
            Orientation::Normal => Percent::MIN,
            Orientation::Inverted => Percent::MAX,
        }
    }

    /// Position code announced as "closed" in discovery metadata.
    pub fn position_closed(self) -> Percent {
        match self {
            Orientation::Normal => Percent::MAX,
            Orientation::Inverted => Percent::MIN,
        }
    }

    /// Translate a bus command into the gateway action that performs it.
    pub fn action_for(self, command: CoverCommand) -> GatewayAction {
        match (self, command) {
            (Orientation::Normal, CoverCommand::Open) => GatewayAction::Open,
            (Orientation::Normal, CoverCommand::Close) => GatewayAction::Close,
            (Orientation::Inverted, CoverCommand::Open) => GatewayAction::Close,
            (Orientation::Inverted, CoverCommand::Close) => GatewayAction::Open,
            (_, CoverCommand::Stop) => GatewayAction::Stop,
            (_, CoverCommand::SetPosition(p)) => GatewayAction::SetPosition(p),
        }
    }
}

/// Kind of node paired with the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceCategory {
    Window,
    Blind,
    Awning,
    RollerShutter,
    GarageDoor,
    Gate,
    Blade,
    Light,
    OnOffSwitch,
}

impl DeviceCategory {
    /// Only opening devices get a bridge; lights and plugs are skipped.
    pub fn is_opening_device(self) -> bool {
        self.device_class().is_some()
    }

    /// Home Assistant cover device class for this category.
    pub fn device_class(self) -> Option<&'static str> {
        match self {
            DeviceCategory::Window => Some("window"),
            DeviceCategory::Blind => Some("blind"),
            DeviceCategory::Awning => Some("awning"),
            DeviceCategory::RollerShutter => Some("shutter"),
            DeviceCategory::GarageDoor => Some("garage"),
            DeviceCategory::Gate => Some("gate"),
            DeviceCategory::Blade => Some("shade"),
            DeviceCategory::Light | DeviceCategory::OnOffSwitch => None,
        }
    }
}

/// Point-in-time view of a node as reported by the gateway.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DeviceSnapshot {
    pub position: Percent,
    pub target: Percent,
    pub limitation_max: Percent,
}

impl DeviceSnapshot {
    /// A device at rest at `position` with no limitation.
    pub fn at_rest(position: Percent) -> Self {
        Self {
            position,
            target: position,
            limitation_max: Percent::MAX,
        }
    }
}

/// Gateway-wide "device changed" notification.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeChanged {
    pub node_id: NodeId,
    pub name: String,
    pub timestamp: DateTime<Utc>,
}

impl NodeChanged {
    pub fn now(node_id: NodeId, name: impl Into<String>) -> Self {
        Self {
            node_id,
            name: name.into(),
            timestamp: Utc::now(),
        }
    }
}

/// Payload accepted on a cover's `/set` topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CoverCommand {
    Open,
    Close,
    Stop,
    SetPosition(Percent),
}

impl CoverCommand {
    /// Parse `OPEN`, `CLOSE`, `STOP` or a bare integer percent.
    pub fn parse(payload: &[u8]) -> Result<Self, BridgeError> {
        let malformed = || BridgeError::MalformedCommand(String::from_utf8_lossy(payload).into_owned());
        let text = std::str::from_utf8(payload).map_err(|_| malformed())?.trim();
        match text {
            "OPEN" => Ok(CoverCommand::Open),
            "CLOSE" => Ok(CoverCommand::Close),
            "STOP" => Ok(CoverCommand::Stop),
            other => {
                let value: u8 = other.parse().map_err(|_| malformed())?;
                Percent::new(value)
                    .map(CoverCommand::SetPosition)
                    .map_err(|_| malformed())
            }
        }
    }
}

/// Payload accepted on a limit switch's `/set` topic.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SwitchCommand {
    On,
    Off,
}

impl SwitchCommand {
    pub fn parse(payload: &[u8]) -> Result<Self, BridgeError> {
        match payload {
            b"ON" => Ok(SwitchCommand::On),
            b"OFF" => Ok(SwitchCommand::Off),
            other => Err(BridgeError::MalformedCommand(
                String::from_utf8_lossy(other).into_owned(),
            )),
        }
    }
}

/// A unit of work submitted to the gateway for one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GatewayAction {
    Open,
    Close,
    Stop,
    SetPosition(Percent),
    SetLimits { min: Percent, max: Percent },
    ClearLimits,
}

impl GatewayAction {
    pub fn name(&self) -> &'static str {
        match self {
            GatewayAction::Open => "open",
            GatewayAction::Close => "close",
            GatewayAction::Stop => "stop",
            GatewayAction::SetPosition(_) => "set_position",
            GatewayAction::SetLimits { .. } => "set_position_limits",
            GatewayAction::ClearLimits => "clear_position_limits",
        }
    }
}

/// Error type shared by every bridge crate.
///
/// Per-command and per-event variants are contained at the device bridge
/// boundary and only logged; `IdentityCollision`, `InvalidIdentity`, `Bus`
/// and `Config` are fatal during startup.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum BridgeError {
    #[error("Malformed command payload: {0:?}")]
    MalformedCommand(String),

    #[error("Hardware operation {operation} failed on {device}: {details}")]
    HardwareOperationFailed {
        device: String,
        operation: String,
        details: String,
    },

    #[error("Event for unknown device node {0}")]
    UnknownDeviceEvent(NodeId),

    #[error("Identity collision: {first:?} and {second:?} both map to {identity:?}")]
    IdentityCollision {
        identity: String,
        first: String,
        second: String,
    },

    #[error("Invalid identity for {name:?}: {reason}")]
    InvalidIdentity { name: String, reason: String },

    #[error("Device {0} is not accepting commands")]
    NotRegistered(String),

    #[error("Timed out after {0} ms waiting for a command permit")]
    ThrottleTimeout(u64),

    #[error("Command queue is full")]
    QueueFull,

    #[error("Worker pool is shut down")]
    PoolClosed,

    #[error("Percent value {0} is outside 0..=100")]
    OutOfRange(i64),

    #[error("Bus error: {0}")]
    Bus(String),

    #[error("Gateway error: {0}")]
    Gateway(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Serialization error: {0}")]
    Serialization(String),
}
