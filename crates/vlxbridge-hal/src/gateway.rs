//! Generic `Gateway` and `GatewayNode` traits for the hardware controller
//! that drives the covers.
//!
//! Gateway drivers implement these traits; the bridge only ever talks to the
//! traits, so a real KLF-200 session and the simulator are interchangeable.

use std::sync::Arc;

use async_trait::async_trait;
use tokio::sync::broadcast;
use vlxbridge_types::{
    BridgeError, DeviceCategory, DeviceSnapshot, GatewayAction, NodeChanged, NodeId, Percent,
};

/// One node paired with the gateway.
///
/// Every motion command may take as long as the physical movement; callers
/// run them through the command throttle, never on a delivery path.
#[async_trait]
pub trait GatewayNode: Send + Sync {
    /// Stable node index assigned by the gateway.
    fn id(&self) -> NodeId;

    /// Human-readable name as configured on the gateway.
    fn name(&self) -> &str;

    fn category(&self) -> DeviceCategory;

    /// Current position, target and limitation.  Never blocks.
    fn snapshot(&self) -> DeviceSnapshot;

    async fn open(&self) -> Result<(), BridgeError>;

    async fn close(&self) -> Result<(), BridgeError>;

    async fn stop(&self) -> Result<(), BridgeError>;

    async fn set_position(&self, position: Percent) -> Result<(), BridgeError>;

    /// Restrict the node's travel to `min..=max`.
    async fn set_position_limits(&self, min: Percent, max: Percent) -> Result<(), BridgeError>;

    async fn clear_position_limits(&self) -> Result<(), BridgeError>;

    /// Ask the gateway for the current limitation.  The answer arrives as an
    /// ordinary [`NodeChanged`] event.
    async fn refresh_limitation(&self) -> Result<(), BridgeError>;

    /// Dispatch a [`GatewayAction`] to the matching method.
    async fn execute(&self, action: GatewayAction) -> Result<(), BridgeError> {
        match action {
            GatewayAction::Open => self.open().await,
            GatewayAction::Close => self.close().await,
            GatewayAction::Stop => self.stop().await,
            GatewayAction::SetPosition(p) => self.set_position(p).await,
            GatewayAction::SetLimits { min, max } => self.set_position_limits(min, max).await,
            GatewayAction::ClearLimits => self.clear_position_limits().await,
        }
    }
}

/// A gateway session.
#[async_trait]
pub trait Gateway: Send + Sync {
    async fn connect(&self) -> Result<(), BridgeError>;

    /// Enumerate every paired node, opening devices or not.
    ///
    /// # Errors
    ///
    /// [`BridgeError::Gateway`] when called before [`Gateway::connect`].
    async fn load_nodes(&self) -> Result<Vec<Arc<dyn GatewayNode>>, BridgeError>;

    /// Receiver for gateway-wide device-changed notifications.
    fn subscribe(&self) -> broadcast::Receiver<NodeChanged>;

    async fn disconnect(&self) -> Result<(), BridgeError>;
}
