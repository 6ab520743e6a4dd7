//! [`BridgeRegistry`] – owns the bus and gateway handles and every
//! [`DeviceBridge`].
//!
//! # Startup
//!
//! 1. Connect the gateway and enumerate its nodes.
//! 2. Claim an identity for every opening device.  A collision aborts
//!    startup before anything is published.
//! 3. Register every bridge (discovery, then command subscriptions).
//! 4. Start the command dispatch loop and the gateway event loop.
//! 5. Activate every bridge (initial snapshot) and queue one limitation
//!    refresh per device.
//!
//! # Teardown
//!
//! Bridges first, then the worker pool drains, then the gateway and finally
//! the bus, so nothing publishes after the bus handle is gone.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use vlxbridge_hal::{Gateway, GatewayNode};
use vlxbridge_kernel::{CommandThrottle, IdentityTable, WorkerPool};
use vlxbridge_middleware::{BusMessage, MessageBus};
use vlxbridge_types::{BridgeError, DeviceCategory, NodeChanged, NodeId, Orientation};

use crate::device_bridge::{BridgeContext, DeviceBridge};
use crate::entity::{EntityKind, Naming};

/// Tunables for [`BridgeRegistry::start`].
#[derive(Debug, Clone)]
pub struct RegistrySettings {
    pub naming: Naming,
    /// Permits of the process-wide command throttle.
    pub max_concurrent_commands: usize,
    pub acquire_timeout: Option<Duration>,
    pub worker_count: usize,
    pub queue_capacity: usize,
    pub settle_delay: Duration,
    /// Use the inverted orientation for awnings.
    pub invert_awnings: bool,
    /// Reject device names with characters that have no ASCII form.
    pub strict_identity: bool,
}

impl Default for RegistrySettings {
    fn default() -> Self {
        Self {
            naming: Naming::default(),
            max_concurrent_commands: 2,
            acquire_timeout: None,
            worker_count: 4,
            queue_capacity: 64,
            settle_delay: Duration::from_millis(10),
            invert_awnings: false,
            strict_identity: true,
        }
    }
}

impl RegistrySettings {
    fn orientation_for(&self, category: DeviceCategory) -> Orientation {
        if self.invert_awnings && category == DeviceCategory::Awning {
            Orientation::Inverted
        } else {
            Orientation::Normal
        }
    }
}

/// Lookup tables shared with the dispatch loops.
#[derive(Default)]
struct Routing {
    bridges: HashMap<String, Arc<DeviceBridge>>,
    identities: HashMap<NodeId, String>,
    commands: HashMap<String, (String, EntityKind)>,
    /// Nodes that are paired but not bridged (lights, plugs).
    skipped: HashSet<NodeId>,
}

impl Routing {
    fn bridge_for_node(&self, node_id: NodeId) -> Option<&Arc<DeviceBridge>> {
        self.identities
            .get(&node_id)
            .and_then(|identity| self.bridges.get(identity))
    }
}

/// Owner of every device bridge.
pub struct BridgeRegistry {
    bus: Arc<dyn MessageBus>,
    gateway: Arc<dyn Gateway>,
    throttle: CommandThrottle,
    pool: WorkerPool,
    routing: Arc<Routing>,
    tasks: Vec<JoinHandle<()>>,
}

impl BridgeRegistry {
    /// Bring every opening device of `gateway` onto `bus`.
    ///
    /// `bus` must already be connected.
    ///
    /// # Errors
    ///
    /// Gateway connection failures, identity collisions and bus failures
    /// during registration are fatal.  Whatever was registered before the
    /// failure is torn down again.
    pub async fn start(
        bus: Arc<dyn MessageBus>,
        gateway: Arc<dyn Gateway>,
        settings: RegistrySettings,
    ) -> Result<Self, BridgeError> {
        gateway.connect().await?;
        let nodes = gateway.load_nodes().await?;
        info!(nodes = nodes.len(), "gateway nodes loaded");

        let mut throttle = CommandThrottle::new(settings.max_concurrent_commands);
        if let Some(timeout) = settings.acquire_timeout {
            throttle = throttle.with_acquire_timeout(timeout);
        }
        let pool = WorkerPool::new(settings.worker_count, settings.queue_capacity);
        let context = BridgeContext {
            bus: bus.clone(),
            throttle: throttle.clone(),
            jobs: pool.submitter(),
            naming: settings.naming.clone(),
            settle_delay: settings.settle_delay,
        };

        let routing = match build_routing(&nodes, &settings, &context) {
            Ok(routing) => routing,
            Err(e) => {
                error!(error = %e, "refusing to start");
                drop(context);
                pool.shutdown().await;
                let _ = gateway.disconnect().await;
                return Err(e);
            }
        };
        drop(context);

        // Receivers first, so nothing delivered during registration is lost.
        let commands = bus.incoming();
        let events = gateway.subscribe();

        let mut registry = Self {
            bus,
            gateway,
            throttle,
            pool,
            routing: Arc::new(routing),
            tasks: Vec::new(),
        };

        for bridge in registry.bridges_sorted() {
            if let Err(e) = bridge.register().await {
                error!(device = %bridge.identity(), error = %e, "registration failed");
                let _ = registry.shutdown().await;
                return Err(e);
            }
        }

        registry.tasks.push(tokio::spawn(dispatch_commands(commands, registry.routing.clone())));
        registry.tasks.push(tokio::spawn(route_events(events, registry.routing.clone())));

        for bridge in registry.bridges_sorted() {
            if let Err(e) = bridge.activate().await {
                // The next gateway event republishes; not fatal.
                warn!(device = %bridge.identity(), error = %e, "initial state publish failed");
            }
            registry.refresh_limitation(&bridge);
        }

        info!(devices = registry.routing.bridges.len(), "bridge registry started");
        Ok(registry)
    }

    fn refresh_limitation(&self, bridge: &DeviceBridge) {
        let node = bridge.node().clone();
        let throttle = self.throttle.clone();
        let label = format!("{}/refresh_limitation", bridge.identity());
        let job = async move {
            let _ = throttle
                .run(&label, move || async move { node.refresh_limitation().await })
                .await;
        }
        .boxed();
        if let Err(e) = self.pool.submit(job) {
            warn!(device = %bridge.identity(), error = %e, "limitation refresh not queued");
        }
    }

    fn bridges_sorted(&self) -> Vec<Arc<DeviceBridge>> {
        let mut bridges: Vec<_> = self.routing.bridges.values().cloned().collect();
        bridges.sort_by(|a, b| a.identity().cmp(b.identity()));
        bridges
    }

    pub fn bridge(&self, identity: &str) -> Option<Arc<DeviceBridge>> {
        self.routing.bridges.get(identity).cloned()
    }

    /// Identities of every bridged device, sorted.
    pub fn identities(&self) -> Vec<String> {
        let mut identities: Vec<_> = self.routing.bridges.keys().cloned().collect();
        identities.sort();
        identities
    }

    pub fn throttle(&self) -> &CommandThrottle {
        &self.throttle
    }

    /// Close every bridge, drain queued commands, then disconnect the gateway
    /// and the bus.  The first error is returned after every step ran.
    pub async fn shutdown(self) -> Result<(), BridgeError> {
        let Self {
            bus,
            gateway,
            pool,
            routing,
            tasks,
            ..
        } = self;

        for task in &tasks {
            task.abort();
        }
        for task in tasks {
            let _ = task.await;
        }

        let mut first = None;
        let mut bridges: Vec<_> = routing.bridges.values().cloned().collect();
        bridges.sort_by(|a, b| a.identity().cmp(b.identity()));
        for bridge in bridges {
            if let Err(e) = bridge.close().await {
                first.get_or_insert(e);
            }
        }

        // Commands already queued are real motion requests; let them finish.
        pool.shutdown().await;

        if let Err(e) = gateway.disconnect().await {
            warn!(error = %e, "gateway disconnect failed");
            first.get_or_insert(e);
        }
        if let Err(e) = bus.disconnect().await {
            warn!(error = %e, "bus disconnect failed");
            first.get_or_insert(e);
        }
        info!("bridge registry stopped");
        first.map_or(Ok(()), Err)
    }
}

fn build_routing(
    nodes: &[Arc<dyn GatewayNode>],
    settings: &RegistrySettings,
    context: &BridgeContext,
) -> Result<Routing, BridgeError> {
    let mut table = IdentityTable::new(settings.strict_identity);
    let mut routing = Routing::default();

    for node in nodes {
        let category = node.category();
        let Some(device_class) = category.device_class() else {
            debug!(node = node.id(), name = %node.name(), ?category, "not an opening device, skipping");
            routing.skipped.insert(node.id());
            continue;
        };

        let identity = table.claim(node.name())?;
        let orientation = settings.orientation_for(category);
        debug!(node = node.id(), name = %node.name(), identity = %identity, ?orientation, "bridging device");

        let bridge = Arc::new(DeviceBridge::new(
            identity.clone(),
            node.clone(),
            device_class,
            orientation,
            context.clone(),
        ));
        for (topic, kind) in bridge.entities().command_routes() {
            routing.commands.insert(topic, (identity.clone(), kind));
        }
        routing.identities.insert(node.id(), identity.clone());
        routing.bridges.insert(identity, bridge);
    }
    Ok(routing)
}

async fn dispatch_commands(mut messages: broadcast::Receiver<BusMessage>, routing: Arc<Routing>) {
    loop {
        match messages.recv().await {
            Ok(message) => {
                let Some((identity, kind)) = routing.commands.get(&message.topic) else {
                    continue;
                };
                if let Some(bridge) = routing.bridges.get(identity) {
                    // Errors are logged by the bridge.
                    let _ = bridge.handle_command(*kind, &message.payload).await;
                }
            }
            Err(broadcast::error::RecvError::Lagged(n)) => {
                warn!(lagged_by = n, "command dispatch lagged, commands dropped");
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!("command dispatch stopped");
}

async fn route_events(mut events: broadcast::Receiver<NodeChanged>, routing: Arc<Routing>) {
    loop {
        match events.recv().await {
            Ok(event) => match routing.bridge_for_node(event.node_id) {
                Some(bridge) => bridge.notify_changed(),
                None if routing.skipped.contains(&event.node_id) => {}
                None => {
                    let e = BridgeError::UnknownDeviceEvent(event.node_id);
                    warn!(name = %event.name, error = %e, "dropping gateway event");
                }
            },
            Err(broadcast::error::RecvError::Lagged(n)) => {
                // Missed events only delay state; refresh everything.
                warn!(lagged_by = n, "gateway event routing lagged, refreshing all devices");
                for bridge in routing.bridges.values() {
                    bridge.notify_changed();
                }
            }
            Err(broadcast::error::RecvError::Closed) => break,
        }
    }
    debug!("gateway event routing stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use vlxbridge_hal::{SimGateway, SimNodeSpec};
    use vlxbridge_middleware::LocalBus;

    fn settings() -> RegistrySettings {
        RegistrySettings {
            settle_delay: Duration::ZERO,
            ..RegistrySettings::default()
        }
    }

    #[tokio::test]
    async fn identity_collision_is_fatal_and_publishes_nothing() {
        let bus = Arc::new(LocalBus::default());
        let gateway = Arc::new(
            SimGateway::builder()
                .with_node(SimNodeSpec::new("Küche", DeviceCategory::Window))
                .with_node(SimNodeSpec::new("KUECHE", DeviceCategory::Blind))
                .build(),
        );

        let result = BridgeRegistry::start(bus.clone(), gateway, settings()).await;
        assert!(matches!(result, Err(BridgeError::IdentityCollision { .. })));
        assert!(bus.published().is_empty());
    }

    #[tokio::test]
    async fn only_opening_devices_are_bridged() {
        let bus = Arc::new(LocalBus::default());
        let gateway = Arc::new(
            SimGateway::builder()
                .with_node(SimNodeSpec::new("Office", DeviceCategory::Window))
                .with_node(SimNodeSpec::new("Ceiling Lamp", DeviceCategory::Light))
                .with_node(SimNodeSpec::new("Garage", DeviceCategory::GarageDoor))
                .build(),
        );

        let registry = BridgeRegistry::start(bus.clone(), gateway, settings()).await.unwrap();
        assert_eq!(registry.identities(), vec!["garage", "office"]);
        registry.shutdown().await.unwrap();
    }

    #[tokio::test]
    async fn awnings_are_inverted_only_when_configured() {
        for (invert, expected) in [(false, Orientation::Normal), (true, Orientation::Inverted)] {
            let bus = Arc::new(LocalBus::default());
            let gateway = Arc::new(
                SimGateway::builder()
                    .with_node(SimNodeSpec::new("Terrace", DeviceCategory::Awning))
                    .with_node(SimNodeSpec::new("Office", DeviceCategory::Window))
                    .build(),
            );
            let registry = BridgeRegistry::start(
                bus,
                gateway,
                RegistrySettings {
                    invert_awnings: invert,
                    ..settings()
                },
            )
            .await
            .unwrap();
            assert_eq!(registry.bridge("terrace").unwrap().orientation(), expected);
            assert_eq!(registry.bridge("office").unwrap().orientation(), Orientation::Normal);
            registry.shutdown().await.unwrap();
        }
    }

    #[tokio::test]
    async fn shutdown_closes_bridges_before_bus() {
        let bus = Arc::new(LocalBus::default());
        let gateway = Arc::new(
            SimGateway::builder()
                .with_node(SimNodeSpec::new("Office", DeviceCategory::Window))
                .build(),
        );
        let registry = BridgeRegistry::start(bus.clone(), gateway, settings()).await.unwrap();
        registry.shutdown().await.unwrap();

        assert!(bus.is_closed());
        // Discovery withdrawal happened while the bus was still open.
        let last = bus.published().last().cloned().unwrap();
        assert!(last.topic.ends_with("/config"));
        assert!(last.payload.is_empty());
    }

    #[tokio::test]
    async fn strict_identity_rejects_unrepresentable_names() {
        let bus = Arc::new(LocalBus::default());
        let gateway = Arc::new(
            SimGateway::builder()
                .with_node(SimNodeSpec::new("Bad/WC", DeviceCategory::Window))
                .build(),
        );
        let result = BridgeRegistry::start(bus, gateway, settings()).await;
        assert!(matches!(result, Err(BridgeError::InvalidIdentity { .. })));
    }
}
