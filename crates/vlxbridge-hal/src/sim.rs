//! In-process gateway simulation for tests and hardware-free runs.
//!
//! [`SimGateway`] behaves like a KLF-200 with a fixed set of paired nodes:
//! motion commands move the node in steps over its travel time and only
//! return once the node settles (or is superseded by another command), a
//! [`NodeChanged`] event is emitted on every step, and an optional
//! concurrency ceiling silently discards commands beyond K in flight, the
//! way the real controller does.
//!
//! # Example
//!
//! ```rust
//! # #[tokio::main(flavor = "current_thread")]
//! # async fn main() {
//! use vlxbridge_hal::gateway::{Gateway, GatewayNode};
//! use vlxbridge_hal::sim::{SimGateway, SimNodeSpec};
//! use vlxbridge_types::{DeviceCategory, Percent};
//!
//! let gateway = SimGateway::builder()
//!     .with_node(SimNodeSpec::new("Office", DeviceCategory::Window))
//!     .build();
//! gateway.connect().await.unwrap();
//!
//! let nodes = gateway.load_nodes().await.unwrap();
//! nodes[0].close().await.unwrap();
//! assert_eq!(nodes[0].snapshot().position, Percent::MAX);
//! # }
//! ```

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use async_trait::async_trait;
use serde::Deserialize;
use tokio::sync::broadcast;
use tracing::{debug, info, warn};
use vlxbridge_types::{
    BridgeError, DeviceCategory, DeviceSnapshot, GatewayAction, NodeChanged, NodeId, Percent,
};

use crate::gateway::{Gateway, GatewayNode};

/// Percent moved per simulation step.
const STEP: u8 = 10;
/// Steps needed for a full 0 → 100 travel.
const STEPS_PER_TRAVEL: u32 = 100 / STEP as u32;

const EVENT_CAPACITY: usize = 256;

fn default_travel_ms() -> u64 {
    2_000
}

fn fully_open() -> Percent {
    Percent::MIN
}

fn full_range() -> Percent {
    Percent::MAX
}

/// Static description of one simulated node.
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct SimNodeSpec {
    pub name: String,
    pub category: DeviceCategory,
    #[serde(default = "fully_open")]
    pub position: Percent,
    #[serde(default = "full_range")]
    pub limitation_max: Percent,
    /// Time for a full 0 → 100 travel.  Zero moves instantly.
    #[serde(default = "default_travel_ms")]
    pub travel_ms: u64,
}

impl SimNodeSpec {
    pub fn new(name: impl Into<String>, category: DeviceCategory) -> Self {
        Self {
            name: name.into(),
            category,
            position: fully_open(),
            limitation_max: full_range(),
            travel_ms: 0,
        }
    }

    pub fn at(mut self, position: Percent) -> Self {
        self.position = position;
        self
    }

    pub fn with_travel(mut self, travel: Duration) -> Self {
        self.travel_ms = travel.as_millis() as u64;
        self
    }

    pub fn with_limitation_max(mut self, max: Percent) -> Self {
        self.limitation_max = max;
        self
    }
}

/// Builder for [`SimGateway`].
#[derive(Debug, Default)]
pub struct SimGatewayBuilder {
    specs: Vec<SimNodeSpec>,
    drop_ceiling: Option<usize>,
}

impl SimGatewayBuilder {
    /// Pair a node.  Node ids are assigned in insertion order from 0.
    pub fn with_node(mut self, spec: SimNodeSpec) -> Self {
        self.specs.push(spec);
        self
    }

    pub fn with_nodes(mut self, specs: impl IntoIterator<Item = SimNodeSpec>) -> Self {
        self.specs.extend(specs);
        self
    }

    /// Silently discard commands while `ceiling` commands are already in
    /// flight.
    pub fn with_drop_ceiling(mut self, ceiling: usize) -> Self {
        self.drop_ceiling = Some(ceiling);
        self
    }

    pub fn build(self) -> SimGateway {
        let (events, _) = broadcast::channel(EVENT_CAPACITY);
        let shared = Arc::new(Shared {
            connected: AtomicBool::new(false),
            in_flight: AtomicUsize::new(0),
            peak_in_flight: AtomicUsize::new(0),
            dropped: AtomicUsize::new(0),
            drop_ceiling: self.drop_ceiling,
        });
        let nodes = self
            .specs
            .into_iter()
            .enumerate()
            .map(|(index, spec)| {
                Arc::new(SimNode::new(
                    index as NodeId,
                    spec,
                    events.clone(),
                    shared.clone(),
                ))
            })
            .collect();
        SimGateway {
            nodes,
            events,
            shared,
        }
    }
}

#[derive(Debug)]
struct Shared {
    connected: AtomicBool,
    in_flight: AtomicUsize,
    peak_in_flight: AtomicUsize,
    dropped: AtomicUsize,
    drop_ceiling: Option<usize>,
}

/// Returns the in-flight slot on drop.
struct InFlight(Arc<Shared>);

impl Drop for InFlight {
    fn drop(&mut self) {
        self.0.in_flight.fetch_sub(1, Ordering::SeqCst);
    }
}

#[derive(Debug)]
struct NodeState {
    position: Percent,
    target: Percent,
    limit_min: Percent,
    limit_max: Percent,
    /// Bumped by every command; a running motion stops once it changes.
    generation: u64,
}

/// A simulated node.
pub struct SimNode {
    id: NodeId,
    name: String,
    category: DeviceCategory,
    travel: Duration,
    state: Mutex<NodeState>,
    events: broadcast::Sender<NodeChanged>,
    shared: Arc<Shared>,
    commands: Mutex<Vec<GatewayAction>>,
    failing: AtomicBool,
}

impl SimNode {
    fn new(
        id: NodeId,
        spec: SimNodeSpec,
        events: broadcast::Sender<NodeChanged>,
        shared: Arc<Shared>,
    ) -> Self {
        Self {
            id,
            name: spec.name,
            category: spec.category,
            travel: Duration::from_millis(spec.travel_ms),
            state: Mutex::new(NodeState {
                position: spec.position,
                target: spec.position,
                limit_min: Percent::MIN,
                limit_max: spec.limitation_max,
                generation: 0,
            }),
            events,
            shared,
            commands: Mutex::new(Vec::new()),
            failing: AtomicBool::new(false),
        }
    }

    /// Make every following command fail with
    /// [`BridgeError::HardwareOperationFailed`].
    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    /// Commands the node accepted, in order.  Dropped commands are absent.
    pub fn commands(&self) -> Vec<GatewayAction> {
        lock(&self.commands).clone()
    }

    /// Number of accepted commands named `name` (see [`GatewayAction::name`]).
    pub fn command_count(&self, name: &str) -> usize {
        lock(&self.commands).iter().filter(|a| a.name() == name).count()
    }

    /// Move the node outside the bridge's control (wall switch, rain
    /// sensor) and announce it.
    pub fn simulate_move(&self, position: Percent) {
        {
            let mut state = lock(&self.state);
            state.position = position;
            state.target = position;
            state.generation += 1;
        }
        self.notify();
    }

    fn notify(&self) {
        debug!(node = self.id, name = %self.name, "node changed");
        // Nobody listening is fine; the gateway does not buffer for absent clients.
        let _ = self.events.send(NodeChanged::now(self.id, &self.name));
    }

    fn ensure_connected(&self) -> Result<(), BridgeError> {
        if self.shared.connected.load(Ordering::SeqCst) {
            Ok(())
        } else {
            Err(BridgeError::Gateway("not connected".to_string()))
        }
    }

    /// Admit a command, or return `None` when the ceiling drops it.
    fn admit(&self, action: GatewayAction) -> Result<Option<InFlight>, BridgeError> {
        self.ensure_connected()?;
        if self.failing.load(Ordering::SeqCst) {
            return Err(BridgeError::HardwareOperationFailed {
                device: self.name.clone(),
                operation: action.name().to_string(),
                details: "simulated failure".to_string(),
            });
        }

        let now = self.shared.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        let guard = InFlight(self.shared.clone());
        if self.shared.drop_ceiling.is_some_and(|ceiling| now > ceiling) {
            self.shared.dropped.fetch_add(1, Ordering::SeqCst);
            warn!(node = self.id, command = action.name(), in_flight = now, "command dropped by gateway");
            return Ok(None);
        }
        self.shared.peak_in_flight.fetch_max(now, Ordering::SeqCst);
        lock(&self.commands).push(action);
        debug!(node = self.id, command = action.name(), "command accepted");
        Ok(Some(guard))
    }

    async fn move_to(&self, action: GatewayAction, target: Percent) -> Result<(), BridgeError> {
        let Some(_in_flight) = self.admit(action)? else {
            return Ok(());
        };

        let generation = {
            let mut state = lock(&self.state);
            state.target = target.max(state.limit_min).min(state.limit_max);
            state.generation += 1;
            state.generation
        };
        self.notify();

        let tick = self.travel / STEPS_PER_TRAVEL;
        loop {
            {
                let state = lock(&self.state);
                if state.generation != generation {
                    debug!(node = self.id, "motion superseded");
                    return Ok(());
                }
                if state.position == state.target {
                    break;
                }
            }
            if !tick.is_zero() {
                tokio::time::sleep(tick).await;
            }
            {
                let mut state = lock(&self.state);
                if state.generation != generation {
                    return Ok(());
                }
                state.position = step_towards(state.position, state.target);
            }
            self.notify();
        }
        debug!(node = self.id, "motion settled");
        Ok(())
    }
}

fn step_towards(position: Percent, target: Percent) -> Percent {
    let (p, t) = (i64::from(position.value()), i64::from(target.value()));
    let step = i64::from(STEP);
    if t > p {
        Percent::saturating((p + step).min(t))
    } else {
        Percent::saturating((p - step).max(t))
    }
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[async_trait]
impl GatewayNode for SimNode {
    fn id(&self) -> NodeId {
        self.id
    }

    fn name(&self) -> &str {
        &self.name
    }

    fn category(&self) -> DeviceCategory {
        self.category
    }

    fn snapshot(&self) -> DeviceSnapshot {
        let state = lock(&self.state);
        DeviceSnapshot {
            position: state.position,
            target: state.target,
            limitation_max: state.limit_max,
        }
    }

    async fn open(&self) -> Result<(), BridgeError> {
        self.move_to(GatewayAction::Open, Percent::MIN).await
    }

    async fn close(&self) -> Result<(), BridgeError> {
        self.move_to(GatewayAction::Close, Percent::MAX).await
    }

    async fn stop(&self) -> Result<(), BridgeError> {
        let Some(_in_flight) = self.admit(GatewayAction::Stop)? else {
            return Ok(());
        };
        {
            let mut state = lock(&self.state);
            state.target = state.position;
            state.generation += 1;
        }
        self.notify();
        Ok(())
    }

    async fn set_position(&self, position: Percent) -> Result<(), BridgeError> {
        self.move_to(GatewayAction::SetPosition(position), position).await
    }

    async fn set_position_limits(&self, min: Percent, max: Percent) -> Result<(), BridgeError> {
        let Some(_in_flight) = self.admit(GatewayAction::SetLimits { min, max })? else {
            return Ok(());
        };
        {
            let mut state = lock(&self.state);
            state.limit_min = min.min(max);
            state.limit_max = max.max(min);
        }
        self.notify();
        Ok(())
    }

    async fn clear_position_limits(&self) -> Result<(), BridgeError> {
        let Some(_in_flight) = self.admit(GatewayAction::ClearLimits)? else {
            return Ok(());
        };
        {
            let mut state = lock(&self.state);
            state.limit_min = Percent::MIN;
            state.limit_max = Percent::MAX;
        }
        self.notify();
        Ok(())
    }

    async fn refresh_limitation(&self) -> Result<(), BridgeError> {
        self.ensure_connected()?;
        self.notify();
        Ok(())
    }
}

/// Simulated KLF-200 style gateway.
pub struct SimGateway {
    nodes: Vec<Arc<SimNode>>,
    events: broadcast::Sender<NodeChanged>,
    shared: Arc<Shared>,
}

impl SimGateway {
    pub fn builder() -> SimGatewayBuilder {
        SimGatewayBuilder::default()
    }

    pub fn node(&self, id: NodeId) -> Option<Arc<SimNode>> {
        self.nodes.get(usize::from(id)).cloned()
    }

    pub fn node_by_name(&self, name: &str) -> Option<Arc<SimNode>> {
        self.nodes.iter().find(|n| n.name == name).cloned()
    }

    /// Commands currently executing across all nodes.
    pub fn in_flight(&self) -> usize {
        self.shared.in_flight.load(Ordering::SeqCst)
    }

    /// Highest number of commands ever executing at once.
    pub fn peak_in_flight(&self) -> usize {
        self.shared.peak_in_flight.load(Ordering::SeqCst)
    }

    /// Commands silently discarded by the ceiling.
    pub fn dropped_commands(&self) -> usize {
        self.shared.dropped.load(Ordering::SeqCst)
    }

    /// Emit a device-changed event for an arbitrary node id.
    pub fn emit(&self, node_id: NodeId, name: &str) {
        let _ = self.events.send(NodeChanged::now(node_id, name));
    }
}

#[async_trait]
impl Gateway for SimGateway {
    async fn connect(&self) -> Result<(), BridgeError> {
        self.shared.connected.store(true, Ordering::SeqCst);
        info!(nodes = self.nodes.len(), "simulated gateway connected");
        Ok(())
    }

    async fn load_nodes(&self) -> Result<Vec<Arc<dyn GatewayNode>>, BridgeError> {
        if !self.shared.connected.load(Ordering::SeqCst) {
            return Err(BridgeError::Gateway("load_nodes before connect".to_string()));
        }
        Ok(self
            .nodes
            .iter()
            .map(|node| node.clone() as Arc<dyn GatewayNode>)
            .collect())
    }

    fn subscribe(&self) -> broadcast::Receiver<NodeChanged> {
        self.events.subscribe()
    }

    async fn disconnect(&self) -> Result<(), BridgeError> {
        self.shared.connected.store(false, Ordering::SeqCst);
        info!("simulated gateway disconnected");
        Ok(())
    }
}
