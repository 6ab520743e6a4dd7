//! [`DeviceBridge`] – binds one gateway node to its bus entities.
//!
//! # Lifecycle
//!
//! ```text
//! Uninitialized ──register()──▶ Registered ──activate()──▶ Active ──close()──▶ Closed
//! ```
//!
//! * `register` publishes discovery, subscribes the command topics and
//!   starts the state updater.
//! * `activate` publishes the first snapshot; commands are accepted from
//!   here on.  Anything arriving earlier is rejected with
//!   [`BridgeError::NotRegistered`].
//! * `close` stops the updater and tears down the entities.  Commands
//!   already handed to the worker pool still run to completion; they are
//!   real motion the gateway has already been asked for.
//!
//! # Commands
//!
//! [`DeviceBridge::handle_command`] parses the payload on the delivery path
//! and submits the gateway call to the shared
//! [`WorkerPool`][vlxbridge_kernel::WorkerPool]; the call itself runs under
//! the shared [`CommandThrottle`].  A malformed payload is logged exactly
//! once and never reaches the gateway.
//!
//! # State updates
//!
//! Gateway notifications are coalesced: [`DeviceBridge::notify_changed`]
//! never blocks, and the updater always reads the latest snapshot when it
//! runs, so a burst of step events results in at most one pending publish.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures_util::FutureExt;
use tokio::sync::{Mutex as AsyncMutex, RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};
use vlxbridge_hal::GatewayNode;
use vlxbridge_kernel::{CommandThrottle, DerivedState, JobSubmitter, derive};
use vlxbridge_middleware::MessageBus;
use vlxbridge_types::{BridgeError, CoverCommand, GatewayAction, Orientation, Percent, SwitchCommand};

use crate::entity::{EntityKind, EntitySet, Naming};

/// Lifecycle state of a [`DeviceBridge`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BridgeState {
    Uninitialized,
    Registered,
    Active,
    Closed,
}

/// Shared collaborators handed to every bridge.
#[derive(Clone)]
pub struct BridgeContext {
    pub bus: Arc<dyn MessageBus>,
    pub throttle: CommandThrottle,
    pub jobs: JobSubmitter,
    pub naming: Naming,
    /// Pause between the position and state publishes of one update.
    pub settle_delay: Duration,
}

/// Reads the node and publishes its derived state.  Shared between the
/// bridge and its updater task.
struct StatePublisher {
    identity: String,
    node: Arc<dyn GatewayNode>,
    entities: EntitySet,
    orientation: Orientation,
    bus: Arc<dyn MessageBus>,
    settle_delay: Duration,
    /// Keeps position and state of one snapshot adjacent on the bus.
    publishing: AsyncMutex<()>,
}

impl StatePublisher {
    async fn publish(&self) -> Result<DerivedState, BridgeError> {
        let _publishing = self.publishing.lock().await;
        let state = derive(&self.node.snapshot(), self.orientation);
        debug!(
            device = %self.identity,
            position = %state.position,
            motion = %state.motion,
            limit = %state.limit,
            "publishing state"
        );
        let bus = self.bus.as_ref();
        self.entities.cover.publish_position(bus, state.position).await?;
        if !self.settle_delay.is_zero() {
            tokio::time::sleep(self.settle_delay).await;
        }
        self.entities.cover.publish_state(bus, state.motion).await?;
        self.entities.switch.publish_state(bus, state.limit).await?;
        Ok(state)
    }
}

/// Bridge between one gateway node and its bus entities.
pub struct DeviceBridge {
    publisher: Arc<StatePublisher>,
    throttle: CommandThrottle,
    jobs: Mutex<Option<JobSubmitter>>,
    state: RwLock<BridgeState>,
    updates: Mutex<Option<mpsc::Sender<()>>>,
    updater: Mutex<Option<JoinHandle<()>>>,
}

impl DeviceBridge {
    /// Build an unregistered bridge.  Nothing is published until
    /// [`register`][Self::register].
    pub fn new(
        identity: impl Into<String>,
        node: Arc<dyn GatewayNode>,
        device_class: &str,
        orientation: Orientation,
        context: BridgeContext,
    ) -> Self {
        let identity = identity.into();
        let entities = EntitySet::new(&context.naming, &identity, node.name(), device_class, orientation);
        Self {
            publisher: Arc::new(StatePublisher {
                identity,
                node,
                entities,
                orientation,
                bus: context.bus,
                settle_delay: context.settle_delay,
                publishing: AsyncMutex::new(()),
            }),
            throttle: context.throttle,
            jobs: Mutex::new(Some(context.jobs)),
            state: RwLock::new(BridgeState::Uninitialized),
            updates: Mutex::new(None),
            updater: Mutex::new(None),
        }
    }

    pub fn identity(&self) -> &str {
        &self.publisher.identity
    }

    pub fn orientation(&self) -> Orientation {
        self.publisher.orientation
    }

    pub fn node(&self) -> &Arc<dyn GatewayNode> {
        &self.publisher.node
    }

    pub fn entities(&self) -> &EntitySet {
        &self.publisher.entities
    }

    pub async fn state(&self) -> BridgeState {
        *self.state.read().await
    }

    /// `Uninitialized → Registered`: announce the entities, subscribe their
    /// command topics and start the updater.
    ///
    /// On failure the partially registered entities are torn down again and
    /// the bridge stays `Uninitialized`.
    pub async fn register(&self) -> Result<(), BridgeError> {
        let mut state = self.state.write().await;
        if *state != BridgeState::Uninitialized {
            return Err(BridgeError::NotRegistered(format!(
                "{} cannot register from {:?}",
                self.identity(),
                *state
            )));
        }

        let bus = self.publisher.bus.as_ref();
        if let Err(e) = self.publisher.entities.register(bus).await {
            let _ = self.publisher.entities.close(bus).await;
            return Err(e);
        }

        let (tx, rx) = mpsc::channel(1);
        let handle = tokio::spawn(run_updater(self.publisher.clone(), rx));
        *lock(&self.updates) = Some(tx);
        *lock(&self.updater) = Some(handle);

        *state = BridgeState::Registered;
        debug!(device = %self.identity(), "bridge registered");
        Ok(())
    }

    /// `Registered → Active`: publish the current snapshot, then accept
    /// commands.
    pub async fn activate(&self) -> Result<DerivedState, BridgeError> {
        let mut state = self.state.write().await;
        if *state != BridgeState::Registered {
            return Err(BridgeError::NotRegistered(self.identity().to_string()));
        }
        let derived = self.publisher.publish().await?;
        *state = BridgeState::Active;
        info!(
            device = %self.identity(),
            position = %derived.position,
            motion = %derived.motion,
            "bridge active"
        );
        Ok(derived)
    }

    /// Handle a payload received on one of this device's command topics.
    ///
    /// Returns once the gateway call is queued, not when it completes.
    /// Every error is logged here.
    pub async fn handle_command(&self, kind: EntityKind, payload: &[u8]) -> Result<(), BridgeError> {
        let state = self.state.read().await;
        if *state != BridgeState::Active {
            let e = BridgeError::NotRegistered(self.identity().to_string());
            warn!(device = %self.identity(), state = ?*state, error = %e, "command rejected");
            return Err(e);
        }

        let action = match self.parse(kind, payload) {
            Ok(action) => action,
            Err(e) => {
                error!(device = %self.identity(), ?kind, error = %e, "unknown command");
                return Err(e);
            }
        };
        debug!(device = %self.identity(), command = action.name(), "command received");

        let node = self.publisher.node.clone();
        let throttle = self.throttle.clone();
        let label = format!("{}/{}", self.identity(), action.name());
        let job = async move {
            // Failures are logged by the throttle; the gateway's own event
            // remains the source of truth for state.
            let _ = throttle
                .run(&label, move || async move { node.execute(action).await })
                .await;
        }
        .boxed();

        let submitted = match lock(&self.jobs).as_ref() {
            Some(jobs) => jobs.submit(job),
            None => Err(BridgeError::PoolClosed),
        };
        if let Err(ref e) = submitted {
            error!(device = %self.identity(), command = action.name(), error = %e, "command not queued");
        }
        submitted
    }

    fn parse(&self, kind: EntityKind, payload: &[u8]) -> Result<GatewayAction, BridgeError> {
        Ok(match kind {
            EntityKind::Cover => self.orientation().action_for(CoverCommand::parse(payload)?),
            // Both limits at the gateway's fully-open value keep the
            // device from closing.
            EntityKind::LimitSwitch => match SwitchCommand::parse(payload)? {
                SwitchCommand::On => GatewayAction::SetLimits {
                    min: Percent::MIN,
                    max: Percent::MIN,
                },
                SwitchCommand::Off => GatewayAction::ClearLimits,
            },
        })
    }

    /// Schedule a state publish.  Never blocks; bursts collapse into one
    /// pending update.
    pub fn notify_changed(&self) {
        if let Some(tx) = lock(&self.updates).as_ref() {
            match tx.try_send(()) {
                Ok(()) => {}
                Err(mpsc::error::TrySendError::Full(())) => {
                    debug!(device = %self.identity(), "update already pending");
                }
                Err(mpsc::error::TrySendError::Closed(())) => {}
            }
        }
    }

    /// `* → Closed`.  Idempotent.
    pub async fn close(&self) -> Result<(), BridgeError> {
        let previous = {
            let mut state = self.state.write().await;
            std::mem::replace(&mut *state, BridgeState::Closed)
        };
        if previous == BridgeState::Closed {
            return Ok(());
        }

        lock(&self.jobs).take();
        lock(&self.updates).take();
        let updater = lock(&self.updater).take();
        if let Some(handle) = updater {
            if let Err(e) = handle.await {
                warn!(device = %self.identity(), error = %e, "state updater ended abnormally");
            }
        }

        let result = self.publisher.entities.close(self.publisher.bus.as_ref()).await;
        info!(device = %self.identity(), "bridge closed");
        result
    }
}

async fn run_updater(publisher: Arc<StatePublisher>, mut updates: mpsc::Receiver<()>) {
    while updates.recv().await.is_some() {
        if let Err(e) = publisher.publish().await {
            warn!(device = %publisher.identity, error = %e, "state publish failed");
        }
    }
    debug!(device = %publisher.identity, "state updater stopped");
}

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use vlxbridge_hal::{Gateway, SimGateway, SimNodeSpec};
    use vlxbridge_kernel::WorkerPool;
    use vlxbridge_middleware::LocalBus;
    use vlxbridge_types::{DeviceCategory, LimitState, MotionState};

    fn p(v: u8) -> Percent {
        Percent::new(v).unwrap()
    }

    struct Fixture {
        bus: Arc<LocalBus>,
        gateway: SimGateway,
        throttle: CommandThrottle,
        pool: WorkerPool,
    }

    impl Fixture {
        async fn new(spec: SimNodeSpec) -> Self {
            let gateway = SimGateway::builder().with_node(spec).build();
            gateway.connect().await.unwrap();
            Self {
                bus: Arc::new(LocalBus::default()),
                gateway,
                throttle: CommandThrottle::new(2),
                pool: WorkerPool::new(2, 16),
            }
        }

        fn bridge(&self, orientation: Orientation) -> DeviceBridge {
            self.bridge_with_settle(orientation, Duration::ZERO)
        }

        fn bridge_with_settle(&self, orientation: Orientation, settle_delay: Duration) -> DeviceBridge {
            let node = self.gateway.node(0).unwrap();
            DeviceBridge::new(
                "office",
                node,
                "window",
                orientation,
                BridgeContext {
                    bus: self.bus.clone(),
                    throttle: self.throttle.clone(),
                    jobs: self.pool.submitter(),
                    naming: Naming::default(),
                    settle_delay,
                },
            )
        }
    }

    async fn eventually(mut check: impl FnMut() -> bool) {
        for _ in 0..200 {
            if check() {
                return;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("condition not reached");
    }

    #[tokio::test]
    async fn commands_before_activation_are_rejected() {
        let fx = Fixture::new(SimNodeSpec::new("Office", DeviceCategory::Window)).await;
        let bridge = fx.bridge(Orientation::Normal);

        assert!(matches!(
            bridge.handle_command(EntityKind::Cover, b"CLOSE").await,
            Err(BridgeError::NotRegistered(_))
        ));
        bridge.register().await.unwrap();
        assert!(matches!(
            bridge.handle_command(EntityKind::Cover, b"CLOSE").await,
            Err(BridgeError::NotRegistered(_))
        ));
        assert_eq!(fx.gateway.node(0).unwrap().commands(), Vec::new());
    }

    #[tokio::test]
    async fn activation_publishes_initial_state() {
        let fx = Fixture::new(SimNodeSpec::new("Office", DeviceCategory::Window).at(p(30))).await;
        let bridge = fx.bridge(Orientation::Normal);
        bridge.register().await.unwrap();
        let derived = bridge.activate().await.unwrap();

        assert_eq!(derived.motion, MotionState::Open);
        let cover = &bridge.entities().cover;
        assert_eq!(fx.bus.retained(&cover.position_topic()).as_deref(), Some("30"));
        assert_eq!(fx.bus.retained(&cover.state_topic()).as_deref(), Some("open"));
        assert_eq!(
            fx.bus.retained(&bridge.entities().switch.state_topic()).as_deref(),
            Some(LimitState::Off.as_str())
        );
        assert_eq!(bridge.state().await, BridgeState::Active);
    }

    #[tokio::test]
    async fn inverted_bridge_swaps_open_and_close() {
        let fx = Fixture::new(SimNodeSpec::new("Terrace", DeviceCategory::Awning)).await;
        let bridge = fx.bridge(Orientation::Inverted);
        bridge.register().await.unwrap();
        bridge.activate().await.unwrap();

        bridge.handle_command(EntityKind::Cover, b"OPEN").await.unwrap();
        let node = fx.gateway.node(0).unwrap();
        eventually(|| node.command_count("close") == 1).await;
        assert_eq!(node.command_count("open"), 0);
    }

    #[tokio::test]
    async fn malformed_payload_never_reaches_gateway() {
        let fx = Fixture::new(SimNodeSpec::new("Office", DeviceCategory::Window)).await;
        let bridge = fx.bridge(Orientation::Normal);
        bridge.register().await.unwrap();
        bridge.activate().await.unwrap();
        let before = fx.bus.published().len();

        for payload in [&b"UNKNOWN"[..], b"-5", b"101", b"open", b""] {
            assert!(matches!(
                bridge.handle_command(EntityKind::Cover, payload).await,
                Err(BridgeError::MalformedCommand(_))
            ));
        }
        assert!(matches!(
            bridge.handle_command(EntityKind::LimitSwitch, b"on").await,
            Err(BridgeError::MalformedCommand(_))
        ));

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(fx.bus.published().len(), before);
        assert!(fx.gateway.node(0).unwrap().commands().is_empty());
    }

    #[tokio::test]
    async fn keep_open_sets_and_clears_limits() {
        let fx = Fixture::new(SimNodeSpec::new("Office", DeviceCategory::Window)).await;
        let bridge = fx.bridge(Orientation::Normal);
        bridge.register().await.unwrap();
        bridge.activate().await.unwrap();
        let node = fx.gateway.node(0).unwrap();

        bridge.handle_command(EntityKind::LimitSwitch, b"ON").await.unwrap();
        eventually(|| node.snapshot().limitation_max == Percent::MIN).await;
        bridge.handle_command(EntityKind::LimitSwitch, b"OFF").await.unwrap();
        eventually(|| node.snapshot().limitation_max == Percent::MAX).await;

        assert_eq!(
            node.commands(),
            vec![
                GatewayAction::SetLimits {
                    min: Percent::MIN,
                    max: Percent::MIN
                },
                GatewayAction::ClearLimits,
            ]
        );
    }

    #[tokio::test]
    async fn notifications_publish_latest_snapshot() {
        let fx = Fixture::new(SimNodeSpec::new("Office", DeviceCategory::Window)).await;
        let bridge = fx.bridge(Orientation::Normal);
        bridge.register().await.unwrap();
        bridge.activate().await.unwrap();
        let node = fx.gateway.node(0).unwrap();
        let state_topic = bridge.entities().cover.state_topic();

        node.simulate_move(Percent::MAX);
        for _ in 0..10 {
            bridge.notify_changed();
        }
        eventually(|| fx.bus.retained(&state_topic).as_deref() == Some("closed")).await;
        assert_eq!(
            fx.bus.retained(&bridge.entities().cover.position_topic()).as_deref(),
            Some("100")
        );
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 2)]
    async fn activation_and_update_publishes_do_not_interleave() {
        let fx = Fixture::new(SimNodeSpec::new("Office", DeviceCategory::Window)).await;
        let bridge = fx.bridge_with_settle(Orientation::Normal, Duration::from_millis(20));
        bridge.register().await.unwrap();
        let entities = bridge.entities().clone();

        // An early gateway event races the initial snapshot publish.
        fx.gateway.node(0).unwrap().simulate_move(Percent::MAX);
        bridge.notify_changed();
        bridge.activate().await.unwrap();
        eventually(|| fx.bus.published_to(&entities.switch.state_topic()).len() == 2).await;

        let order: Vec<String> = fx
            .bus
            .published()
            .into_iter()
            .map(|p| p.topic)
            .filter(|t| {
                *t == entities.cover.position_topic()
                    || *t == entities.cover.state_topic()
                    || *t == entities.switch.state_topic()
            })
            .collect();
        let one_update = [
            entities.cover.position_topic(),
            entities.cover.state_topic(),
            entities.switch.state_topic(),
        ];
        assert_eq!(order.len(), 6);
        assert_eq!(order[..3], one_update);
        assert_eq!(order[3..], one_update);
    }

    #[tokio::test]
    async fn close_is_idempotent_and_rejects_later_commands() {
        let fx = Fixture::new(SimNodeSpec::new("Office", DeviceCategory::Window)).await;
        let bridge = fx.bridge(Orientation::Normal);
        bridge.register().await.unwrap();
        bridge.activate().await.unwrap();

        bridge.close().await.unwrap();
        bridge.close().await.unwrap();
        assert_eq!(bridge.state().await, BridgeState::Closed);
        assert!(fx.bus.subscriptions().is_empty());
        assert!(matches!(
            bridge.handle_command(EntityKind::Cover, b"OPEN").await,
            Err(BridgeError::NotRegistered(_))
        ));
        // Late notifications are ignored.
        bridge.notify_changed();
    }
}
