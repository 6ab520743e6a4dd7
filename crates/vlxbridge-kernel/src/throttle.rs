//! [`CommandThrottle`] – the single gate every gateway command passes through.
//!
//! The gateway only accepts a small, fixed number of simultaneous motion
//! commands and silently drops the rest.  The throttle holds one permit per
//! in-flight command; a permit is an RAII guard, so it is returned when the
//! operation succeeds, fails, panics its task or is cancelled.
//!
//! One throttle instance is created by the registry and cloned into every
//! device bridge; clones share the same permits.

use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::{OwnedSemaphorePermit, Semaphore};
use tracing::{debug, error};
use vlxbridge_types::BridgeError;

/// Bounded-concurrency gate for gateway commands.
///
/// # Example
///
/// ```
/// # #[tokio::main(flavor = "current_thread")]
/// # async fn main() {
/// use vlxbridge_kernel::throttle::CommandThrottle;
///
/// let throttle = CommandThrottle::new(2);
/// throttle.run("office/close", || async { Ok(()) }).await.unwrap();
/// assert_eq!(throttle.in_flight(), 0);
/// # }
/// ```
#[derive(Clone, Debug)]
pub struct CommandThrottle {
    semaphore: Arc<Semaphore>,
    permits: usize,
    acquire_timeout: Option<Duration>,
}

impl CommandThrottle {
    /// Create a throttle allowing `permits` concurrent operations.
    ///
    /// A value of zero is raised to one; a throttle that never admits
    /// anything would stall every command.
    pub fn new(permits: usize) -> Self {
        let permits = permits.max(1);
        Self {
            semaphore: Arc::new(Semaphore::new(permits)),
            permits,
            acquire_timeout: None,
        }
    }

    /// Give up waiting for a permit after `timeout`.  The operation is then
    /// never invoked and [`BridgeError::ThrottleTimeout`] is returned.
    pub fn with_acquire_timeout(mut self, timeout: Duration) -> Self {
        self.acquire_timeout = Some(timeout);
        self
    }

    /// Maximum number of concurrent operations.
    pub fn capacity(&self) -> usize {
        self.permits
    }

    /// Number of operations currently holding a permit.
    pub fn in_flight(&self) -> usize {
        self.permits - self.semaphore.available_permits()
    }

    /// Run `operation` exactly once while holding a permit.
    ///
    /// Waits for a permit first (bounded by the optional acquire timeout).
    /// Errors from the operation are logged here and handed back so callers
    /// can count them; they never escape as panics.
    pub async fn run<F, Fut>(&self, label: &str, operation: F) -> Result<(), BridgeError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<(), BridgeError>>,
    {
        let _permit = match self.acquire().await {
            Ok(permit) => permit,
            Err(e) => {
                error!(command = label, error = %e, "command not issued");
                return Err(e);
            }
        };
        debug!(command = label, in_flight = self.in_flight(), "command permit acquired");

        let result = operation().await;
        if let Err(ref e) = result {
            error!(command = label, error = %e, "command failed");
        }
        result
    }

    async fn acquire(&self) -> Result<OwnedSemaphorePermit, BridgeError> {
        let acquire = self.semaphore.clone().acquire_owned();
        let permit = match self.acquire_timeout {
            Some(timeout) => tokio::time::timeout(timeout, acquire)
                .await
                .map_err(|_| BridgeError::ThrottleTimeout(timeout.as_millis() as u64))?,
            None => acquire.await,
        };
        permit.map_err(|_| BridgeError::Gateway("command throttle closed".to_string()))
    }
}
