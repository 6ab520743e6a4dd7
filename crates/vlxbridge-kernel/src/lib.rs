//! `vlxbridge-kernel` – Identity, Derivation & Command Flow
//!
//! The pure and concurrency-sensitive core of the bridge.  It never touches
//! the bus or the gateway directly; it decides names, states and when a
//! command is allowed to run.
//!
//! # Modules
//!
//! - [`identity`] – [`normalize`][identity::normalize] and
//!   [`IdentityTable`][identity::IdentityTable]: turns device names into
//!   bus-safe identities and refuses collisions.
//! - [`derivation`] – [`derive_motion`][derivation::derive_motion] and
//!   [`derive_limit`][derivation::derive_limit]: maps raw gateway positions
//!   to the state strings published on the bus.
//! - [`throttle`] – [`CommandThrottle`][throttle::CommandThrottle]:
//!   the process-wide gate every gateway command passes through, holding at
//!   most N commands in flight.
//! - [`worker`] – [`WorkerPool`][worker::WorkerPool]: bounded queue that
//!   keeps slow hardware calls off the bus delivery path.

pub mod derivation;
pub mod identity;
pub mod throttle;
pub mod worker;

pub use derivation::{DerivedState, derive, derive_limit, derive_motion};
pub use identity::{IdentityTable, normalize};
pub use throttle::CommandThrottle;
pub use worker::{Job, JobSubmitter, WorkerPool};
