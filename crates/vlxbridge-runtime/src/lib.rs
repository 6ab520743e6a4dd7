//! `vlxbridge-runtime` – Device bridges and process wiring
//!
//! Ties the gateway abstraction (`vlxbridge-hal`) to the message bus
//! (`vlxbridge-middleware`) through the kernel's identity, derivation and
//! throttling primitives.
//!
//! # Modules
//!
//! - [`entity`] – [`EntitySet`][entity::EntitySet]: the cover and "keep open"
//!   switch announced for every device, plus topic [`Naming`][entity::Naming].
//! - [`device_bridge`] – [`DeviceBridge`][device_bridge::DeviceBridge]:
//!   per-device lifecycle (register, activate, close), command handling and
//!   coalesced state publication.
//! - [`registry`] – [`BridgeRegistry`][registry::BridgeRegistry]: enumerates
//!   gateway nodes, claims identities, routes bus commands and gateway events
//!   to bridges, and tears everything down in order.
//! - [`telemetry`] – [`init_tracing`][telemetry::init_tracing]:
//!   initialises the global `tracing` subscriber with an optional log file
//!   and an optional OTLP span exporter.
//!
//! # Command path
//!
//! Every hardware command leaves through the shared
//! [`CommandThrottle`][vlxbridge_kernel::CommandThrottle], executed on the
//! [`WorkerPool`][vlxbridge_kernel::WorkerPool] so the bus event loop never
//! waits on a motor.

pub mod device_bridge;
pub mod entity;
pub mod registry;
pub mod telemetry;

pub use device_bridge::{BridgeContext, BridgeState, DeviceBridge};
pub use entity::{EntityKind, EntitySet, Naming};
pub use registry::{BridgeRegistry, RegistrySettings};
pub use telemetry::{LogSettings, TelemetryGuard, init_tracing};
