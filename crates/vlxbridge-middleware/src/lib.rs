//! `vlxbridge-middleware` – The Bus Side
//!
//! Routes messages between the bridge and the home-automation bus without
//! caring about their meaning.
//!
//! # Modules
//!
//! - [`bus`] – the [`MessageBus`] trait and an in-process [`LocalBus`]
//!   built on Tokio broadcast channels.
//! - [`mqtt`] – [`MqttBus`], the `rumqttc` transport with connect retry and
//!   resubscription after reconnect.
//! - [`discovery`] – Home Assistant discovery documents ([`Discovery`],
//!   [`HaDevice`]).

pub mod bus;
pub mod discovery;
pub mod mqtt;

pub use bus::{BusMessage, LocalBus, MessageBus, Published};
pub use discovery::{Discovery, HaDevice};
pub use mqtt::{MqttBus, MqttSettings};
