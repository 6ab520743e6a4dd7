//! `vlxbridge-hal` – The Gateway Side
//!
//! Abstracts the cover gateway behind two traits so the bridge never depends
//! on a particular controller session.
//!
//! # Modules
//!
//! - [`gateway`] – [`Gateway`] (session: connect, enumerate, events) and
//!   [`GatewayNode`] (per-node motion and limitation commands).
//! - [`sim`] – [`SimGateway`], a simulated KLF-200 with travel time,
//!   limitation and an optional silent-drop concurrency ceiling.

pub mod gateway;
pub mod sim;

pub use gateway::{Gateway, GatewayNode};
pub use sim::{SimGateway, SimGatewayBuilder, SimNode, SimNodeSpec};
