//! # DTSN Node Crate
//!
//! Service wiring: the HTTP registry surface and the inbound dispatcher
//! that feeds the calendar, anchor, and reward engines.

pub mod api;
pub mod dispatch;

pub use api::{router, AppState};
pub use dispatch::InboundDispatcher;
