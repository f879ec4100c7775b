//! # DTSN Common Crate
//!
//! Shared primitives for the DTSN calendar core.
//!
//! ## Modules
//! - `error`: core error kinds shared across services
//! - `config`: typed TOML configuration
//! - `crypto`: SHA-256 helpers and the minute-window HMAC scheme
//! - `merkle`: binary merkle trees and inclusion-proof operations
//! - `bus`: message bus abstraction + in-memory implementation
//! - `messages`: typed wire payloads for the bus queues
//! - `lock`: named TTL leases serializing calendar mutations
//! - `leader`: per-role leadership level signal
//! - `retry`: bounded exponential backoff for transient failures

pub mod bus;
pub mod config;
pub mod crypto;
pub mod error;
pub mod leader;
pub mod lock;
pub mod merkle;
pub mod messages;
pub mod retry;

pub use bus::{BusError, Delivery, MemoryBus, MessageBus};
pub use config::Config;
pub use error::CoreError;
pub use leader::LeaderState;
pub use lock::{LockLease, LockService, CALENDAR_LOCK_KEY};
pub use merkle::{HashOp, MerkleTree, ProofOp};

pub type Result<T> = std::result::Result<T, CoreError>;
