//! # DTSN Calendar Crate
//!
//! The calendar block engine: an append-only, hash-chained, signed block
//! log plus the state machines that feed it.
//!
//! ## Modules
//! - `block`: block structure and hash construction
//! - `store`: LMDB-backed append-only block store
//! - `signer`: Ed25519 block signatures with fingerprint prefixes
//! - `append`: the shared hash-sign-append path with retry
//! - `genesis`: first-startup genesis block
//! - `writer`: the 10 s calendar aggregation tick
//! - `anchor`: bitcoin anchor submission, tx pre-processing, confirmation

pub mod anchor;
pub mod append;
pub mod block;
pub mod genesis;
pub mod signer;
pub mod store;
pub mod writer;

pub use anchor::AnchorEngine;
pub use append::{BlockAppender, DataId};
pub use block::{Block, BlockType, BLOCK_VERSION, ZERO_HASH};
pub use genesis::ensure_genesis;
pub use signer::{verify_signature_field, Signer};
pub use store::{BlockStore, StoreError};
pub use writer::CalendarWriter;
