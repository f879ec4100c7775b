//! # DTSN Audit Crate
//!
//! Node auditing and rewards around the calendar core.
//!
//! ## Modules
//! - `registry`: durable node table, audit log, registration/update contract
//! - `challenge`: time-bound merkle challenges over the calendar
//! - `engine`: audit rounds, per-node predicate evaluation, pruning
//! - `reward`: token payouts recorded as `reward` blocks
//! - `client`: audit-time HTTP client for participant nodes
//! - `token`: token-service client (balance reads, transfers)

pub mod challenge;
pub mod client;
pub mod engine;
pub mod registry;
pub mod reward;
pub mod token;

pub use challenge::{AuditChallenge, ChallengeManager};
pub use client::{HttpNodeClient, MockNodeClient, NodeAuditReport, NodeClient};
pub use engine::AuditEngine;
pub use registry::{AuditRow, NodeRegistry, RegisteredNode, RegistryStore};
pub use reward::RewardEngine;
pub use token::{HttpTokenService, MockTokenService, TokenService};
