//! Per-role leadership level signal.
//!
//! Exactly one process in the cluster holds each role at a time; which one
//! may change whenever the election backend decides. Consumers must read
//! `is_leader` fresh on every tick and never cache the answer across an
//! await point.

use parking_lot::RwLock;
use std::collections::HashSet;
use tracing::info;

/// Role owning the calendar write path.
pub const ROLE_CALENDAR: &str = "calendar";
/// Role producing audit challenges and rounds.
pub const ROLE_AUDIT_PRODUCER: &str = "audit-producer";

/// Current leadership of this process, as a level signal.
///
/// Single-process deployments grant all roles at startup; a cluster
/// election backend flips roles through `grant`/`revoke` as leadership
/// moves.
pub struct LeaderState {
    roles: RwLock<HashSet<String>>,
}

impl LeaderState {
    /// No roles held.
    pub fn new() -> Self {
        LeaderState {
            roles: RwLock::new(HashSet::new()),
        }
    }

    /// Holding the given roles from the start (single-process wiring).
    pub fn holding(roles: &[&str]) -> Self {
        LeaderState {
            roles: RwLock::new(roles.iter().map(|r| r.to_string()).collect()),
        }
    }

    /// Level read; call per tick, never cache across awaits.
    pub fn is_leader(&self, role: &str) -> bool {
        self.roles.read().contains(role)
    }

    pub fn grant(&self, role: &str) {
        if self.roles.write().insert(role.to_string()) {
            info!(role, "leadership gained");
        }
    }

    pub fn revoke(&self, role: &str) {
        if self.roles.write().remove(role) {
            info!(role, "leadership lost");
        }
    }
}

impl Default for LeaderState {
    fn default() -> Self {
        Self::new()
    }
}
