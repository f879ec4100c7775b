//! Typed TOML configuration with env overrides for deployment secrets.
//!
//! The file carries everything that differs between stacks; the signing
//! secret and token-service URI may instead arrive through `DTSN_SIGNING_SECRET`
//! and `DTSN_TOKEN_URI` so they never land on disk.

use serde::Deserialize;
use std::fs;
use std::path::Path;

use crate::error::CoreError;

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct Config {
    /// Opaque identifier of the writing deployment; stamped into every block.
    pub stack_id: String,

    /// Data directory for the block store and registry databases.
    pub data_dir: String,

    /// Bind address for the HTTP registry surface.
    pub bind_addr: String,

    /// Base64-encoded 32-byte Ed25519 signing secret.
    /// Overridden by `DTSN_SIGNING_SECRET` when set.
    pub signing_secret: Option<String>,

    /// Base URI of the external token service.
    /// Overridden by `DTSN_TOKEN_URI` when set.
    pub token_service_uri: String,

    /// Static IP blacklist served to nodes (may be empty).
    pub blacklist: Vec<String>,

    pub calendar: CalendarConfig,
    pub audit: AuditConfig,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct CalendarConfig {
    /// Seconds between calendar aggregation ticks.
    pub tick_secs: u64,
    /// Lock lease TTL in seconds.
    pub lock_ttl_secs: u64,
}

#[derive(Debug, Deserialize, Clone)]
#[serde(default)]
pub struct AuditConfig {
    /// Seconds between challenge generations.
    pub challenge_interval_secs: u64,
    /// Seconds between audit rounds.
    pub round_interval_secs: u64,
    /// Seconds an audit-log row is retained before pruning.
    pub prune_retention_secs: u64,
    /// Rows deleted per prune batch.
    pub prune_batch: usize,
    /// Minimum node credit balance to pass the credit predicate.
    pub min_credit: i64,
    /// Minimum node version accepted at registration.
    pub min_version_new: String,
    /// Minimum node version accepted at update / audit.
    pub min_version_existing: String,
    /// Minimum on-chain token balance, in grains.
    pub min_balance_grains: u64,
    /// Hard cap on registered nodes.
    pub registration_cap: u64,
    /// Credit balance nodes are topped off to once per day.
    pub daily_credit_topoff: i64,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            stack_id: "dtsn-stack-a".to_string(),
            data_dir: "./data".to_string(),
            bind_addr: "127.0.0.1:8080".to_string(),
            signing_secret: None,
            token_service_uri: "http://127.0.0.1:8085".to_string(),
            blacklist: Vec::new(),
            calendar: CalendarConfig::default(),
            audit: AuditConfig::default(),
        }
    }
}

impl Default for CalendarConfig {
    fn default() -> Self {
        CalendarConfig {
            tick_secs: 10,
            lock_ttl_secs: 15,
        }
    }
}

impl Default for AuditConfig {
    fn default() -> Self {
        AuditConfig {
            challenge_interval_secs: 3600,
            round_interval_secs: 1800,
            prune_retention_secs: 6 * 3600,
            prune_batch: 500,
            min_credit: 10,
            min_version_new: "1.4.0".to_string(),
            min_version_existing: "1.2.0".to_string(),
            min_balance_grains: 500_000_000_000,
            registration_cap: 6000,
            daily_credit_topoff: 86_400,
        }
    }
}

impl Config {
    /// Load config from a TOML file path, then apply env overrides.
    /// A missing file or a parse failure is a fatal misconfiguration.
    pub fn load_from_file(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let s = fs::read_to_string(path.as_ref())
            .map_err(|e| CoreError::Fatal(format!("cannot read config: {}", e)))?;
        let mut cfg: Config = toml::from_str(&s)
            .map_err(|e| CoreError::Fatal(format!("cannot parse config: {}", e)))?;
        cfg.apply_env();
        Ok(cfg)
    }

    /// Apply environment-variable overrides in place.
    pub fn apply_env(&mut self) {
        if let Ok(secret) = std::env::var("DTSN_SIGNING_SECRET") {
            self.signing_secret = Some(secret);
        }
        if let Ok(uri) = std::env::var("DTSN_TOKEN_URI") {
            self.token_service_uri = uri;
        }
    }
}
