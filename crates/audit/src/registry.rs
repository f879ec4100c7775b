//! Node registry: the durable table of participant nodes.
//!
//! LMDB layout:
//!
//! - `nodes`: lowercased `tnt_addr` -> bincode [`RegisteredNode`]
//! - `uris`: `public_uri` -> `tnt_addr` (uniqueness index)
//! - `audit_log`: big-endian ms timestamp + addr -> bincode [`AuditRow`];
//!   the time-prefixed key makes retention pruning a forward cursor walk
//! - `meta`: challenge cache and the daily top-off marker
//!
//! [`RegistryStore`] is the storage layer; [`NodeRegistry`] layers the
//! registration/update contract on top (caps, uniqueness, HMAC window,
//! balance threshold) and is what the HTTP surface calls.

use chrono::Utc;
use lmdb::{Cursor, Database, DatabaseFlags, Environment, Transaction as LmdbTxn, WriteFlags};
use rand::seq::SliceRandom;
use rand::RngCore;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;
use std::path::Path;
use std::str::FromStr;
use std::sync::Arc;
use tracing::{info, warn};

use dtsn_common::config::AuditConfig;
use dtsn_common::crypto::verify_update_hmac;
use dtsn_common::error::CoreError;

use crate::token::TokenService;

const KEY_LAST_TOPOFF_DAY: &[u8] = b"last_topoff_day";
pub(crate) const KEY_CURRENT_CHALLENGE: &[u8] = b"current_challenge";

/// One registered node, keyed by its token address.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RegisteredNode {
    /// Lowercased `0x` + 40 hex token address.
    pub tnt_addr: String,
    pub public_uri: Option<String>,
    /// 32-byte hex key for the minute-window HMAC.
    pub hmac_key: String,
    pub tnt_credit: i64,
    pub pass_count: u64,
    pub fail_count: u64,
    pub consecutive_passes: u64,
    pub consecutive_fails: u64,
    /// Reputation counter, never below zero.
    pub audit_score: i64,
    pub created_at: u64,
    pub updated_at: u64,
}

/// Outcome of the eight audit predicates for one node at one time.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditRow {
    pub tnt_addr: String,
    pub audit_at_ms: u64,
    /// The node answered its audit endpoint at all. When false every other
    /// predicate is false as well.
    pub reachable: bool,
    pub public_ip_pass: bool,
    pub public_uri_pass: bool,
    pub time_pass: bool,
    pub cal_state_pass: bool,
    pub min_credits_pass: bool,
    pub node_version_pass: bool,
    pub tnt_balance_pass: bool,
}

impl AuditRow {
    pub fn all_pass(&self) -> bool {
        self.reachable
            && self.public_ip_pass
            && self.public_uri_pass
            && self.time_pass
            && self.cal_state_pass
            && self.min_credits_pass
            && self.node_version_pass
            && self.tnt_balance_pass
    }
}

// ════════════════════════════════════════════════════════════════════════════
// STORAGE LAYER
// ════════════════════════════════════════════════════════════════════════════

#[derive(Clone)]
pub struct RegistryStore {
    env: Arc<Environment>,
    db_nodes: Database,
    db_uris: Database,
    db_audit_log: Database,
    db_meta: Database,
}

impl RegistryStore {
    pub fn open(path: impl AsRef<Path>) -> Result<Self, CoreError> {
        let p = path.as_ref();
        std::fs::create_dir_all(p)
            .map_err(|e| CoreError::Fatal(format!("registry dir: {}", e)))?;

        let env = Environment::new()
            .set_max_dbs(4)
            .set_map_size(1_000_000_000usize)
            .open(p)
            .map_err(store_err)?;

        let db_nodes = env.create_db(Some("nodes"), DatabaseFlags::empty()).map_err(store_err)?;
        let db_uris = env.create_db(Some("uris"), DatabaseFlags::empty()).map_err(store_err)?;
        let db_audit_log = env
            .create_db(Some("audit_log"), DatabaseFlags::empty())
            .map_err(store_err)?;
        let db_meta = env.create_db(Some("meta"), DatabaseFlags::empty()).map_err(store_err)?;

        Ok(RegistryStore {
            env: Arc::new(env),
            db_nodes,
            db_uris,
            db_audit_log,
            db_meta,
        })
    }

    pub fn get(&self, tnt_addr: &str) -> Result<Option<RegisteredNode>, CoreError> {
        let rtxn = self.env.begin_ro_txn().map_err(store_err)?;
        match rtxn.get(self.db_nodes, &tnt_addr.as_bytes()) {
            Ok(v) => Ok(Some(bincode::deserialize(v).map_err(codec_err)?)),
            Err(lmdb::Error::NotFound) => Ok(None),
            Err(e) => Err(store_err(e)),
        }
    }

    pub fn addr_for_uri(&self, uri: &str) -> Result<Option<String>, CoreError> {
        let rtxn = self.env.begin_ro_txn().map_err(store_err)?;
        match rtxn.get(self.db_uris, &uri.as_bytes()) {
            Ok(v) => Ok(Some(String::from_utf8_lossy(v).into_owned())),
            Err(lmdb::Error::NotFound) => Ok(None),
            Err(e) => Err(store_err(e)),
        }
    }

    /// Insert or replace a node, keeping the URI index in step, in one
    /// transaction. `old_uri` is the previously indexed URI, if any.
    pub fn put(&self, node: &RegisteredNode, old_uri: Option<&str>) -> Result<(), CoreError> {
        let blob = bincode::serialize(node).map_err(codec_err)?;
        let mut wtxn = self.env.begin_rw_txn().map_err(store_err)?;
        wtxn.put(self.db_nodes, &node.tnt_addr.as_bytes(), &blob, WriteFlags::empty())
            .map_err(store_err)?;
        if let Some(old) = old_uri {
            if node.public_uri.as_deref() != Some(old) {
                match wtxn.del(self.db_uris, &old.as_bytes(), None) {
                    Ok(_) | Err(lmdb::Error::NotFound) => {}
                    Err(e) => return Err(store_err(e)),
                }
            }
        }
        if let Some(uri) = &node.public_uri {
            wtxn.put(self.db_uris, &uri.as_bytes(), &node.tnt_addr.as_bytes(), WriteFlags::empty())
                .map_err(store_err)?;
        }
        wtxn.commit().map_err(store_err)?;
        Ok(())
    }

    pub fn count(&self) -> Result<u64, CoreError> {
        let rtxn = self.env.begin_ro_txn().map_err(store_err)?;
        let mut cursor = rtxn.open_ro_cursor(self.db_nodes).map_err(store_err)?;
        Ok(cursor.iter().count() as u64)
    }

    pub fn all(&self) -> Result<Vec<RegisteredNode>, CoreError> {
        let rtxn = self.env.begin_ro_txn().map_err(store_err)?;
        let mut cursor = rtxn.open_ro_cursor(self.db_nodes).map_err(store_err)?;
        let mut out = Vec::new();
        for (_k, v) in cursor.iter() {
            out.push(bincode::deserialize(v).map_err(codec_err)?);
        }
        Ok(out)
    }

    /// Nodes with a positive audit score.
    pub fn active_count(&self) -> Result<u64, CoreError> {
        Ok(self.all()?.iter().filter(|n| n.audit_score > 0).count() as u64)
    }

    /// Uniform sample of nodes with at least one consecutive pass.
    pub fn random_healthy(&self, n: usize) -> Result<Vec<RegisteredNode>, CoreError> {
        let healthy: Vec<RegisteredNode> = self
            .all()?
            .into_iter()
            .filter(|node| node.consecutive_passes > 0)
            .collect();
        let mut rng = rand::thread_rng();
        Ok(healthy.choose_multiple(&mut rng, n).cloned().collect())
    }

    /// Decrement `audit_score` (floored at zero) for every node without a
    /// public URI. Runs once per audit round.
    pub fn decay_uriless_scores(&self) -> Result<u64, CoreError> {
        let mut changed = 0u64;
        for mut node in self.all()? {
            if node.public_uri.is_none() && node.audit_score > 0 {
                node.audit_score -= 1;
                self.put(&node, None)?;
                changed += 1;
            }
        }
        Ok(changed)
    }

    /// Fold one audit outcome into the node's aggregate counters.
    ///
    /// A full pass bumps `audit_score` by one; any failure drops it by one,
    /// floored at zero. Consecutive counters reset on the opposite outcome.
    pub fn apply_audit_outcome(&self, tnt_addr: &str, all_pass: bool) -> Result<(), CoreError> {
        let Some(mut node) = self.get(tnt_addr)? else {
            return Ok(()); // node deregistered mid-audit
        };
        if all_pass {
            node.pass_count += 1;
            node.consecutive_passes += 1;
            node.consecutive_fails = 0;
            node.audit_score += 1;
        } else {
            node.fail_count += 1;
            node.consecutive_fails += 1;
            node.consecutive_passes = 0;
            node.audit_score = (node.audit_score - 1).max(0);
        }
        self.put(&node, None)
    }

    // ────────────────────────────────────────────────────────────────────
    // audit log
    // ────────────────────────────────────────────────────────────────────

    fn audit_key(audit_at_ms: u64, tnt_addr: &str) -> Vec<u8> {
        let mut key = audit_at_ms.to_be_bytes().to_vec();
        key.extend_from_slice(tnt_addr.as_bytes());
        key
    }

    pub fn record_audit(&self, row: &AuditRow) -> Result<(), CoreError> {
        let blob = bincode::serialize(row).map_err(codec_err)?;
        let mut wtxn = self.env.begin_rw_txn().map_err(store_err)?;
        wtxn.put(
            self.db_audit_log,
            &Self::audit_key(row.audit_at_ms, &row.tnt_addr),
            &blob,
            WriteFlags::empty(),
        )
        .map_err(store_err)?;
        wtxn.commit().map_err(store_err)?;
        Ok(())
    }

    /// Most recent audit row for one node.
    pub fn last_audit(&self, tnt_addr: &str) -> Result<Option<AuditRow>, CoreError> {
        let rtxn = self.env.begin_ro_txn().map_err(store_err)?;
        let mut cursor = rtxn.open_ro_cursor(self.db_audit_log).map_err(store_err)?;
        let mut last = None;
        for (_k, v) in cursor.iter() {
            let row: AuditRow = bincode::deserialize(v).map_err(codec_err)?;
            if row.tnt_addr == tnt_addr {
                last = Some(row);
            }
        }
        Ok(last)
    }

    /// Delete audit rows older than `cutoff_ms`, at most `batch` per call.
    /// Returns the number removed; callers loop until it returns zero.
    pub fn prune_audits(&self, cutoff_ms: u64, batch: usize) -> Result<usize, CoreError> {
        let mut wtxn = self.env.begin_rw_txn().map_err(store_err)?;
        let mut doomed = Vec::new();
        {
            let mut cursor = wtxn.open_rw_cursor(self.db_audit_log).map_err(store_err)?;
            for (k, _v) in cursor.iter() {
                if k.len() < 8 {
                    continue;
                }
                let mut arr = [0u8; 8];
                arr.copy_from_slice(&k[..8]);
                if u64::from_be_bytes(arr) >= cutoff_ms {
                    break; // keys are time-ordered
                }
                doomed.push(k.to_vec());
                if doomed.len() >= batch {
                    break;
                }
            }
        }
        for key in &doomed {
            match wtxn.del(self.db_audit_log, key, None) {
                Ok(_) | Err(lmdb::Error::NotFound) => {}
                Err(e) => return Err(store_err(e)),
            }
        }
        wtxn.commit().map_err(store_err)?;
        Ok(doomed.len())
    }

    // ────────────────────────────────────────────────────────────────────
    // meta
    // ────────────────────────────────────────────────────────────────────

    pub(crate) fn put_meta(&self, key: &[u8], value: &[u8]) -> Result<(), CoreError> {
        let mut wtxn = self.env.begin_rw_txn().map_err(store_err)?;
        wtxn.put(self.db_meta, &key, &value, WriteFlags::empty())
            .map_err(store_err)?;
        wtxn.commit().map_err(store_err)?;
        Ok(())
    }

    pub(crate) fn get_meta(&self, key: &[u8]) -> Result<Option<Vec<u8>>, CoreError> {
        let rtxn = self.env.begin_ro_txn().map_err(store_err)?;
        match rtxn.get(self.db_meta, &key) {
            Ok(v) => Ok(Some(v.to_vec())),
            Err(lmdb::Error::NotFound) => Ok(None),
            Err(e) => Err(store_err(e)),
        }
    }

    /// Top up every node's credit to `floor` once per UTC day.
    /// Returns the number of nodes topped off, zero when already done today.
    pub fn daily_credit_topoff(&self, floor: i64, today: u64) -> Result<u64, CoreError> {
        if let Some(bytes) = self.get_meta(KEY_LAST_TOPOFF_DAY)? {
            if bytes.len() == 8 && u64::from_be_bytes(bytes.try_into().unwrap_or([0; 8])) >= today {
                return Ok(0);
            }
        }
        let mut topped = 0u64;
        for mut node in self.all()? {
            if node.tnt_credit < floor {
                node.tnt_credit = floor;
                self.put(&node, None)?;
                topped += 1;
            }
        }
        self.put_meta(KEY_LAST_TOPOFF_DAY, &today.to_be_bytes())?;
        info!(topped, "daily credit top-off complete");
        Ok(topped)
    }
}

fn store_err(e: lmdb::Error) -> CoreError {
    CoreError::DependencyUnavailable(format!("registry store: {}", e))
}

fn codec_err(e: bincode::Error) -> CoreError {
    CoreError::Fatal(format!("registry codec: {}", e))
}

// ════════════════════════════════════════════════════════════════════════════
// REGISTRATION / UPDATE CONTRACT
// ════════════════════════════════════════════════════════════════════════════

pub struct NodeRegistry {
    store: RegistryStore,
    token: Arc<dyn TokenService>,
    cfg: AuditConfig,
}

impl NodeRegistry {
    pub fn new(store: RegistryStore, token: Arc<dyn TokenService>, cfg: AuditConfig) -> Self {
        NodeRegistry { store, token, cfg }
    }

    pub fn store(&self) -> &RegistryStore {
        &self.store
    }

    /// Register a new node. Returns the stored record including the fresh
    /// HMAC key; this is the only time the key leaves the registry.
    pub async fn create(
        &self,
        tnt_addr: &str,
        public_uri: Option<&str>,
        version: &str,
    ) -> Result<RegisteredNode, CoreError> {
        require_version(version, &self.cfg.min_version_new)?;
        let addr = normalize_addr(tnt_addr)?;
        let uri = public_uri.map(validate_public_uri).transpose()?;

        if self.store.count()? >= self.cfg.registration_cap {
            return Err(CoreError::CapacityExceeded("registration cap reached".into()));
        }
        if self.store.get(&addr)?.is_some() {
            return Err(CoreError::Conflict(format!("address {} already registered", addr)));
        }
        if let Some(u) = &uri {
            if self.store.addr_for_uri(u)?.is_some() {
                return Err(CoreError::Conflict(format!("uri {} already registered", u)));
            }
        }

        let balance = self.token.balance(&addr).await?;
        if balance < self.cfg.min_balance_grains {
            return Err(CoreError::CapacityExceeded(format!(
                "insufficient balance: {} < {}",
                balance, self.cfg.min_balance_grains
            )));
        }

        // the balance call suspended; the cap re-check is the
        // authoritative gate
        if self.store.count()? >= self.cfg.registration_cap {
            return Err(CoreError::CapacityExceeded("registration cap reached".into()));
        }

        let now = Utc::now().timestamp() as u64;
        let node = RegisteredNode {
            tnt_addr: addr.clone(),
            public_uri: uri,
            hmac_key: fresh_hmac_key(),
            tnt_credit: self.cfg.daily_credit_topoff,
            pass_count: 0,
            fail_count: 0,
            consecutive_passes: 0,
            consecutive_fails: 0,
            audit_score: 0,
            created_at: now,
            updated_at: now,
        };
        self.store.put(&node, None)?;
        info!(tnt_addr = %addr, "node registered");
        Ok(node)
    }

    /// Update an existing node's URI after HMAC authentication.
    pub async fn update(
        &self,
        tnt_addr: &str,
        public_uri: Option<&str>,
        hmac: &str,
        version: &str,
    ) -> Result<RegisteredNode, CoreError> {
        require_version(version, &self.cfg.min_version_existing)?;
        let addr = normalize_addr(tnt_addr)?;
        let mut node = self
            .store
            .get(&addr)?
            .ok_or_else(|| CoreError::NotFound(format!("unknown node {}", addr)))?;

        let uri = public_uri.map(validate_public_uri).transpose()?;
        let uri_for_mac = uri.clone().unwrap_or_default();
        if !verify_update_hmac(&node.hmac_key, &addr, &uri_for_mac, hmac, Utc::now()) {
            warn!(tnt_addr = %addr, "node update rejected: bad hmac");
            return Err(CoreError::AuthFailure("invalid authentication hmac".into()));
        }

        if let Some(u) = &uri {
            match self.store.addr_for_uri(u)? {
                Some(owner) if owner != addr => {
                    return Err(CoreError::Conflict(format!("uri {} already registered", u)));
                }
                _ => {}
            }
        }

        let balance = self.token.balance(&addr).await?;
        if balance < self.cfg.min_balance_grains {
            return Err(CoreError::CapacityExceeded(format!(
                "insufficient balance: {} < {}",
                balance, self.cfg.min_balance_grains
            )));
        }

        let old_uri = node.public_uri.clone();
        node.public_uri = uri;
        node.updated_at = Utc::now().timestamp() as u64;
        self.store.put(&node, old_uri.as_deref())?;
        info!(tnt_addr = %addr, "node updated");
        Ok(node)
    }
}

// ════════════════════════════════════════════════════════════════════════════
// VALIDATION
// ════════════════════════════════════════════════════════════════════════════

/// Lowercase and validate a `0x` + 40 hex token address.
pub fn normalize_addr(raw: &str) -> Result<String, CoreError> {
    let addr = raw.trim().to_lowercase();
    let hex_part = addr
        .strip_prefix("0x")
        .ok_or_else(|| CoreError::Validation("address must start with 0x".into()))?;
    if hex_part.len() != 40 || !hex_part.bytes().all(|b| b.is_ascii_hexdigit()) {
        return Err(CoreError::Validation("address must be 40 hex characters".into()));
    }
    Ok(addr)
}

/// A node URI must be absolute HTTP(S), host a bare public IP, no
/// loopback/private/unspecified addresses.
pub fn validate_public_uri(raw: &str) -> Result<String, CoreError> {
    let url = reqwest::Url::parse(raw)
        .map_err(|e| CoreError::Validation(format!("invalid uri: {}", e)))?;
    match url.scheme() {
        "http" | "https" => {}
        other => {
            return Err(CoreError::Validation(format!("unsupported scheme: {}", other)));
        }
    }
    let host = url
        .host_str()
        .ok_or_else(|| CoreError::Validation("uri has no host".into()))?;
    let ip = IpAddr::from_str(host)
        .map_err(|_| CoreError::Validation("uri host must be a bare ip".into()))?;
    let public = match ip {
        IpAddr::V4(v4) => {
            !v4.is_loopback() && !v4.is_private() && !v4.is_unspecified() && !v4.is_link_local()
        }
        IpAddr::V6(v6) => !v6.is_loopback() && !v6.is_unspecified(),
    };
    if !public {
        return Err(CoreError::Validation(format!("uri host {} is not public", ip)));
    }
    Ok(raw.trim_end_matches('/').to_string())
}

fn require_version(version: &str, minimum: &str) -> Result<(), CoreError> {
    if !version_gte(version, minimum) {
        return Err(CoreError::UpgradeRequired(format!(
            "node version {} below minimum {}",
            version, minimum
        )));
    }
    Ok(())
}

/// Dotted numeric version comparison; missing segments count as zero.
pub fn version_gte(version: &str, minimum: &str) -> bool {
    let parse = |s: &str| -> Vec<u64> {
        s.trim()
            .split('.')
            .map(|part| part.parse::<u64>().unwrap_or(0))
            .collect()
    };
    let v = parse(version);
    let m = parse(minimum);
    for i in 0..v.len().max(m.len()) {
        let a = v.get(i).copied().unwrap_or(0);
        let b = m.get(i).copied().unwrap_or(0);
        if a != b {
            return a > b;
        }
    }
    true
}

fn fresh_hmac_key() -> String {
    let mut key = [0u8; 32];
    rand::thread_rng().fill_bytes(&mut key);
    hex::encode(key)
}
