//! Audit challenge generation and caching.
//!
//! A challenge asks nodes to prove they hold the calendar: the solution is
//! the merkle root over `[nonce, hash(block[min]), .., hash(block[max])]`,
//! which cannot be produced without the block range. The five-tuple is
//! cached atomically so peer readback always sees a complete challenge,
//! never a half-written one.

use chrono::Utc;
use parking_lot::RwLock;
use rand::{Rng, RngCore};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::info;

use dtsn_calendar::BlockStore;
use dtsn_common::crypto::is_hex;
use dtsn_common::error::CoreError;
use dtsn_common::merkle::{HashOp, MerkleTree};

use crate::registry::{RegistryStore, KEY_CURRENT_CHALLENGE};

/// Keep the tip at arm's length so every audited node has the range, even
/// mid-sync ones.
const TIP_SAFETY_MARGIN: u64 = 1_000;
/// Tip height above which the safety margin applies.
const TIP_MARGIN_THRESHOLD: u64 = 2_000;
/// Challenge span bounds: `min = max - rand(10..=1000)`.
const SPAN_MIN: u64 = 10;
const SPAN_MAX: u64 = 1_000;
/// Readback cache TTL.
const CACHE_TTL: Duration = Duration::from_secs(120);

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuditChallenge {
    /// Generation time, ms since epoch.
    pub time: u64,
    pub min_block_height: u64,
    pub max_block_height: u64,
    /// 32-byte hex.
    pub nonce: String,
    /// 32-byte hex merkle root.
    pub solution: String,
}

pub struct ChallengeManager {
    store: Arc<BlockStore>,
    registry: RegistryStore,
    cache: RwLock<Option<(Instant, AuditChallenge)>>,
}

impl ChallengeManager {
    pub fn new(store: Arc<BlockStore>, registry: RegistryStore) -> Self {
        ChallengeManager {
            store,
            registry,
            cache: RwLock::new(None),
        }
    }

    /// Generate a fresh challenge from the current calendar and cache it.
    pub fn generate(&self) -> Result<AuditChallenge, CoreError> {
        let tip = self
            .store
            .tip()
            .map_err(|e| CoreError::DependencyUnavailable(format!("block store: {}", e)))?
            .map(|(id, _)| id)
            .ok_or_else(|| CoreError::DependencyUnavailable("calendar has no blocks yet".into()))?;

        let max = if tip > TIP_MARGIN_THRESHOLD {
            tip - TIP_SAFETY_MARGIN
        } else {
            tip
        };
        let span = rand::thread_rng().gen_range(SPAN_MIN..=SPAN_MAX);
        let min = max.saturating_sub(span);

        let mut nonce = [0u8; 32];
        rand::thread_rng().fill_bytes(&mut nonce);

        let challenge = AuditChallenge {
            time: Utc::now().timestamp_millis() as u64,
            min_block_height: min,
            max_block_height: max,
            nonce: hex::encode(nonce),
            solution: solve(&self.store, min, max, &nonce)?,
        };

        // single swap: readers never observe a partial tuple
        let blob = bincode::serialize(&challenge)
            .map_err(|e| CoreError::Fatal(format!("challenge codec: {}", e)))?;
        self.registry.put_meta(KEY_CURRENT_CHALLENGE, &blob)?;
        *self.cache.write() = Some((Instant::now(), challenge.clone()));

        info!(
            min = challenge.min_block_height,
            max = challenge.max_block_height,
            "audit challenge generated"
        );
        Ok(challenge)
    }

    /// The cached challenge, refreshed from storage when the readback TTL
    /// has lapsed. `None` before the first generation.
    pub fn current(&self) -> Result<Option<AuditChallenge>, CoreError> {
        if let Some((at, challenge)) = self.cache.read().as_ref() {
            if at.elapsed() < CACHE_TTL {
                return Ok(Some(challenge.clone()));
            }
        }
        let Some(blob) = self.registry.get_meta(KEY_CURRENT_CHALLENGE)? else {
            return Ok(None);
        };
        let challenge: AuditChallenge = bincode::deserialize(&blob)
            .map_err(|e| CoreError::Fatal(format!("challenge codec: {}", e)))?;
        *self.cache.write() = Some((Instant::now(), challenge.clone()));
        Ok(Some(challenge))
    }

    /// Check a node-reported solution against the cached challenge.
    pub fn solution_matches(&self, reported: Option<&str>) -> Result<bool, CoreError> {
        let Some(challenge) = self.current()? else {
            return Ok(false);
        };
        Ok(reported
            .map(|s| is_hex(s) && s.eq_ignore_ascii_case(&challenge.solution))
            .unwrap_or(false))
    }
}

/// Merkle root over `[nonce, hash(block[min]), .., hash(block[max])]`.
fn solve(store: &BlockStore, min: u64, max: u64, nonce: &[u8; 32]) -> Result<String, CoreError> {
    let blocks = store
        .scan(min, max, None)
        .map_err(|e| CoreError::DependencyUnavailable(format!("block store: {}", e)))?;
    let mut leaves: Vec<Vec<u8>> = Vec::with_capacity(blocks.len() + 1);
    leaves.push(nonce.to_vec());
    for block in &blocks {
        leaves.push(
            hex::decode(&block.hash)
                .map_err(|e| CoreError::Fatal(format!("stored hash not hex: {}", e)))?,
        );
    }
    let tree = MerkleTree::build(leaves, HashOp::Sha256)
        .map_err(|e| CoreError::Fatal(format!("challenge tree: {}", e)))?;
    Ok(tree.root_hex())
}

#[cfg(test)]
mod tests {
    use super::*;
    use dtsn_calendar::{BlockAppender, BlockType, DataId, Signer, ZERO_HASH};
    use tempfile::tempdir;

    async fn seeded(n: u64) -> (tempfile::TempDir, tempfile::TempDir, ChallengeManager) {
        let block_dir = tempdir().unwrap();
        let reg_dir = tempdir().unwrap();
        let store = Arc::new(BlockStore::open(block_dir.path()).unwrap());
        let signer = Arc::new(Signer::from_secret_bytes(&[7u8; 32]).unwrap());
        let appender = BlockAppender::new(Arc::clone(&store), signer, "stack-a".into());
        appender
            .append(BlockType::Gen, DataId::Fixed("0".into()), ZERO_HASH.into())
            .await
            .unwrap();
        for _ in 1..n {
            appender
                .append(BlockType::Cal, DataId::OwnId, "ab".repeat(32))
                .await
                .unwrap();
        }
        let registry = RegistryStore::open(reg_dir.path()).unwrap();
        let manager = ChallengeManager::new(store, registry);
        (block_dir, reg_dir, manager)
    }

    #[tokio::test]
    async fn low_tip_uses_tip_as_max() {
        let (_b, _r, manager) = seeded(50).await;
        let challenge = manager.generate().unwrap();
        // tip is 49, far below the margin threshold
        assert_eq!(challenge.max_block_height, 49);
        assert!(challenge.min_block_height <= challenge.max_block_height);
        assert_eq!(challenge.nonce.len(), 64);
        assert_eq!(challenge.solution.len(), 64);
    }

    #[tokio::test]
    async fn solution_is_reproducible_from_the_calendar() {
        let (_b, _r, manager) = seeded(30).await;
        let challenge = manager.generate().unwrap();
        let nonce: [u8; 32] = hex::decode(&challenge.nonce).unwrap().try_into().unwrap();
        let recomputed = solve(
            &manager.store,
            challenge.min_block_height,
            challenge.max_block_height,
            &nonce,
        )
        .unwrap();
        assert_eq!(recomputed, challenge.solution);
    }

    #[tokio::test]
    async fn current_reads_back_complete_tuple() {
        let (_b, _r, manager) = seeded(20).await;
        assert!(manager.current().unwrap().is_none());
        let generated = manager.generate().unwrap();
        let read = manager.current().unwrap().expect("cached");
        assert_eq!(read, generated);
    }

    #[tokio::test]
    async fn solution_matching() {
        let (_b, _r, manager) = seeded(20).await;
        let challenge = manager.generate().unwrap();
        assert!(manager.solution_matches(Some(&challenge.solution)).unwrap());
        assert!(manager
            .solution_matches(Some(&challenge.solution.to_uppercase()))
            .unwrap());
        assert!(!manager.solution_matches(Some(&"00".repeat(32))).unwrap());
        assert!(!manager.solution_matches(None).unwrap());
    }

    #[tokio::test]
    async fn empty_calendar_cannot_generate() {
        let block_dir = tempdir().unwrap();
        let reg_dir = tempdir().unwrap();
        let store = Arc::new(BlockStore::open(block_dir.path()).unwrap());
        let registry = RegistryStore::open(reg_dir.path()).unwrap();
        let manager = ChallengeManager::new(store, registry);
        assert!(manager.generate().is_err());
    }
}
