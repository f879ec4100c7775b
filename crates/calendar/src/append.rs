//! Shared append path: build the next block at the tip, hash, sign, store.
//!
//! Every writing engine (calendar tick, anchor, confirm, reward) goes
//! through here while holding the calendar lock. Store failures retry under
//! the mutation policy (15 attempts, factor 1.2, 250 ms base); the retry
//! budget is per call, so one stuck tick cannot starve the next.

use anyhow::{Context, Result};
use chrono::Utc;
use std::sync::Arc;
use tracing::info;

use dtsn_common::retry::{retry, RetryPolicy};

use crate::block::{Block, BlockType, BLOCK_VERSION, ZERO_HASH};
use crate::signer::Signer;
use crate::store::BlockStore;

/// Type-specific `data_id` content.
pub enum DataId {
    /// A fixed string (tx ids, beacon timestamps, bitcoin heights; empty
    /// for anchor submissions).
    Fixed(String),
    /// The block's own id, assigned at append time (calendar blocks).
    OwnId,
}

#[derive(Clone)]
pub struct BlockAppender {
    store: Arc<BlockStore>,
    signer: Arc<Signer>,
    stack_id: String,
}

impl BlockAppender {
    pub fn new(store: Arc<BlockStore>, signer: Arc<Signer>, stack_id: String) -> Self {
        BlockAppender {
            store,
            signer,
            stack_id,
        }
    }

    pub fn store(&self) -> &Arc<BlockStore> {
        &self.store
    }

    pub fn stack_id(&self) -> &str {
        &self.stack_id
    }

    /// Append the next block of `block_type` at the current tip.
    ///
    /// Caller must hold the calendar lock; this function only retries
    /// storage faults, it does not serialize writers.
    pub async fn append(
        &self,
        block_type: BlockType,
        data_id: DataId,
        data_val: String,
    ) -> Result<Block> {
        let block = retry(RetryPolicy::mutation(), "block-append", || {
            let data_val = data_val.clone();
            let data_id = match &data_id {
                DataId::Fixed(s) => Some(s.clone()),
                DataId::OwnId => None,
            };
            async move { self.try_append(block_type, data_id, data_val) }
        })
        .await
        .context("block append exhausted retries")?;

        info!(
            id = block.id,
            block_type = %block.block_type,
            data_id = %block.data_id,
            "block appended"
        );
        Ok(block)
    }

    fn try_append(
        &self,
        block_type: BlockType,
        data_id: Option<String>,
        data_val: String,
    ) -> Result<Block> {
        let (id, prev_hash) = match self.store.tip()? {
            Some((tip_id, tip_hash)) => (tip_id + 1, tip_hash),
            None => (0, ZERO_HASH.to_string()),
        };

        let mut block = Block {
            id,
            time: Utc::now().timestamp() as u64,
            version: BLOCK_VERSION,
            stack_id: self.stack_id.clone(),
            block_type,
            data_id: data_id.unwrap_or_else(|| id.to_string()),
            data_val,
            prev_hash,
            hash: String::new(),
            sig: String::new(),
        };
        block.hash = block.compute_hash()?;
        block.sig = self.signer.signature_field(&block.hash);

        self.store.append(&block)?;
        Ok(block)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn appender() -> (tempfile::TempDir, BlockAppender) {
        let dir = tempdir().unwrap();
        let store = Arc::new(BlockStore::open(dir.path()).unwrap());
        let signer = Arc::new(Signer::from_secret_bytes(&[7u8; 32]).unwrap());
        (dir, BlockAppender::new(store, signer, "stack-a".into()))
    }

    #[tokio::test]
    async fn appends_chain_from_genesis() {
        let (_dir, app) = appender();
        let gen = app
            .append(BlockType::Gen, DataId::Fixed("0".into()), ZERO_HASH.into())
            .await
            .unwrap();
        assert_eq!(gen.id, 0);
        assert_eq!(gen.prev_hash, ZERO_HASH);

        let cal = app
            .append(BlockType::Cal, DataId::OwnId, "aa".repeat(32))
            .await
            .unwrap();
        assert_eq!(cal.id, 1);
        assert_eq!(cal.data_id, "1");
        assert_eq!(cal.prev_hash, gen.hash);
        assert!(cal.hash_is_valid());
    }

    #[tokio::test]
    async fn signature_field_present_and_valid() {
        let (_dir, app) = appender();
        let gen = app
            .append(BlockType::Gen, DataId::Fixed("0".into()), ZERO_HASH.into())
            .await
            .unwrap();
        let signer = Signer::from_secret_bytes(&[7u8; 32]).unwrap();
        assert!(crate::signer::verify_signature_field(
            &signer.public_key_bytes(),
            &gen.hash,
            &gen.sig
        )
        .unwrap());
    }
}
