//! Append-only block store on LMDB.
//!
//! Single environment, three named databases:
//!
//! - `blocks`: big-endian `id` -> bincode [`Block`]
//! - `meta`: tip pointer (`tip_id`)
//! - `type_index`: `"{type}:{stack_id}"` -> big-endian id of the most
//!   recent block of that type written by that stack
//!
//! The store enforces the chain shape locally (dense ids, `prev_hash`
//! continuity); cluster-wide single-writer discipline is the calendar
//! lock's job, not the store's. Every append commits one write
//! transaction, so a block is durable before the caller sees `Ok`.

use lmdb::{Cursor, Database, DatabaseFlags, Environment, Transaction as LmdbTxn, WriteFlags};
use std::path::Path;
use std::sync::Arc;
use thiserror::Error;

use crate::block::{Block, BlockType, ZERO_HASH};

const KEY_TIP_ID: &[u8] = b"tip_id";

#[derive(Debug, Error)]
pub enum StoreError {
    /// Block id already present.
    #[error("block {0} already exists")]
    DuplicateId(u64),

    /// Append would break the chain: ids must be dense.
    #[error("non-contiguous id {got}, expected {expected}")]
    NonContiguousId { got: u64, expected: u64 },

    /// Append's `prev_hash` does not match the current tip hash.
    #[error("prev_hash mismatch at id {id}: expected {expected}")]
    PrevHashMismatch { id: u64, expected: String },

    #[error("block {0} not found")]
    NotFound(u64),

    #[error("lmdb: {0}")]
    Lmdb(#[from] lmdb::Error),

    #[error("codec: {0}")]
    Codec(#[from] bincode::Error),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}

#[derive(Clone)]
pub struct BlockStore {
    env: Arc<Environment>,
    db_blocks: Database,
    db_meta: Database,
    db_type_index: Database,
}

impl BlockStore {
    /// Open (or create) the store at `path`.
    pub fn open(path: impl AsRef<Path>) -> Result<Self, StoreError> {
        let p = path.as_ref();
        std::fs::create_dir_all(p)?;

        let env = Environment::new()
            .set_max_dbs(3)
            .set_map_size(1_000_000_000usize)
            .open(p)?;

        let db_blocks = env.create_db(Some("blocks"), DatabaseFlags::empty())?;
        let db_meta = env.create_db(Some("meta"), DatabaseFlags::empty())?;
        let db_type_index = env.create_db(Some("type_index"), DatabaseFlags::empty())?;

        Ok(BlockStore {
            env: Arc::new(env),
            db_blocks,
            db_meta,
            db_type_index,
        })
    }

    fn id_key(id: u64) -> [u8; 8] {
        id.to_be_bytes()
    }

    fn type_key(block_type: BlockType, stack_id: &str) -> Vec<u8> {
        format!("{}:{}", block_type, stack_id).into_bytes()
    }

    /// Append one block.
    ///
    /// Fails if the id already exists, the id is not `tip + 1` (0 for an
    /// empty store), or `prev_hash` differs from the tip hash (all zeros
    /// for genesis). Block, tip pointer, and type index commit in one
    /// transaction.
    pub fn append(&self, block: &Block) -> Result<(), StoreError> {
        let tip = self.tip()?;

        match &tip {
            None => {
                if block.id != 0 {
                    return Err(StoreError::NonContiguousId { got: block.id, expected: 0 });
                }
                if block.prev_hash != ZERO_HASH {
                    return Err(StoreError::PrevHashMismatch {
                        id: block.id,
                        expected: ZERO_HASH.to_string(),
                    });
                }
            }
            Some((tip_id, tip_hash)) => {
                if block.id <= *tip_id {
                    return Err(StoreError::DuplicateId(block.id));
                }
                if block.id != tip_id + 1 {
                    return Err(StoreError::NonContiguousId {
                        got: block.id,
                        expected: tip_id + 1,
                    });
                }
                if &block.prev_hash != tip_hash {
                    return Err(StoreError::PrevHashMismatch {
                        id: block.id,
                        expected: tip_hash.clone(),
                    });
                }
            }
        }

        let blob = bincode::serialize(block)?;
        let mut wtxn = self.env.begin_rw_txn()?;
        wtxn.put(self.db_blocks, &Self::id_key(block.id), &blob, WriteFlags::empty())?;
        wtxn.put(self.db_meta, &KEY_TIP_ID, &block.id.to_be_bytes(), WriteFlags::empty())?;
        wtxn.put(
            self.db_type_index,
            &Self::type_key(block.block_type, &block.stack_id),
            &block.id.to_be_bytes(),
            WriteFlags::empty(),
        )?;
        wtxn.commit()?;
        Ok(())
    }

    /// `(id, hash)` of the highest block, or `None` for an empty store.
    pub fn tip(&self) -> Result<Option<(u64, String)>, StoreError> {
        let rtxn = self.env.begin_ro_txn()?;
        let tip_id = match rtxn.get(self.db_meta, &KEY_TIP_ID) {
            Ok(v) => {
                let mut arr = [0u8; 8];
                arr.copy_from_slice(v);
                u64::from_be_bytes(arr)
            }
            Err(lmdb::Error::NotFound) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let blob = rtxn.get(self.db_blocks, &Self::id_key(tip_id))?;
        let block: Block = bincode::deserialize(blob)?;
        Ok(Some((tip_id, block.hash)))
    }

    pub fn by_id(&self, id: u64) -> Result<Option<Block>, StoreError> {
        let rtxn = self.env.begin_ro_txn()?;
        match rtxn.get(self.db_blocks, &Self::id_key(id)) {
            Ok(v) => Ok(Some(bincode::deserialize(v)?)),
            Err(lmdb::Error::NotFound) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Ordered scan of `[from, to]`, optionally filtered to a type set.
    pub fn scan(
        &self,
        from: u64,
        to: u64,
        types: Option<&[BlockType]>,
    ) -> Result<Vec<Block>, StoreError> {
        let rtxn = self.env.begin_ro_txn()?;
        let mut cursor = rtxn.open_ro_cursor(self.db_blocks)?;
        let from_key = Self::id_key(from);
        let mut out = Vec::new();
        for (key, val) in cursor.iter_from(from_key) {
            let mut arr = [0u8; 8];
            arr.copy_from_slice(key);
            if u64::from_be_bytes(arr) > to {
                break;
            }
            let block: Block = bincode::deserialize(val)?;
            if types.map(|ts| ts.contains(&block.block_type)).unwrap_or(true) {
                out.push(block);
            }
        }
        Ok(out)
    }

    /// Most recent block of `block_type` written by `stack_id`.
    pub fn last_of_type(
        &self,
        block_type: BlockType,
        stack_id: &str,
    ) -> Result<Option<Block>, StoreError> {
        let rtxn = self.env.begin_ro_txn()?;
        let id = match rtxn.get(self.db_type_index, &Self::type_key(block_type, stack_id)) {
            Ok(v) => {
                let mut arr = [0u8; 8];
                arr.copy_from_slice(v);
                u64::from_be_bytes(arr)
            }
            Err(lmdb::Error::NotFound) => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        drop(rtxn);
        self.by_id(id)
    }

    pub fn is_empty(&self) -> Result<bool, StoreError> {
        Ok(self.tip()?.is_none())
    }
}
