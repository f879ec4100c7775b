//! Genesis block creation.
//!
//! Runs at every startup; only the first ever run writes anything. The
//! check-lock-recheck shape matters: another stack may win the genesis race
//! between our empty-store read and our lock acquisition.

use anyhow::Result;
use tracing::info;

use dtsn_common::lock::{LockService, CALENDAR_LOCK_KEY};

use crate::append::{BlockAppender, DataId};
use crate::block::{Block, BlockType, ZERO_HASH};

/// Append the genesis block if the store is empty. Returns the new block,
/// or `None` when the calendar already exists.
pub async fn ensure_genesis(appender: &BlockAppender, locks: &LockService) -> Result<Option<Block>> {
    if !appender.store().is_empty()? {
        return Ok(None);
    }

    let mut lease = locks.acquire(CALENDAR_LOCK_KEY, "genesis").await;
    // re-validate: the store may have gained a genesis while we waited
    if !appender.store().is_empty()? {
        lease.release();
        return Ok(None);
    }

    let result = appender
        .append(BlockType::Gen, DataId::Fixed("0".into()), ZERO_HASH.to_string())
        .await;
    lease.release();

    let block = result?;
    info!(hash = %block.hash, "genesis block written");
    Ok(Some(block))
}
