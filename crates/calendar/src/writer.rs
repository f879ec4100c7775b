//! Calendar Writer: drains buffered aggregation roots into `cal` blocks.
//!
//! Each tick is the explicit state machine
//! `acquire -> snapshot -> compute -> commit -> publish -> ack/nack -> release`.
//! The writer owns the root buffer exclusively: roots enter through
//! [`CalendarWriter::enqueue_root`] (driven by the inbound dispatcher) and
//! leave either acked (their proof segment is on the state queue) or nacked
//! back to the head of the inbound queue for redelivery. Nothing is dropped
//! silently.

use anyhow::{anyhow, Result};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{error, info, warn};
use uuid::Uuid;

use dtsn_common::bus::{Delivery, MessageBus, QUEUE_OUT_STATE};
use dtsn_common::crypto::{decode_value, is_hex};
use dtsn_common::leader::{LeaderState, ROLE_CALENDAR};
use dtsn_common::lock::{LockService, CALENDAR_LOCK_KEY};
use dtsn_common::merkle::{HashOp, MerkleTree, ProofOp};
use dtsn_common::messages::{AnchorSpec, ProofState, StateMessage};
use dtsn_common::retry::{retry, RetryPolicy};

use crate::append::{BlockAppender, DataId};
use crate::block::{Block, BlockType};

/// One dequeued aggregation root, owned by the writer until its calendar
/// block is durable and its proof segment confirmed.
#[derive(Debug)]
pub struct PendingRoot {
    pub agg_id: Uuid,
    pub agg_root: String,
    pub delivery: Delivery,
}

pub struct CalendarWriter {
    appender: BlockAppender,
    bus: Arc<dyn MessageBus>,
    locks: LockService,
    leader: Arc<LeaderState>,
    tick_secs: u64,
    roots: Mutex<VecDeque<PendingRoot>>,
    shutdown: Arc<Notify>,
}

impl CalendarWriter {
    pub fn new(
        appender: BlockAppender,
        bus: Arc<dyn MessageBus>,
        locks: LockService,
        leader: Arc<LeaderState>,
        tick_secs: u64,
    ) -> Self {
        CalendarWriter {
            appender,
            bus,
            locks,
            leader,
            tick_secs,
            roots: Mutex::new(VecDeque::new()),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn shutdown_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown)
    }

    /// Accept an aggregation root from the inbound dispatcher.
    ///
    /// A malformed root is acked and dropped here; it can never become a
    /// valid leaf and redelivery would not change that.
    pub async fn enqueue_root(&self, agg_id: Uuid, agg_root: String, delivery: Delivery) {
        if !is_hex(&agg_root) || agg_root.len() != 64 {
            warn!(%agg_id, %agg_root, "dropping malformed aggregation root");
            if let Err(e) = self.bus.ack(&delivery).await {
                warn!(error = %e, "ack of malformed root failed");
            }
            return;
        }
        self.roots.lock().push_back(PendingRoot {
            agg_id,
            agg_root,
            delivery,
        });
    }

    pub fn buffered(&self) -> usize {
        self.roots.lock().len()
    }

    /// One calendar tick. Returns the new `cal` block when roots were
    /// committed.
    pub async fn tick(&self) -> Result<Option<Block>> {
        // leadership is a level signal: read it at tick entry, not before
        if !self.leader.is_leader(ROLE_CALENDAR) {
            return Ok(None);
        }

        let mut lease = self.locks.acquire(CALENDAR_LOCK_KEY, "calendar").await;

        let snapshot: Vec<PendingRoot> = {
            let mut roots = self.roots.lock();
            roots.drain(..).collect()
        };
        if snapshot.is_empty() {
            lease.release();
            return Ok(None);
        }

        let outcome = self.commit(&snapshot).await;
        match outcome {
            Ok(block) => {
                for root in &snapshot {
                    if let Err(e) = self.bus.ack(&root.delivery).await {
                        warn!(agg_id = %root.agg_id, error = %e, "ack failed after commit");
                    }
                }
                lease.release();
                Ok(Some(block))
            }
            Err(e) => {
                // return every root to the head of the inbound queue, last
                // first, so redelivery restores the original order
                for root in snapshot.iter().rev() {
                    if let Err(nack_err) = self.bus.nack(&root.delivery).await {
                        error!(agg_id = %root.agg_id, error = %nack_err, "nack failed; root relies on redelivery");
                    }
                }
                lease.release();
                Err(e)
            }
        }
    }

    /// Build the tick's merkle tree, append the `cal` block, and publish
    /// one proof segment per root. Pure failure semantics: any error here
    /// leaves the bus deliveries untouched for the caller to nack.
    async fn commit(&self, snapshot: &[PendingRoot]) -> Result<Block> {
        let leaves: Vec<Vec<u8>> = snapshot.iter().map(|r| decode_value(&r.agg_root)).collect();
        let tree = MerkleTree::build(leaves, HashOp::Sha256)
            .map_err(|e| anyhow!("calendar tree: {}", e))?;

        let block = self
            .appender
            .append(BlockType::Cal, DataId::OwnId, tree.root_hex())
            .await?;

        // the block is durable from here on; a publish failure nacks the
        // aggregator messages, never the block
        for (i, root) in snapshot.iter().enumerate() {
            let message = self.proof_message(&tree, i, root, &block)?;
            let payload = serde_json::to_vec(&message)?;
            retry(RetryPolicy::mutation(), "cal-proof-publish", || {
                let payload = payload.clone();
                async move { self.bus.publish(QUEUE_OUT_STATE, payload).await }
            })
            .await?;
        }

        info!(
            cal_id = block.id,
            roots = snapshot.len(),
            root = %block.data_val,
            "calendar block committed"
        );
        Ok(block)
    }

    /// Ops binding one aggregation root to the calendar block hash: the
    /// tree path to the calendar root, then the block-hash extension
    /// `{l: prefix}, {r: prev_hash}, {op: sha-256}`.
    fn proof_message(
        &self,
        tree: &MerkleTree,
        index: usize,
        root: &PendingRoot,
        block: &Block,
    ) -> Result<StateMessage> {
        let mut ops = tree.proof(index).map_err(|e| anyhow!("proof: {}", e))?;
        ops.push(ProofOp::Left(block.hash_prefix()));
        ops.push(ProofOp::Right(block.prev_hash.clone()));
        ops.push(ProofOp::Hash(HashOp::Sha256));

        Ok(StateMessage::Cal {
            agg_id: root.agg_id,
            cal_id: block.id,
            cal_state: ProofState {
                ops,
                anchor: Some(AnchorSpec {
                    anchor_id: block.id.to_string(),
                    uris: vec![format!("/calendar/{}/hash", block.id)],
                }),
            },
        })
    }

    /// Tick loop: every `tick_secs`, offset by a randomized 0-9 s base
    /// second to de-conflict stacks sharing downstream consumers.
    pub async fn run(self: Arc<Self>) {
        let offset = {
            use rand::Rng;
            rand::thread_rng().gen_range(0..10)
        };
        info!(tick_secs = self.tick_secs, offset_secs = offset, "calendar writer started");
        tokio::time::sleep(std::time::Duration::from_secs(offset)).await;

        let mut interval = tokio::time::interval(std::time::Duration::from_secs(self.tick_secs));
        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if let Err(e) = self.tick().await {
                        error!(error = %e, "calendar tick failed; roots nacked for redelivery");
                    }
                }
                _ = self.shutdown.notified() => {
                    info!("calendar writer stopping");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signer::Signer;
    use crate::store::BlockStore;
    use dtsn_common::bus::{MemoryBus, QUEUE_IN_CAL};
    use dtsn_common::merkle::replay;
    use tempfile::tempdir;

    async fn writer_with_bus() -> (tempfile::TempDir, Arc<MemoryBus>, CalendarWriter) {
        let dir = tempdir().unwrap();
        let store = Arc::new(BlockStore::open(dir.path()).unwrap());
        let signer = Arc::new(Signer::from_secret_bytes(&[7u8; 32]).unwrap());
        let appender = BlockAppender::new(store, signer, "stack-a".into());
        crate::genesis::ensure_genesis(&appender, &LockService::new())
            .await
            .unwrap();
        let bus = Arc::new(MemoryBus::new());
        let writer = CalendarWriter::new(
            appender,
            bus.clone(),
            LockService::new(),
            Arc::new(LeaderState::holding(&[ROLE_CALENDAR])),
            10,
        );
        (dir, bus, writer)
    }

    async fn feed_root(bus: &Arc<MemoryBus>, writer: &CalendarWriter, agg_root: &str) {
        bus.publish(QUEUE_IN_CAL, b"raw".to_vec()).await.unwrap();
        let delivery = bus.get(QUEUE_IN_CAL).await.unwrap().unwrap();
        writer
            .enqueue_root(Uuid::new_v4(), agg_root.to_string(), delivery)
            .await;
    }

    #[tokio::test]
    async fn empty_tick_is_a_no_op() {
        let (_dir, bus, writer) = writer_with_bus().await;
        assert!(writer.tick().await.unwrap().is_none());
        assert_eq!(bus.depth(QUEUE_OUT_STATE).await, 0);
    }

    #[tokio::test]
    async fn tick_commits_roots_and_publishes_replayable_proofs() {
        let (_dir, bus, writer) = writer_with_bus().await;
        let r1 = format!("{}01", "aa".repeat(31));
        let r2 = format!("{}02", "aa".repeat(31));
        feed_root(&bus, &writer, &r1).await;
        feed_root(&bus, &writer, &r2).await;

        let block = writer.tick().await.unwrap().expect("cal block");
        assert_eq!(block.id, 1);
        assert_eq!(block.block_type, BlockType::Cal);
        assert_eq!(block.data_id, "1");

        // two proof messages, replaying to the block hash
        for expected_root in [&r1, &r2] {
            let d = bus.get(QUEUE_OUT_STATE).await.unwrap().expect("state msg");
            let msg: StateMessage = serde_json::from_slice(&d.payload).unwrap();
            bus.ack(&d).await.unwrap();
            match msg {
                StateMessage::Cal { cal_id, cal_state, .. } => {
                    assert_eq!(cal_id, 1);
                    let leaf = hex::decode(expected_root).unwrap();
                    let replayed = replay(&leaf, &cal_state.ops);
                    assert_eq!(hex::encode(replayed), block.hash);
                    assert_eq!(
                        cal_state.anchor.unwrap().uris,
                        vec!["/calendar/1/hash".to_string()]
                    );
                }
                other => panic!("unexpected message {:?}", other),
            }
        }

        // aggregator deliveries were acked, buffer drained
        assert_eq!(writer.buffered(), 0);
        assert_eq!(bus.depth(QUEUE_IN_CAL).await, 0);
    }

    #[tokio::test]
    async fn malformed_root_is_acked_and_dropped() {
        let (_dir, bus, writer) = writer_with_bus().await;
        feed_root(&bus, &writer, "zz-not-hex").await;
        assert_eq!(writer.buffered(), 0);
        assert_eq!(bus.depth(QUEUE_IN_CAL).await, 0);
    }

    #[tokio::test]
    async fn non_leader_tick_does_nothing() {
        let (_dir, bus, writer) = writer_with_bus().await;
        let root = "ab".repeat(32);
        feed_root(&bus, &writer, &root).await;
        writer.leader.revoke(ROLE_CALENDAR);
        assert!(writer.tick().await.unwrap().is_none());
        // root stays buffered for whoever becomes leader
        assert_eq!(writer.buffered(), 1);
    }
}
