//! Anchor Engine: commits the calendar into bitcoin and folds the
//! confirmation back in.
//!
//! Two write paths, both serialized by the calendar lock:
//!
//! - **anchor**: at :00/:30 every stack aggregates all blocks since its
//!   last `btc-a`, appends a new `btc-a`, and hands the root to the
//!   transaction service. Per-`cal` proof segments go out first so
//!   downstream proof assembly never sees a transaction for a root it
//!   cannot bind.
//! - **confirm**: the elected leader drains monitor messages, appending one
//!   `btc-c` per confirmed transaction.
//!
//! The tx pre-processing path (`btctx` inbound) writes no blocks; it only
//! derives the `{l: prefix}, {r: suffix}, {op: sha-256-x2}` segment that
//! binds the anchor root to the transaction id.

use anyhow::{anyhow, Result};
use chrono::{Timelike, Utc};
use parking_lot::Mutex;
use std::collections::VecDeque;
use std::sync::Arc;
use tokio::sync::Notify;
use tracing::{error, info, warn};
use uuid::Uuid;

use dtsn_common::bus::{
    Delivery, MessageBus, QUEUE_OUT_BTCMON, QUEUE_OUT_BTCTX, QUEUE_OUT_STATE,
};
use dtsn_common::leader::{LeaderState, ROLE_CALENDAR};
use dtsn_common::lock::{LockService, CALENDAR_LOCK_KEY};
use dtsn_common::merkle::{HashOp, MerkleTree, ProofOp};
use dtsn_common::messages::{
    AnchorSpec, BtcMonRequest, BtcTxRequest, ProofState, StateMessage,
};
use dtsn_common::retry::{retry, RetryPolicy};

use crate::append::{BlockAppender, DataId};
use crate::block::{Block, BlockType};

/// Seconds between anchor runs: :00 and :30 of every hour.
const ANCHOR_PERIOD_SECS: u64 = 30 * 60;
/// Cap on the per-stack second jitter inside an anchor slot.
const ANCHOR_JITTER_SECS: u64 = 30;
/// How often the confirm path drains buffered monitor messages.
const CONFIRM_POLL_SECS: u64 = 5;

/// A buffered confirmation from the bitcoin monitor.
#[derive(Debug)]
struct MonitorEntry {
    btctx_id: String,
    btchead_height: u64,
    btchead_root: String,
    path: Vec<ProofOp>,
    delivery: Delivery,
}

pub struct AnchorEngine {
    appender: BlockAppender,
    bus: Arc<dyn MessageBus>,
    locks: LockService,
    leader: Arc<LeaderState>,
    monitor_buf: Mutex<VecDeque<MonitorEntry>>,
    shutdown: Arc<Notify>,
}

impl AnchorEngine {
    pub fn new(
        appender: BlockAppender,
        bus: Arc<dyn MessageBus>,
        locks: LockService,
        leader: Arc<LeaderState>,
    ) -> Self {
        AnchorEngine {
            appender,
            bus,
            locks,
            leader,
            monitor_buf: Mutex::new(VecDeque::new()),
            shutdown: Arc::new(Notify::new()),
        }
    }

    pub fn shutdown_handle(&self) -> Arc<Notify> {
        Arc::clone(&self.shutdown)
    }

    // ────────────────────────────────────────────────────────────────────
    // anchor path
    // ────────────────────────────────────────────────────────────────────

    /// One anchor run. Returns the new `btc-a` block, or `None` when no
    /// blocks arrived since the last anchor.
    pub async fn anchor_once(&self) -> Result<Option<Block>> {
        // looked up outside the lock: a stale value only widens the scan,
        // and the scan re-reads the tip under the lock anyway
        let last_anchor_id = self
            .appender
            .store()
            .last_of_type(BlockType::BtcA, self.appender.stack_id())?
            .map(|b| b.id);

        // no orphan anchors: if the bus is down, abort before any write
        self.bus
            .ping()
            .await
            .map_err(|e| anyhow!("bus unavailable, anchor aborted: {}", e))?;

        let mut lease = self.locks.acquire(CALENDAR_LOCK_KEY, "btc-anchor").await;
        let outcome = self.anchor_under_lock(last_anchor_id).await;
        lease.release();
        outcome
    }

    async fn anchor_under_lock(&self, last_anchor_id: Option<u64>) -> Result<Option<Block>> {
        let store = self.appender.store();
        let tip = match store.tip()? {
            Some((tip_id, _)) => tip_id,
            None => return Ok(None),
        };
        let from = last_anchor_id.map(|id| id + 1).unwrap_or(0);
        if from > tip {
            return Ok(None);
        }

        // leaves are every block hash since the last anchor, all types
        let blocks = store.scan(from, tip, None)?;
        if blocks.is_empty() {
            return Ok(None);
        }
        let leaves: Vec<Vec<u8>> = blocks
            .iter()
            .map(|b| hex::decode(&b.hash).map_err(|e| anyhow!("stored hash not hex: {}", e)))
            .collect::<Result<_>>()?;
        let tree = MerkleTree::build(leaves, HashOp::Sha256)
            .map_err(|e| anyhow!("anchor tree: {}", e))?;

        let anchor_btc_agg_id = Uuid::new_v4().to_string();
        let root_hex = tree.root_hex();

        let block = self
            .appender
            .append(BlockType::BtcA, DataId::Fixed(String::new()), root_hex.clone())
            .await?;

        // per-cal segments first, then the root to the tx path
        for (i, leaf_block) in blocks.iter().enumerate() {
            if leaf_block.block_type != BlockType::Cal {
                continue;
            }
            let ops = tree.proof(i).map_err(|e| anyhow!("anchor proof: {}", e))?;
            let message = StateMessage::AnchorBtcAgg {
                cal_id: leaf_block.id,
                anchor_btc_agg_id: anchor_btc_agg_id.clone(),
                anchor_btc_agg_state: ProofState { ops, anchor: None },
            };
            self.publish_confirmed(QUEUE_OUT_STATE, serde_json::to_vec(&message)?)
                .await?;
        }

        let tx_request = BtcTxRequest {
            anchor_btc_agg_id: anchor_btc_agg_id.clone(),
            anchor_btc_agg_root: root_hex,
        };
        self.publish_confirmed(QUEUE_OUT_BTCTX, serde_json::to_vec(&tx_request)?)
            .await?;

        info!(
            btc_a_id = block.id,
            anchored = blocks.len(),
            anchor_btc_agg_id = %anchor_btc_agg_id,
            "anchor submitted"
        );
        Ok(Some(block))
    }

    // ────────────────────────────────────────────────────────────────────
    // tx pre-processing path
    // ────────────────────────────────────────────────────────────────────

    /// Derive the tx proof segment from a submitted transaction and ask the
    /// monitor to watch it. Writes no blocks.
    pub async fn handle_btctx(
        &self,
        btctx_id: String,
        btctx_body: String,
        anchor_btc_agg_root: String,
        delivery: Delivery,
    ) {
        match self
            .process_btctx(&btctx_id, &btctx_body, &anchor_btc_agg_root)
            .await
        {
            Ok(()) => {
                if let Err(e) = self.bus.ack(&delivery).await {
                    warn!(%btctx_id, error = %e, "btctx ack failed");
                }
            }
            Err(e) => {
                warn!(%btctx_id, error = %e, "btctx processing failed, nacking");
                if let Err(nack_err) = self.bus.nack(&delivery).await {
                    error!(%btctx_id, error = %nack_err, "btctx nack failed");
                }
            }
        }
    }

    async fn process_btctx(
        &self,
        btctx_id: &str,
        btctx_body: &str,
        anchor_root: &str,
    ) -> Result<()> {
        let split_at = btctx_body
            .find(anchor_root)
            .ok_or_else(|| anyhow!("anchor root not present in tx body"))?;
        let prefix = &btctx_body[..split_at];
        let suffix = &btctx_body[split_at + anchor_root.len()..];

        let message = StateMessage::BtcTx {
            btctx_id: btctx_id.to_string(),
            btctx_state: ProofState {
                ops: vec![
                    ProofOp::Left(prefix.to_string()),
                    ProofOp::Right(suffix.to_string()),
                    ProofOp::Hash(HashOp::Sha256x2),
                ],
                anchor: None,
            },
        };
        self.publish_confirmed(QUEUE_OUT_STATE, serde_json::to_vec(&message)?)
            .await?;

        let monitor = BtcMonRequest {
            tx_id: btctx_id.to_string(),
        };
        self.publish_confirmed(QUEUE_OUT_BTCMON, serde_json::to_vec(&monitor)?)
            .await?;
        Ok(())
    }

    // ────────────────────────────────────────────────────────────────────
    // confirm path
    // ────────────────────────────────────────────────────────────────────

    /// Buffer a monitor confirmation for the next confirm drain.
    pub fn enqueue_monitor(
        &self,
        btctx_id: String,
        btchead_height: u64,
        btchead_root: String,
        path: Vec<ProofOp>,
        delivery: Delivery,
    ) {
        self.monitor_buf.lock().push_back(MonitorEntry {
            btctx_id,
            btchead_height,
            btchead_root,
            path,
            delivery,
        });
    }

    /// Drain buffered monitor messages, appending one `btc-c` each.
    /// Returns the number confirmed.
    pub async fn confirm_once(&self) -> Result<usize> {
        if !self.leader.is_leader(ROLE_CALENDAR) {
            return Ok(0);
        }

        let mut confirmed = 0usize;
        loop {
            let entry = match self.monitor_buf.lock().pop_front() {
                Some(e) => e,
                None => break,
            };

            let mut lease = self.locks.acquire(CALENDAR_LOCK_KEY, "btc-confirm").await;
            let outcome = self.confirm_entry(&entry).await;
            lease.release();

            match outcome {
                Ok(()) => {
                    if let Err(e) = self.bus.ack(&entry.delivery).await {
                        warn!(btctx_id = %entry.btctx_id, error = %e, "monitor ack failed");
                    }
                    confirmed += 1;
                }
                Err(e) => {
                    warn!(btctx_id = %entry.btctx_id, error = %e, "confirm failed, nacking");
                    if let Err(nack_err) = self.bus.nack(&entry.delivery).await {
                        error!(btctx_id = %entry.btctx_id, error = %nack_err, "monitor nack failed");
                    }
                }
            }
        }
        Ok(confirmed)
    }

    async fn confirm_entry(&self, entry: &MonitorEntry) -> Result<()> {
        let block = self
            .appender
            .append(
                BlockType::BtcC,
                DataId::Fixed(entry.btchead_height.to_string()),
                entry.btchead_root.clone(),
            )
            .await?;

        let message = StateMessage::BtcHead {
            btctx_id: entry.btctx_id.clone(),
            btchead_height: entry.btchead_height,
            btchead_state: ProofState {
                ops: entry.path.clone(),
                anchor: Some(AnchorSpec {
                    anchor_id: entry.btchead_height.to_string(),
                    uris: vec![format!("/calendar/{}/data", block.id)],
                }),
            },
        };
        self.publish_confirmed(QUEUE_OUT_STATE, serde_json::to_vec(&message)?)
            .await?;

        info!(
            btc_c_id = block.id,
            btctx_id = %entry.btctx_id,
            height = entry.btchead_height,
            "anchor confirmed"
        );
        Ok(())
    }

    async fn publish_confirmed(&self, queue: &str, payload: Vec<u8>) -> Result<()> {
        retry(RetryPolicy::mutation(), "anchor-publish", || {
            let payload = payload.clone();
            async move { self.bus.publish(queue, payload).await }
        })
        .await
        .map_err(|e| anyhow!("publish to {}: {}", queue, e))
    }

    /// Seconds until the next :00/:30 slot, plus this stack's jitter.
    fn secs_until_next_anchor() -> u64 {
        use rand::Rng;
        let now = Utc::now();
        let into_period = (now.minute() as u64 % 30) * 60 + now.second() as u64;
        let until_slot = ANCHOR_PERIOD_SECS - into_period;
        until_slot + rand::thread_rng().gen_range(0..ANCHOR_JITTER_SECS)
    }

    /// Anchor at :00/:30 and drain confirmations continuously.
    pub async fn run(self: Arc<Self>) {
        info!("anchor engine started");
        let mut confirm_interval =
            tokio::time::interval(std::time::Duration::from_secs(CONFIRM_POLL_SECS));
        let mut next_anchor =
            tokio::time::Instant::now() + std::time::Duration::from_secs(Self::secs_until_next_anchor());
        loop {
            tokio::select! {
                _ = tokio::time::sleep_until(next_anchor) => {
                    if let Err(e) = self.anchor_once().await {
                        error!(error = %e, "anchor run failed");
                    }
                    next_anchor = tokio::time::Instant::now()
                        + std::time::Duration::from_secs(Self::secs_until_next_anchor());
                }
                _ = confirm_interval.tick() => {
                    if let Err(e) = self.confirm_once().await {
                        error!(error = %e, "confirm drain failed");
                    }
                }
                _ = self.shutdown.notified() => {
                    info!("anchor engine stopping");
                    break;
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::genesis::ensure_genesis;
    use crate::signer::Signer;
    use crate::store::BlockStore;
    use dtsn_common::bus::MemoryBus;
    use dtsn_common::crypto::sha256d_bytes;
    use dtsn_common::merkle::replay;
    use tempfile::tempdir;

    async fn engine() -> (tempfile::TempDir, Arc<MemoryBus>, AnchorEngine) {
        let dir = tempdir().unwrap();
        let store = Arc::new(BlockStore::open(dir.path()).unwrap());
        let signer = Arc::new(Signer::from_secret_bytes(&[7u8; 32]).unwrap());
        let appender = BlockAppender::new(store, signer, "stack-a".into());
        ensure_genesis(&appender, &LockService::new()).await.unwrap();
        let bus = Arc::new(MemoryBus::with_prefetch(64));
        let anchor = AnchorEngine::new(
            appender,
            bus.clone(),
            LockService::new(),
            Arc::new(LeaderState::holding(&[ROLE_CALENDAR])),
        );
        (dir, bus, anchor)
    }

    async fn append_cal(anchor: &AnchorEngine, val: &str) -> Block {
        anchor
            .appender
            .append(BlockType::Cal, DataId::OwnId, val.to_string())
            .await
            .unwrap()
    }

    async fn drain_state(bus: &Arc<MemoryBus>) -> Vec<StateMessage> {
        let mut out = Vec::new();
        while let Some(d) = bus.get(QUEUE_OUT_STATE).await.unwrap() {
            out.push(serde_json::from_slice(&d.payload).unwrap());
            bus.ack(&d).await.unwrap();
        }
        out
    }

    #[tokio::test]
    async fn quiet_anchor_is_a_no_op() {
        let (_dir, bus, anchor) = engine().await;
        // first anchor covers genesis
        anchor.anchor_once().await.unwrap().expect("first anchor");
        drain_state(&bus).await;
        while bus.get(QUEUE_OUT_BTCTX).await.unwrap().is_some() {}

        // nothing new since: no block, no traffic
        let again = anchor.anchor_once().await.unwrap();
        assert!(again.is_none());
        assert_eq!(bus.depth(QUEUE_OUT_STATE).await, 0);
        assert_eq!(bus.depth(QUEUE_OUT_BTCTX).await, 0);
    }

    #[tokio::test]
    async fn anchor_emits_segments_for_cal_leaves_only() {
        let (_dir, bus, anchor) = engine().await;
        let cal1 = append_cal(&anchor, &"11".repeat(32)).await;
        let cal2 = append_cal(&anchor, &"22".repeat(32)).await;

        let btc_a = anchor.anchor_once().await.unwrap().expect("btc-a block");
        assert_eq!(btc_a.block_type, BlockType::BtcA);
        assert_eq!(btc_a.data_id, "");

        let state = drain_state(&bus).await;
        // genesis leaf yields no segment: 2 cal segments for 3 leaves
        assert_eq!(state.len(), 2);
        for (msg, cal) in state.iter().zip([&cal1, &cal2]) {
            match msg {
                StateMessage::AnchorBtcAgg {
                    cal_id,
                    anchor_btc_agg_state,
                    ..
                } => {
                    assert_eq!(*cal_id, cal.id);
                    let leaf = hex::decode(&cal.hash).unwrap();
                    let replayed = replay(&leaf, &anchor_btc_agg_state.ops);
                    // replaying the segment yields the root in the btc-a block
                    assert_eq!(hex::encode(replayed), btc_a.data_val);
                }
                other => panic!("unexpected message {:?}", other),
            }
        }

        // exactly one tx request carrying the same root
        let d = bus.get(QUEUE_OUT_BTCTX).await.unwrap().expect("btctx request");
        let req: BtcTxRequest = serde_json::from_slice(&d.payload).unwrap();
        bus.ack(&d).await.unwrap();
        assert_eq!(req.anchor_btc_agg_root, btc_a.data_val);
        assert!(bus.get(QUEUE_OUT_BTCTX).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn btctx_segment_replays_to_txid() {
        let (_dir, bus, anchor) = engine().await;
        let root = "ab".repeat(32);
        let body = format!("0100{}feed", root);
        let txid = hex::encode(sha256d_bytes(&hex::decode(&body).unwrap()));

        bus.publish("fake-inbound", b"x".to_vec()).await.unwrap();
        let delivery = bus.get("fake-inbound").await.unwrap().unwrap();
        anchor
            .handle_btctx(txid.clone(), body, root.clone(), delivery)
            .await;

        let state = drain_state(&bus).await;
        assert_eq!(state.len(), 1);
        match &state[0] {
            StateMessage::BtcTx { btctx_id, btctx_state } => {
                assert_eq!(btctx_id, &txid);
                let replayed = replay(&hex::decode(&root).unwrap(), &btctx_state.ops);
                assert_eq!(hex::encode(replayed), txid);
            }
            other => panic!("unexpected message {:?}", other),
        }

        let d = bus.get(QUEUE_OUT_BTCMON).await.unwrap().expect("monitor request");
        let req: BtcMonRequest = serde_json::from_slice(&d.payload).unwrap();
        bus.ack(&d).await.unwrap();
        assert_eq!(req.tx_id, txid);
    }

    #[tokio::test]
    async fn confirm_appends_btc_c_and_publishes_head_state() {
        let (_dir, bus, anchor) = engine().await;
        append_cal(&anchor, &"11".repeat(32)).await;
        anchor.anchor_once().await.unwrap().unwrap();
        drain_state(&bus).await;
        while let Some(d) = bus.get(QUEUE_OUT_BTCTX).await.unwrap() {
            bus.ack(&d).await.unwrap();
        }

        bus.publish("fake-inbound", b"x".to_vec()).await.unwrap();
        let delivery = bus.get("fake-inbound").await.unwrap().unwrap();
        anchor.enqueue_monitor(
            "ff".repeat(32),
            512_000,
            "cc".repeat(32),
            vec![ProofOp::Right("dd".repeat(32)), ProofOp::Hash(HashOp::Sha256x2)],
            delivery,
        );

        let confirmed = anchor.confirm_once().await.unwrap();
        assert_eq!(confirmed, 1);

        let tip = anchor.appender.store().tip().unwrap().unwrap();
        let btc_c = anchor.appender.store().by_id(tip.0).unwrap().unwrap();
        assert_eq!(btc_c.block_type, BlockType::BtcC);
        assert_eq!(btc_c.data_id, "512000");
        assert_eq!(btc_c.data_val, "cc".repeat(32));

        let state = drain_state(&bus).await;
        assert_eq!(state.len(), 1);
        match &state[0] {
            StateMessage::BtcHead {
                btchead_height,
                btchead_state,
                ..
            } => {
                assert_eq!(*btchead_height, 512_000);
                let anchor_spec = btchead_state.anchor.as_ref().unwrap();
                assert_eq!(anchor_spec.uris, vec![format!("/calendar/{}/data", btc_c.id)]);
            }
            other => panic!("unexpected message {:?}", other),
        }
    }

    #[tokio::test]
    async fn non_leader_does_not_confirm() {
        let (_dir, bus, anchor) = engine().await;
        bus.publish("fake-inbound", b"x".to_vec()).await.unwrap();
        let delivery = bus.get("fake-inbound").await.unwrap().unwrap();
        anchor.enqueue_monitor("ff".repeat(32), 1, "cc".repeat(32), vec![], delivery);

        anchor.leader.revoke(ROLE_CALENDAR);
        assert_eq!(anchor.confirm_once().await.unwrap(), 0);
        assert_eq!(anchor.monitor_buf.lock().len(), 1);
    }
}
