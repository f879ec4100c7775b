//! Integration tests for the calendar pipeline:
//! genesis -> calendar tick -> anchor -> tx segment -> confirmation.
//! Run with: cargo test -p dtsn-calendar --test calendar_pipeline

use std::sync::Arc;

use tempfile::tempdir;
use uuid::Uuid;

use dtsn_calendar::{
    ensure_genesis, verify_signature_field, AnchorEngine, Block, BlockAppender, BlockStore,
    BlockType, CalendarWriter, Signer, ZERO_HASH,
};
use dtsn_common::bus::{MemoryBus, MessageBus, QUEUE_IN_CAL, QUEUE_OUT_BTCTX, QUEUE_OUT_STATE};
use dtsn_common::leader::{LeaderState, ROLE_CALENDAR};
use dtsn_common::lock::LockService;
use dtsn_common::merkle::replay;
use dtsn_common::messages::{BtcTxRequest, StateMessage};

struct Rig {
    _dir: tempfile::TempDir,
    store: Arc<BlockStore>,
    signer_pubkey: [u8; 32],
    bus: Arc<MemoryBus>,
    writer: CalendarWriter,
    anchor: AnchorEngine,
}

async fn rig() -> Rig {
    let dir = tempdir().unwrap();
    let store = Arc::new(BlockStore::open(dir.path()).unwrap());
    let signer = Arc::new(Signer::from_secret_bytes(&[42u8; 32]).unwrap());
    let signer_pubkey = signer.public_key_bytes();
    let appender = BlockAppender::new(Arc::clone(&store), signer, "stack-a".into());
    let locks = LockService::new();
    let leader = Arc::new(LeaderState::holding(&[ROLE_CALENDAR]));
    let bus = Arc::new(MemoryBus::with_prefetch(64));

    ensure_genesis(&appender, &locks).await.unwrap();

    let writer = CalendarWriter::new(
        appender.clone(),
        bus.clone(),
        locks.clone(),
        Arc::clone(&leader),
        10,
    );
    let anchor = AnchorEngine::new(appender, bus.clone(), locks, leader);

    Rig {
        _dir: dir,
        store,
        signer_pubkey,
        bus,
        writer,
        anchor,
    }
}

async fn submit_root(rig: &Rig, agg_root: &str) -> Uuid {
    let agg_id = Uuid::new_v4();
    let msg = serde_json::json!({
        "type": "aggregator",
        "agg_id": agg_id,
        "agg_root": agg_root,
    });
    rig.bus
        .publish(QUEUE_IN_CAL, serde_json::to_vec(&msg).unwrap())
        .await
        .unwrap();
    let delivery = rig.bus.get(QUEUE_IN_CAL).await.unwrap().unwrap();
    rig.writer
        .enqueue_root(agg_id, agg_root.to_string(), delivery)
        .await;
    agg_id
}

async fn drain_state(rig: &Rig) -> Vec<StateMessage> {
    let mut out = Vec::new();
    while let Some(d) = rig.bus.get(QUEUE_OUT_STATE).await.unwrap() {
        out.push(serde_json::from_slice(&d.payload).unwrap());
        rig.bus.ack(&d).await.unwrap();
    }
    out
}

fn all_blocks(store: &BlockStore) -> Vec<Block> {
    let tip = store.tip().unwrap().unwrap().0;
    store.scan(0, tip, None).unwrap()
}

#[tokio::test]
async fn genesis_shape_and_idempotence() {
    let rig = rig().await;
    let gen = rig.store.by_id(0).unwrap().expect("genesis");
    assert_eq!(gen.block_type, BlockType::Gen);
    assert_eq!(gen.data_id, "0");
    assert_eq!(gen.data_val, ZERO_HASH);
    assert_eq!(gen.prev_hash, ZERO_HASH);
    assert_eq!(rig.store.tip().unwrap().unwrap().0, 0);
}

#[tokio::test]
async fn single_tick_calendar_proofs_reproduce_block_hash() {
    let rig = rig().await;
    let r1 = format!("{}01", "aa".repeat(31));
    let r2 = format!("{}02", "aa".repeat(31));
    let id1 = submit_root(&rig, &r1).await;
    let id2 = submit_root(&rig, &r2).await;

    let block = rig.writer.tick().await.unwrap().expect("cal block");
    assert_eq!(block.id, 1);

    let state = drain_state(&rig).await;
    assert_eq!(state.len(), 2);
    // published in the same order as the tree leaves
    for (msg, (agg_id, agg_root)) in state.iter().zip([(id1, &r1), (id2, &r2)]) {
        match msg {
            StateMessage::Cal {
                agg_id: msg_agg_id,
                cal_id,
                cal_state,
            } => {
                assert_eq!(*msg_agg_id, agg_id);
                assert_eq!(*cal_id, 1);
                let replayed = replay(&hex::decode(agg_root).unwrap(), &cal_state.ops);
                assert_eq!(hex::encode(replayed), block.hash);
            }
            other => panic!("unexpected state message {:?}", other),
        }
    }
}

#[tokio::test]
async fn empty_tick_produces_no_block_and_no_traffic() {
    let rig = rig().await;
    assert!(rig.writer.tick().await.unwrap().is_none());
    assert_eq!(rig.store.tip().unwrap().unwrap().0, 0);
    assert_eq!(rig.bus.depth(QUEUE_OUT_STATE).await, 0);
}

#[tokio::test]
async fn full_anchor_cycle() {
    let rig = rig().await;

    // N calendar blocks since genesis
    for i in 0..3u8 {
        let root = format!("{}0{}", "bc".repeat(31), i + 1);
        submit_root(&rig, &root).await;
        rig.writer.tick().await.unwrap().expect("cal block");
    }
    drain_state(&rig).await;

    // anchor: exactly one btc-a, N_cal segments, one btctx request
    let btc_a = rig.anchor.anchor_once().await.unwrap().expect("btc-a");
    let state = drain_state(&rig).await;
    let cal_segments: Vec<_> = state
        .iter()
        .filter(|m| matches!(m, StateMessage::AnchorBtcAgg { .. }))
        .collect();
    assert_eq!(cal_segments.len(), 3);
    for msg in cal_segments {
        if let StateMessage::AnchorBtcAgg {
            cal_id,
            anchor_btc_agg_state,
            ..
        } = msg
        {
            let cal_block = rig.store.by_id(*cal_id).unwrap().unwrap();
            let replayed = replay(&hex::decode(&cal_block.hash).unwrap(), &anchor_btc_agg_state.ops);
            assert_eq!(hex::encode(replayed), btc_a.data_val);
        }
    }

    let d = rig.bus.get(QUEUE_OUT_BTCTX).await.unwrap().expect("one btctx request");
    let req: BtcTxRequest = serde_json::from_slice(&d.payload).unwrap();
    rig.bus.ack(&d).await.unwrap();
    assert_eq!(req.anchor_btc_agg_root, btc_a.data_val);
    assert!(rig.bus.get(QUEUE_OUT_BTCTX).await.unwrap().is_none());

    // monitor reply: exactly one btc-c
    rig.bus.publish("inbound-fake", b"m".to_vec()).await.unwrap();
    let delivery = rig.bus.get("inbound-fake").await.unwrap().unwrap();
    rig.anchor
        .enqueue_monitor("fa".repeat(32), 800_000, "ce".repeat(32), vec![], delivery);
    assert_eq!(rig.anchor.confirm_once().await.unwrap(), 1);

    let tip = rig.store.tip().unwrap().unwrap().0;
    let btc_c = rig.store.by_id(tip).unwrap().unwrap();
    assert_eq!(btc_c.block_type, BlockType::BtcC);
    assert_eq!(btc_c.data_id, "800000");
}

#[tokio::test]
async fn chain_invariants_hold_across_the_whole_pipeline() {
    let rig = rig().await;
    for i in 0..2u8 {
        submit_root(&rig, &format!("{}0{}", "dd".repeat(31), i + 1)).await;
        rig.writer.tick().await.unwrap().unwrap();
    }
    rig.anchor.anchor_once().await.unwrap().unwrap();

    let blocks = all_blocks(&rig.store);
    // dense ids from zero
    for (expect_id, block) in blocks.iter().enumerate() {
        assert_eq!(block.id, expect_id as u64);
    }
    // hash chain continuity
    assert_eq!(blocks[0].prev_hash, ZERO_HASH);
    for pair in blocks.windows(2) {
        assert_eq!(pair[1].prev_hash, pair[0].hash);
    }
    // every hash reconstructs and every signature verifies
    for block in &blocks {
        assert!(block.hash_is_valid(), "block {} hash invalid", block.id);
        assert!(
            verify_signature_field(&rig.signer_pubkey, &block.hash, &block.sig).unwrap(),
            "block {} signature invalid",
            block.id
        );
    }
}
